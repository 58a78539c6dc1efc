//! The Canopy client library: locates the current master, submits commands
//! with a bounded timeout, and transparently follows redirects when the
//! mastership moves.

use std::net::SocketAddr;

use crate::client::apistub::{ClientApiStub, ClientRecvStub, ClientSendStub};
use crate::client::ClientId;
use crate::server::{ApiReply, ApiRequest, ReplicaId, RequestId};
use crate::statemach::{
    Command, CommandResult, DataNode, QueueMessage, ReplyValue, StatNode,
};
use crate::utils::CanopyError;

use tokio::time::{self, Duration, Instant};

/// Default per-call timeout before the client gives up on a request.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Canopy client session, connected to one server at a time (normally the
/// master).
pub struct CanopyClient {
    /// My client ID.
    id: ClientId,

    /// Addresses of all servers' client-facing APIs, indexed by replica
    /// number.
    servers: Vec<SocketAddr>,

    /// ID of the replica I believe is the current master.
    master_id: ReplicaId,

    /// ID of the replica I am currently connected to.
    conn_id: ReplicaId,

    /// Split connection stubs to the currently connected server.
    stubs: Option<(ClientSendStub, ClientRecvStub)>,

    /// Per-call timeout.
    timeout: Duration,

    /// Next request ID to assign.
    next_req_id: RequestId,
}

impl CanopyClient {
    /// Creates a new client session over the given server address list
    /// (index = replica number).
    pub fn new(servers: Vec<SocketAddr>) -> Self {
        CanopyClient {
            id: rand::random(),
            servers,
            master_id: 0,
            conn_id: 0,
            stubs: None,
            timeout: DEFAULT_TIMEOUT,
            next_req_id: 0,
        }
    }

    /// Overrides the per-call timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// The replica I currently believe is the master.
    pub fn master(&self) -> ReplicaId {
        self.master_id
    }

    /// Connects to some server, then locates and connects to the master.
    pub async fn connect(&mut self) -> Result<(), CanopyError> {
        self.connect_to_server(self.master_id).await?;
        self.connect_to_master().await
    }

    /// Connects to the specific replica with given ID and stays there.
    /// Useful for digest probes against a chosen replica; normal commands
    /// will still follow redirects away from it.
    pub async fn connect_to(
        &mut self,
        id: ReplicaId,
    ) -> Result<(), CanopyError> {
        self.connect_to_server(id).await
    }

    /// Connects to the server with given replica number.
    async fn connect_to_server(
        &mut self,
        id: ReplicaId,
    ) -> Result<(), CanopyError> {
        let addr = *self
            .servers
            .get(id as usize)
            .ok_or_else(|| CanopyError(format!("invalid replica ID {}", id)))?;
        let api_stub = ClientApiStub::new(self.id);
        self.stubs = Some(api_stub.connect(addr).await?);
        self.conn_id = id;
        Ok(())
    }

    /// Probes servers for the current master and connects to it. Tries
    /// every server once, starting from the currently connected one. Each
    /// probe is individually bounded so an unresponsive server (e.g., one
    /// whose process hung) does not stall the whole scan.
    pub async fn connect_to_master(&mut self) -> Result<(), CanopyError> {
        let population = self.servers.len() as u8;
        let probe_timeout = self.timeout / 2;
        for shift in 0..population {
            let id = (self.conn_id + shift) % population;
            if self.stubs.is_none() || id != self.conn_id {
                if self.connect_to_server(id).await.is_err() {
                    continue; // server down, try the next one
                }
            }

            let probe = time::timeout(
                probe_timeout,
                self.call_once(ApiRequest::GetMaster { id: 0 }),
            );
            match probe.await {
                Ok(Ok(ApiReply::MasterInfo {
                    master: Some(master),
                    ..
                })) => {
                    pf_debug!(self.id; "master is {}", master);
                    self.master_id = master;
                    if self.conn_id != master {
                        self.connect_to_server(master).await?;
                    }
                    return Ok(());
                }
                Ok(Ok(_)) => continue, // replica not in Normal status
                Ok(Err(_)) => {
                    self.stubs = None; // connection is broken
                    continue;
                }
                Err(_elapsed) => {
                    self.stubs = None; // server unresponsive
                    continue;
                }
            }
        }
        Err(CanopyError::msg("no master found"))
    }

    /// Performs one raw request/reply exchange on the current connection.
    async fn call_once(
        &mut self,
        req: ApiRequest,
    ) -> Result<ApiReply, CanopyError> {
        let (send_stub, recv_stub) = self
            .stubs
            .as_mut()
            .ok_or_else(|| CanopyError::msg("not connected"))?;
        while !send_stub.send_req(Some(&req))? {}
        recv_stub.recv_reply().await
    }

    /// Submits a command, retrying against a possibly new master until the
    /// per-call timeout elapses.
    pub async fn submit(
        &mut self,
        cmd: Command,
    ) -> Result<CommandResult, CanopyError> {
        let req_id = self.next_req_id;
        self.next_req_id += 1;
        self.attempt_until_deadline(ApiRequest::Req { id: req_id, cmd }, req_id)
            .await
    }

    /// Asks the master for an opaque snapshot of the state machine plus the
    /// commit index it covers.
    pub async fn snapshot(&mut self) -> Result<(Vec<u8>, u64), CanopyError> {
        let req_id = self.next_req_id;
        self.next_req_id += 1;
        let result = self
            .attempt_until_deadline(ApiRequest::Snapshot { id: req_id }, req_id)
            .await?;
        match result.value {
            ReplyValue::Snapshot { data, index } => Ok((data, index)),
            value => Err(CanopyError(format!(
                "unexpected reply value {:?}",
                value
            ))),
        }
    }

    /// Drives one request to completion within the timeout, reconnecting
    /// and re-probing the master as needed.
    async fn attempt_until_deadline(
        &mut self,
        req: ApiRequest,
        req_id: RequestId,
    ) -> Result<CommandResult, CanopyError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let attempt =
                time::timeout_at(deadline, self.attempt_once(&req, req_id));
            let outcome = match attempt.await {
                Err(_elapsed) => return Err(CanopyError::msg("timed out")),
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    pf_debug!(self.id; "attempt failed ({}), re-probing master", e);
                    self.stubs = None;
                    CallOutcome::Flux
                }
            };

            match outcome {
                CallOutcome::Done(result) => {
                    if result.error.is_empty() {
                        return Ok(result);
                    }
                    // user-visible application error
                    return Err(CanopyError(result.error));
                }
                CallOutcome::Redirect(master) => {
                    pf_debug!(self.id; "redirected to replica {}", master);
                    self.master_id = master;
                    if time::timeout_at(
                        deadline,
                        self.connect_to_server(master),
                    )
                    .await
                    .is_err()
                    {
                        return Err(CanopyError::msg("timed out"));
                    }
                }
                CallOutcome::Flux => {
                    // replication group in flux; wait a beat and re-probe
                    let reprobe = async {
                        time::sleep(Duration::from_millis(50)).await;
                        self.connect_to_master().await
                    };
                    if time::timeout_at(deadline, reprobe).await.is_err() {
                        return Err(CanopyError::msg("timed out"));
                    }
                }
            }
        }
    }

    /// Performs one exchange on the current connection without moving it.
    async fn attempt_once(
        &mut self,
        req: &ApiRequest,
        req_id: RequestId,
    ) -> Result<CallOutcome, CanopyError> {
        if self.stubs.is_none() {
            self.connect_to_master().await?;
        }

        let (send_stub, recv_stub) = self.stubs.as_mut().unwrap();
        while !send_stub.send_req(Some(req))? {}

        loop {
            match recv_stub.recv_reply().await? {
                ApiReply::Reply {
                    id,
                    result,
                    redirect,
                } if id == req_id => {
                    if let Some(master) = redirect {
                        return Ok(CallOutcome::Redirect(master));
                    }
                    return Ok(match result {
                        Some(result)
                            if result.error == "master failover"
                                || result.error == "lease lapsed" =>
                        {
                            CallOutcome::Flux
                        }
                        Some(result) => CallOutcome::Done(result),
                        None => CallOutcome::Flux,
                    });
                }
                // stale reply to an earlier timed-out request
                _ => continue,
            }
        }
    }
}

/// What became of one request/reply attempt.
enum CallOutcome {
    /// Served; carries the command result (possibly an application error).
    Done(CommandResult),

    /// Not served here; the named replica is believed to be the master.
    Redirect(ReplicaId),

    /// Not served; the group is changing masters or the connection broke.
    Flux,
}

// CanopyClient typed command helpers
impl CanopyClient {
    /// Unwraps a successful result into its node payload.
    fn expect_node(result: CommandResult) -> Result<DataNode, CanopyError> {
        match result.value {
            ReplyValue::Node(node) => Ok(node),
            value => {
                Err(CanopyError(format!("unexpected reply value {:?}", value)))
            }
        }
    }

    /// Creates a new node at path holding the given value.
    pub async fn create(
        &mut self,
        path: &str,
        value: &str,
    ) -> Result<DataNode, CanopyError> {
        let result = self
            .submit(Command::Create {
                path: path.into(),
                value: value.into(),
            })
            .await?;
        Self::expect_node(result)
    }

    /// Overwrites the value of the node at path.
    pub async fn set_data(
        &mut self,
        path: &str,
        value: &str,
    ) -> Result<DataNode, CanopyError> {
        let result = self
            .submit(Command::Set {
                path: path.into(),
                value: value.into(),
            })
            .await?;
        Self::expect_node(result)
    }

    /// Reads the node at path.
    pub async fn get_data(
        &mut self,
        path: &str,
    ) -> Result<DataNode, CanopyError> {
        let result =
            self.submit(Command::Get { path: path.into() }).await?;
        Self::expect_node(result)
    }

    /// Deletes the node at path (and its subtree).
    pub async fn delete(&mut self, path: &str) -> Result<(), CanopyError> {
        self.submit(Command::Delete { path: path.into() }).await?;
        Ok(())
    }

    /// Lists the child names of the node at path.
    pub async fn children(
        &mut self,
        path: &str,
    ) -> Result<Vec<String>, CanopyError> {
        let result = self
            .submit(Command::Children { path: path.into() })
            .await?;
        match result.value {
            ReplyValue::Children(children) => Ok(children),
            value => {
                Err(CanopyError(format!("unexpected reply value {:?}", value)))
            }
        }
    }

    /// Reads the stats of the node at path.
    pub async fn stats(&mut self, path: &str) -> Result<StatNode, CanopyError> {
        let result =
            self.submit(Command::Stat { path: path.into() }).await?;
        match result.value {
            ReplyValue::Stat(stats) => Ok(stats),
            value => {
                Err(CanopyError(format!("unexpected reply value {:?}", value)))
            }
        }
    }

    /// Digest of the whole tree on the connected replica.
    pub async fn tree_digest(&mut self) -> Result<String, CanopyError> {
        let result = self.submit(Command::TreeDigest).await?;
        match result.value {
            ReplyValue::Digest(digest) => Ok(digest),
            value => {
                Err(CanopyError(format!("unexpected reply value {:?}", value)))
            }
        }
    }

    /// Pushes a message onto the work queue.
    pub async fn push(&mut self, value: &str) -> Result<(), CanopyError> {
        self.submit(Command::Push {
            value: value.into(),
        })
        .await?;
        Ok(())
    }

    /// Pops the front message, moving it into the in-progress set.
    pub async fn pop(&mut self) -> Result<QueueMessage, CanopyError> {
        let result = self.submit(Command::Pop).await?;
        match result.value {
            ReplyValue::Message(msg) => Ok(msg),
            value => {
                Err(CanopyError(format!("unexpected reply value {:?}", value)))
            }
        }
    }

    /// Acknowledges completion of an in-progress message.
    pub async fn done(&mut self, id: u64) -> Result<(), CanopyError> {
        self.submit(Command::Done { id }).await?;
        Ok(())
    }

    /// Unwraps a successful result into its length payload.
    fn expect_len(result: CommandResult) -> Result<u64, CanopyError> {
        match result.value {
            ReplyValue::Len(len) => Ok(len),
            value => {
                Err(CanopyError(format!("unexpected reply value {:?}", value)))
            }
        }
    }

    /// Number of queued (not yet popped) messages.
    pub async fn queue_len(&mut self) -> Result<u64, CanopyError> {
        let result = self.submit(Command::QueueLen).await?;
        Self::expect_len(result)
    }

    /// Number of popped but unacknowledged messages.
    pub async fn in_progress_len(&mut self) -> Result<u64, CanopyError> {
        let result = self.submit(Command::InProgressLen).await?;
        Self::expect_len(result)
    }

    /// Digest of the whole queue on the connected replica.
    pub async fn queue_digest(&mut self) -> Result<String, CanopyError> {
        let result = self.submit(Command::QueueDigest).await?;
        match result.value {
            ReplyValue::Digest(digest) => Ok(digest),
            value => {
                Err(CanopyError(format!("unexpected reply value {:?}", value)))
            }
        }
    }

    /// Fetches the state digest of one specific replica, without following
    /// redirects. Errors if that replica cannot answer right now (down, or
    /// not in Normal status). Useful for convergence checks.
    pub async fn digest_of(
        &mut self,
        id: ReplicaId,
        cmd: Command,
    ) -> Result<String, CanopyError> {
        self.connect_to_server(id).await?;
        let req_id = self.next_req_id;
        self.next_req_id += 1;

        let call = time::timeout(
            self.timeout,
            self.call_once(ApiRequest::Req { id: req_id, cmd }),
        );
        match call.await.map_err(CanopyError::msg)?? {
            ApiReply::Reply {
                id,
                result: Some(result),
                ..
            } if id == req_id => {
                if !result.error.is_empty() {
                    return Err(CanopyError(result.error));
                }
                match result.value {
                    ReplyValue::Digest(digest) => Ok(digest),
                    value => Err(CanopyError(format!(
                        "unexpected reply value {:?}",
                        value
                    ))),
                }
            }
            reply => {
                Err(CanopyError(format!("unexpected reply {:?}", reply)))
            }
        }
    }
}
