//! Server external client-facing API module: the server facade's wire
//! surface. Accepts client connections, funnels their requests to the
//! replica core, and sends replies back.

use std::net::SocketAddr;

use crate::client::ClientId;
use crate::server::ReplicaId;
use crate::statemach::{Command, CommandResult};
use crate::utils::{safe_tcp_read, safe_tcp_write, tcp_bind_with_retry, CanopyError};

use bytes::BytesMut;

use serde::{Deserialize, Serialize};

use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// External API request ID type, assigned by clients.
pub type RequestId = u64;

/// Request received from a client.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ApiRequest {
    /// Normal state-machine command.
    Req { id: RequestId, cmd: Command },

    /// Ask for an opaque snapshot of the state machine plus the commit
    /// index it covers.
    Snapshot { id: RequestId },

    /// Ask which replica is the current master.
    GetMaster { id: RequestId },

    /// Client leave notification.
    Leave,
}

/// Reply sent back to a client.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ApiReply {
    /// Reply to a command or snapshot request. `result` is `None` when the
    /// request was not served here, in which case `redirect` names the
    /// replica believed to be the current master.
    Reply {
        id: RequestId,
        result: Option<CommandResult>,
        redirect: Option<ReplicaId>,
    },

    /// Reply to a `GetMaster` probe; `None` while not in Normal status.
    MasterInfo {
        id: RequestId,
        master: Option<ReplicaId>,
    },

    /// Reply to a leave notification.
    Leave,
}

/// The external client-facing API module.
pub(crate) struct ExternalApi {
    /// My replica ID.
    me: ReplicaId,

    /// Receiver side of the req channel.
    rx_req: mpsc::UnboundedReceiver<(ClientId, ApiRequest)>,

    /// Map from client ID -> sender side of its reply channel, shared with
    /// the client acceptor task.
    tx_replies:
        flashmap::ReadHandle<ClientId, mpsc::UnboundedSender<ApiReply>>,

    /// Join handle of the client acceptor task.
    _client_acceptor_handle: JoinHandle<()>,
}

// ExternalApi public API implementation
impl ExternalApi {
    /// Creates a new external API module, binds the API listener, and spawns
    /// the client acceptor task.
    pub(crate) async fn new_and_setup(
        me: ReplicaId,
        api_addr: SocketAddr,
    ) -> Result<Self, CanopyError> {
        let (tx_req, rx_req) = mpsc::unbounded_channel();

        let (tx_replies_write, tx_replies_read) =
            flashmap::new::<ClientId, mpsc::UnboundedSender<ApiReply>>();

        let client_listener = tcp_bind_with_retry(api_addr, 10).await?;
        let mut acceptor = ClientAcceptorTask::new(
            me,
            client_listener,
            tx_req,
            tx_replies_write,
        );
        let client_acceptor_handle =
            tokio::spawn(async move { acceptor.run().await });

        Ok(ExternalApi {
            me,
            rx_req,
            tx_replies: tx_replies_read,
            _client_acceptor_handle: client_acceptor_handle,
        })
    }

    /// Waits for the next client request.
    pub(crate) async fn get_req(
        &mut self,
    ) -> Result<(ClientId, ApiRequest), CanopyError> {
        match self.rx_req.recv().await {
            Some((client, req)) => Ok((client, req)),
            None => logged_err!(self.me; "req channel has been closed"),
        }
    }

    /// Sends a reply back to a client by sending to its reply channel.
    /// Silently drops the reply if the client has disconnected.
    pub(crate) fn send_reply(
        &mut self,
        reply: ApiReply,
        client: ClientId,
    ) -> Result<(), CanopyError> {
        let tx_replies_guard = self.tx_replies.guard();
        if let Some(tx_reply) = tx_replies_guard.get(&client) {
            if tx_reply.send(reply).is_err() {
                pf_debug!(self.me; "dropping reply to left client {}", client);
            }
        }
        Ok(())
    }
}

/// ExternalApi client acceptor task.
struct ClientAcceptorTask {
    me: ReplicaId,

    client_listener: TcpListener,
    tx_req: mpsc::UnboundedSender<(ClientId, ApiRequest)>,
    tx_replies:
        flashmap::WriteHandle<ClientId, mpsc::UnboundedSender<ApiReply>>,

    tx_exit: mpsc::UnboundedSender<ClientId>,
    rx_exit: mpsc::UnboundedReceiver<ClientId>,
}

impl ClientAcceptorTask {
    /// Creates the client acceptor task.
    fn new(
        me: ReplicaId,
        client_listener: TcpListener,
        tx_req: mpsc::UnboundedSender<(ClientId, ApiRequest)>,
        tx_replies: flashmap::WriteHandle<
            ClientId,
            mpsc::UnboundedSender<ApiReply>,
        >,
    ) -> Self {
        let (tx_exit, rx_exit) = mpsc::unbounded_channel();

        ClientAcceptorTask {
            me,
            client_listener,
            tx_req,
            tx_replies,
            tx_exit,
            rx_exit,
        }
    }

    /// Accepts a new client connection and spawns its servant task.
    async fn accept_new_client(
        &mut self,
        mut stream: TcpStream,
    ) -> Result<(), CanopyError> {
        let id = match stream.read_u64().await {
            Ok(id) => id,
            Err(e) => {
                return logged_err!(self.me; "error receiving client ID: {}", e);
            }
        };

        let mut tx_replies_guard = self.tx_replies.guard();
        if tx_replies_guard.contains_key(&id) {
            return logged_err!(self.me; "duplicate client ID listened: {}", id);
        }
        pf_debug!(self.me; "accepted new client {}", id);

        let (tx_reply, rx_reply) = mpsc::unbounded_channel();
        tx_replies_guard.insert(id, tx_reply);
        tx_replies_guard.publish();

        let mut servant = ClientServantTask::new(
            self.me,
            id,
            stream,
            self.tx_req.clone(),
            rx_reply,
            self.tx_exit.clone(),
        );
        tokio::spawn(async move { servant.run().await });

        Ok(())
    }

    /// Removes the entry of a left client.
    fn remove_left_client(&mut self, id: ClientId) {
        let mut tx_replies_guard = self.tx_replies.guard();
        if tx_replies_guard.contains_key(&id) {
            tx_replies_guard.remove(id);
        }
        tx_replies_guard.publish();
    }

    /// Starts the client acceptor task loop.
    async fn run(&mut self) {
        pf_debug!(self.me; "client_acceptor task spawned");

        loop {
            tokio::select! {
                // new client connection accepted
                accepted = self.client_listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            if let Err(e) = self.accept_new_client(stream).await {
                                pf_error!(self.me; "error accepting new client: {}", e);
                            }
                        },
                        Err(e) => {
                            pf_warn!(self.me; "error accepting client connection: {}", e);
                            continue;
                        }
                    }
                },

                // a client servant task exits
                id = self.rx_exit.recv() => {
                    let id = id.unwrap();
                    self.remove_left_client(id);
                },
            }
        }
    }
}

/// ExternalApi per-client servant task.
struct ClientServantTask {
    me: ReplicaId,

    /// Corresponding client's ID.
    id: ClientId,

    conn_read: OwnedReadHalf,
    conn_write: OwnedWriteHalf,

    tx_req: mpsc::UnboundedSender<(ClientId, ApiRequest)>,
    rx_reply: mpsc::UnboundedReceiver<ApiReply>,

    read_buf: BytesMut,
    write_buf: BytesMut,
    write_buf_cursor: usize,
    retrying: bool,

    tx_exit: mpsc::UnboundedSender<ClientId>,
}

impl ClientServantTask {
    /// Creates a servant task for one client connection.
    fn new(
        me: ReplicaId,
        id: ClientId,
        conn: TcpStream,
        tx_req: mpsc::UnboundedSender<(ClientId, ApiRequest)>,
        rx_reply: mpsc::UnboundedReceiver<ApiReply>,
        tx_exit: mpsc::UnboundedSender<ClientId>,
    ) -> Self {
        let (conn_read, conn_write) = conn.into_split();

        ClientServantTask {
            me,
            id,
            conn_read,
            conn_write,
            tx_req,
            rx_reply,
            read_buf: BytesMut::with_capacity(8 + 1024),
            write_buf: BytesMut::with_capacity(8 + 1024),
            write_buf_cursor: 0,
            retrying: false,
            tx_exit,
        }
    }

    /// Starts the servant task loop.
    async fn run(&mut self) {
        pf_debug!(self.me; "client_servant task for {} spawned", self.id);

        loop {
            tokio::select! {
                // gets a reply to send back
                reply = self.rx_reply.recv(), if !self.retrying => {
                    match reply {
                        Some(reply) => {
                            match safe_tcp_write(
                                &mut self.write_buf,
                                &mut self.write_buf_cursor,
                                &self.conn_write,
                                Some(&reply),
                            ) {
                                Ok(true) => {},
                                Ok(false) => {
                                    self.retrying = true;
                                }
                                Err(_e) => break, // client went away
                            }
                        },
                        None => break,
                    }
                },

                // retrying last unsuccessful reply send
                _ = self.conn_write.writable(), if self.retrying => {
                    match safe_tcp_write::<ApiReply, _>(
                        &mut self.write_buf,
                        &mut self.write_buf_cursor,
                        &self.conn_write,
                        None,
                    ) {
                        Ok(true) => {
                            self.retrying = false;
                        }
                        Ok(false) => {},
                        Err(_e) => break,
                    }
                },

                // receives a client request
                req = safe_tcp_read::<ApiRequest, _>(
                    &mut self.read_buf,
                    &mut self.conn_read,
                ) => {
                    match req {
                        Ok(ApiRequest::Leave) => {
                            // reply dummy and close this servant
                            let _ = safe_tcp_write(
                                &mut self.write_buf,
                                &mut self.write_buf_cursor,
                                &self.conn_write,
                                Some(&ApiReply::Leave),
                            );
                            pf_debug!(self.me; "client {} has left", self.id);
                            break;
                        },
                        Ok(req) => {
                            if let Err(e) = self.tx_req.send((self.id, req)) {
                                pf_error!(self.me; "error sending to tx_req: {}", e);
                            }
                        },
                        Err(_e) => break, // client disconnected
                    }
                },
            }
        }

        if let Err(e) = self.tx_exit.send(self.id) {
            pf_error!(self.me; "error sending exit signal for {}: {}",
                               self.id, e);
        }
        pf_debug!(self.me; "client_servant task for {} exited", self.id);
    }
}
