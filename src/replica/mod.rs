//! The Viewstamped Replication replica core with master leases.
//!
//! Replicas agree on a sequence of client commands: the master of the
//! current view orders each command, replicates it to backups with
//! `Prepare`, commits upon a quorum of `PrepareOk`s, and hands it to the
//! applier. Failed masters are replaced through the view-change protocol;
//! lagging or restarted replicas catch up through the recovery protocol.
//! Follower-granted leases let the master serve reads locally without
//! violating linearizability. References:
//!   - <https://pmg.csail.mit.edu/papers/vr-revisited.pdf>
//!   - <https://pmg.csail.mit.edu/papers/vr.pdf>

mod execution;
mod leadership;
mod leasing;
mod messages;
mod recovery;
mod request;

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::SystemTime;

use crate::client::ClientId;
use crate::server::{
    ApplierHub, CommandId, ExternalApi, OpLog, ReplicaId, RequestId,
    TransportEvent, TransportHub,
};
use crate::statemach::{Command, TreeDb, WorkQueue};
use crate::utils::{Bitmap, CanopyError, Timer};

use serde::{Deserialize, Serialize};

use tokio::time::Duration;

/// View number type; the master of view `v` is replica `v % population`.
pub type View = u64;

/// Log index type assigned by the master to each client command.
pub type OpNumber = u64;

/// Recovery nonce type.
pub type Nonce = u64;

/// Replica protocol mode.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub(crate) enum Status {
    Normal,
    ViewChange,
    Recovering,
}

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicaConfig {
    /// Which state machine to drive: "tree" or "queue".
    pub applier: String,

    /// Lease duration in millisecs, granted by followers to the master and
    /// doubling as the follower inactivity timeout.
    pub lease_ms: u64,

    /// How soon the master renews before its lease would expire: it renews
    /// once `remaining / renew_factor` is left.
    pub renew_factor: u32,

    /// Margin allowed between different replicas' clocks in millisecs,
    /// subtracted from quorum-granted lease deadlines.
    pub max_clock_drift_ms: u64,

    /// Base delay of per-attempt exponential backoff in millisecs.
    pub backoff_base_ms: u64,

    /// Maximum number of send attempts per peer request; keeps broadcasts
    /// from flooding crashed nodes when they come back online.
    pub max_tries: u8,

    /// Timeout of a single peer request/reply exchange in millisecs.
    pub call_timeout_ms: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for ReplicaConfig {
    fn default() -> Self {
        ReplicaConfig {
            applier: "tree".into(),
            lease_ms: 2000,
            renew_factor: 2,
            max_clock_drift_ms: 200, // lease_ms / 10
            backoff_base_ms: 10,
            max_tries: 2,
            call_timeout_ms: 1000,
        }
    }
}

/// Peer-to-peer request type. Together with `PeerReply`, these shapes form
/// the wire contract between replicas; they are exported so that wire-level
/// conformance tests and tooling can pose as a replica.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum PeerRequest {
    /// Master -> backups: replicate the command at `op_number`.
    Prepare {
        view: View,
        op_number: OpNumber,
        command: Command,
        commit_number: OpNumber,
    },

    /// Master -> backups: commit notification, doubling as the lease
    /// renewal heartbeat carrier.
    Commit { view: View, commit_number: OpNumber },

    /// Any replica -> all: a view change has been proposed.
    StartViewChange { view: View, replica_number: ReplicaId },

    /// Backup -> presumed new master: my log and progress for the new view.
    DoViewChange {
        view: View,
        replica_number: ReplicaId,
        log: OpLog,
        normal_view: View,
        op_number: OpNumber,
        commit_number: OpNumber,
    },

    /// New master -> backups: the authoritative post-view-change state.
    StartView {
        view: View,
        log: OpLog,
        op_number: OpNumber,
        commit_number: OpNumber,
    },

    /// Recovering replica -> all: please send me your state.
    Recovery { replica_number: ReplicaId, nonce: Nonce },

    /// Normal replica -> recovering replica: my state, echoing the nonce.
    RecoveryResponse {
        view: View,
        nonce: Nonce,
        log: OpLog,
        op_number: OpNumber,
        commit_number: OpNumber,
        replica_number: ReplicaId,
    },
}

/// Peer-to-peer reply type. Protocol refusals are carried as `Err(String)`
/// at the transport layer instead.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum PeerReply {
    /// Backup's acknowledgement of a `Prepare`, granting a lease until
    /// `lease_deadline`.
    PrepareOk {
        view: View,
        op_number: OpNumber,
        replica_number: ReplicaId,
        lease_deadline: SystemTime,
    },

    /// Backup's acknowledgement of a `Commit` heartbeat, granting a lease
    /// until `lease_deadline`.
    Heartbeat {
        replica_number: ReplicaId,
        lease_deadline: SystemTime,
    },

    /// Contentless acknowledgement of the one-way protocol messages.
    Ack,
}

/// A `DoViewChange` message body retained in view-change scratch state.
#[derive(Debug, Clone)]
pub(crate) struct DoViewChangeMsg {
    pub(crate) view: View,
    pub(crate) log: OpLog,
    pub(crate) normal_view: View,
    pub(crate) op_number: OpNumber,
    pub(crate) commit_number: OpNumber,
}

/// A `RecoveryResponse` message body retained in recovery scratch state.
#[derive(Debug, Clone)]
pub(crate) struct RecoveryResponseMsg {
    pub(crate) view: View,
    pub(crate) log: OpLog,
    pub(crate) op_number: OpNumber,
    pub(crate) commit_number: OpNumber,
}

/// The VR replica module: owns all mutable per-replica state, which is
/// mutated only from the single `run()` event loop.
pub struct VrReplica {
    /// My replica ID in the group.
    id: ReplicaId,

    /// Total number of replicas (2f + 1).
    population: u8,

    /// Number of tolerated failures f; a quorum is f + 1 incl. myself.
    f: u8,

    /// Configuration parameters struct.
    config: ReplicaConfig,

    /// ExternalApi module.
    external_api: ExternalApi,

    /// ApplierHub module.
    applier: ApplierHub,

    /// TransportHub module.
    transport: TransportHub<PeerRequest, PeerReply>,

    /// Current view number; never decreases.
    view: View,

    /// Protocol mode.
    status: Status,

    /// Highest log index appended.
    op_number: OpNumber,

    /// Highest log index handed to the applier.
    commit_number: OpNumber,

    /// Last view in which my status was Normal.
    normal_view: View,

    /// The replicated command log.
    log: OpLog,

    /// Follower lease timer; fires when the master has been silent for a
    /// lease, triggering a view change.
    lease_timer: Timer,

    /// Master renewal timer; fires when it is time to refresh follower
    /// grants with a `Commit` heartbeat.
    renew_timer: Timer,

    /// Until when I believe the current master is authoritative. On the
    /// master this is the quorum-granted serve-locally deadline.
    lease_deadline: SystemTime,

    /// Master-only: the latest lease grant received from each follower.
    heartbeats: HashMap<ReplicaId, SystemTime>,

    /// Master-only: which peers acked the current in-flight op.
    prepare_acks: Bitmap,

    /// Master-only: number of acks on the current in-flight op.
    acks_count: u8,

    /// Client write commands admitted but not yet started (one op is in
    /// flight at a time).
    pending_writes: VecDeque<(ClientId, RequestId, Command)>,

    /// Map from op number -> client to answer once that op executes; only
    /// ops this replica accepted from a client directly are present.
    client_of_op: HashMap<OpNumber, (ClientId, RequestId)>,

    /// Next local read sequence number.
    read_seq: u64,

    /// Map from read sequence number -> client to answer.
    client_of_read: HashMap<u64, (ClientId, RequestId)>,

    /// Published copy of `commit_number` read by snapshot `index_fn`s.
    commit_watch: Arc<AtomicU64>,

    /// View-change scratch: peers whose `StartViewChange` I have seen.
    svc_replies: Bitmap,

    /// View-change scratch: count of `StartViewChange` messages seen.
    svc_count: u8,

    /// View-change scratch: peers whose `DoViewChange` I have seen.
    dvc_replies: Bitmap,

    /// View-change scratch: retained `DoViewChange` message bodies.
    dvc_msgs: HashMap<ReplicaId, DoViewChangeMsg>,

    /// Recovery scratch: my current recovery nonce.
    nonce: Nonce,

    /// Recovery scratch: peers whose `RecoveryResponse` I have seen.
    rec_replies: Bitmap,

    /// Recovery scratch: retained `RecoveryResponse` message bodies.
    rec_msgs: HashMap<ReplicaId, RecoveryResponseMsg>,
}

// VrReplica common helpers
impl VrReplica {
    /// The master of the current view.
    #[inline]
    pub(crate) fn master_id(&self) -> ReplicaId {
        (self.view % self.population as u64) as ReplicaId
    }

    /// Do I think I am the current master?
    #[inline]
    pub(crate) fn is_master(&self) -> bool {
        self.master_id() == self.id
    }

    /// Lease duration from config.
    #[inline]
    pub(crate) fn lease(&self) -> Duration {
        Duration::from_millis(self.config.lease_ms)
    }

    /// Clock drift margin from config.
    #[inline]
    pub(crate) fn max_clock_drift(&self) -> Duration {
        Duration::from_millis(self.config.max_clock_drift_ms)
    }

    /// Compose CommandId for the applier from a committed op number.
    #[inline]
    fn make_apply_id(op_number: OpNumber) -> CommandId {
        op_number << 1
    }

    /// Compose CommandId for the applier from a local read sequence number.
    #[inline]
    fn make_read_id(read_seq: u64) -> CommandId {
        (read_seq << 1) | 1
    }

    /// Decompose CommandId into its sequence number and whether it denotes
    /// a local read.
    #[inline]
    fn split_command_id(command_id: CommandId) -> (u64, bool) {
        (command_id >> 1, (command_id & 1) == 1)
    }
}

impl VrReplica {
    /// Creates a new replica module and sets up the functionality modules:
    /// wires the replica number, the peer address list (index = replica
    /// number), the client API address, and the configured applier.
    pub async fn new_and_setup(
        id: ReplicaId,
        api_addr: SocketAddr,
        p2p_addrs: Vec<SocketAddr>,
        config_str: Option<&str>,
    ) -> Result<Self, CanopyError> {
        let population = p2p_addrs.len() as u8;
        if population < 3 || population % 2 == 0 {
            return logged_err!(id; "invalid population {}", population);
        }
        if id >= population {
            return logged_err!(id; "invalid replica ID {} / {}", id, population);
        }

        // parse config
        let config = parsed_config!(config_str => ReplicaConfig;
                                    applier, lease_ms, renew_factor,
                                    max_clock_drift_ms, backoff_base_ms,
                                    max_tries, call_timeout_ms)?;
        if config.lease_ms == 0 {
            return logged_err!(id; "invalid config.lease_ms '{}'", config.lease_ms);
        }
        if config.renew_factor == 0 {
            return logged_err!(id; "invalid config.renew_factor '{}'",
                                   config.renew_factor);
        }
        if config.max_clock_drift_ms >= config.lease_ms {
            return logged_err!(id; "invalid config.max_clock_drift_ms '{}'",
                                   config.max_clock_drift_ms);
        }
        if config.max_tries == 0 {
            return logged_err!(id; "invalid config.max_tries '{}'", config.max_tries);
        }

        // setup applier module with the configured state machine
        let applier = match config.applier.as_str() {
            "tree" => ApplierHub::new_and_setup(id, TreeDb::new())?,
            "queue" => ApplierHub::new_and_setup(id, WorkQueue::new())?,
            _ => {
                return logged_err!(id; "applier kind '{}' unrecognized",
                                       config.applier);
            }
        };

        // setup transport hub module
        let peer_addrs: HashMap<ReplicaId, SocketAddr> = p2p_addrs
            .iter()
            .enumerate()
            .map(|(peer, &addr)| (peer as ReplicaId, addr))
            .collect();
        let transport = TransportHub::new_and_setup(
            id,
            population,
            p2p_addrs[id as usize],
            peer_addrs,
            Duration::from_millis(config.backoff_base_ms),
            config.max_tries,
            Duration::from_millis(config.call_timeout_ms),
        )
        .await?;

        // setup external API module, ready to take in client requests
        let external_api = ExternalApi::new_and_setup(id, api_addr).await?;

        let f = population / 2;
        Ok(VrReplica {
            id,
            population,
            f,
            config,
            external_api,
            applier,
            transport,
            view: 0,
            status: Status::Normal,
            op_number: 0,
            commit_number: 0,
            normal_view: 0,
            log: OpLog::new(),
            lease_timer: Timer::new(),
            renew_timer: Timer::new(),
            lease_deadline: SystemTime::UNIX_EPOCH,
            heartbeats: HashMap::new(),
            prepare_acks: Bitmap::new(population, false),
            acks_count: 0,
            pending_writes: VecDeque::new(),
            client_of_op: HashMap::new(),
            read_seq: 0,
            client_of_read: HashMap::new(),
            commit_watch: Arc::new(AtomicU64::new(0)),
            svc_replies: Bitmap::new(population, false),
            svc_count: 0,
            dvc_replies: Bitmap::new(population, false),
            dvc_msgs: HashMap::new(),
            nonce: 0,
            rec_replies: Bitmap::new(population, false),
            rec_msgs: HashMap::new(),
        })
    }

    /// Main event loop logic of running this replica.
    pub async fn run(&mut self) {
        // arm startup timers: replica 0 starts as master of view 0, everyone
        // else expects to hear from it within a lease
        if self.is_master() {
            if let Err(e) = self.become_master() {
                pf_error!(self.id; "error becoming master at startup: {}", e);
            }
        } else if let Err(e) = self.lease_timer.kickoff(self.lease()) {
            pf_error!(self.id; "error arming lease timer: {}", e);
        }

        loop {
            tokio::select! {
                // client request
                req = self.external_api.get_req() => {
                    match req {
                        Ok((client, req)) => {
                            if let Err(e) = self.handle_api_request(client, req) {
                                pf_error!(self.id; "error handling client request: {}", e);
                            }
                        },
                        Err(e) => {
                            pf_error!(self.id; "error getting client request: {}", e);
                            continue;
                        }
                    }
                },

                // transport event: inbound peer request or gathered reply
                event = self.transport.recv_event() => {
                    match event {
                        Ok(TransportEvent::Request { peer, req_id, req }) => {
                            if let Err(e) = self.handle_peer_request(peer, req_id, req) {
                                pf_error!(self.id; "error handling peer request <- {}: {}",
                                                   peer, e);
                            }
                        },
                        Ok(TransportEvent::Reply { peer, reply }) => {
                            if let Err(e) = self.handle_peer_reply(peer, reply) {
                                pf_error!(self.id; "error handling peer reply <- {}: {}",
                                                   peer, e);
                            }
                        },
                        Err(e) => {
                            pf_error!(self.id; "error receiving transport event: {}", e);
                            continue;
                        }
                    }
                },

                // applier execution result
                result = self.applier.get_result() => {
                    match result {
                        Ok((cmd_id, result)) => {
                            if let Err(e) = self.handle_cmd_result(cmd_id, result) {
                                pf_error!(self.id; "error handling cmd result {}: {}",
                                                   cmd_id, e);
                            }
                        },
                        Err(e) => {
                            pf_error!(self.id; "error getting cmd result: {}", e);
                            continue;
                        }
                    }
                },

                // follower lease timer fired
                _ = self.lease_timer.timeout() => {
                    if let Err(e) = self.handle_lease_timeout() {
                        pf_error!(self.id; "error handling lease timeout: {}", e);
                    }
                },

                // master renewal timer fired
                _ = self.renew_timer.timeout() => {
                    if let Err(e) = self.handle_renew_timeout() {
                        pf_error!(self.id; "error handling renew timeout: {}", e);
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod replica_tests {
    use super::*;
    use tokio::time;

    fn group_addrs(base_port: u16) -> Vec<SocketAddr> {
        (0..3u16)
            .map(|i| {
                format!("127.0.0.1:{}", base_port + i).parse().unwrap()
            })
            .collect()
    }

    /// Spawns a real replica with a long lease so that no spontaneous
    /// timeouts interfere with the scripted scenario.
    async fn spawn_replica(
        id: ReplicaId,
        api_port: u16,
        p2p_addrs: Vec<SocketAddr>,
    ) -> Result<(), CanopyError> {
        let mut replica = VrReplica::new_and_setup(
            id,
            format!("127.0.0.1:{}", api_port).parse()?,
            p2p_addrs,
            Some("lease_ms = 60000\nmax_clock_drift_ms = 1000"),
        )
        .await?;
        tokio::spawn(async move { replica.run().await });
        Ok(())
    }

    /// Sets up a transport hub posing as one scripted peer replica.
    async fn fake_peer(
        me: ReplicaId,
        p2p_addrs: &[SocketAddr],
    ) -> Result<TransportHub<PeerRequest, PeerReply>, CanopyError> {
        let peer_addrs: HashMap<ReplicaId, SocketAddr> = p2p_addrs
            .iter()
            .enumerate()
            .map(|(peer, &addr)| (peer as ReplicaId, addr))
            .collect();
        TransportHub::new_and_setup(
            me,
            3,
            p2p_addrs[me as usize],
            peer_addrs,
            Duration::from_millis(10),
            5,
            Duration::from_secs(1),
        )
        .await
    }

    /// Waits for the next reply event, acking any interleaved requests.
    async fn next_reply(
        hub: &mut TransportHub<PeerRequest, PeerReply>,
    ) -> Result<Result<PeerReply, String>, CanopyError> {
        loop {
            match hub.recv_event().await? {
                TransportEvent::Request { peer, req_id, .. } => {
                    hub.send_reply(peer, req_id, Ok(PeerReply::Ack))?;
                }
                TransportEvent::Reply { reply, .. } => return Ok(reply),
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn backup_normal_case() -> Result<(), CanopyError> {
        let p2p_addrs = group_addrs(41310);
        spawn_replica(1, 41320, p2p_addrs.clone()).await?;
        let mut master = fake_peer(0, &p2p_addrs).await?;
        time::sleep(Duration::from_millis(50)).await;

        // replica 1 should accept ops 1 and 2 and grant leases
        let before = SystemTime::now();
        master.send_req(
            1,
            PeerRequest::Prepare {
                view: 0,
                op_number: 1,
                command: Command::Push { value: "A".into() },
                commit_number: 0,
            },
        )?;
        match next_reply(&mut master).await? {
            Ok(PeerReply::PrepareOk {
                view,
                op_number,
                replica_number,
                lease_deadline,
            }) => {
                assert_eq!((view, op_number, replica_number), (0, 1, 1));
                assert!(lease_deadline > before);
            }
            reply => panic!("unexpected reply {:?}", reply),
        }

        // a duplicate of op 1 must be refused as old
        master.send_req(
            1,
            PeerRequest::Prepare {
                view: 0,
                op_number: 1,
                command: Command::Push { value: "A".into() },
                commit_number: 0,
            },
        )?;
        assert_eq!(
            next_reply(&mut master).await?,
            Err("old op number".into())
        );

        // a Commit heartbeat is granted a lease too
        master.send_req(
            1,
            PeerRequest::Commit {
                view: 0,
                commit_number: 1,
            },
        )?;
        match next_reply(&mut master).await? {
            Ok(PeerReply::Heartbeat { replica_number, .. }) => {
                assert_eq!(replica_number, 1);
            }
            reply => panic!("unexpected reply {:?}", reply),
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn stale_prepare_rejected_after_view_change() -> Result<(), CanopyError>
    {
        let p2p_addrs = group_addrs(41330);
        spawn_replica(1, 41340, p2p_addrs.clone()).await?;
        let mut peer0 = fake_peer(0, &p2p_addrs).await?;
        let mut peer2 = fake_peer(2, &p2p_addrs).await?;
        time::sleep(Duration::from_millis(50)).await;

        // drive replica 1 into view 1 (of which it is the master): two
        // StartViewChange proposals reach it, then a quorum of
        // DoViewChange states (its own is short-circuited internally)
        peer0.send_req(
            1,
            PeerRequest::StartViewChange {
                view: 1,
                replica_number: 0,
            },
        )?;
        peer2.send_req(
            1,
            PeerRequest::StartViewChange {
                view: 1,
                replica_number: 2,
            },
        )?;
        peer0.send_req(
            1,
            PeerRequest::DoViewChange {
                view: 1,
                replica_number: 0,
                log: OpLog::new(),
                normal_view: 0,
                op_number: 0,
                commit_number: 0,
            },
        )?;

        // replica 1 announces StartView for view 1 once elected
        let announced = time::timeout(Duration::from_secs(5), async {
            loop {
                match peer2.recv_event().await? {
                    TransportEvent::Request {
                        peer,
                        req_id,
                        req: PeerRequest::StartView { view, .. },
                    } => {
                        peer2.send_reply(peer, req_id, Ok(PeerReply::Ack))?;
                        return Ok::<View, CanopyError>(view);
                    }
                    TransportEvent::Request { peer, req_id, .. } => {
                        peer2.send_reply(peer, req_id, Ok(PeerReply::Ack))?;
                    }
                    TransportEvent::Reply { .. } => {}
                }
            }
        })
        .await
        .map_err(CanopyError::msg)??;
        assert_eq!(announced, 1);

        // drain peer0's pending events, then inject a Prepare from the
        // stale view 0; it must be refused with "wrong view"
        peer0.send_req(
            1,
            PeerRequest::Prepare {
                view: 0,
                op_number: 5,
                command: Command::Push {
                    value: "stale".into(),
                },
                commit_number: 0,
            },
        )?;
        let refusal = time::timeout(Duration::from_secs(5), async {
            loop {
                if let Err(refusal) = next_reply(&mut peer0).await? {
                    return Ok::<String, CanopyError>(refusal);
                }
            }
        })
        .await
        .map_err(CanopyError::msg)??;
        assert_eq!(refusal, "wrong view");
        Ok(())
    }
}
