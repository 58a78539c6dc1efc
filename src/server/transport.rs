//! Server internal peer-to-peer transport module, providing request/reply
//! RPC channels between replicas.
//!
//! Inbound side: an acceptor task listens for peer connections (each peer
//! identifies itself with its replica ID upon connecting) and spawns one
//! servant task per connection, which decodes request frames into a single
//! funnel channel and encodes reply frames back out.
//!
//! Outbound side: one messenger task per peer, created at setup and
//! connecting lazily on first use. Each request is attempted with
//! per-attempt exponential backoff up to a capped attempt count; any
//! transport error tears the connection down so the next attempt reconnects
//! lazily. Every reply obtained -- or a final synthesized error once
//! attempts are exhausted -- is delivered into a single gather channel, so a
//! broadcast is satisfied as soon as the consumer has seen enough replies
//! while stragglers still get the message eventually, and the whole exchange
//! is self-terminating.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use crate::server::ReplicaId;
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry, tcp_connect_with_retry,
    CanopyError,
};

use bytes::BytesMut;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Request ID type for matching replies to in-flight requests.
pub(crate) type ReqId = u64;

/// Request frame sent from the calling replica to a peer.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
struct ReqFrame<Req> {
    id: ReqId,
    req: Req,
}

/// Reply frame sent back from a peer. Protocol refusals travel as the
/// `Err(String)` arm and are not transport errors.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
struct ReplyFrame<Reply> {
    id: ReqId,
    reply: Result<Reply, String>,
}

/// Multiplexed transport events delivered to the replica core: inbound
/// requests from peers, and gathered replies to my own requests.
#[derive(Debug, PartialEq, Eq, Clone)]
pub(crate) enum TransportEvent<Req, Reply> {
    /// A request from a peer, to be answered with `send_reply`.
    Request {
        peer: ReplicaId,
        req_id: ReqId,
        req: Req,
    },

    /// A gathered reply to one of my requests. `Err(String)` entries carry
    /// either protocol refusals from the peer or a local "unreachable"
    /// synthesized after retries were exhausted.
    Reply {
        peer: ReplicaId,
        reply: Result<Reply, String>,
    },
}

/// Server internal peer-to-peer transport module.
pub(crate) struct TransportHub<Req, Reply> {
    /// My replica ID.
    me: ReplicaId,

    /// Receiver side of the event funnel.
    rx_event: mpsc::UnboundedReceiver<TransportEvent<Req, Reply>>,

    /// Map from peer ID -> sender side of its inbound reply channel, shared
    /// with the peer acceptor task.
    tx_replies:
        flashmap::ReadHandle<ReplicaId, mpsc::UnboundedSender<ReplyFrame<Reply>>>,

    /// Map from peer ID -> sender side of its outbound request queue.
    tx_sends: HashMap<ReplicaId, mpsc::UnboundedSender<ReqFrame<Req>>>,

    /// Next request ID to assign.
    next_req_id: ReqId,

    /// Join handle of the peer acceptor task.
    _peer_acceptor_handle: JoinHandle<()>,

    /// Join handles of the per-peer messenger tasks.
    _peer_messenger_handles: HashMap<ReplicaId, JoinHandle<()>>,
}

// TransportHub public API implementation
impl<Req, Reply> TransportHub<Req, Reply>
where
    Req: fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
    Reply: fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    /// Creates a new peer-to-peer transport hub. Binds the p2p listener,
    /// spawns the acceptor task, and spawns one lazily-connecting messenger
    /// task per peer in `peer_addrs`.
    pub(crate) async fn new_and_setup(
        me: ReplicaId,
        population: u8,
        p2p_addr: SocketAddr,
        peer_addrs: HashMap<ReplicaId, SocketAddr>,
        backoff_base: Duration,
        max_tries: u8,
        call_timeout: Duration,
    ) -> Result<Self, CanopyError> {
        if population <= me {
            return logged_err!(me; "invalid population {}", population);
        }

        let (tx_event, rx_event) = mpsc::unbounded_channel();

        let (tx_replies_write, tx_replies_read) = flashmap::new::<
            ReplicaId,
            mpsc::UnboundedSender<ReplyFrame<Reply>>,
        >();

        let peer_listener = tcp_bind_with_retry(p2p_addr, 10).await?;
        let mut acceptor = TransportAcceptorTask::new(
            me,
            peer_listener,
            tx_event.clone(),
            tx_replies_write,
        );
        let peer_acceptor_handle =
            tokio::spawn(async move { acceptor.run().await });

        let mut tx_sends = HashMap::new();
        let mut peer_messenger_handles = HashMap::new();
        for (&peer, &addr) in &peer_addrs {
            if peer == me {
                continue;
            }
            let (tx_send, rx_send) = mpsc::unbounded_channel();
            let mut messenger = TransportMessengerTask::new(
                me,
                peer,
                addr,
                rx_send,
                tx_event.clone(),
                backoff_base,
                max_tries,
                call_timeout,
            );
            let handle = tokio::spawn(async move { messenger.run().await });
            tx_sends.insert(peer, tx_send);
            peer_messenger_handles.insert(peer, handle);
        }

        Ok(TransportHub {
            me,
            rx_event,
            tx_replies: tx_replies_read,
            tx_sends,
            next_req_id: 1,
            _peer_acceptor_handle: peer_acceptor_handle,
            _peer_messenger_handles: peer_messenger_handles,
        })
    }

    /// Receives the next transport event: an inbound peer request or a
    /// gathered reply to one of my own requests.
    pub(crate) async fn recv_event(
        &mut self,
    ) -> Result<TransportEvent<Req, Reply>, CanopyError> {
        match self.rx_event.recv().await {
            Some(event) => Ok(event),
            None => logged_err!(self.me; "event channel has been closed"),
        }
    }

    /// Sends a reply to an inbound request from given peer. Silently drops
    /// the reply if the peer's connection has gone away; the peer will
    /// retry the request on a fresh connection.
    pub(crate) fn send_reply(
        &mut self,
        peer: ReplicaId,
        req_id: ReqId,
        reply: Result<Reply, String>,
    ) -> Result<(), CanopyError> {
        let tx_replies_guard = self.tx_replies.guard();
        if let Some(tx_reply) = tx_replies_guard.get(&peer) {
            if tx_reply.send(ReplyFrame { id: req_id, reply }).is_err() {
                // connection went away between lookup and send
                pf_debug!(self.me; "dropping reply to disconnected peer {}",
                                   peer);
            }
        }
        Ok(())
    }

    /// Sends a request to a specified peer. Returns the assigned request ID.
    pub(crate) fn send_req(
        &mut self,
        peer: ReplicaId,
        req: Req,
    ) -> Result<ReqId, CanopyError> {
        let id = self.next_req_id;
        self.next_req_id += 1;
        match self.tx_sends.get(&peer) {
            Some(tx_send) => {
                tx_send
                    .send(ReqFrame { id, req })
                    .map_err(|e| CanopyError::msg(e.to_string()))?;
                Ok(id)
            }
            None => logged_err!(self.me; "peer ID {} not in tx_sends", peer),
        }
    }

    /// Broadcasts a request to all peers (skipping myself). All copies share
    /// one request ID, which is returned.
    pub(crate) fn bcast_req(&mut self, req: Req) -> Result<ReqId, CanopyError> {
        let id = self.next_req_id;
        self.next_req_id += 1;
        for (&peer, tx_send) in &self.tx_sends {
            debug_assert_ne!(peer, self.me);
            tx_send
                .send(ReqFrame {
                    id,
                    req: req.clone(),
                })
                .map_err(|e| CanopyError::msg(e.to_string()))?;
        }
        Ok(id)
    }
}

/// TransportHub peer acceptor task.
struct TransportAcceptorTask<Req, Reply> {
    me: ReplicaId,

    peer_listener: TcpListener,
    tx_event: mpsc::UnboundedSender<TransportEvent<Req, Reply>>,
    tx_replies:
        flashmap::WriteHandle<ReplicaId, mpsc::UnboundedSender<ReplyFrame<Reply>>>,

    tx_exit: mpsc::UnboundedSender<ReplicaId>,
    rx_exit: mpsc::UnboundedReceiver<ReplicaId>,
}

impl<Req, Reply> TransportAcceptorTask<Req, Reply>
where
    Req: fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
    Reply: fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    /// Creates the peer acceptor task.
    fn new(
        me: ReplicaId,
        peer_listener: TcpListener,
        tx_event: mpsc::UnboundedSender<TransportEvent<Req, Reply>>,
        tx_replies: flashmap::WriteHandle<
            ReplicaId,
            mpsc::UnboundedSender<ReplyFrame<Reply>>,
        >,
    ) -> Self {
        // exit channel for getting notified about termination of servants
        let (tx_exit, rx_exit) = mpsc::unbounded_channel();

        TransportAcceptorTask {
            me,
            peer_listener,
            tx_event,
            tx_replies,
            tx_exit,
            rx_exit,
        }
    }

    /// Accepts a new peer connection and spawns its servant task.
    async fn accept_new_peer(
        &mut self,
        mut stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), CanopyError> {
        let peer = match stream.read_u8().await {
            Ok(id) => id,
            Err(e) => {
                return logged_err!(self.me; "error receiving peer ID: {}", e);
            }
        };

        let (tx_reply, rx_reply) = mpsc::unbounded_channel();
        let mut tx_replies_guard = self.tx_replies.guard();
        // insert replaces any old entry, so a reconnecting peer takes over
        tx_replies_guard.insert(peer, tx_reply);
        tx_replies_guard.publish();

        let mut servant = TransportServantTask::new(
            self.me,
            peer,
            addr,
            stream,
            self.tx_event.clone(),
            rx_reply,
            self.tx_exit.clone(),
        );
        tokio::spawn(async move { servant.run().await });

        pf_debug!(self.me; "waited on peer {} '{}'", peer, addr);
        Ok(())
    }

    /// Starts the peer acceptor task loop.
    async fn run(&mut self) {
        pf_debug!(self.me; "peer_acceptor task spawned");

        loop {
            tokio::select! {
                // new peer connection accepted
                accepted = self.peer_listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            if let Err(e) = self.accept_new_peer(stream, addr).await {
                                pf_error!(self.me; "error accepting new peer: {}", e);
                            }
                        },
                        Err(e) => {
                            pf_warn!(self.me; "error accepting peer connection: {}", e);
                            continue;
                        }
                    }
                },

                // a peer servant task exits; its registry entry is left in
                // place and gets replaced when the peer reconnects
                peer = self.rx_exit.recv() => {
                    let peer = peer.unwrap();
                    pf_debug!(self.me; "servant for peer {} exited", peer);
                },
            }
        }
    }
}

/// TransportHub per-inbound-connection servant task.
struct TransportServantTask<Req, Reply> {
    me: ReplicaId,

    /// Corresponding peer's ID.
    peer: ReplicaId,
    /// Corresponding peer's address.
    addr: SocketAddr,

    conn_read: OwnedReadHalf,
    conn_write: OwnedWriteHalf,

    tx_event: mpsc::UnboundedSender<TransportEvent<Req, Reply>>,
    rx_reply: mpsc::UnboundedReceiver<ReplyFrame<Reply>>,

    read_buf: BytesMut,
    write_buf: BytesMut,
    write_buf_cursor: usize,
    retrying: bool,

    tx_exit: mpsc::UnboundedSender<ReplicaId>,
}

impl<Req, Reply> TransportServantTask<Req, Reply>
where
    Req: fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
    Reply: fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    /// Creates a servant task for one inbound peer connection.
    fn new(
        me: ReplicaId,
        peer: ReplicaId,
        addr: SocketAddr,
        conn: TcpStream,
        tx_event: mpsc::UnboundedSender<TransportEvent<Req, Reply>>,
        rx_reply: mpsc::UnboundedReceiver<ReplyFrame<Reply>>,
        tx_exit: mpsc::UnboundedSender<ReplicaId>,
    ) -> Self {
        let (conn_read, conn_write) = conn.into_split();

        TransportServantTask {
            me,
            peer,
            addr,
            conn_read,
            conn_write,
            tx_event,
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
        pf_debug!(self.me; "servant task for peer {} '{}' spawned",
                           self.peer, self.addr);

        loop {
            tokio::select! {
                // gets a reply to send out
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
                                    pf_debug!(self.me; "should retry reply send -> {}",
                                                       self.peer);
                                    self.retrying = true;
                                }
                                Err(_e) => break, // peer went away
                            }
                        },
                        None => break, // channel closed (connection replaced)
                    }
                },

                // retrying last unsuccessful reply send
                _ = self.conn_write.writable(), if self.retrying => {
                    match safe_tcp_write::<ReplyFrame<Reply>, _>(
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

                // receives a new request from peer
                req = safe_tcp_read::<ReqFrame<Req>, _>(
                    &mut self.read_buf,
                    &mut self.conn_read,
                ) => {
                    match req {
                        Ok(frame) => {
                            if let Err(e) = self.tx_event.send(
                                TransportEvent::Request {
                                    peer: self.peer,
                                    req_id: frame.id,
                                    req: frame.req,
                                },
                            ) {
                                pf_error!(self.me; "error sending to tx_event: {}", e);
                            }
                        },
                        Err(_e) => break, // peer disconnected
                    }
                },
            }
        }

        if let Err(e) = self.tx_exit.send(self.peer) {
            pf_error!(self.me; "error sending exit signal for {}: {}",
                               self.peer, e);
        }
        pf_debug!(self.me; "servant task for peer {} '{}' exited",
                           self.peer, self.addr);
    }
}

/// TransportHub per-peer outbound messenger task. Owns the (lazily
/// established) outbound connection to one peer and performs serial
/// request/reply calls with capped exponential backoff.
struct TransportMessengerTask<Req, Reply> {
    me: ReplicaId,

    /// Target peer's ID.
    peer: ReplicaId,
    /// Target peer's address.
    addr: SocketAddr,

    /// Lazily established connection; torn down on any transport error.
    conn: Option<(OwnedReadHalf, OwnedWriteHalf)>,

    rx_send: mpsc::UnboundedReceiver<ReqFrame<Req>>,
    tx_event: mpsc::UnboundedSender<TransportEvent<Req, Reply>>,

    read_buf: BytesMut,
    write_buf: BytesMut,
    write_buf_cursor: usize,

    backoff_base: Duration,
    max_tries: u8,
    call_timeout: Duration,
}

impl<Req, Reply> TransportMessengerTask<Req, Reply>
where
    Req: fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
    Reply: fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    /// Creates a messenger task for one peer.
    #[allow(clippy::too_many_arguments)]
    fn new(
        me: ReplicaId,
        peer: ReplicaId,
        addr: SocketAddr,
        rx_send: mpsc::UnboundedReceiver<ReqFrame<Req>>,
        tx_event: mpsc::UnboundedSender<TransportEvent<Req, Reply>>,
        backoff_base: Duration,
        max_tries: u8,
        call_timeout: Duration,
    ) -> Self {
        TransportMessengerTask {
            me,
            peer,
            addr,
            conn: None,
            rx_send,
            tx_event,
            read_buf: BytesMut::with_capacity(8 + 1024),
            write_buf: BytesMut::with_capacity(8 + 1024),
            write_buf_cursor: 0,
            backoff_base,
            max_tries,
            call_timeout,
        }
    }

    /// Establishes the outbound connection if not currently connected,
    /// identifying myself with my replica ID.
    async fn ensure_connected(&mut self) -> Result<(), CanopyError> {
        if self.conn.is_none() {
            let mut stream = tcp_connect_with_retry(self.addr, 0).await?;
            stream.write_u8(self.me).await?; // send my ID
            self.conn = Some(stream.into_split());
        }
        Ok(())
    }

    /// Performs one request/reply exchange attempt on the current
    /// connection. Any error leaves the connection torn down.
    async fn call_attempt(
        &mut self,
        frame: &ReqFrame<Req>,
    ) -> Result<Result<Reply, String>, CanopyError> {
        self.ensure_connected().await?;
        let (conn_read, conn_write) = self.conn.as_mut().unwrap();

        // send the request frame, waiting out full TCP buffers
        self.write_buf.clear();
        self.write_buf_cursor = 0;
        let mut sent = safe_tcp_write(
            &mut self.write_buf,
            &mut self.write_buf_cursor,
            &*conn_write,
            Some(frame),
        )?;
        while !sent {
            conn_write.writable().await?;
            sent = safe_tcp_write::<ReqFrame<Req>, _>(
                &mut self.write_buf,
                &mut self.write_buf_cursor,
                &*conn_write,
                None,
            )?;
        }

        // await the matching reply frame; calls are serial per peer, so any
        // mismatched ID is a leftover from a timed-out earlier attempt
        loop {
            let reply_frame: ReplyFrame<Reply> = time::timeout(
                self.call_timeout,
                safe_tcp_read(&mut self.read_buf, conn_read),
            )
            .await??;
            if reply_frame.id == frame.id {
                return Ok(reply_frame.reply);
            }
            pf_debug!(self.me; "discarding stale reply id {} <- {}",
                               reply_frame.id, self.peer);
        }
    }

    /// Starts the messenger task loop.
    async fn run(&mut self) {
        pf_debug!(self.me; "messenger task for peer {} '{}' spawned",
                           self.peer, self.addr);

        while let Some(frame) = self.rx_send.recv().await {
            let mut tries: u8 = 0;
            let mut backoff = self.backoff_base;

            loop {
                match self.call_attempt(&frame).await {
                    Ok(reply) => {
                        if let Err(e) = self.tx_event.send(
                            TransportEvent::Reply {
                                peer: self.peer,
                                reply,
                            },
                        ) {
                            pf_error!(self.me; "error sending to tx_event: {}", e);
                        }
                        break;
                    }
                    Err(e) => {
                        // tear down and reconnect lazily on next attempt
                        self.conn = None;
                        self.read_buf.clear();
                        tries += 1;
                        if tries >= self.max_tries {
                            // give up; don't flood crashed peers
                            if let Err(e) = self.tx_event.send(
                                TransportEvent::Reply {
                                    peer: self.peer,
                                    reply: Err(format!("unreachable: {}", e)),
                                },
                            ) {
                                pf_error!(self.me; "error sending to tx_event: {}", e);
                            }
                            break;
                        }
                        time::sleep(backoff).await;
                        backoff *= 2; // exponential backoff
                    }
                }
            }
        }

        pf_debug!(self.me; "messenger task for peer {} '{}' exited",
                           self.peer, self.addr);
    }
}

#[cfg(test)]
mod transport_tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Barrier;

    #[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
    struct TestReq(String);

    #[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
    struct TestReply(String);

    async fn test_hub(
        me: ReplicaId,
        base_port: u16,
    ) -> Result<TransportHub<TestReq, TestReply>, CanopyError> {
        let peer_addrs: HashMap<ReplicaId, SocketAddr> = (0..3u8)
            .map(|p| {
                (
                    p,
                    format!("127.0.0.1:{}", base_port + p as u16)
                        .parse()
                        .unwrap(),
                )
            })
            .collect();
        TransportHub::new_and_setup(
            me,
            3,
            peer_addrs[&me],
            peer_addrs,
            Duration::from_millis(10),
            5,
            Duration::from_secs(1),
        )
        .await
    }

    async fn expect_request(
        hub: &mut TransportHub<TestReq, TestReply>,
    ) -> Result<(ReplicaId, ReqId, TestReq), CanopyError> {
        match hub.recv_event().await? {
            TransportEvent::Request { peer, req_id, req } => {
                Ok((peer, req_id, req))
            }
            event => Err(CanopyError(format!(
                "unexpected transport event {:?}",
                event
            ))),
        }
    }

    async fn expect_reply(
        hub: &mut TransportHub<TestReq, TestReply>,
    ) -> Result<(ReplicaId, Result<TestReply, String>), CanopyError> {
        match hub.recv_event().await? {
            TransportEvent::Reply { peer, reply } => Ok((peer, reply)),
            event => Err(CanopyError(format!(
                "unexpected transport event {:?}",
                event
            ))),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn bcast_and_gather() -> Result<(), CanopyError> {
        let barrier = Arc::new(Barrier::new(3));
        for peer in 1..3u8 {
            let barrier_ref = barrier.clone();
            tokio::spawn(async move {
                // replica 1 / replica 2: echo server
                let mut hub = test_hub(peer, 30910).await?;
                barrier_ref.wait().await;
                let (from, req_id, req) = expect_request(&mut hub).await?;
                assert_eq!(from, 0);
                hub.send_reply(
                    from,
                    req_id,
                    Ok(TestReply(format!("{}@{}", req.0, peer))),
                )?;
                Ok::<(), CanopyError>(())
            });
        }

        // replica 0: broadcaster
        let mut hub = test_hub(0, 30910).await?;
        barrier.wait().await;
        hub.bcast_req(TestReq("hello".into()))?;
        let mut seen = vec![];
        for _ in 0..2 {
            let (peer, reply) = expect_reply(&mut hub).await?;
            assert_eq!(reply, Ok(TestReply(format!("hello@{}", peer))));
            seen.push(peer);
        }
        seen.sort();
        assert_eq!(seen, vec![1, 2]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn lazy_connect_retry() -> Result<(), CanopyError> {
        tokio::spawn(async move {
            // replica 1 comes up late; messenger on 0 must retry with
            // backoff until the connection succeeds
            time::sleep(Duration::from_millis(60)).await;
            let mut hub = test_hub(1, 30920).await?;
            let (from, req_id, req) = expect_request(&mut hub).await?;
            assert_eq!((from, req.0.as_str()), (0, "late"));
            hub.send_reply(from, req_id, Err("wrong view".into()))?;
            Ok::<(), CanopyError>(())
        });

        let mut hub = test_hub(0, 30920).await?;
        hub.send_req(1, TestReq("late".into()))?;
        let (peer, reply) = expect_reply(&mut hub).await?;
        assert_eq!(peer, 1);
        assert_eq!(reply, Err("wrong view".into()));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn exhausted_retries() -> Result<(), CanopyError> {
        // nobody ever listens on replica 2's port in this range
        let mut hub = test_hub(0, 30930).await?;
        hub.send_req(2, TestReq("void".into()))?;
        let (peer, reply) = expect_reply(&mut hub).await?;
        assert_eq!(peer, 2);
        assert!(reply.unwrap_err().starts_with("unreachable"));
        Ok(())
    }
}
