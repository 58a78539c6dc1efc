//! End-to-end scenarios over a 3-replica group running in one process.

use std::net::SocketAddr;

use canopy::replica::{PeerReply, PeerRequest};
use canopy::{CanopyClient, CanopyError, Command, ReplicaId, VrReplica};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Builds `n` consecutive localhost addresses starting at `base_port`.
fn group_addrs(base_port: u16, n: u16) -> Vec<SocketAddr> {
    (0..n)
        .map(|i| format!("127.0.0.1:{}", base_port + i).parse().unwrap())
        .collect()
}

/// Spawns one replica's event loop as a task; aborting the returned handle
/// makes the replica fall silent (its process "crashes").
async fn start_replica(
    id: ReplicaId,
    api_addrs: &[SocketAddr],
    p2p_addrs: &[SocketAddr],
    config: &str,
) -> Result<JoinHandle<()>, CanopyError> {
    let mut replica = VrReplica::new_and_setup(
        id,
        api_addrs[id as usize],
        p2p_addrs.to_vec(),
        Some(config),
    )
    .await?;
    Ok(tokio::spawn(async move { replica.run().await }))
}

/// Spawns a whole group of 3 replicas.
async fn start_group(
    api_addrs: &[SocketAddr],
    p2p_addrs: &[SocketAddr],
    config: &str,
) -> Result<Vec<JoinHandle<()>>, CanopyError> {
    let mut handles = vec![];
    for id in 0..3u8 {
        handles.push(start_replica(id, api_addrs, p2p_addrs, config).await?);
    }
    // let the group settle (peer connections are lazy, but give the master
    // a beat to seed its lease)
    time::sleep(Duration::from_millis(100)).await;
    Ok(handles)
}

/// Polls the tree digest of a specific replica until it matches `expected`
/// or attempts run out.
async fn await_tree_digest(
    servers: &[SocketAddr],
    id: ReplicaId,
    expected: &str,
) -> Result<(), CanopyError> {
    for _ in 0..50 {
        // fresh client (hence fresh client ID) per probe round
        let mut probe = CanopyClient::new(servers.to_vec());
        if let Ok(digest) = probe.digest_of(id, Command::TreeDigest).await {
            if digest == expected {
                return Ok(());
            }
        }
        time::sleep(Duration::from_millis(100)).await;
    }
    Err(CanopyError::msg(format!(
        "replica {} never converged to expected digest",
        id
    )))
}

/// Poses as a replica on the peer wire protocol: connects to a p2p address,
/// identifies itself, performs one request/reply exchange, and returns the
/// protocol-level outcome. Frames are a big-endian length prefix followed
/// by the MessagePack body; bodies are `(request_id, payload)` pairs.
async fn call_as_peer(
    addr: SocketAddr,
    my_id: ReplicaId,
    req: &PeerRequest,
) -> Result<Result<PeerReply, String>, CanopyError> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_u8(my_id).await?;

    let body = rmp_serde::encode::to_vec(&(1u64, req))?;
    stream.write_u64(body.len() as u64).await?;
    stream.write_all(&body).await?;

    let reply_len = stream.read_u64().await? as usize;
    let mut reply_buf = vec![0u8; reply_len];
    stream.read_exact(&mut reply_buf).await?;
    let (reply_id, reply): (u64, Result<PeerReply, String>) =
        rmp_serde::decode::from_slice(&reply_buf)?;
    assert_eq!(reply_id, 1);
    Ok(reply)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn happy_path_write() -> Result<(), CanopyError> {
    let api_addrs = group_addrs(42110, 3);
    let p2p_addrs = group_addrs(42010, 3);
    let _handles = start_group(&api_addrs, &p2p_addrs, "").await?;

    let mut client = CanopyClient::new(api_addrs.clone());
    client.connect().await?;

    let node = client.create("/a", "value1").await?;
    assert_eq!(node.value, "value1");
    assert_eq!(node.stats.version, 1);

    // every replica eventually holds the same tree
    let expected = client.tree_digest().await?;
    for id in 0..3u8 {
        await_tree_digest(&api_addrs, id, &expected).await?;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn read_served_under_lease() -> Result<(), CanopyError> {
    let api_addrs = group_addrs(42120, 3);
    let p2p_addrs = group_addrs(42020, 3);
    let handles = start_group(&api_addrs, &p2p_addrs, "").await?;

    let mut client = CanopyClient::new(api_addrs.clone());
    client.connect().await?;
    client.create("/a", "value1").await?;

    // silence both backups; the master still holds a quorum-granted lease,
    // so reads keep being answered locally without any replication
    handles[1].abort();
    handles[2].abort();
    time::sleep(Duration::from_millis(100)).await;

    let node = client.get_data("/a").await?;
    assert_eq!(node.value, "value1");

    // writes, however, can no longer reach a quorum
    let write = client.create("/b", "value2").await;
    assert_eq!(write.unwrap_err().0, "timed out");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn master_crash_view_change() -> Result<(), CanopyError> {
    let api_addrs = group_addrs(42130, 3);
    let p2p_addrs = group_addrs(42030, 3);
    let handles = start_group(&api_addrs, &p2p_addrs, "").await?;

    let mut client = CanopyClient::new(api_addrs.clone());
    client.connect().await?;
    client.create("/a", "value1").await?;

    // crash the master; the backups' lease timers expire within a lease
    // and elect replica 1 as the master of view 1
    handles[0].abort();
    time::sleep(Duration::from_secs(4)).await;

    let mut client = CanopyClient::new(api_addrs.clone());
    client.connect_to(1).await?;
    client.connect_to_master().await?;
    assert_eq!(client.master(), 1);

    let node = client.create("/b", "value2").await?;
    assert_eq!(node.value, "value2");
    assert_eq!(client.get_data("/b").await?.value, "value2");
    // the pre-crash write survived the view change
    assert_eq!(client.get_data("/a").await?.value, "value1");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_prepare_refused() -> Result<(), CanopyError> {
    let api_addrs = group_addrs(42160, 3);
    let p2p_addrs = group_addrs(42060, 3);
    let handles = start_group(&api_addrs, &p2p_addrs, "").await?;

    let mut client = CanopyClient::new(api_addrs.clone());
    client.connect().await?;
    client.create("/a", "value1").await?;

    // crash the view-0 master and let the survivors elect a new one
    handles[0].abort();
    time::sleep(Duration::from_secs(4)).await;
    let mut client = CanopyClient::new(api_addrs.clone());
    client.connect_to(1).await?;
    client.connect_to_master().await?;
    assert_eq!(client.master(), 1);

    // pose as the deposed master replaying a Prepare from its old view;
    // both live replicas must refuse it
    let stale = PeerRequest::Prepare {
        view: 0,
        op_number: 2,
        command: Command::Create {
            path: "/stale".into(),
            value: "zombie".into(),
        },
        commit_number: 1,
    };
    for peer in 1..3u8 {
        let reply =
            call_as_peer(p2p_addrs[peer as usize], 0, &stale).await?;
        assert_eq!(reply, Err("wrong view".into()));
    }

    // no log mutation leaked into the state machine
    assert_eq!(client.get_data("/a").await?.value, "value1");
    assert_eq!(
        client.get_data("/stale").await.unwrap_err().0,
        "node does not exist"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lagging_replica_recovery() -> Result<(), CanopyError> {
    let api_addrs = group_addrs(42140, 3);
    let p2p_addrs = group_addrs(42040, 3);

    // start only replicas 0 and 1; they form a quorum on their own
    let _h0 = start_replica(0, &api_addrs, &p2p_addrs, "").await?;
    let _h1 = start_replica(1, &api_addrs, &p2p_addrs, "").await?;
    time::sleep(Duration::from_millis(100)).await;

    let mut client = CanopyClient::new(api_addrs.clone());
    client.connect().await?;
    for (path, value) in [("/a", "1"), ("/b", "2"), ("/c", "3")] {
        client.create(path, value).await?;
    }
    let expected = client.tree_digest().await?;

    // replica 2 joins fresh, notices the gap on the master's heartbeat,
    // and state-transfers the whole log through the recovery protocol
    let _h2 = start_replica(2, &api_addrs, &p2p_addrs, "").await?;
    await_tree_digest(&api_addrs, 2, &expected).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queue_fifo_under_replication() -> Result<(), CanopyError> {
    let api_addrs = group_addrs(42150, 3);
    let p2p_addrs = group_addrs(42050, 3);
    let _handles =
        start_group(&api_addrs, &p2p_addrs, "applier = 'queue'").await?;

    let mut client = CanopyClient::new(api_addrs.clone());
    client.connect().await?;

    client.push("A").await?;
    client.push("B").await?;

    // a snapshot taken now covers exactly the two pushes
    let (data, index) = client.snapshot().await?;
    assert!(!data.is_empty());
    assert_eq!(index, 2);

    let first = client.pop().await?;
    assert_eq!(first.value, "A");
    let second = client.pop().await?;
    assert_eq!(second.value, "B");

    assert_eq!(client.queue_len().await?, 0);
    assert_eq!(client.in_progress_len().await?, 2);

    client.done(first.id).await?;
    client.done(second.id).await?;
    assert_eq!(client.in_progress_len().await?, 0);
    Ok(())
}
