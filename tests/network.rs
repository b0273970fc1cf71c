//! Multi-node scenarios over real loopback sockets.
//!
//! ## Test Scopes
//! - **Replication**: a store reaches every connected peer.
//! - **Retrieval**: a node without the key fetches and decrypts it from the network.
//! - **Deletion**: local-only deletes versus broadcast deletes.
//! - **Broadcast failure**: the first failing peer stops the broadcast and is dropped.
//! - **Stream framing**: a hand-driven peer sends late, broken or rejected streams; the
//!   connection stays in sync and no stream is stored under the wrong key.

use distributed_fs::crypto::cipher::encrypt_stream;
use distributed_fs::crypto::key::EncryptionKey;
use distributed_fs::node::make_server;
use distributed_fs::server::protocol::Message;
use distributed_fs::server::service::FileServer;
use distributed_fs::server::types::{FileServerOpts, ServerError};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use distributed_fs::transport::types::{INCOMING_MESSAGE, INCOMING_STREAM};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const OWNER: &str = "cluster-owner";
const WAIT: Duration = Duration::from_secs(3);

async fn spawn_node(
    root: &Path,
    key: &EncryptionKey,
    bootstrap: Vec<String>,
) -> (Arc<FileServer>, String) {
    spawn_node_with(root, key, bootstrap, Duration::from_millis(1000)).await
}

async fn spawn_node_with(
    root: &Path,
    key: &EncryptionKey,
    bootstrap: Vec<String>,
    fetch_timeout: Duration,
) -> (Arc<FileServer>, String) {
    let opts = FileServerOpts {
        id: OWNER.to_string(),
        encryption_key: key.clone(),
        storage_root: root.to_path_buf(),
        bootstrap_nodes: bootstrap,
        settle_interval: Duration::from_millis(50),
        fetch_timeout,
        ..FileServerOpts::default()
    };

    let server = make_server("127.0.0.1:0", opts);
    let addr = server.start().await.expect("start failed");
    (server, addr.to_string())
}

async fn wait_until_exists(server: &FileServer, key: &str, expected: bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if server.local_store().exists(OWNER, key).await == expected {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn local_content(server: &FileServer, key: &str) -> Vec<u8> {
    let (_, mut file) = server.local_store().read(OWNER, key).await.unwrap();
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await.unwrap();
    buf
}

async fn fetched_content(server: &FileServer, key: &str) -> Vec<u8> {
    let (size, mut file) = server.get(key).await.expect("get failed");
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await.unwrap();
    assert_eq!(size as usize, buf.len());
    buf
}

/// Plain socket registered as a peer of `server`, for speaking the wire format by hand.
async fn raw_peer(server: &FileServer) -> TcpStream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    server.transport().dial(&addr.to_string()).await.unwrap();
    let (conn, _) = listener.accept().await.unwrap();
    assert!(server.wait_for_peers(1, WAIT).await);
    conn
}

async fn read_message(conn: &mut TcpStream) -> Message {
    let mut header = [0u8; 5];
    tokio::time::timeout(WAIT, conn.read_exact(&mut header))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(header[0], INCOMING_MESSAGE);

    let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
    let mut payload = vec![0u8; len];
    conn.read_exact(&mut payload).await.unwrap();
    Message::decode(&payload).unwrap()
}

async fn encrypted(key: &EncryptionKey, content: &[u8]) -> Vec<u8> {
    let mut src = content;
    let mut out = Vec::new();
    encrypt_stream(key, &mut src, &mut out).await.unwrap();
    out
}

/// What a node sends back for a `GetFile`: marker, size prefix, ciphertext.
async fn get_answer(key: &EncryptionKey, content: &[u8]) -> Vec<u8> {
    let body = encrypted(key, content).await;
    let mut out = vec![INCOMING_STREAM];
    out.extend_from_slice(&(body.len() as u64).to_le_bytes());
    out.extend_from_slice(&body);
    out
}

/// A `StoreFile` frame followed by its stream.
fn store_with_stream(key: &str, owner_id: &str, body: &[u8]) -> Vec<u8> {
    let msg = Message::StoreFile {
        owner_id: owner_id.to_string(),
        key: key.to_string(),
        size: body.len() as u64,
    };
    let mut out = msg.to_frame().unwrap();
    out.push(INCOMING_STREAM);
    out.extend_from_slice(body);
    out
}

// ============================================================
// REPLICATION & RETRIEVAL
// ============================================================

#[tokio::test]
async fn test_store_replicates_to_every_peer() {
    let dir = tempfile::tempdir().unwrap();
    let key = EncryptionKey::generate();

    let (a, a_addr) = spawn_node(&dir.path().join("a"), &key, vec![]).await;
    let (b, _) = spawn_node(&dir.path().join("b"), &key, vec![a_addr.clone()]).await;
    let (c, _) = spawn_node(&dir.path().join("c"), &key, vec![a_addr]).await;
    assert!(a.wait_for_peers(2, WAIT).await);

    let n = a.store("report", &b"hello world"[..]).await.unwrap();
    assert_eq!(n, 11);

    for peer in [&b, &c] {
        assert!(wait_until_exists(peer, "report", true).await);
        // give the writer a moment to finish the file
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(local_content(peer, "report").await, b"hello world");
    }

    // replicas are plaintext at rest, same as the owner's copy
    assert_eq!(local_content(&a, "report").await, b"hello world");
}

#[tokio::test]
async fn test_peer_fetches_missing_key_from_network() {
    let dir = tempfile::tempdir().unwrap();
    let key = EncryptionKey::generate();

    let (a, a_addr) = spawn_node(&dir.path().join("a"), &key, vec![]).await;
    let (b, b_addr) = spawn_node(&dir.path().join("b"), &key, vec![a_addr.clone()]).await;
    assert!(b.wait_for_peers(1, WAIT).await);

    a.store("report", &b"hello world"[..]).await.unwrap();
    assert!(wait_until_exists(&b, "report", true).await);

    // joins after the store, so it never saw the replication; both A and B answer
    let (c, _) = spawn_node(&dir.path().join("c"), &key, vec![a_addr, b_addr]).await;
    assert!(c.wait_for_peers(2, WAIT).await);
    assert!(!c.local_store().exists(OWNER, "report").await);

    assert_eq!(fetched_content(&c, "report").await, b"hello world");
    assert!(c.local_store().exists(OWNER, "report").await);

    // connections are back in framing mode: a second round still works
    c.local_store().delete(OWNER, "report").await.unwrap();
    assert_eq!(fetched_content(&c, "report").await, b"hello world");
}

#[tokio::test]
async fn test_large_payload_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let key = EncryptionKey::generate();
    let payload: Vec<u8> = (0..300_000u32).map(|i| (i * 7 % 256) as u8).collect();

    let (a, a_addr) = spawn_node(&dir.path().join("a"), &key, vec![]).await;
    a.store("big.bin", payload.as_slice()).await.unwrap();

    let (b, _) = spawn_node(&dir.path().join("b"), &key, vec![a_addr]).await;
    assert!(b.wait_for_peers(1, WAIT).await);

    assert_eq!(fetched_content(&b, "big.bin").await, payload);
}

#[tokio::test]
async fn test_get_unknown_key_across_network_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let key = EncryptionKey::generate();

    let (_a, a_addr) = spawn_node(&dir.path().join("a"), &key, vec![]).await;
    let (b, _) = spawn_node(&dir.path().join("b"), &key, vec![a_addr]).await;
    assert!(b.wait_for_peers(1, WAIT).await);

    let result = b.get("never-stored").await;

    assert!(matches!(result, Err(ServerError::Store(_))));
}

// ============================================================
// DELETION
// ============================================================

#[tokio::test]
async fn test_local_delete_leaves_peer_copy() {
    let dir = tempfile::tempdir().unwrap();
    let key = EncryptionKey::generate();

    let (a, a_addr) = spawn_node(&dir.path().join("a"), &key, vec![]).await;
    let (b, _) = spawn_node(&dir.path().join("b"), &key, vec![a_addr]).await;
    assert!(a.wait_for_peers(1, WAIT).await);

    a.store("report", &b"hello world"[..]).await.unwrap();
    assert!(wait_until_exists(&b, "report", true).await);

    a.local_store().delete(OWNER, "report").await.unwrap();

    assert!(!a.local_store().exists(OWNER, "report").await);
    assert!(b.local_store().exists(OWNER, "report").await);

    // A gets its copy back from B
    assert_eq!(fetched_content(&a, "report").await, b"hello world");
}

#[tokio::test]
async fn test_delete_is_broadcast() {
    let dir = tempfile::tempdir().unwrap();
    let key = EncryptionKey::generate();

    let (a, a_addr) = spawn_node(&dir.path().join("a"), &key, vec![]).await;
    let (b, _) = spawn_node(&dir.path().join("b"), &key, vec![a_addr]).await;
    assert!(a.wait_for_peers(1, WAIT).await);

    a.store("report", &b"hello world"[..]).await.unwrap();
    assert!(wait_until_exists(&b, "report", true).await);

    a.delete("report").await.unwrap();

    assert!(!a.local_store().exists(OWNER, "report").await);
    assert!(wait_until_exists(&b, "report", false).await);
}

// ============================================================
// BROADCAST FAILURE
// ============================================================

#[tokio::test]
async fn test_broadcast_stops_at_first_failed_peer() {
    let dir = tempfile::tempdir().unwrap();
    let key = EncryptionKey::generate();
    let (a, _) = spawn_node(&dir.path().join("a"), &key, vec![]).await;

    let mut remotes = Vec::new();
    for _ in 0..3 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        a.transport().dial(&addr.to_string()).await.unwrap();
        let (conn, _) = listener.accept().await.unwrap();
        remotes.push((addr, conn));
    }
    assert!(a.wait_for_peers(3, WAIT).await);

    // broadcast order is address order
    let peers = a.peers();
    let middle = peers[1].clone();
    middle.close().await.unwrap();

    let find = |remotes: &mut Vec<(std::net::SocketAddr, TcpStream)>, i: usize| {
        let pos = remotes
            .iter()
            .position(|(addr, _)| *addr == peers[i].addr())
            .unwrap();
        remotes.swap_remove(pos).1
    };
    let mut first = find(&mut remotes, 0);
    let mut third = find(&mut remotes, 2);

    let msg = Message::DeleteFile {
        owner_id: OWNER.to_string(),
        key: "report".to_string(),
    };
    let result = a.broadcast(&msg).await;

    match result {
        Err(ServerError::Send { addr, .. }) => assert_eq!(addr, middle.addr().to_string()),
        other => panic!("expected send failure, got {:?}", other),
    }

    let frame = msg.to_frame().unwrap();
    let mut received = vec![0u8; frame.len()];
    tokio::time::timeout(WAIT, first.read_exact(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, frame);

    let mut buf = [0u8; 1];
    let nothing = tokio::time::timeout(Duration::from_millis(200), third.read(&mut buf)).await;
    assert!(nothing.is_err(), "third peer must not receive the broadcast");

    assert_eq!(a.peer_count(), 2);
}

// ============================================================
// STREAM FRAMING
// ============================================================

#[tokio::test]
async fn test_late_answer_is_not_taken_for_the_next_get() {
    let dir = tempfile::tempdir().unwrap();
    let key = EncryptionKey::generate();
    let (c, _) = spawn_node_with(&dir.path().join("c"), &key, vec![], Duration::from_millis(200)).await;
    let mut remote = raw_peer(&c).await;

    let result = c.get("k").await;
    assert!(matches!(result, Err(ServerError::Store(_))));
    assert_eq!(read_message(&mut remote).await.key(), "k");

    // the answer for "k" arrives after C gave up on it
    remote
        .write_all(&get_answer(&key, b"content-of-k").await)
        .await
        .unwrap();

    let fetch = {
        let c = c.clone();
        tokio::spawn(async move { fetched_content(&c, "other").await })
    };
    assert_eq!(read_message(&mut remote).await.key(), "other");
    remote
        .write_all(&get_answer(&key, b"content-of-other").await)
        .await
        .unwrap();

    assert_eq!(fetch.await.unwrap(), b"content-of-other");
    assert!(!c.local_store().exists(OWNER, "k").await);
    assert_eq!(c.peer_count(), 1);
}

#[tokio::test]
async fn test_peer_that_never_answers_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let key = EncryptionKey::generate();
    let (c, _) = spawn_node_with(&dir.path().join("c"), &key, vec![], Duration::from_millis(100)).await;
    let mut remote = raw_peer(&c).await;

    assert!(c.get("k").await.is_err());
    assert_eq!(read_message(&mut remote).await.key(), "k");

    let deadline = tokio::time::Instant::now() + WAIT;
    while c.peer_count() > 0 {
        assert!(tokio::time::Instant::now() < deadline, "silent peer was never dropped");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // our side of the connection is shut down
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(WAIT, remote.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_missing_key_gets_empty_answer() {
    let dir = tempfile::tempdir().unwrap();
    let key = EncryptionKey::generate();
    let (b, _) = spawn_node(&dir.path().join("b"), &key, vec![]).await;
    let mut remote = raw_peer(&b).await;

    let msg = Message::GetFile {
        owner_id: OWNER.to_string(),
        key: "never-stored".to_string(),
    };
    remote.write_all(&msg.to_frame().unwrap()).await.unwrap();

    let mut answer = [0xFFu8; 9];
    tokio::time::timeout(WAIT, remote.read_exact(&mut answer))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(answer[0], INCOMING_STREAM);
    assert_eq!(u64::from_le_bytes(answer[1..].try_into().unwrap()), 0);
}

#[tokio::test]
async fn test_broken_stream_does_not_desync_the_next_store() {
    let dir = tempfile::tempdir().unwrap();
    let key = EncryptionKey::generate();
    let (b, _) = spawn_node(&dir.path().join("b"), &key, vec![]).await;
    let mut remote = raw_peer(&b).await;

    // too short to even hold the IV
    remote
        .write_all(&store_with_stream("broken", OWNER, &[0xAB; 8]))
        .await
        .unwrap();
    let body = encrypted(&key, b"second payload").await;
    remote
        .write_all(&store_with_stream("good", OWNER, &body))
        .await
        .unwrap();

    assert!(wait_until_exists(&b, "good", true).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(local_content(&b, "good").await, b"second payload");
    assert!(!b.local_store().exists(OWNER, "broken").await);
    assert_eq!(b.peer_count(), 1);
}

#[tokio::test]
async fn test_owner_ids_from_peers_stay_below_root() {
    let dir = tempfile::tempdir().unwrap();
    let key = EncryptionKey::generate();
    let outside = dir.path().join("outside_root");
    std::fs::create_dir_all(outside.join("keep")).unwrap();

    let (b, _) = spawn_node(&dir.path().join("b"), &key, vec![]).await;
    let mut remote = raw_peer(&b).await;

    let delete = Message::DeleteFile {
        owner_id: outside.to_string_lossy().into_owned(),
        key: "keep".to_string(),
    };
    remote.write_all(&delete.to_frame().unwrap()).await.unwrap();

    // rejected before a byte of the stream is read, so the whole body is skipped
    let escaped = encrypted(&key, b"escaped").await;
    remote
        .write_all(&store_with_stream("x", "../escaped", &escaped))
        .await
        .unwrap();

    let get = Message::GetFile {
        owner_id: "../b".to_string(),
        key: "x".to_string(),
    };
    remote.write_all(&get.to_frame().unwrap()).await.unwrap();
    let mut answer = [0xFFu8; 9];
    tokio::time::timeout(WAIT, remote.read_exact(&mut answer))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(answer, [INCOMING_STREAM, 0, 0, 0, 0, 0, 0, 0, 0]);

    let body = encrypted(&key, b"in sync").await;
    remote
        .write_all(&store_with_stream("good", OWNER, &body))
        .await
        .unwrap();
    assert!(wait_until_exists(&b, "good", true).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(local_content(&b, "good").await, b"in sync");

    assert!(outside.join("keep").exists());
    assert!(!dir.path().join("escaped").exists());
}
