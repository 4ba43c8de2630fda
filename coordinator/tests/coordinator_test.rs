use chunklink_coordinator::{ClientError, Coordinator, CoordinatorConfig, TrackerClient};
use chunklink_core::{
    ChunkLinkCodec, FileInfo, Identity, Message, MessageSigner, NodeAddress, PublishRejection,
    RegisterRejection, SignedEnvelope,
};
use std::collections::BTreeSet;
use std::future::Future;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::net::TcpStream;
use tokio::time::sleep;

async fn start_coordinator() -> (Coordinator, SocketAddr, Arc<Identity>) {
    let identity = Arc::new(Identity::generate());
    let mut coordinator = Coordinator::new(CoordinatorConfig::default(), identity.clone());
    let addr = coordinator
        .start("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    (coordinator, addr, identity)
}

async fn node(addr: SocketAddr, identity: &Arc<Identity>, name: &str) -> TrackerClient {
    let mut client = TrackerClient::connect(addr, identity.clone()).await.unwrap();
    client.register(NodeAddress::new(name)).await.unwrap();
    client
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn doc_info() -> FileInfo {
    FileInfo {
        size: 1000,
        total_chunknum: 4,
    }
}

fn chunks(items: &[u32]) -> BTreeSet<u32> {
    items.iter().copied().collect()
}

#[tokio::test]
async fn test_publish_register_locate_scenario() {
    let (mut coordinator, addr, identity) = start_coordinator().await;

    let mut a = node(addr, &identity, "node-a").await;
    a.publish("doc.bin", doc_info()).await.unwrap();
    for chunknum in 0..4 {
        a.register_chunk("doc.bin", chunknum).await.unwrap();
    }

    let mut b = node(addr, &identity, "node-b").await;
    let location = b.locate_file("doc.bin").await.unwrap();

    assert_eq!(location.fileinfo, doc_info());
    assert_eq!(location.chunkinfo.len(), 1);
    assert_eq!(
        location.chunkinfo[&NodeAddress::new("node-a")],
        chunks(&[0, 1, 2, 3])
    );

    coordinator.stop().await;
}

#[tokio::test]
async fn test_publish_twice_yields_one_success() {
    let (mut coordinator, addr, identity) = start_coordinator().await;
    let mut a = node(addr, &identity, "node-a").await;
    let mut b = node(addr, &identity, "node-b").await;

    a.publish("F", doc_info()).await.unwrap();
    let other = FileInfo {
        size: 5,
        total_chunknum: 1,
    };
    assert!(matches!(
        b.publish("F", other).await,
        Err(ClientError::FileExists(name)) if name == "F"
    ));
    assert!(matches!(
        a.publish("F", doc_info()).await,
        Err(ClientError::FileExists(_))
    ));

    let files = b.list_files().await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files["F"], doc_info());

    coordinator.stop().await;
}

#[tokio::test]
async fn test_chunk_registration_idempotent_and_bounded() {
    let (mut coordinator, addr, identity) = start_coordinator().await;
    let mut a = node(addr, &identity, "node-a").await;
    let mut b = node(addr, &identity, "node-b").await;
    a.publish("doc.bin", doc_info()).await.unwrap();

    b.register_chunk("doc.bin", 2).await.unwrap();
    b.register_chunk("doc.bin", 2).await.unwrap();
    b.register_chunk("doc.bin", 99).await.unwrap();
    b.register_chunk("missing.bin", 0).await.unwrap();

    // Replies are ordered per connection, so this observes every claim above.
    let location = b.locate_file("doc.bin").await.unwrap();
    assert_eq!(location.chunkinfo[&NodeAddress::new("node-b")], chunks(&[2]));
    assert_eq!(coordinator.file_list().await.len(), 1);

    coordinator.stop().await;
}

#[tokio::test]
async fn test_disconnect_collects_orphans() {
    let (mut coordinator, addr, identity) = start_coordinator().await;
    let mut a = node(addr, &identity, "node-a").await;
    let mut b = node(addr, &identity, "node-b").await;
    let mut c = node(addr, &identity, "node-c").await;

    a.publish("shared.bin", doc_info()).await.unwrap();
    b.register_chunk("shared.bin", 0).await.unwrap();
    b.register_chunk("shared.bin", 1).await.unwrap();
    let location = c.locate_file("shared.bin").await.unwrap();
    assert_eq!(location.chunkinfo.len(), 2);

    a.disconnect().await;
    eventually(|| async { coordinator.connection_count().await == 2 }).await;

    let location = c.locate_file("shared.bin").await.unwrap();
    assert_eq!(location.chunkinfo.len(), 1);
    assert_eq!(
        location.chunkinfo[&NodeAddress::new("node-b")],
        chunks(&[0, 1])
    );

    b.disconnect().await;
    eventually(|| async { coordinator.connection_count().await == 1 }).await;

    assert!(matches!(
        c.locate_file("shared.bin").await,
        Err(ClientError::UnknownFile(_))
    ));
    assert!(coordinator.file_list().await.is_empty());
    assert!(coordinator.chunkinfo().await.is_empty());
    assert_eq!(coordinator.peers().await, vec![NodeAddress::new("node-c")]);

    coordinator.stop().await;
}

#[tokio::test]
async fn test_unregistered_connection_cannot_own_chunks() {
    let (mut coordinator, addr, identity) = start_coordinator().await;
    let mut anon = TrackerClient::connect(addr, identity.clone()).await.unwrap();

    assert!(matches!(
        anon.publish("doc.bin", doc_info()).await,
        Err(ClientError::PublishRejected {
            reason: PublishRejection::NotRegistered,
            ..
        })
    ));
    // Read-only requests are still served.
    assert!(anon.list_files().await.unwrap().is_empty());

    anon.register(NodeAddress::new("node-a")).await.unwrap();
    anon.publish("doc.bin", doc_info()).await.unwrap();

    coordinator.stop().await;
}

#[tokio::test]
async fn test_address_held_by_live_connection() {
    let (mut coordinator, addr, identity) = start_coordinator().await;
    let _a = node(addr, &identity, "node-a").await;

    let mut impostor = TrackerClient::connect(addr, identity.clone()).await.unwrap();
    assert!(matches!(
        impostor.register(NodeAddress::new("node-a")).await,
        Err(ClientError::RegisterRejected(RegisterRejection::AddressInUse))
    ));

    coordinator.stop().await;
}

#[tokio::test]
async fn test_tampered_envelope_closes_session() {
    let (mut coordinator, addr, identity) = start_coordinator().await;
    let mut a = node(addr, &identity, "node-a").await;
    a.publish("doc.bin", doc_info()).await.unwrap();

    let codec = ChunkLinkCodec::default();
    let mut raw = TcpStream::connect(addr).await.unwrap();
    codec
        .send_signed(
            &mut raw,
            &Message::RequestRegister {
                address: NodeAddress::new("node-x"),
            },
            identity.as_ref(),
        )
        .await
        .unwrap();
    let reply = codec
        .receive_verified(&mut raw, identity.as_ref())
        .await
        .unwrap();
    assert!(matches!(reply, Message::ReplyRegister { result: true, .. }));

    let mut envelope = SignedEnvelope::sign(
        &Message::RequestPublish {
            filename: "evil.bin".to_string(),
            fileinfo: doc_info(),
        },
        identity.as_ref(),
    )
    .unwrap();
    envelope.message["filename"] = serde_json::json!("doc.bin.evil");
    codec.write_message(&mut raw, &envelope).await.unwrap();

    // The coordinator drops the connection instead of answering.
    let closed = codec
        .read_message::<_, SignedEnvelope>(&mut raw)
        .await
        .unwrap_err();
    assert!(closed.is_clean_eof());

    eventually(|| async { coordinator.connection_count().await == 1 }).await;
    let files = coordinator.file_list().await;
    assert_eq!(files.keys().collect::<Vec<_>>(), vec!["doc.bin"]);

    // Other sessions are unaffected.
    assert_eq!(a.list_files().await.unwrap().len(), 1);

    coordinator.stop().await;
}

#[tokio::test]
async fn test_foreign_key_rejected() {
    let (mut coordinator, addr, _identity) = start_coordinator().await;
    let stranger = Arc::new(Identity::generate());
    let mut client = TrackerClient::connect(addr, stranger).await.unwrap();

    let result = client.register(NodeAddress::new("node-a")).await;
    assert!(matches!(result, Err(ClientError::Protocol(_))));
    assert!(!client.is_connected());
    assert!(matches!(
        client.list_files().await,
        Err(ClientError::NotConnected)
    ));

    eventually(|| async { coordinator.connection_count().await == 0 }).await;
    coordinator.stop().await;
}

#[tokio::test]
async fn test_unknown_message_type_is_ignored() {
    let (mut coordinator, addr, identity) = start_coordinator().await;
    let codec = ChunkLinkCodec::default();
    let mut raw = TcpStream::connect(addr).await.unwrap();

    let message = serde_json::json!({ "type": "peer_ping_pong", "nonce": 1 });
    let signature = identity.sign(&serde_json::to_vec(&message).unwrap());
    let envelope = SignedEnvelope {
        message,
        signature: hex::encode(signature),
    };
    codec.write_message(&mut raw, &envelope).await.unwrap();

    codec
        .send_signed(&mut raw, &Message::RequestFileList, identity.as_ref())
        .await
        .unwrap();
    let reply = codec
        .receive_verified(&mut raw, identity.as_ref())
        .await
        .unwrap();
    assert!(matches!(reply, Message::ReplyFileList { .. }));

    coordinator.stop().await;
}

#[tokio::test]
async fn test_truncated_frame_closes_only_that_session() {
    use tokio::io::AsyncWriteExt;

    let (mut coordinator, addr, identity) = start_coordinator().await;
    let mut a = node(addr, &identity, "node-a").await;

    let mut raw = TcpStream::connect(addr).await.unwrap();
    raw.write_all(&100u32.to_be_bytes()).await.unwrap();
    raw.write_all(b"{\"partial\":").await.unwrap();
    raw.shutdown().await.unwrap();
    drop(raw);

    eventually(|| async { coordinator.connection_count().await == 1 }).await;
    assert!(a.list_files().await.unwrap().is_empty());

    coordinator.stop().await;
}

async fn start_with_io_timeout(io_timeout: Duration) -> (Coordinator, SocketAddr, Arc<Identity>) {
    let identity = Arc::new(Identity::generate());
    let config = CoordinatorConfig {
        io_timeout,
        ..CoordinatorConfig::default()
    };
    let mut coordinator = Coordinator::new(config, identity.clone());
    let addr = coordinator
        .start("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    (coordinator, addr, identity)
}

#[tokio::test]
async fn test_started_frame_must_finish_in_time() {
    use tokio::io::AsyncWriteExt;

    let (mut coordinator, addr, _identity) = start_with_io_timeout(Duration::from_millis(100)).await;

    let mut raw = TcpStream::connect(addr).await.unwrap();
    raw.write_all(&100u32.to_be_bytes()).await.unwrap();
    raw.write_all(b"{\"mess").await.unwrap();
    raw.flush().await.unwrap();

    eventually(|| async { coordinator.connection_count().await == 1 }).await;
    // The link stays open on our side; the coordinator gives up on the body.
    eventually(|| async { coordinator.connection_count().await == 0 }).await;
    drop(raw);

    coordinator.stop().await;
}

#[tokio::test]
async fn test_idle_node_keeps_its_files() {
    let (mut coordinator, addr, identity) = start_with_io_timeout(Duration::from_millis(100)).await;
    let mut a = node(addr, &identity, "node-a").await;
    a.publish("doc.bin", doc_info()).await.unwrap();

    sleep(Duration::from_millis(500)).await;

    assert!(coordinator.file_list().await.contains_key("doc.bin"));
    assert_eq!(coordinator.peers().await, vec![NodeAddress::new("node-a")]);
    assert_eq!(a.list_files().await.unwrap().len(), 1);

    coordinator.stop().await;
}

#[tokio::test]
async fn test_publish_path_and_missing_file() {
    let (mut coordinator, addr, identity) = start_coordinator().await;
    let mut a = node(addr, &identity, "node-a").await;

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&[42u8; 100]).unwrap();
    file.flush().unwrap();

    let published = a.publish_path(file.path(), 30).await.unwrap();
    assert_eq!(published.file.info.total_chunknum, 4);
    assert_eq!(published.tree.leaf_count(), 4);

    let files = coordinator.file_list().await;
    assert_eq!(files[&published.file.name].size, 100);

    assert!(matches!(
        a.publish_path(file.path(), 30).await,
        Err(ClientError::FileExists(_))
    ));
    assert!(matches!(
        a.publish_path(std::path::Path::new("__not_existed_file"), 30)
            .await,
        Err(ClientError::Io(_))
    ));

    coordinator.stop().await;
}

#[tokio::test]
async fn test_stop_closes_sessions_and_restart() {
    let (mut coordinator, addr, identity) = start_coordinator().await;
    let mut a = node(addr, &identity, "node-a").await;
    let mut b = node(addr, &identity, "node-b").await;
    a.publish("doc.bin", doc_info()).await.unwrap();

    coordinator.stop().await;
    assert!(!coordinator.is_running());
    assert!(coordinator.file_list().await.is_empty());
    assert_eq!(coordinator.connection_count().await, 0);

    // The client only learns the link is gone on its next request.
    assert!(a.is_connected());

    assert!(a.publish("other.bin", doc_info()).await.is_err());
    assert!(b.list_files().await.is_err());
    assert!(!a.is_connected());
    assert!(matches!(
        a.list_files().await,
        Err(ClientError::NotConnected)
    ));

    coordinator.start(addr).await.unwrap();
    assert!(coordinator.is_running());
    let mut a = node(addr, &identity, "node-a").await;
    a.publish("doc.bin", doc_info()).await.unwrap();

    coordinator.stop().await;
}

#[tokio::test]
async fn test_node_reconnect_republishes() {
    let (mut coordinator, addr, identity) = start_coordinator().await;
    let mut a = node(addr, &identity, "node-a").await;
    a.publish("doc.bin", doc_info()).await.unwrap();

    a.disconnect().await;
    eventually(|| async { coordinator.file_list().await.is_empty() }).await;

    let mut a = node(addr, &identity, "node-a").await;
    a.publish("doc.bin", doc_info()).await.unwrap();
    assert!(coordinator.file_list().await.contains_key("doc.bin"));

    coordinator.stop().await;
}
