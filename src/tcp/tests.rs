use crate::cluster::composer::ClusterFs;
use crate::cluster::partitions::{PartitionDirectory, PartitionId};
use crate::fs::contract::FileSystem;
use crate::fs::error::FsError;
use crate::fs::memory::MemoryFs;
use crate::tcp::client::RemoteFs;
use crate::tcp::protocol::{read_message, write_message, FsCommand, FsResponse};
use crate::tcp::server::spawn_server;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Memory store served over TCP plus a connected client.
async fn serve_memory() -> (Arc<MemoryFs>, RemoteFs) {
    let store = Arc::new(MemoryFs::new());
    let addr = spawn_server(Arc::clone(&store) as Arc<dyn FileSystem>, loopback())
        .await
        .unwrap();
    (store, RemoteFs::new(addr))
}

async fn remote_put(fs: &RemoteFs, name: &str, data: &[u8]) -> Result<(), FsError> {
    let mut sink = fs.upload(name).await?;
    for chunk in data.chunks(3) {
        sink.send(Bytes::copy_from_slice(chunk)).await?;
    }
    sink.finish().await
}

#[tokio::test]
async fn upload_and_download_over_the_wire() {
    let (store, client) = serve_memory().await;
    remote_put(&client, "wire.txt", b"hello over tcp").await.unwrap();

    assert_eq!(store.raw("wire.txt").unwrap(), &b"hello over tcp"[..]);

    let mut source = client.download("wire.txt", 0, u64::MAX).await.unwrap();
    assert_eq!(source.read_to_end().await.unwrap(), b"hello over tcp");
}

#[tokio::test]
async fn download_handshake_reports_the_clamped_size() {
    let (_store, client) = serve_memory().await;
    remote_put(&client, "clamp", b"hello").await.unwrap();

    let mut source = client.download("clamp", 3, 100).await.unwrap();
    assert_eq!(source.read_to_end().await.unwrap(), b"lo");
}

#[tokio::test]
async fn application_errors_cross_the_wire_verbatim() {
    let (_store, client) = serve_memory().await;

    assert_eq!(
        client.download("ghost", 0, 1).await.unwrap_err(),
        FsError::FileNotFound
    );
    assert_eq!(
        client.list("broken[").await.unwrap_err(),
        FsError::MalformedGlob
    );
    assert_eq!(
        client.append("ghost", 9).await.unwrap_err(),
        FsError::IllegalOffset
    );
}

#[tokio::test]
async fn sized_upload_is_enforced_server_side() {
    let (store, client) = serve_memory().await;

    let mut sink = client.upload_sized("sized", 10).await.unwrap();
    sink.send(Bytes::from_static(b"abc")).await.unwrap();
    assert_eq!(
        sink.finish().await.unwrap_err(),
        FsError::UnexpectedEndOfStream
    );
    assert!(store.raw("sized").is_none());
}

#[tokio::test]
async fn upload_commit_waits_for_the_server_verdict() {
    let (_store, client) = serve_memory().await;
    remote_put(&client, "frozen", b"original").await.unwrap();

    let mut sink = client.upload("frozen").await.unwrap();
    sink.send(Bytes::from_static(b"conflict")).await.unwrap();
    assert_eq!(sink.finish().await.unwrap_err(), FsError::FileExists);
}

#[tokio::test]
async fn metadata_operations_round_trip() {
    let (_store, client) = serve_memory().await;
    remote_put(&client, "dir/a.txt", b"12345").await.unwrap();
    remote_put(&client, "dir/b.txt", b"1").await.unwrap();

    let listing = client.list("dir/*").await.unwrap();
    assert_eq!(listing.len(), 2);
    assert_eq!(listing["dir/a.txt"].size, 5);

    let info = client.info("dir/a.txt").await.unwrap().unwrap();
    assert_eq!(info.size, 5);
    assert_eq!(client.info("missing").await.unwrap(), None);

    let names: HashSet<String> = ["dir/a.txt", "missing"].iter().map(|s| s.to_string()).collect();
    let infos = client.info_all(&names).await.unwrap();
    assert_eq!(infos.len(), 1);

    client.ping().await.unwrap();
}

#[tokio::test]
async fn copy_move_delete_round_trip() {
    let (store, client) = serve_memory().await;
    remote_put(&client, "src", b"payload").await.unwrap();

    client.copy("src", "dst").await.unwrap();
    assert_eq!(store.raw("dst").unwrap(), &b"payload"[..]);

    client.move_file("dst", "moved").await.unwrap();
    assert!(store.raw("dst").is_none());
    assert_eq!(store.raw("moved").unwrap(), &b"payload"[..]);

    let mapping: HashMap<String, String> = [("moved".to_string(), "final".to_string())]
        .into_iter()
        .collect();
    client.move_all(&mapping).await.unwrap();
    assert!(store.raw("moved").is_none());
    assert_eq!(store.raw("final").unwrap(), &b"payload"[..]);

    client.delete("final").await.unwrap();
    client.delete("final").await.unwrap();
    assert_eq!(store.file_count(), 1); // only "src" remains

    let names: HashSet<String> = ["src".to_string()].into_iter().collect();
    client.delete_all(&names).await.unwrap();
    assert_eq!(store.file_count(), 0);
}

#[tokio::test]
async fn negative_ranges_are_rejected_at_the_wire() {
    let (_store, client) = serve_memory().await;
    remote_put(&client, "x", b"data").await.unwrap();

    // The typed client cannot produce negative values, craft the frame by
    // hand.
    let mut stream = tokio::net::TcpStream::connect(client.addr()).await.unwrap();
    write_message(
        &mut stream,
        &FsCommand::Download {
            name: "x".into(),
            offset: -1,
            limit: 10,
        },
    )
    .await
    .unwrap();
    match read_message::<_, FsResponse>(&mut stream).await.unwrap() {
        FsResponse::ServerError { code } => assert_eq!(code, FsError::BadRange.code()),
        other => panic!("expected ServerError, got {:?}", other),
    }
}

#[tokio::test]
async fn unreachable_server_is_a_transport_error() {
    // Bind and immediately drop to get a port that refuses connections.
    let listener = tokio::net::TcpListener::bind(loopback()).await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = RemoteFs::new(addr);
    let err = client.ping().await.unwrap_err();
    assert!(!err.is_application());
}

// ============================================================
// CLUSTER OVER TCP, END TO END
// ============================================================

#[tokio::test]
async fn cluster_replicates_across_real_tcp_partitions() {
    let mut stores = Vec::new();
    let mut directory = PartitionDirectory::new();
    for name in ["p1", "p2", "p3"] {
        let store = Arc::new(MemoryFs::new());
        let addr = spawn_server(Arc::clone(&store) as Arc<dyn FileSystem>, loopback())
            .await
            .unwrap();
        stores.push(store);
        directory = directory.with_partition(
            PartitionId::new(name),
            Arc::new(RemoteFs::new(addr)) as Arc<dyn FileSystem>,
        );
    }
    let cluster = ClusterFs::new(Arc::new(directory))
        .with_replication_count(2)
        .unwrap();

    let mut sink = cluster.upload("e2e.bin").await.unwrap();
    let payload: Vec<u8> = (0..150_000u32).map(|i| (i * 31 % 256) as u8).collect();
    for chunk in payload.chunks(8 * 1024) {
        sink.send(Bytes::copy_from_slice(chunk)).await.unwrap();
    }
    sink.finish().await.unwrap();

    let replicas = stores
        .iter()
        .filter(|store| store.raw("e2e.bin").is_some())
        .count();
    assert_eq!(replicas, 2);
    for store in &stores {
        if let Some(data) = store.raw("e2e.bin") {
            assert_eq!(data.as_ref(), payload.as_slice());
        }
    }

    let mut source = cluster.download("e2e.bin", 0, u64::MAX).await.unwrap();
    assert_eq!(source.read_to_end().await.unwrap(), payload);

    let meta = cluster.info("e2e.bin").await.unwrap().unwrap();
    assert_eq!(meta.size, payload.len() as u64);
}

#[tokio::test]
async fn cluster_over_tcp_survives_a_killed_partition() {
    let mut directory = PartitionDirectory::new();
    for name in ["p1", "p2", "p3"] {
        let store = Arc::new(MemoryFs::new());
        let addr = spawn_server(Arc::clone(&store) as Arc<dyn FileSystem>, loopback())
            .await
            .unwrap();
        directory = directory.with_partition(
            PartitionId::new(name),
            Arc::new(RemoteFs::new(addr).with_connect_timeout(std::time::Duration::from_millis(500)))
                as Arc<dyn FileSystem>,
        );
    }
    let directory = Arc::new(directory);
    let cluster = ClusterFs::new(Arc::clone(&directory))
        .with_persistence_options(2, 1, 2)
        .unwrap();

    let mut sink = cluster.upload("durable").await.unwrap();
    sink.send(Bytes::from_static(b"precious")).await.unwrap();
    sink.finish().await.unwrap();

    // Simulate one partition crashing: point its handle at a dead port.
    let dead_port = {
        let l = tokio::net::TcpListener::bind(loopback()).await.unwrap();
        let a = l.local_addr().unwrap();
        drop(l);
        a
    };
    directory.register(
        PartitionId::new("p1"),
        Arc::new(RemoteFs::new(dead_port).with_connect_timeout(std::time::Duration::from_millis(200)))
            as Arc<dyn FileSystem>,
    );

    // Reads keep working; the broken partition gets marked dead along the way.
    let mut source = cluster.download("durable", 0, u64::MAX).await.unwrap();
    assert_eq!(source.read_to_end().await.unwrap(), b"precious");
    assert_eq!(directory.dead_count(), 1);
}
