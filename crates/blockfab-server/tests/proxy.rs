//! End-to-end scenarios: a real server (optionally proxying) against a
//! scriptable mock origin, talked to over the wire.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use blockfab_proto::header::REQUEST_HEADER_SIZE;
use blockfab_proto::{
    Command, Payload, ReplyHeader, RequestHeader, SelectImageReply, SelectImageRequest,
    PROTOCOL_VERSION,
};
use blockfab_server::{BgrMode, Server, ServerConfig, ServerHandle};
use blockfab_transport::{rtt_timeout, AltServerRegistry, BlockConnection};

const IMAGE: &str = "pool/test.img";
const IMAGE_SIZE: u64 = 4 * 4096;

/// Behavior knobs for the mock origin.
#[derive(Clone, Copy, Default)]
struct OriginBehavior {
    /// Delay before answering a block request.
    block_delay: Option<Duration>,
    /// Swallow the first block request ever seen and drop that connection.
    drop_first_block: bool,
    fill: u8,
}

struct MockOrigin {
    addr: SocketAddr,
    block_requests: Arc<AtomicUsize>,
}

async fn mock_origin(behavior: OriginBehavior) -> MockOrigin {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let block_requests = Arc::new(AtomicUsize::new(0));
    let counter = block_requests.clone();
    let dropped = Arc::new(std::sync::atomic::AtomicBool::new(false));
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let counter = counter.clone();
            let dropped = dropped.clone();
            tokio::spawn(origin_conn(stream, behavior, counter, dropped));
        }
    });
    MockOrigin {
        addr,
        block_requests,
    }
}

async fn origin_conn(
    mut stream: TcpStream,
    behavior: OriginBehavior,
    counter: Arc<AtomicUsize>,
    dropped: Arc<std::sync::atomic::AtomicBool>,
) {
    loop {
        let mut raw = [0u8; REQUEST_HEADER_SIZE];
        if stream.read_exact(&mut raw).await.is_err() {
            return;
        }
        let Ok(header) = RequestHeader::read_from(&raw) else {
            return;
        };
        match header.command {
            Command::SelectImage => {
                let mut payload = vec![0u8; header.size as usize];
                if stream.read_exact(&mut payload).await.is_err() {
                    return;
                }
                let request =
                    SelectImageRequest::deserialize(&mut Payload::from_bytes(payload)).unwrap();
                let reply = SelectImageReply {
                    protocol_version: PROTOCOL_VERSION,
                    name: request.name,
                    rid: if request.rid == 0 { 1 } else { request.rid },
                    file_size: IMAGE_SIZE,
                };
                let body = reply.serialize().unwrap();
                let mut frame =
                    ReplyHeader::new(Command::SelectImage, header.handle, body.len() as u32)
                        .to_bytes()
                        .unwrap();
                frame.extend_from_slice(body.as_bytes());
                if stream.write_all(&frame).await.is_err() {
                    return;
                }
            }
            Command::GetBlock => {
                counter.fetch_add(1, Ordering::SeqCst);
                if behavior.drop_first_block
                    && !dropped.swap(true, Ordering::SeqCst)
                {
                    // Hold the request in flight, then kill the socket
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    return;
                }
                if let Some(delay) = behavior.block_delay {
                    tokio::time::sleep(delay).await;
                }
                let mut frame =
                    ReplyHeader::new(Command::GetBlock, header.handle, header.size)
                        .to_bytes()
                        .unwrap();
                frame.extend_from_slice(&vec![behavior.fill; header.size as usize]);
                if stream.write_all(&frame).await.is_err() {
                    return;
                }
            }
            Command::GetServers => {
                let frame = ReplyHeader::new(Command::GetServers, header.handle, 0)
                    .to_bytes()
                    .unwrap();
                if stream.write_all(&frame).await.is_err() {
                    return;
                }
            }
            Command::Keepalive => {
                let frame = ReplyHeader::new(Command::Keepalive, header.handle, 0)
                    .to_bytes()
                    .unwrap();
                if stream.write_all(&frame).await.is_err() {
                    return;
                }
            }
            _ => {}
        }
    }
}

async fn proxy_with_origins(origins: &[SocketAddr]) -> (ServerHandle, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(AltServerRegistry::new());
    for &origin in origins {
        registry.add(origin, "origin", false, false);
    }
    let config = ServerConfig {
        base_path: dir.path().to_path_buf(),
        is_proxy: true,
        lookup_missing_for_proxy: true,
        sparse_files: true,
        background_replication: BgrMode::Disabled,
        ..Default::default()
    };
    let handle = Server::bind(config, registry, "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    (handle, dir)
}

async fn attach(addr: SocketAddr) -> BlockConnection {
    let mut conn = BlockConnection::connect(addr, rtt_timeout(0)).await.unwrap();
    conn.select_image(IMAGE, 0, false).await.unwrap();
    conn
}

async fn get_block(conn: &mut BlockConnection, handle: u64, offset: u64, size: u32) -> Vec<u8> {
    conn.send_request(&RequestHeader::get_block(handle, offset, size), None)
        .await
        .unwrap();
    let reply = conn.read_reply().await.unwrap();
    assert_eq!(reply.command, Command::GetBlock);
    assert_eq!(reply.handle, handle);
    let mut data = vec![0u8; reply.size as usize];
    conn.read_payload(&mut data).await.unwrap();
    data
}

#[tokio::test(flavor = "multi_thread")]
async fn cold_proxy_fetch_then_serve_from_cache() {
    let origin = mock_origin(OriginBehavior {
        fill: 0xaa,
        ..Default::default()
    })
    .await;
    let (proxy, dir) = proxy_with_origins(&[origin.addr]).await;

    let mut client = attach(proxy.local_addr).await;
    let data = get_block(&mut client, 7, 0, 4096).await;
    assert_eq!(data, vec![0xaa; 4096]);

    // Give the uplink a moment to persist the cache map
    tokio::time::sleep(Duration::from_millis(200)).await;
    let fetches_after_first = origin.block_requests.load(Ordering::SeqCst);
    assert!(fetches_after_first >= 1);

    // Cache file holds the payload, map bit zero is set
    let image_path = dir.path().join(format!("{IMAGE}.r1"));
    let cached = std::fs::read(&image_path).unwrap();
    assert_eq!(&cached[..4096], &vec![0xaa; 4096][..]);
    let map_path = dir.path().join(format!("{IMAGE}.r1.map"));
    let map = std::fs::read(&map_path).unwrap();
    assert_eq!(map[0] & 1, 1);

    // A second client reading the same range never reaches the origin
    let mut second = attach(proxy.local_addr).await;
    let data = get_block(&mut second, 8, 0, 4096).await;
    assert_eq!(data, vec![0xaa; 4096]);
    assert_eq!(
        origin.block_requests.load(Ordering::SeqCst),
        fetches_after_first
    );

    proxy.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_identical_requests_deduplicate_upstream() {
    let origin = mock_origin(OriginBehavior {
        fill: 0x5c,
        block_delay: Some(Duration::from_millis(250)),
        ..Default::default()
    })
    .await;
    let (proxy, _dir) = proxy_with_origins(&[origin.addr]).await;

    // Attach everyone first so the sixteen reads land almost at once
    let mut conns = Vec::new();
    for _ in 0..16 {
        conns.push(attach(proxy.local_addr).await);
    }
    let mut tasks = Vec::new();
    for (i, mut conn) in conns.into_iter().enumerate() {
        tasks.push(tokio::spawn(async move {
            get_block(&mut conn, 0x100 + i as u64, 4096, 4096).await
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), vec![0x5c; 4096]);
    }
    // All sixteen clients were served by a single upstream fetch
    assert_eq!(origin.block_requests.load(Ordering::SeqCst), 1);

    proxy.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn failover_completes_inflight_request_exactly_once() {
    let flaky = mock_origin(OriginBehavior {
        fill: 0x11,
        drop_first_block: true,
        ..Default::default()
    })
    .await;
    let healthy = mock_origin(OriginBehavior {
        fill: 0x11,
        ..Default::default()
    })
    .await;
    let (proxy, _dir) = proxy_with_origins(&[flaky.addr, healthy.addr]).await;

    // The first upstream fetch is swallowed and its socket killed; the
    // reissued request must complete on a fresh connection with the
    // client's original handle
    let mut client = attach(proxy.local_addr).await;
    let data = get_block(&mut client, 0x42, 0, 4096).await;
    assert_eq!(data, vec![0x11; 4096]);

    // One fetch died, one succeeded somewhere
    let total = flaky.block_requests.load(Ordering::SeqCst)
        + healthy.block_requests.load(Ordering::SeqCst);
    assert!(total >= 2, "expected a reissued upstream fetch, saw {total}");

    // No duplicate reply follows
    let extra =
        tokio::time::timeout(Duration::from_millis(300), conn_read_reply(&mut client)).await;
    assert!(extra.is_err(), "spurious second reply after failover");

    proxy.shutdown().await;
}

async fn conn_read_reply(conn: &mut BlockConnection) {
    let _ = conn.read_reply().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn reads_truncate_at_eof_and_empty_past_eof() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("pool")).unwrap();
    std::fs::write(dir.path().join(format!("{IMAGE}.r1")), vec![3u8; IMAGE_SIZE as usize])
        .unwrap();
    let config = ServerConfig {
        base_path: dir.path().to_path_buf(),
        ..Default::default()
    };
    let server = Server::bind(
        config,
        Arc::new(AltServerRegistry::new()),
        "127.0.0.1:0".parse().unwrap(),
    )
    .await
    .unwrap();

    let mut client = attach(server.local_addr).await;

    // Straddles the last byte: truncated
    let data = get_block(&mut client, 1, IMAGE_SIZE - 4096, 8192).await;
    assert_eq!(data.len(), 4096);

    // Fully past EOF: size 0
    let data = get_block(&mut client, 2, IMAGE_SIZE, 4096).await;
    assert!(data.is_empty());

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn corrupt_crc_master_rejects_image_but_not_others() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("pool")).unwrap();
    let bad = dir.path().join(format!("{IMAGE}.r1"));
    std::fs::write(&bad, vec![9u8; IMAGE_SIZE as usize]).unwrap();
    let list = blockfab_server::CrcList::generate(&bad).unwrap();
    let crc_path = dir.path().join(format!("{IMAGE}.r1.crc"));
    list.save(&crc_path).unwrap();
    // Corrupt the master checksum
    let mut raw = std::fs::read(&crc_path).unwrap();
    raw[0] ^= 0xff;
    std::fs::write(&crc_path, raw).unwrap();

    std::fs::write(dir.path().join("ok.r2"), vec![1u8; 4096]).unwrap();

    let server = Server::bind(
        ServerConfig {
            base_path: dir.path().to_path_buf(),
            ..Default::default()
        },
        Arc::new(AltServerRegistry::new()),
        "127.0.0.1:0".parse().unwrap(),
    )
    .await
    .unwrap();

    // The corrupt image refuses to open
    let mut conn = BlockConnection::connect(server.local_addr, rtt_timeout(0))
        .await
        .unwrap();
    assert!(conn.select_image(IMAGE, 0, false).await.is_err());

    // The healthy one still serves
    let mut conn = BlockConnection::connect(server.local_addr, rtt_timeout(0))
        .await
        .unwrap();
    conn.select_image("ok", 2, false).await.unwrap();

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn latest_rid_and_keepalive() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("img.r1"), vec![0u8; 4096]).unwrap();
    std::fs::write(dir.path().join("img.r5"), vec![0u8; 4096]).unwrap();

    let server = Server::bind(
        ServerConfig {
            base_path: dir.path().to_path_buf(),
            ..Default::default()
        },
        Arc::new(AltServerRegistry::new()),
        "127.0.0.1:0".parse().unwrap(),
    )
    .await
    .unwrap();

    let mut conn = BlockConnection::connect(server.local_addr, rtt_timeout(0))
        .await
        .unwrap();
    let reply = conn.select_image("img", 1, false).await.unwrap();
    assert_eq!(reply.rid, 1);

    conn.send_request(
        &RequestHeader::with_payload(Command::LatestRid, 9, 0),
        None,
    )
    .await
    .unwrap();
    let header = conn.read_reply().await.unwrap();
    assert_eq!(header.command, Command::LatestRid);
    let mut raw = [0u8; 2];
    conn.read_payload(&mut raw).await.unwrap();
    assert_eq!(u16::from_le_bytes(raw), 5);

    conn.send_request(
        &RequestHeader::with_payload(Command::Keepalive, 10, 0),
        None,
    )
    .await
    .unwrap();
    let header = conn.read_reply().await.unwrap();
    assert_eq!(header.command, Command::Keepalive);
    assert_eq!(header.size, 0);

    server.shutdown().await;
}
