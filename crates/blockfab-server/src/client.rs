//! Per-client session: framed request loop, cached reads, uplink
//! delegation and reply assembly.
//!
//! Replies for one request are assembled in a buffer and emitted as a
//! single frame once every cached run and uplink sub-request has landed,
//! so the wire order stays the request order. All socket writes funnel
//! through one writer task per client; the session loop and any number of
//! uplink completions just queue frames.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info, trace, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use blockfab_proto::header::REQUEST_HEADER_SIZE;
use blockfab_proto::{
    Command, Payload, ReplyHeader, RequestHeader, SelectImageReply, SelectImageRequest,
    BLOCK_SIZE, PROTOCOL_VERSION,
};
use blockfab_transport::{BlockConnection, rtt_timeout, SOCKET_KEEPALIVE_TIMEOUT};

use crate::image::Image;
use crate::server::ServerContext;
use crate::uplink::{Uplink, UplinkConsumer};
use crate::ServerError;

/// Outbound frames for one client, drained by its writer task.
pub struct ClientTx {
    frames: mpsc::UnboundedSender<Vec<u8>>,
    peer: SocketAddr,
    bytes_sent: AtomicU64,
}

impl ClientTx {
    fn new(frames: mpsc::UnboundedSender<Vec<u8>>, peer: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            frames,
            peer,
            bytes_sent: AtomicU64::new(0),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    fn push(&self, frame: Vec<u8>) {
        self.bytes_sent
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        let _ = self.frames.send(frame);
    }

    fn send_reply(&self, header: ReplyHeader, payload: &[u8]) {
        match header.to_bytes() {
            Ok(mut frame) => {
                frame.extend_from_slice(payload);
                self.push(frame);
            }
            Err(e) => warn!("could not encode reply for {}: {e}", self.peer),
        }
    }

    fn send_error(&self, handle: u64) {
        self.send_reply(ReplyHeader::error(handle), &[]);
    }
}

/// Assembly state for one `GET_BLOCK` request. Cached runs are filled
/// synchronously by the session; uncached runs arrive as uplink
/// completions keyed by their destination offset in the buffer.
struct PendingRead {
    handle: u64,
    buf: Mutex<Vec<u8>>,
    outstanding: AtomicU32,
    failed: AtomicBool,
    tx: Arc<ClientTx>,
}

impl PendingRead {
    fn new(handle: u64, size: usize, tx: Arc<ClientTx>) -> Arc<Self> {
        Arc::new(Self {
            handle,
            buf: Mutex::new(vec![0u8; size]),
            // Held at one until registration is finished
            outstanding: AtomicU32::new(1),
            failed: AtomicBool::new(false),
            tx,
        })
    }

    fn add_work(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    fn finish_one(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            if self.failed.load(Ordering::Acquire) {
                self.tx.send_error(self.handle);
            } else {
                let buf = self.buf.lock().unwrap();
                let header = ReplyHeader::new(Command::GetBlock, self.handle, buf.len() as u32);
                self.tx.send_reply(header, &buf);
            }
        }
    }
}

impl UplinkConsumer for PendingRead {
    fn complete(&self, dest_offset: u64, data: &[u8]) {
        {
            let mut buf = self.buf.lock().unwrap();
            let lo = dest_offset as usize;
            let hi = (lo + data.len()).min(buf.len());
            buf[lo..hi].copy_from_slice(&data[..hi - lo]);
        }
        self.finish_one();
    }

    fn fail(&self, _dest_offset: u64) {
        self.failed.store(true, Ordering::Release);
        self.finish_one();
    }
}

/// Serves one accepted client socket until disconnect or shutdown.
pub async fn handle_connection(stream: TcpStream, peer: SocketAddr, ctx: Arc<ServerContext>) {
    if let Err(e) = session(stream, peer, &ctx).await {
        match e {
            ServerError::Io(ref io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("client {peer} disconnected")
            }
            _ => info!("client {peer} dropped: {e}"),
        }
    }
}

async fn session(stream: TcpStream, peer: SocketAddr, ctx: &Arc<ServerContext>) -> crate::Result<()> {
    let (mut rx, tx_half) = stream.into_split();
    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    let tx = ClientTx::new(frame_tx, peer);
    let writer = tokio::spawn(writer_loop(frame_rx, tx_half));

    let result = serve_requests(&mut rx, &tx, peer, ctx).await;

    drop(tx); // closes the frame channel once uplink recipients are gone
    let _ = writer.await;
    result
}

async fn writer_loop(mut frames: mpsc::UnboundedReceiver<Vec<u8>>, mut half: OwnedWriteHalf) {
    while let Some(frame) = frames.recv().await {
        match timeout(SOCKET_KEEPALIVE_TIMEOUT, half.write_all(&frame)).await {
            Ok(Ok(())) => {}
            _ => return,
        }
    }
    let _ = half.shutdown().await;
}

async fn read_request(rx: &mut OwnedReadHalf) -> crate::Result<RequestHeader> {
    let mut raw = [0u8; REQUEST_HEADER_SIZE];
    match timeout(SOCKET_KEEPALIVE_TIMEOUT, rx.read_exact(&mut raw)).await {
        Ok(Ok(_)) => Ok(RequestHeader::read_from(&raw)?),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(ServerError::protocol("client idle past keepalive timeout")),
    }
}

async fn serve_requests(
    rx: &mut OwnedReadHalf,
    tx: &Arc<ClientTx>,
    peer: SocketAddr,
    ctx: &Arc<ServerContext>,
) -> crate::Result<()> {
    // The first message must select an image
    let first = read_request(rx).await?;
    if first.command != Command::SelectImage {
        tx.send_error(first.handle);
        return Err(ServerError::protocol("first request was not SELECT_IMAGE"));
    }
    let select = read_select_payload(rx, &first).await?;
    let is_server = select.is_server;
    if select.protocol_version < blockfab_proto::MIN_SUPPORTED_PEER {
        tx.send_error(first.handle);
        return Err(ServerError::protocol(format!(
            "peer speaks version {}, minimum is {}",
            select.protocol_version,
            blockfab_proto::MIN_SUPPORTED_PEER
        )));
    }

    let image = match resolve_image(&select, ctx).await {
        Ok(image) => image,
        Err(e) => {
            tx.send_error(first.handle);
            return Err(e);
        }
    };
    image.acquire_user();
    let _guard = UserGuard(image.clone());

    let reply = SelectImageReply {
        protocol_version: PROTOCOL_VERSION,
        name: image.name().to_string(),
        rid: image.rid(),
        file_size: image.virtual_size(),
    };
    let payload = reply.serialize()?;
    tx.send_reply(
        ReplyHeader::new(Command::SelectImage, first.handle, payload.len() as u32),
        payload.as_bytes(),
    );
    debug!(
        "client {peer} attached to {}:{} (server={is_server})",
        image.name(),
        image.rid()
    );

    loop {
        let request = match read_request(rx).await {
            Ok(r) => r,
            Err(ServerError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(())
            }
            Err(e) => return Err(e),
        };
        match request.command {
            Command::GetBlock => serve_get_block(&request, &image, tx, ctx)?,
            Command::GetServers => {
                let mut payload = Vec::new();
                for entry in ctx.altservers.client_entries() {
                    payload.extend_from_slice(&entry.to_bytes()?);
                }
                tx.send_reply(
                    ReplyHeader::new(Command::GetServers, request.handle, payload.len() as u32),
                    &payload,
                );
            }
            Command::LatestRid => {
                let rid = ctx.images.latest_rid(image.name()).unwrap_or(image.rid());
                tx.send_reply(
                    ReplyHeader::new(Command::LatestRid, request.handle, 2),
                    &rid.to_le_bytes(),
                );
            }
            Command::Keepalive => {
                tx.send_reply(ReplyHeader::new(Command::Keepalive, request.handle, 0), &[]);
            }
            other => {
                warn!("client {peer} sent unexpected {other}");
                tx.send_error(request.handle);
            }
        }
    }
}

async fn read_select_payload(
    rx: &mut OwnedReadHalf,
    header: &RequestHeader,
) -> crate::Result<SelectImageRequest> {
    if header.size as usize > blockfab_proto::serializer::PAYLOAD_CAPACITY {
        return Err(ServerError::protocol("oversized handshake payload"));
    }
    let mut raw = vec![0u8; header.size as usize];
    match timeout(SOCKET_KEEPALIVE_TIMEOUT, rx.read_exact(&mut raw)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(ServerError::protocol("handshake payload timed out")),
    }
    Ok(SelectImageRequest::deserialize(&mut Payload::from_bytes(
        raw,
    ))?)
}

/// Looks the image up locally, falling back to cloning it off an alt
/// server when proxying is enabled.
async fn resolve_image(
    select: &SelectImageRequest,
    ctx: &Arc<ServerContext>,
) -> crate::Result<Arc<Image>> {
    if let Some(image) = ctx.images.get(&select.name, select.rid) {
        if !image.working() {
            return Err(ServerError::ImageNotWorking(select.name.clone()));
        }
        return Ok(image);
    }
    let allowed = ctx.config.is_proxy && (!select.is_server || ctx.config.lookup_missing_for_proxy);
    if !allowed {
        return Err(ServerError::ImageNotFound {
            name: select.name.clone(),
            rid: select.rid,
        });
    }
    lookup_remote(select, ctx).await
}

/// Forwards the `SELECT_IMAGE` to every known alt server; the first one
/// exporting the image seeds a sparse local copy with an all-zero map.
async fn lookup_remote(
    select: &SelectImageRequest,
    ctx: &Arc<ServerContext>,
) -> crate::Result<Arc<Image>> {
    for host in ctx
        .altservers
        .uplink_candidates(ctx.config.proxy_private_only)
    {
        let mut conn = match BlockConnection::connect(host, rtt_timeout(0)).await {
            Ok(c) => c,
            Err(e) => {
                debug!("lookup of {} on {host} failed: {e}", select.name);
                continue;
            }
        };
        match conn.select_image(&select.name, select.rid, true).await {
            Ok(reply) => {
                info!(
                    "cloning {}:{} ({} bytes) from {host}",
                    reply.name, reply.rid, reply.file_size
                );
                return ctx.images.create_proxied(
                    &reply.name,
                    reply.rid,
                    reply.file_size,
                    ctx.config.sparse_files,
                );
            }
            Err(e) => debug!("{host} does not export {}: {e}", select.name),
        }
    }
    Err(ServerError::ImageNotFound {
        name: select.name.clone(),
        rid: select.rid,
    })
}

/// Serves one `GET_BLOCK`: cached runs by `pread`, uncached runs through
/// the uplink, one assembled reply.
fn serve_get_block(
    request: &RequestHeader,
    image: &Arc<Image>,
    tx: &Arc<ClientTx>,
    ctx: &Arc<ServerContext>,
) -> crate::Result<()> {
    let offset = request.block_offset();
    let hops = request.hop_count();
    let handle = request.handle;

    if request.size > ctx.config.max_payload {
        tx.send_error(handle);
        return Ok(());
    }
    // Past EOF reads answer with size zero; straddling reads truncate
    if offset >= image.virtual_size() {
        tx.send_reply(ReplyHeader::new(Command::GetBlock, handle, 0), &[]);
        return Ok(());
    }
    let size = (request.size as u64).min(image.virtual_size() - offset) as usize;
    let end = offset + size as u64;

    let pending = PendingRead::new(handle, size, tx.clone());
    let map = image.cache_map();

    let mut cursor = offset;
    let mut disk_error = false;
    while cursor < end {
        let block = cursor / BLOCK_SIZE;
        let cached = match &map {
            None => true,
            Some(map) => map.get(block),
        };
        // Extend the run while the caching state stays the same
        let mut run_end = (block + 1) * BLOCK_SIZE;
        while run_end < end {
            let next_cached = match &map {
                None => true,
                Some(map) => map.get(run_end / BLOCK_SIZE),
            };
            if next_cached != cached {
                break;
            }
            run_end += BLOCK_SIZE;
        }
        let run_end = run_end.min(end);
        let dest = (cursor - offset) as usize;
        let len = (run_end - cursor) as usize;

        if cached {
            let mut buf = pending.buf.lock().unwrap();
            if let Err(e) = image.read_at(&mut buf[dest..dest + len], cursor) {
                warn!("local read on {} failed: {e}", image.name());
                disk_error = true;
                break;
            }
        } else {
            let uplink = match ensure_uplink(image, ctx) {
                Ok(u) => u,
                Err(e) => {
                    debug!("no uplink for {}: {e}", image.name());
                    disk_error = true;
                    break;
                }
            };
            pending.add_work();
            let consumer: Arc<dyn UplinkConsumer> = pending.clone();
            if let Err(e) = uplink.request(consumer, dest as u64, cursor, len as u32, hops) {
                trace!("uplink refused range of {}: {e}", image.name());
                pending.fail(dest as u64);
                // Counter balance for the refused registration is done by
                // fail(); stop splitting this request.
                break;
            }
        }
        cursor = run_end;
    }

    if disk_error {
        pending.failed.store(true, Ordering::Release);
    }
    // Release the registration hold; emits now unless uplink work remains
    pending.finish_one();
    Ok(())
}

/// Gets the image's uplink, creating it on first use. Only proxied
/// (incomplete) images ever need one.
fn ensure_uplink(image: &Arc<Image>, ctx: &Arc<ServerContext>) -> crate::Result<Arc<Uplink>> {
    if !ctx.config.is_proxy {
        return Err(ServerError::protocol("uncached range on a non-proxy"));
    }
    Ok(image.uplink_or_insert(|| Uplink::spawn(image.clone(), ctx.clone())))
}

struct UserGuard(Arc<Image>);

impl Drop for UserGuard {
    fn drop(&mut self) {
        self.0.release_user();
    }
}
