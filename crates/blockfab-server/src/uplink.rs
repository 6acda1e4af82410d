//! Per-image uplink engine.
//!
//! A proxied image has exactly one upstream connection through which every
//! client `GET_BLOCK` is multiplexed. The fixed-capacity slot queue is the
//! deduplication primitive: a request whose range is covered by a slot in
//! NEW or PENDING state attaches to it instead of spawning a second
//! upstream fetch. The uplink task is also the consumer of the discovery
//! engine, so connection handover never races a reconnect.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use blockfab_proto::peer::PEER_ENTRY_SIZE;
use blockfab_proto::{
    align_down, align_up, Command, PeerEntry, RequestHeader, BLOCK_SIZE, HASH_BLOCK_SIZE,
};
use blockfab_transport::{
    ConnReader, ConnWriter, CurrentPeer, CycleOutcome, Discovery, HungWatch, ImageIdentity,
    ProbeSchedule, KEEPALIVE_INTERVAL, PROBE_COUNT_TIMEOUT, SOCKET_KEEPALIVE_TIMEOUT,
};

use crate::config::BgrMode;
use crate::image::Image;
use crate::server::ServerContext;
use crate::ServerError;

/// Capacity of the uplink request queue.
pub const SERVER_MAX_UPLINK_QUEUE: usize = 128;

/// Requests that crossed more proxies than this are refused.
pub const MAX_HOPS: u8 = 8;

/// Upper bound for one background replication fetch.
const REPLICATION_RUN_BYTES: u64 = 512 * 1024;

/// Seconds without clients or queued work before the uplink closes itself.
const UPLINK_IDLE_CLOSE: u64 = 60;

/// Receiver of uplink completions. Client sessions implement this to
/// assemble their replies; the uplink never touches a client socket
/// directly.
pub trait UplinkConsumer: Send + Sync {
    /// Payload for the sub-request registered under `handle` has arrived.
    fn complete(&self, handle: u64, data: &[u8]);
    /// The sub-request cannot be served.
    fn fail(&self, handle: u64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotStatus {
    Free,
    New,
    Pending,
    Processing,
}

struct Recipient {
    consumer: Arc<dyn UplinkConsumer>,
    handle: u64,
    start: u64,
    length: u32,
}

struct Slot {
    status: SlotStatus,
    from: u64,
    to: u64,
    hops: u8,
    replication: bool,
    recipients: Vec<Recipient>,
}

impl Slot {
    fn empty() -> Self {
        Slot {
            status: SlotStatus::Free,
            from: 0,
            to: 0,
            hops: 0,
            replication: false,
            recipients: Vec::new(),
        }
    }
}

/// Events forwarded from the receiver task to the uplink task. Tagged with
/// a generation so frames from a torn-down connection are discarded.
enum ReplyEvent {
    Block { handle: u64, data: Vec<u8> },
    Servers(Vec<PeerEntry>),
    SlotError(u64),
    Keepalive,
    ConnectionLost(String),
}

pub struct Uplink {
    image: Arc<Image>,
    queue: Mutex<Vec<Slot>>,
    signal: Notify,
    shutdown: AtomicBool,
    bytes_received: AtomicU64,
    current_peer: Mutex<Option<SocketAddr>>,
    current_rtt: AtomicU64,
}

impl Uplink {
    /// Creates the uplink and starts its task. The uplink owns a strong
    /// reference to the image; the image only keeps a weak back-pointer
    /// (published by the caller via [`Image::set_uplink`]).
    pub fn spawn(image: Arc<Image>, ctx: Arc<ServerContext>) -> Arc<Uplink> {
        let uplink = Arc::new(Uplink {
            image,
            queue: Mutex::new((0..SERVER_MAX_UPLINK_QUEUE).map(|_| Slot::empty()).collect()),
            signal: Notify::new(),
            shutdown: AtomicBool::new(false),
            bytes_received: AtomicU64::new(0),
            current_peer: Mutex::new(None),
            current_rtt: AtomicU64::new(0),
        });
        tokio::spawn(run(uplink.clone(), ctx));
        uplink
    }

    /// Queues a range fetch. Ranges are aligned outward to 4 KiB; a covered
    /// range hops onto the existing slot. Fails when the hop ceiling is
    /// exceeded or no slot is free.
    pub fn request(
        &self,
        consumer: Arc<dyn UplinkConsumer>,
        handle: u64,
        start: u64,
        length: u32,
        hops: u8,
    ) -> crate::Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(ServerError::UplinkQueueFull);
        }
        if hops > MAX_HOPS {
            return Err(ServerError::HopLimit);
        }
        let from = align_down(start);
        let to = align_up(start + length as u64);
        let recipient = Recipient {
            consumer,
            handle,
            start,
            length,
        };

        let mut queue = self.queue.lock().unwrap();
        for slot in queue.iter_mut() {
            if matches!(slot.status, SlotStatus::New | SlotStatus::Pending)
                && slot.from <= from
                && slot.to >= to
            {
                trace!(
                    "hop on: [{from}, {to}) rides [{}, {}) of {}",
                    slot.from,
                    slot.to,
                    self.image.name()
                );
                slot.recipients.push(recipient);
                return Ok(());
            }
        }
        let Some(slot) = queue.iter_mut().find(|s| s.status == SlotStatus::Free) else {
            return Err(ServerError::UplinkQueueFull);
        };
        *slot = Slot {
            status: SlotStatus::New,
            from,
            to,
            hops,
            replication: false,
            recipients: vec![recipient],
        };
        drop(queue);
        self.signal.notify_one();
        Ok(())
    }

    /// Signals the task to stop; pending clients get failure callbacks.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.signal.notify_one();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn current_peer(&self) -> Option<SocketAddr> {
        *self.current_peer.lock().unwrap()
    }

    pub fn current_rtt_us(&self) -> u64 {
        self.current_rtt.load(Ordering::Relaxed)
    }

    pub fn queue_len(&self) -> usize {
        self.queue
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.status != SlotStatus::Free)
            .count()
    }

    /// Handle of the oldest in-flight request, for hung detection.
    fn pending_head(&self) -> Option<u64> {
        self.queue
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.status == SlotStatus::Pending)
            .map(|s| s.from)
    }

    /// Fails every queued request and frees all slots.
    fn drain_queue(&self) {
        let recipients: Vec<Recipient> = {
            let mut queue = self.queue.lock().unwrap();
            queue
                .iter_mut()
                .filter(|s| s.status != SlotStatus::Free)
                .flat_map(|s| {
                    s.status = SlotStatus::Free;
                    std::mem::take(&mut s.recipients)
                })
                .collect()
        };
        for r in &recipients {
            r.consumer.fail(r.handle);
        }
    }
}

/// Live connection state of the uplink task.
struct Wire {
    writer: ConnWriter,
    reader_task: JoinHandle<()>,
    peer: CurrentPeer,
}

impl Wire {
    fn teardown(self) {
        self.reader_task.abort();
    }
}

async fn run(uplink: Arc<Uplink>, ctx: Arc<ServerContext>) {
    let image = uplink.image.clone();
    info!("uplink for {}:{} starting", image.name(), image.rid());

    let identity = ImageIdentity {
        name: image.name().to_string(),
        rid: image.rid(),
        file_size: image.virtual_size(),
    };
    let mut discovery = Discovery::new(
        ctx.altservers.clone(),
        identity,
        true,
        ctx.config.proxy_private_only,
    );
    let mut schedule = ProbeSchedule::new();
    let mut hung_watch = HungWatch::default();
    let (event_tx, mut event_rx) = mpsc::channel::<(u64, ReplyEvent)>(32);

    let mut wire: Option<Wire> = None;
    let mut generation: u64 = 0;
    let mut panic_mode = true;
    let mut idle = Duration::ZERO;
    let mut no_client_ticks: u64 = 0;
    let mut replication_index: u64 = 0;
    let mut replication_slot: Option<usize> = None;
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    // Attach to the best available peer before serving anything
    if let CycleOutcome::Switch(better) = discovery.probe_cycle(None, true, true, false).await {
        wire = Some(adopt(&uplink, better, &mut generation, &event_tx, &ctx).await);
        panic_mode = false;
    }

    loop {
        if uplink.is_shut_down() {
            break;
        }
        // Any socket-level trouble funnels into one failover at the bottom
        // of the iteration, so handover never races another reconnect.
        let mut lost = false;
        tokio::select! {
            _ = uplink.signal.notified() => {
                if uplink.is_shut_down() {
                    break;
                }
                if let Some(w) = wire.as_mut() {
                    if flush_new_requests(&uplink, w).await.is_err() {
                        lost = true;
                    } else {
                        idle = Duration::ZERO;
                    }
                }
            }
            Some((tag, event)) = event_rx.recv() => {
                if tag == generation {
                    idle = Duration::ZERO;
                    match event {
                        ReplyEvent::Block { handle, data } => {
                            if let Err(e) =
                                deliver_block(&uplink, &ctx, handle, data, &mut replication_slot)
                            {
                                warn!("uplink of {} lost framing: {e}", image.name());
                                lost = true;
                            }
                        }
                        ReplyEvent::Servers(entries) => {
                            ctx.altservers.merge_wire_entries(&entries);
                        }
                        ReplyEvent::SlotError(handle) => {
                            fail_slot(&uplink, handle, &mut replication_slot);
                        }
                        ReplyEvent::Keepalive => {}
                        ReplyEvent::ConnectionLost(reason) => {
                            warn!("uplink of {} lost connection: {reason}", image.name());
                            lost = true;
                        }
                    }
                }
            }
            _ = tick.tick() => {
                // An uplink nobody uses does not need to stay connected
                if image.user_count() == 0 && uplink.queue_len() == 0 {
                    no_client_ticks += 1;
                    if no_client_ticks >= UPLINK_IDLE_CLOSE {
                        info!(
                            "uplink for {}:{} idle with no clients, closing",
                            image.name(),
                            image.rid()
                        );
                        break;
                    }
                } else {
                    no_client_ticks = 0;
                }

                idle += Duration::from_secs(1);
                if wire.is_some() && idle >= KEEPALIVE_INTERVAL {
                    idle = Duration::ZERO;
                    let keepalive = RequestHeader::with_payload(Command::Keepalive, 0, 0);
                    if let Some(w) = wire.as_mut() {
                        if w.writer.send_request(&keepalive, None).await.is_err() {
                            lost = true;
                        }
                    }
                }

                if !lost && schedule.tick(panic_mode) {
                    let hung = hung_watch.observe(uplink.pending_head());
                    let current = wire.as_ref().map(|w| w.peer);
                    let outcome = discovery
                        .probe_cycle(current.as_ref(), panic_mode, schedule.in_startup(), hung)
                        .await;
                    match outcome {
                        CycleOutcome::Switch(better) => {
                            if let Some(old) = wire.take() {
                                old.teardown();
                            }
                            let mut fresh =
                                adopt(&uplink, better, &mut generation, &event_tx, &ctx).await;
                            // Reissue everything that was in flight
                            requeue_pending(&uplink);
                            if flush_new_requests(&uplink, &mut fresh).await.is_err() {
                                fresh.teardown();
                                lost = true;
                            } else {
                                wire = Some(fresh);
                                panic_mode = false;
                            }
                        }
                        CycleOutcome::Stay => {}
                        CycleOutcome::Unreachable => {
                            if wire.is_none() {
                                panic_mode = true;
                                if discovery.panic_count() == PROBE_COUNT_TIMEOUT {
                                    error!(
                                        "{}:{}: no upstream reachable for {PROBE_COUNT_TIMEOUT} cycles, failing queued requests",
                                        image.name(), image.rid()
                                    );
                                    replication_slot = None;
                                    uplink.drain_queue();
                                }
                            }
                        }
                    }
                }

                if !lost && !panic_mode && wire.is_some() && replication_slot.is_none() {
                    replication_slot =
                        maybe_replicate(&uplink, &ctx, &mut replication_index);
                    if replication_slot.is_some() {
                        uplink.signal.notify_one();
                    }
                }
            }
        }
        if lost {
            wire = fail_over(
                &uplink,
                &ctx,
                &mut discovery,
                wire.take(),
                &mut generation,
                &event_tx,
            )
            .await;
            panic_mode = wire.is_none();
        }
    }

    // Ordered teardown: answer every still-pending client, then drop the
    // socket and clear the image's back-reference.
    uplink.shutdown.store(true, Ordering::Release);
    uplink.drain_queue();
    if let Some(w) = wire.take() {
        w.teardown();
    }
    image.clear_uplink();
    info!("uplink for {}:{} stopped", image.name(), image.rid());
}

/// Promotes a probed connection to the live uplink socket and spawns its
/// receiver. The in-flight queue is intentionally left alone.
async fn adopt(
    uplink: &Arc<Uplink>,
    better: blockfab_transport::BetterPeer,
    generation: &mut u64,
    event_tx: &mpsc::Sender<(u64, ReplyEvent)>,
    ctx: &Arc<ServerContext>,
) -> Wire {
    *generation += 1;
    let tag = *generation;
    let peer = CurrentPeer {
        addr: better.addr,
        rtt_us: better.rtt_us,
    };
    *uplink.current_peer.lock().unwrap() = Some(better.addr);
    uplink.current_rtt.store(better.rtt_us, Ordering::Relaxed);
    info!(
        "uplink of {} now connected to {} (proto v{})",
        uplink.image.name(),
        better.addr,
        better.protocol_version
    );

    let (reader, mut writer) = better.conn.into_split();
    // Learn the upstream's alt servers right away
    let ask = RequestHeader::with_payload(Command::GetServers, 0, 0);
    if let Err(e) = writer.send_request(&ask, None).await {
        debug!("could not request alt servers from {}: {e}", better.addr);
    }
    let reader_task = tokio::spawn(receive_loop(
        reader,
        event_tx.clone(),
        tag,
        ctx.config.max_payload,
    ));
    Wire {
        writer,
        reader_task,
        peer,
    }
}

/// Runs a panic-style probe cycle right after losing the socket. Pending
/// slots go back to NEW so the replacement connection reissues them.
async fn fail_over(
    uplink: &Arc<Uplink>,
    ctx: &Arc<ServerContext>,
    discovery: &mut Discovery,
    wire: Option<Wire>,
    generation: &mut u64,
    event_tx: &mpsc::Sender<(u64, ReplyEvent)>,
) -> Option<Wire> {
    if let Some(old) = wire {
        old.teardown();
    }
    *uplink.current_peer.lock().unwrap() = None;
    requeue_pending(uplink);

    match discovery.probe_cycle(None, true, false, false).await {
        CycleOutcome::Switch(better) => {
            let mut wire = adopt(uplink, better, generation, event_tx, ctx).await;
            if flush_new_requests(uplink, &mut wire).await.is_err() {
                wire.teardown();
                return None;
            }
            Some(wire)
        }
        _ => None,
    }
}

/// Returns every PENDING slot to NEW. Part of the single atomic
/// reassignment that accompanies a failover.
fn requeue_pending(uplink: &Arc<Uplink>) {
    let mut queue = uplink.queue.lock().unwrap();
    for slot in queue.iter_mut() {
        if slot.status == SlotStatus::Pending {
            slot.status = SlotStatus::New;
        }
    }
}

/// Emits a `GET_BLOCK` for every NEW slot, using the slot index as the
/// upstream handle, and advances them to PENDING.
async fn flush_new_requests(uplink: &Arc<Uplink>, wire: &mut Wire) -> crate::Result<()> {
    loop {
        let next = {
            let queue = uplink.queue.lock().unwrap();
            queue
                .iter()
                .enumerate()
                .find(|(_, s)| s.status == SlotStatus::New)
                .map(|(i, s)| (i, s.from, s.to, s.hops))
        };
        let Some((idx, from, to, hops)) = next else {
            return Ok(());
        };
        let header =
            RequestHeader::get_block_hops(idx as u64, from, (to - from) as u32, hops.saturating_add(1));
        wire.writer.send_request(&header, None).await?;
        let mut queue = uplink.queue.lock().unwrap();
        if queue[idx].status == SlotStatus::New {
            queue[idx].status = SlotStatus::Pending;
        }
    }
}

/// Streams replies off the upstream socket and forwards them as events.
async fn receive_loop(
    mut reader: ConnReader,
    event_tx: mpsc::Sender<(u64, ReplyEvent)>,
    generation: u64,
    max_payload: u32,
) {
    loop {
        let event = match read_one(&mut reader, max_payload).await {
            Ok(event) => event,
            Err(e) => ReplyEvent::ConnectionLost(e.to_string()),
        };
        let last = matches!(event, ReplyEvent::ConnectionLost(_));
        if event_tx.send((generation, event)).await.is_err() || last {
            return;
        }
    }
}

async fn read_one(
    reader: &mut ConnReader,
    max_payload: u32,
) -> blockfab_transport::Result<ReplyEvent> {
    use blockfab_transport::TransportError;

    let header = reader.read_reply(SOCKET_KEEPALIVE_TIMEOUT).await?;
    match header.command {
        Command::GetBlock => {
            if header.size == 0 || header.size > max_payload {
                return Err(TransportError::protocol(format!(
                    "implausible block reply of {} bytes",
                    header.size
                )));
            }
            let mut data = vec![0u8; header.size as usize];
            reader
                .read_payload(&mut data, SOCKET_KEEPALIVE_TIMEOUT)
                .await?;
            Ok(ReplyEvent::Block {
                handle: header.handle,
                data,
            })
        }
        Command::GetServers => {
            let mut raw = vec![0u8; header.size as usize];
            reader
                .read_payload(&mut raw, SOCKET_KEEPALIVE_TIMEOUT)
                .await?;
            let entries = raw
                .chunks_exact(PEER_ENTRY_SIZE)
                .filter_map(|c| PeerEntry::read_from(c).ok())
                .collect();
            Ok(ReplyEvent::Servers(entries))
        }
        Command::Keepalive => Ok(ReplyEvent::Keepalive),
        Command::Error => Ok(ReplyEvent::SlotError(header.handle)),
        other => Err(TransportError::protocol(format!(
            "unexpected {other} on uplink"
        ))),
    }
}

/// Routes one block reply: cache write, map update, forwarding to every
/// attached client, chunk verification, slot release. A reply that matches
/// no slot is a framing error and kills the connection.
fn deliver_block(
    uplink: &Arc<Uplink>,
    ctx: &Arc<ServerContext>,
    handle: u64,
    data: Vec<u8>,
    replication_slot: &mut Option<usize>,
) -> crate::Result<()> {
    let idx = handle as usize;
    let (from, to, recipients, was_replication) = {
        let mut queue = uplink.queue.lock().unwrap();
        let slot = queue
            .get_mut(idx)
            .filter(|s| s.status == SlotStatus::Pending)
            .ok_or_else(|| ServerError::protocol("reply for unknown slot"))?;
        if (slot.to - slot.from) as usize != data.len() {
            return Err(ServerError::protocol("reply size does not match slot"));
        }
        slot.status = SlotStatus::Processing;
        (
            slot.from,
            slot.to,
            std::mem::take(&mut slot.recipients),
            slot.replication,
        )
    };

    uplink
        .bytes_received
        .fetch_add(data.len() as u64, Ordering::Relaxed);

    // A failed cache write leaves the bits clear; clients still get their
    // bytes from memory.
    if let Err(e) = uplink.image.write_cache(from, &data) {
        warn!("cache write for {} failed: {e}", uplink.image.name());
    } else {
        queue_chunk_verification(uplink, ctx, from, to);
    }

    for r in &recipients {
        let lo = (r.start - from) as usize;
        let hi = lo + r.length as usize;
        r.consumer.complete(r.handle, &data[lo..hi]);
    }

    let mut queue = uplink.queue.lock().unwrap();
    queue[idx] = Slot::empty();
    if was_replication {
        *replication_slot = None;
    }
    Ok(())
}

fn fail_slot(uplink: &Arc<Uplink>, handle: u64, replication_slot: &mut Option<usize>) {
    let idx = handle as usize;
    let (recipients, was_replication) = {
        let mut queue = uplink.queue.lock().unwrap();
        let Some(slot) = queue
            .get_mut(idx)
            .filter(|s| s.status != SlotStatus::Free)
        else {
            return;
        };
        let recipients = std::mem::take(&mut slot.recipients);
        let was_replication = slot.replication;
        *slot = Slot::empty();
        (recipients, was_replication)
    };
    debug!(
        "upstream refused slot {idx} of {} ({} waiting)",
        uplink.image.name(),
        recipients.len()
    );
    for r in &recipients {
        r.consumer.fail(r.handle);
    }
    if was_replication {
        *replication_slot = None;
    }
}

/// Queues integrity checks for every 16 MiB chunk that the finished range
/// completed.
fn queue_chunk_verification(uplink: &Arc<Uplink>, ctx: &Arc<ServerContext>, from: u64, to: u64) {
    if uplink.image.crc().is_none() {
        return;
    }
    let Some(map) = uplink.image.cache_map() else {
        return;
    };
    let blocks_per_chunk = HASH_BLOCK_SIZE / BLOCK_SIZE;
    let total_blocks = map.block_count();
    for chunk in from / HASH_BLOCK_SIZE..=(to - 1) / HASH_BLOCK_SIZE {
        let first = chunk * blocks_per_chunk;
        let end = (first + blocks_per_chunk).min(total_blocks);
        if map.range_set(first, end) {
            ctx.integrity.queue(uplink.image.clone(), chunk);
        }
    }
}

/// Picks the next run of missing blocks for background replication and
/// reserves a slot for it. Returns the slot index, or None when
/// replication is off, gated, done, or would overlap in-flight work.
fn maybe_replicate(
    uplink: &Arc<Uplink>,
    ctx: &Arc<ServerContext>,
    replication_index: &mut u64,
) -> Option<usize> {
    let image = &uplink.image;
    let cfg = &ctx.config;
    if cfg.background_replication == BgrMode::Disabled
        || image.user_count() < cfg.bgr_min_clients
        || image.virtual_size() > cfg.max_replication_size
    {
        return None;
    }
    let map = image.cache_map()?;

    let start_block = match map.first_clear_from(*replication_index) {
        Some(b) => b,
        None => map.first_clear_from(0)?,
    };

    // Run length: stop at the first cached block and the size cap; in
    // hashblock mode also at the chunk border so chunks finish in order.
    let cap_blocks = (REPLICATION_RUN_BYTES.min(cfg.max_payload as u64)) / BLOCK_SIZE;
    let mut end_block = start_block;
    let limit = match cfg.background_replication {
        BgrMode::HashBlock => {
            let chunk_end =
                (start_block * BLOCK_SIZE / HASH_BLOCK_SIZE + 1) * (HASH_BLOCK_SIZE / BLOCK_SIZE);
            chunk_end.min(map.block_count())
        }
        _ => map.block_count(),
    };
    while end_block < limit && end_block - start_block < cap_blocks && !map.get(end_block) {
        end_block += 1;
    }
    let (from, to) = (start_block * BLOCK_SIZE, end_block * BLOCK_SIZE);

    let mut queue = uplink.queue.lock().unwrap();
    let overlaps = queue
        .iter()
        .any(|s| s.status != SlotStatus::Free && s.from < to && from < s.to);
    if overlaps {
        return None;
    }
    let idx = queue.iter().position(|s| s.status == SlotStatus::Free)?;
    queue[idx] = Slot {
        status: SlotStatus::New,
        from,
        to,
        hops: 0,
        replication: true,
        recipients: Vec::new(),
    };
    *replication_index = end_block;
    trace!(
        "replication slot {idx} covers [{from}, {to}) of {}",
        image.name()
    );
    Some(idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingConsumer {
        completions: AtomicU64,
        failures: AtomicU64,
    }

    impl CountingConsumer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                completions: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            })
        }
    }

    impl UplinkConsumer for CountingConsumer {
        fn complete(&self, _handle: u64, _data: &[u8]) {
            self.completions.fetch_add(1, Ordering::Relaxed);
        }
        fn fail(&self, _handle: u64) {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn bare_uplink() -> Arc<Uplink> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("u.r1");
        let image = Image::create(&path, "u", 1, 1 << 20, true).unwrap();
        Arc::new(Uplink {
            image,
            queue: Mutex::new((0..SERVER_MAX_UPLINK_QUEUE).map(|_| Slot::empty()).collect()),
            signal: Notify::new(),
            shutdown: AtomicBool::new(false),
            bytes_received: AtomicU64::new(0),
            current_peer: Mutex::new(None),
            current_rtt: AtomicU64::new(0),
        })
    }

    #[test]
    fn covered_request_hops_on() {
        let uplink = bare_uplink();
        let consumer = CountingConsumer::new();
        uplink
            .request(consumer.clone(), 1, 0, 16384, 0)
            .unwrap();
        uplink
            .request(consumer.clone(), 2, 4096, 4096, 0)
            .unwrap();
        // Both share the one slot
        assert_eq!(uplink.queue_len(), 1);
        let queue = uplink.queue.lock().unwrap();
        assert_eq!(queue[0].recipients.len(), 2);
    }

    #[test]
    fn uncovered_request_takes_a_new_slot() {
        let uplink = bare_uplink();
        let consumer = CountingConsumer::new();
        uplink.request(consumer.clone(), 1, 0, 4096, 0).unwrap();
        uplink
            .request(consumer.clone(), 2, 8192, 4096, 0)
            .unwrap();
        assert_eq!(uplink.queue_len(), 2);
    }

    #[test]
    fn queue_full_rejects_the_overflow_request() {
        let uplink = bare_uplink();
        let consumer = CountingConsumer::new();
        for i in 0..SERVER_MAX_UPLINK_QUEUE as u64 {
            uplink
                .request(consumer.clone(), i, i * 4096, 4096, 0)
                .unwrap();
        }
        let overflow = uplink.request(
            consumer.clone(),
            999,
            SERVER_MAX_UPLINK_QUEUE as u64 * 4096,
            4096,
            0,
        );
        assert!(matches!(overflow, Err(ServerError::UplinkQueueFull)));
    }

    #[test]
    fn hop_ceiling_is_enforced_on_enqueue() {
        let uplink = bare_uplink();
        let consumer = CountingConsumer::new();
        assert!(matches!(
            uplink.request(consumer, 1, 0, 4096, MAX_HOPS + 1),
            Err(ServerError::HopLimit)
        ));
    }

    #[test]
    fn drain_fails_every_recipient() {
        let uplink = bare_uplink();
        let consumer = CountingConsumer::new();
        uplink.request(consumer.clone(), 1, 0, 8192, 0).unwrap();
        uplink.request(consumer.clone(), 2, 0, 4096, 0).unwrap();
        uplink.request(consumer.clone(), 3, 65536, 4096, 0).unwrap();
        uplink.drain_queue();
        assert_eq!(consumer.failures.load(Ordering::Relaxed), 3);
        assert_eq!(uplink.queue_len(), 0);
    }

    #[test]
    fn ranges_align_outward() {
        let uplink = bare_uplink();
        let consumer = CountingConsumer::new();
        uplink.request(consumer, 1, 100, 5000, 0).unwrap();
        let queue = uplink.queue.lock().unwrap();
        assert_eq!(queue[0].from, 0);
        assert_eq!(queue[0].to, 8192);
    }
}
