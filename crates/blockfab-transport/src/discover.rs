//! Discovery and failover engine.
//!
//! One engine instance exists per device/uplink. The consumer drives a
//! one-second heartbeat through [`ProbeSchedule`] and runs a
//! [`Discovery::probe_cycle`] whenever the schedule fires; a returned
//! [`CycleOutcome::Switch`] carries a ready-to-use connection so the live
//! request queue migrates without being drained.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};

use crate::altservers::AltServerRegistry;
use crate::tcp::BlockConnection;
use crate::{
    rtt_timeout, TransportError, PROBE_NORMAL, PROBE_PANIC, PROBE_STARTUP, RTT_UNREACHABLE,
    RTT_WINDOW, STARTUP_MODE_DURATION,
};

/// Identity of the image a device is attached to; probes must match it.
#[derive(Debug, Clone)]
pub struct ImageIdentity {
    pub name: String,
    pub rid: u16,
    /// Expected file size; zero skips the size check (initial connect).
    pub file_size: u64,
}

/// The peer currently serving the device.
#[derive(Debug, Clone, Copy)]
pub struct CurrentPeer {
    pub addr: SocketAddr,
    pub rtt_us: u64,
}

/// A probed peer that won the cycle, with its open connection.
pub struct BetterPeer {
    pub addr: SocketAddr,
    pub protocol_version: u16,
    pub rtt_us: u64,
    pub conn: BlockConnection,
}

/// Result of one probe cycle.
pub enum CycleOutcome {
    /// Migrate to this peer; the connection is already handshaken.
    Switch(BetterPeer),
    /// Keep the current peer.
    Stay,
    /// No candidate was reachable at all.
    Unreachable,
}

/// Heartbeat-driven probe cadence: startup, steady state, panic.
#[derive(Debug, Default)]
pub struct ProbeSchedule {
    ticks: u64,
}

impl ProbeSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances one heartbeat (call once a second) and reports whether a
    /// probe cycle is due.
    pub fn tick(&mut self, panic: bool) -> bool {
        self.ticks += 1;
        let interval = if panic {
            PROBE_PANIC
        } else if self.in_startup() {
            PROBE_STARTUP
        } else {
            PROBE_NORMAL
        };
        self.ticks % interval == 0
    }

    pub fn in_startup(&self) -> bool {
        self.ticks <= STARTUP_MODE_DURATION
    }
}

/// Detects a request stuck at the head of the in-flight queue: the same
/// handle observed on two consecutive cycles forces a switch.
#[derive(Debug, Default)]
pub struct HungWatch {
    last: Option<u64>,
}

impl HungWatch {
    pub fn observe(&mut self, head: Option<u64>) -> bool {
        let hung = head.is_some() && head == self.last;
        self.last = head;
        hung
    }
}

/// Probes candidates, scores them, and decides on migration.
pub struct Discovery {
    registry: Arc<AltServerRegistry>,
    identity: ImageIdentity,
    /// Handshake as a server (proxy uplink) rather than a plain client.
    proxy_mode: bool,
    /// Restrict uplink candidates to private peers.
    private_only: bool,
    /// Factor applied to the current RTT in the switch comparison.
    rtt_factor: f64,
    turn: usize,
    ready: bool,
    panic_count: u32,
}

impl Discovery {
    pub fn new(
        registry: Arc<AltServerRegistry>,
        identity: ImageIdentity,
        proxy_mode: bool,
        private_only: bool,
    ) -> Self {
        Self {
            registry,
            identity,
            proxy_mode,
            private_only,
            rtt_factor: 2.0 / 3.0,
            turn: 0,
            ready: false,
            panic_count: 0,
        }
    }

    /// Overrides the switch comparison factor (tests and tuning).
    pub fn with_rtt_factor(mut self, factor: f64) -> Self {
        self.rtt_factor = factor;
        self
    }

    /// Updates the expected file size once the first handshake learned it.
    pub fn set_file_size(&mut self, file_size: u64) {
        self.identity.file_size = file_size;
    }

    /// Consecutive cycles in which nothing was reachable.
    pub fn panic_count(&self) -> u32 {
        self.panic_count
    }

    /// Runs one probe cycle.
    ///
    /// `panic` selects first-responder mode; `startup` widens the candidate
    /// subset; `hung` forces a switch to any responsive better peer even if
    /// RTT does not justify it.
    pub async fn probe_cycle(
        &mut self,
        current: Option<&CurrentPeer>,
        panic: bool,
        startup: bool,
        hung: bool,
    ) -> CycleOutcome {
        let candidates = self.registry.uplink_candidates(self.private_only);
        if candidates.is_empty() {
            return CycleOutcome::Unreachable;
        }
        let clock = clock_us();

        // Candidate subset: everything during startup or panic, otherwise
        // three entries chosen by a clock-permuted check order.
        let mut order: Vec<usize> = (0..candidates.len()).collect();
        let subset = if startup || panic {
            candidates.len()
        } else {
            3.min(candidates.len())
        };
        if candidates.len() > subset {
            for i in 0..subset {
                let j = ((clock >> i) % candidates.len() as u64) as usize;
                order.swap(i, j);
            }
        }

        let mut best: Option<BetterPeer> = None;
        let mut budget = subset;
        let mut current_rtt = current.map(|c| c.rtt_us).unwrap_or(RTT_UNREACHABLE);

        for idx in order {
            let host = candidates[idx];
            let is_current = current.map(|c| c.addr == host).unwrap_or(false);
            if !panic {
                if let Some(entry) = self.registry.find(host) {
                    // Skip notorious failures most of the time
                    if entry.failures > 50 && clock & 7 != 0 {
                        continue;
                    }
                }
            }
            // Test at most `subset` peers, plus always the current one
            if budget == 0 && !is_current {
                continue;
            }
            budget = budget.saturating_sub(1);

            match self.probe_one(host, current, !panic).await {
                Ok(peer) => {
                    if panic {
                        info!("panic mode, taking first responding peer {host}");
                        self.panic_count = 0;
                        return CycleOutcome::Switch(peer);
                    }
                    let mean =
                        self.registry
                            .record_success(host, peer.protocol_version, self.turn, peer.rtt_us);
                    if is_current {
                        current_rtt = mean;
                    }
                    let better = best.as_ref().map(|b| mean < b.rtt_us).unwrap_or(true);
                    if better {
                        best = Some(BetterPeer { rtt_us: mean, ..peer });
                    }
                }
                Err(e) => {
                    debug!("probe of {host} failed: {e}");
                    self.registry.record_failure(host, self.turn);
                    if is_current {
                        current_rtt = RTT_UNREACHABLE;
                    }
                }
            }
        }

        let outcome = self.evaluate(best, current, current_rtt, hung, clock);

        // Advance the window index; on rare clock bits it stays put
        if !self.ready || clock & 15 != 0 {
            self.turn = (self.turn + 1) % RTT_WINDOW;
        }
        if self.turn == 2 {
            // Two of four samples are enough for load balancing decisions
            self.ready = true;
        }
        outcome
    }

    fn evaluate(
        &mut self,
        best: Option<BetterPeer>,
        current: Option<&CurrentPeer>,
        current_rtt: u64,
        hung: bool,
        clock: u64,
    ) -> CycleOutcome {
        let Some(best) = best else {
            self.panic_count = self.panic_count.saturating_add(1);
            return CycleOutcome::Unreachable;
        };
        self.panic_count = 0;

        // Initial attach: nothing to compare against
        let Some(current) = current else {
            return CycleOutcome::Switch(best);
        };
        if best.addr == current.addr {
            return CycleOutcome::Stay;
        }

        let threshold = self.registry.reward_best(best.addr);
        let mut do_change = self.ready
            && clock & 3 != 0
            && current_rtt as f64 * self.rtt_factor > (best.rtt_us + threshold) as f64;
        if self.ready && !do_change && hung {
            warn!("hung request on {}, forcing switch", current.addr);
            do_change = true;
        }
        if do_change {
            info!(
                "peer {} is faster ({}µs vs. {}µs)",
                best.addr, best.rtt_us, current_rtt
            );
            CycleOutcome::Switch(best)
        } else {
            CycleOutcome::Stay
        }
    }

    async fn probe_one(
        &self,
        host: SocketAddr,
        current: Option<&CurrentPeer>,
        measure: bool,
    ) -> crate::Result<BetterPeer> {
        let io_timeout = rtt_timeout(current.map(|c| c.rtt_us).unwrap_or(0));
        let mut conn = BlockConnection::connect(host, io_timeout).await?;
        let reply = conn
            .select_image(&self.identity.name, self.identity.rid, self.proxy_mode)
            .await?;
        if self.identity.file_size != 0 && reply.file_size != self.identity.file_size {
            return Err(TransportError::protocol(format!(
                "peer {host} reports size {} for {}:{}, expected {}",
                reply.file_size, self.identity.name, self.identity.rid, self.identity.file_size
            )));
        }
        let rtt_us = if measure { conn.measure_rtt().await? } else { 0 };
        Ok(BetterPeer {
            addr: host,
            protocol_version: reply.protocol_version,
            rtt_us,
            conn,
        })
    }
}

fn clock_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}
