//! Registry of candidate peers with RTT history and switching hysteresis.
//!
//! The registry has its own short-held lock so probers and the discovery
//! task never contend with request paths.

use std::net::SocketAddr;
use std::sync::Mutex;

use log::{debug, info};

use blockfab_proto::PeerEntry;

use crate::RTT_UNREACHABLE;

/// Registry capacity.
pub const NUMBER_SERVERS: usize = 8;

/// Rolling RTT window length per entry.
pub const RTT_WINDOW: usize = 4;

/// Saturation point of the best-count hysteresis score.
pub const BEST_COUNT_MAX: u8 = 148;

/// Base switching threshold in microseconds; lowered by 10 per best-count.
const BASE_SWITCH_THRESHOLD: u64 = 1500;

/// One candidate peer.
#[derive(Debug, Clone)]
pub struct AltServer {
    pub host: SocketAddr,
    pub protocol_version: u16,
    /// Last [`RTT_WINDOW`] samples in microseconds; [`RTT_UNREACHABLE`]
    /// marks a failed probe.
    pub rtts: [u64; RTT_WINDOW],
    pub failures: u32,
    /// Hysteresis score in `[0, BEST_COUNT_MAX]`; repeated winners get a
    /// lower switching threshold.
    pub best_count: u8,
    /// Not advertised to clients when acting as a proxy.
    pub is_private: bool,
    /// Never used as an uplink, only advertised to clients.
    pub is_client_only: bool,
    pub comment: String,
}

impl AltServer {
    fn new(host: SocketAddr) -> Self {
        Self {
            host,
            protocol_version: 0,
            rtts: [0; RTT_WINDOW],
            failures: 0,
            best_count: 0,
            is_private: false,
            is_client_only: false,
            comment: String::new(),
        }
    }

    /// Mean over the rolling window.
    pub fn rtt(&self) -> u64 {
        self.rtts.iter().sum::<u64>() / RTT_WINDOW as u64
    }

    pub fn is_reachable(&self) -> bool {
        self.rtts.iter().any(|&r| r != RTT_UNREACHABLE)
    }
}

/// Set of candidate peers, bounded by [`NUMBER_SERVERS`].
#[derive(Debug, Default)]
pub struct AltServerRegistry {
    entries: Mutex<Vec<AltServer>>,
}

impl AltServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a peer if it is not already known and capacity remains.
    pub fn add(
        &self,
        host: SocketAddr,
        comment: &str,
        is_private: bool,
        is_client_only: bool,
    ) -> bool {
        let mut entries = self.entries.lock().unwrap();
        if entries.iter().any(|e| e.host == host) {
            return false;
        }
        if entries.len() >= NUMBER_SERVERS {
            debug!("alt-server registry full, ignoring {host}");
            return false;
        }
        let mut entry = AltServer::new(host);
        entry.comment = comment.to_string();
        entry.is_private = is_private;
        entry.is_client_only = is_client_only;
        info!("alt server added: {host} ({comment})");
        entries.push(entry);
        true
    }

    pub fn remove(&self, host: SocketAddr) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|e| e.host != host);
        before != entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current entries, for probing and status surfaces.
    pub fn snapshot(&self) -> Vec<AltServer> {
        self.entries.lock().unwrap().clone()
    }

    pub fn find(&self, host: SocketAddr) -> Option<AltServer> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.host == host)
            .cloned()
    }

    /// Peers eligible as upstream for a proxy. Client-only entries are
    /// excluded; `private_only` additionally restricts to private peers.
    pub fn uplink_candidates(&self, private_only: bool) -> Vec<SocketAddr> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| !e.is_client_only && (!private_only || e.is_private))
            .map(|e| e.host)
            .collect()
    }

    /// Peers advertised to clients in `GET_SERVERS` replies.
    pub fn client_entries(&self) -> Vec<PeerEntry> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| !e.is_private)
            .map(|e| PeerEntry::new(e.host, e.failures.min(u8::MAX as u32) as u8))
            .collect()
    }

    /// Records a successful probe: stores the sample at `turn`, resets the
    /// failure count and applies the standing loss decrement. Returns the
    /// updated window mean.
    pub fn record_success(&self, host: SocketAddr, version: u16, turn: usize, sample: u64) -> u64 {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.iter_mut().find(|e| e.host == host) else {
            return sample;
        };
        entry.protocol_version = version;
        entry.rtts[turn % RTT_WINDOW] = sample;
        entry.failures = 0;
        if entry.best_count > 1 {
            entry.best_count -= 2;
        }
        entry.rtt()
    }

    /// Records a failed probe: bumps the failure count, poisons the window
    /// slot and decrements the hysteresis score.
    pub fn record_failure(&self, host: SocketAddr, turn: usize) {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.iter_mut().find(|e| e.host == host) else {
            return;
        };
        entry.failures += 1;
        entry.rtts[turn % RTT_WINDOW] = RTT_UNREACHABLE;
        if entry.best_count > 2 {
            entry.best_count -= 3;
        }
    }

    /// Rewards this cycle's winner and returns the switching threshold to
    /// apply against it: `1500 − 10·best_count` microseconds.
    pub fn reward_best(&self, host: SocketAddr) -> u64 {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.iter_mut().find(|e| e.host == host) else {
            return BASE_SWITCH_THRESHOLD;
        };
        entry.best_count = entry.best_count.saturating_add(3).min(BEST_COUNT_MAX);
        BASE_SWITCH_THRESHOLD - 10 * entry.best_count as u64
    }

    /// Merges a `GET_SERVERS` payload: zero failures adds, anything else
    /// removes. Entries learned this way are neither private nor
    /// client-only.
    pub fn merge_wire_entries(&self, entries: &[PeerEntry]) {
        for entry in entries {
            let host = entry.socket_addr();
            if entry.failures == 0 {
                self.add(host, "learned", false, false);
            } else if self.remove(host) {
                info!("alt server withdrawn by peer: {host}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn add_is_bounded_and_deduplicated() {
        let reg = AltServerRegistry::new();
        assert!(reg.add(addr(5003), "a", false, false));
        assert!(!reg.add(addr(5003), "dup", false, false));
        for p in 1..NUMBER_SERVERS as u16 {
            assert!(reg.add(addr(5003 + p), "", false, false));
        }
        assert!(!reg.add(addr(9999), "overflow", false, false));
        assert_eq!(reg.len(), NUMBER_SERVERS);
    }

    #[test]
    fn best_count_saturates_and_threshold_shrinks() {
        let reg = AltServerRegistry::new();
        reg.add(addr(5003), "", false, false);
        let mut threshold = BASE_SWITCH_THRESHOLD;
        for _ in 0..100 {
            threshold = reg.reward_best(addr(5003));
        }
        assert_eq!(reg.find(addr(5003)).unwrap().best_count, BEST_COUNT_MAX);
        assert_eq!(threshold, BASE_SWITCH_THRESHOLD - 10 * BEST_COUNT_MAX as u64);
    }

    #[test]
    fn success_applies_loss_decrement() {
        let reg = AltServerRegistry::new();
        reg.add(addr(5003), "", false, false);
        reg.reward_best(addr(5003));
        assert_eq!(reg.find(addr(5003)).unwrap().best_count, 3);
        reg.record_success(addr(5003), 3, 0, 800);
        assert_eq!(reg.find(addr(5003)).unwrap().best_count, 1);
        reg.record_success(addr(5003), 3, 1, 800);
        // Below 2, decrement no longer applies
        assert_eq!(reg.find(addr(5003)).unwrap().best_count, 1);
    }

    #[test]
    fn failure_poisons_window_slot() {
        let reg = AltServerRegistry::new();
        reg.add(addr(5003), "", false, false);
        reg.record_failure(addr(5003), 2);
        let entry = reg.find(addr(5003)).unwrap();
        assert_eq!(entry.failures, 1);
        assert_eq!(entry.rtts[2], RTT_UNREACHABLE);
        assert!(entry.is_reachable());
    }

    #[test]
    fn filters() {
        let reg = AltServerRegistry::new();
        reg.add(addr(1), "public", false, false);
        reg.add(addr(2), "private", true, false);
        reg.add(addr(3), "client-only", false, true);

        let uplinks = reg.uplink_candidates(false);
        assert!(uplinks.contains(&addr(1)) && uplinks.contains(&addr(2)));
        assert!(!uplinks.contains(&addr(3)));

        assert_eq!(reg.uplink_candidates(true), vec![addr(2)]);

        let clients: Vec<_> = reg
            .client_entries()
            .iter()
            .map(|e| e.socket_addr())
            .collect();
        assert!(clients.contains(&addr(1)) && clients.contains(&addr(3)));
        assert!(!clients.contains(&addr(2)));
    }

    #[test]
    fn wire_merge_adds_and_removes() {
        let reg = AltServerRegistry::new();
        reg.merge_wire_entries(&[PeerEntry::new(addr(5003), 0)]);
        assert_eq!(reg.len(), 1);
        reg.merge_wire_entries(&[PeerEntry::new(addr(5003), 9)]);
        assert!(reg.is_empty());
    }
}
