//! Relay-peer registry and introducer.
//!
//! Peers that opt in as relays register here with a capacity figure, report
//! load, and get picked by other peers through load-sorted listings. The
//! registry also carries opaque introduction envelopes from one peer
//! through a chosen relay to another peer known only by source ID.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;

use crate::protocol::{RelayInfo, ServerMessage};
use crate::state::{ConnId, ConnSender, Frame};

pub const PEER_ID_MAX_LEN: usize = 128;
pub const MIN_MAX_CONNECTIONS: u32 = 1;
pub const MAX_MAX_CONNECTIONS: u32 = 1000;
pub const DEFAULT_MAX_CONNECTIONS: u32 = 50;

/// Load reports may exceed capacity by this factor before being rejected
/// (transient overshoot while connections drain).
pub const LOAD_SLACK_FACTOR: u32 = 2;

pub const DEFAULT_RELAY_COUNT: usize = 10;
pub const MAX_RELAY_COUNT: usize = 50;

/// `peer_id` must match `[A-Za-z0-9_-]{1,128}`.
pub fn validate_peer_id(peer_id: &str) -> bool {
    !peer_id.is_empty()
        && peer_id.len() <= PEER_ID_MAX_LEN
        && peer_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayRegisterError {
    InvalidPeerId,
    InvalidMaxConnections,
    PeerIdTaken,
    ConnAlreadyBound(String),
}

struct RelayPeer {
    conn: ConnId,
    sender: ConnSender,
    max_connections: u32,
    current_load: u32,
    last_seen: DateTime<Utc>,
    #[allow(dead_code)]
    public_key: Option<String>,
}

impl RelayPeer {
    fn at_capacity(&self) -> bool {
        self.current_load >= self.max_connections
    }

    fn load_ratio(&self) -> f64 {
        self.current_load as f64 / self.max_connections as f64
    }

    fn info(&self, peer_id: &str) -> RelayInfo {
        RelayInfo {
            peer_id: peer_id.to_string(),
            current_load: self.current_load,
            max_connections: self.max_connections,
            at_capacity: self.at_capacity(),
        }
    }
}

/// Load map of relay-capable peers connected to this server.
pub struct RelayRegistry {
    peers: DashMap<String, RelayPeer>,
    conn_to_peer: DashMap<ConnId, String>,
}

impl RelayRegistry {
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
            conn_to_peer: DashMap::new(),
        }
    }

    // ── Registration ──────────────────────────────────────────────────────

    /// Register a relay peer. On success returns the relay candidates to
    /// hand back in the `registered` reply (at-capacity peers excluded).
    pub fn register(
        &self,
        conn: ConnId,
        sender: ConnSender,
        peer_id: &str,
        max_connections: Option<u32>,
        public_key: Option<String>,
    ) -> Result<Vec<RelayInfo>, RelayRegisterError> {
        if !validate_peer_id(peer_id) {
            return Err(RelayRegisterError::InvalidPeerId);
        }
        let max_connections = max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS);
        if !(MIN_MAX_CONNECTIONS..=MAX_MAX_CONNECTIONS).contains(&max_connections) {
            return Err(RelayRegisterError::InvalidMaxConnections);
        }
        if let Some(existing) = self.conn_to_peer.get(&conn) {
            if existing.value() != peer_id {
                return Err(RelayRegisterError::ConnAlreadyBound(existing.clone()));
            }
        }

        use dashmap::mapref::entry::Entry;
        match self.peers.entry(peer_id.to_string()) {
            Entry::Occupied(mut slot) => {
                if slot.get().conn != conn {
                    return Err(RelayRegisterError::PeerIdTaken);
                }
                // Same socket re-registering: refresh capacity and liveness.
                let peer = slot.get_mut();
                peer.max_connections = max_connections;
                peer.last_seen = Utc::now();
            }
            Entry::Vacant(slot) => {
                slot.insert(RelayPeer {
                    conn,
                    sender,
                    max_connections,
                    current_load: 0,
                    last_seen: Utc::now(),
                    public_key,
                });
            }
        }
        self.conn_to_peer.insert(conn, peer_id.to_string());

        tracing::info!(
            peer_id = peer_id,
            max_connections = max_connections,
            "Relay peer registered"
        );
        Ok(self.available_relays(peer_id, DEFAULT_RELAY_COUNT))
    }

    /// Whether `conn` owns `peer_id`.
    fn owns(&self, conn: ConnId, peer_id: &str) -> bool {
        self.peers
            .get(peer_id)
            .map(|p| p.conn == conn)
            .unwrap_or(false)
    }

    pub fn peer_id_of(&self, conn: ConnId) -> Option<String> {
        self.conn_to_peer.get(&conn).map(|p| p.value().clone())
    }

    // ── Load & liveness ───────────────────────────────────────────────────

    /// Apply a load report. Returns the stored value.
    pub fn update_load(
        &self,
        conn: ConnId,
        peer_id: &str,
        connected_count: u32,
    ) -> Result<u32, String> {
        if !self.owns(conn, peer_id) {
            return Err("Not the owner of this peer_id".to_string());
        }
        let mut peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| "Unknown peer".to_string())?;
        let upper = peer.max_connections.saturating_mul(LOAD_SLACK_FACTOR);
        if connected_count > upper {
            return Err(format!(
                "connected_count {} out of range [0, {}]",
                connected_count, upper
            ));
        }
        peer.current_load = connected_count;
        peer.last_seen = Utc::now();
        tracing::debug!(peer_id = peer_id, load = connected_count, "Load updated");
        Ok(connected_count)
    }

    pub fn heartbeat(&self, conn: ConnId, peer_id: &str) -> Result<(), String> {
        if !self.owns(conn, peer_id) {
            return Err("Not the owner of this peer_id".to_string());
        }
        if let Some(mut peer) = self.peers.get_mut(peer_id) {
            peer.last_seen = Utc::now();
        }
        Ok(())
    }

    // ── Listings ──────────────────────────────────────────────────────────

    /// Relay candidates for automatic assignment: ascending load ratio,
    /// at-capacity peers and the caller excluded.
    pub fn available_relays(&self, excluding: &str, count: usize) -> Vec<RelayInfo> {
        let mut candidates: Vec<(f64, RelayInfo)> = self
            .peers
            .iter()
            .filter(|entry| entry.key() != excluding && !entry.at_capacity())
            .map(|entry| (entry.load_ratio(), entry.info(entry.key())))
            .collect();
        candidates.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        candidates
            .into_iter()
            .take(count.min(MAX_RELAY_COUNT))
            .map(|(_, info)| info)
            .collect()
    }

    /// Full listing for `get_relays`: at-capacity peers stay in, flagged,
    /// so callers can make their own choice.
    pub fn relay_listing(&self, excluding: &str, count: usize) -> Vec<RelayInfo> {
        let mut candidates: Vec<(f64, RelayInfo)> = self
            .peers
            .iter()
            .filter(|entry| entry.key() != excluding)
            .map(|entry| (entry.load_ratio(), entry.info(entry.key())))
            .collect();
        candidates.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        candidates
            .into_iter()
            .take(count.min(MAX_RELAY_COUNT))
            .map(|(_, info)| info)
            .collect()
    }

    // ── Delivery ──────────────────────────────────────────────────────────

    /// Best-effort send to a locally-connected relay peer.
    pub fn send_to_peer(&self, peer_id: &str, message: ServerMessage) -> bool {
        if let Some(peer) = self.peers.get(peer_id) {
            peer.sender.send(Frame::Message(message)).is_ok()
        } else {
            false
        }
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    /// Drop the registration bound to a closed connection.
    pub fn unregister_conn(&self, conn: ConnId) -> Option<String> {
        let (_, peer_id) = self.conn_to_peer.remove(&conn)?;
        self.peers.remove_if(&peer_id, |_, peer| peer.conn == conn);
        tracing::info!(peer_id = peer_id.as_str(), "Relay peer unregistered");
        Some(peer_id)
    }

    /// Remove peers whose `last_seen` is older than `timeout` and close
    /// their sockets. Returns the evicted peer IDs.
    pub fn sweep_stale(&self, timeout: std::time::Duration) -> Vec<String> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(timeout).unwrap_or_else(|_| ChronoDuration::seconds(60));
        let stale: Vec<String> = self
            .peers
            .iter()
            .filter(|entry| entry.last_seen < cutoff)
            .map(|entry| entry.key().clone())
            .collect();

        for peer_id in &stale {
            if let Some((_, peer)) = self.peers.remove(peer_id) {
                self.conn_to_peer.remove(&peer.conn);
                let _ = peer.sender.send(Frame::Close {
                    code: 1001,
                    reason: "heartbeat timeout".to_string(),
                });
                tracing::info!(peer_id = peer_id.as_str(), "Evicted stale relay peer");
            }
        }
        stale
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Ask every registered relay peer's connection to close (shutdown path).
    pub fn close_all(&self, code: u16, reason: &str) {
        for entry in self.peers.iter() {
            let _ = entry.value().sender.send(Frame::Close {
                code,
                reason: reason.to_string(),
            });
        }
    }

    #[cfg(test)]
    fn set_last_seen(&self, peer_id: &str, when: DateTime<Utc>) {
        if let Some(mut peer) = self.peers.get_mut(peer_id) {
            peer.last_seen = when;
        }
    }
}

impl Default for RelayRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn channel() -> (ConnSender, mpsc::UnboundedReceiver<Frame>) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn test_validate_peer_id() {
        assert!(validate_peer_id("relay-1"));
        assert!(validate_peer_id("a"));
        assert!(validate_peer_id(&"x".repeat(128)));
        assert!(!validate_peer_id(""));
        assert!(!validate_peer_id(&"x".repeat(129)));
        assert!(!validate_peer_id("has space"));
        assert!(!validate_peer_id("emoji🔥"));
    }

    #[test]
    fn test_register_and_duplicate_peer_id() {
        let reg = RelayRegistry::new();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();

        assert!(reg.register(1, tx1, "relay-1", Some(100), None).is_ok());
        assert_eq!(
            reg.register(2, tx2, "relay-1", Some(100), None),
            Err(RelayRegisterError::PeerIdTaken)
        );
        assert_eq!(reg.peer_count(), 1);
    }

    #[test]
    fn test_conn_cannot_take_second_peer_id() {
        let reg = RelayRegistry::new();
        let (tx, _rx) = channel();
        reg.register(1, tx.clone(), "relay-1", None, None).unwrap();
        assert_eq!(
            reg.register(1, tx, "relay-2", None, None),
            Err(RelayRegisterError::ConnAlreadyBound("relay-1".to_string()))
        );
    }

    #[test]
    fn test_register_bounds() {
        let reg = RelayRegistry::new();
        let (tx, _rx) = channel();
        assert_eq!(
            reg.register(1, tx.clone(), "relay-1", Some(0), None),
            Err(RelayRegisterError::InvalidMaxConnections)
        );
        assert_eq!(
            reg.register(1, tx.clone(), "relay-1", Some(1001), None),
            Err(RelayRegisterError::InvalidMaxConnections)
        );
        assert!(reg.register(1, tx, "relay-1", Some(1000), None).is_ok());
    }

    #[test]
    fn test_update_load_ownership_and_bounds() {
        let reg = RelayRegistry::new();
        let (tx, _rx) = channel();
        reg.register(1, tx, "relay-1", Some(10), None).unwrap();

        assert_eq!(reg.update_load(1, "relay-1", 7), Ok(7));
        // Slack factor 2 allows transient overshoot up to 20.
        assert_eq!(reg.update_load(1, "relay-1", 20), Ok(20));
        assert!(reg.update_load(1, "relay-1", 21).is_err());
        // A different socket cannot report for this peer.
        assert!(reg.update_load(2, "relay-1", 3).is_err());
    }

    #[test]
    fn test_available_relays_sorted_and_filtered() {
        let reg = RelayRegistry::new();
        for (conn, id, max, load) in [
            (1, "low", 100, 10),
            (2, "mid", 100, 50),
            (3, "full", 10, 10),
            (4, "high", 100, 90),
        ] {
            let (tx, _rx) = channel();
            reg.register(conn, tx, id, Some(max), None).unwrap();
            reg.update_load(conn, id, load).unwrap();
            // Receivers dropped; senders keep working for this test.
        }

        let relays = reg.available_relays("caller", 10);
        let ids: Vec<&str> = relays.iter().map(|r| r.peer_id.as_str()).collect();
        assert_eq!(ids, vec!["low", "mid", "high"]);

        // The caller itself is excluded.
        let relays = reg.available_relays("mid", 10);
        assert!(relays.iter().all(|r| r.peer_id != "mid"));
    }

    #[test]
    fn test_relay_listing_keeps_at_capacity_flagged() {
        let reg = RelayRegistry::new();
        let (tx, _rx) = channel();
        reg.register(1, tx, "full", Some(10), None).unwrap();
        reg.update_load(1, "full", 10).unwrap();

        assert!(reg.available_relays("caller", 10).is_empty());

        let listing = reg.relay_listing("caller", 10);
        assert_eq!(listing.len(), 1);
        assert!(listing[0].at_capacity);
        assert_eq!(listing[0].current_load, 10);
    }

    #[test]
    fn test_listing_count_cap() {
        let reg = RelayRegistry::new();
        for i in 0..60 {
            let (tx, _rx) = channel();
            reg.register(i, tx, &format!("relay-{}", i), Some(100), None)
                .unwrap();
        }
        assert_eq!(reg.relay_listing("caller", 200).len(), MAX_RELAY_COUNT);
        assert_eq!(reg.relay_listing("caller", 5).len(), 5);
    }

    #[test]
    fn test_unregister_conn() {
        let reg = RelayRegistry::new();
        let (tx, _rx) = channel();
        reg.register(1, tx, "relay-1", None, None).unwrap();
        assert_eq!(reg.unregister_conn(1).as_deref(), Some("relay-1"));
        assert!(!reg.is_connected("relay-1"));
        assert!(reg.unregister_conn(1).is_none());
    }

    #[test]
    fn test_sweep_closes_stale_peers() {
        let reg = RelayRegistry::new();
        let (fresh_tx, _fresh_rx) = channel();
        let (stale_tx, mut stale_rx) = channel();
        reg.register(1, fresh_tx, "fresh", None, None).unwrap();
        reg.register(2, stale_tx, "stale", None, None).unwrap();
        reg.set_last_seen("stale", Utc::now() - ChronoDuration::seconds(120));

        let evicted = reg.sweep_stale(std::time::Duration::from_secs(60));
        assert_eq!(evicted, vec!["stale".to_string()]);
        assert!(reg.is_connected("fresh"));
        assert!(!reg.is_connected("stale"));

        match stale_rx.try_recv().unwrap() {
            Frame::Close { code, .. } => assert_eq!(code, 1001),
            other => panic!("expected close frame, got {:?}", other),
        }
    }

    #[test]
    fn test_send_to_peer() {
        let reg = RelayRegistry::new();
        let (tx, mut rx) = channel();
        reg.register(1, tx, "relay-1", None, None).unwrap();

        assert!(reg.send_to_peer("relay-1", ServerMessage::Pong));
        assert!(matches!(
            rx.try_recv().unwrap(),
            Frame::Message(ServerMessage::Pong)
        ));
        assert!(!reg.send_to_peer("missing", ServerMessage::Pong));
    }
}
