//! Rendezvous registry: daily meeting points and hourly tokens.
//!
//! Previously-paired peers derive per-day "meeting points" and per-hour
//! "tokens" from their shared secrets and meet at them here. Daily points
//! carry encrypted dead drops so an offline counterpart can pick up routing
//! hints later; hourly tokens only match peers that are online at the same
//! time. Keys are opaque hash strings — the server learns nothing about
//! who is meeting whom.

pub mod coordinator;
pub mod store;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;

use crate::protocol::{DeadDropMatch, LiveMatch, ServerMessage};
use crate::state::{ConnSender, Frame};
use store::RendezvousStore;

pub const DAILY_TTL_SECS: i64 = 72 * 3600;
pub const HOURLY_TTL_SECS: i64 = 3 * 3600;

pub const MAX_POINTS_PER_MESSAGE: usize = 64;
pub const MAX_TOKENS_PER_MESSAGE: usize = 64;
pub const MAX_KEY_BYTES: usize = 128;
pub const MAX_DEAD_DROP_BYTES: usize = 4096;

/// One registration at a daily meeting point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyEntry {
    pub peer_id: String,
    pub relay_id: Option<String>,
    pub dead_drop: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// One registration at an hourly token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HourlyEntry {
    pub peer_id: String,
    pub relay_id: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Validate the size bounds of one registration batch.
pub fn validate_batch(
    daily_points: &[String],
    hourly_tokens: &[String],
    dead_drops: &[&str],
) -> Result<(), String> {
    if daily_points.len() > MAX_POINTS_PER_MESSAGE {
        return Err(format!(
            "Too many daily points (max {})",
            MAX_POINTS_PER_MESSAGE
        ));
    }
    if hourly_tokens.len() > MAX_TOKENS_PER_MESSAGE {
        return Err(format!(
            "Too many hourly tokens (max {})",
            MAX_TOKENS_PER_MESSAGE
        ));
    }
    for key in daily_points.iter().chain(hourly_tokens.iter()) {
        if key.is_empty() || key.len() > MAX_KEY_BYTES {
            return Err(format!("Key length out of range [1, {}]", MAX_KEY_BYTES));
        }
    }
    for drop in dead_drops {
        if drop.len() > MAX_DEAD_DROP_BYTES {
            return Err(format!("Dead drop too large (max {} bytes)", MAX_DEAD_DROP_BYTES));
        }
    }
    Ok(())
}

/// The local slice of the daily and hourly tables.
pub struct RendezvousRegistry {
    daily: DashMap<String, Vec<DailyEntry>>,
    hourly: DashMap<String, Vec<HourlyEntry>>,
    /// peer_id → sender, for pushing `rendezvous_match` to peers that
    /// registered earlier and are still connected here.
    online: DashMap<String, ConnSender>,
    store: Option<RendezvousStore>,
}

impl RendezvousRegistry {
    pub fn new() -> Self {
        Self {
            daily: DashMap::new(),
            hourly: DashMap::new(),
            online: DashMap::new(),
            store: None,
        }
    }

    /// Registry backed by SQLite. Unexpired entries from a previous run are
    /// restored so dead drops survive a server restart.
    pub fn with_store(store: RendezvousStore) -> Self {
        let registry = Self {
            daily: DashMap::new(),
            hourly: DashMap::new(),
            online: DashMap::new(),
            store: Some(store),
        };
        registry.restore();
        registry
    }

    fn restore(&self) {
        let store = match &self.store {
            Some(store) => store,
            None => return,
        };
        match store.load_unexpired(Utc::now()) {
            Ok((daily, hourly)) => {
                let (d, h) = (daily.len(), hourly.len());
                for (point, entry) in daily {
                    self.daily.entry(point).or_default().push(entry);
                }
                for (token, entry) in hourly {
                    self.hourly.entry(token).or_default().push(entry);
                }
                if d + h > 0 {
                    tracing::info!(daily = d, hourly = h, "Restored rendezvous entries");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to restore rendezvous entries");
            }
        }
    }

    // ── Registration ──────────────────────────────────────────────────────

    /// Upsert `peer_id` at each daily point, returning the other peers
    /// already registered there — the dead-drop match set.
    pub fn register_daily(
        &self,
        peer_id: &str,
        items: &[(String, Option<String>)],
        relay_id: Option<&str>,
    ) -> Vec<DeadDropMatch> {
        let expires_at = Utc::now() + ChronoDuration::seconds(DAILY_TTL_SECS);
        let mut matches = Vec::new();

        for (point, dead_drop) in items {
            let mut entries = self.daily.entry(point.clone()).or_default();

            for entry in entries.iter().filter(|e| e.peer_id != peer_id) {
                matches.push(DeadDropMatch {
                    point: point.clone(),
                    peer_id: entry.peer_id.clone(),
                    relay_id: entry.relay_id.clone(),
                    payload: entry.dead_drop.clone(),
                });
            }

            // One entry per (point, peer) — re-registration replaces it.
            entries.retain(|e| e.peer_id != peer_id);
            entries.push(DailyEntry {
                peer_id: peer_id.to_string(),
                relay_id: relay_id.map(str::to_string),
                dead_drop: dead_drop.clone(),
                expires_at,
            });
            drop(entries);

            if let Some(store) = &self.store {
                if let Err(e) = store.upsert_daily(
                    point,
                    peer_id,
                    relay_id,
                    dead_drop.as_deref(),
                    expires_at,
                ) {
                    tracing::warn!(error = %e, point = point.as_str(), "Dead drop persist failed");
                }
            }
        }

        matches
    }

    /// Upsert `peer_id` at each hourly token, returning the live-match set.
    pub fn register_hourly(
        &self,
        peer_id: &str,
        tokens: &[String],
        relay_id: Option<&str>,
    ) -> Vec<LiveMatch> {
        let expires_at = Utc::now() + ChronoDuration::seconds(HOURLY_TTL_SECS);
        let mut matches = Vec::new();

        for token in tokens {
            let mut entries = self.hourly.entry(token.clone()).or_default();

            for entry in entries.iter().filter(|e| e.peer_id != peer_id) {
                matches.push(LiveMatch {
                    token: token.clone(),
                    peer_id: entry.peer_id.clone(),
                    relay_id: entry.relay_id.clone(),
                });
            }

            entries.retain(|e| e.peer_id != peer_id);
            entries.push(HourlyEntry {
                peer_id: peer_id.to_string(),
                relay_id: relay_id.map(str::to_string),
                expires_at,
            });
            drop(entries);

            if let Some(store) = &self.store {
                if let Err(e) = store.upsert_hourly(token, peer_id, relay_id, expires_at) {
                    tracing::warn!(error = %e, token = token.as_str(), "Token persist failed");
                }
            }
        }

        matches
    }

    // ── Lookup ────────────────────────────────────────────────────────────

    /// Current entries at a daily point (inter-server forwarding path).
    pub fn get_daily_point(&self, point: &str) -> Vec<DailyEntry> {
        self.daily.get(point).map(|e| e.value().clone()).unwrap_or_default()
    }

    /// Current entries at an hourly token.
    pub fn get_hourly_token(&self, token: &str) -> Vec<HourlyEntry> {
        self.hourly.get(token).map(|e| e.value().clone()).unwrap_or_default()
    }

    // ── Presence & pushes ─────────────────────────────────────────────────

    /// Track the connection a rendezvous peer registered from, so later
    /// arrivals at its tokens can be pushed to it.
    pub fn bind_online(&self, peer_id: &str, sender: ConnSender) {
        self.online.insert(peer_id.to_string(), sender);
    }

    pub fn unbind_online(&self, peer_id: &str) {
        self.online.remove(peer_id);
    }

    /// Push a message to a still-connected rendezvous peer.
    pub fn push_to_peer(&self, peer_id: &str, message: ServerMessage) -> bool {
        if let Some(sender) = self.online.get(peer_id) {
            sender.send(Frame::Message(message)).is_ok()
        } else {
            false
        }
    }

    // ── Removal & sweep ───────────────────────────────────────────────────

    /// Remove every entry for `peer_id` from both tables in one pass.
    pub fn unregister_peer(&self, peer_id: &str) {
        self.retain_tables(|entry_peer| entry_peer != peer_id);
        self.online.remove(peer_id);
        if let Some(store) = &self.store {
            if let Err(e) = store.remove_peer(peer_id) {
                tracing::warn!(error = %e, peer_id = peer_id, "Rendezvous removal persist failed");
            }
        }
    }

    /// Drop a peer's hourly entries only. Called on disconnect: live
    /// matches require presence, but dead drops must survive for offline
    /// pickup.
    pub fn peer_went_offline(&self, peer_id: &str) {
        let empty_keys: Vec<String> = {
            let mut empties = Vec::new();
            for mut entry in self.hourly.iter_mut() {
                entry.value_mut().retain(|e| e.peer_id != peer_id);
                if entry.value().is_empty() {
                    empties.push(entry.key().clone());
                }
            }
            empties
        };
        for key in empty_keys {
            self.hourly.remove_if(&key, |_, entries| entries.is_empty());
        }
        self.online.remove(peer_id);
        if let Some(store) = &self.store {
            if let Err(e) = store.remove_peer_hourly(peer_id) {
                tracing::warn!(error = %e, peer_id = peer_id, "Hourly removal persist failed");
            }
        }
    }

    /// Remove expired entries from both tables. Called periodically.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut removed = 0usize;

        let mut empty_daily = Vec::new();
        for mut entry in self.daily.iter_mut() {
            let before = entry.value().len();
            entry.value_mut().retain(|e| e.expires_at > now);
            removed += before - entry.value().len();
            if entry.value().is_empty() {
                empty_daily.push(entry.key().clone());
            }
        }
        for key in empty_daily {
            self.daily.remove_if(&key, |_, entries| entries.is_empty());
        }

        let mut empty_hourly = Vec::new();
        for mut entry in self.hourly.iter_mut() {
            let before = entry.value().len();
            entry.value_mut().retain(|e| e.expires_at > now);
            removed += before - entry.value().len();
            if entry.value().is_empty() {
                empty_hourly.push(entry.key().clone());
            }
        }
        for key in empty_hourly {
            self.hourly.remove_if(&key, |_, entries| entries.is_empty());
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.sweep_expired(now) {
                tracing::warn!(error = %e, "Rendezvous store sweep failed");
            }
        }

        if removed > 0 {
            tracing::debug!(count = removed, "Swept expired rendezvous entries");
        }
        removed
    }

    fn retain_tables<F: Fn(&str) -> bool>(&self, keep: F) {
        let mut empty_daily = Vec::new();
        for mut entry in self.daily.iter_mut() {
            entry.value_mut().retain(|e| keep(&e.peer_id));
            if entry.value().is_empty() {
                empty_daily.push(entry.key().clone());
            }
        }
        for key in empty_daily {
            self.daily.remove_if(&key, |_, entries| entries.is_empty());
        }

        let mut empty_hourly = Vec::new();
        for mut entry in self.hourly.iter_mut() {
            entry.value_mut().retain(|e| keep(&e.peer_id));
            if entry.value().is_empty() {
                empty_hourly.push(entry.key().clone());
            }
        }
        for key in empty_hourly {
            self.hourly.remove_if(&key, |_, entries| entries.is_empty());
        }
    }

    pub fn daily_size(&self) -> usize {
        self.daily.iter().map(|e| e.value().len()).sum()
    }

    pub fn hourly_size(&self) -> usize {
        self.hourly.iter().map(|e| e.value().len()).sum()
    }
}

impl Default for RendezvousRegistry {
    fn default() -> Self {
        Self::new()
    }
}
