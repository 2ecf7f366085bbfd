//! Federation membership table.
//!
//! Tracks every known server with its SWIM state and incarnation number.
//! Update dominance: a higher incarnation always wins; at equal incarnation
//! the more severe state wins (alive < suspect < failed < left). A node can
//! only refute suspicion about itself by bumping its own incarnation.
//!
//! Each accepted update carries a dissemination counter so the gossip
//! digest can prefer updates that have been piggybacked the fewest times.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// How many updates a single ping/ack may piggyback.
pub const MAX_DIGEST_ITEMS: usize = 8;

/// SWIM liveness state, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberState {
    Alive,
    Suspect,
    Failed,
    Left,
}

/// A membership record as gossiped on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub server_id: String,
    pub endpoint: String,
    #[serde(default)]
    pub region: String,
    pub state: MemberState,
    pub incarnation: u64,
    /// Millisecond timestamp of the last state change, local clock.
    #[serde(default)]
    pub last_change_at: i64,
}

impl Member {
    pub fn alive(server_id: &str, endpoint: &str, region: &str) -> Self {
        Self {
            server_id: server_id.to_string(),
            endpoint: endpoint.to_string(),
            region: region.to_string(),
            state: MemberState::Alive,
            incarnation: 0,
            last_change_at: Utc::now().timestamp_millis(),
        }
    }
}

/// Outcome of merging one gossiped update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The update changed our view.
    Applied,
    /// We already knew something at least as fresh.
    Ignored,
    /// The update claimed *we* are suspect/failed; our incarnation was
    /// bumped and an alive record queued for flooding.
    SelfRefuted,
}

struct MemberEntry {
    member: Member,
    /// How many times this update has been piggybacked on outgoing probes.
    dissemination: u32,
}

/// Concurrent membership table. The local server is not stored as an entry;
/// its view is synthesized from `self_record()`.
pub struct MembershipTable {
    members: DashMap<String, MemberEntry>,
    self_id: String,
    self_endpoint: String,
    self_region: String,
    self_incarnation: AtomicU64,
}

impl MembershipTable {
    pub fn new(self_id: &str, self_endpoint: &str, self_region: &str) -> Self {
        Self {
            members: DashMap::new(),
            self_id: self_id.to_string(),
            self_endpoint: self_endpoint.to_string(),
            self_region: self_region.to_string(),
            self_incarnation: AtomicU64::new(0),
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn self_incarnation(&self) -> u64 {
        self.self_incarnation.load(Ordering::SeqCst)
    }

    /// Our own record, always alive at the current incarnation.
    pub fn self_record(&self) -> Member {
        Member {
            server_id: self.self_id.clone(),
            endpoint: self.self_endpoint.clone(),
            region: self.self_region.clone(),
            state: MemberState::Alive,
            incarnation: self.self_incarnation(),
            last_change_at: Utc::now().timestamp_millis(),
        }
    }

    /// Merge a single gossiped update, applying the dominance rules.
    pub fn merge(&self, update: Member) -> MergeOutcome {
        if update.server_id == self.self_id {
            return self.merge_self(update);
        }

        let mut entry = match self.members.get_mut(&update.server_id) {
            Some(entry) => entry,
            None => {
                // Ignore tombstones for servers we never knew.
                if update.state == MemberState::Left {
                    return MergeOutcome::Ignored;
                }
                tracing::debug!(
                    server_id = update.server_id.as_str(),
                    state = ?update.state,
                    incarnation = update.incarnation,
                    "Learned new member"
                );
                self.members.insert(
                    update.server_id.clone(),
                    MemberEntry {
                        member: update,
                        dissemination: 0,
                    },
                );
                return MergeOutcome::Applied;
            }
        };

        let current = &entry.member;
        let dominates = update.incarnation > current.incarnation
            || (update.incarnation == current.incarnation && update.state > current.state);
        if !dominates {
            return MergeOutcome::Ignored;
        }

        tracing::debug!(
            server_id = update.server_id.as_str(),
            from = ?current.state,
            to = ?update.state,
            incarnation = update.incarnation,
            "Member state updated"
        );
        entry.member = Member {
            last_change_at: Utc::now().timestamp_millis(),
            ..update
        };
        entry.dissemination = 0;
        MergeOutcome::Applied
    }

    /// An update about ourselves: refute anything that is not alive.
    fn merge_self(&self, update: Member) -> MergeOutcome {
        if update.state == MemberState::Alive {
            return MergeOutcome::Ignored;
        }
        let ours = self.self_incarnation.load(Ordering::SeqCst);
        if update.incarnation < ours {
            // Stale rumor, already refuted by a previous bump.
            return MergeOutcome::Ignored;
        }
        let next = update.incarnation + 1;
        self.self_incarnation.store(next, Ordering::SeqCst);
        tracing::info!(
            rumored_state = ?update.state,
            incarnation = next,
            "Refuting rumor about ourselves"
        );
        MergeOutcome::SelfRefuted
    }

    /// Transition a member to `state` without changing its incarnation.
    /// Returns false if the member is unknown or already at/above severity.
    pub fn transition(&self, server_id: &str, state: MemberState) -> bool {
        if let Some(mut entry) = self.members.get_mut(server_id) {
            if entry.member.state >= state {
                return false;
            }
            tracing::info!(
                server_id = server_id,
                from = ?entry.member.state,
                to = ?state,
                "Member transition"
            );
            entry.member.state = state;
            entry.member.last_change_at = Utc::now().timestamp_millis();
            entry.dissemination = 0;
            true
        } else {
            false
        }
    }

    /// Current state and incarnation of a member, if known.
    pub fn get(&self, server_id: &str) -> Option<Member> {
        self.members.get(server_id).map(|e| e.member.clone())
    }

    /// Drop a member entirely (after the failed timer expires).
    pub fn remove(&self, server_id: &str) -> bool {
        self.members.remove(server_id).is_some()
    }

    /// All remote members currently alive.
    pub fn alive_members(&self) -> Vec<Member> {
        self.members
            .iter()
            .filter(|e| e.member.state == MemberState::Alive)
            .map(|e| e.member.clone())
            .collect()
    }

    /// Alive members plus our own record — the ring's input set.
    pub fn ring_members(&self) -> Vec<Member> {
        let mut members = self.alive_members();
        members.push(self.self_record());
        members
    }

    /// Full snapshot including self, for anti-entropy exchange.
    pub fn snapshot(&self) -> Vec<Member> {
        let mut members: Vec<Member> =
            self.members.iter().map(|e| e.member.clone()).collect();
        members.push(self.self_record());
        members
    }

    /// Select up to `max_items` updates for piggybacking, preferring the
    /// least-disseminated (ties broken by recency), and bump their counters.
    pub fn digest(&self, max_items: usize) -> Vec<Member> {
        let mut candidates: Vec<(String, u32, i64)> = self
            .members
            .iter()
            .map(|e| {
                (
                    e.key().clone(),
                    e.dissemination,
                    e.member.last_change_at,
                )
            })
            .collect();
        candidates.sort_by(|a, b| a.1.cmp(&b.1).then(b.2.cmp(&a.2)));
        candidates.truncate(max_items.saturating_sub(1));

        let mut digest = Vec::with_capacity(candidates.len() + 1);
        // Our own record rides along so peers always see our latest
        // incarnation.
        digest.push(self.self_record());
        for (id, _, _) in candidates {
            if let Some(mut entry) = self.members.get_mut(&id) {
                entry.dissemination = entry.dissemination.saturating_add(1);
                digest.push(entry.member.clone());
            }
        }
        digest
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> MembershipTable {
        MembershipTable::new("self", "wss://self.example.com", "us-east")
    }

    fn member(id: &str, state: MemberState, incarnation: u64) -> Member {
        Member {
            server_id: id.to_string(),
            endpoint: format!("wss://{}.example.com", id),
            region: "us-east".to_string(),
            state,
            incarnation,
            last_change_at: 0,
        }
    }

    #[test]
    fn test_new_member_applied() {
        let t = table();
        assert_eq!(
            t.merge(member("a", MemberState::Alive, 0)),
            MergeOutcome::Applied
        );
        assert_eq!(t.len(), 1);
        assert_eq!(t.alive_members().len(), 1);
    }

    #[test]
    fn test_higher_incarnation_dominates() {
        let t = table();
        t.merge(member("a", MemberState::Suspect, 1));
        assert_eq!(
            t.merge(member("a", MemberState::Alive, 2)),
            MergeOutcome::Applied
        );
        assert_eq!(t.get("a").unwrap().state, MemberState::Alive);
    }

    #[test]
    fn test_same_incarnation_severity_wins() {
        let t = table();
        t.merge(member("a", MemberState::Alive, 1));
        assert_eq!(
            t.merge(member("a", MemberState::Suspect, 1)),
            MergeOutcome::Applied
        );
        // Alive at the same incarnation does not refute suspicion.
        assert_eq!(
            t.merge(member("a", MemberState::Alive, 1)),
            MergeOutcome::Ignored
        );
        assert_eq!(t.get("a").unwrap().state, MemberState::Suspect);
    }

    #[test]
    fn test_lower_incarnation_ignored() {
        let t = table();
        t.merge(member("a", MemberState::Alive, 5));
        assert_eq!(
            t.merge(member("a", MemberState::Failed, 3)),
            MergeOutcome::Ignored
        );
    }

    #[test]
    fn test_self_refutation_bumps_incarnation() {
        let t = table();
        assert_eq!(t.self_incarnation(), 0);
        assert_eq!(
            t.merge(member("self", MemberState::Suspect, 0)),
            MergeOutcome::SelfRefuted
        );
        assert_eq!(t.self_incarnation(), 1);
        // A stale rumor at the old incarnation is now ignored.
        assert_eq!(
            t.merge(member("self", MemberState::Failed, 0)),
            MergeOutcome::Ignored
        );
        // A fresher rumor forces another bump above it.
        assert_eq!(
            t.merge(member("self", MemberState::Failed, 4)),
            MergeOutcome::SelfRefuted
        );
        assert_eq!(t.self_incarnation(), 5);
    }

    #[test]
    fn test_transition_only_escalates() {
        let t = table();
        t.merge(member("a", MemberState::Alive, 0));
        assert!(t.transition("a", MemberState::Suspect));
        assert!(!t.transition("a", MemberState::Suspect));
        assert!(t.transition("a", MemberState::Failed));
        assert!(!t.transition("a", MemberState::Alive));
        assert!(!t.transition("missing", MemberState::Suspect));
    }

    #[test]
    fn test_ring_members_includes_self() {
        let t = table();
        t.merge(member("a", MemberState::Alive, 0));
        t.merge(member("b", MemberState::Suspect, 0));
        let ring = t.ring_members();
        assert_eq!(ring.len(), 2); // a + self; b is suspect
        assert!(ring.iter().any(|m| m.server_id == "self"));
        assert!(!ring.iter().any(|m| m.server_id == "b"));
    }

    #[test]
    fn test_digest_prefers_less_disseminated() {
        let t = table();
        t.merge(member("a", MemberState::Alive, 0));
        t.merge(member("b", MemberState::Alive, 0));

        // Disseminate both once.
        let first = t.digest(MAX_DIGEST_ITEMS);
        assert!(first.len() >= 3); // self + a + b

        // A fresh update resets b's counter, so b must precede a.
        t.merge(member("b", MemberState::Suspect, 1));
        let second = t.digest(3);
        assert_eq!(second[0].server_id, "self");
        assert_eq!(second[1].server_id, "b");
    }

    #[test]
    fn test_digest_is_bounded() {
        let t = table();
        for i in 0..20 {
            t.merge(member(&format!("m{}", i), MemberState::Alive, 0));
        }
        assert!(t.digest(MAX_DIGEST_ITEMS).len() <= MAX_DIGEST_ITEMS);
    }

    #[test]
    fn test_left_tombstone_for_unknown_member_ignored() {
        let t = table();
        assert_eq!(
            t.merge(member("ghost", MemberState::Left, 9)),
            MergeOutcome::Ignored
        );
        assert!(t.is_empty());
    }
}
