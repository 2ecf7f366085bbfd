//! SWIM gossip driver.
//!
//! Runs the probe cycle against the membership table: every period pick a
//! random alive member and ping it over the federation mesh; on a missed
//! ack fall back to indirect probes through `k` other members; on a missed
//! period mark the member suspect and walk it through suspect → failed →
//! removed on timers. Every probe piggybacks a bounded membership digest,
//! and a periodic full-state exchange bounds worst-case divergence.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, oneshot};

use crate::federation::Federation;
use crate::membership::{Member, MemberState, MergeOutcome, MAX_DIGEST_ITEMS};
use crate::protocol::GossipMessage;
use crate::state::ServerState;

/// A probe we are running on another server's behalf.
struct RelayedProbe {
    origin: String,
    origin_seq: u64,
    target: String,
}

/// SWIM protocol state shared by the probe loop and the inbound handler.
#[derive(Clone)]
pub struct Swim {
    state: ServerState,
    federation: Federation,
    seq: Arc<AtomicU64>,
    /// Probes awaiting an ack (direct or relayed).
    pending_acks: Arc<DashMap<u64, oneshot::Sender<()>>>,
    /// Local probe seq → the ping-req that asked for it.
    relayed: Arc<DashMap<u64, RelayedProbe>>,
}

impl Swim {
    pub fn new(state: ServerState, federation: Federation) -> Self {
        Self {
            state,
            federation,
            seq: Arc::new(AtomicU64::new(1)),
            pending_acks: Arc::new(DashMap::new()),
            relayed: Arc::new(DashMap::new()),
        }
    }

    /// Spawn the probe loop, the anti-entropy loop, and the inbound
    /// dispatcher.
    pub fn spawn(
        state: ServerState,
        federation: Federation,
        inbound_rx: mpsc::UnboundedReceiver<(String, GossipMessage)>,
    ) -> Self {
        let swim = Self::new(state, federation);

        let probe = swim.clone();
        tokio::spawn(async move { probe.probe_loop().await });

        let exchange = swim.clone();
        tokio::spawn(async move { exchange.anti_entropy_loop().await });

        let inbound = swim.clone();
        tokio::spawn(async move { inbound.inbound_loop(inbound_rx).await });

        swim
    }

    // ── Probe cycle ───────────────────────────────────────────────────────

    async fn probe_loop(&self) {
        let mut interval = tokio::time::interval(self.state.config.gossip_period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;

            let members = self.state.membership.alive_members();
            let target = match members.choose(&mut rand::thread_rng()) {
                Some(member) => member.clone(),
                None => continue,
            };

            let swim = self.clone();
            tokio::spawn(async move { swim.probe(target).await });
        }
    }

    /// One full probe of `target`: direct ping, then indirect, then suspect.
    async fn probe(&self, target: Member) {
        let period = self.state.config.gossip_period;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);

        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending_acks.insert(seq, ack_tx);

        // Re-dial if the mesh connection dropped.
        self.federation
            .ensure_connection(&target.server_id, &target.endpoint);
        self.federation.send_to(
            &target.server_id,
            GossipMessage::Ping {
                seq,
                from: self.state.server_id().to_string(),
                updates: self.state.membership.digest(MAX_DIGEST_ITEMS),
            },
        );

        let direct = tokio::time::timeout(period / 2, ack_rx).await;
        if direct.is_ok() {
            self.pending_acks.remove(&seq);
            return;
        }

        // No direct ack: ask k other members to probe on our behalf. The
        // original seq stays pending so a late direct ack still counts.
        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending_acks.insert(seq, ack_tx);

        let helpers: Vec<Member> = {
            let mut others: Vec<Member> = self
                .state
                .membership
                .alive_members()
                .into_iter()
                .filter(|m| m.server_id != target.server_id)
                .collect();
            others.shuffle(&mut rand::thread_rng());
            others.truncate(self.state.config.indirect_probes);
            others
        };

        for helper in &helpers {
            self.federation.send_to(
                &helper.server_id,
                GossipMessage::PingReq {
                    seq,
                    from: self.state.server_id().to_string(),
                    target: target.server_id.clone(),
                    updates: self.state.membership.digest(MAX_DIGEST_ITEMS),
                },
            );
        }

        let indirect = tokio::time::timeout(period / 2, ack_rx).await;
        self.pending_acks.remove(&seq);
        if indirect.is_ok() {
            return;
        }

        tracing::info!(
            peer = target.server_id.as_str(),
            helpers = helpers.len(),
            "Probe failed, suspecting member"
        );
        self.suspect(&target.server_id);
    }

    /// Mark a member suspect and arm the suspect → failed → removed timers.
    fn suspect(&self, server_id: &str) {
        if !self
            .state
            .membership
            .transition(server_id, MemberState::Suspect)
        {
            return;
        }
        let incarnation = match self.state.membership.get(server_id) {
            Some(member) => member.incarnation,
            None => return,
        };
        self.state.rebuild_routing();

        let swim = self.clone();
        let id = server_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(swim.state.config.suspect_timeout).await;
            swim.on_suspect_expiry(&id, incarnation);
        });
    }

    fn on_suspect_expiry(&self, server_id: &str, incarnation: u64) {
        // Refuted in the meantime: the alive record with a higher
        // incarnation makes this a no-op.
        match self.state.membership.get(server_id) {
            Some(member)
                if member.state == MemberState::Suspect
                    && member.incarnation == incarnation => {}
            _ => return,
        }
        if !self
            .state
            .membership
            .transition(server_id, MemberState::Failed)
        {
            return;
        }
        self.state.rebuild_routing();

        let swim = self.clone();
        let id = server_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(swim.state.config.failed_timeout).await;
            swim.on_failed_expiry(&id, incarnation);
        });
    }

    fn on_failed_expiry(&self, server_id: &str, incarnation: u64) {
        match self.state.membership.get(server_id) {
            Some(member)
                if member.state == MemberState::Failed
                    && member.incarnation == incarnation => {}
            _ => return,
        }
        if self.state.membership.remove(server_id) {
            tracing::info!(peer = server_id, "Member failed, removed from ring");
            self.federation.remove_peer(server_id);
            self.state.rebuild_routing();
        }
    }

    // ── Anti-entropy ──────────────────────────────────────────────────────

    async fn anti_entropy_loop(&self) {
        let mut interval = tokio::time::interval(self.state.config.state_exchange_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;

            let members = self.state.membership.alive_members();
            if let Some(member) = members.choose(&mut rand::thread_rng()) {
                self.federation
                    .ensure_connection(&member.server_id, &member.endpoint);
                self.federation.send_to(
                    &member.server_id,
                    GossipMessage::StatePush {
                        from: self.state.server_id().to_string(),
                        members: self.state.membership.snapshot(),
                    },
                );
            }
        }
    }

    // ── Inbound ───────────────────────────────────────────────────────────

    async fn inbound_loop(&self, mut rx: mpsc::UnboundedReceiver<(String, GossipMessage)>) {
        while let Some((from_peer, msg)) = rx.recv().await {
            self.handle_message(&from_peer, msg);
        }
    }

    /// Dispatch one gossip frame. Synchronous: nothing here suspends.
    pub fn handle_message(&self, from_peer: &str, msg: GossipMessage) {
        tracing::trace!(peer = from_peer, "Gossip frame");
        match msg {
            GossipMessage::Hello { member } => {
                let endpoint = member.endpoint.clone();
                let id = member.server_id.clone();
                self.merge_updates(vec![member]);
                self.federation.ensure_connection(&id, &endpoint);
            }

            GossipMessage::Ping { seq, from, updates } => {
                self.merge_updates(updates);
                self.federation.send_to(
                    &from,
                    GossipMessage::Ack {
                        seq,
                        from: self.state.server_id().to_string(),
                        updates: self.state.membership.digest(MAX_DIGEST_ITEMS),
                    },
                );
            }

            GossipMessage::Ack { seq, updates, .. } => {
                self.merge_updates(updates);
                if let Some((_, waiter)) = self.pending_acks.remove(&seq) {
                    let _ = waiter.send(());
                }
                // An ack for a probe we ran on someone else's behalf:
                // relay it back to the origin.
                if let Some((_, probe)) = self.relayed.remove(&seq) {
                    self.federation.send_to(
                        &probe.origin,
                        GossipMessage::IndirectAck {
                            seq: probe.origin_seq,
                            from: self.state.server_id().to_string(),
                            target: probe.target,
                        },
                    );
                }
            }

            GossipMessage::PingReq {
                seq,
                from,
                target,
                updates,
            } => {
                self.merge_updates(updates);
                let local_seq = self.seq.fetch_add(1, Ordering::Relaxed);
                self.relayed.insert(
                    local_seq,
                    RelayedProbe {
                        origin: from,
                        origin_seq: seq,
                        target: target.clone(),
                    },
                );
                self.federation.send_to(
                    &target,
                    GossipMessage::Ping {
                        seq: local_seq,
                        from: self.state.server_id().to_string(),
                        updates: self.state.membership.digest(MAX_DIGEST_ITEMS),
                    },
                );
            }

            GossipMessage::IndirectAck { seq, .. } => {
                if let Some((_, waiter)) = self.pending_acks.remove(&seq) {
                    let _ = waiter.send(());
                }
            }

            GossipMessage::StatePush { from, members } => {
                self.merge_updates(members);
                self.federation.send_to(
                    &from,
                    GossipMessage::StatePull {
                        from: self.state.server_id().to_string(),
                        members: self.state.membership.snapshot(),
                    },
                );
            }

            GossipMessage::StatePull { members, .. } => {
                self.merge_updates(members);
            }
        }
    }

    /// Merge a batch of updates; rebuild routing and dial new members when
    /// the view changed.
    pub fn merge_updates(&self, updates: Vec<Member>) {
        let mut changed = false;
        for update in updates {
            match self.state.membership.merge(update) {
                MergeOutcome::Applied => changed = true,
                // The bumped incarnation rides on every subsequent digest.
                MergeOutcome::SelfRefuted => changed = true,
                MergeOutcome::Ignored => {}
            }
        }
        if changed {
            self.state.rebuild_routing();
            for member in self.state.membership.alive_members() {
                self.federation
                    .ensure_connection(&member.server_id, &member.endpoint);
            }
        }
    }

    /// Seed membership from a bootstrap peer list.
    pub fn seed_members(&self, members: Vec<Member>) {
        self.merge_updates(members);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ServerIdentity;
    use crate::membership::MembershipTable;
    use crate::state::ServerConfig;

    fn harness() -> (Swim, mpsc::UnboundedReceiver<(String, GossipMessage)>) {
        let state = ServerState::new(ServerConfig::default(), ServerIdentity::ephemeral());
        let (tx, rx) = mpsc::unbounded_channel();
        let federation = Federation::new(
            Arc::new(MembershipTable::new(
                state.server_id(),
                &state.config.endpoint,
                &state.config.region,
            )),
            tx,
        );
        (Swim::new(state, federation), rx)
    }

    fn member(id: &str, state: MemberState, incarnation: u64) -> Member {
        Member {
            server_id: id.to_string(),
            endpoint: format!("wss://{}.example.com", id),
            region: "test".to_string(),
            state,
            incarnation,
            last_change_at: 0,
        }
    }

    #[tokio::test]
    async fn test_ping_answered_with_ack() {
        let (swim, _rx) = harness();
        let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
        swim.federation.register_inbound("s2", peer_tx);

        swim.handle_message(
            "s2",
            GossipMessage::Ping {
                seq: 42,
                from: "s2".to_string(),
                updates: vec![member("s2", MemberState::Alive, 0)],
            },
        );

        match peer_rx.try_recv().unwrap() {
            GossipMessage::Ack { seq, from, updates } => {
                assert_eq!(seq, 42);
                assert_eq!(from, swim.state.server_id());
                // Digest always carries our own record.
                assert!(updates.iter().any(|m| m.server_id == from));
            }
            other => panic!("expected ack, got {:?}", other),
        }

        // The pinging peer was learned through the piggybacked digest.
        assert!(swim.state.membership.get("s2").is_some());
    }

    #[tokio::test]
    async fn test_ping_req_relays_probe_and_indirect_ack() {
        let (swim, _rx) = harness();
        let (origin_tx, mut origin_rx) = mpsc::unbounded_channel();
        let (target_tx, mut target_rx) = mpsc::unbounded_channel();
        swim.federation.register_inbound("origin", origin_tx);
        swim.federation.register_inbound("target", target_tx);

        swim.handle_message(
            "origin",
            GossipMessage::PingReq {
                seq: 7,
                from: "origin".to_string(),
                target: "target".to_string(),
                updates: vec![],
            },
        );

        // We probed the target with a fresh local seq.
        let local_seq = match target_rx.try_recv().unwrap() {
            GossipMessage::Ping { seq, .. } => seq,
            other => panic!("expected relayed ping, got {:?}", other),
        };

        // The target acks; the origin gets an indirect ack with its seq.
        swim.handle_message(
            "target",
            GossipMessage::Ack {
                seq: local_seq,
                from: "target".to_string(),
                updates: vec![],
            },
        );
        match origin_rx.try_recv().unwrap() {
            GossipMessage::IndirectAck { seq, target, .. } => {
                assert_eq!(seq, 7);
                assert_eq!(target, "target");
            }
            other => panic!("expected indirect_ack, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_state_push_answered_with_pull() {
        let (swim, _rx) = harness();
        let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
        swim.federation.register_inbound("s2", peer_tx);

        swim.handle_message(
            "s2",
            GossipMessage::StatePush {
                from: "s2".to_string(),
                members: vec![
                    member("s2", MemberState::Alive, 0),
                    member("s3", MemberState::Alive, 1),
                ],
            },
        );

        assert!(swim.state.membership.get("s3").is_some());
        assert!(matches!(
            peer_rx.try_recv().unwrap(),
            GossipMessage::StatePull { .. }
        ));
        // Routing now spans all three servers.
        assert_eq!(swim.state.routing.server_count(), 3);
    }

    #[tokio::test]
    async fn test_merge_rebuilds_routing() {
        let (swim, _rx) = harness();
        assert_eq!(swim.state.routing.server_count(), 1);
        swim.merge_updates(vec![member("s2", MemberState::Alive, 0)]);
        assert_eq!(swim.state.routing.server_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspect_walks_to_failed_and_removed() {
        let (swim, _rx) = harness();
        swim.merge_updates(vec![member("s2", MemberState::Alive, 0)]);

        swim.suspect("s2");
        assert_eq!(
            swim.state.membership.get("s2").unwrap().state,
            MemberState::Suspect
        );

        // Past the suspect timeout (2 s).
        tokio::time::sleep(std::time::Duration::from_millis(2100)).await;
        assert_eq!(
            swim.state.membership.get("s2").unwrap().state,
            MemberState::Failed
        );

        // Past the failed timeout (4 s).
        tokio::time::sleep(std::time::Duration::from_millis(4100)).await;
        assert!(swim.state.membership.get("s2").is_none());
        assert_eq!(swim.state.routing.server_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refutation_cancels_suspicion() {
        let (swim, _rx) = harness();
        swim.merge_updates(vec![member("s2", MemberState::Alive, 0)]);
        swim.suspect("s2");

        // s2 refutes with a bumped incarnation before the timer fires.
        swim.merge_updates(vec![member("s2", MemberState::Alive, 1)]);
        assert_eq!(
            swim.state.membership.get("s2").unwrap().state,
            MemberState::Alive
        );

        tokio::time::sleep(std::time::Duration::from_secs(10)).await;
        // Stale timers were no-ops: still alive, still in the ring.
        assert_eq!(
            swim.state.membership.get("s2").unwrap().state,
            MemberState::Alive
        );
        assert_eq!(swim.state.routing.server_count(), 2);
    }

    #[tokio::test]
    async fn test_rumor_about_self_is_refuted() {
        let (swim, _rx) = harness();
        let self_id = swim.state.server_id().to_string();
        swim.merge_updates(vec![member(&self_id, MemberState::Suspect, 0)]);
        assert_eq!(swim.state.membership.self_incarnation(), 1);
        // And the next digest advertises the bumped incarnation.
        let digest = swim.state.membership.digest(MAX_DIGEST_ITEMS);
        assert!(digest
            .iter()
            .any(|m| m.server_id == self_id && m.incarnation == 1));
    }
}
