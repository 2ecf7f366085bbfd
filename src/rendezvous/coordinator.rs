//! Distributed rendezvous coordinator.
//!
//! Glues the routing table to the local rendezvous registry. One
//! `register_rendezvous` call may span several responsible servers: the
//! local slice is answered directly, and every remote slice comes back as
//! a redirect advisory the client reissues itself. The server never
//! forwards on the client's behalf — it holds no credentials for other
//! servers and stays stateless across the call.

use std::collections::HashMap;
use std::sync::Arc;

use crate::protocol::{
    RedirectAdvisory, RendezvousLocal, ServerMessage,
};
use crate::relays::validate_peer_id;
use crate::ring::RoutingTable;
use crate::state::ConnSender;

use super::{validate_batch, RendezvousRegistry};

pub struct Coordinator {
    routing: Arc<RoutingTable>,
    registry: Arc<RendezvousRegistry>,
}

impl Coordinator {
    pub fn new(routing: Arc<RoutingTable>, registry: Arc<RendezvousRegistry>) -> Self {
        Self { routing, registry }
    }

    pub fn registry(&self) -> &Arc<RendezvousRegistry> {
        &self.registry
    }

    /// Handle one `register_rendezvous` call. Emits `rendezvous_match`
    /// pushes to earlier-registered local peers before returning the
    /// registering client's reply.
    #[allow(clippy::too_many_arguments)]
    pub fn register(
        &self,
        peer_id: &str,
        daily_points: &[String],
        hourly_tokens: &[String],
        dead_drop: Option<&str>,
        dead_drops: Option<&HashMap<String, String>>,
        relay_id: Option<&str>,
        sender: ConnSender,
    ) -> Result<ServerMessage, String> {
        if !validate_peer_id(peer_id) {
            return Err("Invalid peer_id".to_string());
        }

        let drop_refs: Vec<&str> = dead_drop
            .iter()
            .copied()
            .chain(dead_drops.iter().flat_map(|m| m.values().map(String::as_str)))
            .collect();
        validate_batch(daily_points, hourly_tokens, &drop_refs)?;

        // Resolve the dead drop for each point: the per-point map wins,
        // the legacy single field covers the rest of the batch.
        let resolve_drop = |point: &str| -> Option<String> {
            dead_drops
                .and_then(|m| m.get(point).cloned())
                .or_else(|| dead_drop.map(str::to_string))
        };

        // Partition into the slice this server owns and per-server remote
        // slices.
        let mut local_daily: Vec<(String, Option<String>)> = Vec::new();
        let mut local_hourly: Vec<String> = Vec::new();
        let mut advisories: HashMap<String, RedirectAdvisory> = HashMap::new();

        for point in daily_points {
            let decision = self.routing.route(point);
            if decision.is_local() {
                local_daily.push((point.clone(), resolve_drop(point)));
            }
            for target in &decision.remote {
                advisories
                    .entry(target.server_id.clone())
                    .or_insert_with(|| RedirectAdvisory {
                        server_id: target.server_id.clone(),
                        endpoint: target.endpoint.clone(),
                        daily_points: Vec::new(),
                        hourly_tokens: Vec::new(),
                    })
                    .daily_points
                    .push(point.clone());
            }
        }

        for token in hourly_tokens {
            let decision = self.routing.route(token);
            if decision.is_local() {
                local_hourly.push(token.clone());
            }
            for target in &decision.remote {
                advisories
                    .entry(target.server_id.clone())
                    .or_insert_with(|| RedirectAdvisory {
                        server_id: target.server_id.clone(),
                        endpoint: target.endpoint.clone(),
                        daily_points: Vec::new(),
                        hourly_tokens: Vec::new(),
                    })
                    .hourly_tokens
                    .push(token.clone());
            }
        }

        // Answer the local slice.
        let dead_drop_matches = self
            .registry
            .register_daily(peer_id, &local_daily, relay_id);
        let live_matches = self
            .registry
            .register_hourly(peer_id, &local_hourly, relay_id);

        self.registry.bind_online(peer_id, sender);

        // Earlier-registered peers learn of the new arrival by push; the
        // registering peer learns of them through this call's return.
        // Pushes go out before the reply is sent.
        for matched in &live_matches {
            let delivered = self.registry.push_to_peer(
                &matched.peer_id,
                ServerMessage::RendezvousMatch {
                    token: matched.token.clone(),
                    peer_id: peer_id.to_string(),
                    relay_id: relay_id.map(str::to_string),
                },
            );
            if delivered {
                tracing::debug!(
                    token = matched.token.as_str(),
                    to = matched.peer_id.as_str(),
                    "Pushed rendezvous match"
                );
            }
        }

        let mut redirects: Vec<RedirectAdvisory> = advisories.into_values().collect();
        redirects.sort_by(|a, b| a.server_id.cmp(&b.server_id));

        tracing::info!(
            peer_id = peer_id,
            local_daily = local_daily.len(),
            local_hourly = local_hourly.len(),
            redirects = redirects.len(),
            "Rendezvous registration"
        );

        if redirects.is_empty() {
            Ok(ServerMessage::RendezvousResult {
                live_matches,
                dead_drops: dead_drop_matches,
            })
        } else {
            Ok(ServerMessage::RendezvousPartial {
                local: RendezvousLocal {
                    live_matches,
                    dead_drops: dead_drop_matches,
                },
                redirects,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::{Member, MemberState};
    use crate::ring::RoutingTable;
    use crate::state::Frame;
    use tokio::sync::mpsc;

    fn member(id: &str) -> Member {
        Member {
            server_id: id.to_string(),
            endpoint: format!("wss://{}.example.com", id),
            region: "test".to_string(),
            state: MemberState::Alive,
            incarnation: 0,
            last_change_at: 0,
        }
    }

    fn solo_coordinator() -> (Coordinator, Arc<RendezvousRegistry>) {
        let routing = Arc::new(RoutingTable::solo(&member("s1"), 32, 1));
        let registry = Arc::new(RendezvousRegistry::new());
        (Coordinator::new(routing, Arc::clone(&registry)), registry)
    }

    fn sender() -> (ConnSender, mpsc::UnboundedReceiver<Frame>) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn test_single_server_full_result() {
        let (coord, _) = solo_coordinator();
        let (tx, _rx) = sender();

        let reply = coord
            .register(
                "P1",
                &["dp_A".to_string()],
                &["ht_X".to_string()],
                Some("ctA"),
                None,
                Some("r1"),
                tx,
            )
            .unwrap();

        match reply {
            ServerMessage::RendezvousResult {
                live_matches,
                dead_drops,
            } => {
                assert!(live_matches.is_empty());
                assert!(dead_drops.is_empty());
            }
            other => panic!("expected rendezvous_result, got {:?}", other),
        }
    }

    #[test]
    fn test_second_peer_sees_dead_drop_and_first_gets_push() {
        let (coord, _) = solo_coordinator();
        let (tx1, mut rx1) = sender();
        let (tx2, _rx2) = sender();

        coord
            .register("P1", &["dp_A".to_string()], &["ht_X".to_string()], Some("ctA"), None, Some("r1"), tx1)
            .unwrap();

        let reply = coord
            .register("P2", &["dp_A".to_string()], &["ht_X".to_string()], Some("ctB"), None, Some("r2"), tx2)
            .unwrap();

        match reply {
            ServerMessage::RendezvousResult {
                live_matches,
                dead_drops,
            } => {
                assert_eq!(dead_drops.len(), 1);
                assert_eq!(dead_drops[0].peer_id, "P1");
                assert_eq!(dead_drops[0].payload.as_deref(), Some("ctA"));
                assert_eq!(live_matches.len(), 1);
                assert_eq!(live_matches[0].peer_id, "P1");
                assert_eq!(live_matches[0].relay_id.as_deref(), Some("r1"));
            }
            other => panic!("expected rendezvous_result, got {:?}", other),
        }

        // P1, still connected, is pushed the new arrival.
        match rx1.try_recv().unwrap() {
            Frame::Message(ServerMessage::RendezvousMatch {
                token,
                peer_id,
                relay_id,
            }) => {
                assert_eq!(token, "ht_X");
                assert_eq!(peer_id, "P2");
                assert_eq!(relay_id.as_deref(), Some("r2"));
            }
            other => panic!("expected rendezvous_match push, got {:?}", other),
        }
    }

    #[test]
    fn test_per_point_dead_drops_take_precedence() {
        let (coord, registry) = solo_coordinator();
        let (tx, _rx) = sender();

        let mut drops = HashMap::new();
        drops.insert("dp_A".to_string(), "ct_for_A".to_string());

        coord
            .register(
                "P1",
                &["dp_A".to_string(), "dp_B".to_string()],
                &[],
                Some("legacy"),
                Some(&drops),
                None,
                tx,
            )
            .unwrap();

        let a = registry.get_daily_point("dp_A");
        let b = registry.get_daily_point("dp_B");
        assert_eq!(a[0].dead_drop.as_deref(), Some("ct_for_A"));
        assert_eq!(b[0].dead_drop.as_deref(), Some("legacy"));
    }

    #[test]
    fn test_remote_points_become_redirect_advisories() {
        // Two servers, R=1: some keys must belong to the other server.
        let routing = Arc::new(RoutingTable::solo(&member("s1"), 64, 1));
        routing.rebuild(&[member("s1"), member("s2")]);
        let registry = Arc::new(RendezvousRegistry::new());
        let coord = Coordinator::new(Arc::clone(&routing), Arc::clone(&registry));

        // Find a point owned by s2 alone.
        let remote_point = (0..500)
            .map(|i| format!("dp_{}", i))
            .find(|p| !routing.route(p).is_local())
            .expect("some key must route to s2");

        let (tx, _rx) = sender();
        let reply = coord
            .register("P1", &[remote_point.clone()], &[], Some("ct"), None, Some("r"), tx)
            .unwrap();

        match reply {
            ServerMessage::RendezvousPartial { local, redirects } => {
                assert!(local.live_matches.is_empty());
                assert!(local.dead_drops.is_empty());
                assert_eq!(redirects.len(), 1);
                assert_eq!(redirects[0].server_id, "s2");
                assert_eq!(redirects[0].endpoint, "wss://s2.example.com");
                assert_eq!(redirects[0].daily_points, vec![remote_point.clone()]);
                assert!(redirects[0].hourly_tokens.is_empty());
            }
            other => panic!("expected rendezvous_partial, got {:?}", other),
        }

        // Nothing was registered locally for the remote point.
        assert!(registry.get_daily_point(&remote_point).is_empty());
    }

    #[test]
    fn test_redirects_merge_daily_and_hourly_per_server() {
        let routing = Arc::new(RoutingTable::solo(&member("s1"), 64, 1));
        routing.rebuild(&[member("s1"), member("s2")]);
        let registry = Arc::new(RendezvousRegistry::new());
        let coord = Coordinator::new(Arc::clone(&routing), registry);

        let remote_point = (0..500)
            .map(|i| format!("dp_{}", i))
            .find(|p| !routing.route(p).is_local())
            .unwrap();
        let remote_token = (0..500)
            .map(|i| format!("ht_{}", i))
            .find(|t| !routing.route(t).is_local())
            .unwrap();

        let (tx, _rx) = sender();
        let reply = coord
            .register(
                "P1",
                &[remote_point.clone()],
                &[remote_token.clone()],
                None,
                None,
                None,
                tx,
            )
            .unwrap();

        match reply {
            ServerMessage::RendezvousPartial { redirects, .. } => {
                assert_eq!(redirects.len(), 1, "daily and hourly merged by server");
                assert_eq!(redirects[0].daily_points, vec![remote_point]);
                assert_eq!(redirects[0].hourly_tokens, vec![remote_token]);
            }
            other => panic!("expected rendezvous_partial, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_batch_rejected() {
        let (coord, _) = solo_coordinator();
        let (tx, _rx) = sender();
        let many: Vec<String> = (0..65).map(|i| format!("p{}", i)).collect();
        assert!(coord
            .register("P1", &many, &[], None, None, None, tx)
            .is_err());
    }

    #[test]
    fn test_bad_peer_id_rejected() {
        let (coord, _) = solo_coordinator();
        let (tx, _rx) = sender();
        assert!(coord
            .register("bad peer id", &[], &[], None, None, None, tx)
            .is_err());
    }
}
