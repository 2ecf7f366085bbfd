//! Server state management.
//!
//! One `ServerState` is shared by every connection task and periodic job.
//! The registries are concurrent (DashMap) so no operation holds a lock
//! across an await point; the ring snapshot is copy-on-write.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::federation::Federation;
use crate::identity::ServerIdentity;
use crate::limiter;
use crate::membership::{Member, MembershipTable};
use crate::pairing::SignalingRegistry;
use crate::protocol::ServerMessage;
use crate::relays::RelayRegistry;
use crate::rendezvous::coordinator::Coordinator;
use crate::rendezvous::store::RendezvousStore;
use crate::rendezvous::RendezvousRegistry;
use crate::ring::{RoutingTable, DEFAULT_REPLICATION, DEFAULT_VNODES};

/// Per-process connection identifier.
pub type ConnId = u64;

/// What a connection's egress task may be asked to do.
#[derive(Debug)]
pub enum Frame {
    Message(ServerMessage),
    /// Close the socket with a WebSocket close code.
    Close { code: u16, reason: String },
}

/// A connected client's sender channel.
pub type ConnSender = mpsc::UnboundedSender<Frame>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Public WebSocket URL of this server, as advertised to clients,
    /// the bootstrap registry, and the ring.
    pub endpoint: String,
    pub region: String,
    /// Directory for the identity key and rendezvous store. In-memory
    /// only when unset.
    pub data_dir: Option<String>,
    /// Bearer secret protecting `/stats`. Unauthenticated when unset.
    pub stats_secret: Option<String>,

    pub replication: usize,
    pub vnodes_per_server: usize,

    pub pair_timeout: Duration,
    pub pair_warning_lead: Duration,

    pub relay_heartbeat_timeout: Duration,
    pub sweep_interval: Duration,

    pub rate_window: Duration,
    pub rate_max_messages: u32,

    /// When set, sockets must attest within this grace period.
    pub attestation_grace: Option<Duration>,

    pub bootstrap_url: Option<String>,
    pub bootstrap_heartbeat: Duration,

    pub gossip_period: Duration,
    pub suspect_timeout: Duration,
    pub failed_timeout: Duration,
    pub indirect_probes: usize,
    pub state_exchange_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            endpoint: "ws://127.0.0.1:8080".to_string(),
            region: "local".to_string(),
            data_dir: None,
            stats_secret: None,
            replication: DEFAULT_REPLICATION,
            vnodes_per_server: DEFAULT_VNODES,
            pair_timeout: Duration::from_secs(120),
            pair_warning_lead: Duration::from_secs(30),
            relay_heartbeat_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
            rate_window: limiter::DEFAULT_WINDOW,
            rate_max_messages: limiter::DEFAULT_MAX_MESSAGES,
            attestation_grace: None,
            bootstrap_url: None,
            bootstrap_heartbeat: Duration::from_secs(60),
            gossip_period: Duration::from_secs(1),
            suspect_timeout: Duration::from_secs(2),
            failed_timeout: Duration::from_secs(4),
            indirect_probes: 3,
            state_exchange_interval: Duration::from_secs(3),
        }
    }
}

/// Shared server state.
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<ServerConfig>,
    pub identity: Arc<ServerIdentity>,

    /// Pairing codes and pair requests.
    pub signaling: Arc<SignalingRegistry>,
    /// Relay-capable peers and the introducer.
    pub relays: Arc<RelayRegistry>,
    /// Routing + local rendezvous tables.
    pub coordinator: Arc<Coordinator>,
    pub routing: Arc<RoutingTable>,
    /// SWIM view of the federation.
    pub membership: Arc<MembershipTable>,
    /// Mesh connections to other servers. None in standalone mode.
    pub federation: Option<Federation>,

    open_connections: Arc<AtomicUsize>,
    next_conn_id: Arc<AtomicU64>,
    started_at: Instant,
}

impl ServerState {
    /// Build the state for a standalone server (no federation attached yet).
    pub fn new(config: ServerConfig, identity: ServerIdentity) -> Self {
        let identity = Arc::new(identity);
        let membership = Arc::new(MembershipTable::new(
            &identity.server_id,
            &config.endpoint,
            &config.region,
        ));
        let routing = Arc::new(RoutingTable::solo(
            &membership.self_record(),
            config.vnodes_per_server,
            config.replication,
        ));

        let registry = match config
            .data_dir
            .as_deref()
            .map(|dir| std::path::Path::new(dir).join("rendezvous.db"))
        {
            Some(path) => match RendezvousStore::open(&path) {
                Ok(store) => RendezvousRegistry::with_store(store),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        path = %path.display(),
                        "Rendezvous store unavailable, running in-memory"
                    );
                    RendezvousRegistry::new()
                }
            },
            None => RendezvousRegistry::new(),
        };
        let rendezvous = Arc::new(registry);
        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&routing),
            Arc::clone(&rendezvous),
        ));

        Self {
            signaling: Arc::new(SignalingRegistry::new(
                config.pair_timeout,
                config.pair_warning_lead,
            )),
            relays: Arc::new(RelayRegistry::new()),
            coordinator,
            routing,
            membership,
            federation: None,
            open_connections: Arc::new(AtomicUsize::new(0)),
            next_conn_id: Arc::new(AtomicU64::new(1)),
            started_at: Instant::now(),
            config: Arc::new(config),
            identity,
        }
    }

    /// Attach the federation mesh manager.
    pub fn with_federation(mut self, federation: Federation) -> Self {
        self.federation = Some(federation);
        self
    }

    pub fn rendezvous(&self) -> &Arc<RendezvousRegistry> {
        self.coordinator.registry()
    }

    pub fn server_id(&self) -> &str {
        &self.identity.server_id
    }

    pub fn self_member(&self) -> Member {
        self.membership.self_record()
    }

    /// Rebuild the routing snapshot from the current alive membership.
    pub fn rebuild_routing(&self) {
        self.routing.rebuild(&self.membership.ring_members());
    }

    // ── Connection bookkeeping ────────────────────────────────────────────

    pub fn allocate_conn_id(&self) -> ConnId {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn connection_opened(&self) {
        self.open_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.open_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn open_connections(&self) -> usize {
        self.open_connections.load(Ordering::Relaxed)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::MemberState;

    fn test_state() -> ServerState {
        ServerState::new(ServerConfig::default(), ServerIdentity::ephemeral())
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.replication, 2);
        assert_eq!(config.vnodes_per_server, 160);
        assert_eq!(config.pair_timeout, Duration::from_secs(120));
        assert_eq!(config.gossip_period, Duration::from_secs(1));
        assert_eq!(config.indirect_probes, 3);
    }

    #[test]
    fn test_state_creation() {
        let state = test_state();
        assert_eq!(state.open_connections(), 0);
        assert_eq!(state.signaling.active_codes(), 0);
        assert_eq!(state.relays.peer_count(), 0);
        assert_eq!(state.routing.server_count(), 1);
        assert!(state.federation.is_none());
    }

    #[test]
    fn test_conn_ids_are_unique() {
        let state = test_state();
        let a = state.allocate_conn_id();
        let b = state.allocate_conn_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_rebuild_routing_tracks_membership() {
        let state = test_state();
        state.membership.merge(Member {
            server_id: "other".to_string(),
            endpoint: "wss://other.example.com".to_string(),
            region: "eu".to_string(),
            state: MemberState::Alive,
            incarnation: 0,
            last_change_at: 0,
        });
        state.rebuild_routing();
        assert_eq!(state.routing.server_count(), 2);
    }

    #[test]
    fn test_connection_counters() {
        let state = test_state();
        state.connection_opened();
        state.connection_opened();
        state.connection_closed();
        assert_eq!(state.open_connections(), 1);
    }
}
