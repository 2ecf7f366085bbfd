//! Waypost — federated signaling and rendezvous server.
//!
//! A single long-running process that provides:
//!
//! 1. **Signaling**: ephemeral pairing codes, mutual-approval pair
//!    requests, and WebRTC / call-signal forwarding between peers.
//!
//! 2. **Relay coordination**: a load-aware registry of peers willing to
//!    relay traffic when direct NAT traversal fails, plus opaque
//!    introduction envelopes routed through a chosen relay.
//!
//! 3. **Distributed rendezvous**: previously-paired peers meet again at
//!    per-day points and per-hour tokens, sharded across servers by a
//!    consistent-hash ring; encrypted dead drops carry routing hints to
//!    offline counterparts.
//!
//! 4. **Federation**: a SWIM gossip mesh keeps the server set converged
//!    and the ring identical everywhere; an external bootstrap index
//!    makes cold-started servers discoverable.
//!
//! **Privacy**: the server never sees plaintext. Pairing payloads, dead
//! drops, and introduction envelopes are all opaque ciphertext.

mod bootstrap;
mod federation;
mod handler;
mod identity;
mod limiter;
mod membership;
mod pairing;
mod protocol;
mod relays;
mod rendezvous;
mod ring;
mod state;
mod swim;

use std::path::PathBuf;
use std::time::Duration;

use axum::{
    extract::{State, WebSocketUpgrade},
    http::{HeaderMap, Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use clap::Parser;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use federation::Federation;
use identity::ServerIdentity;
use state::{ServerConfig, ServerState};
use swim::Swim;

/// Client and federation frames are capped at 1 MiB; larger frames are
/// rejected by the WebSocket layer with close code 1009.
const MAX_FRAME_BYTES: usize = 1024 * 1024;

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "waypost", version, about = "Federated signaling and rendezvous server")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080, env = "WAYPOST_PORT")]
    port: u16,

    /// Public WebSocket URL of this server (advertised to clients, the
    /// ring, and the bootstrap index)
    #[arg(long, env = "WAYPOST_ENDPOINT")]
    endpoint: Option<String>,

    /// Region tag (e.g. "us-east", "eu-west")
    #[arg(long, default_value = "us-east", env = "WAYPOST_REGION")]
    region: String,

    /// Data directory for the identity key and the rendezvous store.
    /// Runs fully in-memory when unset.
    #[arg(long, env = "WAYPOST_DATA_DIR")]
    data_dir: Option<String>,

    /// Identity key path. Defaults to {data_dir}/identity.key.
    #[arg(long, env = "WAYPOST_IDENTITY_KEY")]
    identity_key: Option<PathBuf>,

    /// Shared secret protecting GET /stats
    #[arg(long, env = "WAYPOST_STATS_SECRET")]
    stats_secret: Option<String>,

    /// Bootstrap index base URL (e.g. https://index.example.com)
    #[arg(long, env = "WAYPOST_BOOTSTRAP_URL")]
    bootstrap_url: Option<String>,

    /// Bootstrap heartbeat interval in seconds
    #[arg(long, default_value_t = 60, env = "WAYPOST_BOOTSTRAP_HEARTBEAT_SECS")]
    bootstrap_heartbeat_secs: u64,

    /// Peer server WebSocket URLs to seed the mesh with (comma-separated)
    #[arg(long, env = "WAYPOST_PEERS", value_delimiter = ',')]
    peers: Vec<String>,

    /// Replication factor for the rendezvous ring
    #[arg(long, default_value_t = 2, env = "WAYPOST_REPLICATION")]
    replication: usize,

    /// Virtual nodes per server on the ring
    #[arg(long, default_value_t = 160, env = "WAYPOST_VNODES")]
    vnodes: usize,

    /// Pair request timeout in seconds
    #[arg(long, default_value_t = 120, env = "WAYPOST_PAIR_TIMEOUT_SECS")]
    pair_timeout_secs: u64,

    /// Pre-expiry warning lead in seconds
    #[arg(long, default_value_t = 30, env = "WAYPOST_PAIR_WARNING_SECS")]
    pair_warning_secs: u64,

    /// Relay-peer heartbeat timeout in seconds
    #[arg(long, default_value_t = 60, env = "WAYPOST_HEARTBEAT_TIMEOUT_SECS")]
    heartbeat_timeout_secs: u64,

    /// Cleanup sweep interval in seconds
    #[arg(long, default_value_t = 30, env = "WAYPOST_SWEEP_INTERVAL_SECS")]
    sweep_interval_secs: u64,

    /// Rate-limit window in milliseconds
    #[arg(long, default_value_t = 60_000, env = "WAYPOST_RATE_WINDOW_MS")]
    rate_window_ms: u64,

    /// Messages allowed per rate-limit window
    #[arg(long, default_value_t = 100, env = "WAYPOST_RATE_MAX_MSGS")]
    rate_max_messages: u32,

    /// Attestation grace period in seconds; unattested sockets are closed
    /// after it. Gate disabled when unset.
    #[arg(long, env = "WAYPOST_ATTESTATION_GRACE_SECS")]
    attestation_grace_secs: Option<u64>,

    /// SWIM gossip period in milliseconds
    #[arg(long, default_value_t = 1000, env = "WAYPOST_GOSSIP_PERIOD_MS")]
    gossip_period_ms: u64,

    /// SWIM suspect timeout in milliseconds
    #[arg(long, default_value_t = 2000, env = "WAYPOST_SUSPECT_TIMEOUT_MS")]
    suspect_timeout_ms: u64,

    /// SWIM failed timeout in milliseconds
    #[arg(long, default_value_t = 4000, env = "WAYPOST_FAILED_TIMEOUT_MS")]
    failed_timeout_ms: u64,

    /// Indirect probes per failed direct ping
    #[arg(long, default_value_t = 3, env = "WAYPOST_INDIRECT_PROBES")]
    indirect_probes: usize,

    /// Anti-entropy state exchange interval in milliseconds
    #[arg(long, default_value_t = 3000, env = "WAYPOST_STATE_EXCHANGE_MS")]
    state_exchange_ms: u64,
}

impl Args {
    fn into_config(self) -> (ServerConfig, Option<PathBuf>, Option<String>, Vec<String>) {
        let endpoint = self
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("ws://0.0.0.0:{}", self.port));
        let identity_key = self.identity_key.clone().or_else(|| {
            self.data_dir
                .as_deref()
                .map(|dir| PathBuf::from(dir).join("identity.key"))
        });
        let config = ServerConfig {
            port: self.port,
            endpoint,
            region: self.region,
            data_dir: self.data_dir,
            stats_secret: self.stats_secret,
            replication: self.replication.max(1),
            vnodes_per_server: self.vnodes.max(1),
            pair_timeout: Duration::from_secs(self.pair_timeout_secs),
            pair_warning_lead: Duration::from_secs(self.pair_warning_secs),
            relay_heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            rate_window: Duration::from_millis(self.rate_window_ms),
            rate_max_messages: self.rate_max_messages,
            attestation_grace: self.attestation_grace_secs.map(Duration::from_secs),
            bootstrap_url: self.bootstrap_url.clone(),
            bootstrap_heartbeat: Duration::from_secs(self.bootstrap_heartbeat_secs),
            gossip_period: Duration::from_millis(self.gossip_period_ms),
            suspect_timeout: Duration::from_millis(self.suspect_timeout_ms),
            failed_timeout: Duration::from_millis(self.failed_timeout_ms),
            indirect_probes: self.indirect_probes,
            state_exchange_interval: Duration::from_millis(self.state_exchange_ms),
        };
        (config, identity_key, self.bootstrap_url, self.peers)
    }
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // Install rustls crypto provider for outbound federation TLS.
    let _ = rustls::crypto::ring::default_provider().install_default();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "waypost=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();
    let (config, identity_key, bootstrap_url, seed_peers) = args.into_config();

    let identity = match &identity_key {
        Some(path) => match ServerIdentity::load_or_generate(path) {
            Ok(identity) => identity,
            Err(e) => {
                tracing::error!(error = %e, path = %path.display(), "Cannot load identity key");
                std::process::exit(1);
            }
        },
        None => {
            tracing::warn!("No data dir or identity key configured, using ephemeral identity");
            ServerIdentity::ephemeral()
        }
    };

    tracing::info!(
        server_id = identity.server_id.as_str(),
        node_id = identity.node_id.as_str(),
        endpoint = config.endpoint.as_str(),
        region = config.region.as_str(),
        "Server identity"
    );

    // ── Federation + SWIM setup ───────────────────────────────────────────

    let state = ServerState::new(config, identity);
    let (inbound_tx, inbound_rx) = tokio::sync::mpsc::unbounded_channel();
    let federation = Federation::new(state.membership.clone(), inbound_tx);
    let state = state.with_federation(federation.clone());
    let swim = Swim::spawn(state.clone(), federation.clone(), inbound_rx);

    let seed_peers: Vec<String> = seed_peers
        .into_iter()
        .filter(|url| !url.trim().is_empty())
        .collect();
    for peer in &seed_peers {
        tracing::info!(peer = peer.as_str(), "Dialing seed peer");
        federation.dial_seed(peer);
    }

    // ── Bootstrap client ──────────────────────────────────────────────────

    let bootstrap_client = bootstrap_url.as_deref().map(bootstrap::BootstrapClient::new);
    if let Some(client) = bootstrap_client {
        let bootstrap_state = state.clone();
        let bootstrap_swim = swim.clone();
        tokio::spawn(async move {
            bootstrap::run(client, bootstrap_state, bootstrap_swim).await;
        });
    } else {
        tracing::info!("Bootstrap disabled (no index URL configured)");
    }

    // ── Periodic sweeps ───────────────────────────────────────────────────

    let sweep_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_state.config.sweep_interval);
        loop {
            interval.tick().await;
            sweep_state.rendezvous().sweep();
            sweep_state
                .relays
                .sweep_stale(sweep_state.config.relay_heartbeat_timeout);
        }
    });

    // ── HTTP surface ──────────────────────────────────────────────────────

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET])
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(ws_handler))
        .route("/federation", get(federation_ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state.clone())
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", state.config.port);
    tracing::info!(addr = addr.as_str(), "Waypost server starting");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind address");

    let shutdown_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown(shutdown_state).await;
        })
        .await
        .expect("Server error");
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Ordered shutdown: stop taking traffic (axum drains), close client
/// sockets, tell the federation we left, unregister from the bootstrap
/// index.
async fn shutdown(state: ServerState) {
    tracing::info!("Shutting down");
    state.signaling.close_all(1001, "server shutting down");
    state.relays.close_all(1001, "server shutting down");

    // A left tombstone dominates our alive record; peers drop us from the
    // ring without walking us through suspect/failed.
    if let Some(federation) = &state.federation {
        let mut tombstone = state.self_member();
        tombstone.state = membership::MemberState::Left;
        tombstone.incarnation += 1;
        federation.broadcast(protocol::GossipMessage::StatePush {
            from: state.server_id().to_string(),
            members: vec![tombstone],
        });
    }

    if let Some(url) = &state.config.bootstrap_url {
        let client = bootstrap::BootstrapClient::new(url);
        let unregister = client.unregister(state.server_id());
        match tokio::time::timeout(Duration::from_secs(5), unregister).await {
            Ok(Ok(())) => tracing::info!("Unregistered from bootstrap index"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Bootstrap unregister failed"),
            Err(_) => tracing::warn!("Bootstrap unregister timed out"),
        }
    }
}

// ── Route Handlers ────────────────────────────────────────────────────────────

/// WebSocket upgrade for client connections.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<ServerState>,
) -> impl IntoResponse {
    ws.max_frame_size(MAX_FRAME_BYTES)
        .max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handler::handle_websocket(socket, state))
}

/// WebSocket upgrade for server-to-server gossip.
async fn federation_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<ServerState>,
) -> impl IntoResponse {
    ws.max_frame_size(MAX_FRAME_BYTES)
        .max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handler::handle_federation_peer(socket, state))
}

/// Health check. Always 200, never authenticated.
async fn health_handler(State(state): State<ServerState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "server_id": state.server_id(),
        "uptime": state.uptime_secs(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Full statistics. Requires the bearer secret when one is configured.
async fn stats_handler(
    State(state): State<ServerState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Some(secret) = &state.config.stats_secret {
        let authorized = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(|token| token == secret)
            .unwrap_or(false);
        if !authorized {
            return (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"})))
                .into_response();
        }
    }

    Json(json!({
        "open_connections": state.open_connections(),
        "active_pairing_codes": state.signaling.active_codes(),
        "relay_peers": state.relays.peer_count(),
        "rendezvous_daily_entries": state.rendezvous().daily_size(),
        "rendezvous_hourly_entries": state.rendezvous().hourly_size(),
        "known_members": state.membership.len(),
        "ring_servers": state.routing.server_count(),
        "connected_peers": state
            .federation
            .as_ref()
            .map(|f| f.connected_peer_count())
            .unwrap_or(0),
        "uptime": state.uptime_secs(),
    }))
    .into_response()
}

/// Entropy and connection counters.
async fn metrics_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let signaling = state.signaling.metrics();
    Json(json!({
        "open_connections": state.open_connections(),
        "signaling": signaling,
        "relay_peers": state.relays.peer_count(),
    }))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
