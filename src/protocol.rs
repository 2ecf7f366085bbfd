//! Wire protocol message definitions.
//!
//! The server speaks a simple JSON-over-WebSocket protocol on two paths:
//! `/` for clients and `/federation` for server-to-server gossip.
//! Signal payloads, dead drops, and introduction envelopes are opaque to
//! the server — E2E encryption happens client-side.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::membership::Member;

// ── Client → Server ───────────────────────────────────────────────────────────

/// Messages sent from a client to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Register this connection. Carries either `pairing_code` + `public_key`
    /// (signaling registration) or `peer_id` (relay registration) — the two
    /// shapes share the `register` tag and the handler branches on which
    /// field is present.
    Register {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pairing_code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        public_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_connections: Option<u32>,
    },

    /// Ask another peer (by pairing code) to pair with us.
    PairRequest {
        target_code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        proposed_name: Option<String>,
    },

    /// Accept or reject a pending pair request.
    PairResponse {
        target_code: String,
        accepted: bool,
    },

    /// WebRTC SDP offer forwarded to a paired peer.
    Offer { target: String, payload: Value },
    /// WebRTC SDP answer forwarded to a paired peer.
    Answer { target: String, payload: Value },
    /// Trickle ICE candidate forwarded to a paired peer.
    IceCandidate { target: String, payload: Value },

    /// VoIP call signaling — all carry a `call_id` (UUID v4) inside payload.
    CallOffer { target: String, payload: Value },
    CallAnswer { target: String, payload: Value },
    CallReject { target: String, payload: Value },
    CallHangup { target: String, payload: Value },
    CallIce { target: String, payload: Value },

    /// Register daily meeting points and hourly tokens for reconnection.
    /// `dead_drops` maps individual points to ciphertexts; the legacy single
    /// `dead_drop` applies to every point in the batch.
    RegisterRendezvous {
        peer_id: String,
        #[serde(default)]
        daily_points: Vec<String>,
        #[serde(default)]
        hourly_tokens: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dead_drop: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dead_drops: Option<HashMap<String, String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        relay_id: Option<String>,
    },

    /// Ask for a load-sorted list of relay peers.
    GetRelays {
        peer_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        count: Option<usize>,
    },

    /// Relay load report.
    UpdateLoad {
        peer_id: String,
        connected_count: u32,
    },

    /// Relay liveness.
    Heartbeat { peer_id: String },

    /// Route an opaque introduction envelope through a chosen relay to a
    /// peer known only by source ID.
    Introduction {
        relay_id: String,
        target_source_id: String,
        payload: String,
    },

    /// Sent by a relay: deliver an introduction envelope to one of our
    /// locally-connected peers.
    IntroductionForward {
        from_source_id: String,
        target_source_id: String,
        payload: String,
    },

    /// Sent by a relay: the introduction target was not among its peers.
    /// Routed back to the originator.
    IntroductionError {
        to_source_id: String,
        reason: String,
    },

    /// Attestation evidence for gated deployments. Opaque to the core.
    Attest { token: String },

    /// Echoes `pong`.
    Ping,
}

// ── Server → Client ───────────────────────────────────────────────────────────

/// Messages sent from the server to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Pushed immediately on connect.
    ServerInfo {
        server_id: String,
        endpoint: String,
        region: String,
    },

    /// Acknowledgement of a successful registration (either shape).
    Registered {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pairing_code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<String>,
        server_id: String,
        /// Other servers also responsible for this pairing code per the ring.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        redirects: Vec<RedirectTarget>,
        /// Relay candidates handed to a freshly-registered relay peer.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        relays: Option<Vec<RelayInfo>>,
    },

    /// The pairing code is already bound to another connection.
    CodeCollision { pairing_code: String },

    /// A peer wants to pair with you.
    PairIncoming {
        from_code: String,
        from_public_key: String,
        expires_in_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        proposed_name: Option<String>,
    },

    /// Pairing succeeded. The initiator side creates the WebRTC offer.
    PairMatched {
        peer_code: String,
        peer_public_key: String,
        is_initiator: bool,
    },

    /// The target declined.
    PairRejected { peer_code: String },

    /// A pending request expired or the counterparty disconnected.
    PairTimeout { peer_code: String },

    /// Warning before a pending request expires.
    PairExpiring {
        peer_code: String,
        remaining_seconds: u64,
    },

    /// Pair-request failure. Deliberately opaque for unknown targets.
    PairError { error: String },

    /// Forwarded WebRTC / call signals.
    Offer { from: String, payload: Value },
    Answer { from: String, payload: Value },
    IceCandidate { from: String, payload: Value },
    CallOffer { from: String, payload: Value },
    CallAnswer { from: String, payload: Value },
    CallReject { from: String, payload: Value },
    CallHangup { from: String, payload: Value },
    CallIce { from: String, payload: Value },

    /// Full rendezvous result — every point and token was local.
    RendezvousResult {
        live_matches: Vec<LiveMatch>,
        dead_drops: Vec<DeadDropMatch>,
    },

    /// Partial rendezvous result plus redirect advisories for the slices
    /// owned by other servers.
    RendezvousPartial {
        local: RendezvousLocal,
        redirects: Vec<RedirectAdvisory>,
    },

    /// Pushed to an earlier-registered peer when someone else arrives at
    /// the same hourly token.
    RendezvousMatch {
        token: String,
        peer_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        relay_id: Option<String>,
    },

    /// Load-sorted relay list.
    Relays { relays: Vec<RelayInfo> },

    /// Heartbeat acknowledged.
    HeartbeatAck { peer_id: String },

    /// Load report accepted; carries the stored value.
    LoadUpdated {
        peer_id: String,
        current_load: u32,
    },

    /// An introduction envelope arriving at a relay.
    IntroductionRequest {
        from_source_id: String,
        target_source_id: String,
        payload: String,
        timestamp: i64,
    },

    /// An introduction envelope delivered to its target.
    IntroductionForward {
        from_source_id: String,
        target_source_id: String,
        payload: String,
        timestamp: i64,
    },

    /// Introduction failure routed back to the originator.
    IntroductionError {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_source_id: Option<String>,
    },

    /// Error response.
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },

    /// Pong response to keep the connection alive.
    Pong,
}

// ── Server ↔ Server (Federation) ─────────────────────────────────────────────

/// Messages exchanged between federated servers over `/federation`.
///
/// Liveness follows SWIM: direct pings, indirect probes through third
/// parties, and bounded membership digests piggybacked on every probe.
/// Periodic full-state pushes bound worst-case divergence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GossipMessage {
    /// Identify this server to a peer on first connect.
    Hello { member: Member },

    /// Direct liveness probe. `updates` is the piggybacked digest.
    Ping {
        seq: u64,
        from: String,
        #[serde(default)]
        updates: Vec<Member>,
    },

    /// Response to a direct or relayed probe.
    Ack {
        seq: u64,
        from: String,
        #[serde(default)]
        updates: Vec<Member>,
    },

    /// Ask the receiver to probe `target` on our behalf.
    PingReq {
        seq: u64,
        from: String,
        target: String,
        #[serde(default)]
        updates: Vec<Member>,
    },

    /// Relayed acknowledgement: `target` answered the intermediary's probe.
    IndirectAck {
        seq: u64,
        from: String,
        target: String,
    },

    /// Anti-entropy: full membership snapshot pushed to one random peer.
    StatePush {
        from: String,
        members: Vec<Member>,
    },

    /// Reply to a push with our own full snapshot.
    StatePull {
        from: String,
        members: Vec<Member>,
    },
}

// ── Supporting Types ──────────────────────────────────────────────────────────

/// Another server responsible for a key, per the hash ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectTarget {
    pub server_id: String,
    pub endpoint: String,
}

/// A relay peer as presented to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayInfo {
    pub peer_id: String,
    pub current_load: u32,
    pub max_connections: u32,
    pub at_capacity: bool,
}

/// A live hourly-token match: both peers are online right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveMatch {
    pub token: String,
    pub peer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_id: Option<String>,
}

/// A daily-point match carrying the counterpart's stored dead drop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadDropMatch {
    pub point: String,
    pub peer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_id: Option<String>,
    /// Encrypted routing hint, verbatim as stored. Never decrypted here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

/// The locally-answered slice of a partially-redirected registration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RendezvousLocal {
    pub live_matches: Vec<LiveMatch>,
    pub dead_drops: Vec<DeadDropMatch>,
}

/// Advisory telling the client to reissue part of its registration to
/// another server. Daily and hourly slices are merged per server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectAdvisory {
    pub server_id: String,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub daily_points: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hourly_tokens: Vec<String>,
}

/// A queued pair request.
#[derive(Debug, Clone)]
pub struct PairRequest {
    pub requester_code: String,
    pub requester_public_key: String,
    pub target_code: String,
    pub proposed_name: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Monotonic token tying this request to its timers. A timer that fires
    /// with a stale generation is a no-op.
    pub generation: u64,
}
