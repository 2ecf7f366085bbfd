//! WebSocket connection handler.
//!
//! Manages individual connections: rate limiting, parsing, dispatch to the
//! signaling / relay / rendezvous paths, and cleanup on close. Messages
//! from one socket are processed in arrival order; replies and pushes go
//! out through a per-connection channel drained by a sender task, so the
//! server never blocks on a slow peer.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::limiter::{RateLimiter, RateVerdict};
use crate::pairing::{normalize_code, RegisterError};
use crate::protocol::{ClientMessage, GossipMessage, ServerMessage};
use crate::relays::{RelayRegisterError, DEFAULT_RELAY_COUNT};
use crate::state::{ConnId, ConnSender, Frame, ServerState};

/// What the first successful `register` made of this socket. Immutable
/// afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Classification {
    Unbound,
    Signaling,
    Relay,
}

// ── Client connections ────────────────────────────────────────────────────────

/// Handle a single client WebSocket for its whole lifetime.
pub async fn handle_websocket(socket: WebSocket, state: ServerState) {
    let conn: ConnId = state.allocate_conn_id();
    state.connection_opened();

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

    // ── Sender task: drains the outbound channel ──────────────────────────
    let sender_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame {
                Frame::Message(msg) => match serde_json::to_string(&msg) {
                    Ok(json) => {
                        if ws_sender.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to serialize server message");
                    }
                },
                Frame::Close { code, reason } => {
                    let _ = ws_sender
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    // Every client learns who it is talking to before anything else.
    let _ = tx.send(Frame::Message(ServerMessage::ServerInfo {
        server_id: state.server_id().to_string(),
        endpoint: state.config.endpoint.clone(),
        region: state.config.region.clone(),
    }));

    // ── Optional attestation gate ─────────────────────────────────────────
    let attested = Arc::new(AtomicBool::new(false));
    if let Some(grace) = state.config.attestation_grace {
        let attested = Arc::clone(&attested);
        let gate_tx = tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if !attested.load(Ordering::Relaxed) {
                let _ = gate_tx.send(Frame::Message(ServerMessage::Error {
                    message: "Attestation required".to_string(),
                    code: Some("NOT_ATTESTED".to_string()),
                }));
                let _ = gate_tx.send(Frame::Close {
                    code: 1008,
                    reason: "not attested".to_string(),
                });
            }
        });
    }

    // ── Receive loop ──────────────────────────────────────────────────────
    let mut limiter = RateLimiter::new(state.config.rate_window, state.config.rate_max_messages);
    let mut classification = Classification::Unbound;
    // Rendezvous peer IDs registered through this socket, for presence
    // cleanup on close.
    let mut rendezvous_peers: HashSet<String> = HashSet::new();

    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                match limiter.check() {
                    RateVerdict::Allowed => {}
                    RateVerdict::Warned => {
                        let _ = tx.send(Frame::Message(ServerMessage::Error {
                            message: "Rate limit exceeded, slow down".to_string(),
                            code: Some("RATE_LIMITED".to_string()),
                        }));
                        continue;
                    }
                    RateVerdict::Exceeded => {
                        tracing::warn!(conn = conn, "Rate limit exceeded twice, closing");
                        let _ = tx.send(Frame::Close {
                            code: 1008,
                            reason: "rate limit".to_string(),
                        });
                        break;
                    }
                }

                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_msg) => {
                        handle_client_message(
                            &state,
                            conn,
                            &tx,
                            &mut classification,
                            &mut rendezvous_peers,
                            &attested,
                            client_msg,
                        );
                    }
                    Err(e) => {
                        tracing::debug!(conn = conn, error = %e, "Failed to parse client message");
                        let _ = tx.send(Frame::Message(ServerMessage::Error {
                            message: format!("Invalid message format: {}", e),
                            code: None,
                        }));
                    }
                }
            }
            Ok(Message::Ping(_)) => {
                // Axum answers protocol pings itself.
            }
            Ok(Message::Close(_)) => {
                tracing::debug!(conn = conn, "Client sent close frame");
                break;
            }
            Err(e) => {
                tracing::debug!(conn = conn, error = %e, "WebSocket error");
                break;
            }
            _ => {} // Binary, Pong — ignore
        }
    }

    // ── Cleanup: every registry this socket touched ───────────────────────
    state.signaling.disconnect(conn);
    state.relays.unregister_conn(conn);
    for peer_id in &rendezvous_peers {
        // Live matches need presence; dead drops survive for offline pickup.
        state.rendezvous().peer_went_offline(peer_id);
    }

    state.connection_closed();
    sender_task.abort();
    tracing::debug!(conn = conn, "Client disconnected");
}

/// Dispatch one parsed client message.
fn handle_client_message(
    state: &ServerState,
    conn: ConnId,
    tx: &ConnSender,
    classification: &mut Classification,
    rendezvous_peers: &mut HashSet<String>,
    attested: &Arc<AtomicBool>,
    msg: ClientMessage,
) {
    match msg {
        ClientMessage::Register {
            pairing_code,
            public_key,
            peer_id,
            max_connections,
        } => handle_register(
            state,
            conn,
            tx,
            classification,
            pairing_code,
            public_key,
            peer_id,
            max_connections,
        ),

        ClientMessage::PairRequest {
            target_code,
            proposed_name,
        } => {
            if *classification != Classification::Signaling {
                send_error(tx, "Register a pairing code first", None);
                return;
            }
            state.signaling.clone().pair_request(conn, &target_code, proposed_name);
        }

        ClientMessage::PairResponse {
            target_code,
            accepted,
        } => {
            if *classification != Classification::Signaling {
                send_error(tx, "Register a pairing code first", None);
                return;
            }
            state.signaling.pair_response(conn, &target_code, accepted);
        }

        ClientMessage::Offer { target, payload } => {
            handle_forward(state, conn, tx, ForwardKind::Offer, &target, payload)
        }
        ClientMessage::Answer { target, payload } => {
            handle_forward(state, conn, tx, ForwardKind::Answer, &target, payload)
        }
        ClientMessage::IceCandidate { target, payload } => {
            handle_forward(state, conn, tx, ForwardKind::IceCandidate, &target, payload)
        }
        ClientMessage::CallOffer { target, payload } => {
            handle_forward(state, conn, tx, ForwardKind::CallOffer, &target, payload)
        }
        ClientMessage::CallAnswer { target, payload } => {
            handle_forward(state, conn, tx, ForwardKind::CallAnswer, &target, payload)
        }
        ClientMessage::CallReject { target, payload } => {
            handle_forward(state, conn, tx, ForwardKind::CallReject, &target, payload)
        }
        ClientMessage::CallHangup { target, payload } => {
            handle_forward(state, conn, tx, ForwardKind::CallHangup, &target, payload)
        }
        ClientMessage::CallIce { target, payload } => {
            handle_forward(state, conn, tx, ForwardKind::CallIce, &target, payload)
        }

        ClientMessage::RegisterRendezvous {
            peer_id,
            daily_points,
            hourly_tokens,
            dead_drop,
            dead_drops,
            relay_id,
        } => {
            match state.coordinator.register(
                &peer_id,
                &daily_points,
                &hourly_tokens,
                dead_drop.as_deref(),
                dead_drops.as_ref(),
                relay_id.as_deref(),
                tx.clone(),
            ) {
                Ok(reply) => {
                    rendezvous_peers.insert(peer_id);
                    // Match pushes to earlier peers were issued inside the
                    // coordinator, before this reply goes out.
                    let _ = tx.send(Frame::Message(reply));
                }
                Err(message) => send_error(tx, &message, None),
            }
        }

        ClientMessage::GetRelays { peer_id, count } => {
            let relays = state
                .relays
                .relay_listing(&peer_id, count.unwrap_or(DEFAULT_RELAY_COUNT));
            let _ = tx.send(Frame::Message(ServerMessage::Relays { relays }));
        }

        ClientMessage::UpdateLoad {
            peer_id,
            connected_count,
        } => match state.relays.update_load(conn, &peer_id, connected_count) {
            Ok(current_load) => {
                let _ = tx.send(Frame::Message(ServerMessage::LoadUpdated {
                    peer_id,
                    current_load,
                }));
            }
            Err(message) => send_error(tx, &message, None),
        },

        ClientMessage::Heartbeat { peer_id } => match state.relays.heartbeat(conn, &peer_id) {
            Ok(()) => {
                let _ = tx.send(Frame::Message(ServerMessage::HeartbeatAck { peer_id }));
            }
            Err(message) => send_error(tx, &message, None),
        },

        ClientMessage::Introduction {
            relay_id,
            target_source_id,
            payload,
        } => handle_introduction(state, conn, tx, &relay_id, &target_source_id, payload),

        ClientMessage::IntroductionForward {
            from_source_id,
            target_source_id,
            payload,
        } => handle_introduction_forward(state, conn, tx, from_source_id, target_source_id, payload),

        ClientMessage::IntroductionError {
            to_source_id,
            reason,
        } => {
            // A relay reporting failure: route it back to the originator.
            if state.relays.peer_id_of(conn).is_none() {
                send_error(tx, "Register a peer_id first", None);
                return;
            }
            state.relays.send_to_peer(
                &to_source_id,
                ServerMessage::IntroductionError {
                    reason,
                    target_source_id: None,
                },
            );
        }

        ClientMessage::Attest { token: _ } => {
            // Evidence verification belongs to the attestation manager;
            // here the socket is simply marked in time.
            attested.store(true, Ordering::Relaxed);
        }

        ClientMessage::Ping => {
            let _ = tx.send(Frame::Message(ServerMessage::Pong));
        }
    }
}

// ── Registration ──────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
fn handle_register(
    state: &ServerState,
    conn: ConnId,
    tx: &ConnSender,
    classification: &mut Classification,
    pairing_code: Option<String>,
    public_key: Option<String>,
    peer_id: Option<String>,
    max_connections: Option<u32>,
) {
    match (pairing_code, peer_id) {
        (Some(_), Some(_)) => {
            send_error(tx, "Provide either pairing_code or peer_id, not both", None);
        }

        // Signaling registration.
        (Some(code), None) => {
            if *classification == Classification::Relay {
                send_error(tx, "Already registered as a relay peer", None);
                return;
            }
            let public_key = match public_key {
                Some(pk) => pk,
                None => {
                    send_error(tx, "public_key is required", None);
                    return;
                }
            };
            match state.signaling.register(conn, tx.clone(), &code, &public_key) {
                Ok(code) => {
                    *classification = Classification::Signaling;
                    let redirects = state.routing.other_responsible(&code);
                    let _ = tx.send(Frame::Message(ServerMessage::Registered {
                        pairing_code: Some(code),
                        peer_id: None,
                        server_id: state.server_id().to_string(),
                        redirects,
                        relays: None,
                    }));
                }
                Err(RegisterError::Collision(code)) => {
                    let _ = tx.send(Frame::Message(ServerMessage::CodeCollision {
                        pairing_code: code,
                    }));
                }
                Err(RegisterError::InvalidCode(message))
                | Err(RegisterError::InvalidKey(message)) => {
                    send_error(tx, &message, None);
                }
                Err(RegisterError::AlreadyRegistered) => {
                    send_error(tx, "Already registered", None);
                }
            }
        }

        // Relay registration.
        (None, Some(peer_id)) => {
            if *classification == Classification::Signaling {
                send_error(tx, "Already registered with a pairing code", None);
                return;
            }
            match state
                .relays
                .register(conn, tx.clone(), &peer_id, max_connections, public_key)
            {
                Ok(relays) => {
                    *classification = Classification::Relay;
                    let _ = tx.send(Frame::Message(ServerMessage::Registered {
                        pairing_code: None,
                        peer_id: Some(peer_id),
                        server_id: state.server_id().to_string(),
                        redirects: Vec::new(),
                        relays: Some(relays),
                    }));
                }
                Err(RelayRegisterError::InvalidPeerId) => {
                    send_error(tx, "Invalid peer_id format", None);
                }
                Err(RelayRegisterError::InvalidMaxConnections) => {
                    send_error(tx, "max_connections out of range [1, 1000]", None);
                }
                Err(RelayRegisterError::PeerIdTaken) => {
                    send_error(tx, "peer_id is already registered", None);
                }
                Err(RelayRegisterError::ConnAlreadyBound(existing)) => {
                    send_error(
                        tx,
                        &format!("Connection already registered as '{}'", existing),
                        None,
                    );
                }
            }
        }

        (None, None) => {
            send_error(tx, "register requires pairing_code or peer_id", None);
        }
    }
}

// ── Signal forwarding ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ForwardKind {
    Offer,
    Answer,
    IceCandidate,
    CallOffer,
    CallAnswer,
    CallReject,
    CallHangup,
    CallIce,
}

impl ForwardKind {
    fn is_call(&self) -> bool {
        matches!(
            self,
            Self::CallOffer | Self::CallAnswer | Self::CallReject | Self::CallHangup | Self::CallIce
        )
    }

    fn wrap(&self, from: String, payload: Value) -> ServerMessage {
        match self {
            Self::Offer => ServerMessage::Offer { from, payload },
            Self::Answer => ServerMessage::Answer { from, payload },
            Self::IceCandidate => ServerMessage::IceCandidate { from, payload },
            Self::CallOffer => ServerMessage::CallOffer { from, payload },
            Self::CallAnswer => ServerMessage::CallAnswer { from, payload },
            Self::CallReject => ServerMessage::CallReject { from, payload },
            Self::CallHangup => ServerMessage::CallHangup { from, payload },
            Self::CallIce => ServerMessage::CallIce { from, payload },
        }
    }
}

/// Validate a forwarded payload. Call signals must carry a UUID v4
/// `call_id`; everything else just has to be an object.
fn validate_forward_payload(kind: ForwardKind, payload: &Value) -> Result<(), String> {
    let object = payload
        .as_object()
        .ok_or_else(|| "payload must be an object".to_string())?;
    if kind.is_call() {
        let call_id = object
            .get("call_id")
            .and_then(Value::as_str)
            .ok_or_else(|| "payload.call_id is required".to_string())?;
        let parsed = uuid::Uuid::parse_str(call_id)
            .map_err(|_| "payload.call_id must be a UUID".to_string())?;
        if parsed.get_version_num() != 4 {
            return Err("payload.call_id must be a UUID v4".to_string());
        }
    }
    Ok(())
}

/// Forward a WebRTC or call signal verbatim to a locally-registered code.
/// The target was handed to the sender by a prior `pair_matched`, so its
/// existence is no longer a secret and the error may name it.
fn handle_forward(
    state: &ServerState,
    conn: ConnId,
    tx: &ConnSender,
    kind: ForwardKind,
    target: &str,
    payload: Value,
) {
    let from = match state.signaling.code_of(conn) {
        Some(code) => code,
        None => {
            send_error(tx, "Register a pairing code first", None);
            return;
        }
    };

    let target = match normalize_code(target) {
        Ok(code) => code,
        Err(message) => {
            send_error(tx, &message, None);
            return;
        }
    };

    if let Err(message) = validate_forward_payload(kind, &payload) {
        send_error(tx, &message, None);
        return;
    }

    if !state.signaling.send_to_code(&target, kind.wrap(from, payload)) {
        send_error(tx, &format!("Peer not found: {}", target), None);
    }
}

// ── Introductions ─────────────────────────────────────────────────────────────

/// Route an opaque introduction envelope to a locally-connected relay.
fn handle_introduction(
    state: &ServerState,
    conn: ConnId,
    tx: &ConnSender,
    relay_id: &str,
    target_source_id: &str,
    payload: String,
) {
    let from_source_id = match state.relays.peer_id_of(conn) {
        Some(peer_id) => peer_id,
        None => {
            send_error(tx, "Register a peer_id first", None);
            return;
        }
    };

    let delivered = state.relays.send_to_peer(
        relay_id,
        ServerMessage::IntroductionRequest {
            from_source_id,
            target_source_id: target_source_id.to_string(),
            payload,
            timestamp: Utc::now().timestamp_millis(),
        },
    );

    if !delivered {
        let _ = tx.send(Frame::Message(ServerMessage::IntroductionError {
            reason: "relay_not_found".to_string(),
            target_source_id: Some(target_source_id.to_string()),
        }));
    }
}

/// A relay passing an envelope on to one of our connected peers.
fn handle_introduction_forward(
    state: &ServerState,
    conn: ConnId,
    tx: &ConnSender,
    from_source_id: String,
    target_source_id: String,
    payload: String,
) {
    if state.relays.peer_id_of(conn).is_none() {
        send_error(tx, "Register a peer_id first", None);
        return;
    }

    let delivered = state.relays.send_to_peer(
        &target_source_id,
        ServerMessage::IntroductionForward {
            from_source_id: from_source_id.clone(),
            target_source_id: target_source_id.clone(),
            payload,
            timestamp: Utc::now().timestamp_millis(),
        },
    );

    if !delivered {
        // The error travels back along the same route.
        state.relays.send_to_peer(
            &from_source_id,
            ServerMessage::IntroductionError {
                reason: "target_not_found".to_string(),
                target_source_id: Some(target_source_id),
            },
        );
    }
}

fn send_error(tx: &ConnSender, message: &str, code: Option<&str>) {
    let _ = tx.send(Frame::Message(ServerMessage::Error {
        message: message.to_string(),
        code: code.map(str::to_string),
    }));
}

// ── Federation peer connections ───────────────────────────────────────────────

/// Handle an inbound WebSocket from a peer server on `/federation`.
///
/// Mirrors the outbound path in `federation.rs`: exchange `Hello`, register
/// the peer's sender, then funnel every frame to the gossip driver.
pub async fn handle_federation_peer(socket: WebSocket, state: ServerState) {
    let federation = match &state.federation {
        Some(federation) => federation.clone(),
        None => {
            tracing::warn!("Federation connection rejected: federation not enabled");
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let hello = GossipMessage::Hello {
        member: state.self_member(),
    };
    if let Ok(json) = serde_json::to_string(&hello) {
        if ws_sender.send(Message::Text(json)).await.is_err() {
            return;
        }
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<GossipMessage>();
    let mut peer_id: Option<String> = None;

    let sender_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&msg) {
                if ws_sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
    });

    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<GossipMessage>(&text) {
                Ok(msg) => {
                    if let GossipMessage::Hello { ref member } = msg {
                        peer_id = Some(member.server_id.clone());
                        federation.register_inbound(&member.server_id, tx.clone());
                    }
                    match &peer_id {
                        Some(id) => federation.dispatch_inbound(id, msg),
                        None => {
                            tracing::warn!("Federation frame before hello, dropping");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to parse federation message");
                }
            },
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::debug!(error = %e, "Federation peer WebSocket error");
                break;
            }
            _ => {}
        }
    }

    if let Some(id) = peer_id {
        federation.remove_peer(&id);
        tracing::info!(peer = id.as_str(), "Federation peer disconnected");
    }
    sender_task.abort();
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ServerIdentity;
    use crate::state::ServerConfig;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;

    fn test_state() -> ServerState {
        ServerState::new(ServerConfig::default(), ServerIdentity::ephemeral())
    }

    struct Client {
        conn: ConnId,
        tx: ConnSender,
        rx: mpsc::UnboundedReceiver<Frame>,
        classification: Classification,
        rendezvous_peers: HashSet<String>,
        attested: Arc<AtomicBool>,
    }

    impl Client {
        fn new(state: &ServerState) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                conn: state.allocate_conn_id(),
                tx,
                rx,
                classification: Classification::Unbound,
                rendezvous_peers: HashSet::new(),
                attested: Arc::new(AtomicBool::new(false)),
            }
        }

        fn send(&mut self, state: &ServerState, msg: ClientMessage) {
            handle_client_message(
                state,
                self.conn,
                &self.tx,
                &mut self.classification,
                &mut self.rendezvous_peers,
                &self.attested,
                msg,
            );
        }

        fn recv(&mut self) -> ServerMessage {
            match self.rx.try_recv().expect("expected a frame") {
                Frame::Message(msg) => msg,
                Frame::Close { code, .. } => panic!("unexpected close {}", code),
            }
        }
    }

    fn register_signaling(state: &ServerState, client: &mut Client, code: &str, pk_byte: u8) {
        client.send(
            state,
            ClientMessage::Register {
                pairing_code: Some(code.to_string()),
                public_key: Some(BASE64.encode([pk_byte; 32])),
                peer_id: None,
                max_connections: None,
            },
        );
        match client.recv() {
            ServerMessage::Registered { pairing_code, .. } => {
                assert_eq!(pairing_code.as_deref(), Some(code));
            }
            other => panic!("expected registered, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_full_pairing_scenario() {
        let state = test_state();
        let mut alice = Client::new(&state);
        let mut bob = Client::new(&state);

        register_signaling(&state, &mut alice, "ABC234", 1);
        register_signaling(&state, &mut bob, "XYZ567", 2);

        alice.send(
            &state,
            ClientMessage::PairRequest {
                target_code: "XYZ567".to_string(),
                proposed_name: None,
            },
        );
        match bob.recv() {
            ServerMessage::PairIncoming {
                from_code,
                expires_in_ms,
                ..
            } => {
                assert_eq!(from_code, "ABC234");
                assert_eq!(expires_in_ms, 120_000);
            }
            other => panic!("expected pair_incoming, got {:?}", other),
        }

        bob.send(
            &state,
            ClientMessage::PairResponse {
                target_code: "ABC234".to_string(),
                accepted: true,
            },
        );
        match alice.recv() {
            ServerMessage::PairMatched {
                peer_code,
                is_initiator,
                ..
            } => {
                assert_eq!(peer_code, "XYZ567");
                assert!(is_initiator);
            }
            other => panic!("expected pair_matched, got {:?}", other),
        }
        match bob.recv() {
            ServerMessage::PairMatched { is_initiator, .. } => assert!(!is_initiator),
            other => panic!("expected pair_matched, got {:?}", other),
        }

        // Post-match forwarding works and names missing targets.
        alice.send(
            &state,
            ClientMessage::Offer {
                target: "XYZ567".to_string(),
                payload: serde_json::json!({"sdp": "v=0"}),
            },
        );
        match bob.recv() {
            ServerMessage::Offer { from, .. } => assert_eq!(from, "ABC234"),
            other => panic!("expected offer, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_enumeration_resistance() {
        let state = test_state();
        let mut alice = Client::new(&state);
        register_signaling(&state, &mut alice, "ABC234", 1);

        alice.send(
            &state,
            ClientMessage::PairRequest {
                target_code: "ZZZZZ9".to_string(),
                proposed_name: None,
            },
        );
        match alice.recv() {
            ServerMessage::PairError { error } => {
                assert_eq!(error, "Pair request could not be processed");
            }
            other => panic!("expected pair_error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_register_classification_is_immutable() {
        let state = test_state();
        let mut client = Client::new(&state);
        register_signaling(&state, &mut client, "ABC234", 1);

        client.send(
            &state,
            ClientMessage::Register {
                pairing_code: None,
                public_key: None,
                peer_id: Some("relay-1".to_string()),
                max_connections: None,
            },
        );
        match client.recv() {
            ServerMessage::Error { message, .. } => {
                assert!(message.contains("Already registered"));
            }
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(client.classification, Classification::Signaling);
    }

    #[tokio::test]
    async fn test_code_collision_reply() {
        let state = test_state();
        let mut first = Client::new(&state);
        let mut second = Client::new(&state);
        register_signaling(&state, &mut first, "ABC234", 1);

        second.send(
            &state,
            ClientMessage::Register {
                pairing_code: Some("ABC234".to_string()),
                public_key: Some(BASE64.encode([9u8; 32])),
                peer_id: None,
                max_connections: None,
            },
        );
        match second.recv() {
            ServerMessage::CodeCollision { pairing_code } => {
                assert_eq!(pairing_code, "ABC234");
            }
            other => panic!("expected code_collision, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_call_signal_requires_uuid_v4_call_id() {
        let state = test_state();
        let mut alice = Client::new(&state);
        let mut bob = Client::new(&state);
        register_signaling(&state, &mut alice, "ABC234", 1);
        register_signaling(&state, &mut bob, "XYZ567", 2);

        alice.send(
            &state,
            ClientMessage::CallOffer {
                target: "XYZ567".to_string(),
                payload: serde_json::json!({"call_id": "not-a-uuid", "sdp": "v=0"}),
            },
        );
        match alice.recv() {
            ServerMessage::Error { message, .. } => assert!(message.contains("call_id")),
            other => panic!("expected error, got {:?}", other),
        }

        let call_id = uuid::Uuid::new_v4().to_string();
        alice.send(
            &state,
            ClientMessage::CallOffer {
                target: "XYZ567".to_string(),
                payload: serde_json::json!({"call_id": call_id, "sdp": "v=0"}),
            },
        );
        assert!(matches!(bob.recv(), ServerMessage::CallOffer { .. }));
    }

    #[tokio::test]
    async fn test_relay_registration_and_introduction_route() {
        let state = test_state();
        let mut relay = Client::new(&state);
        let mut peer = Client::new(&state);

        relay.send(
            &state,
            ClientMessage::Register {
                pairing_code: None,
                public_key: None,
                peer_id: Some("relay-1".to_string()),
                max_connections: Some(100),
            },
        );
        match relay.recv() {
            ServerMessage::Registered { peer_id, relays, .. } => {
                assert_eq!(peer_id.as_deref(), Some("relay-1"));
                assert_eq!(relays.unwrap().len(), 0);
            }
            other => panic!("expected registered, got {:?}", other),
        }

        peer.send(
            &state,
            ClientMessage::Register {
                pairing_code: None,
                public_key: None,
                peer_id: Some("src-a".to_string()),
                max_connections: None,
            },
        );
        let _ = peer.recv();

        peer.send(
            &state,
            ClientMessage::Introduction {
                relay_id: "relay-1".to_string(),
                target_source_id: "src-b".to_string(),
                payload: "ciphertext".to_string(),
            },
        );
        match relay.recv() {
            ServerMessage::IntroductionRequest {
                from_source_id,
                target_source_id,
                payload,
                ..
            } => {
                assert_eq!(from_source_id, "src-a");
                assert_eq!(target_source_id, "src-b");
                assert_eq!(payload, "ciphertext");
            }
            other => panic!("expected introduction_request, got {:?}", other),
        }

        // The relay reports the target missing; the originator hears it.
        relay.send(
            &state,
            ClientMessage::IntroductionError {
                to_source_id: "src-a".to_string(),
                reason: "target_not_found".to_string(),
            },
        );
        match peer.recv() {
            ServerMessage::IntroductionError { reason, .. } => {
                assert_eq!(reason, "target_not_found");
            }
            other => panic!("expected introduction_error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_introduction_to_unknown_relay() {
        let state = test_state();
        let mut peer = Client::new(&state);
        peer.send(
            &state,
            ClientMessage::Register {
                pairing_code: None,
                public_key: None,
                peer_id: Some("src-a".to_string()),
                max_connections: None,
            },
        );
        let _ = peer.recv();

        peer.send(
            &state,
            ClientMessage::Introduction {
                relay_id: "nope".to_string(),
                target_source_id: "src-b".to_string(),
                payload: "ct".to_string(),
            },
        );
        match peer.recv() {
            ServerMessage::IntroductionError { reason, .. } => {
                assert_eq!(reason, "relay_not_found");
            }
            other => panic!("expected introduction_error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rendezvous_scenario_live_match_and_push() {
        let state = test_state();
        let mut p1 = Client::new(&state);
        let mut p2 = Client::new(&state);

        p1.send(
            &state,
            ClientMessage::RegisterRendezvous {
                peer_id: "P1".to_string(),
                daily_points: vec![],
                hourly_tokens: vec!["ht_X".to_string()],
                dead_drop: None,
                dead_drops: None,
                relay_id: Some("r1".to_string()),
            },
        );
        match p1.recv() {
            ServerMessage::RendezvousResult { live_matches, .. } => {
                assert!(live_matches.is_empty())
            }
            other => panic!("expected rendezvous_result, got {:?}", other),
        }

        p2.send(
            &state,
            ClientMessage::RegisterRendezvous {
                peer_id: "P2".to_string(),
                daily_points: vec![],
                hourly_tokens: vec!["ht_X".to_string()],
                dead_drop: None,
                dead_drops: None,
                relay_id: Some("r2".to_string()),
            },
        );
        match p2.recv() {
            ServerMessage::RendezvousResult { live_matches, .. } => {
                assert_eq!(live_matches.len(), 1);
                assert_eq!(live_matches[0].peer_id, "P1");
                assert_eq!(live_matches[0].relay_id.as_deref(), Some("r1"));
            }
            other => panic!("expected rendezvous_result, got {:?}", other),
        }

        // P1 was pushed the new arrival.
        match p1.recv() {
            ServerMessage::RendezvousMatch {
                token,
                peer_id,
                relay_id,
            } => {
                assert_eq!(token, "ht_X");
                assert_eq!(peer_id, "P2");
                assert_eq!(relay_id.as_deref(), Some("r2"));
            }
            other => panic!("expected rendezvous_match, got {:?}", other),
        }
        assert!(p1.rendezvous_peers.contains("P1"));
        assert!(p2.rendezvous_peers.contains("P2"));
    }

    #[tokio::test]
    async fn test_unregistered_forward_rejected() {
        let state = test_state();
        let mut client = Client::new(&state);
        client.send(
            &state,
            ClientMessage::Offer {
                target: "XYZ567".to_string(),
                payload: serde_json::json!({}),
            },
        );
        match client.recv() {
            ServerMessage::Error { message, .. } => {
                assert!(message.contains("pairing code"));
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let state = test_state();
        let mut client = Client::new(&state);
        client.send(&state, ClientMessage::Ping);
        assert!(matches!(client.recv(), ServerMessage::Pong));
    }

    #[test]
    fn test_validate_forward_payload() {
        assert!(validate_forward_payload(ForwardKind::Offer, &serde_json::json!({"sdp": "x"}))
            .is_ok());
        assert!(validate_forward_payload(ForwardKind::Offer, &serde_json::json!("bare")).is_err());
        assert!(
            validate_forward_payload(ForwardKind::CallHangup, &serde_json::json!({})).is_err()
        );
        let v4 = uuid::Uuid::new_v4().to_string();
        assert!(validate_forward_payload(
            ForwardKind::CallHangup,
            &serde_json::json!({"call_id": v4})
        )
        .is_ok());
    }
}
