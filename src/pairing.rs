//! Signaling registry: pairing codes and the pair-request state machine.
//!
//! Maintains the bidirectional map between live connections and six-char
//! pairing codes, queues mutual-approval pair requests with expiry and
//! warning timers, and answers existence probes with a deliberately opaque
//! error so codes cannot be enumerated.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use dashmap::DashMap;
use tokio::task::JoinHandle;

use crate::protocol::{PairRequest, ServerMessage};
use crate::state::{ConnId, ConnSender, Frame};

/// Pairing codes are six characters from a 32-symbol alphabet: capital
/// letters minus I and O, digits 2-9.
pub const PAIRING_CODE_LEN: usize = 6;
pub const PAIRING_ALPHABET: &str = "ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Cap on queued requests per target code.
pub const MAX_PENDING_PER_TARGET: usize = 10;

/// Never confirm or deny that a code exists.
pub const OPAQUE_PAIR_ERROR: &str = "Pair request could not be processed";

pub const DEFAULT_PAIR_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_PAIR_WARNING_LEAD: Duration = Duration::from_secs(30);

/// Case-fold and validate a pairing code.
pub fn normalize_code(raw: &str) -> Result<String, String> {
    let code = raw.trim().to_ascii_uppercase();
    if code.len() != PAIRING_CODE_LEN {
        return Err("Invalid pairing code format".to_string());
    }
    if !code.chars().all(|c| PAIRING_ALPHABET.contains(c)) {
        return Err("Invalid pairing code format".to_string());
    }
    Ok(code)
}

/// Validate a base64 public key: must decode to exactly 32 bytes.
pub fn validate_public_key(b64: &str) -> Result<(), String> {
    match BASE64.decode(b64) {
        Ok(bytes) if bytes.len() == 32 => Ok(()),
        Ok(bytes) => Err(format!(
            "Public key must be 32 bytes, got {}",
            bytes.len()
        )),
        Err(_) => Err("Public key is not valid base64".to_string()),
    }
}

/// Registration failure reasons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterError {
    InvalidCode(String),
    Collision(String),
    InvalidKey(String),
    AlreadyRegistered,
}

struct CodeBinding {
    conn: ConnId,
    sender: ConnSender,
    public_key: String,
}

struct RequestTimers {
    generation: u64,
    expiry: JoinHandle<()>,
    warning: JoinHandle<()>,
}

impl RequestTimers {
    fn cancel(self) {
        self.expiry.abort();
        self.warning.abort();
    }
}

/// Snapshot for the `/metrics` endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SignalingMetrics {
    pub active_codes: usize,
    pub codes_registered_total: u64,
    pub pending_requests: usize,
    /// log2 of the code space: 6 symbols over a 32-char alphabet.
    pub code_entropy_bits: u32,
}

/// Pairing-code table plus pending pair requests and their timers.
pub struct SignalingRegistry {
    code_to_conn: DashMap<String, CodeBinding>,
    conn_to_code: DashMap<ConnId, String>,
    /// target_code → queued requests, oldest first.
    pending: DashMap<String, Vec<PairRequest>>,
    /// (requester_code, target_code) → live timers.
    timers: DashMap<(String, String), RequestTimers>,
    generation: AtomicU64,
    codes_registered_total: AtomicU64,
    pair_timeout: Duration,
    warning_lead: Duration,
}

impl SignalingRegistry {
    pub fn new(pair_timeout: Duration, warning_lead: Duration) -> Self {
        Self {
            code_to_conn: DashMap::new(),
            conn_to_code: DashMap::new(),
            pending: DashMap::new(),
            timers: DashMap::new(),
            generation: AtomicU64::new(0),
            codes_registered_total: AtomicU64::new(0),
            pair_timeout,
            warning_lead,
        }
    }

    // ── Code bindings ─────────────────────────────────────────────────────

    /// Bind a connection to a pairing code. Validates format, collision,
    /// and public key, then installs all three maps.
    pub fn register(
        &self,
        conn: ConnId,
        sender: ConnSender,
        raw_code: &str,
        public_key: &str,
    ) -> Result<String, RegisterError> {
        let code = normalize_code(raw_code).map_err(RegisterError::InvalidCode)?;
        if self.conn_to_code.contains_key(&conn) {
            return Err(RegisterError::AlreadyRegistered);
        }
        validate_public_key(public_key).map_err(RegisterError::InvalidKey)?;

        use dashmap::mapref::entry::Entry;
        match self.code_to_conn.entry(code.clone()) {
            Entry::Occupied(_) => return Err(RegisterError::Collision(code)),
            Entry::Vacant(slot) => {
                slot.insert(CodeBinding {
                    conn,
                    sender,
                    public_key: public_key.to_string(),
                });
            }
        }
        self.conn_to_code.insert(conn, code.clone());
        self.codes_registered_total.fetch_add(1, Ordering::Relaxed);

        tracing::info!(code = code.as_str(), "Pairing code registered");
        Ok(code)
    }

    /// The code bound to a connection, if any.
    pub fn code_of(&self, conn: ConnId) -> Option<String> {
        self.conn_to_code.get(&conn).map(|c| c.value().clone())
    }

    /// Whether a code is currently bound locally.
    pub fn is_registered(&self, code: &str) -> bool {
        self.code_to_conn.contains_key(code)
    }

    pub fn public_key_of(&self, code: &str) -> Option<String> {
        self.code_to_conn.get(code).map(|b| b.public_key.clone())
    }

    /// Best-effort send to the connection bound to `code`.
    pub fn send_to_code(&self, code: &str, message: ServerMessage) -> bool {
        if let Some(binding) = self.code_to_conn.get(code) {
            binding.sender.send(Frame::Message(message)).is_ok()
        } else {
            false
        }
    }

    pub fn metrics(&self) -> SignalingMetrics {
        SignalingMetrics {
            active_codes: self.code_to_conn.len(),
            codes_registered_total: self.codes_registered_total.load(Ordering::Relaxed),
            pending_requests: self.pending.iter().map(|e| e.value().len()).sum(),
            code_entropy_bits: (PAIRING_CODE_LEN as u32) * 5,
        }
    }

    pub fn active_codes(&self) -> usize {
        self.code_to_conn.len()
    }

    /// Ask every bound connection to close (shutdown path).
    pub fn close_all(&self, code: u16, reason: &str) {
        for entry in self.code_to_conn.iter() {
            let _ = entry.value().sender.send(Frame::Close {
                code,
                reason: reason.to_string(),
            });
        }
    }

    // ── Pair requests ─────────────────────────────────────────────────────

    /// Handle a `pair_request` from the connection bound to
    /// `requester_code`. Sends all replies and pushes itself. Takes an
    /// `Arc` receiver because the expiry and warning timers outlive the
    /// call.
    pub fn pair_request(
        self: Arc<Self>,
        conn: ConnId,
        raw_target: &str,
        proposed_name: Option<String>,
    ) {
        let requester_code = match self.code_of(conn) {
            Some(code) => code,
            // The handler rejects unregistered sockets before this point.
            None => return,
        };

        let target_code = match normalize_code(raw_target) {
            Ok(code) => code,
            Err(message) => {
                self.send_to_code(&requester_code, ServerMessage::PairError { error: message });
                return;
            }
        };

        if target_code == requester_code {
            self.send_to_code(
                &requester_code,
                ServerMessage::PairError {
                    error: "Cannot pair with yourself".to_string(),
                },
            );
            return;
        }

        // Unknown target and full queue share one opaque answer; code
        // existence stays secret.
        if !self.is_registered(&target_code) {
            self.send_to_code(
                &requester_code,
                ServerMessage::PairError {
                    error: OPAQUE_PAIR_ERROR.to_string(),
                },
            );
            return;
        }

        // A repeat request displaces the old one and its timers.
        self.remove_request(&requester_code, &target_code);

        {
            let pending = self.pending.get(&target_code);
            if pending.map(|p| p.len()).unwrap_or(0) >= MAX_PENDING_PER_TARGET {
                tracing::warn!(
                    target = target_code.as_str(),
                    "Pending pair-request cap reached"
                );
                self.send_to_code(
                    &requester_code,
                    ServerMessage::PairError {
                        error: OPAQUE_PAIR_ERROR.to_string(),
                    },
                );
                return;
            }
        }

        let requester_public_key = match self.public_key_of(&requester_code) {
            Some(pk) => pk,
            None => return, // unbound concurrently; nothing to do
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let request = PairRequest {
            requester_code: requester_code.clone(),
            requester_public_key: requester_public_key.clone(),
            target_code: target_code.clone(),
            proposed_name: proposed_name.clone(),
            created_at: Utc::now(),
            generation,
        };
        self.pending
            .entry(target_code.clone())
            .or_default()
            .push(request);

        self.send_to_code(
            &target_code,
            ServerMessage::PairIncoming {
                from_code: requester_code.clone(),
                from_public_key: requester_public_key,
                expires_in_ms: self.pair_timeout.as_millis() as u64,
                proposed_name,
            },
        );

        Self::spawn_timers(&self, requester_code.clone(), target_code.clone(), generation);

        tracing::info!(
            requester = requester_code.as_str(),
            target = target_code.as_str(),
            "Pair request queued"
        );
    }

    /// Handle a `pair_response` from the connection bound to the target of
    /// a pending request.
    pub fn pair_response(&self, conn: ConnId, raw_target: &str, accepted: bool) {
        let responder_code = match self.code_of(conn) {
            Some(code) => code,
            None => return,
        };

        let requester_code = match normalize_code(raw_target) {
            Ok(code) => code,
            Err(message) => {
                self.send_to_code(&responder_code, ServerMessage::PairError { error: message });
                return;
            }
        };

        let request = match self.remove_request(&requester_code, &responder_code) {
            Some(request) => request,
            None => {
                self.send_to_code(
                    &responder_code,
                    ServerMessage::PairError {
                        error: "No pending request from this peer".to_string(),
                    },
                );
                return;
            }
        };

        if accepted {
            let responder_public_key = self.public_key_of(&responder_code).unwrap_or_default();
            // The requesting side creates the WebRTC offer.
            self.send_to_code(
                &requester_code,
                ServerMessage::PairMatched {
                    peer_code: responder_code.clone(),
                    peer_public_key: responder_public_key,
                    is_initiator: true,
                },
            );
            self.send_to_code(
                &responder_code,
                ServerMessage::PairMatched {
                    peer_code: requester_code.clone(),
                    peer_public_key: request.requester_public_key,
                    is_initiator: false,
                },
            );
            tracing::info!(
                requester = requester_code.as_str(),
                responder = responder_code.as_str(),
                "Pair matched"
            );
        } else {
            self.send_to_code(
                &requester_code,
                ServerMessage::PairRejected {
                    peer_code: responder_code.clone(),
                },
            );
            tracing::info!(
                requester = requester_code.as_str(),
                responder = responder_code.as_str(),
                "Pair rejected"
            );
        }
    }

    /// Unbind a closed connection and cancel every pair request it was a
    /// side of, notifying the surviving counterparties.
    pub fn disconnect(&self, conn: ConnId) {
        let code = match self.conn_to_code.remove(&conn) {
            Some((_, code)) => code,
            None => return,
        };
        self.code_to_conn.remove(&code);

        // Requests targeting this code: tell each requester.
        if let Some((_, requests)) = self.pending.remove(&code) {
            for request in requests {
                if let Some((_, timers)) = self
                    .timers
                    .remove(&(request.requester_code.clone(), code.clone()))
                {
                    timers.cancel();
                }
                self.send_to_code(
                    &request.requester_code,
                    ServerMessage::PairTimeout {
                        peer_code: code.clone(),
                    },
                );
            }
        }

        // Requests this code issued: tell each target.
        let issued: Vec<(String, String)> = self
            .timers
            .iter()
            .filter(|e| e.key().0 == code)
            .map(|e| e.key().clone())
            .collect();
        for key in issued {
            let target = key.1.clone();
            if self.remove_request(&key.0, &key.1).is_some() {
                self.send_to_code(
                    &target,
                    ServerMessage::PairTimeout {
                        peer_code: code.clone(),
                    },
                );
            }
        }

        tracing::info!(code = code.as_str(), "Pairing code released");
    }

    // ── Timers ────────────────────────────────────────────────────────────

    fn spawn_timers(this: &Arc<Self>, requester: String, target: String, generation: u64) {
        let warn_at = this.pair_timeout.saturating_sub(this.warning_lead);
        let remaining = this.warning_lead.as_secs();

        let registry = Arc::clone(this);
        let (req_w, tgt_w) = (requester.clone(), target.clone());
        let warning = tokio::spawn(async move {
            tokio::time::sleep(warn_at).await;
            registry.on_warning(&req_w, &tgt_w, generation, remaining);
        });

        let registry = Arc::clone(this);
        let (req_e, tgt_e) = (requester.clone(), target.clone());
        let timeout = this.pair_timeout;
        let expiry = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            registry.on_expiry(&req_e, &tgt_e, generation);
        });

        this.timers.insert(
            (requester, target),
            RequestTimers {
                generation,
                expiry,
                warning,
            },
        );
    }

    fn on_warning(&self, requester: &str, target: &str, generation: u64, remaining: u64) {
        // The request may already be gone; a stale timer is a no-op.
        let live = self
            .timers
            .get(&(requester.to_string(), target.to_string()))
            .map(|t| t.generation == generation)
            .unwrap_or(false);
        if !live {
            return;
        }

        let warning = ServerMessage::PairExpiring {
            peer_code: target.to_string(),
            remaining_seconds: remaining,
        };
        self.send_to_code(requester, warning);
        self.send_to_code(
            target,
            ServerMessage::PairExpiring {
                peer_code: requester.to_string(),
                remaining_seconds: remaining,
            },
        );
    }

    fn on_expiry(&self, requester: &str, target: &str, generation: u64) {
        let current = self
            .timers
            .get(&(requester.to_string(), target.to_string()))
            .map(|t| t.generation);
        if current != Some(generation) {
            return;
        }
        if self.remove_request(requester, target).is_some() {
            self.send_to_code(
                requester,
                ServerMessage::PairTimeout {
                    peer_code: target.to_string(),
                },
            );
            tracing::debug!(
                requester = requester,
                target = target,
                "Pair request expired"
            );
        }
    }

    /// Remove a pending request and cancel its timers in one step, so no
    /// reader ever observes a request without timers or vice versa.
    fn remove_request(&self, requester: &str, target: &str) -> Option<PairRequest> {
        let removed = {
            let mut entry = self.pending.get_mut(target)?;
            let position = entry
                .iter()
                .position(|r| r.requester_code == requester)?;
            let removed = entry.remove(position);
            if entry.is_empty() {
                drop(entry);
                self.pending
                    .remove_if(target, |_, requests| requests.is_empty());
            }
            removed
        };
        if let Some((_, timers)) = self
            .timers
            .remove(&(requester.to_string(), target.to_string()))
        {
            timers.cancel();
        }
        Some(removed)
    }

    #[cfg(test)]
    fn pending_count(&self, target: &str) -> usize {
        self.pending.get(target).map(|p| p.len()).unwrap_or(0)
    }
}
