//! Server federation (mesh networking).
//!
//! Maintains one WebSocket per known peer server for the gossip layer.
//!
//! ## How it works
//!
//! 1. Peer servers are learned from bootstrap heartbeats and gossip.
//! 2. For each alive member an outbound connection loop dials its
//!    `/federation` endpoint; inbound peers land on the same handler.
//! 3. Both sides exchange `Hello` and then speak `GossipMessage` frames.
//! 4. All inbound traffic is funneled to the SWIM driver through one
//!    channel; sends are best-effort and a dropped peer is re-dialed with
//!    exponential backoff while the membership table still knows it.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use crate::membership::{MemberState, MembershipTable};
use crate::protocol::GossipMessage;

/// Channel sender for pushing messages to a peer server.
pub type PeerSender = mpsc::UnboundedSender<GossipMessage>;

/// Inbound gossip tagged with the sending server's ID.
pub type InboundTx = mpsc::UnboundedSender<(String, GossipMessage)>;

/// Derive the federation endpoint from an advertised WebSocket URL.
pub fn federation_url(endpoint: &str) -> String {
    let trimmed = endpoint.trim_end_matches('/');
    if let Some(base) = trimmed.strip_suffix("/ws") {
        format!("{}/federation", base)
    } else {
        format!("{}/federation", trimmed)
    }
}

/// Manages federated connections to peer servers.
#[derive(Clone)]
pub struct Federation {
    membership: Arc<MembershipTable>,
    /// server_id → sender channel.
    pub peer_senders: Arc<DashMap<String, PeerSender>>,
    /// server_ids with an outbound dial loop running.
    dialing: Arc<DashMap<String, ()>>,
    /// All inbound gossip goes to the SWIM driver through here.
    inbound_tx: InboundTx,
}

impl Federation {
    pub fn new(membership: Arc<MembershipTable>, inbound_tx: InboundTx) -> Self {
        Self {
            membership,
            peer_senders: Arc::new(DashMap::new()),
            dialing: Arc::new(DashMap::new()),
            inbound_tx,
        }
    }

    // ── Outbound connections ──────────────────────────────────────────────

    /// Make sure an outbound dial loop exists for `server_id`. Idempotent.
    pub fn ensure_connection(&self, server_id: &str, endpoint: &str) {
        if server_id == self.membership.self_id() {
            return;
        }
        if self.peer_senders.contains_key(server_id) || self.dialing.contains_key(server_id) {
            return;
        }
        self.dialing.insert(server_id.to_string(), ());

        let fed = self.clone();
        let id = server_id.to_string();
        let endpoint = endpoint.to_string();
        tokio::spawn(async move {
            fed.connection_loop(&id, &endpoint).await;
            fed.dialing.remove(&id);
        });
    }

    /// Persistent dial loop for a single peer. Reconnects with exponential
    /// backoff and gives up once the membership table forgets the peer.
    async fn connection_loop(&self, server_id: &str, endpoint: &str) {
        let mut backoff = Duration::from_secs(1);
        let max_backoff = Duration::from_secs(60);

        loop {
            match self.membership.get(server_id) {
                None => {
                    tracing::info!(peer = server_id, "Peer removed from membership, stop dialing");
                    return;
                }
                Some(member) if member.state == MemberState::Left => {
                    tracing::info!(peer = server_id, "Peer left the federation, stop dialing");
                    return;
                }
                _ => {}
            }

            match self.connect_once(server_id, endpoint).await {
                Ok(()) => {
                    tracing::info!(peer = server_id, "Peer connection closed cleanly");
                    backoff = Duration::from_secs(1);
                }
                Err(e) => {
                    tracing::warn!(peer = server_id, error = %e, "Peer connection failed");
                }
            }

            self.peer_senders.remove(server_id);

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(max_backoff);
        }
    }

    /// One outbound connection: hello, sender task, read loop.
    async fn connect_once(
        &self,
        server_id: &str,
        endpoint: &str,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let url = federation_url(endpoint);
        let (ws_stream, _) = connect_async(&url).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let hello = GossipMessage::Hello {
            member: self.membership.self_record(),
        };
        ws_sender
            .send(WsMessage::Text(serde_json::to_string(&hello)?.into()))
            .await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<GossipMessage>();
        self.peer_senders.insert(server_id.to_string(), tx);

        let sender_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match serde_json::to_string(&msg) {
                    Ok(json) => {
                        if ws_sender.send(WsMessage::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to serialize gossip message");
                    }
                }
            }
        });

        while let Some(msg_result) = ws_receiver.next().await {
            match msg_result {
                Ok(WsMessage::Text(text)) => match serde_json::from_str::<GossipMessage>(&text) {
                    Ok(msg) => {
                        let _ = self.inbound_tx.send((server_id.to_string(), msg));
                    }
                    Err(e) => {
                        tracing::warn!(peer = server_id, error = %e, "Bad gossip frame");
                    }
                },
                Ok(WsMessage::Close(_)) => break,
                Err(e) => {
                    tracing::warn!(peer = server_id, error = %e, "Peer WebSocket error");
                    break;
                }
                _ => {}
            }
        }

        self.peer_senders.remove(server_id);
        sender_task.abort();
        Ok(())
    }

    /// Dial a statically-configured seed endpoint whose server ID we do
    /// not know yet. The peer's `Hello` identifies it; once it lands in
    /// the membership table the normal per-member dial loop takes over.
    pub fn dial_seed(&self, endpoint: &str) {
        let fed = self.clone();
        let endpoint = endpoint.to_string();
        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            let max_backoff = Duration::from_secs(60);
            loop {
                match fed.connect_seed_once(&endpoint).await {
                    Ok(Some(server_id)) => {
                        tracing::info!(
                            peer = server_id.as_str(),
                            endpoint = endpoint.as_str(),
                            "Seed peer identified"
                        );
                        // Reconnects are handled per-member from here on.
                        fed.ensure_connection(&server_id, &endpoint);
                        return;
                    }
                    Ok(None) => {
                        tracing::warn!(endpoint = endpoint.as_str(), "Seed closed before hello");
                    }
                    Err(e) => {
                        tracing::warn!(endpoint = endpoint.as_str(), error = %e, "Seed dial failed");
                    }
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
            }
        });
    }

    /// One seed connection: returns the server ID learned from the peer's
    /// `Hello`, or None if the connection closed before one arrived.
    async fn connect_seed_once(
        &self,
        endpoint: &str,
    ) -> Result<Option<String>, Box<dyn std::error::Error + Send + Sync>> {
        let url = federation_url(endpoint);
        let (ws_stream, _) = connect_async(&url).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let hello = GossipMessage::Hello {
            member: self.membership.self_record(),
        };
        ws_sender
            .send(WsMessage::Text(serde_json::to_string(&hello)?.into()))
            .await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<GossipMessage>();
        let sender_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Ok(json) = serde_json::to_string(&msg) {
                    if ws_sender.send(WsMessage::Text(json.into())).await.is_err() {
                        break;
                    }
                }
            }
        });

        let mut learned_id: Option<String> = None;
        while let Some(msg_result) = ws_receiver.next().await {
            match msg_result {
                Ok(WsMessage::Text(text)) => match serde_json::from_str::<GossipMessage>(&text) {
                    Ok(msg) => {
                        if learned_id.is_none() {
                            if let GossipMessage::Hello { ref member } = msg {
                                learned_id = Some(member.server_id.clone());
                                self.peer_senders
                                    .insert(member.server_id.clone(), tx.clone());
                            }
                        }
                        match &learned_id {
                            Some(id) => {
                                let _ = self.inbound_tx.send((id.clone(), msg));
                            }
                            None => {
                                tracing::warn!("Seed frame before hello, dropping");
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(endpoint = endpoint, error = %e, "Bad gossip frame");
                    }
                },
                Ok(WsMessage::Close(_)) => break,
                Err(_) => break,
                _ => {}
            }
        }

        if let Some(id) = &learned_id {
            self.peer_senders.remove(id);
        }
        sender_task.abort();
        Ok(learned_id)
    }

    // ── Inbound connections (registered by the `/federation` handler) ────

    /// Register the sender for a peer that dialed us.
    pub fn register_inbound(&self, server_id: &str, sender: PeerSender) {
        self.peer_senders.insert(server_id.to_string(), sender);
    }

    /// Forget a disconnected peer's sender.
    pub fn remove_peer(&self, server_id: &str) {
        self.peer_senders.remove(server_id);
    }

    /// Hand an inbound gossip frame to the SWIM driver.
    pub fn dispatch_inbound(&self, server_id: &str, msg: GossipMessage) {
        let _ = self.inbound_tx.send((server_id.to_string(), msg));
    }

    // ── Sending ───────────────────────────────────────────────────────────

    /// Best-effort send to one peer.
    pub fn send_to(&self, server_id: &str, msg: GossipMessage) -> bool {
        if let Some(sender) = self.peer_senders.get(server_id) {
            sender.send(msg).is_ok()
        } else {
            false
        }
    }

    /// Best-effort broadcast to every connected peer.
    pub fn broadcast(&self, msg: GossipMessage) {
        for entry in self.peer_senders.iter() {
            let _ = entry.value().send(msg.clone());
        }
    }

    pub fn connected_peer_count(&self) -> usize {
        self.peer_senders.len()
    }

    pub fn is_connected(&self, server_id: &str) -> bool {
        self.peer_senders.contains_key(server_id)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
