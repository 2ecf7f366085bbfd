//! Bootstrap registry client.
//!
//! Registers this server with an external HTTP index so brand-new peers
//! and gossip-less servers can find it. Every failure here is non-fatal:
//! the server keeps running, retries with capped backoff, and nothing
//! bootstrap-related is ever surfaced to clients.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::membership::Member;
use crate::state::ServerState;
use crate::swim::Swim;

/// A server entry as the bootstrap index returns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapServer {
    pub server_id: String,
    pub endpoint: String,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub region: String,
}

impl BootstrapServer {
    /// Seed record for the membership table.
    pub fn into_member(self) -> Member {
        Member::alive(&self.server_id, &self.endpoint, &self.region)
    }
}

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    server_id: &'a str,
    endpoint: &'a str,
    public_key: &'a str,
    region: &'a str,
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    success: bool,
}

#[derive(Debug, Serialize)]
struct HeartbeatRequest<'a> {
    server_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct HeartbeatResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    peers: Vec<BootstrapServer>,
}

/// Thin client over the bootstrap HTTP protocol.
pub struct BootstrapClient {
    base_url: String,
    http: reqwest::Client,
}

impl BootstrapClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// `POST /servers` — announce ourselves.
    pub async fn register(
        &self,
        server_id: &str,
        endpoint: &str,
        public_key: &str,
        region: &str,
    ) -> Result<(), reqwest::Error> {
        let response: RegisterResponse = self
            .http
            .post(format!("{}/servers", self.base_url))
            .json(&RegisterRequest {
                server_id,
                endpoint,
                public_key,
                region,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if !response.success {
            tracing::warn!("Bootstrap registration not acknowledged");
        }
        Ok(())
    }

    /// `POST /servers/heartbeat` — refresh our entry; the response carries
    /// the current server list (minus us), used to seed gossip.
    pub async fn heartbeat(&self, server_id: &str) -> Result<Vec<BootstrapServer>, reqwest::Error> {
        let response: HeartbeatResponse = self
            .http
            .post(format!("{}/servers/heartbeat", self.base_url))
            .json(&HeartbeatRequest { server_id })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if !response.success {
            tracing::debug!("Bootstrap heartbeat not acknowledged");
        }
        Ok(response.peers)
    }

    /// `DELETE /servers/{server_id}` — graceful shutdown.
    pub async fn unregister(&self, server_id: &str) -> Result<(), reqwest::Error> {
        self.http
            .delete(format!("{}/servers/{}", self.base_url, server_id))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Register (with capped retry backoff), then heartbeat forever, merging
/// each response's peer list into the SWIM view.
pub async fn run(client: BootstrapClient, state: ServerState, swim: Swim) {
    let server_id = state.server_id().to_string();
    let public_key = state.identity.public_key_b64();
    let endpoint = state.config.endpoint.clone();
    let region = state.config.region.clone();

    let mut backoff = Duration::from_secs(1);
    let max_backoff = Duration::from_secs(60);
    loop {
        match client
            .register(&server_id, &endpoint, &public_key, &region)
            .await
        {
            Ok(()) => {
                tracing::info!("Registered with bootstrap index");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, backoff_secs = backoff.as_secs(), "Bootstrap registration failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
            }
        }
    }

    let mut interval = tokio::time::interval(state.config.bootstrap_heartbeat);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match client.heartbeat(&server_id).await {
            Ok(peers) => {
                let members: Vec<Member> = peers
                    .into_iter()
                    .filter(|peer| peer.server_id != server_id)
                    .map(BootstrapServer::into_member)
                    .collect();
                if !members.is_empty() {
                    swim.seed_members(members);
                }
            }
            Err(e) => {
                // Heartbeat failures never affect local state.
                tracing::warn!(error = %e, "Bootstrap heartbeat failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_response_parsing() {
        let json = r#"{"success": true, "peers": [
            {"server_id": "s2", "endpoint": "wss://s2.example.com", "public_key": "cGs=", "region": "eu-west"},
            {"server_id": "s3", "endpoint": "wss://s3.example.com"}
        ]}"#;
        let response: HeartbeatResponse = serde_json::from_str(json).unwrap();
        assert!(response.success);
        assert_eq!(response.peers.len(), 2);
        assert_eq!(response.peers[1].region, "");
        assert!(response.peers[1].public_key.is_none());
    }

    #[test]
    fn test_into_member_is_alive_at_zero() {
        let server = BootstrapServer {
            server_id: "s2".to_string(),
            endpoint: "wss://s2.example.com".to_string(),
            public_key: None,
            region: "eu-west".to_string(),
        };
        let member = server.into_member();
        assert_eq!(member.server_id, "s2");
        assert_eq!(member.incarnation, 0);
        assert_eq!(member.state, crate::membership::MemberState::Alive);
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = BootstrapClient::new("https://index.example.com/");
        assert_eq!(client.base_url, "https://index.example.com");
    }

    #[test]
    fn test_register_request_wire_shape() {
        let body = serde_json::to_value(RegisterRequest {
            server_id: "s1",
            endpoint: "wss://s1.example.com",
            public_key: "cGs=",
            region: "us-east",
        })
        .unwrap();
        assert_eq!(body["server_id"], "s1");
        assert_eq!(body["endpoint"], "wss://s1.example.com");
        assert_eq!(body["public_key"], "cGs=");
        assert_eq!(body["region"], "us-east");
    }
}
