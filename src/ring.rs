//! Consistent-hash ring and routing table.
//!
//! Every alive server contributes `V` virtual nodes with tokens derived
//! from `SHA-256("{server_id}:{v_index}")`. Responsibility for a key is the
//! first `R` distinct servers clockwise from the key's hash. The ring is
//! rebuilt as a whole on membership change and swapped in atomically, so
//! readers see either the old or the new snapshot, never a partial one.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use sha2::{Digest, Sha256};

use crate::membership::Member;
use crate::protocol::RedirectTarget;

/// Virtual nodes per physical server.
pub const DEFAULT_VNODES: usize = 160;

/// Default replication factor.
pub const DEFAULT_REPLICATION: usize = 2;

/// First 8 bytes of SHA-256, big-endian. Identical on every server.
pub fn hash_key(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

#[derive(Debug, Clone)]
struct VirtualNode {
    token: u64,
    server_id: String,
}

/// Where a key lives relative to this server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    /// Which replica slot this server occupies for the key, if any.
    pub local_replica: Option<usize>,
    /// The other responsible servers, in ring order.
    pub remote: Vec<RedirectTarget>,
}

impl RouteDecision {
    pub fn is_local(&self) -> bool {
        self.local_replica.is_some()
    }
}

/// An immutable ring snapshot.
#[derive(Debug, Clone)]
pub struct HashRing {
    vnodes: Vec<VirtualNode>,
    endpoints: HashMap<String, RedirectTarget>,
    replication: usize,
}

impl HashRing {
    /// Build a ring over `members` with `vnodes_per_server` virtual nodes
    /// each. Token collisions are broken by lexicographic server ID so the
    /// order is deterministic on every node.
    pub fn build(members: &[Member], vnodes_per_server: usize, replication: usize) -> Self {
        let mut vnodes = Vec::with_capacity(members.len() * vnodes_per_server);
        let mut endpoints = HashMap::with_capacity(members.len());

        for member in members {
            endpoints.insert(
                member.server_id.clone(),
                RedirectTarget {
                    server_id: member.server_id.clone(),
                    endpoint: member.endpoint.clone(),
                },
            );
            for v_index in 0..vnodes_per_server {
                vnodes.push(VirtualNode {
                    token: hash_key(&format!("{}:{}", member.server_id, v_index)),
                    server_id: member.server_id.clone(),
                });
            }
        }

        vnodes.sort_by(|a, b| a.token.cmp(&b.token).then(a.server_id.cmp(&b.server_id)));

        Self {
            vnodes,
            endpoints,
            replication,
        }
    }

    /// Number of distinct physical servers in the ring.
    pub fn server_count(&self) -> usize {
        self.endpoints.len()
    }

    /// The `min(R, |servers|)` distinct servers responsible for `key`,
    /// clockwise from its hash.
    pub fn responsible_nodes(&self, key: &str) -> Vec<RedirectTarget> {
        self.responsible_ids(key)
            .into_iter()
            .filter_map(|id| self.endpoints.get(&id).cloned())
            .collect()
    }

    fn responsible_ids(&self, key: &str) -> Vec<String> {
        if self.vnodes.is_empty() {
            return Vec::new();
        }

        let want = self.replication.min(self.endpoints.len());
        let key_hash = hash_key(key);
        let start = self
            .vnodes
            .partition_point(|v| v.token < key_hash)
            % self.vnodes.len();

        let mut out: Vec<String> = Vec::with_capacity(want);
        for i in 0..self.vnodes.len() {
            let vnode = &self.vnodes[(start + i) % self.vnodes.len()];
            if !out.iter().any(|id| id == &vnode.server_id) {
                out.push(vnode.server_id.clone());
                if out.len() == want {
                    break;
                }
            }
        }
        out
    }

    /// Classify `key` from `self_id`'s perspective.
    pub fn route(&self, key: &str, self_id: &str) -> RouteDecision {
        let ids = self.responsible_ids(key);
        let local_replica = ids.iter().position(|id| id == self_id);
        let remote = ids
            .into_iter()
            .filter(|id| id != self_id)
            .filter_map(|id| self.endpoints.get(&id).cloned())
            .collect();
        RouteDecision {
            local_replica,
            remote,
        }
    }
}

// ── Routing table ─────────────────────────────────────────────────────────────

/// Copy-on-write routing view over the current ring.
pub struct RoutingTable {
    ring: RwLock<Arc<HashRing>>,
    self_id: String,
    vnodes_per_server: usize,
    replication: usize,
}

impl RoutingTable {
    /// A table containing only this server — every key is local until the
    /// first membership rebuild.
    pub fn solo(self_member: &Member, vnodes_per_server: usize, replication: usize) -> Self {
        let ring = HashRing::build(
            std::slice::from_ref(self_member),
            vnodes_per_server,
            replication,
        );
        Self {
            ring: RwLock::new(Arc::new(ring)),
            self_id: self_member.server_id.clone(),
            vnodes_per_server,
            replication,
        }
    }

    /// Atomically replace the ring snapshot.
    pub fn rebuild(&self, members: &[Member]) {
        let ring = HashRing::build(members, self.vnodes_per_server, self.replication);
        tracing::debug!(
            servers = ring.server_count(),
            vnodes = ring.vnodes.len(),
            "Routing table rebuilt"
        );
        *self.ring.write().expect("ring lock poisoned") = Arc::new(ring);
    }

    pub fn snapshot(&self) -> Arc<HashRing> {
        self.ring.read().expect("ring lock poisoned").clone()
    }

    pub fn route(&self, key: &str) -> RouteDecision {
        self.snapshot().route(key, &self.self_id)
    }

    /// Responsible servers other than this one, for redirect hints.
    pub fn other_responsible(&self, key: &str) -> Vec<RedirectTarget> {
        self.route(key).remote
    }

    pub fn server_count(&self) -> usize {
        self.snapshot().server_count()
    }
}
