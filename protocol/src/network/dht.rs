//! # Distributed Hash Table
//!
//! Consistent hashing over the live membership. Every physical node owns
//! `virtual_nodes` positions on a ring keyed by the SHA-256 hex digest of
//! `"{node_id}:{index}"`; a key belongs to the first position at or after
//! its own digest, wrapping around at the end.
//!
//! ```text
//!        ┌──── a:17 ──── c:4 ────┐
//!   b:88                          a:102      hash("user:7") lands here,
//!        └──── c:131 ─── b:5 ────┘           owner = next position clockwise
//! ```
//!
//! Entries are replicated on the first `replication_factor` distinct
//! physical nodes clockwise from the key. When a replica-set member leaves,
//! every local entry it held is stored again under a fresh replica set.
//! A relocation that no new replica accepted keeps the local copy and is
//! retried on the next rebalance.

use std::collections::{BTreeMap, BTreeSet};

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::{now_ms, MeshConfig};
use crate::network::coordinator::Coordinator;
use crate::network::message::Message;

/// DHT parameters derived from [`MeshConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhtConfig {
    /// Ring positions per physical node.
    pub virtual_nodes: usize,
    /// Distinct nodes each key is stored on.
    pub replication_factor: usize,
}

impl From<&MeshConfig> for DhtConfig {
    fn from(config: &MeshConfig) -> Self {
        Self {
            virtual_nodes: config.dht_virtual_nodes,
            replication_factor: config.dht_replication_factor,
        }
    }
}

/// SHA-256 hex digest used for ring positions and key lookups.
pub fn ring_hash(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

// ---------------------------------------------------------------------------
// Ring
// ---------------------------------------------------------------------------

/// Sorted ring of virtual positions.
#[derive(Debug, Clone)]
pub struct HashRing {
    virtual_nodes: usize,
    ring: BTreeMap<String, String>,
    members: BTreeSet<String>,
}

impl HashRing {
    /// An empty ring.
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            virtual_nodes: virtual_nodes.max(1),
            ring: BTreeMap::new(),
            members: BTreeSet::new(),
        }
    }

    /// Adds all positions of a node. False if it was already a member.
    pub fn add_node(&mut self, node_id: &str) -> bool {
        if !self.members.insert(node_id.to_string()) {
            return false;
        }
        for index in 0..self.virtual_nodes {
            self.ring
                .insert(ring_hash(&format!("{node_id}:{index}")), node_id.to_string());
        }
        true
    }

    /// Removes all positions of a node. False if it was not a member.
    pub fn remove_node(&mut self, node_id: &str) -> bool {
        if !self.members.remove(node_id) {
            return false;
        }
        self.ring.retain(|_, owner| owner != node_id);
        true
    }

    /// Whether the node is on the ring.
    pub fn contains(&self, node_id: &str) -> bool {
        self.members.contains(node_id)
    }

    /// Physical members, sorted.
    pub fn members(&self) -> Vec<String> {
        self.members.iter().cloned().collect()
    }

    /// Number of physical members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the ring has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Number of virtual positions.
    pub fn position_count(&self) -> usize {
        self.ring.len()
    }

    /// Owner of `key`: the first position at or after its hash, wrapping.
    pub fn find_node(&self, key: &str) -> Option<&str> {
        let hash = ring_hash(key);
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, owner)| owner.as_str())
    }

    /// Up to `n` distinct physical nodes clockwise from `key`.
    pub fn find_successors(&self, key: &str, n: usize) -> Vec<String> {
        let hash = ring_hash(key);
        let mut found: Vec<String> = Vec::with_capacity(n);
        let clockwise = self
            .ring
            .range(hash.clone()..)
            .chain(self.ring.range(..hash));
        for (_, owner) in clockwise {
            if found.len() >= n {
                break;
            }
            if !found.iter().any(|f| f == owner) {
                found.push(owner.clone());
            }
        }
        found
    }
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// A replicated key/value pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    /// Key.
    pub key: String,
    /// Value.
    pub value: serde_json::Value,
    /// Unix ms of the write; the latest write wins.
    pub timestamp: u64,
    /// Nodes the entry was placed on.
    pub replica_set: Vec<String>,
}

/// Result of placing one replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreOutcome {
    /// Replica node.
    pub node_id: String,
    /// Whether the replica acknowledged.
    pub stored: bool,
    /// Failure reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Ring plus locally held entries for one node.
pub struct DistributedHashTable {
    node_id: String,
    config: DhtConfig,
    ring: RwLock<HashRing>,
    entries: DashMap<String, StoredEntry>,
    /// Keys whose relocation found no accepting replica.
    unplaced: Mutex<BTreeSet<String>>,
}

impl DistributedHashTable {
    /// A table whose ring initially contains only this node.
    pub fn new(node_id: impl Into<String>, config: DhtConfig) -> Self {
        let node_id = node_id.into();
        let mut ring = HashRing::new(config.virtual_nodes);
        ring.add_node(&node_id);
        Self {
            node_id,
            config,
            ring: RwLock::new(ring),
            entries: DashMap::new(),
            unplaced: Mutex::new(BTreeSet::new()),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    /// Makes the ring match `peers` plus this node. Returns the removed
    /// members.
    pub fn sync_membership(&self, peers: &[String]) -> Vec<String> {
        let mut ring = self.ring.write();
        let wanted: BTreeSet<&str> = peers
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(self.node_id.as_str()))
            .collect();

        let removed: Vec<String> = ring
            .members()
            .into_iter()
            .filter(|m| !wanted.contains(m.as_str()))
            .collect();
        for member in &removed {
            ring.remove_node(member);
        }
        for member in wanted {
            ring.add_node(member);
        }
        removed
    }

    /// Current ring members.
    pub fn members(&self) -> Vec<String> {
        self.ring.read().members()
    }

    /// Primary owner of `key`.
    pub fn find_node(&self, key: &str) -> Option<String> {
        self.ring.read().find_node(key).map(str::to_string)
    }

    /// Replica set for `key`.
    pub fn find_successors(&self, key: &str, n: usize) -> Vec<String> {
        self.ring.read().find_successors(key, n)
    }

    /// Stores `value` under `key` on its replica set.
    pub async fn store(
        &self,
        coordinator: &Coordinator,
        key: &str,
        value: serde_json::Value,
    ) -> Vec<StoreOutcome> {
        let entry = StoredEntry {
            key: key.to_string(),
            value,
            timestamp: now_ms(),
            replica_set: self.find_successors(key, self.config.replication_factor),
        };
        self.place(coordinator, entry).await
    }

    async fn place(&self, coordinator: &Coordinator, entry: StoredEntry) -> Vec<StoreOutcome> {
        let replicas = entry.replica_set.clone();
        let placements = replicas.iter().map(|node_id| {
            let entry = entry.clone();
            async move {
                if *node_id == self.node_id {
                    self.store_local(entry);
                    return StoreOutcome {
                        node_id: node_id.clone(),
                        stored: true,
                        error: None,
                    };
                }
                let key = entry.key.clone();
                let result = coordinator.request(node_id, Message::DhtStore { entry }).await;
                let error = match result {
                    Ok(Some(Message::DhtStoreAck { key: acked })) if acked == key => None,
                    Ok(other) => Some(format!(
                        "unexpected reply: {}",
                        other.map_or("none", |m| m.kind())
                    )),
                    Err(e) => Some(e.to_string()),
                };
                StoreOutcome {
                    node_id: node_id.clone(),
                    stored: error.is_none(),
                    error,
                }
            }
        });
        let outcomes = join_all(placements).await;

        let stored = outcomes.iter().filter(|o| o.stored).count();
        if replicas.iter().any(|r| *r == self.node_id) || stored > 0 {
            self.unplaced.lock().remove(&entry.key);
            if !replicas.iter().any(|r| *r == self.node_id) {
                self.entries.remove(&entry.key);
            }
        } else if self.entries.contains_key(&entry.key) {
            warn!(node = %self.node_id, key = %entry.key, "no replica accepted the entry, keeping local copy");
            self.unplaced.lock().insert(entry.key.clone());
        }

        debug!(node = %self.node_id, key = %entry.key, stored, replicas = outcomes.len(), "dht store");
        outcomes
    }

    /// Fetches `key` from its primary owner. Transport failures yield `None`.
    pub async fn retrieve(&self, coordinator: &Coordinator, key: &str) -> Option<serde_json::Value> {
        let owner = self.find_node(key)?;
        if owner == self.node_id {
            return self.get_local(key);
        }

        match coordinator
            .request(&owner, Message::DhtRetrieve { key: key.to_string() })
            .await
        {
            Ok(Some(Message::DhtValue { value, .. })) => value,
            Ok(_) => None,
            Err(e) => {
                debug!(node = %self.node_id, key, owner = %owner, error = %e, "dht retrieve failed");
                None
            }
        }
    }

    /// Applies a replica locally unless a newer write is already held.
    pub fn store_local(&self, entry: StoredEntry) -> bool {
        if let Some(existing) = self.entries.get(&entry.key) {
            if existing.timestamp > entry.timestamp {
                return false;
            }
        }
        self.entries.insert(entry.key.clone(), entry);
        true
    }

    /// The locally held value for `key`.
    pub fn get_local(&self, key: &str) -> Option<serde_json::Value> {
        self.entries.get(key).map(|e| e.value.clone())
    }

    /// The locally held entry for `key`.
    pub fn entry(&self, key: &str) -> Option<StoredEntry> {
        self.entries.get(key).map(|e| e.clone())
    }

    /// Number of locally held entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries are held locally.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of local entries waiting for a replica to accept them.
    pub fn unplaced_count(&self) -> usize {
        self.unplaced.lock().len()
    }

    /// Re-places every local entry whose replica set included a removed
    /// node, plus earlier relocations that found no replica. The original
    /// write timestamp is kept. Returns entries attempted.
    pub async fn rebalance(&self, coordinator: &Coordinator, removed: &[String]) -> usize {
        let unplaced = self.unplaced.lock().clone();
        if removed.is_empty() && unplaced.is_empty() {
            return 0;
        }
        let affected: Vec<StoredEntry> = self
            .entries
            .iter()
            .filter(|e| {
                unplaced.contains(e.key()) || e.replica_set.iter().any(|r| removed.contains(r))
            })
            .map(|e| e.value().clone())
            .collect();

        for entry in &affected {
            let relocated = StoredEntry {
                replica_set: self.find_successors(&entry.key, self.config.replication_factor),
                ..entry.clone()
            };
            self.place(coordinator, relocated).await;
        }

        if !affected.is_empty() {
            info!(node = %self.node_id, moved = affected.len(), removed = ?removed, "dht rebalanced");
        }
        affected.len()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::network::events::EventBus;
    use crate::network::transport::{LatencyModel, LocalNetwork};

    fn ring_of(nodes: &[&str]) -> HashRing {
        let mut ring = HashRing::new(150);
        for node in nodes {
            ring.add_node(node);
        }
        ring
    }

    #[test]
    fn ring_hash_is_sha256_hex() {
        assert_eq!(
            ring_hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn lookup_is_deterministic() {
        let ring = ring_of(&["a", "b", "c", "d"]);
        let owner = ring.find_node("user:42").unwrap().to_string();
        for _ in 0..10 {
            assert_eq!(ring.find_node("user:42"), Some(owner.as_str()));
        }
        assert_eq!(ring_of(&["d", "c", "b", "a"]).find_node("user:42"), Some(owner.as_str()));
    }

    #[test]
    fn successors_are_distinct_physical_nodes() {
        let ring = ring_of(&["a", "b", "c", "d", "e"]);
        for key in ["k1", "k2", "k3", "zzz", ""] {
            let successors = ring.find_successors(key, 3);
            assert_eq!(successors.len(), 3);
            let unique: BTreeSet<_> = successors.iter().collect();
            assert_eq!(unique.len(), 3);
            assert_eq!(successors[0], ring.find_node(key).unwrap());
        }
        assert_eq!(ring.find_successors("k1", 9).len(), 5);
    }

    #[test]
    fn removing_a_node_drops_all_its_positions() {
        let mut ring = ring_of(&["a", "b"]);
        assert_eq!(ring.position_count(), 300);
        assert!(ring.remove_node("a"));
        assert!(!ring.remove_node("a"));
        assert_eq!(ring.position_count(), 150);
        assert_eq!(ring.find_node("anything"), Some("b"));
        assert!(HashRing::new(10).find_node("x").is_none());
    }

    #[test]
    fn removal_only_moves_keys_owned_by_the_removed_node() {
        let mut ring = ring_of(&["a", "b", "c", "d"]);
        let keys: Vec<String> = (0..200).map(|i| format!("key-{i}")).collect();
        let before: Vec<String> = keys.iter().map(|k| ring.find_node(k).unwrap().to_string()).collect();

        ring.remove_node("c");
        for (key, owner) in keys.iter().zip(before) {
            if owner != "c" {
                assert_eq!(ring.find_node(key), Some(owner.as_str()));
            }
        }
    }

    #[test]
    fn latest_write_wins_locally() {
        let dht = DistributedHashTable::new("a", DhtConfig { virtual_nodes: 10, replication_factor: 1 });
        let entry = |value, timestamp| StoredEntry {
            key: "k".into(),
            value,
            timestamp,
            replica_set: vec!["a".into()],
        };
        assert!(dht.store_local(entry(json!(1), 10)));
        assert!(!dht.store_local(entry(json!(0), 5)));
        assert!(dht.store_local(entry(json!(2), 10)));
        assert_eq!(dht.get_local("k"), Some(json!(2)));
    }

    #[test]
    fn membership_sync_reports_removed_nodes() {
        let dht = DistributedHashTable::new("a", DhtConfig { virtual_nodes: 10, replication_factor: 3 });
        assert!(dht.sync_membership(&["b".to_string(), "c".to_string()]).is_empty());
        assert_eq!(dht.members(), vec!["a", "b", "c"]);

        let removed = dht.sync_membership(&["c".to_string()]);
        assert_eq!(removed, vec!["b".to_string()]);
        assert_eq!(dht.members(), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn single_node_stores_and_retrieves_locally() {
        let net = LocalNetwork::new(LatencyModel::none());
        let (transport, _rx) = net.attach("a");
        let coordinator = Coordinator::new("a", &MeshConfig::default(), transport, EventBus::new());
        let dht = DistributedHashTable::new("a", DhtConfig::from(&MeshConfig::default()));

        let outcomes = dht.store(&coordinator, "k", json!({"v": 1})).await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].stored);
        assert_eq!(dht.retrieve(&coordinator, "k").await, Some(json!({"v": 1})));
        assert_eq!(dht.retrieve(&coordinator, "missing").await, None);
    }

    #[tokio::test]
    async fn unreachable_replicas_are_reported_not_raised() {
        let net = LocalNetwork::new(LatencyModel::none());
        let (transport, _rx) = net.attach("a");
        let coordinator = Coordinator::new("a", &MeshConfig::default(), transport, EventBus::new());
        coordinator.connect_peer("b", "local://b").await.unwrap();

        let dht = DistributedHashTable::new("a", DhtConfig { virtual_nodes: 50, replication_factor: 2 });
        dht.sync_membership(&coordinator.peer_ids());

        let outcomes = dht.store(&coordinator, "k", json!("v")).await;
        assert_eq!(outcomes.len(), 2);
        let failed: Vec<_> = outcomes.iter().filter(|o| !o.stored).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].node_id, "b");
        assert!(failed[0].error.is_some());
    }

    #[tokio::test]
    async fn failed_relocation_keeps_the_local_copy_until_a_replica_accepts() {
        let net = LocalNetwork::new(LatencyModel::none());
        let (transport, _rx) = net.attach("a");
        let coordinator = Coordinator::new("a", &MeshConfig::default(), transport, EventBus::new());
        let peers: Vec<String> = ["b", "c", "d", "e", "f", "g", "h"].iter().map(|p| p.to_string()).collect();
        for peer in &peers {
            coordinator.connect_peer(peer, &format!("local://{peer}")).await.unwrap();
        }

        let dht = DistributedHashTable::new("a", DhtConfig { virtual_nodes: 50, replication_factor: 1 });
        dht.sync_membership(&coordinator.peer_ids());
        let key = (0..100)
            .map(|i| format!("key-{i}"))
            .find(|k| dht.find_node(k).as_deref() != Some("a"))
            .unwrap();
        let owner = dht.find_node(&key).unwrap();
        dht.store_local(StoredEntry {
            key: key.clone(),
            value: json!("v"),
            timestamp: 1,
            replica_set: vec!["a".into(), "gone".into()],
        });

        assert_eq!(dht.rebalance(&coordinator, &["gone".to_string()]).await, 1);
        let kept = dht.entry(&key).expect("local copy kept");
        assert_eq!(kept.replica_set, vec!["a".to_string(), "gone".to_string()]);
        assert_eq!(dht.unplaced_count(), 1);

        let (_owner_transport, mut owner_rx) = net.attach(&owner);
        tokio::spawn(async move {
            while let Some(inbound) = owner_rx.recv().await {
                if let (Message::DhtStore { entry }, Some(reply)) = (inbound.envelope.message, inbound.reply) {
                    let _ = reply.send(Some(Message::DhtStoreAck { key: entry.key }));
                }
            }
        });

        assert_eq!(dht.rebalance(&coordinator, &[]).await, 1);
        assert!(dht.entry(&key).is_none());
        assert_eq!(dht.unplaced_count(), 0);
        assert_eq!(dht.rebalance(&coordinator, &[]).await, 0);
    }
}
