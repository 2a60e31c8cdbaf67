//! VBucket ownership: which node masters each vbucket and which nodes hold
//! replica rights. Read on every command dispatch, mutated only by
//! administrative operations (failover, reassignment).

use std::sync::RwLock;

use anyhow::{ensure, Result};
use serde::Serialize;

/// Index of a server node within its bucket.
pub type NodeId = usize;

#[derive(Debug, Clone)]
struct Ownership {
    master: Option<NodeId>,
    replicas: Vec<NodeId>,
}

/// Per-bucket map from vbucket index to its master and ordered replicas.
///
/// Writers (admin operations) serialize against dispatch-path readers behind
/// the RwLock, so a reader never observes a half-updated record.
pub struct VBucketMap {
    entries: RwLock<Vec<Ownership>>,
    num_nodes: usize,
    num_replicas: usize,
}

impl VBucketMap {
    /// Builds the initial layout: masters assigned round-robin, replicas on
    /// the nodes following the master.
    pub fn new(num_vbuckets: u16, num_nodes: usize, num_replicas: usize) -> Result<Self> {
        ensure!(num_vbuckets > 0, "topology requires at least one vbucket");
        ensure!(num_nodes > 0, "topology requires at least one node");
        ensure!(
            num_replicas < num_nodes,
            "replica count {num_replicas} requires more than {num_nodes} node(s)"
        );
        let entries = (0..num_vbuckets as usize)
            .map(|vb| Ownership {
                master: Some(vb % num_nodes),
                replicas: (1..=num_replicas).map(|i| (vb + i) % num_nodes).collect(),
            })
            .collect();
        Ok(Self {
            entries: RwLock::new(entries),
            num_nodes,
            num_replicas,
        })
    }

    pub fn num_vbuckets(&self) -> usize {
        self.entries.read().expect("topology lock poisoned").len()
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn num_replicas(&self) -> usize {
        self.num_replicas
    }

    pub fn master(&self, vbucket: u16) -> Option<NodeId> {
        let entries = self.entries.read().expect("topology lock poisoned");
        entries.get(vbucket as usize).and_then(|e| e.master)
    }

    pub fn replicas(&self, vbucket: u16) -> Vec<NodeId> {
        let entries = self.entries.read().expect("topology lock poisoned");
        entries
            .get(vbucket as usize)
            .map(|e| e.replicas.clone())
            .unwrap_or_default()
    }

    pub fn is_master(&self, node: NodeId, vbucket: u16) -> bool {
        self.master(vbucket) == Some(node)
    }

    /// True iff the node masters the vbucket or holds replica rights for it.
    /// This is the authorization check for replica reads.
    pub fn has_access(&self, node: NodeId, vbucket: u16) -> bool {
        let entries = self.entries.read().expect("topology lock poisoned");
        match entries.get(vbucket as usize) {
            Some(e) => e.master == Some(node) || e.replicas.contains(&node),
            None => false,
        }
    }

    /// Administrative reassignment of a single vbucket's master.
    pub fn set_master(&self, vbucket: u16, node: Option<NodeId>) {
        let mut entries = self.entries.write().expect("topology lock poisoned");
        if let Some(entry) = entries.get_mut(vbucket as usize) {
            entry.master = node;
        }
    }

    pub fn set_replicas(&self, vbucket: u16, replicas: Vec<NodeId>) {
        let mut entries = self.entries.write().expect("topology lock poisoned");
        if let Some(entry) = entries.get_mut(vbucket as usize) {
            entry.replicas = replicas;
        }
    }

    /// Fails a node out of the topology: every vbucket it mastered promotes
    /// its first replica (or loses its master), and the node drops off every
    /// replica list. One write-lock acquisition, so dispatch never sees a
    /// partial failover.
    pub fn failover(&self, node: NodeId) {
        let mut entries = self.entries.write().expect("topology lock poisoned");
        for entry in entries.iter_mut() {
            entry.replicas.retain(|&r| r != node);
            if entry.master == Some(node) {
                entry.master = if entry.replicas.is_empty() {
                    None
                } else {
                    Some(entry.replicas.remove(0))
                };
            }
        }
    }

    /// Rows of the client-discovery projection: `[master, replica...]` with
    /// -1 for an absent master.
    pub fn rows(&self) -> Vec<Vec<i32>> {
        let entries = self.entries.read().expect("topology lock poisoned");
        entries
            .iter()
            .map(|e| {
                let mut row = Vec::with_capacity(1 + e.replicas.len());
                row.push(e.master.map_or(-1, |m| m as i32));
                row.extend(e.replicas.iter().map(|&r| r as i32));
                row
            })
            .collect()
    }
}

/// Read-only projection of a bucket's topology, rendered for the discovery
/// surface the administrative collaborator exposes to clients.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyView {
    pub name: String,
    pub num_replicas: usize,
    pub server_list: Vec<String>,
    pub v_bucket_map: Vec<Vec<i32>>,
}
