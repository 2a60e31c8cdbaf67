//! Bucket assembly: one shared storage, a vbucket topology, and N server
//! nodes serving it. Also the contact surface the administrative
//! collaborator uses (flush-all, topology edits, the discovery projection).

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::server::ServerNode;
use crate::store::Storage;
use crate::topology::{NodeId, TopologyView, VBucketMap};

#[derive(Debug, Clone)]
pub struct BucketOptions {
    /// Bucket name reported in the cluster configuration.
    pub name: String,
    /// Address of the first node. Port 0 gives every node an ephemeral
    /// port; a fixed port places the nodes on consecutive ports.
    pub listen: SocketAddr,
    pub num_nodes: usize,
    pub num_replicas: usize,
    pub num_vbuckets: u16,
}

impl Default for BucketOptions {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            listen: "127.0.0.1:0".parse().expect("static address"),
            num_nodes: 1,
            num_replicas: 0,
            num_vbuckets: 1024,
        }
    }
}

/// A running emulated bucket. Dropping it abandons the node tasks; call
/// [`Bucket::shutdown`] for an orderly stop.
pub struct Bucket {
    name: String,
    storage: Arc<Storage>,
    addrs: Vec<SocketAddr>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Bucket {
    /// Builds the topology, binds every node's listener, and spawns the
    /// accept loops.
    pub async fn start(options: BucketOptions) -> Result<Self> {
        let topology = Arc::new(VBucketMap::new(
            options.num_vbuckets,
            options.num_nodes,
            options.num_replicas,
        )?);
        let storage = Arc::new(Storage::new(topology));
        let (shutdown, _) = watch::channel(false);

        let mut addrs = Vec::with_capacity(options.num_nodes);
        let mut tasks = Vec::with_capacity(options.num_nodes);
        for id in 0..options.num_nodes {
            let addr = node_addr(options.listen, id);
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind node {id} on {addr}"))?;
            let node = ServerNode::new(id, Arc::clone(&storage), listener);
            let bound = node.local_addr()?;
            info!(node = id, addr = %bound, "server node listening");
            addrs.push(bound);

            let mut stop = shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                let stopped = async move {
                    let _ = stop.changed().await;
                };
                if let Err(err) = node.run_until(stopped).await {
                    warn!(error = ?err, "server node exited with error");
                }
            }));
        }

        Ok(Self {
            name: options.name,
            storage,
            addrs,
            shutdown,
            tasks,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node_addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    pub fn topology(&self) -> &VBucketMap {
        self.storage.topology()
    }

    /// Administrative flush: clears every vbucket the bucket holds.
    pub fn flush(&self) {
        self.storage.flush_all();
    }

    /// Administrative failover of one node (promotes replicas, drops the
    /// node from every ownership record).
    pub fn failover(&self, node: NodeId) {
        self.storage.topology().failover(node);
    }

    /// Read-only projection of the topology, as the discovery surface
    /// renders it for clients.
    pub fn config(&self) -> TopologyView {
        let topology = self.storage.topology();
        TopologyView {
            name: self.name.clone(),
            num_replicas: topology.num_replicas(),
            server_list: self.addrs.iter().map(SocketAddr::to_string).collect(),
            v_bucket_map: topology.rows(),
        }
    }

    pub fn config_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.config()).context("failed to render bucket config")
    }

    /// Stops every node and waits for the accept loops to finish.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            task.await.context("server node task panicked")?;
        }
        Ok(())
    }
}

fn node_addr(base: SocketAddr, id: usize) -> SocketAddr {
    let mut addr = base;
    if base.port() != 0 {
        addr.set_port(base.port() + id as u16);
    }
    addr
}
