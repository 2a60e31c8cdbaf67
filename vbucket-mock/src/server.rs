//! One emulated server node: the accept loop plus the context every
//! executor sees (node identity, shared storage, dispatch table).

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tracing::{info, warn};

use crate::connection::handle_connection;
use crate::executor::CommandTable;
use crate::store::Storage;
use crate::topology::NodeId;

/// Everything command dispatch needs from the owning node.
pub struct NodeContext {
    pub id: NodeId,
    pub storage: Arc<Storage>,
    pub started: Instant,
    pub table: CommandTable,
}

impl NodeContext {
    pub fn new(id: NodeId, storage: Arc<Storage>) -> Self {
        Self {
            id,
            storage,
            started: Instant::now(),
            table: CommandTable::new(),
        }
    }
}

/// A single node of the emulated cluster, bound to its own listener.
/// Several nodes typically share one [`Storage`]; the topology decides
/// which of them may serve which vbucket.
pub struct ServerNode {
    listener: TcpListener,
    ctx: Arc<NodeContext>,
}

impl ServerNode {
    pub fn new(id: NodeId, storage: Arc<Storage>, listener: TcpListener) -> Self {
        Self {
            listener,
            ctx: Arc::new(NodeContext::new(id, storage)),
        }
    }

    pub fn id(&self) -> NodeId {
        self.ctx.id
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until the shutdown future resolves. Each accepted
    /// socket gets its own task; connection failures never stop the node.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let ServerNode { listener, ctx } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!(node = ctx.id, "server node shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    handle_accept_result(accepted, &ctx);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(result: std::io::Result<(TcpStream, SocketAddr)>, ctx: &Arc<NodeContext>) {
    match result {
        Ok((stream, peer)) => spawn_client_handler(stream, peer, ctx),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_client_handler(stream: TcpStream, peer: SocketAddr, ctx: &Arc<NodeContext>) {
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, ctx).await {
            warn!(peer = %peer, error = ?err, "client connection closed with error");
        }
    });
}
