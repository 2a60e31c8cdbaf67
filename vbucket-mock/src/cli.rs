use std::net::SocketAddr;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Socket address of the first node; further nodes take consecutive
    /// ports. Use port 0 for ephemeral ports.
    #[arg(long, default_value = "127.0.0.1:11210")]
    pub listen: SocketAddr,

    /// Number of server nodes to emulate.
    #[arg(long, default_value_t = 1)]
    pub nodes: usize,

    /// Replica copies advertised per vbucket. Must be smaller than the
    /// node count.
    #[arg(long, default_value_t = 0)]
    pub replicas: usize,

    /// Number of vbuckets the keyspace is partitioned into.
    #[arg(long, default_value_t = 1024)]
    pub vbuckets: u16,

    /// Bucket name reported in the cluster configuration.
    #[arg(long, default_value = "default")]
    pub bucket: String,
}
