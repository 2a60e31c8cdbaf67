use anyhow::Result;
use clap::Parser;
use tracing::info;

use vbucket_mock::bucket::{Bucket, BucketOptions};
use vbucket_mock::cli::Cli;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let bucket = Bucket::start(BucketOptions {
        name: cli.bucket,
        listen: cli.listen,
        num_nodes: cli.nodes,
        num_replicas: cli.replicas,
        num_vbuckets: cli.vbuckets,
    })
    .await?;

    info!("bucket configuration:\n{}", bucket.config_json()?);
    info!("press ctrl-c to shut down");

    tokio::signal::ctrl_c().await?;
    bucket.shutdown().await?;

    Ok(())
}
