use anyhow::Result;
use clap::Parser;
use owo_colors::OwoColorize;
use std::sync::Arc;

mod aggregator;
mod cache;
mod cleanup;
mod composition;
mod compositionset;
mod config;
mod exec;
mod podgc;
mod podlifecycle;
mod rollout;
mod status_logger;
mod sync;
mod util;

use cache::Cache;
use config::OperatorConfig;
use sync::writebuffer::WriteBuffer;

#[tokio::main]
async fn main() -> Result<()> {
    eno_common::init();
    let config = Arc::new(OperatorConfig::parse());

    let client = kube::Client::try_default().await?;
    let cache = Arc::new(Cache::new());
    let write_buffer = Arc::new(WriteBuffer::new(client.clone(), config.slice_creation_qps));

    eno_common::signal_ready();

    let controllers = tokio::spawn(run_controllers(client, cache, write_buffer, config));

    tokio::select! {
        res = controllers => {
            res??;
        }
        _ = eno_common::shutdown::shutdown_signal() => {}
    }

    println!("{}", "eno-operator shut down".red());
    Ok(())
}

/// Runs every control loop to completion. Under normal operation none of
/// these futures resolve; `try_join!` surfaces the first one that does
/// (always a fatal setup error, since each loop retries reconciliation
/// failures internally) and drops the rest.
async fn run_controllers(
    client: kube::Client,
    cache: Arc<Cache>,
    write_buffer: Arc<WriteBuffer>,
    config: Arc<OperatorConfig>,
) -> Result<()> {
    tokio::try_join!(
        wrap(composition::run(client.clone())),
        wrap(aggregator::run(client.clone())),
        wrap(cleanup::run(client.clone())),
        wrap(sync::run(client.clone(), cache, write_buffer, config.clone())),
        wrap(podlifecycle::run(client.clone(), config.clone())),
        wrap(podgc::run(client.clone(), config.clone())),
        wrap(exec::run(client.clone())),
        wrap(rollout::run(client.clone())),
        wrap(compositionset::run(client.clone())),
        wrap(status_logger::run(client, config)),
    )?;
    Ok(())
}

async fn wrap(fut: impl std::future::Future<Output = Result<(), util::Error>>) -> Result<()> {
    fut.await.map_err(Into::into)
}
