use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::cdc::consumer::{self, ConsumerManager};
use crate::cdc::CdcClient;
use crate::cli::flag_value;
use crate::core::broker::{BrokerGateway, DEFAULT_QUEUE, HIGH_PRIORITY_QUEUE};
use crate::core::config::Config;
use crate::core::store::TaskStore;
use crate::core::terminal::print_info;
use crate::core::worker::WorkerPool;
use crate::plugins::hot_loader::{HotLoader, DEBOUNCE_MS};
use crate::plugins::invoker::PluginInvoker;
use crate::plugins::PluginRegistry;
use crate::scheduler::BeatScheduler;

const DEFAULT_CONCURRENCY: usize = 4;

/// `taskbeat beat` - the singleton scheduling loop.
pub async fn beat() -> Result<()> {
    let config = Config::from_env();
    let store = Arc::new(TaskStore::open(&config.database_url)?);
    let gateway = Arc::new(BrokerGateway::open(&config.broker_url)?);
    let scheduler = BeatScheduler::new(
        store,
        gateway,
        Duration::from_secs(config.beat_interval_secs),
        config.timezone,
    );
    print_info("beat scheduler running, Ctrl+C to stop");
    scheduler.run().await
}

/// `taskbeat worker [--queues Q1,Q2] [--concurrency N]`.
pub async fn worker(args: &[String]) -> Result<()> {
    let config = Config::from_env();
    let queues: Vec<String> = flag_value(args, "--queues")
        .map(|q| q.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_else(|| vec![DEFAULT_QUEUE.to_string(), HIGH_PRIORITY_QUEUE.to_string()]);
    let concurrency = flag_value(args, "--concurrency")
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_CONCURRENCY);

    let gateway = Arc::new(BrokerGateway::open(&config.broker_url)?);
    let registry = Arc::new(PluginRegistry::new(
        config.plugins_dir.clone(),
        config.plugin_envs_dir.clone(),
    ));
    registry.scan().await?;

    let loader = Arc::new(HotLoader::new(Arc::clone(&registry)));
    loader.snapshot().await;
    let _watcher = loader.spawn_watcher(Duration::from_millis(DEBOUNCE_MS));

    let invoker = Arc::new(PluginInvoker::new(registry, loader));
    let pool = WorkerPool::new(gateway, invoker, queues, concurrency);
    print_info("worker pool running, Ctrl+C to stop");
    pool.run().await
}

/// `taskbeat cdc` - the binlog consumer service.
pub async fn cdc() -> Result<()> {
    let config = Config::from_env();
    let gateway = Arc::new(BrokerGateway::open(&config.broker_url)?);
    let manager = Arc::new(ConsumerManager::new());
    consumer::load_consumers(&config.consumers_file, &manager, &gateway).await?;

    let client = CdcClient::new(
        config.cdc_host.clone(),
        config.cdc_port,
        config.cdc_destination.clone(),
        config.cdc_batch_size,
    );
    print_info("cdc consumer running, Ctrl+C to stop");
    client.run(manager).await
}
