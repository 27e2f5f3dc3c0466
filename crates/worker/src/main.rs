use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use taskhub_infra::jobs::{JobExecutor, PostgresJobLedger};
use taskhub_infra::transport::RedisStreamsTransport;
use taskhub_infra::workers::JobWorker;
use taskhub_infra::TaskhubConfig;
use taskhub_worker::welcome_email::{self, LogMailer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = TaskhubConfig::from_env().context("loading configuration")?;
    taskhub_observability::init_with(config.log_format);

    let ledger = PostgresJobLedger::connect(&config.database_url, config.db_max_connections)
        .await
        .context("connecting to the job ledger")?;
    ledger
        .ensure_schema()
        .await
        .context("creating the job_log table")?;
    match taskhub_worker::report_ledger_health(&ledger).await {
        Ok(0) => {}
        Ok(stale) => warn!(stale, "ledger has jobs stuck in progress"),
        Err(err) => warn!(error = %err, "could not read ledger stats"),
    }

    let transport = RedisStreamsTransport::connect(&config.redis_url, config.redis_streams_config())
        .await
        .context("connecting to redis")?;
    transport
        .ensure_consumer_group()
        .await
        .context("creating the consumer group")?;

    let mut executor = JobExecutor::new(ledger.clone());
    welcome_email::register(&mut executor, LogMailer);
    info!(
        tasks = ?executor.task_names(),
        stream = %config.stream_key,
        group = %config.consumer_group,
        consumer = %config.consumer_name,
        concurrency = config.worker_concurrency,
        "starting worker"
    );

    let handle = JobWorker::spawn(Arc::new(executor), transport, config.worker_config());

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!(stats = ?handle.stats(), "shutdown requested; draining in-flight jobs");

    handle.shutdown().await;
    ledger.close().await;
    info!("worker stopped");
    Ok(())
}
