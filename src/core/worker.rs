use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::core::broker::{BrokerGateway, Submission, SubmissionState};
use crate::core::error::RuntimeError;
use crate::plugins::invoker::{ExecutionStatus, PluginInvoker};

/// How often an idle worker polls its queues.
const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// How often a busy worker checks for administrative revocation.
const REVOKE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A pool of plugin workers over the broker queue. Each claimed submission
/// runs on its own task, bounded by the pool's concurrency.
pub struct WorkerPool {
    gateway: Arc<BrokerGateway>,
    invoker: Arc<PluginInvoker>,
    queues: Vec<String>,
    concurrency: usize,
}

impl WorkerPool {
    pub fn new(
        gateway: Arc<BrokerGateway>,
        invoker: Arc<PluginInvoker>,
        queues: Vec<String>,
        concurrency: usize,
    ) -> Self {
        Self {
            gateway,
            invoker,
            queues,
            concurrency: concurrency.max(1),
        }
    }

    pub async fn run(&self) -> Result<()> {
        info!(
            "worker pool started (queues={}, concurrency={})",
            self.queues.join(","),
            self.concurrency
        );
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tick = tokio::time::interval(POLL_INTERVAL);
        let mut worker_seq: u64 = 0;

        loop {
            tick.tick().await;
            // Claim only while a slot is free, so queued work stays visible
            // to other worker processes.
            let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
                continue;
            };
            let claimed = match self.gateway.claim(&self.queues, "worker").await {
                Ok(claimed) => claimed,
                Err(e) => {
                    warn!("claim failed: {e}");
                    continue;
                }
            };
            let Some(submission) = claimed else {
                continue;
            };
            worker_seq += 1;
            let gateway = Arc::clone(&self.gateway);
            let invoker = Arc::clone(&self.invoker);
            tokio::spawn(async move {
                run_submission(gateway, invoker, submission, worker_seq).await;
                drop(permit);
            });
        }
    }
}

async fn run_submission(
    gateway: Arc<BrokerGateway>,
    invoker: Arc<PluginInvoker>,
    submission: Submission,
    seq: u64,
) {
    let id = submission.id.clone();
    let plugin = submission.plugin_name.clone();
    let time_limit = submission
        .time_limit
        .and_then(|s| u64::try_from(s).ok())
        .map(Duration::from_secs);
    info!(
        "[{}] worker#{} running {} (attempt {}/{})",
        id,
        seq,
        plugin,
        submission.attempts,
        submission.retries + 1
    );

    // Race the execution against administrative revocation; cancelling the
    // execution future kills the plugin child process.
    let outcome = tokio::select! {
        outcome = invoker.execute(&plugin, &submission.kwargs, time_limit) => Some(outcome),
        _ = watch_revoked(&gateway, &id) => None,
    };

    let Some(outcome) = outcome else {
        warn!("[{}] revoked while running, result discarded", id);
        return;
    };

    match outcome {
        Ok(report) if report.status == ExecutionStatus::Success => {
            let payload = serde_json::to_value(&report).unwrap_or_default();
            match gateway.finish_success(&id, &payload).await {
                Ok(true) => info!("[{}] completed successfully", id),
                Ok(false) => warn!("[{}] finished after revocation, result dropped", id),
                Err(e) => error!("[{}] failed to record success: {e}", id),
            }
        }
        Ok(report) => {
            let detail = report.error.unwrap_or_else(|| "unknown error".into());
            retry_or_fail(&gateway, &submission, &detail).await;
        }
        Err(e @ RuntimeError::PluginNotAvailable(_))
        | Err(e @ RuntimeError::ParameterInvalid(_))
        | Err(e @ RuntimeError::ManifestInvalid { .. }) => {
            // Not transient: retrying cannot help.
            if let Err(err) = gateway.finish_error(&id, &e.to_string()).await {
                error!("[{}] failed to record error: {err}", id);
            }
            warn!("[{}] rejected: {e}", id);
        }
        Err(e) => retry_or_fail(&gateway, &submission, &e.to_string()).await,
    }
}

async fn retry_or_fail(gateway: &BrokerGateway, submission: &Submission, detail: &str) {
    let id = &submission.id;
    if submission.attempts <= submission.retries {
        match gateway.requeue(id).await {
            Ok(true) => {
                warn!(
                    "[{}] attempt {} failed ({detail}), requeued",
                    id, submission.attempts
                );
                return;
            }
            Ok(false) => {}
            Err(e) => error!("[{}] requeue failed: {e}", id),
        }
    }
    match gateway.finish_error(id, detail).await {
        Ok(true) => warn!("[{}] failed permanently: {detail}", id),
        Ok(false) => warn!("[{}] failed after revocation", id),
        Err(e) => error!("[{}] failed to record error: {e}", id),
    }
}

/// Resolves when the submission shows up as revoked in the result store.
async fn watch_revoked(gateway: &BrokerGateway, id: &str) {
    let mut tick = tokio::time::interval(REVOKE_POLL_INTERVAL);
    loop {
        tick.tick().await;
        match gateway.status(id).await {
            Ok(Some(sub)) if sub.state == SubmissionState::Revoked => return,
            Ok(Some(_)) | Ok(None) => {}
            Err(e) => warn!("[{}] revocation check failed: {e}", id),
        }
    }
}
