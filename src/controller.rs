//! Run orchestration: wire the components, wait for a stop condition, shut
//! down cleanly and report.

use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::completion::{CompletionClient, CompletionConfig};
use crate::config::{ConfigError, GeneratorConfig};
use crate::gateway::{ChatProvider, OpenAiCompatAdapter, ProviderError, UsageSink};
use crate::pool::{
    TargetCounter, WorkerContext, WorkerError, WorkerPool, WorkerReport, WorkerStates,
};
use crate::stats::{RunStats, RunStatsSnapshot};
use crate::store::{DialogStore, StoreConfig, StoreError, StoreSummary};
use crate::theme::ThemeBuilder;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("provider setup failed: {0}")]
    Provider(#[from] ProviderError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("worker task failed: {0}")]
    Join(String),
}

impl From<WorkerError> for RunError {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::Store(e) => RunError::Store(e),
            WorkerError::Config(e) => RunError::Config(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    TargetReached,
    DurationElapsed,
    Signal,
    WorkersExited,
    StoreFailed,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub reason: StopReason,
    pub stats: RunStatsSnapshot,
    pub store: StoreSummary,
    pub workers: Vec<WorkerReport>,
}

pub struct RunController {
    config: GeneratorConfig,
    provider: Arc<dyn ChatProvider>,
}

impl RunController {
    /// Build the HTTP provider from `config.api`.
    pub fn from_config(config: GeneratorConfig) -> Result<Self, RunError> {
        config.validate()?;
        let api_key = config.api_key()?;
        let adapter =
            OpenAiCompatAdapter::with_config(api_key, &config.api.base_url, config.timeout())?;
        Ok(Self {
            config,
            provider: Arc::new(adapter),
        })
    }

    /// Use an already constructed provider (stubs, alternative transports).
    pub fn with_provider(
        config: GeneratorConfig,
        provider: Arc<dyn ChatProvider>,
    ) -> Result<Self, RunError> {
        config.validate()?;
        Ok(Self { config, provider })
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    /// Run until the target is reached, the duration elapses, `shutdown`
    /// resolves, every worker has stopped, or the store fails.
    pub async fn run<F>(self, shutdown: F) -> Result<RunReport, RunError>
    where
        F: Future<Output = ()>,
    {
        let config = self.config;
        let generation = &config.generation;

        let stats = Arc::new(RunStats::new(&config.language_codes()));
        let themes = Arc::new(ThemeBuilder::new(&config)?);
        let usage: Arc<dyn UsageSink> = stats.clone();
        let client = Arc::new(CompletionClient::new(
            self.provider,
            usage,
            CompletionConfig::from_config(&config),
        ));
        let (store, store_worker) = DialogStore::open(StoreConfig::from_output(&config.output))?;

        let target = Arc::new(TargetCounter::new(generation.target_count));
        let states = Arc::new(WorkerStates::new(generation.threads));
        let ctx = WorkerContext {
            themes,
            client,
            store,
            stats: stats.clone(),
            target: target.clone(),
            states: states.clone(),
            cancel: Arc::new(AtomicBool::new(false)),
            max_consecutive_errors: generation.max_consecutive_errors,
            task_delay: Duration::from_millis(generation.request_delay_ms),
        };

        info!(
            threads = generation.threads,
            target = ?generation.target_count,
            max_duration_secs = ?generation.max_duration_secs,
            model = %config.api.model,
            output = %config.output.filename.display(),
            "Starting generation run"
        );

        // The context (and its store handle) moves into the workers, so the
        // writer thread stops once the last worker is gone.
        let mut pool = WorkerPool::spawn(ctx, generation.threads);

        let deadline = generation
            .max_duration_secs
            .map(|secs| Instant::now() + Duration::from_secs(secs));
        let period = Duration::from_secs(generation.stats_interval_secs);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::pin!(shutdown);
        let mut reason: Option<StopReason> = None;
        let mut reports = Vec::with_capacity(generation.threads);
        let mut fatal: Option<RunError> = None;

        loop {
            tokio::select! {
                joined = pool.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok(report))) => reports.push(report),
                    Some(Ok(Err(err))) => {
                        error!(error = %err, "Worker failed; stopping run");
                        pool.cancel();
                        if matches!(err, WorkerError::Store(_)) {
                            reason = Some(StopReason::StoreFailed);
                        }
                        fatal.get_or_insert(err.into());
                    }
                    Some(Err(err)) => {
                        error!(error = %err, "Worker task aborted; stopping run");
                        pool.cancel();
                        fatal.get_or_insert(RunError::Join(err.to_string()));
                    }
                },
                _ = &mut shutdown, if reason.is_none() => {
                    info!(active_workers = pool.active_workers(), "Stop requested; finishing in-flight tasks");
                    reason = Some(StopReason::Signal);
                    pool.cancel();
                }
                _ = wait_until(deadline), if reason.is_none() => {
                    info!("Run duration elapsed; finishing in-flight tasks");
                    reason = Some(StopReason::DurationElapsed);
                    pool.cancel();
                }
                _ = ticker.tick() => {
                    log_progress(&stats.snapshot(), &pool, &states);
                }
            }
        }

        let store_result = tokio::task::spawn_blocking(move || store_worker.join())
            .await
            .map_err(|e| RunError::Join(e.to_string()))?;

        let snapshot = stats.snapshot();
        let reason = reason.unwrap_or(if target.is_reached() {
            StopReason::TargetReached
        } else {
            StopReason::WorkersExited
        });

        info!(
            reason = ?reason,
            records = snapshot.records_written,
            tasks = snapshot.tasks_attempted,
            failed_tasks = snapshot.failed_tasks(),
            failed_requests = snapshot.requests_failed,
            total_tokens = snapshot.total_tokens,
            per_language = ?snapshot.per_language,
            elapsed_secs = snapshot.elapsed_secs,
            "Run finished"
        );

        if let Some(err) = fatal {
            return Err(err);
        }
        let store = match store_result {
            Ok(summary) => summary,
            Err(err) => {
                error!(error = %err, "Store failed to close cleanly");
                return Err(err.into());
            }
        };
        if store.failed_appends > 0 {
            warn!(failed_appends = store.failed_appends, "Some appends failed");
        }

        Ok(RunReport {
            reason,
            stats: snapshot,
            store,
            workers: reports,
        })
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn log_progress(snapshot: &RunStatsSnapshot, pool: &WorkerPool, states: &WorkerStates) {
    info!(
        records = snapshot.records_written,
        tasks = snapshot.tasks_attempted,
        failed_tasks = snapshot.failed_tasks(),
        failed_requests = snapshot.requests_failed,
        tokens = snapshot.total_tokens,
        records_per_minute = format!("{:.1}", snapshot.records_per_minute),
        active_workers = pool.active_workers(),
        states = ?states.counts(),
        "Progress"
    );
}
