//! Process-wide run counters.
//!
//! Workers and the completion client bump atomics; the controller reads
//! snapshots for periodic and final reporting.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::gateway::{AttemptOutcome, AttemptRecord, UsageSink};

/// Why a task produced no record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    Malformed,
    Validation,
    Store,
}

impl FailureKind {
    pub const ALL: [FailureKind; 4] = [
        FailureKind::Transient,
        FailureKind::Malformed,
        FailureKind::Validation,
        FailureKind::Store,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Malformed => "malformed",
            FailureKind::Validation => "validation",
            FailureKind::Store => "store",
        }
    }

    fn index(self) -> usize {
        match self {
            FailureKind::Transient => 0,
            FailureKind::Malformed => 1,
            FailureKind::Validation => 2,
            FailureKind::Store => 3,
        }
    }
}

#[derive(Debug)]
pub struct RunStats {
    started: Instant,
    tasks_attempted: AtomicU64,
    records_written: AtomicU64,
    failures: [AtomicU64; 4],
    requests_ok: AtomicU64,
    requests_failed: AtomicU64,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    /// Summed over every attempt that got a response or failed.
    request_millis: AtomicU64,
    per_language: Vec<(String, AtomicU64)>,
}

impl RunStats {
    pub fn new<S: AsRef<str>>(languages: &[S]) -> Self {
        Self {
            started: Instant::now(),
            tasks_attempted: AtomicU64::new(0),
            records_written: AtomicU64::new(0),
            failures: Default::default(),
            requests_ok: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            input_tokens: AtomicU64::new(0),
            output_tokens: AtomicU64::new(0),
            request_millis: AtomicU64::new(0),
            per_language: languages
                .iter()
                .map(|l| (l.as_ref().to_string(), AtomicU64::new(0)))
                .collect(),
        }
    }

    pub fn task_started(&self) {
        self.tasks_attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_written(&self, language: &str) {
        self.records_written.fetch_add(1, Ordering::Relaxed);
        if let Some((_, count)) = self.per_language.iter().find(|(code, _)| code == language) {
            count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn task_failed(&self, kind: FailureKind) {
        self.failures[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn records_written(&self) -> u64 {
        self.records_written.load(Ordering::Relaxed)
    }

    pub fn failures(&self, kind: FailureKind) -> u64 {
        self.failures[kind.index()].load(Ordering::Relaxed)
    }

    pub fn requests_failed(&self) -> u64 {
        self.requests_failed.load(Ordering::Relaxed)
    }

    pub fn requests_ok(&self) -> u64 {
        self.requests_ok.load(Ordering::Relaxed)
    }

    /// Prompt and completion tokens reported by the service.
    pub fn tokens(&self) -> (u64, u64) {
        (
            self.input_tokens.load(Ordering::Relaxed),
            self.output_tokens.load(Ordering::Relaxed),
        )
    }

    pub fn snapshot(&self) -> RunStatsSnapshot {
        let elapsed_secs = self.started.elapsed().as_secs_f64();
        let tasks_attempted = self.tasks_attempted.load(Ordering::Relaxed);
        let records_written = self.records_written();
        let failures = FailureKind::ALL
            .iter()
            .map(|k| (k.as_str().to_string(), self.failures(*k)))
            .collect();
        let per_language = self
            .per_language
            .iter()
            .map(|(code, n)| (code.clone(), n.load(Ordering::Relaxed)))
            .collect();
        let (input_tokens, output_tokens) = self.tokens();
        let requests = self.requests_ok() + self.requests_failed();
        let request_millis = self.request_millis.load(Ordering::Relaxed);

        RunStatsSnapshot {
            elapsed_secs,
            tasks_attempted,
            records_written,
            failures,
            requests_ok: self.requests_ok(),
            requests_failed: self.requests_failed(),
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            mean_request_ms: if requests == 0 {
                0.0
            } else {
                request_millis as f64 / requests as f64
            },
            per_language,
            success_rate: if tasks_attempted == 0 {
                0.0
            } else {
                records_written as f64 / tasks_attempted as f64
            },
            records_per_minute: if elapsed_secs > 0.0 {
                records_written as f64 * 60.0 / elapsed_secs
            } else {
                0.0
            },
        }
    }
}

/// Point-in-time copy of [`RunStats`].
#[derive(Debug, Clone, Serialize)]
pub struct RunStatsSnapshot {
    pub elapsed_secs: f64,
    pub tasks_attempted: u64,
    pub records_written: u64,
    pub failures: BTreeMap<String, u64>,
    pub requests_ok: u64,
    pub requests_failed: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub mean_request_ms: f64,
    pub per_language: BTreeMap<String, u64>,
    pub success_rate: f64,
    pub records_per_minute: f64,
}

impl RunStatsSnapshot {
    pub fn failed_tasks(&self) -> u64 {
        self.failures.values().sum()
    }
}

#[async_trait]
impl UsageSink for RunStats {
    async fn record(&self, record: AttemptRecord) {
        self.input_tokens
            .fetch_add(u64::from(record.input_tokens), Ordering::Relaxed);
        self.output_tokens
            .fetch_add(u64::from(record.output_tokens), Ordering::Relaxed);
        self.request_millis.fetch_add(
            u64::try_from(record.latency.as_millis()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );

        if let AttemptOutcome::Failed(reason) = record.outcome {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
            debug!(
                model = %record.model,
                attempt = record.attempt,
                reason,
                request_id = record.request_id.as_deref().unwrap_or("-"),
                latency_ms = record.latency.as_millis() as u64,
                "Request failed"
            );
        } else {
            self.requests_ok.fetch_add(1, Ordering::Relaxed);
        }
    }
}
