#![forbid(unsafe_code)]

//! # dialog-harness
//!
//! Concurrent synthetic dialogue generation against OpenAI-compatible
//! chat completion APIs.
//!
//! A pool of workers samples themes from configured templates and word banks,
//! asks the model for a dialog in a sampled language, validates the JSON it
//! returns and appends accepted records to a rotating JSONL dataset. One
//! writer thread owns the dataset, so concurrent workers never interleave or
//! truncate lines, and each append is synced before it is acknowledged.
//!
//! Entry points: [`RunController`] for a generation run, [`DialogCleaner`] and
//! [`analyze_file`] for offline dataset cleanup.

pub mod cleaner;
pub mod completion;
pub mod config;
pub mod controller;
pub mod gateway;
pub mod pool;
pub mod prompts;
pub mod record;
pub mod stats;
pub mod store;
pub mod theme;

pub use cleaner::{analyze_file, ArtifactReport, CleanError, CleanReport, DialogCleaner};
pub use completion::{CompletionClient, CompletionConfig, GenerateError};
pub use config::{ConfigError, GeneratorConfig};
pub use controller::{RunController, RunError, RunReport, StopReason};
pub use gateway::{ChatProvider, OpenAiCompatAdapter, ProviderError, RetryPolicy, UsageSink};
pub use prompts::PromptInstance;
pub use record::{DialogRecord, RecordBounds, RecordError};
pub use stats::{FailureKind, RunStats, RunStatsSnapshot};
pub use store::{BackupChain, DialogStore, StoreConfig, StoreError, StoreWorker};
pub use theme::ThemeBuilder;
