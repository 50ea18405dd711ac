#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use dialog_harness::completion::{CompletionClient, CompletionConfig};
use dialog_harness::gateway::{NoopUsageSink, OpenAiCompatAdapter};
use dialog_harness::{analyze_file, DialogCleaner, GeneratorConfig, RunController, ThemeBuilder};

#[derive(Parser)]
#[command(
    name = "dialog-harness",
    version,
    about = "Synthetic dialogue generation harness"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate dialogs until the target, the time limit or Ctrl-C
    Generate {
        #[arg(long, default_value = "config.json")]
        config: PathBuf,
        /// Override generation.threads
        #[arg(long)]
        threads: Option<usize>,
        /// Override generation.target_count
        #[arg(long)]
        target_count: Option<u64>,
        /// Override generation.max_duration_secs
        #[arg(long)]
        max_duration_secs: Option<u64>,
        /// Override output.filename
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Validate a config file and print template statistics
    CheckConfig {
        #[arg(long, default_value = "config.json")]
        config: PathBuf,
    },
    /// Repair artifact lines of a dataset into a new file
    Clean {
        #[arg(long, default_value = "config.json")]
        config: PathBuf,
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value_t = dialog_harness::cleaner::DEFAULT_BATCH_SIZE)]
        batch_size: usize,
    },
    /// Count artifact lines in a dataset (no network)
    Analyze {
        #[arg(long)]
        input: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Generate {
            config,
            threads,
            target_count,
            max_duration_secs,
            output,
        } => {
            let mut config = GeneratorConfig::load(&config)?;
            if let Some(threads) = threads {
                config.generation.threads = threads;
            }
            if let Some(target) = target_count {
                config.generation.target_count = Some(target);
            }
            if let Some(secs) = max_duration_secs {
                config.generation.max_duration_secs = Some(secs);
            }
            if let Some(output) = output {
                config.output.filename = output;
            }

            let controller = RunController::from_config(config)?;
            let shutdown = async {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    tracing::warn!(error = %err, "Ctrl-C handler unavailable");
                    std::future::pending::<()>().await;
                }
            };
            let report = controller.run(shutdown).await?;
            let summary = serde_json::json!({
                "reason": report.reason,
                "stats": report.stats,
                "rotations": report.store.rotations,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::CheckConfig { config } => {
            let config = GeneratorConfig::load(&config)?;
            let themes = ThemeBuilder::new(&config)?;
            println!("config ok");
            println!("templates: {}", themes.templates().len());
            for (name, bank) in themes.word_banks() {
                println!("  {{{name}}}: {} candidates", bank.len());
            }
            let codes: Vec<&str> = themes.languages().iter().map(|l| l.code.as_str()).collect();
            println!("languages: {}", codes.join(", "));
            println!("theme combinations: {}", themes.combination_count());
            if config.api_key().is_err() {
                println!("warning: no API key configured");
            }
        }
        Commands::Clean {
            config,
            input,
            out,
            batch_size,
        } => {
            let config = GeneratorConfig::load(&config)?;
            let adapter = OpenAiCompatAdapter::with_config(
                config.api_key()?,
                &config.api.base_url,
                config.timeout(),
            )?;
            let client = CompletionClient::new(
                Arc::new(adapter),
                Arc::new(NoopUsageSink),
                CompletionConfig::from_config(&config),
            );
            let cleaner = DialogCleaner::new(Arc::new(client), &config.generation.languages)
                .batch_size(batch_size);
            let report = cleaner.clean_file(&input, &out).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Analyze { input } => {
            let report = analyze_file(&input).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
