//! veilsplit CLI.
//!
//! `run` submits a query through the full pipeline, streaming step events to
//! stderr and printing the final answer (or a JSON report) to stdout.
//! `detect` and `plan` expose the first two pipeline stages for inspection
//! without touching any provider.

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use veilsplit::detection::{Detector, RegexDetector};
use veilsplit::planner::{self, Strategy};
use veilsplit::progress::StepEvent;
use veilsplit::{PipelineConfig, PrivacyLevel, PrivacyPipeline, Query};

#[derive(Parser)]
#[command(name = "veilsplit", version, about = "Split sensitive queries across LLM providers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a query through the full pipeline.
    Run {
        /// Query text.
        query: String,
        /// Force a fragmentation strategy (only honored when at least as
        /// protective as the planner's own choice).
        #[arg(long)]
        strategy: Option<Strategy>,
        /// Request extra protection even for benign-looking queries.
        #[arg(long)]
        high_privacy: bool,
        /// Print the full result as JSON instead of just the answer.
        #[arg(long)]
        json: bool,
    },
    /// Show the detection report for a query without calling any provider.
    Detect {
        query: String,
    },
    /// Show the fragmentation plan for a query without calling any provider.
    Plan {
        query: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("veilsplit=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Run {
            query,
            strategy,
            high_privacy,
            json,
        } => run(query, strategy, high_privacy, json).await,
        Command::Detect { query } => {
            let report = RegexDetector::new().detect(&query)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Plan { query } => {
            let report = RegexDetector::new().detect(&query)?;
            let plan = planner::plan(&Query::new(&query), &report);
            println!("{}", serde_json::to_string_pretty(&plan)?);
            Ok(())
        }
    }
}

async fn run(
    text: String,
    strategy: Option<Strategy>,
    high_privacy: bool,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let pipeline = Arc::new(PrivacyPipeline::from_config(PipelineConfig::from_env())?);

    let mut query = Query::new(text);
    if let Some(strategy) = strategy {
        query = query.strategy_hint(strategy);
    }
    if high_privacy {
        query = query.privacy_level(PrivacyLevel::High);
    }

    let request_id = query.id;
    let (_, mut events) = pipeline.submit(query);

    let mut failed: Option<String> = None;
    while let Some(event) = events.recv().await {
        match &event {
            StepEvent::StepProgress {
                step,
                status,
                message,
                ..
            } => {
                eprintln!("[{}] {:?}: {message}", step.as_str(), status);
            }
            StepEvent::Complete(_) => break,
            StepEvent::Error { message, .. } => {
                failed = Some(message.clone());
                break;
            }
        }
    }

    if let Some(message) = failed {
        return Err(message.into());
    }

    match pipeline.fetch(request_id).await {
        veilsplit::Fetched::Ready(result) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("{}", result.response);
                eprintln!(
                    "privacy score {:.2}, {} fragments across {} providers, \
                     cost ${:.6} (single-provider estimate ${:.6})",
                    result.privacy_score,
                    result.fragment_count,
                    result.providers_used.len(),
                    result.cost_comparison.fragmented_cost_nanodollars as f64 / 1e9,
                    result.cost_comparison.single_provider_cost_nanodollars as f64 / 1e9,
                );
            }
            Ok(())
        }
        veilsplit::Fetched::Failed(reason) => Err(reason.into()),
        other => Err(format!("request not ready: {other:?}").into()),
    }
}
