//! Meridian CLI
//!
//! Renders, plans and simulates a platform described by one YAML file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use meridian::{
    Backends, FailurePolicy, NodeOutcome, Platform, PlatformConfig, RecordingBackend, Scheduler,
};
use meridian_common::manifest::render_stream;

/// Meridian - dependency-ordered platform provisioning
#[derive(Parser, Debug)]
#[command(name = "meridian", version, about, long_about = None)]
struct Cli {
    /// Path to the platform configuration file
    #[arg(short, long, global = true, env = "MERIDIAN_CONFIG", default_value = "platform.yaml")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print every Kubernetes manifest in evaluation order
    Render,

    /// Print the evaluation groups
    Plan {
        /// Evaluate the plan against a recording backend and print the calls
        #[arg(long)]
        simulate: bool,

        /// Make this backend target fail during simulation (repeatable)
        #[arg(long = "fail-on", requires = "simulate")]
        fail_on: Vec<String>,

        /// Keep evaluating nodes that do not depend on a failure
        #[arg(long, requires = "simulate")]
        continue_independent: bool,
    },

    /// Print the JSON schema of the configuration file
    Schema,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(cli.log_json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with(
            (!cli.log_json)
                .then(|| fmt::layer().with_target(false).with_writer(std::io::stderr)),
        )
        .init();

    match cli.command {
        Commands::Schema => {
            println!("{}", PlatformConfig::json_schema()?);
            Ok(())
        }
        Commands::Render => {
            let platform = load(&cli.config)?;
            print!("{}", render_stream(&platform.render()?));
            Ok(())
        }
        Commands::Plan {
            simulate,
            fail_on,
            continue_independent,
        } => {
            let platform = load(&cli.config)?;
            for (index, group) in platform.plan()?.iter().enumerate() {
                println!("group {}:", index);
                for id in group {
                    println!("  {}", id);
                }
            }
            if simulate {
                let policy = if continue_independent {
                    FailurePolicy::ContinueIndependent
                } else {
                    FailurePolicy::FailFast
                };
                simulate_plan(&platform, fail_on, policy).await?;
            }
            Ok(())
        }
    }
}

fn load(path: &Path) -> anyhow::Result<Platform> {
    let config = PlatformConfig::from_file(path)?;
    let platform = Platform::build(&config)?;
    info!(config = %path.display(), nodes = platform.graph().len(), "Loaded platform");
    Ok(platform)
}

async fn simulate_plan(
    platform: &Platform,
    fail_on: Vec<String>,
    policy: FailurePolicy,
) -> anyhow::Result<()> {
    let backend = Arc::new(
        fail_on
            .into_iter()
            .fold(RecordingBackend::new(), RecordingBackend::failing_on),
    );
    let scheduler = Scheduler::new(Backends::single(backend.clone())).with_policy(policy);
    let report = scheduler.evaluate_with_report(platform.graph()).await?;

    println!("calls:");
    for call in backend.calls().await {
        println!("  {}", call);
    }

    let not_completed: Vec<_> = report
        .outcomes()
        .iter()
        .filter(|(_, outcome)| **outcome != NodeOutcome::Completed)
        .collect();
    if !not_completed.is_empty() {
        println!("incomplete:");
        for (id, outcome) in not_completed {
            match outcome {
                NodeOutcome::Failed(message) => println!("  {} failed: {}", id, message),
                NodeOutcome::Skipped { failed_ancestor } => {
                    println!("  {} skipped after {}", id, failed_ancestor)
                }
                NodeOutcome::NotAttempted => println!("  {} not attempted", id),
                NodeOutcome::Completed => {}
            }
        }
    }

    report.into_result()?;
    Ok(())
}
