//! # milvus-stack
//!
//! Starts etcd, MinIO and Milvus standalone as local processes in dependency
//! order, keeps them healthy, and stops them in reverse order on Ctrl-C.
//!
//! ```bash
//! milvus-stack plan                       # print the stages
//! milvus-stack validate                   # check the manifest, start nothing
//! RUST_LOG=info milvus-stack up           # run until Ctrl-C
//! milvus-stack --manifest stack.yaml up --contain --status-interval 10
//! ```

use clap::{Parser, Subcommand};
use milvus_stack::lifecycle;
use service_orchestrator::tracing::setup_tracing;
use service_orchestrator::{FailurePolicy, ProcessRuntime};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "milvus-stack", version, about = "Run Milvus standalone with etcd and MinIO")]
struct Cli {
    /// YAML manifest to run instead of the built-in Milvus standalone stack
    #[arg(long, short, global = true)]
    manifest: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the resolved start stages
    Plan,
    /// Validate the manifest without starting anything
    Validate,
    /// Start the stack and supervise it until Ctrl-C
    Up {
        /// Keep independent services running when one fails
        #[arg(long)]
        contain: bool,

        /// Seconds between status reports (0 disables them)
        #[arg(long, default_value_t = 30)]
        status_interval: u64,
    },
}

async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "Cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Ctrl-C received");
}

#[tokio::main]
async fn main() -> Result<(), String> {
    setup_tracing();
    let cli = Cli::parse();

    let (mut settings, services) =
        lifecycle::load_stack(cli.manifest.as_deref()).map_err(|e| e.to_string())?;

    match cli.command {
        Command::Plan => {
            let plan = lifecycle::validate(&services).map_err(|e| e.to_string())?;
            println!("{plan}");
        }
        Command::Validate => {
            let plan = lifecycle::validate(&services).map_err(|e| e.to_string())?;
            println!(
                "ok: {} services in {} stages",
                plan.service_count(),
                plan.stages().len()
            );
        }
        Command::Up {
            contain,
            status_interval,
        } => {
            if contain {
                settings.failure_policy = FailurePolicy::Contain;
            }
            info!(services = services.len(), policy = ?settings.failure_policy, "Starting stack");
            let summary = lifecycle::up(
                ProcessRuntime::new(),
                settings,
                services,
                ctrl_c(),
                Duration::from_secs(status_interval),
            )
            .await
            .map_err(|e| e.to_string())?;

            print!("{}", summary.status);
            summary.into_result().map_err(|e| e.to_string())?;
        }
    }

    info!("Done");
    Ok(())
}
