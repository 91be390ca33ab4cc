//! # Stack Lifecycle
//!
//! Glue between the CLI and the orchestrator: load the stack definition,
//! validate it, and run it until a shutdown signal.
//!
//! ## Running the stack
//!
//! [`up`] prepares a deployment, keeps a [`StatusHandle`] for periodic
//! status logging, and hands the deployment to
//! [`Deployment::run_until`](service_orchestrator::Deployment::run_until):
//!
//! ```text
//! load_stack ──> validate ──> prepare ──> bring up stage by stage
//!                                              │
//!                          status log every N s│
//!                                              v
//!                      Ctrl-C ──> stop stages in reverse ──> RunSummary
//! ```
//!
//! The final [`StatusReport`] is taken after shutdown, so it shows every
//! service's last state, including `Pending` services held back by a failed
//! dependency.
//!
//! **Usage:**
//! ```bash
//! RUST_LOG=info milvus-stack up
//! RUST_LOG=info milvus-stack --manifest my-stack.yaml up --contain
//! ```

use crate::stack::BUILTIN_MANIFEST;
use service_orchestrator::{
    ConfigurationError, ExecutionPlan, Manifest, Orchestrator, OrchestratorError,
    OrchestratorSettings, RunResult, ServiceDescriptor, ServiceRuntime, StatusHandle,
    StatusReport,
};
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Errors surfaced by the CLI.
#[derive(Debug, thiserror::Error)]
pub enum StackError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error("stack did not run cleanly: {0}")]
    Unhealthy(RunResult),
}

/// How a run ended, plus the last state of every service.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub result: RunResult,
    pub status: StatusReport,
}

impl RunSummary {
    pub fn into_result(self) -> Result<StatusReport, StackError> {
        if self.result.is_success() {
            Ok(self.status)
        } else {
            Err(StackError::Unhealthy(self.result))
        }
    }
}

/// Reads `manifest`, or the built-in Milvus standalone manifest.
pub fn load_stack(
    manifest: Option<&Path>,
) -> Result<(OrchestratorSettings, Vec<ServiceDescriptor>), ConfigurationError> {
    let manifest = match manifest {
        Some(path) => {
            info!(path = %path.display(), "Loading manifest");
            Manifest::load(path)?
        }
        None => Manifest::from_yaml(BUILTIN_MANIFEST)?,
    };
    manifest.into_parts()
}

/// Validates every descriptor and resolves the start order.
pub fn validate(services: &[ServiceDescriptor]) -> Result<ExecutionPlan, ConfigurationError> {
    for service in services {
        service.validate()?;
    }
    service_orchestrator::resolve(services)
}

/// Runs the stack until `shutdown` resolves, logging a status report every
/// `status_interval`.
pub async fn up<R, F>(
    runtime: R,
    settings: OrchestratorSettings,
    services: Vec<ServiceDescriptor>,
    shutdown: F,
    status_interval: Duration,
) -> Result<RunSummary, StackError>
where
    R: ServiceRuntime,
    F: Future<Output = ()>,
{
    let orchestrator = Orchestrator::with_settings(runtime, settings);
    let deployment = orchestrator.prepare(services)?;
    info!(plan = %deployment.plan(), "Bringing stack up");

    let status = deployment.status_handle();
    let reporter = tokio::spawn(report_status(status.clone(), status_interval));

    let result = deployment.run_until(shutdown).await;
    reporter.abort();

    Ok(RunSummary {
        result,
        status: status.report(),
    })
}

async fn report_status(status: StatusHandle, every: Duration) {
    if every.is_zero() {
        return;
    }
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let report = status.report();
        info!(phase = %report.phase, "Stack status\n{report}");
    }
}
