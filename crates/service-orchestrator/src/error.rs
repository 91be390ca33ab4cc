//! # Orchestrator Errors
//!
//! Every failure the orchestrator can report is defined here, grouped by the
//! phase in which it can occur:
//!
//! - [`ConfigurationError`]: the descriptor set is unusable. Raised before any
//!   service is started.
//! - [`PropagationError`]: a dependency output was missing at render time.
//!   This means the readiness ordering was violated and is fatal to the run.
//! - [`RuntimeError`]: the process boundary (launch, probe, stop) failed. The
//!   supervisor retries these according to the service's restart policy.
//! - [`SupervisorError`]: a supervisor task could not be reached or refused a
//!   request.
//!
//! [`OrchestratorError`] wraps the ones that escape to the caller.

use crate::descriptor::{OutputRef, ServiceId};
use crate::state::ServiceState;
use std::time::Duration;

/// The descriptor set is malformed and cannot be orchestrated.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("service `{0}` is declared more than once")]
    DuplicateService(ServiceId),

    #[error("service `{0}` depends on itself")]
    SelfDependency(ServiceId),

    #[error("service `{service}` depends on unknown service `{dependency}`")]
    UnknownDependency {
        service: ServiceId,
        dependency: ServiceId,
    },

    #[error("cyclic dependency: {}", format_cycle(.0))]
    CyclicDependency(Vec<ServiceId>),

    #[error("service `{service}` is invalid: {reason}")]
    InvalidDescriptor { service: ServiceId, reason: String },

    #[error("service `{service}` config `{key}` has malformed reference `{value}` (expected `service.output`)")]
    InvalidReference {
        service: ServiceId,
        key: String,
        value: String,
    },

    #[error("service `{service}` config `{key}` references `{reference}` but does not depend on `{}`", .reference.service)]
    UndeclaredReference {
        service: ServiceId,
        key: String,
        reference: OutputRef,
    },

    #[error("service `{service}` config `{key}` references `{reference}` across a start-only edge; outputs exist only once the dependency is ready")]
    ReferenceBeforeReady {
        service: ServiceId,
        key: String,
        reference: OutputRef,
    },

    #[error("manifest error: {0}")]
    Manifest(String),
}

fn format_cycle(members: &[ServiceId]) -> String {
    members
        .iter()
        .map(ServiceId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// A dependency had not produced the output a dependent references.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PropagationError {
    #[error("dependency `{dependency}` has not produced output `{output}`")]
    MissingOutput {
        dependency: ServiceId,
        output: String,
    },
}

/// Failures at the process boundary.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to launch `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("launch did not complete within {0:?}")]
    LaunchTimeout(Duration),

    #[error("health probe failed: {0}")]
    ProbeFailed(String),

    #[error("health probe did not answer within {0:?}")]
    ProbeTimeout(Duration),

    #[error("no successful probe within the {0:?} start period")]
    StartPeriodElapsed(Duration),

    #[error("process exited: {0}")]
    Exited(String),

    #[error("service is not running")]
    NotRunning,

    #[error("failed to stop: {0}")]
    Stop(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors talking to a supervisor task.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SupervisorError {
    #[error("supervisor closed")]
    ActorClosed,

    #[error("supervisor dropped response channel")]
    ActorDropped,

    #[error("service `{service}` cannot go from {from} to {to}")]
    InvalidTransition {
        service: ServiceId,
        from: ServiceState,
        to: ServiceState,
    },
}

/// Errors returned from the orchestrator's public entry points.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Propagation(#[from] PropagationError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}
