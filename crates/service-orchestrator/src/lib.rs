//! # Service Orchestrator
//!
//! This crate starts, supervises and stops a set of interdependent services,
//! such as a vector database together with the metadata store and object
//! store it needs. Each service is described by a [`ServiceDescriptor`];
//! the orchestrator works out the start order from the declared
//! dependencies, feeds each service the runtime outputs of the services it
//! depends on, keeps every service healthy with probes and bounded restarts,
//! and tears everything down in reverse order.
//!
//! ## Architecture Overview
//!
//! The crate is built on the **Actor Model**: every service is owned by one
//! supervisor task, and the controller talks to supervisors only through
//! messages.
//!
//! 1. **Planning** ([`graph`]): descriptors are validated and resolved into an
//!    [`ExecutionPlan`], a list of stages where every stage depends only on
//!    earlier ones. Cycles are reported with their full path.
//! 2. **Supervision** ([`supervisor`]): one [`ServiceSupervisor`] per service
//!    owns its state machine (`Pending -> Starting -> Probing -> Ready`),
//!    probes, retry budget and backoff. It is the only writer of its state.
//! 3. **Control** ([`controller`]): the [`Orchestrator`] drives stages, renders
//!    configuration with [`propagate`], reacts to failures according to the
//!    [`FailurePolicy`], and reports a [`RunResult`].
//! 4. **Runtime boundary** ([`runtime`]): launching, probing and stopping are
//!    delegated to a [`ServiceRuntime`]. [`ProcessRuntime`] runs local
//!    processes; [`mock::MockRuntime`] is a scripted in-memory runtime for
//!    tests.
//!
//! ## Example
//!
//! ```rust
//! use service_orchestrator::mock::MockRuntime;
//! use service_orchestrator::{Orchestrator, RunResult, ServiceDescriptor};
//!
//! #[tokio::main]
//! async fn main() {
//!     let runtime = MockRuntime::new();
//!     runtime.expect_service("etcd").output("endpoint", "127.0.0.1:2379");
//!
//!     let services = vec![
//!         ServiceDescriptor::builder("etcd").command("etcd").build(),
//!         ServiceDescriptor::builder("minio").command("minio").build(),
//!         ServiceDescriptor::builder("milvus")
//!             .command("milvus")
//!             .depends_on("etcd")
//!             .depends_on("minio")
//!             .reference("ETCD_ENDPOINTS", "etcd", "endpoint")
//!             .build(),
//!     ];
//!
//!     let orchestrator = Orchestrator::new(runtime.clone());
//!     let deployment = orchestrator.start(services).await.unwrap();
//!     assert_eq!(deployment.plan().stages().len(), 2);
//!     assert_eq!(runtime.starts().last().map(|s| s.as_str()), Some("milvus"));
//!
//!     assert_eq!(deployment.shutdown().await, RunResult::Success);
//! }
//! ```
//!
//! ## Concurrency Model
//!
//! - Each supervisor runs in its own Tokio task and processes its requests
//!   sequentially, so no service state is ever shared behind a lock.
//! - State is published through `watch` channels ([`StatusHandle`]) and an
//!   event stream the controller consumes; the snapshot is always written
//!   before the event is sent.
//! - Members of a stage start concurrently; stages never overlap.
//!
//! ## Testing
//!
//! [`mock::MockRuntime`] records every launch and stop and lets tests script
//! launch failures, probe results and outputs. Combined with
//! `#[tokio::test(start_paused = true)]` it makes backoff and probe timing
//! deterministic. See the [`mock`] module.

pub mod backoff;
pub mod client;
pub mod controller;
pub mod descriptor;
pub mod error;
pub mod graph;
pub mod manifest;
pub mod message;
pub mod mock;
pub mod process;
pub mod propagate;
pub mod runtime;
pub mod state;
pub mod supervisor;
pub mod tracing;

// Re-export core types for convenience
pub use client::SupervisorClient;
pub use controller::{
    Deployment, FailurePolicy, Orchestrator, OrchestratorSettings, RunResult, ServiceFailure,
    StartupOutcome, HISTORY_LIMIT,
};
pub use descriptor::{
    ConfigValue, Dependency, DependencyCondition, HealthCheck, OutputRef, Probe, RestartPolicy,
    ServiceDescriptor, ServiceId,
};
pub use error::{
    ConfigurationError, OrchestratorError, PropagationError, RuntimeError, SupervisorError,
};
pub use graph::{resolve, ExecutionPlan, Stage};
pub use manifest::Manifest;
pub use process::ProcessRuntime;
pub use propagate::RenderedConfig;
pub use runtime::ServiceRuntime;
pub use state::{FailureKind, RunPhase, ServiceEvent, ServiceState, StatusHandle, StatusReport};
pub use supervisor::ServiceSupervisor;
