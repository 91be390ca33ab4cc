//! # Logging Setup
//!
//! Every component logs through the `tracing` macros with structured
//! fields rather than formatted strings:
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `service` | Service id the event is about |
//! | `from`, `to` | State transition endpoints |
//! | `attempt` | Start attempt counter for the run |
//! | `stage` | One-based stage number during bring-up |
//! | `stream` | `stdout` or `stderr` for forwarded child output |
//!
//! Levels follow a simple rule: `info` for lifecycle milestones (transitions,
//! stages, shutdown), `warn` for failures the restart policy will absorb,
//! `error` for terminal failures, `debug` for individual probe results.
//!
//! ```bash
//! RUST_LOG=info milvus-stack up
//! RUST_LOG=service_orchestrator=debug milvus-stack up   # probe by probe
//! ```

/// Initialises the global subscriber, filtered by `RUST_LOG`.
///
/// ```rust,no_run
/// use service_orchestrator::tracing::setup_tracing;
///
/// setup_tracing();
/// tracing::info!("Application started");
/// ```
pub fn setup_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false) // the `service` field identifies the source
        .compact()
        .init();
}
