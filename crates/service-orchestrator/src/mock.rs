//! # Mock Runtime & Testing Guide
//!
//! [`MockRuntime`] implements [`ServiceRuntime`] entirely in memory. Each
//! service gets a script (how many launches fail, which probes pass, what
//! outputs it exposes) and every call is recorded, so orchestration logic can
//! be tested deterministically without spawning a single process.
//!
//! ## When to use the mock vs real processes
//!
//! | Feature | MockRuntime | ProcessRuntime |
//! |---------|-------------|----------------|
//! | **Speed** | Instant, works with paused time | Real process startup |
//! | **Determinism** | Scripted probe results | Subject to the OS |
//! | **Failure injection** | `fail_starts`, `probe_results` | Hard |
//! | **Use case** | Controller and supervisor logic | End-to-end runs |
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
//!         ServiceDescriptor::builder("milvus")
//!             .command("milvus")
//!             .depends_on("etcd")
//!             .reference("ETCD_ENDPOINTS", "etcd", "endpoint")
//!             .build(),
//!     ];
//!
//!     let deployment = Orchestrator::new(runtime.clone()).start(services).await.unwrap();
//!     assert_eq!(deployment.shutdown().await, RunResult::Success);
//!
//!     let config = runtime.config_for("milvus").unwrap();
//!     assert_eq!(config.get("ETCD_ENDPOINTS"), Some("127.0.0.1:2379"));
//!     runtime.verify();
//! }
//! ```
//!
//! Supervisor tests that exercise probe intervals and backoff should run
//! with `#[tokio::test(start_paused = true)]` so timers complete instantly.

use crate::descriptor::{ServiceDescriptor, ServiceId};
use crate::error::RuntimeError;
use crate::propagate::RenderedConfig;
use crate::runtime::ServiceRuntime;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// A recorded call into the runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Start {
        service: ServiceId,
        config: RenderedConfig,
    },
    Stop {
        service: ServiceId,
    },
}

/// Scripted behaviour of one service.
#[derive(Debug, Clone, Default)]
struct Script {
    fail_starts: u32,
    probe_results: VecDeque<bool>,
    always_unhealthy: bool,
    outputs: BTreeMap<String, String>,
    start_delay: Duration,
    probe_delay: Duration,
}

#[derive(Debug, Default)]
struct MockState {
    scripts: HashMap<ServiceId, Script>,
    calls: Vec<MockCall>,
    starts: HashMap<ServiceId, u32>,
    probes: HashMap<ServiceId, u32>,
}

/// Instance handed back by [`MockRuntime::start`](ServiceRuntime::start).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockInstance {
    pub service: ServiceId,
    pub generation: u32,
}

/// In-memory runtime with per-service scripts. Clones share state.
#[derive(Clone, Default)]
pub struct MockRuntime {
    state: Arc<Mutex<MockState>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts `service`. Unscripted services launch, pass every probe and
    /// expose no outputs.
    pub fn expect_service(&self, service: impl Into<ServiceId>) -> ServiceExpectation {
        let service = service.into();
        self.lock().scripts.entry(service.clone()).or_default();
        ServiceExpectation {
            state: Arc::clone(&self.state),
            service,
        }
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    /// Services in the order they were launched, one entry per attempt.
    pub fn starts(&self) -> Vec<ServiceId> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                MockCall::Start { service, .. } => Some(service.clone()),
                MockCall::Stop { .. } => None,
            })
            .collect()
    }

    pub fn start_count(&self, service: &str) -> u32 {
        self.lock().starts.get(service).copied().unwrap_or(0)
    }

    pub fn probe_count(&self, service: &str) -> u32 {
        self.lock().probes.get(service).copied().unwrap_or(0)
    }

    /// Services in the order their instances were stopped.
    pub fn stop_order(&self) -> Vec<ServiceId> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                MockCall::Stop { service } => Some(service.clone()),
                MockCall::Start { .. } => None,
            })
            .collect()
    }

    /// Configuration passed to the most recent launch of `service`.
    pub fn config_for(&self, service: &str) -> Option<RenderedConfig> {
        self.lock().calls.iter().rev().find_map(|c| match c {
            MockCall::Start { service: s, config } if s.as_str() == service => {
                Some(config.clone())
            }
            _ => None,
        })
    }

    /// Panics if a scripted service was never launched.
    pub fn verify(&self) {
        let state = self.lock();
        let mut missing: Vec<&str> = state
            .scripts
            .keys()
            .filter(|id| !state.starts.contains_key(*id))
            .map(ServiceId::as_str)
            .collect();
        if !missing.is_empty() {
            missing.sort_unstable();
            panic!("Scripted services never started: {}", missing.join(", "));
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fluent script for one service. Every call takes effect immediately.
pub struct ServiceExpectation {
    state: Arc<Mutex<MockState>>,
    service: ServiceId,
}

impl ServiceExpectation {
    fn edit(self, f: impl FnOnce(&mut Script)) -> Self {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            f(state.scripts.entry(self.service.clone()).or_default());
        }
        self
    }

    /// The first `n` launches fail.
    pub fn fail_starts(self, n: u32) -> Self {
        self.edit(|s| s.fail_starts = n)
    }

    /// Results for successive probes; once exhausted, probes pass.
    pub fn probe_results(self, results: impl IntoIterator<Item = bool>) -> Self {
        self.edit(|s| s.probe_results = results.into_iter().collect())
    }

    /// Every probe fails.
    pub fn always_unhealthy(self) -> Self {
        self.edit(|s| s.always_unhealthy = true)
    }

    pub fn output(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let (key, value) = (key.into(), value.into());
        self.edit(|s| {
            s.outputs.insert(key, value);
        })
    }

    pub fn start_delay(self, delay: Duration) -> Self {
        self.edit(|s| s.start_delay = delay)
    }

    pub fn probe_delay(self, delay: Duration) -> Self {
        self.edit(|s| s.probe_delay = delay)
    }
}

#[async_trait]
impl ServiceRuntime for MockRuntime {
    type Instance = MockInstance;

    async fn start(
        &self,
        descriptor: &ServiceDescriptor,
        config: &RenderedConfig,
    ) -> Result<MockInstance, RuntimeError> {
        let (delay, outcome) = {
            let mut state = self.lock();
            state.calls.push(MockCall::Start {
                service: descriptor.id.clone(),
                config: config.clone(),
            });
            let starts = state.starts.entry(descriptor.id.clone()).or_insert(0);
            *starts += 1;
            let generation = *starts;
            let script = state.scripts.get(&descriptor.id).cloned().unwrap_or_default();
            let outcome = if generation <= script.fail_starts {
                Err(RuntimeError::Launch {
                    command: descriptor.start.command.clone(),
                    source: io::Error::new(io::ErrorKind::Other, "scripted launch failure"),
                })
            } else {
                Ok(MockInstance {
                    service: descriptor.id.clone(),
                    generation,
                })
            };
            (script.start_delay, outcome)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        outcome
    }

    async fn probe(
        &self,
        descriptor: &ServiceDescriptor,
        _instance: &mut MockInstance,
    ) -> Result<(), RuntimeError> {
        let (delay, healthy) = {
            let mut state = self.lock();
            *state.probes.entry(descriptor.id.clone()).or_insert(0) += 1;
            match state.scripts.get_mut(&descriptor.id) {
                Some(script) => {
                    let scripted = script.probe_results.pop_front();
                    let healthy = !script.always_unhealthy && scripted.unwrap_or(true);
                    (script.probe_delay, healthy)
                }
                None => (Duration::ZERO, true),
            }
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if healthy {
            Ok(())
        } else {
            Err(RuntimeError::ProbeFailed("scripted probe failure".into()))
        }
    }

    fn outputs(
        &self,
        descriptor: &ServiceDescriptor,
        _instance: &MockInstance,
    ) -> BTreeMap<String, String> {
        self.lock()
            .scripts
            .get(&descriptor.id)
            .map(|s| s.outputs.clone())
            .unwrap_or_default()
    }

    async fn stop(
        &self,
        descriptor: &ServiceDescriptor,
        _instance: MockInstance,
    ) -> Result<(), RuntimeError> {
        self.lock().calls.push(MockCall::Stop {
            service: descriptor.id.clone(),
        });
        Ok(())
    }
}
