//! # Orchestrator Controller
//!
//! Drives a descriptor set through its whole life:
//!
//! 1. **Prepare**: validate every descriptor, resolve the
//!    [`ExecutionPlan`] and spawn one supervisor per service. A configuration
//!    error is returned here, before any start request is sent.
//! 2. **Bring up**: walk the stages in order. For each member, render its
//!    configuration from the outputs its dependencies published, then send
//!    `Start`. The next stage begins once every member has reached the
//!    condition its dependents wait for (usually `Ready`) or failed for good.
//! 3. **Wait**: keep consuming state events until a shutdown signal arrives
//!    or nothing is left running. A service that fails for good here takes
//!    its dependents down with it.
//! 4. **Shutdown**: stop services stage by stage in reverse order, members
//!    of a stage concurrently, and report a [`RunResult`]. Services that
//!    never started end `Stopped` too, unless a failed dependency held them
//!    back.
//!
//! ## Failure policy
//!
//! With [`FailurePolicy::Abort`] (the default), a terminal failure during
//! bring-up stops stage progression and the run moves straight to shutdown.
//! With [`FailurePolicy::Contain`], only the failed service's transitive
//! dependents are held back and independent branches keep starting.
//!
//! Either way, a dependent never starts after one of its dependencies failed
//! for good; it stays `Pending` and its snapshot names the cause.

use crate::client::SupervisorClient;
use crate::descriptor::{DependencyCondition, ServiceDescriptor, ServiceId};
use crate::error::{ConfigurationError, OrchestratorError};
use crate::graph::{self, DependencyGraph, ExecutionPlan, Stage};
use crate::propagate::{self, DependencyOutputs};
use crate::runtime::ServiceRuntime;
use crate::state::{FailureKind, ServiceEvent, ServiceState, StatusHandle, StatusReport};
use crate::supervisor::ServiceSupervisor;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt::{self, Display};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time;
use tracing::{debug, error, info, instrument, warn};

/// What happens to the rest of the run when a service fails for good.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Stop starting new stages and shut everything down.
    #[default]
    Abort,
    /// Hold back only the failed service's dependents.
    Contain,
}

/// Transitions a [`Deployment`] keeps for [`Deployment::history`]. Older
/// ones are dropped first.
pub const HISTORY_LIMIT: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub failure_policy: FailurePolicy,
    /// Upper bound on each service's stop during shutdown.
    pub stop_timeout: Duration,
    /// Capacity of each supervisor's request channel.
    pub request_buffer: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::Abort,
            stop_timeout: Duration::from_secs(30),
            request_buffer: 32,
        }
    }
}

/// A service that failed for good, with the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceFailure {
    pub service: ServiceId,
    pub kind: FailureKind,
}

/// Final outcome of a run. Partial success is never reported as success.
#[derive(Debug, Clone, PartialEq)]
pub enum RunResult {
    Success,
    PartialFailure(Vec<ServiceFailure>),
    Aborted { reason: String },
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        matches!(self, RunResult::Success)
    }

    pub fn failed_services(&self) -> Vec<&ServiceId> {
        match self {
            RunResult::PartialFailure(failures) => failures.iter().map(|f| &f.service).collect(),
            _ => Vec::new(),
        }
    }
}

impl Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunResult::Success => f.write_str("success"),
            RunResult::PartialFailure(failures) => {
                let listed: Vec<String> = failures
                    .iter()
                    .map(|fail| format!("{} ({})", fail.service, fail.kind))
                    .collect();
                write!(f, "partial failure: {}", listed.join(", "))
            }
            RunResult::Aborted { reason } => write!(f, "aborted: {reason}"),
        }
    }
}

/// How bring-up ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupOutcome {
    /// Every stage was driven to completion. Some services may still have
    /// failed under [`FailurePolicy::Contain`].
    Completed,
    /// A service failed for good under [`FailurePolicy::Abort`].
    Failed,
    /// Bring-up could not continue (missing output, interrupted).
    Aborted,
}

/// Entry point: owns the runtime and settings shared by every run.
pub struct Orchestrator<R: ServiceRuntime> {
    runtime: Arc<R>,
    settings: OrchestratorSettings,
}

impl<R: ServiceRuntime> Orchestrator<R> {
    pub fn new(runtime: R) -> Self {
        Self::with_settings(runtime, OrchestratorSettings::default())
    }

    pub fn with_settings(runtime: R, settings: OrchestratorSettings) -> Self {
        Self {
            runtime: Arc::new(runtime),
            settings,
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Validates and resolves `descriptors` and spawns their supervisors.
    /// Nothing is started yet.
    ///
    /// Must be called from within a Tokio runtime.
    #[instrument(skip_all, fields(services = descriptors.len()))]
    pub fn prepare(
        &self,
        descriptors: Vec<ServiceDescriptor>,
    ) -> Result<Deployment, ConfigurationError> {
        for descriptor in &descriptors {
            descriptor.validate()?;
        }
        let plan = graph::resolve(&descriptors)?;
        let graph = DependencyGraph::new(&descriptors);
        info!(stages = plan.stages().len(), "Execution plan resolved");

        let (events_tx, events) = mpsc::unbounded_channel();
        let mut supervisors = HashMap::with_capacity(descriptors.len());
        let mut watched = Vec::with_capacity(descriptors.len());
        let mut handles = Vec::with_capacity(descriptors.len());
        let mut by_id = HashMap::with_capacity(descriptors.len());

        for id in plan.start_order() {
            let Some(descriptor) = descriptors.iter().find(|d| &d.id == id) else {
                continue;
            };
            let descriptor = Arc::new(descriptor.clone());
            let (supervisor, client, status) = ServiceSupervisor::new(
                Arc::clone(&descriptor),
                Arc::clone(&self.runtime),
                events_tx.clone(),
                self.settings.request_buffer,
            );
            handles.push(tokio::spawn(supervisor.run()));
            supervisors.insert(id.clone(), client);
            watched.push((id.clone(), status));
            by_id.insert(id.clone(), descriptor);
        }

        let states = plan
            .start_order()
            .map(|id| (id.clone(), ServiceState::Pending))
            .collect();

        Ok(Deployment {
            plan,
            graph,
            descriptors: by_id,
            supervisors,
            handles,
            status: StatusHandle::new(watched),
            events,
            history: VecDeque::new(),
            states,
            started: HashSet::new(),
            blocked: BTreeMap::new(),
            failures: Vec::new(),
            outcome: None,
            abort_reason: None,
            settings: self.settings.clone(),
        })
    }

    /// Prepares the deployment and brings every stage up. The returned
    /// deployment must be shut down by the caller.
    pub async fn start(
        &self,
        descriptors: Vec<ServiceDescriptor>,
    ) -> Result<Deployment, OrchestratorError> {
        let mut deployment = self.prepare(descriptors)?;
        deployment.bring_up().await;
        Ok(deployment)
    }

    /// Runs the whole lifecycle: bring-up, supervision until `shutdown`
    /// resolves (or nothing is left running), then reverse-order shutdown.
    pub async fn run<F>(
        &self,
        descriptors: Vec<ServiceDescriptor>,
        shutdown: F,
    ) -> Result<RunResult, OrchestratorError>
    where
        F: Future<Output = ()>,
    {
        let deployment = self.prepare(descriptors)?;
        Ok(deployment.run_until(shutdown).await)
    }
}

/// A prepared set of supervised services.
pub struct Deployment {
    plan: ExecutionPlan,
    graph: DependencyGraph,
    descriptors: HashMap<ServiceId, Arc<ServiceDescriptor>>,
    supervisors: HashMap<ServiceId, SupervisorClient>,
    handles: Vec<JoinHandle<()>>,
    status: StatusHandle,
    events: mpsc::UnboundedReceiver<ServiceEvent>,
    /// Most recent transitions, oldest first, at most [`HISTORY_LIMIT`].
    history: VecDeque<ServiceEvent>,
    /// Last state seen per service, driven by events.
    states: HashMap<ServiceId, ServiceState>,
    /// Services a `Start` was sent to.
    started: HashSet<ServiceId>,
    /// Services held back, with the failed service responsible.
    blocked: BTreeMap<ServiceId, ServiceId>,
    failures: Vec<ServiceFailure>,
    outcome: Option<StartupOutcome>,
    abort_reason: Option<String>,
    settings: OrchestratorSettings,
}

impl Deployment {
    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    pub fn status(&self) -> StatusReport {
        self.status.report()
    }

    pub fn status_handle(&self) -> StatusHandle {
        self.status.clone()
    }

    /// The last [`HISTORY_LIMIT`] state transitions, in arrival order.
    pub fn history(&self) -> impl ExactSizeIterator<Item = &ServiceEvent> + '_ {
        self.history.iter()
    }

    pub fn outcome(&self) -> Option<StartupOutcome> {
        self.outcome
    }

    /// The result the run would report if it ended now.
    pub fn result(&self) -> RunResult {
        if let Some(reason) = &self.abort_reason {
            return RunResult::Aborted {
                reason: reason.clone(),
            };
        }
        if self.failures.is_empty() {
            RunResult::Success
        } else {
            RunResult::PartialFailure(self.failures.clone())
        }
    }

    /// Starts every stage in order. Calling it again returns the first
    /// outcome without doing anything.
    #[instrument(skip_all)]
    pub async fn bring_up(&mut self) -> StartupOutcome {
        if let Some(outcome) = self.outcome {
            return outcome;
        }
        let outcome = self.drive_stages().await;
        match outcome {
            StartupOutcome::Completed => info!("All stages started"),
            StartupOutcome::Failed => warn!("Startup stopped after a service failure"),
            StartupOutcome::Aborted => error!("Startup aborted"),
        }
        self.outcome = Some(outcome);
        outcome
    }

    async fn drive_stages(&mut self) -> StartupOutcome {
        let stages: Vec<Stage> = self.plan.stages().to_vec();
        for (index, stage) in stages.iter().enumerate() {
            let stage_no = index + 1;
            info!(stage = stage_no, services = %stage, "Starting stage");

            let mut launched = Vec::with_capacity(stage.len());
            for id in stage.members() {
                if let Some(cause) = self.failed_dependency(id) {
                    self.block(id, cause).await;
                    continue;
                }
                if self.failures.iter().any(|f| &f.service == id) {
                    continue;
                }
                let Some(descriptor) = self.descriptors.get(id).cloned() else {
                    continue;
                };
                let config = match propagate::render(&descriptor, &self.dependency_outputs(id)) {
                    Ok(config) => config,
                    Err(err) => {
                        error!(service = %id, error = %err, "Configuration could not be rendered");
                        self.failures.push(ServiceFailure {
                            service: id.clone(),
                            kind: FailureKind::Propagation,
                        });
                        self.abort(format!("service `{id}`: {err}"));
                        return StartupOutcome::Aborted;
                    }
                };
                debug!(service = %id, keys = config.len(), "Configuration rendered");

                self.started.insert(id.clone());
                let Some(client) = self.supervisors.get(id).cloned() else {
                    continue;
                };
                match client.start(config).await {
                    Ok(()) => launched.push(id.clone()),
                    Err(err) => {
                        error!(service = %id, error = %err, "Start request failed");
                        if self.fail(id, FailureKind::Start) && !self.on_failure(id).await {
                            return StartupOutcome::Failed;
                        }
                    }
                }
            }

            while !launched.iter().all(|id| self.settled(id)) {
                let Some(event) = self.events.recv().await else {
                    self.abort("supervisor event stream closed");
                    return StartupOutcome::Aborted;
                };
                if let Some(failed) = self.record(event) {
                    if !self.on_failure(&failed).await {
                        return StartupOutcome::Failed;
                    }
                }
            }
            info!(stage = stage_no, "Stage settled");
        }
        StartupOutcome::Completed
    }

    /// Holds back the failure's dependents. Returns whether bring-up may
    /// continue.
    async fn on_failure(&mut self, failed: &ServiceId) -> bool {
        self.contain(failed).await;
        self.settings.failure_policy == FailurePolicy::Contain
    }

    /// Supervises the running services until `shutdown` resolves or
    /// nothing is running any more.
    pub async fn wait<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            if !self.anything_running() {
                info!("No services left running");
                return;
            }
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    return;
                }
                event = self.events.recv() => match event {
                    Some(event) => {
                        if let Some(failed) = self.record(event) {
                            self.contain(&failed).await;
                        }
                    }
                    None => return,
                },
            }
        }
    }

    /// Brings the deployment up, supervises it until `shutdown` resolves
    /// and shuts it down. A shutdown signal during bring-up aborts the run.
    pub async fn run_until<F>(mut self, shutdown: F) -> RunResult
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let outcome = tokio::select! {
            outcome = self.bring_up() => Some(outcome),
            _ = &mut shutdown => None,
        };
        match outcome {
            Some(StartupOutcome::Completed) => self.wait(shutdown).await,
            Some(_) => {}
            None => self.abort("shutdown requested before startup completed"),
        }
        self.shutdown().await
    }

    /// Stops everything in reverse stage order and reports the result.
    #[instrument(skip_all)]
    pub async fn shutdown(mut self) -> RunResult {
        info!("Shutting down");
        let stages: Vec<Stage> = self.plan.shutdown_order().cloned().collect();
        for stage in stages {
            let mut stops = JoinSet::new();
            for id in stage.members() {
                // Held-back services stay `Pending` so the report names the cause.
                if self.blocked.contains_key(id) {
                    continue;
                }
                let Some(client) = self.supervisors.get(id).cloned() else {
                    continue;
                };
                let timeout = self.settings.stop_timeout;
                stops.spawn(async move {
                    let id = client.id().clone();
                    let result = match time::timeout(timeout, client.stop()).await {
                        Ok(Ok(state)) => Ok(state),
                        Ok(Err(err)) => Err(err.to_string()),
                        Err(_) => Err(format!("stop did not finish within {timeout:?}")),
                    };
                    (id, result)
                });
            }
            while let Some(joined) = stops.join_next().await {
                match joined {
                    Ok((id, Ok(state))) => debug!(service = %id, %state, "Stopped"),
                    Ok((id, Err(err))) => warn!(service = %id, error = %err, "Stop failed"),
                    Err(err) => warn!(error = %err, "Stop task failed"),
                }
            }
        }

        // Dropping the clients closes every supervisor's channel.
        self.supervisors.clear();
        for handle in std::mem::take(&mut self.handles) {
            let abort = handle.abort_handle();
            if time::timeout(self.settings.stop_timeout, handle).await.is_err() {
                warn!("Supervisor did not exit in time, aborting");
                abort.abort();
            }
        }
        while let Ok(event) = self.events.try_recv() {
            self.record(event);
        }

        let result = self.result();
        info!(%result, "Shutdown complete");
        result
    }

    fn abort(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(%reason, "Run aborted");
        self.abort_reason.get_or_insert(reason);
    }

    /// Applies `event` to the local view. Returns the service if the event
    /// is a new terminal failure.
    fn record(&mut self, event: ServiceEvent) -> Option<ServiceId> {
        self.states.insert(event.service.clone(), event.to);
        let failed = if event.to == ServiceState::Failed && event.terminal {
            let kind = event.failure.unwrap_or(FailureKind::Probe);
            self.fail(&event.service, kind).then(|| event.service.clone())
        } else {
            None
        };
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(event);
        failed
    }

    /// Records a terminal failure once. Returns whether it was new.
    fn fail(&mut self, service: &ServiceId, kind: FailureKind) -> bool {
        if self.failures.iter().any(|f| &f.service == service) {
            return false;
        }
        error!(service = %service, %kind, "Service failed");
        self.failures.push(ServiceFailure {
            service: service.clone(),
            kind,
        });
        true
    }

    fn is_failed(&self, id: &ServiceId) -> bool {
        self.failures.iter().any(|f| &f.service == id)
    }

    /// Blocks pending dependents of `failed` and fails running ones.
    async fn contain(&mut self, failed: &ServiceId) {
        for dependent in self.graph.transitive_dependents(failed) {
            if self.is_failed(&dependent) || self.blocked.contains_key(&dependent) {
                continue;
            }
            if self.started.contains(&dependent) {
                let Some(client) = self.supervisors.get(&dependent).cloned() else {
                    continue;
                };
                match client.fail(failed.clone()).await {
                    Ok(state) => debug!(service = %dependent, %state, "Dependent failed"),
                    Err(err) => warn!(service = %dependent, error = %err, "Could not fail dependent"),
                }
            } else {
                self.block(&dependent, failed.clone()).await;
            }
        }
    }

    async fn block(&mut self, id: &ServiceId, cause: ServiceId) {
        if self.blocked.contains_key(id) {
            return;
        }
        info!(service = %id, blocked_by = %cause, "Holding back service");
        self.blocked.insert(id.clone(), cause.clone());
        if let Some(client) = self.supervisors.get(id).cloned() {
            if let Err(err) = client.block(cause).await {
                warn!(service = %id, error = %err, "Could not block service");
            }
        }
    }

    /// The failed (or blocking) service keeping `id` from starting.
    fn failed_dependency(&self, id: &ServiceId) -> Option<ServiceId> {
        self.graph.dependencies_of(id).find_map(|dep| {
            if self.is_failed(dep) {
                Some(dep.clone())
            } else {
                self.blocked.get(dep).cloned()
            }
        })
    }

    fn dependency_outputs(&self, id: &ServiceId) -> DependencyOutputs {
        self.graph
            .dependencies_of(id)
            .filter_map(|dep| {
                self.status
                    .outputs(dep.as_str())
                    .map(|outputs| (dep.clone(), outputs))
            })
            .collect()
    }

    /// Whether `id` no longer holds up its stage.
    fn settled(&self, id: &ServiceId) -> bool {
        if self.is_failed(id) {
            return true;
        }
        let state = self.states.get(id).copied().unwrap_or(ServiceState::Pending);
        match self.graph.required_condition(id) {
            DependencyCondition::Ready => state == ServiceState::Ready,
            DependencyCondition::Started => state.is_active(),
        }
    }

    fn anything_running(&self) -> bool {
        self.states.iter().any(|(id, state)| {
            state.is_active() || (*state == ServiceState::Failed && !self.is_failed(id))
        })
    }
}
