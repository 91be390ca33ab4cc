//! # Lifecycle Supervisor
//!
//! One [`ServiceSupervisor`] task per service. It is the only writer of that
//! service's state and outputs, and it processes requests one at a time from
//! its channel, exactly like any other actor in this crate.
//!
//! ## State machine
//!
//! ```text
//!  Pending --Start--> Starting --launched--> Probing --healthy--> Ready
//!                        ^  |                   |                 |  ^
//!                        |  +------ error ------+                 v  |
//!                        |          v                          Degraded
//!                        +----- Failed <--- restart policy -------+
//! ```
//!
//! - A launch is bounded by `start_timeout`; a probe by the health check's
//!   `timeout`. A timeout counts as a failure.
//! - `Probing -> Ready` after `success_threshold` consecutive passes.
//!   `failure_threshold` consecutive failures, or running out of
//!   `start_period`, fail the attempt.
//! - Once ready, the service is probed every `interval`. One failure moves it
//!   to `Degraded`, a pass moves it back, and `failure_threshold` consecutive
//!   failures restart it. The service reads `Failed` (not terminal) while the
//!   restart backs off.
//! - Restarts wait for [`RestartPolicy::delay_for`]. Attempts are counted
//!   over the whole run; once the budget is spent the service is `Failed`
//!   for good.
//!
//! ## Interruption
//!
//! While a launch, probe or backoff is in flight the supervisor keeps
//! listening on its channel. `Stop` and `Fail` cancel the in-flight work and
//! release the instance. A closed channel does the same and ends the task.
//!
//! [`RestartPolicy::delay_for`]: crate::descriptor::RestartPolicy::delay_for

use crate::client::SupervisorClient;
use crate::descriptor::{ServiceDescriptor, ServiceId};
use crate::error::{RuntimeError, SupervisorError};
use crate::message::{Response, SupervisorRequest};
use crate::propagate::RenderedConfig;
use crate::runtime::ServiceRuntime;
use crate::state::{FailureKind, ServiceEvent, ServiceSnapshot, ServiceState};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

/// Result of an interruptible wait.
enum Step<T> {
    Done(T),
    Interrupted(Interrupt),
}

/// A request that cancels in-flight supervision.
enum Interrupt {
    Stop(Response<ServiceState>),
    Fail(ServiceId, Response<ServiceState>),
    Detached,
}

/// How a supervision loop ended.
enum Outcome {
    /// Back to waiting for requests.
    Idle,
    /// The request channel closed.
    Detached,
}

pub struct ServiceSupervisor<R: ServiceRuntime> {
    descriptor: Arc<ServiceDescriptor>,
    runtime: Arc<R>,
    receiver: mpsc::Receiver<SupervisorRequest>,
    status: watch::Sender<ServiceSnapshot>,
    events: mpsc::UnboundedSender<ServiceEvent>,
    state: ServiceState,
    attempts: u32,
    blocked_by: Option<ServiceId>,
}

impl<R: ServiceRuntime> ServiceSupervisor<R> {
    /// Creates the supervisor, the client used to drive it and a receiver for
    /// its published snapshots. The supervisor does nothing until
    /// [`run`](Self::run) is spawned.
    pub fn new(
        descriptor: Arc<ServiceDescriptor>,
        runtime: Arc<R>,
        events: mpsc::UnboundedSender<ServiceEvent>,
        buffer_size: usize,
    ) -> (Self, SupervisorClient, watch::Receiver<ServiceSnapshot>) {
        let (sender, receiver) = mpsc::channel(buffer_size.max(1));
        let (status, status_rx) = watch::channel(ServiceSnapshot::default());
        let client = SupervisorClient::new(descriptor.id.clone(), sender);
        let supervisor = Self {
            descriptor,
            runtime,
            receiver,
            status,
            events,
            state: ServiceState::Pending,
            attempts: 0,
            blocked_by: None,
        };
        (supervisor, client, status_rx)
    }

    /// Processes requests until every client is dropped.
    pub async fn run(mut self) {
        let id = self.descriptor.id.clone();
        info!(service = %id, "Supervisor started");

        while let Some(msg) = self.receiver.recv().await {
            match msg {
                SupervisorRequest::Start { config, respond_to } => {
                    if self.state != ServiceState::Pending || self.blocked_by.is_some() {
                        warn!(service = %id, state = %self.state, "Start rejected");
                        let _ = respond_to.send(Err(self.invalid(ServiceState::Starting)));
                        continue;
                    }
                    let _ = respond_to.send(Ok(()));
                    if let Outcome::Detached = self.supervise(config).await {
                        break;
                    }
                }
                SupervisorRequest::Stop { respond_to } => {
                    if !matches!(self.state, ServiceState::Failed | ServiceState::Stopped) {
                        self.transition(ServiceState::Stopped);
                    }
                    let _ = respond_to.send(Ok(self.state));
                }
                SupervisorRequest::Block { cause, respond_to } => {
                    self.block(cause);
                    let _ = respond_to.send(Ok(()));
                }
                SupervisorRequest::Fail { cause, respond_to } => {
                    // Nothing is running, so a failed dependency only blocks.
                    if self.state == ServiceState::Pending {
                        self.block(cause);
                    }
                    let _ = respond_to.send(Ok(self.state));
                }
            }
        }

        info!(service = %id, state = %self.state, attempts = self.attempts, "Supervisor shut down");
    }

    async fn supervise(&mut self, config: RenderedConfig) -> Outcome {
        let runtime = Arc::clone(&self.runtime);
        let descriptor = Arc::clone(&self.descriptor);

        loop {
            self.attempts += 1;
            self.publish(ServiceState::Starting, |s| s.failure = None);

            let start_timeout = descriptor.start.start_timeout;
            let launch = time::timeout(start_timeout, runtime.start(&descriptor, &config));
            let launched = match self.interruptible(launch).await {
                Step::Done(Ok(result)) => result,
                Step::Done(Err(_)) => Err(RuntimeError::LaunchTimeout(start_timeout)),
                Step::Interrupted(interrupt) => return self.interrupted(interrupt, None).await,
            };
            let mut instance = match launched {
                Ok(instance) => instance,
                Err(err) => match self.recover(FailureKind::Start, err).await {
                    Some(outcome) => return outcome,
                    None => continue,
                },
            };

            self.transition(ServiceState::Probing);
            match self.await_readiness(&runtime, &descriptor, &mut instance).await {
                Step::Done(Ok(())) => {}
                Step::Done(Err(err)) => {
                    self.release(instance).await;
                    match self.recover(FailureKind::Probe, err).await {
                        Some(outcome) => return outcome,
                        None => continue,
                    }
                }
                Step::Interrupted(interrupt) => {
                    return self.interrupted(interrupt, Some(instance)).await
                }
            }

            let mut outputs = runtime.outputs(&descriptor, &instance);
            outputs.extend(descriptor.outputs.clone());
            self.publish(ServiceState::Ready, |s| {
                s.outputs = Some(Arc::new(outputs.into()));
                s.last_error = None;
            });

            match self.monitor_liveness(&runtime, &descriptor, &mut instance).await {
                Step::Done(err) => {
                    self.release(instance).await;
                    match self.recover(FailureKind::Probe, err).await {
                        Some(outcome) => return outcome,
                        None => continue,
                    }
                }
                Step::Interrupted(interrupt) => {
                    return self.interrupted(interrupt, Some(instance)).await
                }
            }
        }
    }

    async fn await_readiness(
        &mut self,
        runtime: &R,
        descriptor: &ServiceDescriptor,
        instance: &mut R::Instance,
    ) -> Step<Result<(), RuntimeError>> {
        let health = &descriptor.health_check;
        let deadline = Instant::now() + health.start_period;
        let mut successes = 0;
        let mut failures = 0;

        loop {
            let probe = time::timeout(health.timeout, runtime.probe(descriptor, instance));
            let result = match self.interruptible(probe).await {
                Step::Done(Ok(result)) => result,
                Step::Done(Err(_)) => Err(RuntimeError::ProbeTimeout(health.timeout)),
                Step::Interrupted(interrupt) => return Step::Interrupted(interrupt),
            };

            match result {
                Ok(()) => {
                    successes += 1;
                    failures = 0;
                    debug!(service = %descriptor.id, successes, "Readiness probe passed");
                    if successes >= health.success_threshold {
                        return Step::Done(Ok(()));
                    }
                }
                Err(err) => {
                    failures += 1;
                    successes = 0;
                    debug!(service = %descriptor.id, failures, error = %err, "Readiness probe failed");
                    self.status.send_modify(|s| s.last_error = Some(err.to_string()));
                    if failures >= health.failure_threshold {
                        return Step::Done(Err(err));
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Step::Done(Err(RuntimeError::StartPeriodElapsed(health.start_period)));
            }
            let pause = health.interval.min(deadline - now);
            if let Step::Interrupted(interrupt) = self.interruptible(time::sleep(pause)).await {
                return Step::Interrupted(interrupt);
            }
        }
    }

    /// Probes a ready service until it needs restarting.
    async fn monitor_liveness(
        &mut self,
        runtime: &R,
        descriptor: &ServiceDescriptor,
        instance: &mut R::Instance,
    ) -> Step<RuntimeError> {
        let health = &descriptor.health_check;
        let mut failures = 0;

        loop {
            if let Step::Interrupted(interrupt) =
                self.interruptible(time::sleep(health.interval)).await
            {
                return Step::Interrupted(interrupt);
            }

            let probe = time::timeout(health.timeout, runtime.probe(descriptor, instance));
            let result = match self.interruptible(probe).await {
                Step::Done(Ok(result)) => result,
                Step::Done(Err(_)) => Err(RuntimeError::ProbeTimeout(health.timeout)),
                Step::Interrupted(interrupt) => return Step::Interrupted(interrupt),
            };

            match result {
                Ok(()) => {
                    failures = 0;
                    if self.state == ServiceState::Degraded {
                        self.publish(ServiceState::Ready, |s| s.last_error = None);
                    }
                }
                Err(err) => {
                    failures += 1;
                    warn!(service = %descriptor.id, failures, error = %err, "Liveness probe failed");
                    let message = err.to_string();
                    if self.state == ServiceState::Ready {
                        self.publish(ServiceState::Degraded, |s| s.last_error = Some(message));
                    } else {
                        self.status.send_modify(|s| s.last_error = Some(message));
                    }
                    if failures >= health.failure_threshold {
                        return Step::Done(err);
                    }
                }
            }
        }
    }

    /// Applies the restart policy after a failed attempt. `None` means "start
    /// again"; `Some` ends supervision.
    async fn recover(&mut self, kind: FailureKind, err: RuntimeError) -> Option<Outcome> {
        let id = self.descriptor.id.clone();
        let message = err.to_string();
        let restart = self.descriptor.restart.clone();

        if !restart.allows_retry(self.attempts) {
            error!(service = %id, attempts = self.attempts, error = %message, "Restart budget exhausted");
            self.fail_terminally(kind, message);
            return Some(Outcome::Idle);
        }

        let delay = restart.delay_for(self.attempts);
        warn!(service = %id, attempt = self.attempts, error = %message, ?delay, "Attempt failed, restarting");
        // Not terminal: the snapshot reads `Failed` until the next attempt.
        self.publish(ServiceState::Failed, |s| {
            s.failure = Some(kind);
            s.last_error = Some(message);
        });

        match self.interruptible(time::sleep(delay)).await {
            Step::Done(()) => None,
            Step::Interrupted(interrupt) => Some(self.interrupted(interrupt, None).await),
        }
    }

    async fn interrupted(
        &mut self,
        interrupt: Interrupt,
        instance: Option<R::Instance>,
    ) -> Outcome {
        if let Some(instance) = instance {
            self.release(instance).await;
        }
        match interrupt {
            Interrupt::Stop(respond_to) => {
                self.transition(ServiceState::Stopped);
                let _ = respond_to.send(Ok(self.state));
                Outcome::Idle
            }
            Interrupt::Fail(cause, respond_to) => {
                warn!(service = %self.descriptor.id, dependency = %cause, "Dependency failed, stopping");
                self.fail_terminally(
                    FailureKind::DependencyFailed,
                    format!("dependency `{cause}` failed"),
                );
                let _ = respond_to.send(Ok(self.state));
                Outcome::Idle
            }
            Interrupt::Detached => {
                self.transition(ServiceState::Stopped);
                Outcome::Detached
            }
        }
    }

    /// Runs `fut` while watching the request channel.
    async fn interruptible<F: Future>(&mut self, fut: F) -> Step<F::Output> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                output = &mut fut => return Step::Done(output),
                request = self.receiver.recv() => {
                    if let Some(interrupt) = Self::screen(&self.descriptor.id, self.state, request) {
                        return Step::Interrupted(interrupt);
                    }
                }
            }
        }
    }

    /// Turns a request received mid-flight into an interrupt, or answers it
    /// directly when it does not apply to a running service.
    fn screen(
        id: &ServiceId,
        state: ServiceState,
        request: Option<SupervisorRequest>,
    ) -> Option<Interrupt> {
        let invalid = |to| SupervisorError::InvalidTransition {
            service: id.clone(),
            from: state,
            to,
        };
        match request {
            None => Some(Interrupt::Detached),
            Some(SupervisorRequest::Stop { respond_to }) => Some(Interrupt::Stop(respond_to)),
            Some(SupervisorRequest::Fail { cause, respond_to }) => {
                Some(Interrupt::Fail(cause, respond_to))
            }
            Some(SupervisorRequest::Start { respond_to, .. }) => {
                let _ = respond_to.send(Err(invalid(ServiceState::Starting)));
                None
            }
            Some(SupervisorRequest::Block { respond_to, .. }) => {
                let _ = respond_to.send(Err(invalid(ServiceState::Pending)));
                None
            }
        }
    }

    async fn release(&self, instance: R::Instance) {
        if let Err(err) = self.runtime.stop(&self.descriptor, instance).await {
            warn!(service = %self.descriptor.id, error = %err, "Stop failed");
        }
    }

    fn block(&mut self, cause: ServiceId) {
        info!(service = %self.descriptor.id, blocked_by = %cause, "Blocked by failed dependency");
        self.blocked_by = Some(cause.clone());
        self.status.send_modify(|s| s.blocked_by = Some(cause));
    }

    fn fail_terminally(&mut self, kind: FailureKind, message: String) {
        self.publish(ServiceState::Failed, |s| {
            s.failure = Some(kind);
            s.last_error = Some(message);
            s.terminal = true;
        });
    }

    fn invalid(&self, to: ServiceState) -> SupervisorError {
        SupervisorError::InvalidTransition {
            service: self.descriptor.id.clone(),
            from: self.state,
            to,
        }
    }

    fn transition(&mut self, to: ServiceState) {
        self.publish(to, |_| {});
    }

    /// Commits a transition: snapshot first, then the event, so a consumer
    /// reacting to the event always sees the matching snapshot.
    fn publish(&mut self, to: ServiceState, edit: impl FnOnce(&mut ServiceSnapshot)) {
        let from = self.state;
        if from != to && !from.can_transition_to(to) {
            warn!(service = %self.descriptor.id, %from, %to, "Unexpected transition");
        }
        self.state = to;

        let attempt = self.attempts;
        let mut failure = None;
        let mut terminal = false;
        self.status.send_modify(|s| {
            s.state = to;
            s.attempts = attempt;
            edit(s);
            if to == ServiceState::Stopped || (to == ServiceState::Failed && s.terminal) {
                s.outputs = None;
            }
            failure = s.failure;
            terminal = s.terminal;
        });

        info!(service = %self.descriptor.id, %from, %to, attempt, "State changed");
        let _ = self.events.send(ServiceEvent {
            service: self.descriptor.id.clone(),
            from,
            to,
            attempt,
            failure,
            terminal,
        });
    }
}
