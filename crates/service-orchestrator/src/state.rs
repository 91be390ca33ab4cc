//! # Service State & Status Publication
//!
//! Each supervisor is the only writer of its service's [`ServiceState`] and
//! [`ResolvedOutputs`]. It publishes them in two ways:
//!
//! - a [`ServiceSnapshot`] on a `tokio::sync::watch` channel, read by anyone
//!   holding a [`StatusHandle`] (CLI, tests, the controller when rendering
//!   configuration);
//! - a [`ServiceEvent`] per transition on the controller's event stream, which
//!   is what drives stage advancement.
//!
//! The snapshot is always updated before the matching event is sent, so a
//! `Ready` event guarantees the outputs are already visible.

use crate::descriptor::ServiceId;
use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::sync::Arc;
use tokio::sync::watch;

/// Lifecycle state of one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceState {
    Pending,
    Starting,
    Probing,
    Ready,
    Degraded,
    Failed,
    Stopped,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Pending => "pending",
            ServiceState::Starting => "starting",
            ServiceState::Probing => "probing",
            ServiceState::Ready => "ready",
            ServiceState::Degraded => "degraded",
            ServiceState::Failed => "failed",
            ServiceState::Stopped => "stopped",
        }
    }

    /// A process has been (or is being) launched for the service.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ServiceState::Starting
                | ServiceState::Probing
                | ServiceState::Ready
                | ServiceState::Degraded
        )
    }

    /// Whether the supervisor state machine allows `self -> next`.
    pub fn can_transition_to(&self, next: ServiceState) -> bool {
        use ServiceState::*;
        match (self, next) {
            (Pending, Starting) => true,
            (Starting, Probing) => true,
            (Starting, Failed) => true,
            (Probing, Ready) | (Probing, Failed) => true,
            (Ready, Degraded) => true,
            (Degraded, Ready) => true,
            (Degraded, Starting) | (Failed, Starting) => true,
            // retry budget exhausted while degraded, or a dependency failed
            (Degraded, Failed) | (Ready, Failed) => true,
            (_, Stopped) => *self != Stopped,
            _ => false,
        }
    }
}

impl Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Terminal error kind reported for a failed service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The process could not be launched.
    Start,
    /// The health check never passed, or stopped passing.
    Probe,
    /// Configuration could not be rendered.
    Propagation,
    /// A dependency failed terminally.
    DependencyFailed,
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureKind::Start => "start error",
            FailureKind::Probe => "probe error",
            FailureKind::Propagation => "propagation error",
            FailureKind::DependencyFailed => "dependency failed",
        })
    }
}

/// Runtime values a ready service exposes to its dependents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedOutputs(BTreeMap<String, String>);

impl ResolvedOutputs {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<String, String>> for ResolvedOutputs {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ResolvedOutputs {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Committed view of one service, published by its supervisor.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSnapshot {
    pub state: ServiceState,
    /// Start attempts made so far in this run.
    pub attempts: u32,
    /// Present from the first time the service became ready.
    pub outputs: Option<Arc<ResolvedOutputs>>,
    pub last_error: Option<String>,
    pub failure: Option<FailureKind>,
    /// Set once the service has failed for good.
    pub terminal: bool,
    /// Failed dependency that keeps this service from starting.
    pub blocked_by: Option<ServiceId>,
}

impl Default for ServiceSnapshot {
    fn default() -> Self {
        Self {
            state: ServiceState::Pending,
            attempts: 0,
            outputs: None,
            last_error: None,
            failure: None,
            terminal: false,
            blocked_by: None,
        }
    }
}

/// One state transition, as delivered to the controller.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceEvent {
    pub service: ServiceId,
    pub from: ServiceState,
    pub to: ServiceState,
    pub attempt: u32,
    pub failure: Option<FailureKind>,
    pub terminal: bool,
}

/// Aggregate phase of the whole deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Starting,
    Running,
    Degraded,
    Failed,
    Stopped,
}

impl RunPhase {
    pub fn from_snapshots<'a>(snapshots: impl IntoIterator<Item = &'a ServiceSnapshot>) -> Self {
        let mut any_starting = false;
        let mut any_degraded = false;
        let mut any_failed = false;
        let mut all_stopped = true;
        for s in snapshots {
            match s.state {
                ServiceState::Pending if s.blocked_by.is_none() => any_starting = true,
                ServiceState::Starting | ServiceState::Probing => any_starting = true,
                ServiceState::Degraded => any_degraded = true,
                ServiceState::Failed if s.terminal => any_failed = true,
                ServiceState::Failed => any_degraded = true,
                _ => {}
            }
            if s.state != ServiceState::Stopped {
                all_stopped = false;
            }
        }
        if all_stopped {
            RunPhase::Stopped
        } else if any_failed {
            RunPhase::Failed
        } else if any_starting {
            RunPhase::Starting
        } else if any_degraded {
            RunPhase::Degraded
        } else {
            RunPhase::Running
        }
    }
}

impl Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunPhase::Starting => "starting",
            RunPhase::Running => "running",
            RunPhase::Degraded => "degraded",
            RunPhase::Failed => "failed",
            RunPhase::Stopped => "stopped",
        })
    }
}

/// One row of a [`StatusReport`].
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceStatus {
    pub id: ServiceId,
    pub state: ServiceState,
    pub attempts: u32,
    pub failure: Option<FailureKind>,
    pub last_error: Option<String>,
    pub blocked_by: Option<ServiceId>,
}

/// Per-service state table plus the aggregate phase.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub phase: RunPhase,
    pub services: Vec<ServiceStatus>,
}

impl StatusReport {
    pub fn state_of(&self, id: &str) -> Option<ServiceState> {
        self.services
            .iter()
            .find(|s| s.id.as_str() == id)
            .map(|s| s.state)
    }
}

impl Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "phase: {}", self.phase)?;
        for s in &self.services {
            write!(f, "  {:<16} {:<9} attempts={}", s.id, s.state, s.attempts)?;
            if let Some(cause) = &s.blocked_by {
                write!(f, " blocked_by={cause}")?;
            }
            if let Some(kind) = s.failure {
                write!(f, " failure=\"{kind}\"")?;
            }
            if let Some(err) = &s.last_error {
                write!(f, " last_error=\"{err}\"")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Cloneable read-only view over every supervisor's published snapshot.
#[derive(Clone)]
pub struct StatusHandle {
    services: Arc<Vec<(ServiceId, watch::Receiver<ServiceSnapshot>)>>,
}

impl StatusHandle {
    pub(crate) fn new(services: Vec<(ServiceId, watch::Receiver<ServiceSnapshot>)>) -> Self {
        Self {
            services: Arc::new(services),
        }
    }

    pub fn snapshot(&self, id: &str) -> Option<ServiceSnapshot> {
        self.services
            .iter()
            .find(|(sid, _)| sid.as_str() == id)
            .map(|(_, rx)| rx.borrow().clone())
    }

    pub fn outputs(&self, id: &str) -> Option<Arc<ResolvedOutputs>> {
        self.snapshot(id).and_then(|s| s.outputs)
    }

    pub fn report(&self) -> StatusReport {
        let snapshots: Vec<(ServiceId, ServiceSnapshot)> = self
            .services
            .iter()
            .map(|(id, rx)| (id.clone(), rx.borrow().clone()))
            .collect();
        let phase = RunPhase::from_snapshots(snapshots.iter().map(|(_, s)| s));
        let services = snapshots
            .into_iter()
            .map(|(id, s)| ServiceStatus {
                id,
                state: s.state,
                attempts: s.attempts,
                failure: s.failure,
                last_error: s.last_error,
                blocked_by: s.blocked_by,
            })
            .collect();
        StatusReport { phase, services }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(state: ServiceState) -> ServiceSnapshot {
        ServiceSnapshot {
            state,
            ..ServiceSnapshot::default()
        }
    }

    #[test]
    fn transitions_follow_the_state_machine() {
        use ServiceState::*;
        assert!(Pending.can_transition_to(Starting));
        assert!(Probing.can_transition_to(Ready));
        assert!(Degraded.can_transition_to(Starting));
        assert!(Pending.can_transition_to(Stopped));
        assert!(!Pending.can_transition_to(Ready));
        assert!(!Stopped.can_transition_to(Stopped));
        assert!(!Ready.can_transition_to(Probing));
    }

    #[test]
    fn phase_reflects_worst_service() {
        let all_ready = [snapshot(ServiceState::Ready), snapshot(ServiceState::Ready)];
        assert_eq!(RunPhase::from_snapshots(&all_ready), RunPhase::Running);

        let one_degraded = [snapshot(ServiceState::Ready), snapshot(ServiceState::Degraded)];
        assert_eq!(RunPhase::from_snapshots(&one_degraded), RunPhase::Degraded);

        let mut failed = snapshot(ServiceState::Failed);
        failed.terminal = true;
        let one_failed = [snapshot(ServiceState::Ready), failed];
        assert_eq!(RunPhase::from_snapshots(&one_failed), RunPhase::Failed);

        let stopped = [snapshot(ServiceState::Stopped)];
        assert_eq!(RunPhase::from_snapshots(&stopped), RunPhase::Stopped);
    }

    #[test]
    fn status_handle_reads_published_snapshots() {
        let (tx, rx) = watch::channel(ServiceSnapshot::default());
        let handle = StatusHandle::new(vec![(ServiceId::from("etcd"), rx)]);
        assert_eq!(handle.report().state_of("etcd"), Some(ServiceState::Pending));

        tx.send_modify(|s| {
            s.state = ServiceState::Ready;
            s.outputs = Some(Arc::new(
                [("endpoint", "127.0.0.1:2379")].into_iter().collect(),
            ));
        });
        assert_eq!(handle.report().state_of("etcd"), Some(ServiceState::Ready));
        assert_eq!(
            handle.outputs("etcd").unwrap().get("endpoint"),
            Some("127.0.0.1:2379")
        );
        assert!(handle.snapshot("minio").is_none());
    }
}
