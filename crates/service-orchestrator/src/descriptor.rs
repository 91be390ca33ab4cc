//! # Service Descriptors
//!
//! A [`ServiceDescriptor`] is the immutable definition of one orchestrated
//! service: who it is, what it depends on, how to launch it, which
//! configuration it consumes from its dependencies, which outputs it exposes,
//! how to check its health and how to restart it.
//!
//! Descriptors are plain in-memory values. The [`manifest`](crate::manifest)
//! module builds them from YAML, and [`ServiceDescriptor::builder`] builds
//! them in code:
//!
//! ```rust
//! use service_orchestrator::descriptor::{HealthCheck, ServiceDescriptor};
//!
//! let minio = ServiceDescriptor::builder("minio")
//!     .command("minio")
//!     .args(["server", "/minio_data"])
//!     .output("endpoint", "127.0.0.1:9000")
//!     .output("accessKey", "minioadmin")
//!     .health_check(HealthCheck::tcp("127.0.0.1:9000"))
//!     .build();
//!
//! let milvus = ServiceDescriptor::builder("milvus")
//!     .depends_on("minio")
//!     .command("milvus")
//!     .args(["run", "standalone"])
//!     .reference("MINIO_ADDRESS", "minio", "endpoint")
//!     .build();
//!
//! assert!(milvus.depends_on_service(&minio.id));
//! ```

use crate::error::ConfigurationError;
use serde::Deserialize;
use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Unique name of a service within one descriptor set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId(String);

impl ServiceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ServiceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ServiceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for ServiceId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

/// What a dependent waits for before it may start.
///
/// `Ready` is the default: the dependency must pass its health check first.
/// `Started` only requires the dependency's process to have been launched,
/// which is the weaker "start-after" reading of `depends_on`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyCondition {
    #[default]
    Ready,
    Started,
}

/// One outgoing dependency edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub id: ServiceId,
    pub condition: DependencyCondition,
}

impl Dependency {
    pub fn ready(id: impl Into<ServiceId>) -> Self {
        Self {
            id: id.into(),
            condition: DependencyCondition::Ready,
        }
    }

    pub fn started(id: impl Into<ServiceId>) -> Self {
        Self {
            id: id.into(),
            condition: DependencyCondition::Started,
        }
    }
}

/// A port the service publishes on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub name: String,
    pub host: u16,
    pub container: u16,
}

/// Resource limits handed to the runtime. The process runtime only records
/// them; container runtimes would enforce them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceLimits {
    pub cpus: Option<f64>,
    pub memory_mb: Option<u64>,
}

/// Launch parameters. Opaque to the orchestrator core.
#[derive(Debug, Clone, PartialEq)]
pub struct StartSpec {
    pub command: String,
    pub args: Vec<String>,
    /// Static environment. Rendered configuration is layered on top.
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub ports: Vec<PortMapping>,
    pub resources: ResourceLimits,
    /// Upper bound on the launch call itself.
    pub start_timeout: Duration,
    /// Time between the graceful stop signal and a forced kill.
    pub stop_grace: Duration,
}

impl Default for StartSpec {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            ports: Vec::new(),
            resources: ResourceLimits::default(),
            start_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(10),
        }
    }
}

/// A `{service}.{output}` reference to another service's resolved output.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutputRef {
    pub service: ServiceId,
    pub output: String,
}

impl OutputRef {
    pub fn new(service: impl Into<ServiceId>, output: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            output: output.into(),
        }
    }
}

impl FromStr for OutputRef {
    type Err = String;

    /// Splits on the first `.`, so output keys may themselves contain dots
    /// (`minio.port.api`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((service, output)) if !service.is_empty() && !output.is_empty() => {
                Ok(Self::new(service, output))
            }
            _ => Err(format!("`{s}` is not of the form `service.output`")),
        }
    }
}

impl Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service, self.output)
    }
}

/// A configuration template entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    Literal(String),
    Reference(OutputRef),
}

/// How health is observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// No active check: the service is healthy while its process runs.
    None,
    /// Run a command; exit status 0 is healthy.
    Command { command: String, args: Vec<String> },
    /// Open a TCP connection to `address`.
    Tcp { address: String },
}

/// Probe definition plus cadence and thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheck {
    pub probe: Probe,
    pub interval: Duration,
    pub timeout: Duration,
    pub success_threshold: u32,
    pub failure_threshold: u32,
    /// Grace period in which the service must first become ready.
    pub start_period: Duration,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            probe: Probe::None,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(30),
            success_threshold: 1,
            failure_threshold: 3,
            start_period: Duration::from_secs(60),
        }
    }
}

impl HealthCheck {
    pub fn command<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            probe: Probe::Command {
                command: command.into(),
                args: args.into_iter().map(Into::into).collect(),
            },
            ..Self::default()
        }
    }

    pub fn tcp(address: impl Into<String>) -> Self {
        Self {
            probe: Probe::Tcp {
                address: address.into(),
            },
            ..Self::default()
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn thresholds(mut self, success: u32, failure: u32) -> Self {
        self.success_threshold = success;
        self.failure_threshold = failure;
        self
    }

    pub fn start_period(mut self, start_period: Duration) -> Self {
        self.start_period = start_period;
        self
    }
}

/// Restart parameters. Delays grow as `backoff_base * multiplier^(n-1)`,
/// capped at `backoff_cap`, plus up to `jitter` (a fraction) of random extra.
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    /// Restarts allowed after the first start attempt.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub multiplier: f64,
    pub backoff_cap: Duration,
    pub jitter: f64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            multiplier: 2.0,
            backoff_cap: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

impl RestartPolicy {
    pub fn never() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

/// Immutable definition of one service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDescriptor {
    pub id: ServiceId,
    pub dependencies: Vec<Dependency>,
    pub start: StartSpec,
    pub config: BTreeMap<String, ConfigValue>,
    /// Outputs published to dependents once ready. Runtime-provided outputs
    /// (`host`, `pid`, `port.<name>`) are merged underneath these.
    pub outputs: BTreeMap<String, String>,
    pub health_check: HealthCheck,
    pub restart: RestartPolicy,
}

impl ServiceDescriptor {
    pub fn builder(id: impl Into<ServiceId>) -> ServiceDescriptorBuilder {
        ServiceDescriptorBuilder {
            descriptor: ServiceDescriptor {
                id: id.into(),
                dependencies: Vec::new(),
                start: StartSpec::default(),
                config: BTreeMap::new(),
                outputs: BTreeMap::new(),
                health_check: HealthCheck::default(),
                restart: RestartPolicy::default(),
            },
        }
    }

    pub fn dependency_ids(&self) -> impl Iterator<Item = &ServiceId> {
        self.dependencies.iter().map(|d| &d.id)
    }

    pub fn depends_on_service(&self, id: &ServiceId) -> bool {
        self.dependencies.iter().any(|d| &d.id == id)
    }

    /// The condition on the edge to `id`; `Ready` wins if the edge is
    /// declared twice with different conditions.
    pub fn condition_for(&self, id: &ServiceId) -> Option<DependencyCondition> {
        let mut conditions = self
            .dependencies
            .iter()
            .filter(|d| &d.id == id)
            .map(|d| d.condition);
        let first = conditions.next()?;
        Some(
            conditions.fold(first, |acc, c| match (acc, c) {
                (DependencyCondition::Ready, _) | (_, DependencyCondition::Ready) => {
                    DependencyCondition::Ready
                }
                _ => DependencyCondition::Started,
            }),
        )
    }

    /// Checks everything that can be checked on a single descriptor. Graph
    /// level checks (unknown ids, cycles) belong to [`crate::graph::resolve`].
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |reason: &str| ConfigurationError::InvalidDescriptor {
            service: self.id.clone(),
            reason: reason.to_string(),
        };

        if self.id.as_str().trim().is_empty() {
            return Err(invalid("id is empty"));
        }
        if self.id.as_str().contains('.') {
            return Err(invalid("id must not contain `.`"));
        }
        if self.depends_on_service(&self.id) {
            return Err(ConfigurationError::SelfDependency(self.id.clone()));
        }
        if self.start.command.trim().is_empty() {
            return Err(invalid("start command is empty"));
        }
        if self.health_check.success_threshold == 0 || self.health_check.failure_threshold == 0 {
            return Err(invalid("health check thresholds must be at least 1"));
        }
        if self.health_check.interval.is_zero() {
            return Err(invalid("health check interval must be positive"));
        }
        if !(self.restart.multiplier.is_finite() && self.restart.multiplier >= 1.0) {
            return Err(invalid("restart multiplier must be >= 1"));
        }
        if !(0.0..=1.0).contains(&self.restart.jitter) {
            return Err(invalid("restart jitter must be within 0..=1"));
        }
        crate::propagate::validate_references(self)
    }
}

/// Fluent construction of a [`ServiceDescriptor`].
#[derive(Debug, Clone)]
pub struct ServiceDescriptorBuilder {
    descriptor: ServiceDescriptor,
}

impl ServiceDescriptorBuilder {
    /// Adds a ready-before edge.
    pub fn depends_on(mut self, id: impl Into<ServiceId>) -> Self {
        self.descriptor.dependencies.push(Dependency::ready(id));
        self
    }

    /// Adds a start-after edge.
    pub fn depends_on_started(mut self, id: impl Into<ServiceId>) -> Self {
        self.descriptor.dependencies.push(Dependency::started(id));
        self
    }

    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.descriptor.start.command = command.into();
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.descriptor.start.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.descriptor
            .start
            .args
            .extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.descriptor.start.env.insert(key.into(), value.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.descriptor.start.working_dir = Some(dir.into());
        self
    }

    pub fn port(mut self, name: impl Into<String>, host: u16, container: u16) -> Self {
        self.descriptor.start.ports.push(PortMapping {
            name: name.into(),
            host,
            container,
        });
        self
    }

    pub fn resources(mut self, resources: ResourceLimits) -> Self {
        self.descriptor.start.resources = resources;
        self
    }

    pub fn start_timeout(mut self, timeout: Duration) -> Self {
        self.descriptor.start.start_timeout = timeout;
        self
    }

    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.descriptor.start.stop_grace = grace;
        self
    }

    pub fn literal(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.descriptor
            .config
            .insert(key.into(), ConfigValue::Literal(value.into()));
        self
    }

    pub fn reference(
        mut self,
        key: impl Into<String>,
        service: impl Into<ServiceId>,
        output: impl Into<String>,
    ) -> Self {
        self.descriptor.config.insert(
            key.into(),
            ConfigValue::Reference(OutputRef::new(service, output)),
        );
        self
    }

    pub fn output(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.descriptor.outputs.insert(key.into(), value.into());
        self
    }

    pub fn health_check(mut self, health_check: HealthCheck) -> Self {
        self.descriptor.health_check = health_check;
        self
    }

    pub fn restart(mut self, restart: RestartPolicy) -> Self {
        self.descriptor.restart = restart;
        self
    }

    pub fn build(self) -> ServiceDescriptor {
        self.descriptor
    }
}
