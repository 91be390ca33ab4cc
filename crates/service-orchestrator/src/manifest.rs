//! # Manifest Loading
//!
//! Reads a YAML manifest into [`ServiceDescriptor`]s and
//! [`OrchestratorSettings`]. The orchestrator itself only ever sees the
//! in-memory descriptors; this module is one way to build them.
//!
//! ```yaml
//! settings:
//!   onFailure: contain          # or abort (default)
//!   stopTimeoutSeconds: 20
//! services:
//!   - id: etcd
//!     start:
//!       command: etcd
//!       args: [--listen-client-urls=http://0.0.0.0:2379]
//!       ports: [{ name: client, host: 2379, container: 2379 }]
//!     outputs:
//!       endpoint: 127.0.0.1:2379
//!     healthCheck:
//!       probe: { command: [etcdctl, endpoint, health] }
//!       intervalSeconds: 30
//!   - id: milvus
//!     dependsOn:
//!       - etcd                                # waits for ready
//!       - { id: logger, condition: started }  # only waits for launch
//!     start: { command: milvus, args: [run, standalone] }
//!     config:
//!       ETCD_ENDPOINTS: { from: etcd.endpoint }
//!       COMMON_STORAGETYPE: minio
//! ```
//!
//! Durations are given in seconds and may be fractional. Every omitted
//! field takes the same default as [`HealthCheck::default`],
//! [`RestartPolicy::default`] and [`StartSpec::default`].

use crate::controller::{FailurePolicy, OrchestratorSettings};
use crate::descriptor::{
    ConfigValue, Dependency, DependencyCondition, HealthCheck, OutputRef, PortMapping, Probe,
    ResourceLimits, RestartPolicy, ServiceDescriptor, ServiceId, StartSpec,
};
use crate::error::ConfigurationError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub settings: SettingsSpec,
    pub services: Vec<ServiceSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SettingsSpec {
    pub on_failure: Option<FailurePolicy>,
    pub stop_timeout_seconds: Option<f64>,
    pub request_buffer: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ServiceSpec {
    pub id: String,
    #[serde(default)]
    pub depends_on: Vec<DependencySpec>,
    pub start: StartSpecDto,
    #[serde(default)]
    pub config: BTreeMap<String, ConfigValueSpec>,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,
    #[serde(default)]
    pub restart: Option<RestartSpec>,
}

/// `etcd` or `{ id: etcd, condition: started }`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DependencySpec {
    Id(String),
    Detailed {
        id: String,
        #[serde(default)]
        condition: DependencyCondition,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StartSpecDto {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub ports: Vec<PortSpec>,
    #[serde(default)]
    pub resources: Option<ResourcesSpec>,
    pub start_timeout_seconds: Option<f64>,
    pub stop_grace_seconds: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortSpec {
    pub name: String,
    pub host: u16,
    pub container: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ResourcesSpec {
    pub cpus: Option<f64>,
    pub memory_mb: Option<u64>,
}

/// A literal scalar or `{ from: service.output }`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ConfigValueSpec {
    Reference { from: String },
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HealthCheckSpec {
    #[serde(default)]
    pub probe: Option<ProbeSpec>,
    pub interval_seconds: Option<f64>,
    pub timeout_seconds: Option<f64>,
    pub success_threshold: Option<u32>,
    pub failure_threshold: Option<u32>,
    pub start_period_seconds: Option<f64>,
}

/// `none`, `{ command: [bin, args..] }` or `{ tcp: host:port }`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ProbeSpec {
    Keyword(String),
    Command { command: Vec<String> },
    Tcp { tcp: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RestartSpec {
    pub max_retries: Option<u32>,
    pub backoff_base_seconds: Option<f64>,
    pub multiplier: Option<f64>,
    pub backoff_cap_seconds: Option<f64>,
    pub jitter: Option<f64>,
}

impl Manifest {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigurationError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigurationError::Manifest(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            ConfigurationError::Manifest(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml(&yaml)
    }

    /// Converts the manifest into settings and descriptors. References and
    /// durations are checked here; graph checks happen at resolution.
    pub fn into_parts(
        self,
    ) -> Result<(OrchestratorSettings, Vec<ServiceDescriptor>), ConfigurationError> {
        let settings = self.settings.into_settings()?;
        let descriptors = self
            .services
            .into_iter()
            .map(ServiceSpec::into_descriptor)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((settings, descriptors))
    }
}

fn seconds(
    service: Option<&ServiceId>,
    field: &str,
    value: Option<f64>,
    default: Duration,
) -> Result<Duration, ConfigurationError> {
    let Some(value) = value else {
        return Ok(default);
    };
    Duration::try_from_secs_f64(value).map_err(|_| {
        let reason = format!("`{field}` must be a non-negative number of seconds, got {value}");
        match service {
            Some(service) => ConfigurationError::InvalidDescriptor {
                service: service.clone(),
                reason,
            },
            None => ConfigurationError::Manifest(reason),
        }
    })
}

impl SettingsSpec {
    fn into_settings(self) -> Result<OrchestratorSettings, ConfigurationError> {
        let defaults = OrchestratorSettings::default();
        Ok(OrchestratorSettings {
            failure_policy: self.on_failure.unwrap_or(defaults.failure_policy),
            stop_timeout: seconds(
                None,
                "stopTimeoutSeconds",
                self.stop_timeout_seconds,
                defaults.stop_timeout,
            )?,
            request_buffer: self.request_buffer.unwrap_or(defaults.request_buffer),
        })
    }
}

impl ServiceSpec {
    fn into_descriptor(self) -> Result<ServiceDescriptor, ConfigurationError> {
        let id = ServiceId::new(self.id);

        let dependencies = self
            .depends_on
            .into_iter()
            .map(|dep| match dep {
                DependencySpec::Id(dep) => Dependency::ready(dep),
                DependencySpec::Detailed { id, condition } => Dependency {
                    id: id.into(),
                    condition,
                },
            })
            .collect();

        let config = self
            .config
            .into_iter()
            .map(|(key, value)| {
                let value = match value {
                    ConfigValueSpec::Reference { from } => {
                        let reference: OutputRef =
                            from.parse()
                                .map_err(|_| ConfigurationError::InvalidReference {
                                    service: id.clone(),
                                    key: key.clone(),
                                    value: from.clone(),
                                })?;
                        ConfigValue::Reference(reference)
                    }
                    ConfigValueSpec::Bool(b) => ConfigValue::Literal(b.to_string()),
                    ConfigValueSpec::Integer(n) => ConfigValue::Literal(n.to_string()),
                    ConfigValueSpec::Float(n) => ConfigValue::Literal(n.to_string()),
                    ConfigValueSpec::Text(s) => ConfigValue::Literal(s),
                };
                Ok::<_, ConfigurationError>((key, value))
            })
            .collect::<Result<BTreeMap<_, _>, ConfigurationError>>()?;

        let start = self.start.into_start(&id)?;
        let health_check = match self.health_check {
            Some(spec) => spec.into_health_check(&id)?,
            None => HealthCheck::default(),
        };
        let restart = match self.restart {
            Some(spec) => spec.into_policy(&id)?,
            None => RestartPolicy::default(),
        };

        Ok(ServiceDescriptor {
            id,
            dependencies,
            start,
            config,
            outputs: self.outputs,
            health_check,
            restart,
        })
    }
}

impl StartSpecDto {
    fn into_start(self, id: &ServiceId) -> Result<StartSpec, ConfigurationError> {
        let defaults = StartSpec::default();
        Ok(StartSpec {
            command: self.command,
            args: self.args,
            env: self.env,
            working_dir: self.working_dir,
            ports: self
                .ports
                .into_iter()
                .map(|p| PortMapping {
                    name: p.name,
                    host: p.host,
                    container: p.container,
                })
                .collect(),
            resources: self
                .resources
                .map(|r| ResourceLimits {
                    cpus: r.cpus,
                    memory_mb: r.memory_mb,
                })
                .unwrap_or_default(),
            start_timeout: seconds(
                Some(id),
                "startTimeoutSeconds",
                self.start_timeout_seconds,
                defaults.start_timeout,
            )?,
            stop_grace: seconds(
                Some(id),
                "stopGraceSeconds",
                self.stop_grace_seconds,
                defaults.stop_grace,
            )?,
        })
    }
}

impl HealthCheckSpec {
    fn into_health_check(self, id: &ServiceId) -> Result<HealthCheck, ConfigurationError> {
        let defaults = HealthCheck::default();
        let probe = match self.probe {
            None => Probe::None,
            Some(ProbeSpec::Keyword(word)) if word == "none" => Probe::None,
            Some(ProbeSpec::Keyword(word)) => {
                return Err(ConfigurationError::InvalidDescriptor {
                    service: id.clone(),
                    reason: format!("unknown probe `{word}`"),
                })
            }
            Some(ProbeSpec::Command { command }) => {
                let mut parts = command.into_iter();
                let Some(command) = parts.next() else {
                    return Err(ConfigurationError::InvalidDescriptor {
                        service: id.clone(),
                        reason: "probe command is empty".to_string(),
                    });
                };
                Probe::Command {
                    command,
                    args: parts.collect(),
                }
            }
            Some(ProbeSpec::Tcp { tcp }) => Probe::Tcp { address: tcp },
        };
        Ok(HealthCheck {
            probe,
            interval: seconds(Some(id), "intervalSeconds", self.interval_seconds, defaults.interval)?,
            timeout: seconds(Some(id), "timeoutSeconds", self.timeout_seconds, defaults.timeout)?,
            success_threshold: self.success_threshold.unwrap_or(defaults.success_threshold),
            failure_threshold: self.failure_threshold.unwrap_or(defaults.failure_threshold),
            start_period: seconds(
                Some(id),
                "startPeriodSeconds",
                self.start_period_seconds,
                defaults.start_period,
            )?,
        })
    }
}

impl RestartSpec {
    fn into_policy(self, id: &ServiceId) -> Result<RestartPolicy, ConfigurationError> {
        let defaults = RestartPolicy::default();
        Ok(RestartPolicy {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            backoff_base: seconds(
                Some(id),
                "backoffBaseSeconds",
                self.backoff_base_seconds,
                defaults.backoff_base,
            )?,
            multiplier: self.multiplier.unwrap_or(defaults.multiplier),
            backoff_cap: seconds(
                Some(id),
                "backoffCapSeconds",
                self.backoff_cap_seconds,
                defaults.backoff_cap,
            )?,
            jitter: self.jitter.unwrap_or(defaults.jitter),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const STACK: &str = r#"
settings:
  onFailure: contain
  stopTimeoutSeconds: 12.5
services:
  - id: etcd
    start:
      command: etcd
      args: ["--data-dir", "/etcd"]
      env: { ETCD_QUOTA_BACKEND_BYTES: "4294967296" }
      ports: [{ name: client, host: 2379, container: 2379 }]
    outputs:
      endpoint: 127.0.0.1:2379
    healthCheck:
      probe: { command: [etcdctl, endpoint, health] }
      intervalSeconds: 5
      failureThreshold: 4
  - id: logger
    start: { command: logger }
    healthCheck: { probe: none }
  - id: milvus
    dependsOn:
      - etcd
      - { id: logger, condition: started }
    start: { command: milvus, args: [run, standalone] }
    config:
      ETCD_ENDPOINTS: { from: etcd.endpoint }
      COMMON_STORAGETYPE: minio
      ETCD_USE_EMBED: false
      PROXY_PORT: 19530
    healthCheck:
      probe: { tcp: "127.0.0.1:19530" }
    restart: { maxRetries: 5, backoffBaseSeconds: 0.5 }
"#;

    #[test]
    fn parses_a_full_manifest() {
        let (settings, services) = Manifest::from_yaml(STACK).unwrap().into_parts().unwrap();
        assert_eq!(settings.failure_policy, FailurePolicy::Contain);
        assert_eq!(settings.stop_timeout, Duration::from_millis(12_500));
        assert_eq!(services.len(), 3);

        let etcd = &services[0];
        assert_eq!(etcd.start.args, vec!["--data-dir", "/etcd"]);
        assert_eq!(etcd.start.ports[0].host, 2379);
        assert_eq!(etcd.health_check.interval, Duration::from_secs(5));
        assert_eq!(etcd.health_check.failure_threshold, 4);
        assert_eq!(etcd.health_check.success_threshold, 1);
        assert!(matches!(etcd.health_check.probe, Probe::Command { ref command, .. } if command == "etcdctl"));

        let milvus = &services[2];
        assert_eq!(
            milvus.dependencies,
            vec![Dependency::ready("etcd"), Dependency::started("logger")]
        );
        assert_eq!(
            milvus.config.get("ETCD_ENDPOINTS"),
            Some(&ConfigValue::Reference(OutputRef::new("etcd", "endpoint")))
        );
        assert_eq!(
            milvus.config.get("ETCD_USE_EMBED"),
            Some(&ConfigValue::Literal("false".into()))
        );
        assert_eq!(
            milvus.config.get("PROXY_PORT"),
            Some(&ConfigValue::Literal("19530".into()))
        );
        assert_eq!(milvus.restart.max_retries, 5);
        assert_eq!(milvus.restart.backoff_base, Duration::from_millis(500));
        assert_eq!(milvus.restart.backoff_cap, Duration::from_secs(30));
        for service in &services {
            service.validate().unwrap();
        }
    }

    #[test]
    fn omitted_sections_take_defaults() {
        let yaml = "services:\n  - id: a\n    start: { command: a }\n";
        let (settings, services) = Manifest::from_yaml(yaml).unwrap().into_parts().unwrap();
        assert_eq!(settings, OrchestratorSettings::default());
        assert_eq!(services[0].health_check, HealthCheck::default());
        assert_eq!(services[0].restart, RestartPolicy::default());
    }

    #[test]
    fn rejects_malformed_references_and_durations() {
        let yaml = r#"
services:
  - id: milvus
    start: { command: milvus }
    config: { ETCD_ENDPOINTS: { from: etcd } }
"#;
        let err = Manifest::from_yaml(yaml).unwrap().into_parts().unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidReference { .. }));

        let yaml = r#"
services:
  - id: etcd
    start: { command: etcd }
    healthCheck: { intervalSeconds: -1 }
"#;
        let err = Manifest::from_yaml(yaml).unwrap().into_parts().unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidDescriptor { .. }));
    }

    #[test]
    fn unknown_fields_are_errors() {
        let yaml = "services:\n  - id: a\n    start: { command: a }\n    dependOn: [b]\n";
        assert!(matches!(
            Manifest::from_yaml(yaml),
            Err(ConfigurationError::Manifest(_))
        ));
    }

    #[test]
    fn loads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(STACK.as_bytes()).unwrap();
        let manifest = Manifest::load(file.path()).unwrap();
        assert_eq!(manifest.services.len(), 3);

        let missing = Manifest::load("/definitely/not/here.yaml").unwrap_err();
        assert!(missing.to_string().contains("cannot read"));
    }
}
