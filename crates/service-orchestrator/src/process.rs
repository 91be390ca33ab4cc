//! # Process Runtime
//!
//! [`ServiceRuntime`] backed by local OS processes.
//!
//! - **start** spawns `start.command` with `start.args`. The environment is
//!   the static `start.env` with the rendered configuration layered on top.
//!   Child stdout and stderr are forwarded line by line into `tracing`.
//! - **probe** first checks that the child is still alive, then runs the
//!   health check: a command (exit status 0 is healthy, run with the same
//!   environment as the service) or a TCP connect.
//! - **stop** sends `SIGTERM`, waits up to `stop_grace`, then kills.
//!
//! Resource limits and port mappings are not enforced on plain processes.
//! Ports are only published as `port.<name>` outputs.

use crate::descriptor::{Probe, ServiceDescriptor, ServiceId};
use crate::error::RuntimeError;
use crate::propagate::RenderedConfig;
use crate::runtime::ServiceRuntime;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time;
use tracing::{debug, info, warn};

pub struct ProcessRuntime {
    host: String,
}

impl Default for ProcessRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRuntime {
    pub fn new() -> Self {
        Self::with_host("127.0.0.1")
    }

    /// Host name published in every service's `host` output.
    pub fn with_host(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

/// A spawned child process.
pub struct ProcessInstance {
    child: Child,
    pid: Option<u32>,
    env: BTreeMap<String, String>,
}

impl ProcessInstance {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Environment the process was launched with.
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }
}

fn forward_lines<S>(service: ServiceId, stream: &'static str, source: S)
where
    S: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(source).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(service = %service, stream, "{line}");
        }
    });
}

#[cfg(unix)]
async fn terminate(pid: u32) -> Result<(), RuntimeError> {
    let status = Command::new("kill")
        .args(["-TERM", &pid.to_string()])
        .status()
        .await?;
    if !status.success() {
        return Err(RuntimeError::Stop(format!(
            "kill -TERM {pid} failed with exit code {:?}",
            status.code()
        )));
    }
    Ok(())
}

#[async_trait]
impl ServiceRuntime for ProcessRuntime {
    type Instance = ProcessInstance;

    async fn start(
        &self,
        descriptor: &ServiceDescriptor,
        config: &RenderedConfig,
    ) -> Result<ProcessInstance, RuntimeError> {
        let spec = &descriptor.start;
        let mut env = spec.env.clone();
        env.extend(config.iter().map(|(k, v)| (k.to_string(), v.to_string())));

        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| RuntimeError::Launch {
            command: spec.command.clone(),
            source,
        })?;
        let pid = child.id();
        info!(service = %descriptor.id, command = %spec.command, pid, "Process spawned");

        if let Some(stdout) = child.stdout.take() {
            forward_lines(descriptor.id.clone(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(descriptor.id.clone(), "stderr", stderr);
        }

        Ok(ProcessInstance { child, pid, env })
    }

    async fn probe(
        &self,
        descriptor: &ServiceDescriptor,
        instance: &mut ProcessInstance,
    ) -> Result<(), RuntimeError> {
        if let Some(status) = instance.child.try_wait()? {
            return Err(RuntimeError::Exited(status.to_string()));
        }

        match &descriptor.health_check.probe {
            Probe::None => Ok(()),
            Probe::Command { command, args } => {
                let output = Command::new(command)
                    .args(args)
                    .envs(&instance.env)
                    .stdin(Stdio::null())
                    .kill_on_drop(true)
                    .output()
                    .await?;
                if output.status.success() {
                    Ok(())
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    Err(RuntimeError::ProbeFailed(format!(
                        "`{command}` exited with {}: {}",
                        output.status,
                        stderr.trim()
                    )))
                }
            }
            Probe::Tcp { address } => TcpStream::connect(address.as_str())
                .await
                .map(|_| ())
                .map_err(|e| RuntimeError::ProbeFailed(format!("connect {address}: {e}"))),
        }
    }

    fn outputs(
        &self,
        descriptor: &ServiceDescriptor,
        instance: &ProcessInstance,
    ) -> BTreeMap<String, String> {
        let mut outputs = BTreeMap::new();
        outputs.insert("host".to_string(), self.host.clone());
        if let Some(pid) = instance.pid {
            outputs.insert("pid".to_string(), pid.to_string());
        }
        for port in &descriptor.start.ports {
            outputs.insert(format!("port.{}", port.name), port.host.to_string());
        }
        outputs
    }

    async fn stop(
        &self,
        descriptor: &ServiceDescriptor,
        mut instance: ProcessInstance,
    ) -> Result<(), RuntimeError> {
        if let Some(status) = instance.child.try_wait()? {
            debug!(service = %descriptor.id, %status, "Process already exited");
            return Ok(());
        }

        #[cfg(unix)]
        {
            if let Some(pid) = instance.pid {
                if let Err(err) = terminate(pid).await {
                    warn!(service = %descriptor.id, error = %err, "Graceful stop failed");
                }
            }
        }

        let grace = descriptor.start.stop_grace;
        match time::timeout(grace, instance.child.wait()).await {
            Ok(status) => {
                let status = status?;
                info!(service = %descriptor.id, %status, "Process exited");
                Ok(())
            }
            Err(_) => {
                warn!(service = %descriptor.id, ?grace, "Process ignored SIGTERM, killing");
                instance
                    .child
                    .kill()
                    .await
                    .map_err(|e| RuntimeError::Stop(e.to_string()))
            }
        }
    }
}
