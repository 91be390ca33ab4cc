//! # Service Runtime
//!
//! The process boundary. The orchestrator core never launches anything
//! itself; each supervisor calls into a [`ServiceRuntime`] to start, probe
//! and stop its service. [`ProcessRuntime`](crate::process::ProcessRuntime)
//! runs local OS processes and [`MockRuntime`](crate::mock::MockRuntime)
//! scripts behaviour for tests.

use crate::descriptor::ServiceDescriptor;
use crate::error::RuntimeError;
use crate::propagate::RenderedConfig;
use async_trait::async_trait;
use std::collections::BTreeMap;

#[async_trait]
pub trait ServiceRuntime: Send + Sync + 'static {
    /// Handle to one running instance of a service.
    type Instance: Send + 'static;

    /// Launches the service with `config` layered over its static
    /// environment. Returns once the process exists, not once it is healthy.
    async fn start(
        &self,
        descriptor: &ServiceDescriptor,
        config: &RenderedConfig,
    ) -> Result<Self::Instance, RuntimeError>;

    /// Runs one health probe. The supervisor bounds the call with the
    /// health check's `timeout`.
    async fn probe(
        &self,
        descriptor: &ServiceDescriptor,
        instance: &mut Self::Instance,
    ) -> Result<(), RuntimeError>;

    /// Values the instance exposes to dependents, merged under the
    /// descriptor's declared outputs.
    fn outputs(
        &self,
        _descriptor: &ServiceDescriptor,
        _instance: &Self::Instance,
    ) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Stops the instance, gracefully if possible.
    async fn stop(
        &self,
        descriptor: &ServiceDescriptor,
        instance: Self::Instance,
    ) -> Result<(), RuntimeError>;
}
