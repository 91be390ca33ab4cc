//! # Configuration Propagator
//!
//! Renders a service's configuration template against the outputs its
//! dependencies published when they became ready. Literals pass through,
//! `service.output` references are substituted.
//!
//! Rendering happens immediately before a service's `Start` request, when
//! the readiness ordering guarantees every referenced dependency is `Ready`.
//! A missing output therefore means that guarantee was broken and is fatal to
//! the run rather than something to retry.

use crate::descriptor::{ConfigValue, DependencyCondition, ServiceDescriptor, ServiceId};
use crate::error::{ConfigurationError, PropagationError};
use crate::state::ResolvedOutputs;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Outputs of the dependencies visible to one render call.
pub type DependencyOutputs = HashMap<ServiceId, Arc<ResolvedOutputs>>;

/// Fully substituted configuration, handed to the runtime as environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderedConfig(BTreeMap<String, String>);

impl RenderedConfig {
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

    pub fn into_inner(self) -> BTreeMap<String, String> {
        self.0
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RenderedConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Substitutes every reference in `descriptor.config`.
///
/// Deterministic: the same descriptor and outputs always render the same
/// map.
pub fn render(
    descriptor: &ServiceDescriptor,
    outputs: &DependencyOutputs,
) -> Result<RenderedConfig, PropagationError> {
    let mut rendered = BTreeMap::new();
    for (key, value) in &descriptor.config {
        let resolved = match value {
            ConfigValue::Literal(literal) => literal.clone(),
            ConfigValue::Reference(reference) => outputs
                .get(&reference.service)
                .and_then(|o| o.get(&reference.output))
                .map(str::to_string)
                .ok_or_else(|| PropagationError::MissingOutput {
                    dependency: reference.service.clone(),
                    output: reference.output.clone(),
                })?,
        };
        rendered.insert(key.clone(), resolved);
    }
    Ok(RenderedConfig(rendered))
}

/// Checks that every reference names a declared dependency whose edge waits
/// for readiness. Outputs only exist once a service is ready, so a reference
/// across a start-only edge could never be rendered.
pub fn validate_references(descriptor: &ServiceDescriptor) -> Result<(), ConfigurationError> {
    for (key, value) in &descriptor.config {
        let ConfigValue::Reference(reference) = value else {
            continue;
        };
        match descriptor.condition_for(&reference.service) {
            None => {
                return Err(ConfigurationError::UndeclaredReference {
                    service: descriptor.id.clone(),
                    key: key.clone(),
                    reference: reference.clone(),
                })
            }
            Some(DependencyCondition::Started) => {
                return Err(ConfigurationError::ReferenceBeforeReady {
                    service: descriptor.id.clone(),
                    key: key.clone(),
                    reference: reference.clone(),
                })
            }
            Some(DependencyCondition::Ready) => {}
        }
    }
    Ok(())
}
