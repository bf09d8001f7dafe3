//! Components and the ResourceNodes they own.
//!
//! `Component` renders and verifies its manifests through a trait-object-over-async-fn
//! hook in the style of `kube_runtime::Controller`.

use async_trait::async_trait;
use oper8_core::status::{ComponentOutcome, Failure};
use serde_json::Value;
use std::fmt;

/// Outcome of a Component's `verify` predicate. `NotYet` lets the engine continue past
/// the component while recording it as unverified, rather than failing the reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Verified,
    NotYet,
}

/// A node in a Component's internal DAG. Scoped to its owning
/// Component; declares optional intra-component upstreams for fine-grained ordering
/// beneath the Component-level topological sort.
#[derive(Debug, Clone)]
pub struct ResourceNode {
    pub name: String,
    pub manifest: Value,
    pub upstreams: Vec<String>,
}

impl ResourceNode {
    #[must_use]
    pub fn new(name: impl Into<String>, manifest: Value) -> Self {
        Self { name: name.into(), manifest, upstreams: Vec::new() }
    }

    #[must_use]
    pub fn depends_on(mut self, upstream: impl Into<String>) -> Self {
        self.upstreams.push(upstream.into());
        self
    }

    /// The dotted internal name used by `TemporaryPatch` dispatch:
    /// `<componentName>.<nodeName>`.
    #[must_use]
    pub fn internal_name(&self, component_name: &str) -> String {
        format!("{component_name}.{}", self.name)
    }
}

/// Result of rendering a Component: the set of manifests it wants applied, sealed once
/// the rendering step returns.
#[derive(Debug, Clone, Default)]
pub struct RenderedComponent {
    pub nodes: Vec<ResourceNode>,
}

impl RenderedComponent {
    #[must_use]
    pub fn manifests(&self) -> Vec<Value> {
        self.nodes.iter().map(|n| n.manifest.clone()).collect()
    }
}

/// User-implemented unit of deployment. A Component declares a stable name, a rendering
/// step, a verification predicate, and upstream Component names.
#[async_trait]
pub trait Component: Send + Sync {
    /// Stable name, unique within a Session.
    fn name(&self) -> &str;

    /// Component names that must deploy (or be verified, depending on engine phase)
    /// before this one.
    fn upstreams(&self) -> &[String] {
        &[]
    }

    /// Whether this Component participates in finalization.
    fn finalizes(&self) -> bool {
        false
    }

    /// Render this Component's manifests. Called once per reconcile, before deployment.
    async fn render(&self, ctx: &ComponentContext<'_>) -> Result<RenderedComponent, ComponentError>;

    /// Verify the component has converged after deployment. Returning `NotYet` marks the
    /// Component unverified without failing the reconcile.
    async fn verify(&self, _ctx: &ComponentContext<'_>, _rendered: &RenderedComponent) -> Result<VerifyOutcome, ComponentError> {
        Ok(VerifyOutcome::Verified)
    }
}

/// Read-only context handed to a Component's `render`/`verify` hooks: the owning CR and
/// whatever config the controller needs. Kept deliberately narrow; the engine resolves
/// patches and dependency hashes around the Component, not inside it.
pub struct ComponentContext<'a> {
    pub owner: &'a Value,
    pub namespace: Option<&'a str>,
}

#[derive(Debug, thiserror::Error)]
pub enum ComponentError {
    #[error("config error: {0}")]
    Config(String),
    #[error("precondition not met: {0}")]
    Precondition(String),
    #[error("cluster error: {0}")]
    Cluster(String),
    #[error("unclassified error: {0}")]
    Errored(String),
}

impl ComponentError {
    #[must_use]
    pub fn as_failure(&self) -> Failure {
        match self {
            Self::Config(_) => Failure::ConfigError,
            Self::Precondition(_) => Failure::PreconditionError,
            Self::Cluster(_) => Failure::ClusterError,
            Self::Errored(_) => Failure::Errored,
        }
    }
}

/// Per-component rollout state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutState {
    Pending,
    Deploying,
    Deployed,
    Verifying,
    Verified,
    Unverified,
    Failed(Failure),
    Disabled,
}

impl RolloutState {
    #[must_use]
    pub fn into_outcome(self) -> Option<ComponentOutcome> {
        match self {
            Self::Verified => Some(ComponentOutcome::Verified),
            Self::Unverified => Some(ComponentOutcome::Unverified),
            Self::Disabled => Some(ComponentOutcome::Disabled),
            Self::Failed(f) => Some(ComponentOutcome::Failed(f)),
            Self::Pending | Self::Deploying | Self::Deployed | Self::Verifying => None,
        }
    }
}

impl fmt::Display for RolloutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn internal_name_is_component_dot_node() {
        let node = ResourceNode::new("deployment", json!({}));
        assert_eq!(node.internal_name("web"), "web.deployment");
    }

    #[test]
    fn terminal_states_map_to_outcomes() {
        assert!(matches!(RolloutState::Verified.into_outcome(), Some(ComponentOutcome::Verified)));
        assert!(RolloutState::Deploying.into_outcome().is_none());
    }
}
