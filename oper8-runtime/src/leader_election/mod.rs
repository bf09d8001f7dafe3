//! Pluggable leader election: a uniform contract with four implementations selected by
//! [`oper8_core::config::LeaderElectionMode`].
//!
//! Implementations that renew in the background loop `renew_or_acquire` on a poll
//! interval and expose an atomically-readable `is_leader`, reproduced here as a
//! `tokio::task` plus an `AtomicBool` rather than a daemon thread.

pub mod annotation;
pub mod configmap;
pub mod disabled;
pub mod lease;

pub use annotation::AnnotationLeaderElection;
pub use configmap::LeaderForLife;
pub use disabled::DisabledLeaderElection;
pub use lease::LeaderWithLease;

use async_trait::async_trait;
use oper8_core::resource_id::ResourceId;

/// Uniform leader-election contract. Implementations that run a background
/// renewal task are singletons per process and must release that task's resources when
/// dropped.
#[async_trait]
pub trait LeaderElection: Send + Sync {
    /// Attempt to become (or remain) the global leader. `force` shortcuts any wait and is
    /// used on shutdown paths where the caller needs an immediate answer.
    async fn acquire(&self, force: bool) -> bool;

    /// Attempt to acquire a per-resource lease for `resource`.
    async fn acquire_resource(&self, resource: &ResourceId) -> bool;

    async fn release(&self);
    async fn release_resource(&self, resource: &ResourceId);

    /// Query current leadership, optionally scoped to a specific resource.
    async fn is_leader(&self, resource: Option<&ResourceId>) -> bool;
}

/// This operator instance's identity: the pod name it should claim leases under, and the
/// namespace it runs in. Prefers explicit environment variables (as the downward API
/// would set them), falling back to the local hostname for the identity and to the
/// configured lock namespace otherwise.
#[derive(Debug, Clone)]
pub struct OperatorIdentity {
    pub pod_name: String,
    pub namespace: String,
}

impl OperatorIdentity {
    #[must_use]
    pub fn from_env(configured_namespace: Option<&str>) -> Self {
        let pod_name = std::env::var("OPER8_POD_NAME")
            .or_else(|_| std::env::var("POD_NAME"))
            .unwrap_or_else(|_| {
                hostname::get()
                    .ok()
                    .and_then(|h| h.into_string().ok())
                    .map(|h| h.split('.').next().unwrap_or(&h).to_string())
                    .unwrap_or_else(|| "unknown-pod".to_string())
            });
        let namespace = std::env::var("OPER8_OPERATOR_NAMESPACE")
            .ok()
            .or_else(|| configured_namespace.map(str::to_string))
            .unwrap_or_else(|| "default".to_string());
        Self { pod_name, namespace }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_configured_namespace_when_env_unset() {
        std::env::remove_var("OPER8_OPERATOR_NAMESPACE");
        let identity = OperatorIdentity::from_env(Some("configured-ns"));
        assert_eq!(identity.namespace, "configured-ns");
    }
}
