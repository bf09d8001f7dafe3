//! "Leader-for-life" strategy: a `ConfigMap` owned by the operator's own `Pod` stands in
//! for the lock; losing the pod garbage-collects the lock.
//!
//! A poll loop fetches the lock `ConfigMap`, checks whether its sole owner reference is
//! this pod's `uid`, and creates it (owned by the pod) if absent, driven by a
//! `tokio::task` rather than a daemon thread.

use super::{LeaderElection, OperatorIdentity};
use async_trait::async_trait;
use oper8_client::owner_refs::merge_owner_reference;
use oper8_client::{ApplyMethod, ClusterAdapter, OwnerIdentity};
use oper8_core::config::LeaderElectionConfig;
use oper8_core::resource_id::ResourceId;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum LeaderForLifeError {
    #[error("unable to fetch operator pod {namespace}/{pod_name}: leader-for-life requires its ownerReference")]
    PodNotFound { namespace: String, pod_name: String },
}

pub struct LeaderForLife {
    is_leader: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl LeaderForLife {
    /// Fetch the operator's own Pod (for its owner-reference `uid`) and start the
    /// background renewal loop.
    pub async fn new(adapter: Arc<dyn ClusterAdapter>, config: LeaderElectionConfig) -> Result<Self, LeaderForLifeError> {
        let identity = OperatorIdentity::from_env(config.namespace.as_deref());
        let pod_id = ResourceId::new("v1", "Pod").within(identity.namespace.clone()).named(identity.pod_name.clone());
        let pod = adapter
            .get(&pod_id)
            .await
            .ok()
            .flatten()
            .ok_or_else(|| LeaderForLifeError::PodNotFound { namespace: identity.namespace.clone(), pod_name: identity.pod_name.clone() })?;

        let pod_uid = pod.pointer("/metadata/uid").and_then(serde_json::Value::as_str).unwrap_or_default().to_string();
        let pod_owner = OwnerIdentity {
            api_version: "v1".to_string(),
            kind: "Pod".to_string(),
            name: identity.pod_name.clone(),
            uid: pod_uid,
            namespace: Some(identity.namespace.clone()),
        };

        let is_leader = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(Notify::new());

        let task = tokio::spawn(run_loop(adapter, config, pod_owner, Arc::clone(&is_leader), Arc::clone(&shutdown)));

        Ok(Self { is_leader, shutdown, task: Some(task) })
    }
}

async fn run_loop(
    adapter: Arc<dyn ClusterAdapter>,
    config: LeaderElectionConfig,
    pod_owner: OwnerIdentity,
    is_leader: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
) {
    let lock_id = ResourceId::new("v1", "ConfigMap").within(config.namespace.clone().unwrap_or_default()).named(config.lock_name.clone());
    loop {
        renew_or_acquire(adapter.as_ref(), &lock_id, &config, &pod_owner, &is_leader).await;
        tokio::select! {
            _ = tokio::time::sleep(config.poll_interval) => {}
            () = shutdown.notified() => return,
        }
    }
}

async fn renew_or_acquire(adapter: &dyn ClusterAdapter, lock_id: &ResourceId, config: &LeaderElectionConfig, pod_owner: &OwnerIdentity, is_leader: &AtomicBool) {
    let current = match adapter.get(lock_id).await {
        Ok(current) => current,
        Err(err) => {
            warn!(%err, "unable to fetch leader-for-life lock ConfigMap");
            return;
        }
    };

    match current {
        Some(cm) => {
            let owners = cm.pointer("/metadata/ownerReferences").and_then(serde_json::Value::as_array);
            let holder_uid = owners.filter(|o| o.len() == 1).and_then(|o| o[0].get("uid")).and_then(serde_json::Value::as_str);
            if holder_uid == Some(pod_owner.uid.as_str()) {
                is_leader.store(true, Ordering::SeqCst);
            } else {
                debug!(?holder_uid, "leader-for-life lock held by another pod");
                is_leader.store(false, Ordering::SeqCst);
            }
        }
        None => {
            let mut manifest = json!({
                "kind": "ConfigMap",
                "apiVersion": "v1",
                "metadata": {"name": config.lock_name, "namespace": config.namespace},
            });
            merge_owner_reference(&mut manifest, pod_owner);
            match adapter.apply(&[manifest], None, ApplyMethod::Default).await {
                Ok(_) => {
                    info!(lock = %config.lock_name, "created leader-for-life lock ConfigMap");
                    is_leader.store(true, Ordering::SeqCst);
                }
                Err(err) => {
                    error!(%err, "unable to create leader-for-life lock ConfigMap");
                    is_leader.store(false, Ordering::SeqCst);
                }
            }
        }
    }
}

#[async_trait]
impl LeaderElection for LeaderForLife {
    async fn acquire(&self, force: bool) -> bool {
        if force {
            self.is_leader.store(true, Ordering::SeqCst);
            return true;
        }
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Leadership is global under this strategy; any resource waits on the same flag.
    async fn acquire_resource(&self, _resource: &ResourceId) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    async fn release(&self) {
        self.is_leader.store(false, Ordering::SeqCst);
    }

    async fn release_resource(&self, _resource: &ResourceId) {}

    async fn is_leader(&self, _resource: Option<&ResourceId>) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }
}

impl Drop for LeaderForLife {
    fn drop(&mut self) {
        self.shutdown.notify_waiters();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oper8_client::DryRunClusterAdapter;
    use serde_json::json;

    async fn adapter_with_pod(namespace: &str, pod_name: &str) -> Arc<dyn ClusterAdapter> {
        let adapter: Arc<dyn ClusterAdapter> = Arc::new(DryRunClusterAdapter::new());
        let pod = json!({
            "kind": "Pod", "apiVersion": "v1",
            "metadata": {"name": pod_name, "namespace": namespace},
        });
        adapter.apply(&[pod], None, ApplyMethod::Default).await.unwrap();
        adapter
    }

    #[tokio::test]
    async fn new_fails_without_a_discoverable_pod() {
        let adapter: Arc<dyn ClusterAdapter> = Arc::new(DryRunClusterAdapter::new());
        let config = LeaderElectionConfig { namespace: Some("ns".to_string()), ..LeaderElectionConfig::default() };
        std::env::set_var("OPER8_POD_NAME", "missing-pod");
        let result = LeaderForLife::new(adapter, config).await;
        std::env::remove_var("OPER8_POD_NAME");
        assert!(matches!(result, Err(LeaderForLifeError::PodNotFound { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn creates_and_owns_the_lock_configmap() {
        std::env::set_var("OPER8_POD_NAME", "op-pod");
        let adapter = adapter_with_pod("ns", "op-pod").await;
        let config = LeaderElectionConfig {
            namespace: Some("ns".to_string()),
            poll_interval: std::time::Duration::from_secs(1),
            ..LeaderElectionConfig::default()
        };
        let election = LeaderForLife::new(Arc::clone(&adapter), config).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(election.is_leader(None).await);
        std::env::remove_var("OPER8_POD_NAME");
    }
}
