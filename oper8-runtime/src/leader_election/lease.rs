//! "Leader-with-lease" strategy: a `coordination.k8s.io/v1` `Lease` object tracks the
//! current holder, renewed on a poll interval.
//!
//! Acquire/renew works by writing `holderIdentity`/`renewTime`, bumping
//! `leaseTransitions` on takeover, styled after `kube_runtime::lease::Elector`'s
//! acquire/renew/expiry state machine (`LeaseState::{Unheld,HeldBySelf,HeldByOther}`) —
//! adapted from a typed `Api<Lease>` + watch stream to this framework's
//! `ClusterAdapter`-over-`Value` poll loop, since the adapter has no typed Lease accessor.

use super::{LeaderElection, OperatorIdentity};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oper8_client::{ApplyMethod, ClusterAdapter};
use oper8_core::config::LeaderElectionConfig;
use oper8_core::resource_id::ResourceId;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct LeaderWithLease {
    is_leader: Arc<AtomicBool>,
    lease_transitions: Arc<std::sync::atomic::AtomicU64>,
    shutdown: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl LeaderWithLease {
    #[must_use]
    pub fn new(adapter: Arc<dyn ClusterAdapter>, config: LeaderElectionConfig) -> Self {
        let identity = OperatorIdentity::from_env(config.namespace.as_deref());
        let is_leader = Arc::new(AtomicBool::new(false));
        let lease_transitions = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let shutdown = Arc::new(Notify::new());

        let task = tokio::spawn(run_loop(
            adapter,
            config,
            identity,
            Arc::clone(&is_leader),
            Arc::clone(&lease_transitions),
            Arc::clone(&shutdown),
        ));

        Self { is_leader, lease_transitions, shutdown, task: Some(task) }
    }

    /// Number of times holder identity has changed on this lease, incremented on every
    /// takeover.
    #[must_use]
    pub fn lease_transitions(&self) -> u64 {
        self.lease_transitions.load(Ordering::SeqCst)
    }
}

enum LeaseState {
    Unheld,
    HeldBySelf,
    HeldByOther { expires_at: DateTime<Utc> },
}

fn lease_state(spec: &Value, identity: &str, now: DateTime<Utc>) -> LeaseState {
    let Some(holder) = spec.get("holderIdentity").and_then(Value::as_str) else {
        return LeaseState::Unheld;
    };
    if holder == identity {
        return LeaseState::HeldBySelf;
    }
    let renew_time = spec.get("renewTime").and_then(Value::as_str).and_then(|s| DateTime::parse_from_rfc3339(s).ok()).map(|dt| dt.with_timezone(&Utc));
    let lease_duration_secs = spec.get("leaseDurationSeconds").and_then(Value::as_i64).unwrap_or(0);
    let expires_at = renew_time.unwrap_or(now) + chrono::Duration::seconds(lease_duration_secs);
    LeaseState::HeldByOther { expires_at }
}

async fn run_loop(
    adapter: Arc<dyn ClusterAdapter>,
    config: LeaderElectionConfig,
    identity: OperatorIdentity,
    is_leader: Arc<AtomicBool>,
    lease_transitions: Arc<std::sync::atomic::AtomicU64>,
    shutdown: Arc<Notify>,
) {
    let lease_id = ResourceId::new("coordination.k8s.io/v1", "Lease").within(config.namespace.clone().unwrap_or_default()).named(config.lock_name.clone());
    loop {
        renew_or_acquire(adapter.as_ref(), &lease_id, &config, &identity, &is_leader, &lease_transitions).await;
        tokio::select! {
            _ = tokio::time::sleep(config.poll_interval) => {}
            () = shutdown.notified() => return,
        }
    }
}

async fn renew_or_acquire(
    adapter: &dyn ClusterAdapter,
    lease_id: &ResourceId,
    config: &LeaderElectionConfig,
    identity: &OperatorIdentity,
    is_leader: &AtomicBool,
    lease_transitions: &std::sync::atomic::AtomicU64,
) {
    let now = Utc::now();
    let current = match adapter.get(lease_id).await {
        Ok(current) => current,
        Err(err) => {
            warn!(%err, "unable to fetch leader lease");
            return;
        }
    };

    let spec = current.as_ref().and_then(|c| c.get("spec")).cloned().unwrap_or(Value::Null);
    let mut transitions = spec.get("leaseTransitions").and_then(Value::as_u64).unwrap_or(0);
    let mut acquire_time = spec.get("acquireTime").and_then(Value::as_str).map(str::to_string);

    match lease_state(&spec, &identity.pod_name, now) {
        LeaseState::HeldByOther { expires_at } if expires_at > now => {
            is_leader.store(false, Ordering::SeqCst);
            return;
        }
        LeaseState::HeldByOther { .. } => {
            info!(lock = %config.lock_name, "taking over expired lease");
            transitions += 1;
            acquire_time = Some(now.to_rfc3339());
        }
        LeaseState::Unheld => {
            transitions += 1;
            acquire_time = Some(now.to_rfc3339());
        }
        LeaseState::HeldBySelf => {}
    }

    let manifest = json!({
        "kind": "Lease",
        "apiVersion": "coordination.k8s.io/v1",
        "metadata": {"name": config.lock_name, "namespace": config.namespace},
        "spec": {
            "holderIdentity": identity.pod_name,
            "acquireTime": acquire_time,
            "renewTime": now.to_rfc3339(),
            "leaseDurationSeconds": config.lease_duration.as_secs(),
            "leaseTransitions": transitions,
        },
    });

    match adapter.apply(&[manifest], None, ApplyMethod::Default).await {
        Ok(_) => {
            lease_transitions.store(transitions, Ordering::SeqCst);
            is_leader.store(true, Ordering::SeqCst);
        }
        Err(err) => {
            warn!(%err, "unable to acquire/renew leader lease");
            is_leader.store(false, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl LeaderElection for LeaderWithLease {
    async fn acquire(&self, force: bool) -> bool {
        if force {
            self.is_leader.store(true, Ordering::SeqCst);
            return true;
        }
        self.is_leader.load(Ordering::SeqCst)
    }

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

impl Drop for LeaderWithLease {
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
    use std::time::Duration;

    fn config(namespace: &str, duration: Duration) -> LeaderElectionConfig {
        LeaderElectionConfig {
            namespace: Some(namespace.to_string()),
            poll_interval: Duration::from_secs(1),
            lease_duration: duration,
            lock_name: "oper8-leader".to_string(),
            ..LeaderElectionConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn a_lone_contender_becomes_leader() {
        std::env::set_var("OPER8_POD_NAME", "pod-a");
        let adapter: Arc<dyn ClusterAdapter> = Arc::new(DryRunClusterAdapter::new());
        let election = LeaderWithLease::new(Arc::clone(&adapter), config("ns", Duration::from_secs(30)));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(election.is_leader(None).await);
        assert_eq!(election.lease_transitions(), 1);
        std::env::remove_var("OPER8_POD_NAME");
    }

    #[tokio::test(start_paused = true)]
    async fn a_second_contender_is_denied_while_lease_is_live() {
        std::env::set_var("OPER8_POD_NAME", "pod-a");
        let adapter: Arc<dyn ClusterAdapter> = Arc::new(DryRunClusterAdapter::new());
        let first = LeaderWithLease::new(Arc::clone(&adapter), config("ns", Duration::from_secs(30)));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(first.is_leader(None).await);

        std::env::set_var("OPER8_POD_NAME", "pod-b");
        let second = LeaderWithLease::new(Arc::clone(&adapter), config("ns", Duration::from_secs(30)));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!second.is_leader(None).await);
        std::env::remove_var("OPER8_POD_NAME");
    }
}
