//! "Annotation" strategy: leadership is tracked per-resource via two annotations on the
//! owning custom resource itself, rather than via one shared lock object — horizontally
//! scalable since different operator replicas can each own disjoint resources.
//!
//! `acquire_resource` refetches the resource, stamps `lease-name`/`lease-time` annotations
//! if unclaimed, already ours, or expired, and writes it back; `acquire()`/`release()`/
//! `is_leader(None)` are no-ops that always report true, since leadership has no global
//! meaning under this strategy.

use super::LeaderElection;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oper8_client::{ApplyMethod, ClusterAdapter};
use oper8_core::resource_id::ResourceId;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub const LEASE_NAME_ANNOTATION: &str = "oper8.dev/lease-name";
pub const LEASE_TIME_ANNOTATION: &str = "oper8.dev/lease-time";

pub struct AnnotationLeaderElection {
    adapter: Arc<dyn ClusterAdapter>,
    pod_name: String,
    lease_duration: Duration,
}

impl AnnotationLeaderElection {
    #[must_use]
    pub fn new(adapter: Arc<dyn ClusterAdapter>, lease_duration: Duration) -> Self {
        let pod_name = super::OperatorIdentity::from_env(None).pod_name;
        Self { adapter, pod_name, lease_duration }
    }

    fn lease_still_valid(&self, lease_time: &str, now: DateTime<Utc>) -> bool {
        DateTime::parse_from_rfc3339(lease_time).map(|t| now < t.with_timezone(&Utc) + chrono::Duration::from_std(self.lease_duration).unwrap_or_default()).unwrap_or(false)
    }
}

#[async_trait]
impl LeaderElection for AnnotationLeaderElection {
    /// Leadership is per-resource under this strategy; the global query is moot.
    async fn acquire(&self, _force: bool) -> bool {
        true
    }

    async fn acquire_resource(&self, resource: &ResourceId) -> bool {
        let Ok(Some(mut current)) = self.adapter.get(resource).await else {
            warn!(%resource, "unable to fetch resource for annotation-based leadership");
            return false;
        };

        let now = Utc::now();
        let claimed = {
            let Some(annotations) = current
                .pointer_mut("/metadata")
                .and_then(|m| m.as_object_mut())
                .map(|m| m.entry("annotations").or_insert_with(|| serde_json::json!({})))
                .and_then(|a| a.as_object_mut())
            else {
                return false;
            };

            let held_by = annotations.get(LEASE_NAME_ANNOTATION).and_then(serde_json::Value::as_str).map(str::to_string);
            let lease_time = annotations.get(LEASE_TIME_ANNOTATION).and_then(serde_json::Value::as_str).map(str::to_string);

            match (&held_by, &lease_time) {
                (None, _) => {
                    annotations.insert(LEASE_NAME_ANNOTATION.to_string(), self.pod_name.clone().into());
                    annotations.insert(LEASE_TIME_ANNOTATION.to_string(), now.to_rfc3339().into());
                    true
                }
                (Some(holder), _) if holder == &self.pod_name => {
                    annotations.insert(LEASE_TIME_ANNOTATION.to_string(), now.to_rfc3339().into());
                    true
                }
                (Some(_), Some(lease_time)) if !self.lease_still_valid(lease_time, now) => {
                    annotations.insert(LEASE_NAME_ANNOTATION.to_string(), self.pod_name.clone().into());
                    annotations.insert(LEASE_TIME_ANNOTATION.to_string(), now.to_rfc3339().into());
                    true
                }
                _ => false,
            }
        };

        if !claimed {
            return false;
        }
        self.write_back(current).await
    }

    async fn release(&self) {}

    async fn release_resource(&self, resource: &ResourceId) {
        let Ok(Some(mut current)) = self.adapter.get(resource).await else {
            return;
        };
        let held_by = current.pointer(&format!("/metadata/annotations/{}", LEASE_NAME_ANNOTATION.replace('/', "~1"))).and_then(serde_json::Value::as_str);
        if held_by != Some(self.pod_name.as_str()) {
            return;
        }
        if let Some(annotations) = current.pointer_mut("/metadata/annotations").and_then(|a| a.as_object_mut()) {
            annotations.remove(LEASE_NAME_ANNOTATION);
            annotations.remove(LEASE_TIME_ANNOTATION);
        }
        let _ = self.write_back(current).await;
    }

    /// With no resource given, leadership is moot under this strategy and always reports true.
    async fn is_leader(&self, resource: Option<&ResourceId>) -> bool {
        let Some(resource) = resource else {
            return true;
        };
        let Ok(Some(current)) = self.adapter.get(resource).await else {
            return false;
        };
        let annotations = current.pointer("/metadata/annotations");
        let held_by = annotations.and_then(|a| a.get(LEASE_NAME_ANNOTATION)).and_then(serde_json::Value::as_str);
        let lease_time = annotations.and_then(|a| a.get(LEASE_TIME_ANNOTATION)).and_then(serde_json::Value::as_str);
        held_by == Some(self.pod_name.as_str()) && lease_time.is_some_and(|t| self.lease_still_valid(t, Utc::now()))
    }
}

impl AnnotationLeaderElection {
    async fn write_back(&self, manifest: serde_json::Value) -> bool {
        match self.adapter.apply(&[manifest], None, ApplyMethod::Update).await {
            Ok(_) => true,
            Err(err) => {
                warn!(%err, "unable to update leadership annotations");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oper8_client::DryRunClusterAdapter;
    use serde_json::json;

    fn resource_id() -> ResourceId {
        ResourceId::new("widgets.example.com/v1", "Widget").within("ns".to_string()).named("my-widget".to_string())
    }

    async fn seeded_adapter() -> Arc<dyn ClusterAdapter> {
        let adapter: Arc<dyn ClusterAdapter> = Arc::new(DryRunClusterAdapter::new());
        let cr = json!({
            "kind": "Widget", "apiVersion": "widgets.example.com/v1",
            "metadata": {"name": "my-widget", "namespace": "ns"},
        });
        adapter.apply(&[cr], None, ApplyMethod::Default).await.unwrap();
        adapter
    }

    #[tokio::test]
    async fn claims_an_unowned_resource() {
        std::env::set_var("OPER8_POD_NAME", "pod-a");
        let adapter = seeded_adapter().await;
        let election = AnnotationLeaderElection::new(Arc::clone(&adapter), Duration::from_secs(30));
        assert!(election.acquire_resource(&resource_id()).await);
        assert!(election.is_leader(Some(&resource_id())).await);
        std::env::remove_var("OPER8_POD_NAME");
    }

    #[tokio::test]
    async fn a_second_pod_cannot_claim_a_live_lease() {
        let adapter = seeded_adapter().await;

        std::env::set_var("OPER8_POD_NAME", "pod-a");
        let first = AnnotationLeaderElection::new(Arc::clone(&adapter), Duration::from_secs(30));
        assert!(first.acquire_resource(&resource_id()).await);

        std::env::set_var("OPER8_POD_NAME", "pod-b");
        let second = AnnotationLeaderElection::new(Arc::clone(&adapter), Duration::from_secs(30));
        assert!(!second.acquire_resource(&resource_id()).await);
        std::env::remove_var("OPER8_POD_NAME");
    }

    #[tokio::test]
    async fn global_acquire_and_is_leader_are_always_true() {
        let adapter: Arc<dyn ClusterAdapter> = Arc::new(DryRunClusterAdapter::new());
        let election = AnnotationLeaderElection::new(adapter, Duration::from_secs(30));
        assert!(election.acquire(false).await);
        assert!(election.is_leader(None).await);
    }
}
