//! `WatchDispatcher`: turns raw watch events into filtered [`ReconcileRequest`]s for the
//! scheduler.
//!
//! One `WatchedResource` entry is kept per live resource, holding a per-requester
//! [`FilterNode`] instance so filter state (last-seen generation, annotation hash, ...)
//! survives across events for that resource; a [`WatchRequest`] records who asked to be
//! notified about a kind/namespace and which controller to reconcile when the filter
//! passes.

use crate::filters::FilterNode;
use chrono::{DateTime, Utc};
use oper8_client::{WatchEvent, WatchEventType};
use oper8_core::managed_object::ManagedObject;
use oper8_core::resource_id::ResourceId;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Builds a fresh, resource-scoped filter pipeline. Called once the first time a
/// `WatchDispatcher` sees a resource a `WatchRequest` cares about: a unique `Filter`
/// instance is created for each resource.
pub type FilterFactory = Arc<dyn Fn(&ManagedObject) -> FilterNode + Send + Sync>;

/// A standing request to be notified about a kind/namespace, made either by a
/// controller watching its own primary resource or by a Component declaring a dependent.
#[derive(Clone)]
pub struct WatchRequest {
    /// The collection being watched: kind + namespace, no name.
    pub watched: ResourceId,
    /// The resource that registered this request: the controller's own CR for a primary
    /// watch, or the owning CR for a dependent watch.
    pub requester: ResourceId,
    /// `group/version/Kind` of the controller to reconcile when this request's filter
    /// passes, matched against [`crate::controller::Controller::group`]/`version`/`kind`.
    pub controller_global_id: String,
    pub filters: FilterFactory,
}

impl PartialEq for WatchRequest {
    fn eq(&self, other: &Self) -> bool {
        self.watched == other.watched && self.requester == other.requester && self.controller_global_id == other.controller_global_id
    }
}
impl Eq for WatchRequest {}

/// Live bookkeeping for one resource this dispatcher has seen at least one event for:
/// a stateful filter pipeline per requester (keyed by the requester's fully-qualified
/// name, or `"default"` for a controller's own primary watch).
#[derive(Default)]
struct WatchedResource {
    filters: HashMap<String, FilterNode>,
}

const DEFAULT_REQUESTER_KEY: &str = "default";

/// Reason a reconcile was requested: either a real watch event, or one of the
/// framework-internal triggers (requeue, periodic resync, dependent-resource change).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileReason {
    Event(WatchEventType),
    Requeued,
    Periodic,
    Dependent,
}

/// A single unit of work handed to the scheduler.
#[derive(Debug, Clone)]
pub struct ReconcileRequest {
    pub controller_global_id: String,
    pub reason: ReconcileReason,
    pub resource: ManagedObject,
    pub timestamp: DateTime<Utc>,
}

impl ReconcileRequest {
    #[must_use]
    pub fn uid(&self) -> Option<&str> {
        self.resource.uid()
    }
}

/// Dispatches events for one watched kind: a `WatchDispatcher` is created per
/// `(apiVersion, kind, namespace)` combination. Holds the standing `WatchRequest`s
/// registered for this kind and the per-resource filter state accumulated from events.
#[derive(Default)]
pub struct WatchDispatcher {
    requests: Vec<WatchRequest>,
    watched: HashMap<String, WatchedResource>,
}

impl WatchDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, request: WatchRequest) {
        if !self.requests.contains(&request) {
            self.requests.push(request);
        }
    }

    pub fn deregister(&mut self, requester: &ResourceId, controller_global_id: &str) {
        self.requests
            .retain(|r| !(r.requester == *requester && r.controller_global_id == controller_global_id));
    }

    /// Run `event` through every registered request's filter pipeline, returning one
    /// [`ReconcileRequest`] per request whose filter passes.
    pub fn dispatch(&mut self, event: &WatchEvent, now: DateTime<Utc>) -> Vec<ReconcileRequest> {
        let resource = match ManagedObject::from_manifest(event.resource.clone()) {
            Ok(resource) => resource,
            Err(error) => {
                trace!(%error, "dropping malformed watch event");
                return Vec::new();
            }
        };

        let owners = owner_resource_ids(&resource);
        let mut out = Vec::new();

        for request in self.requests.clone() {
            // A primary-watch request (requester has no name, meaning "any resource of
            // this kind in this namespace") always matches; a dependent-watch request
            // only matches resources owned by its requester.
            let is_primary = request.requester.name.is_none();
            if !is_primary && !owners.iter().any(|o| o == &request.requester) {
                continue;
            }

            let requester_key = request.requester.named_id().unwrap_or_else(|| DEFAULT_REQUESTER_KEY.to_string());
            let watched_entry = self.watched.entry(resource.identity_key()).or_default();
            let pipeline = watched_entry.filters.entry(requester_key).or_insert_with(|| (request.filters)(&resource));

            if pipeline.update_and_test(&resource, event.event_type) {
                debug!(controller = %request.controller_global_id, resource = %resource, "dispatching reconcile");
                out.push(ReconcileRequest {
                    controller_global_id: request.controller_global_id.clone(),
                    reason: ReconcileReason::Event(event.event_type),
                    resource: resource.clone(),
                    timestamp: now,
                });
            }
        }

        if event.event_type == WatchEventType::Deleted {
            self.forget(&resource);
        }

        out
    }

    /// Drop cached filter state for a resource. Called once its watch's `Deleted` event
    /// has been dispatched so filter memory doesn't grow unbounded across cluster churn.
    pub fn forget(&mut self, resource: &ManagedObject) {
        self.watched.remove(&resource.identity_key());
    }
}

fn owner_resource_ids(resource: &ManagedObject) -> Vec<ResourceId> {
    let Some(owners) = resource.metadata().get("ownerReferences").and_then(|v| v.as_array().cloned()) else {
        return Vec::new();
    };
    owners
        .iter()
        .filter_map(|owner| {
            let api_version = owner.get("apiVersion")?.as_str()?;
            let kind = owner.get("kind")?.as_str()?;
            let name = owner.get("name")?.as_str()?;
            let mut id = ResourceId::new(api_version, kind).named(name);
            if let Some(ns) = resource.namespace() {
                id = id.within(ns);
            }
            Some(id)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::builtin::EnableFilter;
    use serde_json::json;

    fn watch_event(event_type: WatchEventType, resource: serde_json::Value) -> WatchEvent {
        WatchEvent { event_type, resource }
    }

    #[test]
    fn primary_watch_request_matches_every_resource_of_its_kind() {
        let mut dispatcher = WatchDispatcher::new();
        dispatcher.register(WatchRequest {
            watched: ResourceId::new("example.com/v1", "Widget").within("default"),
            requester: ResourceId::new("example.com/v1", "Widget").within("default"),
            controller_global_id: "Widget.v1.example.com".to_string(),
            filters: Arc::new(|_| FilterNode::leaf(EnableFilter)),
        });

        let event = watch_event(
            WatchEventType::Added,
            json!({"apiVersion": "example.com/v1", "kind": "Widget", "metadata": {"name": "a", "namespace": "default"}}),
        );
        let requests = dispatcher.dispatch(&event, Utc::now());
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].controller_global_id, "Widget.v1.example.com");
    }

    #[test]
    fn dependent_watch_request_only_matches_owned_resources() {
        let mut dispatcher = WatchDispatcher::new();
        let owner = ResourceId::new("example.com/v1", "Widget").within("default").named("demo");
        dispatcher.register(WatchRequest {
            watched: ResourceId::new("v1", "ConfigMap").within("default"),
            requester: owner.clone(),
            controller_global_id: "Widget.v1.example.com".to_string(),
            filters: Arc::new(|_| FilterNode::leaf(EnableFilter)),
        });

        let unowned = watch_event(
            WatchEventType::Added,
            json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "other", "namespace": "default"}}),
        );
        assert!(dispatcher.dispatch(&unowned, Utc::now()).is_empty());

        let owned = watch_event(
            WatchEventType::Added,
            json!({
                "apiVersion": "v1", "kind": "ConfigMap",
                "metadata": {
                    "name": "demo-config", "namespace": "default",
                    "ownerReferences": [{"apiVersion": "example.com/v1", "kind": "Widget", "name": "demo", "uid": "u1"}]
                }
            }),
        );
        let requests = dispatcher.dispatch(&owned, Utc::now());
        assert_eq!(requests.len(), 1);
    }

    #[test]
    fn deleted_event_drops_the_watched_entry_after_dispatch() {
        let mut dispatcher = WatchDispatcher::new();
        dispatcher.register(WatchRequest {
            watched: ResourceId::new("example.com/v1", "Widget").within("default"),
            requester: ResourceId::new("example.com/v1", "Widget").within("default"),
            controller_global_id: "Widget.v1.example.com".to_string(),
            filters: Arc::new(|_| FilterNode::leaf(EnableFilter)),
        });

        let manifest = json!({"apiVersion": "example.com/v1", "kind": "Widget", "metadata": {"name": "a", "namespace": "default"}});
        dispatcher.dispatch(&watch_event(WatchEventType::Added, manifest.clone()), Utc::now());
        assert_eq!(dispatcher.watched.len(), 1);

        let requests = dispatcher.dispatch(&watch_event(WatchEventType::Deleted, manifest), Utc::now());
        assert_eq!(requests.len(), 1);
        assert!(dispatcher.watched.is_empty());
    }
}
