//! In-memory `ClusterAdapter`: keyed by
//! `(namespace, kind, apiVersion, name)`, with watch-callback registration and finalizer
//! callbacks invoked on delete when finalizers remain. Used by tests and by a dry-run
//! watch manager that routes deploys into the same in-memory cluster so that
//! child-controller reconciles can recurse locally.

use crate::adapter::{
    ApplyMethod, ClusterAdapter, ClusterError, OwnerIdentity, QueryOptions, WatchEvent, WatchEventType, WatchStream, WriteOutcome,
};
use crate::kube_adapter::semantically_changed;
use crate::owner_refs::merge_owner_reference;
use async_trait::async_trait;
use oper8_core::resource_id::ResourceId;
use oper8_core::selector::Selector;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;

type ObjectKey = (Option<String>, String, String, String);

/// A callback invoked when a watched-kind object with finalizers remaining is deleted,
/// mirroring the dry-run deploy manager's finalizer-hook contract.
pub type FinalizerCallback = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Default)]
struct Store {
    objects: BTreeMap<ObjectKey, Value>,
    /// Ever-increasing counter standing in for `resourceVersion`.
    next_resource_version: u64,
    finalizer_callbacks: Vec<FinalizerCallback>,
}

pub struct DryRunClusterAdapter {
    store: Mutex<Store>,
    events: broadcast::Sender<(ObjectKey, WatchEvent)>,
}

impl Default for DryRunClusterAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl DryRunClusterAdapter {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self { store: Mutex::new(Store::default()), events }
    }

    /// Register a callback invoked when a finalizer-bearing object is deleted.
    pub fn register_finalizer_callback(&self, callback: FinalizerCallback) {
        self.store.lock().finalizer_callbacks.push(callback);
    }

    fn key_of(manifest: &Value) -> Result<ObjectKey, ClusterError> {
        let kind = manifest.get("kind").and_then(Value::as_str).ok_or_else(|| ClusterError::Malformed("missing kind".to_string()))?;
        let api_version = manifest.get("apiVersion").and_then(Value::as_str).ok_or_else(|| ClusterError::Malformed("missing apiVersion".to_string()))?;
        let name = manifest.pointer("/metadata/name").and_then(Value::as_str).ok_or_else(|| ClusterError::Malformed("missing metadata.name".to_string()))?;
        let namespace = manifest.pointer("/metadata/namespace").and_then(Value::as_str).map(str::to_string);
        Ok((namespace, kind.to_string(), api_version.to_string(), name.to_string()))
    }

    fn stamp_resource_version(store: &mut Store, manifest: &mut Value) {
        store.next_resource_version += 1;
        let rv = store.next_resource_version.to_string();
        if let Some(metadata) = manifest.as_object_mut().and_then(|o| o.get_mut("metadata")).and_then(Value::as_object_mut) {
            metadata.insert("resourceVersion".to_string(), Value::String(rv.clone()));
            metadata.entry("uid").or_insert_with(|| Value::String(format!("dry-run-uid-{rv}")));
        }
    }
}

#[async_trait]
impl ClusterAdapter for DryRunClusterAdapter {
    async fn get(&self, id: &ResourceId) -> Result<Option<Value>, ClusterError> {
        let name = id.name.as_deref().ok_or_else(|| ClusterError::Malformed("get requires a name".to_string()))?;
        let key = (id.namespace.clone(), id.kind.clone(), id.api_version.as_str(), name.to_string());
        Ok(self.store.lock().objects.get(&key).cloned())
    }

    async fn list(&self, api_version: &str, kind: &str, options: &QueryOptions) -> Result<Vec<Value>, ClusterError> {
        let label_selector = options.label_selector.as_deref().map(Selector::parse).transpose().map_err(|e| ClusterError::Malformed(e.to_string()))?;
        let field_selector = options.field_selector.as_deref().map(Selector::parse).transpose().map_err(|e| ClusterError::Malformed(e.to_string()))?;

        let store = self.store.lock();
        let items = store
            .objects
            .iter()
            .filter(|((ns, k, av, _), _)| k == kind && av == api_version && options.namespace.as_ref().map_or(true, |want| ns.as_deref() == Some(want.as_str())))
            .map(|(_, v)| v.clone())
            .filter(|manifest| {
                let labels: BTreeMap<String, String> = manifest
                    .pointer("/metadata/labels")
                    .and_then(Value::as_object)
                    .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string()))).collect())
                    .unwrap_or_default();
                label_selector.as_ref().map_or(true, |s| s.matches_map(&labels)) && field_selector.as_ref().map_or(true, |s| s.matches_manifest(manifest))
            })
            .collect();
        Ok(items)
    }

    async fn watch(
        &self,
        api_version: &str,
        kind: &str,
        options: &QueryOptions,
        _since_resource_version: Option<String>,
    ) -> Result<WatchStream, ClusterError> {
        let mut receiver = self.events.subscribe();
        let api_version = api_version.to_string();
        let kind = kind.to_string();
        let namespace = options.namespace.clone();

        let stream = async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(((ns, k, av, _), event)) => {
                        if k == kind && av == api_version && namespace.as_ref().map_or(true, |want| ns.as_deref() == Some(want.as_str())) {
                            yield Ok(event);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn apply(&self, manifests: &[Value], manage_owner_refs: Option<&OwnerIdentity>, _method: ApplyMethod) -> Result<Vec<WriteOutcome>, ClusterError> {
        let mut outcomes = Vec::with_capacity(manifests.len());
        for manifest in manifests {
            let mut candidate = manifest.clone();
            if let Some(owner) = manage_owner_refs {
                merge_owner_reference(&mut candidate, owner);
            }
            let key = Self::key_of(&candidate)?;

            let mut store = self.store.lock();
            let previous = store.objects.get(&key).cloned();
            let changed = match &previous {
                Some(previous) => semantically_changed(previous, &candidate),
                None => true,
            };
            Self::stamp_resource_version(&mut store, &mut candidate);
            store.objects.insert(key.clone(), candidate.clone());
            drop(store);

            let event_type = if previous.is_none() { WatchEventType::Added } else { WatchEventType::Modified };
            let _ = self.events.send((key, WatchEvent { event_type, resource: candidate }));
            outcomes.push(WriteOutcome { success: true, changed });
        }
        Ok(outcomes)
    }

    async fn disable(&self, manifests: &[Value]) -> Result<Vec<WriteOutcome>, ClusterError> {
        let mut outcomes = Vec::with_capacity(manifests.len());
        for manifest in manifests {
            let key = Self::key_of(manifest)?;
            let mut store = self.store.lock();
            match store.objects.remove(&key) {
                Some(removed) => {
                    let finalizers_remain = removed
                        .pointer("/metadata/finalizers")
                        .and_then(Value::as_array)
                        .is_some_and(|f| !f.is_empty());
                    if finalizers_remain {
                        for callback in &store.finalizer_callbacks {
                            callback(&removed);
                        }
                    }
                    drop(store);
                    let _ = self.events.send((key, WatchEvent { event_type: WatchEventType::Deleted, resource: removed }));
                    outcomes.push(WriteOutcome { success: true, changed: true });
                }
                None => outcomes.push(WriteOutcome { success: true, changed: false }),
            }
        }
        Ok(outcomes)
    }

    async fn set_status(&self, id: &ResourceId, status: &Value) -> Result<WriteOutcome, ClusterError> {
        let name = id.name.as_deref().ok_or_else(|| ClusterError::Malformed("setStatus requires a name".to_string()))?;
        let key = (id.namespace.clone(), id.kind.clone(), id.api_version.as_str(), name.to_string());
        let mut store = self.store.lock();
        let Some(object) = store.objects.get(&key).cloned() else {
            return Ok(WriteOutcome { success: false, changed: false });
        };
        if object.get("status") == Some(status) {
            return Ok(WriteOutcome { success: true, changed: false });
        }
        let mut updated = object;
        updated["status"] = status.clone();
        Self::stamp_resource_version(&mut store, &mut updated);
        store.objects.insert(key.clone(), updated.clone());
        drop(store);
        let _ = self.events.send((key, WatchEvent { event_type: WatchEventType::Modified, resource: updated }));
        Ok(WriteOutcome { success: true, changed: true })
    }

    async fn add_finalizer(&self, id: &ResourceId, name: &str) -> Result<WriteOutcome, ClusterError> {
        let obj_name = id.name.as_deref().ok_or_else(|| ClusterError::Malformed("addFinalizer requires a name".to_string()))?;
        let key = (id.namespace.clone(), id.kind.clone(), id.api_version.as_str(), obj_name.to_string());
        let mut store = self.store.lock();
        let Some(mut object) = store.objects.get(&key).cloned() else {
            return Ok(WriteOutcome { success: false, changed: false });
        };
        let finalizers = object
            .pointer_mut("/metadata/finalizers")
            .and_then(Value::as_array_mut);
        let already = finalizers.as_ref().is_some_and(|f| f.iter().any(|v| v.as_str() == Some(name)));
        if already {
            return Ok(WriteOutcome { success: true, changed: false });
        }
        match object.pointer_mut("/metadata").and_then(Value::as_object_mut) {
            Some(metadata) => {
                let list = metadata.entry("finalizers").or_insert_with(|| Value::Array(Vec::new()));
                if let Some(list) = list.as_array_mut() {
                    list.push(Value::String(name.to_string()));
                }
            }
            None => return Err(ClusterError::Malformed("object has no metadata".to_string())),
        }
        Self::stamp_resource_version(&mut store, &mut object);
        store.objects.insert(key, object);
        Ok(WriteOutcome { success: true, changed: true })
    }

    async fn remove_finalizer(&self, id: &ResourceId, name: &str) -> Result<WriteOutcome, ClusterError> {
        let obj_name = id.name.as_deref().ok_or_else(|| ClusterError::Malformed("removeFinalizer requires a name".to_string()))?;
        let key = (id.namespace.clone(), id.kind.clone(), id.api_version.as_str(), obj_name.to_string());
        let mut store = self.store.lock();
        let Some(mut object) = store.objects.get(&key).cloned() else {
            return Ok(WriteOutcome { success: false, changed: false });
        };
        let Some(metadata) = object.pointer_mut("/metadata").and_then(Value::as_object_mut) else {
            return Ok(WriteOutcome { success: true, changed: false });
        };
        let Some(finalizers) = metadata.get_mut("finalizers").and_then(Value::as_array_mut) else {
            return Ok(WriteOutcome { success: true, changed: false });
        };
        let before = finalizers.len();
        finalizers.retain(|v| v.as_str() != Some(name));
        let changed = finalizers.len() != before;
        if changed {
            Self::stamp_resource_version(&mut store, &mut object);
            store.objects.insert(key, object);
        }
        Ok(WriteOutcome { success: true, changed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest(name: &str) -> Value {
        json!({"kind": "ConfigMap", "apiVersion": "v1", "metadata": {"name": name, "namespace": "ns"}})
    }

    #[tokio::test]
    async fn apply_then_get_round_trips() {
        let adapter = DryRunClusterAdapter::new();
        let outcomes = adapter.apply(&[manifest("a")], None, ApplyMethod::Default).await.unwrap();
        assert!(outcomes[0].changed);
        let id = ResourceId::new("v1", "ConfigMap").within("ns").named("a");
        let fetched = adapter.get(&id).await.unwrap();
        assert!(fetched.is_some());
    }

    #[tokio::test]
    async fn reapplying_identical_manifest_reports_unchanged() {
        let adapter = DryRunClusterAdapter::new();
        adapter.apply(&[manifest("a")], None, ApplyMethod::Default).await.unwrap();
        let outcomes = adapter.apply(&[manifest("a")], None, ApplyMethod::Default).await.unwrap();
        assert!(!outcomes[0].changed);
    }

    #[tokio::test]
    async fn reapplying_with_a_real_data_change_reports_changed() {
        let adapter = DryRunClusterAdapter::new();
        adapter.apply(&[manifest("a")], None, ApplyMethod::Default).await.unwrap();
        let mut updated = manifest("a");
        updated["data"] = json!({"k": "v"});
        let outcomes = adapter.apply(&[updated], None, ApplyMethod::Default).await.unwrap();
        assert!(outcomes[0].changed);
    }

    #[tokio::test]
    async fn disable_missing_object_is_a_no_op_success() {
        let adapter = DryRunClusterAdapter::new();
        let outcomes = adapter.disable(&[manifest("missing")]).await.unwrap();
        assert!(outcomes[0].success);
        assert!(!outcomes[0].changed);
    }

    #[tokio::test]
    async fn finalizer_callback_fires_on_delete_with_remaining_finalizers() {
        let adapter = DryRunClusterAdapter::new();
        let mut m = manifest("a");
        m["metadata"]["finalizers"] = json!(["keep-me"]);
        adapter.apply(&[m.clone()], None, ApplyMethod::Default).await.unwrap();

        let seen = Arc::new(Mutex::new(false));
        let seen2 = seen.clone();
        adapter.register_finalizer_callback(Arc::new(move |_| *seen2.lock() = true));
        adapter.disable(&[m]).await.unwrap();
        assert!(*seen.lock());
    }

    #[tokio::test]
    async fn list_respects_label_selector() {
        let adapter = DryRunClusterAdapter::new();
        let mut m = manifest("a");
        m["metadata"]["labels"] = json!({"tier": "web"});
        adapter.apply(&[m], None, ApplyMethod::Default).await.unwrap();
        let mut other = manifest("b");
        other["metadata"]["labels"] = json!({"tier": "cache"});
        adapter.apply(&[other], None, ApplyMethod::Default).await.unwrap();

        let options = QueryOptions { label_selector: Some("tier=web".to_string()), ..Default::default() };
        let items = adapter.list("v1", "ConfigMap", &options).await.unwrap();
        assert_eq!(items.len(), 1);
    }
}
