//! The real `ClusterAdapter`, backed by the published `kube`/`k8s-openapi` crates rather
//! than a vendored client. Dynamic objects are used throughout since the framework
//! operates on arbitrary component-rendered manifests, not a fixed set of typed resources.

use crate::adapter::{
    ApplyMethod, ClusterAdapter, ClusterError, OwnerIdentity, QueryOptions, RetryPolicy, WatchEvent, WatchEventType, WatchStream, WriteOutcome,
};
use crate::owner_refs::merge_owner_reference;
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use futures::{StreamExt, TryStreamExt};
use kube::api::{Api, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams, PostParams, WatchEvent as KubeWatchEvent, WatchParams};
use kube::core::{ApiResource, ObjectMeta};
use kube::discovery;
use kube::{Client, ResourceExt};
use oper8_core::resource_id::ResourceId;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

const MANAGED_FIELD_MANAGER: &str = "oper8";

pub struct KubeClusterAdapter {
    client: Client,
    retry: RetryPolicy,
    /// Single global status-update mutex, serialized per adapter to avoid concurrent
    /// `409`s on the status subresource.
    status_lock: Arc<AsyncMutex<()>>,
    /// When `Default` apply hits an immutable-field conflict or a `422`, fall back to PUT.
    fallback_to_replace: bool,
}

impl KubeClusterAdapter {
    #[must_use]
    pub fn new(client: Client, retry: RetryPolicy) -> Self {
        Self {
            client,
            retry,
            status_lock: Arc::new(AsyncMutex::new(())),
            fallback_to_replace: true,
        }
    }

    async fn resolve_api_resource(&self, api_version: &str, kind: &str) -> Result<ApiResource, ClusterError> {
        let gvk = GroupVersionKind::try_from(format!("{api_version}/{kind}").as_str())
            .or_else(|_| {
                let (group, version) = match api_version.split_once('/') {
                    Some((g, v)) => (g, v),
                    None => ("", api_version),
                };
                Ok::<_, ClusterError>(GroupVersionKind::gvk(group, version, kind))
            })?;
        let (api_resource, _capabilities) = discovery::oneshot::pinned_kind(&self.client, &gvk)
            .await
            .map_err(|e| ClusterError::Transient(format!("discovery failed for {kind}.{api_version}: {e}")))?;
        Ok(api_resource)
    }

    fn dynamic_api(&self, api_resource: ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &api_resource),
            None => Api::all_with(self.client.clone(), &api_resource),
        }
    }

    async fn api_for(&self, id: &ResourceId) -> Result<Api<DynamicObject>, ClusterError> {
        let api_resource = self.resolve_api_resource(&id.api_version.as_str(), &id.kind).await?;
        Ok(self.dynamic_api(api_resource, id.namespace.as_deref()))
    }

    fn list_params(options: &QueryOptions) -> ListParams {
        let mut params = ListParams::default();
        if let Some(ls) = &options.label_selector {
            params = params.labels(ls);
        }
        if let Some(fs) = &options.field_selector {
            params = params.fields(fs);
        }
        params
    }

    /// Retry a write with bounded exponential backoff on `409 Conflict` and `5xx`
    /// responses; `403` is classified permanent, anything else permanent-transient.
    async fn retry_write<F, Fut>(&self, op: F) -> Result<DynamicObject, ClusterError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<DynamicObject, kube::Error>>,
    {
        let policy = ExponentialBuilder::default()
            .with_min_delay(self.retry.base_backoff)
            .with_max_times(self.retry.max_attempts as usize);

        op.retry(policy)
            .when(|err: &kube::Error| matches!(err, kube::Error::Api(e) if e.code == 409 || e.code >= 500))
            .await
            .map_err(|err| match err {
                kube::Error::Api(e) if e.code == 409 => ClusterError::ConflictRetriesExhausted(e.message),
                kube::Error::Api(e) if e.code == 403 => ClusterError::Forbidden(e.message),
                other => ClusterError::Transient(other.to_string()),
            })
    }
}

/// Strip fields that are never meaningful for the "did this change" diff: `resourceVersion`,
/// `generation`, `managedFields`, `uid`, and `creationTimestamp` all churn independently of
/// any semantic change to the object.
pub(crate) fn strip_volatile_metadata(value: &mut Value) {
    if let Some(metadata) = value.get_mut("metadata").and_then(Value::as_object_mut) {
        for key in ["resourceVersion", "generation", "managedFields", "uid", "creationTimestamp", "selfLink"] {
            metadata.remove(key);
        }
        if let Some(annotations) = metadata.get_mut("annotations").and_then(Value::as_object_mut) {
            annotations.remove("kubectl.kubernetes.io/last-applied-configuration");
        }
    }
}

pub(crate) fn semantically_changed(live: &Value, applied: &Value) -> bool {
    let mut live = live.clone();
    let mut applied = applied.clone();
    strip_volatile_metadata(&mut live);
    strip_volatile_metadata(&mut applied);
    live != applied
}

#[async_trait]
impl ClusterAdapter for KubeClusterAdapter {
    async fn get(&self, id: &ResourceId) -> Result<Option<Value>, ClusterError> {
        let api = self.api_for(id).await?;
        let name = id.name.as_deref().ok_or_else(|| ClusterError::Malformed("get requires a name".to_string()))?;
        match api.get_opt(name).await {
            Ok(Some(obj)) => Ok(Some(serde_json::to_value(obj).map_err(|e| ClusterError::Malformed(e.to_string()))?)),
            Ok(None) => Ok(None),
            Err(kube::Error::Api(err)) if err.code == 403 => Err(ClusterError::Forbidden(err.message)),
            Err(err) => Err(ClusterError::Transient(err.to_string())),
        }
    }

    async fn list(&self, api_version: &str, kind: &str, options: &QueryOptions) -> Result<Vec<Value>, ClusterError> {
        let api_resource = self.resolve_api_resource(api_version, kind).await?;
        let api = self.dynamic_api(api_resource, options.namespace.as_deref());
        let list = api
            .list(&Self::list_params(options))
            .await
            .map_err(|e| ClusterError::Transient(e.to_string()))?;
        list.items
            .into_iter()
            .map(|obj| serde_json::to_value(obj).map_err(|e| ClusterError::Malformed(e.to_string())))
            .collect()
    }

    async fn watch(
        &self,
        api_version: &str,
        kind: &str,
        options: &QueryOptions,
        since_resource_version: Option<String>,
    ) -> Result<WatchStream, ClusterError> {
        let api_resource = self.resolve_api_resource(api_version, kind).await?;
        let api = self.dynamic_api(api_resource, options.namespace.as_deref());
        let mut params = WatchParams::default();
        if let Some(ls) = &options.label_selector {
            params = params.labels(ls);
        }
        if let Some(fs) = &options.field_selector {
            params = params.fields(fs);
        }

        let stream = api
            .watch(&params, since_resource_version.as_deref().unwrap_or(""))
            .await
            .map_err(|e| ClusterError::Transient(e.to_string()))?;

        let mapped = stream.map(|item| match item {
            Ok(KubeWatchEvent::Added(obj)) => to_watch_event(WatchEventType::Added, obj),
            Ok(KubeWatchEvent::Modified(obj)) => to_watch_event(WatchEventType::Modified, obj),
            Ok(KubeWatchEvent::Deleted(obj)) => to_watch_event(WatchEventType::Deleted, obj),
            Ok(KubeWatchEvent::Bookmark(_)) => Err(ClusterError::Transient("bookmark".to_string())),
            Err(kube::Error::Api(err)) if err.code == 410 => Err(ClusterError::Fatal(format!("410 Gone: {}", err.message))),
            Err(err) => Err(ClusterError::Transient(err.to_string())),
        });
        // Bookmarks carry no resource and aren't reconcile-worthy; drop them rather than
        // surface a synthetic error up the dispatcher.
        let filtered = mapped.try_filter_map(|event| async move { Ok(Some(event)) }).boxed();
        Ok(Box::pin(filtered.filter_map(|r| async move {
            match r {
                Ok(event) => Some(Ok(event)),
                Err(ClusterError::Transient(ref msg)) if msg == "bookmark" => None,
                Err(err) => Some(Err(err)),
            }
        })))
    }

    async fn apply(&self, manifests: &[Value], manage_owner_refs: Option<&OwnerIdentity>, method: ApplyMethod) -> Result<Vec<WriteOutcome>, ClusterError> {
        let mut outcomes = Vec::with_capacity(manifests.len());
        for manifest in manifests {
            let mut candidate = manifest.clone();
            strip_volatile_metadata(&mut candidate);
            if let Some(owner) = manage_owner_refs {
                merge_owner_reference(&mut candidate, owner);
            }

            let kind = candidate.get("kind").and_then(Value::as_str).unwrap_or_default().to_string();
            let api_version = candidate.get("apiVersion").and_then(Value::as_str).unwrap_or_default().to_string();
            let namespace = candidate.pointer("/metadata/namespace").and_then(Value::as_str).map(str::to_string);
            let name = candidate.pointer("/metadata/name").and_then(Value::as_str).unwrap_or_default().to_string();

            let api_resource = self.resolve_api_resource(&api_version, &kind).await?;
            let api = self.dynamic_api(api_resource.clone(), namespace.as_deref());

            let live = api.get_opt(&name).await.map_err(|e| ClusterError::Transient(e.to_string()))?;
            let live_value = live
                .as_ref()
                .map(|o| serde_json::to_value(o).unwrap_or(Value::Null));

            let mut object: DynamicObject = serde_json::from_value(candidate.clone()).map_err(|e| ClusterError::Malformed(e.to_string()))?;
            object.types = Some(kube::core::TypeMeta { api_version: api_version.clone(), kind: kind.clone() });
            if object.metadata.name.is_none() {
                object.metadata = ObjectMeta { name: Some(name.clone()), ..object.metadata };
            }

            let result = self
                .retry_write(|| {
                    let api = api.clone();
                    let object = object.clone();
                    let name = name.clone();
                    async move {
                        match method {
                            ApplyMethod::Replace => api.replace(&name, &PostParams::default(), &object).await,
                            ApplyMethod::Update => {
                                api.patch(&name, &PatchParams::default(), &Patch::Merge(&object)).await
                            }
                            ApplyMethod::Default => {
                                let ssapply = PatchParams::apply(MANAGED_FIELD_MANAGER).force();
                                api.patch(&name, &ssapply, &Patch::Apply(&object)).await
                            }
                        }
                    }
                })
                .await;

            let result = match (result, method, self.fallback_to_replace) {
                (Err(ClusterError::Transient(_)), ApplyMethod::Default, true) => {
                    self.retry_write(|| {
                        let api = api.clone();
                        let object = object.clone();
                        let name = name.clone();
                        async move { api.replace(&name, &PostParams::default(), &object).await }
                    })
                    .await
                }
                (other, _, _) => other,
            }?;

            let applied_value = serde_json::to_value(&result).map_err(|e| ClusterError::Malformed(e.to_string()))?;
            let changed = match &live_value {
                Some(live) => semantically_changed(live, &applied_value),
                None => true,
            };
            outcomes.push(WriteOutcome { success: true, changed });
        }
        Ok(outcomes)
    }

    async fn disable(&self, manifests: &[Value]) -> Result<Vec<WriteOutcome>, ClusterError> {
        let mut outcomes = Vec::with_capacity(manifests.len());
        for manifest in manifests {
            let kind = manifest.get("kind").and_then(Value::as_str).unwrap_or_default().to_string();
            let api_version = manifest.get("apiVersion").and_then(Value::as_str).unwrap_or_default().to_string();
            let namespace = manifest.pointer("/metadata/namespace").and_then(Value::as_str).map(str::to_string);
            let name = manifest.pointer("/metadata/name").and_then(Value::as_str).unwrap_or_default().to_string();

            let api_resource = self.resolve_api_resource(&api_version, &kind).await?;
            let api = self.dynamic_api(api_resource, namespace.as_deref());
            match api.delete(&name, &Default::default()).await {
                Ok(_) => outcomes.push(WriteOutcome { success: true, changed: true }),
                Err(kube::Error::Api(err)) if err.code == 404 => outcomes.push(WriteOutcome { success: true, changed: false }),
                Err(kube::Error::Api(err)) if err.code == 403 => return Err(ClusterError::Forbidden(err.message)),
                Err(err) => return Err(ClusterError::Transient(err.to_string())),
            }
        }
        Ok(outcomes)
    }

    async fn set_status(&self, id: &ResourceId, status: &Value) -> Result<WriteOutcome, ClusterError> {
        let _guard = self.status_lock.lock().await;
        let api = self.api_for(id).await?;
        let name = id.name.as_deref().ok_or_else(|| ClusterError::Malformed("setStatus requires a name".to_string()))?;

        let current = api.get_status(name).await.map_err(|e| ClusterError::Transient(e.to_string()))?;
        let current_status = serde_json::to_value(&current)
            .ok()
            .and_then(|v| v.get("status").cloned())
            .unwrap_or(Value::Null);
        if &current_status == status {
            return Ok(WriteOutcome { success: true, changed: false });
        }

        let patch = serde_json::json!({"status": status});
        self.retry_write(|| {
            let api = api.clone();
            let name = name.to_string();
            let patch = patch.clone();
            async move { api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch)).await }
        })
        .await?;
        Ok(WriteOutcome { success: true, changed: true })
    }

    async fn add_finalizer(&self, id: &ResourceId, name: &str) -> Result<WriteOutcome, ClusterError> {
        let api = self.api_for(id).await?;
        let obj_name = id.name.as_deref().ok_or_else(|| ClusterError::Malformed("addFinalizer requires a name".to_string()))?;
        let current = api.get(obj_name).await.map_err(|e| ClusterError::Transient(e.to_string()))?;
        if current.finalizers().iter().any(|f| f == name) {
            return Ok(WriteOutcome { success: true, changed: false });
        }
        let mut finalizers = current.finalizers().to_vec();
        finalizers.push(name.to_string());
        let patch = serde_json::json!({"metadata": {"finalizers": finalizers}});
        self.retry_write(|| {
            let api = api.clone();
            let obj_name = obj_name.to_string();
            let patch = patch.clone();
            async move { api.patch(&obj_name, &PatchParams::default(), &Patch::Merge(&patch)).await }
        })
        .await?;
        Ok(WriteOutcome { success: true, changed: true })
    }

    async fn remove_finalizer(&self, id: &ResourceId, name: &str) -> Result<WriteOutcome, ClusterError> {
        let api = self.api_for(id).await?;
        let obj_name = id.name.as_deref().ok_or_else(|| ClusterError::Malformed("removeFinalizer requires a name".to_string()))?;
        let current = api.get(obj_name).await.map_err(|e| ClusterError::Transient(e.to_string()))?;
        if !current.finalizers().iter().any(|f| f == name) {
            return Ok(WriteOutcome { success: true, changed: false });
        }
        let finalizers: Vec<String> = current.finalizers().iter().filter(|f| f.as_str() != name).cloned().collect();
        let patch = serde_json::json!({"metadata": {"finalizers": finalizers}});
        self.retry_write(|| {
            let api = api.clone();
            let obj_name = obj_name.to_string();
            let patch = patch.clone();
            async move { api.patch(&obj_name, &PatchParams::default(), &Patch::Merge(&patch)).await }
        })
        .await?;
        Ok(WriteOutcome { success: true, changed: true })
    }
}

fn to_watch_event(event_type: WatchEventType, obj: DynamicObject) -> Result<WatchEvent, ClusterError> {
    let resource = serde_json::to_value(obj).map_err(|e| ClusterError::Malformed(e.to_string()))?;
    Ok(WatchEvent { event_type, resource })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_volatile_metadata_drops_only_listed_keys() {
        let mut value = serde_json::json!({
            "kind": "ConfigMap",
            "metadata": {
                "name": "x",
                "resourceVersion": "123",
                "generation": 2,
                "uid": "abc",
                "annotations": {"kubectl.kubernetes.io/last-applied-configuration": "{}", "keep": "me"}
            }
        });
        strip_volatile_metadata(&mut value);
        assert!(value["metadata"].get("resourceVersion").is_none());
        assert!(value["metadata"]["annotations"].get("kubectl.kubernetes.io/last-applied-configuration").is_none());
        assert_eq!(value["metadata"]["annotations"]["keep"], "me");
        assert_eq!(value["metadata"]["name"], "x");
    }

    #[test]
    fn semantically_changed_ignores_volatile_fields() {
        let a = serde_json::json!({"metadata": {"name": "x", "resourceVersion": "1"}, "data": {"a": "1"}});
        let b = serde_json::json!({"metadata": {"name": "x", "resourceVersion": "2"}, "data": {"a": "1"}});
        assert!(!semantically_changed(&a, &b));
    }

    #[test]
    fn semantically_changed_detects_real_diffs() {
        let a = serde_json::json!({"data": {"a": "1"}});
        let b = serde_json::json!({"data": {"a": "2"}});
        assert!(semantically_changed(&a, &b));
    }
}
