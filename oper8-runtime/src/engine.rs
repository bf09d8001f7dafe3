//! `ReconcileEngine`: drives a single reconcile or finalize pass through gate, setup,
//! render, rollout, status, and requeue-decision phases, mirroring how
//! `kube_runtime::Controller::run`'s reconciler closure is driven by the runtime rather
//! than calling itself.

use crate::component::{ComponentContext, ComponentError, RenderedComponent};
use crate::controller::{Controller, ControllerError, ReconcileResult};
use crate::graph::GraphError;
use crate::session::Session;
use chrono::Utc;
use oper8_client::{ApplyMethod, ClusterAdapter, ClusterError, OwnerIdentity};
use oper8_core::config::Config;
use oper8_core::deps_hash::{self, DataKind, DataRef};
use oper8_core::patch::{self, MergeKeyTable, TemporaryPatch};
use oper8_core::resource_id::ResourceId;
use oper8_core::status::{compute_status, ComponentOutcome, Condition, Failure};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// The `oper8.dev/pause-execution` annotation short-circuits every phase but status: the
/// engine neither deploys nor finalizes while it reads `"true"`.
pub const PAUSE_ANNOTATION: &str = "oper8.dev/pause-execution";

pub struct ReconcileEngine {
    adapter: Arc<dyn ClusterAdapter>,
    config: Arc<Config>,
    merge_keys: MergeKeyTable,
}

impl ReconcileEngine {
    #[must_use]
    pub fn new(adapter: Arc<dyn ClusterAdapter>, config: Arc<Config>) -> Self {
        Self { adapter, config, merge_keys: MergeKeyTable::standard() }
    }

    /// Run one reconcile (or finalize, if `finalizing`) pass. Never returns an `Err`: any
    /// failure encountered mid-rollout is captured into the returned [`ReconcileResult`] so
    /// the scheduler always has a requeue decision to act on.
    #[instrument(skip_all, fields(finalizing = finalizing))]
    pub async fn reconcile(
        &self,
        controller: &dyn Controller,
        owner: Value,
        finalizing: bool,
        temporary_patches: &[TemporaryPatch],
        previous_conditions: &[Condition],
    ) -> ReconcileResult {
        match self.run(controller, owner, finalizing, temporary_patches, previous_conditions).await {
            Ok(result) => result,
            Err(err) => {
                warn!(error = %err, "reconcile failed before a status could be computed");
                ReconcileResult::errored(err.to_string(), Duration::from_secs(30))
            }
        }
    }

    async fn run(
        &self,
        controller: &dyn Controller,
        owner: Value,
        finalizing: bool,
        temporary_patches: &[TemporaryPatch],
        previous_conditions: &[Condition],
    ) -> Result<ReconcileResult, EngineError> {
        if is_paused(&owner) {
            debug!("execution paused via annotation, skipping reconcile");
            return Ok(ReconcileResult::stable());
        }

        let owner_id = owner_resource_id(&owner, controller)?;
        let finalizer_name = controller.finalizer_name();

        if finalizing {
            let Some(name) = finalizer_name else {
                return Ok(ReconcileResult::stable());
            };
            if !has_finalizer(&owner, name) {
                debug!(finalizer = name, "finalizer already absent, nothing to finalize");
                return Ok(ReconcileResult::stable());
            }
        }

        let mut session = Session::new(owner.clone(), Arc::clone(&self.config), Arc::clone(&self.adapter));
        if let Some(name) = finalizer_name {
            if finalizing {
                session.remove_finalizer(name);
            } else {
                session.add_finalizer(name);
            }
        }

        if finalizing {
            controller.finalize_components(&mut session).await?;
        } else {
            controller.setup_components(&mut session).await?;
        }
        session.graph.seal()?;

        if !finalizing {
            for name in session.finalizers_to_add.clone() {
                self.adapter.add_finalizer(&owner_id, &name).await?;
            }
        }

        let order = if finalizing { session.graph.finalize_order()? } else { session.graph.topological_order()? };

        let namespace = session.owner_namespace().map(str::to_string);
        let owner_identity = owner_identity(&owner, &owner_id);

        let mut outcomes = Vec::with_capacity(order.len());
        let mut failed: HashSet<String> = HashSet::new();
        let mut any_unverified = false;
        let mut transient_error = false;

        for name in &order {
            let component = session.graph.get(name).expect("sealed graph contains every ordered name").clone();
            let ctx = ComponentContext { owner: &owner, namespace: namespace.as_deref() };

            if finalizing {
                if !component.finalizes() {
                    continue;
                }
                let outcome = self.finalize_component(component.as_ref(), &ctx, name).await;
                if matches!(outcome, ComponentOutcome::Failed(f) if f.is_transient()) {
                    transient_error = true;
                }
                outcomes.push(outcome);
                continue;
            }

            if order.iter().take_while(|n| *n != name).any(|upstream| failed.contains(upstream)) {
                // A declared upstream hasn't deployed; this component cannot have its
                // preconditions met yet. Counting it unverified (not failed) lets it
                // retry on the next reconcile once the upstream recovers.
                any_unverified = true;
                outcomes.push(ComponentOutcome::Unverified);
                continue;
            }

            let outcome = self
                .deploy_component(controller, &mut session, component.as_ref(), &ctx, name, &owner_identity, temporary_patches)
                .await;
            match &outcome {
                ComponentOutcome::Failed(f) => {
                    failed.insert(name.clone());
                    if f.is_transient() {
                        transient_error = true;
                    }
                }
                ComponentOutcome::Unverified => any_unverified = true,
                ComponentOutcome::Verified | ComponentOutcome::Disabled => {}
            }
            outcomes.push(outcome);
        }

        let now = Utc::now();
        let conditions = compute_status(previous_conditions, &outcomes, now);
        let status_value = conditions_to_status(&conditions);
        self.adapter.set_status(&owner_id, &status_value).await?;

        if finalizing && failed.is_empty() {
            for name in &session.finalizers_to_remove {
                self.adapter.remove_finalizer(&owner_id, name).await?;
            }
        }

        Ok(controller
            .should_requeue(any_unverified, transient_error)
            .map(ReconcileResult::requeue_after)
            .unwrap_or_else(ReconcileResult::stable))
    }

    async fn deploy_component(
        &self,
        controller: &dyn Controller,
        session: &mut Session,
        component: &(dyn crate::component::Component),
        ctx: &ComponentContext<'_>,
        name: &str,
        owner_identity: &OwnerIdentity,
        temporary_patches: &[TemporaryPatch],
    ) -> ComponentOutcome {
        let rendered = match component.render(ctx).await {
            Ok(r) => r,
            Err(e) => return ComponentOutcome::Failed(e.as_failure()),
        };

        let mut manifests = Vec::with_capacity(rendered.nodes.len());
        for node in &rendered.nodes {
            let internal_name = node.internal_name(name);
            let mut manifest = match patch::apply_patches(&internal_name, &node.manifest, temporary_patches, &self.merge_keys) {
                Ok(m) => m,
                Err(e) => return ComponentOutcome::Failed(ComponentError::Errored(e.to_string()).as_failure()),
            };
            self.stamp_deps_hash(&mut manifest, &rendered, ctx.namespace).await;
            manifests.push(manifest);
        }

        if let Err(e) = self.adapter.apply(&manifests, Some(owner_identity), ApplyMethod::Default).await {
            return ComponentOutcome::Failed(cluster_error_to_failure(&e));
        }

        if let Err(e) = controller.after_deploy(session).await {
            return ComponentOutcome::Failed(controller_error_to_failure(&e));
        }

        match component.verify(ctx, &rendered).await {
            Ok(crate::component::VerifyOutcome::Verified) => {
                if let Err(e) = controller.after_verify(session).await {
                    return ComponentOutcome::Failed(controller_error_to_failure(&e));
                }
                ComponentOutcome::Verified
            }
            Ok(crate::component::VerifyOutcome::NotYet) => ComponentOutcome::Unverified,
            Err(e) => ComponentOutcome::Failed(e.as_failure()),
        }
    }

    /// Resolve the Secret/ConfigMap refs in `manifest`'s Pod template and fold each one's
    /// identity plus (if resolvable) data into the `deps-hash` annotation, so a content
    /// change on a referenced Secret/ConfigMap forces a Pod rollout.
    async fn stamp_deps_hash(&self, manifest: &mut Value, rendered: &RenderedComponent, namespace: Option<&str>) {
        let Some(kind) = manifest.get("kind").and_then(Value::as_str).map(str::to_string) else {
            return;
        };
        let Some(pointer) = deps_hash::pod_template_pointer(&kind) else {
            return;
        };
        let Some(template) = manifest.pointer(&pointer).cloned() else {
            return;
        };

        let refs = deps_hash::collect_data_refs(&template);
        let mut resolved = Vec::with_capacity(refs.len());
        for data_ref in refs {
            let value = self.resolve_data_ref(&data_ref, rendered, namespace).await;
            resolved.push((data_ref, value));
        }

        if let Some(template) = manifest.pointer_mut(&pointer) {
            deps_hash::stamp(template, &resolved);
        }
    }

    /// Look up a Secret/ConfigMap reference's current data: first among the Component's own
    /// rendered nodes (it may be managing the object itself), falling back to the Cluster
    /// Adapter for a reference that lives outside this Component.
    async fn resolve_data_ref(&self, data_ref: &DataRef, rendered: &RenderedComponent, namespace: Option<&str>) -> Option<Value> {
        let kind_name = match data_ref.kind {
            DataKind::ConfigMap => "ConfigMap",
            DataKind::Secret => "Secret",
        };

        if let Some(node) = rendered.nodes.iter().find(|n| {
            n.manifest.get("kind").and_then(Value::as_str) == Some(kind_name)
                && n.manifest.pointer("/metadata/name").and_then(Value::as_str) == Some(data_ref.name.as_str())
        }) {
            return Some(node.manifest.clone());
        }

        let mut id = ResourceId::new("v1", kind_name).named(data_ref.name.clone());
        if let Some(ns) = namespace {
            id = id.within(ns);
        }
        self.adapter.get(&id).await.ok().flatten()
    }

    async fn finalize_component(
        &self,
        component: &(dyn crate::component::Component),
        ctx: &ComponentContext<'_>,
        name: &str,
    ) -> ComponentOutcome {
        let rendered = match component.render(ctx).await {
            Ok(r) => r,
            Err(e) => return ComponentOutcome::Failed(e.as_failure()),
        };
        let manifests: Vec<Value> = rendered
            .nodes
            .iter()
            .map(|node| {
                let mut manifest = node.manifest.clone();
                if let Some(obj) = manifest.as_object_mut() {
                    obj.entry("metadata").or_insert_with(|| Value::Object(serde_json::Map::new()));
                }
                manifest
            })
            .collect();

        match self.adapter.disable(&manifests).await {
            Ok(_) => {
                debug!(component = name, "component disabled");
                ComponentOutcome::Disabled
            }
            Err(e) => ComponentOutcome::Failed(cluster_error_to_failure(&e)),
        }
    }
}

fn is_paused(owner: &Value) -> bool {
    owner
        .pointer("/metadata/annotations")
        .and_then(Value::as_object)
        .and_then(|a| a.get(PAUSE_ANNOTATION))
        .and_then(Value::as_str)
        == Some("true")
}

fn has_finalizer(owner: &Value, name: &str) -> bool {
    owner
        .pointer("/metadata/finalizers")
        .and_then(Value::as_array)
        .is_some_and(|list| list.iter().any(|v| v.as_str() == Some(name)))
}

fn owner_resource_id(owner: &Value, controller: &dyn Controller) -> Result<ResourceId, EngineError> {
    let name = owner
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .ok_or(EngineError::MalformedOwner("missing metadata.name"))?
        .to_string();
    let api_version = if controller.group().is_empty() {
        controller.version().to_string()
    } else {
        format!("{}/{}", controller.group(), controller.version())
    };
    let mut id = ResourceId::new(&api_version, controller.kind()).named(name);
    if let Some(ns) = owner.pointer("/metadata/namespace").and_then(Value::as_str) {
        id = id.within(ns);
    }
    Ok(id)
}

fn owner_identity(owner: &Value, owner_id: &ResourceId) -> OwnerIdentity {
    OwnerIdentity {
        api_version: owner_id.api_version.as_str(),
        kind: owner_id.kind.clone(),
        name: owner_id.name.clone().unwrap_or_default(),
        uid: owner.pointer("/metadata/uid").and_then(Value::as_str).unwrap_or_default().to_string(),
        namespace: owner_id.namespace.clone(),
    }
}

fn conditions_to_status(conditions: &[Condition]) -> Value {
    serde_json::json!({ "conditions": conditions })
}

fn cluster_error_to_failure(err: &ClusterError) -> Failure {
    match err {
        ClusterError::Transient(_) | ClusterError::ConflictRetriesExhausted(_) => Failure::ClusterError,
        ClusterError::Forbidden(_) => Failure::ConfigError,
        ClusterError::Fatal(_) => Failure::Errored,
        ClusterError::Malformed(_) => Failure::RolloutError,
    }
}

fn controller_error_to_failure(err: &ControllerError) -> Failure {
    match err {
        ControllerError::Setup(_) => Failure::ConfigError,
        ControllerError::PostHook(_) => Failure::Errored,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("owner manifest is malformed: {0}")]
    MalformedOwner(&'static str),
    #[error(transparent)]
    Controller(#[from] ControllerError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Component, RenderedComponent, ResourceNode, VerifyOutcome};
    use crate::controller::Controller;
    use async_trait::async_trait;
    use oper8_client::DryRunClusterAdapter;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoComponent {
        name: &'static str,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Component for EchoComponent {
        fn name(&self) -> &str {
            self.name
        }
        async fn render(&self, ctx: &ComponentContext<'_>) -> Result<RenderedComponent, ComponentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let owner_name = ctx.owner.pointer("/metadata/name").and_then(Value::as_str).unwrap_or("owner");
            let manifest = json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": format!("{owner_name}-{}", self.name), "namespace": ctx.namespace},
                "data": {"k": "v"},
            });
            Ok(RenderedComponent { nodes: vec![ResourceNode::new(self.name, manifest)] })
        }
        async fn verify(&self, _ctx: &ComponentContext<'_>, _rendered: &RenderedComponent) -> Result<VerifyOutcome, ComponentError> {
            Ok(VerifyOutcome::Verified)
        }
    }

    struct StubController {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Controller for StubController {
        fn group(&self) -> &str {
            "example.com"
        }
        fn version(&self) -> &str {
            "v1"
        }
        fn kind(&self) -> &str {
            "Widget"
        }
        async fn setup_components(&self, session: &mut Session) -> Result<(), ControllerError> {
            session
                .graph
                .add(Arc::new(EchoComponent { name: "config", calls: Arc::clone(&self.calls) }))
                .map_err(|e| ControllerError::Setup(e.to_string()))
        }
    }

    fn owner() -> Value {
        json!({
            "apiVersion": "example.com/v1",
            "kind": "Widget",
            "metadata": {"name": "demo", "namespace": "default", "uid": "abc-123"},
        })
    }

    #[tokio::test]
    async fn a_clean_reconcile_deploys_and_reports_stable() {
        let adapter: Arc<dyn ClusterAdapter> = Arc::new(DryRunClusterAdapter::new());
        let engine = ReconcileEngine::new(Arc::clone(&adapter), Arc::new(Config::default()));
        let controller = StubController { calls: Arc::new(AtomicUsize::new(0)) };

        let result = engine.reconcile(&controller, owner(), false, &[], &[]).await;
        assert!(!result.requeue);
        assert!(result.terminal_error.is_none());

        let id = ResourceId::new("v1", "ConfigMap").within("default").named("demo-config");
        let stored = adapter.get(&id).await.unwrap();
        assert!(stored.is_some());
    }

    #[tokio::test]
    async fn paused_owner_skips_deployment_entirely() {
        let adapter: Arc<dyn ClusterAdapter> = Arc::new(DryRunClusterAdapter::new());
        let engine = ReconcileEngine::new(Arc::clone(&adapter), Arc::new(Config::default()));
        let calls = Arc::new(AtomicUsize::new(0));
        let controller = StubController { calls: Arc::clone(&calls) };

        let mut paused_owner = owner();
        paused_owner["metadata"]["annotations"] = json!({PAUSE_ANNOTATION: "true"});

        let result = engine.reconcile(&controller, paused_owner, false, &[], &[]).await;
        assert!(!result.requeue);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn finalize_without_a_registered_finalizer_is_a_no_op() {
        let adapter: Arc<dyn ClusterAdapter> = Arc::new(DryRunClusterAdapter::new());
        let engine = ReconcileEngine::new(Arc::clone(&adapter), Arc::new(Config::default()));
        let controller = StubController { calls: Arc::new(AtomicUsize::new(0)) };

        let result = engine.reconcile(&controller, owner(), true, &[], &[]).await;
        assert!(!result.requeue);
    }

    fn deployment_referencing_configmap(name: &str) -> Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "app", "namespace": "default"},
            "spec": {"template": {"spec": {"containers": [{
                "name": "app",
                "envFrom": [{"configMapRef": {"name": name}}],
            }]}}},
        })
    }

    fn deps_hash_of(manifest: &Value) -> Option<String> {
        manifest
            .pointer("/spec/template/metadata/annotations")
            .and_then(|a| a.get(deps_hash::DEPS_HASH_ANNOTATION))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    #[tokio::test]
    async fn deps_hash_changes_when_a_cluster_resolved_configmap_changes() {
        let adapter: Arc<dyn ClusterAdapter> = Arc::new(DryRunClusterAdapter::new());
        let engine = ReconcileEngine::new(Arc::clone(&adapter), Arc::new(Config::default()));
        let rendered = RenderedComponent::default();

        adapter
            .apply(
                &[json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "conf", "namespace": "default"}, "data": {"k": "1"}})],
                None,
                ApplyMethod::Default,
            )
            .await
            .unwrap();
        let mut first = deployment_referencing_configmap("conf");
        engine.stamp_deps_hash(&mut first, &rendered, Some("default")).await;
        let hash1 = deps_hash_of(&first).unwrap();

        adapter
            .apply(
                &[json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "conf", "namespace": "default"}, "data": {"k": "2"}})],
                None,
                ApplyMethod::Default,
            )
            .await
            .unwrap();
        let mut second = deployment_referencing_configmap("conf");
        engine.stamp_deps_hash(&mut second, &rendered, Some("default")).await;
        let hash2 = deps_hash_of(&second).unwrap();

        assert_ne!(hash1, hash2);
    }

    #[tokio::test]
    async fn deps_hash_resolves_a_self_rendered_configmap_without_a_cluster_round_trip() {
        let adapter: Arc<dyn ClusterAdapter> = Arc::new(DryRunClusterAdapter::new());
        let engine = ReconcileEngine::new(Arc::clone(&adapter), Arc::new(Config::default()));

        let own_configmap = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "conf"}, "data": {"k": "1"}});
        let rendered = RenderedComponent { nodes: vec![ResourceNode::new("conf", own_configmap)] };
        let mut first = deployment_referencing_configmap("conf");
        engine.stamp_deps_hash(&mut first, &rendered, Some("default")).await;
        let hash1 = deps_hash_of(&first).unwrap();

        let changed_configmap = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "conf"}, "data": {"k": "2"}});
        let rendered = RenderedComponent { nodes: vec![ResourceNode::new("conf", changed_configmap)] };
        let mut second = deployment_referencing_configmap("conf");
        engine.stamp_deps_hash(&mut second, &rendered, Some("default")).await;
        let hash2 = deps_hash_of(&second).unwrap();

        assert_ne!(hash1, hash2);
    }
}
