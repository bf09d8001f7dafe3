//! Dependency-hash annotation stamping.
//!
//! For every resource kind that carries a Pod template, scan its containers, volumes,
//! `envFrom`, and `valueFrom` blocks for references to `Secret`/`ConfigMap` data objects.
//! Fold each reference's identity and (if resolved) content into a single hash, order
//! insensitive and stable across process restarts, and stamp it onto the template as an
//! annotation so a content change on a referenced Secret/ConfigMap forces a Pod rollout —
//! the same problem Deployments solve by hashing `PodTemplateSpec`, generalized to
//! external data the template only references by name.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

pub const DEPS_HASH_ANNOTATION: &str = "oper8.dev/deps-hash";

/// A reference to a `Secret` or `ConfigMap` by name, found while scanning a Pod template.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataRef {
    pub kind: DataKind,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DataKind {
    ConfigMap,
    Secret,
}

/// Kinds whose spec nests a `template.spec` Pod template, and the JSON-pointer path to
/// reach it relative to the resource root. `Pod` is itself a template.
const POD_TEMPLATE_KINDS: &[(&str, &[&str])] = &[
    ("Pod", &[]),
    ("Deployment", &["spec", "template"]),
    ("StatefulSet", &["spec", "template"]),
    ("ReplicaSet", &["spec", "template"]),
    ("DaemonSet", &["spec", "template"]),
    ("Job", &["spec", "template"]),
    ("CronJob", &["spec", "jobTemplate", "spec", "template"]),
];

/// Locate the Pod template within `resource`, returning a pointer path usable with
/// [`serde_json::Value::pointer`]/`pointer_mut`. Returns `None` for kinds with no template.
#[must_use]
pub fn pod_template_pointer(kind: &str) -> Option<String> {
    POD_TEMPLATE_KINDS.iter().find(|(k, _)| *k == kind).map(|(_, path)| {
        if path.is_empty() {
            String::new()
        } else {
            format!("/{}", path.join("/"))
        }
    })
}

/// Scan a Pod template (the `PodSpec`-bearing object, e.g. `.spec.template` for a
/// Deployment or the whole resource for a bare `Pod`) for `Secret`/`ConfigMap` references
/// in containers, volumes, `envFrom`, and `valueFrom` blocks.
#[must_use]
pub fn collect_data_refs(pod_template: &Value) -> Vec<DataRef> {
    let mut refs = BTreeSet::new();
    let pod_spec = pod_template.pointer("/spec").unwrap_or(pod_template);

    for container_field in ["containers", "initContainers", "ephemeralContainers"] {
        if let Some(containers) = pod_spec.get(container_field).and_then(Value::as_array) {
            for container in containers {
                scan_container(container, &mut refs);
            }
        }
    }
    if let Some(volumes) = pod_spec.get("volumes").and_then(Value::as_array) {
        for volume in volumes {
            if let Some(name) = volume.pointer("/secret/secretName").and_then(Value::as_str) {
                refs.insert(DataRef { kind: DataKind::Secret, name: name.to_string() });
            }
            if let Some(name) = volume.pointer("/configMap/name").and_then(Value::as_str) {
                refs.insert(DataRef { kind: DataKind::ConfigMap, name: name.to_string() });
            }
        }
    }
    refs.into_iter().collect()
}

fn scan_container(container: &Value, refs: &mut BTreeSet<DataRef>) {
    if let Some(env) = container.get("env").and_then(Value::as_array) {
        for entry in env {
            if let Some(name) = entry.pointer("/valueFrom/secretKeyRef/name").and_then(Value::as_str) {
                refs.insert(DataRef { kind: DataKind::Secret, name: name.to_string() });
            }
            if let Some(name) = entry.pointer("/valueFrom/configMapKeyRef/name").and_then(Value::as_str) {
                refs.insert(DataRef { kind: DataKind::ConfigMap, name: name.to_string() });
            }
        }
    }
    if let Some(env_from) = container.get("envFrom").and_then(Value::as_array) {
        for entry in env_from {
            if let Some(name) = entry.pointer("/secretRef/name").and_then(Value::as_str) {
                refs.insert(DataRef { kind: DataKind::Secret, name: name.to_string() });
            }
            if let Some(name) = entry.pointer("/configMapRef/name").and_then(Value::as_str) {
                refs.insert(DataRef { kind: DataKind::ConfigMap, name: name.to_string() });
            }
        }
    }
}

/// Compute the deps-hash for a set of references, each optionally resolved to its live
/// data object. An unresolved reference still contributes its identity to the hash (so a
/// circular or not-yet-created dependency doesn't block stamping), but not its content.
/// Order-insensitive: refs are hashed in a canonical sorted order regardless of scan order.
#[must_use]
pub fn compute_hash(refs: &[(DataRef, Option<Value>)]) -> String {
    let mut sorted: Vec<&(DataRef, Option<Value>)> = refs.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    for (data_ref, resolved) in sorted {
        let kind_tag = match data_ref.kind {
            DataKind::ConfigMap => "ConfigMap",
            DataKind::Secret => "Secret",
        };
        hasher.update(kind_tag.as_bytes());
        hasher.update(b"\0");
        hasher.update(data_ref.name.as_bytes());
        hasher.update(b"\0");
        if let Some(resolved) = resolved {
            let data = resolved.get("data").cloned().unwrap_or(Value::Null);
            // serde_json Map preserves insertion order; canonicalize via a BTreeMap pass
            // over the stringified representation so key ordering cannot perturb the hash.
            let canonical = canonicalize(&data);
            hasher.update(canonical.as_bytes());
        }
        hasher.update(b"\x1e");
    }
    format!("{:x}", hasher.finalize())
}

fn canonicalize(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let body: Vec<String> = entries.iter().map(|(k, v)| format!("{k}={}", canonicalize(v))).collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonicalize).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

/// Stamp the deps-hash annotation onto a Pod template in place. Returns `true` iff the
/// annotation's value changed (or was newly added).
pub fn stamp(pod_template: &mut Value, refs: &[(DataRef, Option<Value>)]) -> bool {
    let hash = compute_hash(refs);
    let metadata = pod_template
        .as_object_mut()
        .map(|obj| obj.entry("metadata").or_insert_with(|| Value::Object(serde_json::Map::new())));
    let Some(metadata) = metadata else { return false };
    let annotations = metadata
        .as_object_mut()
        .map(|obj| obj.entry("annotations").or_insert_with(|| Value::Object(serde_json::Map::new())));
    let Some(annotations) = annotations else { return false };
    let Some(annotations) = annotations.as_object_mut() else { return false };

    let previous = annotations.get(DEPS_HASH_ANNOTATION).and_then(Value::as_str).map(str::to_string);
    let changed = previous.as_deref() != Some(hash.as_str());
    annotations.insert(DEPS_HASH_ANNOTATION.to_string(), Value::String(hash));
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deployment_template_pointer_resolves_to_spec_template() {
        assert_eq!(pod_template_pointer("Deployment"), Some("/spec/template".to_string()));
        assert_eq!(pod_template_pointer("Pod"), Some(String::new()));
        assert_eq!(pod_template_pointer("Service"), None);
    }

    #[test]
    fn collects_refs_from_env_envfrom_and_volumes() {
        let template = json!({
            "spec": {
                "containers": [{
                    "name": "app",
                    "env": [{"name": "X", "valueFrom": {"secretKeyRef": {"name": "creds"}}}],
                    "envFrom": [{"configMapRef": {"name": "conf"}}],
                }],
                "volumes": [{"name": "v", "secret": {"secretName": "tls"}}],
            }
        });
        let refs = collect_data_refs(&template);
        assert_eq!(refs.len(), 3);
        assert!(refs.contains(&DataRef { kind: DataKind::Secret, name: "creds".into() }));
        assert!(refs.contains(&DataRef { kind: DataKind::ConfigMap, name: "conf".into() }));
        assert!(refs.contains(&DataRef { kind: DataKind::Secret, name: "tls".into() }));
    }

    #[test]
    fn hash_is_order_insensitive() {
        let a = DataRef { kind: DataKind::Secret, name: "a".into() };
        let b = DataRef { kind: DataKind::ConfigMap, name: "b".into() };
        let forward = vec![(a.clone(), None), (b.clone(), None)];
        let backward = vec![(b, None), (a, None)];
        assert_eq!(compute_hash(&forward), compute_hash(&backward));
    }

    #[test]
    fn hash_changes_with_resolved_content() {
        let r = DataRef { kind: DataKind::ConfigMap, name: "conf".into() };
        let v1 = json!({"data": {"k": "1"}});
        let v2 = json!({"data": {"k": "2"}});
        assert_ne!(compute_hash(&[(r.clone(), Some(v1))]), compute_hash(&[(r, Some(v2))]));
    }

    #[test]
    fn unresolved_ref_still_contributes_identity() {
        let r = DataRef { kind: DataKind::Secret, name: "missing".into() };
        let resolved = compute_hash(&[(r.clone(), None)]);
        let other = DataRef { kind: DataKind::Secret, name: "other".into() };
        assert_ne!(resolved, compute_hash(&[(other, None)]));
    }

    #[test]
    fn stamp_is_idempotent_and_reports_change() {
        let mut template = json!({"metadata": {}, "spec": {}});
        let refs = vec![(DataRef { kind: DataKind::Secret, name: "a".into() }, None)];
        assert!(stamp(&mut template, &refs));
        assert!(!stamp(&mut template, &refs));
    }
}
