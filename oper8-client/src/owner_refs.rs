//! Owner-reference merge helper, shared by the cluster adapters' `apply` and by
//! `LeaderForLife`'s ConfigMap-ownership bookkeeping.

use crate::adapter::OwnerIdentity;
use serde_json::{json, Value};

/// Merge an owner reference for `owner` into `manifest`'s `metadata.ownerReferences`,
/// without deduplicating references already present — only a reference to the *same*
/// owner by uid is treated as already-present and left alone.
pub fn merge_owner_reference(manifest: &mut Value, owner: &OwnerIdentity) {
    let metadata = manifest
        .as_object_mut()
        .map(|obj| obj.entry("metadata").or_insert_with(|| Value::Object(serde_json::Map::new())));
    let Some(metadata) = metadata.and_then(Value::as_object_mut) else { return };
    let refs = metadata
        .entry("ownerReferences")
        .or_insert_with(|| Value::Array(Vec::new()));
    let Some(refs) = refs.as_array_mut() else { return };

    let already_present = refs.iter().any(|r| r.get("uid").and_then(Value::as_str) == Some(owner.uid.as_str()));
    if already_present {
        return;
    }
    refs.push(json!({
        "apiVersion": owner.api_version,
        "kind": owner.kind,
        "name": owner.name,
        "uid": owner.uid,
        "blockOwnerDeletion": true,
        "controller": false,
    }));
}

/// Whether `owner` may legally own `manifest` under namespace-scoping rules: a
/// namespaced owner can only own objects in its own namespace.
#[must_use]
pub fn same_namespace(manifest: &Value, owner: &OwnerIdentity) -> bool {
    let manifest_ns = manifest.pointer("/metadata/namespace").and_then(Value::as_str);
    match (&owner.namespace, manifest_ns) {
        (Some(owner_ns), Some(manifest_ns)) => owner_ns == manifest_ns,
        (None, _) => true,
        (Some(_), None) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn owner() -> OwnerIdentity {
        OwnerIdentity {
            api_version: "apps.example.com/v1".to_string(),
            kind: "Widget".to_string(),
            name: "my-widget".to_string(),
            uid: "uid-1".to_string(),
            namespace: Some("ns1".to_string()),
        }
    }

    #[test]
    fn merges_owner_reference_onto_empty_manifest() {
        let mut manifest = json!({"kind": "ConfigMap", "metadata": {"name": "cfg"}});
        merge_owner_reference(&mut manifest, &owner());
        let refs = manifest["metadata"]["ownerReferences"].as_array().unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0]["uid"], "uid-1");
    }

    #[test]
    fn does_not_duplicate_same_owner() {
        let mut manifest = json!({"kind": "ConfigMap", "metadata": {"name": "cfg"}});
        merge_owner_reference(&mut manifest, &owner());
        merge_owner_reference(&mut manifest, &owner());
        let refs = manifest["metadata"]["ownerReferences"].as_array().unwrap();
        assert_eq!(refs.len(), 1);
    }

    #[test]
    fn preserves_existing_unrelated_owner_references() {
        let mut manifest = json!({
            "kind": "ConfigMap",
            "metadata": {"name": "cfg", "ownerReferences": [{"uid": "other-uid", "kind": "Other"}]}
        });
        merge_owner_reference(&mut manifest, &owner());
        let refs = manifest["metadata"]["ownerReferences"].as_array().unwrap();
        assert_eq!(refs.len(), 2);
    }

    #[test]
    fn cross_namespace_owner_is_rejected() {
        let manifest = json!({"metadata": {"namespace": "other-ns"}});
        assert!(!same_namespace(&manifest, &owner()));
    }
}
