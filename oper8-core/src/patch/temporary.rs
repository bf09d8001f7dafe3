//! Dispatch for user-authored `TemporaryPatch` custom resources.
//!
//! A `TemporaryPatch` carries a `patchType` selector and a patch body nested under the
//! dotted internal name it targets (`<componentName>.<nodeName>[.<subPath>...]`). During
//! rollout the engine walks each rendered object's internal name into every visible
//! `TemporaryPatch`'s body; whatever remains after consuming all path segments is the
//! patch to apply, dispatched to the strategic-merge or JSON-patch engine as declared.

use super::json_patch::{apply_json_patch, JsonPatchError};
use super::strategic_merge::{patch_strategic_merge, MergeKeyTable, StrategicMergeError};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchType {
    StrategicMerge,
    Json6902,
}

/// A `TemporaryPatch` resource visible in the cluster during rollout.
#[derive(Debug, Clone)]
pub struct TemporaryPatch {
    pub name: String,
    pub patch_type: PatchType,
    /// The patch body, nested under the dotted internal-name path it targets.
    pub patch: Value,
}

#[derive(Debug, Error)]
pub enum TemporaryPatchError {
    #[error("strategic merge patch '{patch_name}' failed: {source}")]
    StrategicMerge {
        patch_name: String,
        #[source]
        source: StrategicMergeError,
    },
    #[error("JSON 6902 patch '{patch_name}' failed: {source}")]
    Json6902 {
        patch_name: String,
        #[source]
        source: JsonPatchError,
    },
}

/// Apply every `TemporaryPatch` in `temporary_patches` whose scoped target path matches
/// `internal_name`, in declared order. Patches that don't match this internal name are
/// silently skipped (they target a different component/node).
pub fn apply_patches(
    internal_name: &str,
    resource_definition: &Value,
    temporary_patches: &[TemporaryPatch],
    merge_keys: &MergeKeyTable,
) -> Result<Value, TemporaryPatchError> {
    let mut current = resource_definition.clone();
    for temporary_patch in temporary_patches {
        let Some(scoped_patch) = resolve_scoped_patch(internal_name, &temporary_patch.patch) else {
            continue;
        };
        current = match temporary_patch.patch_type {
            PatchType::StrategicMerge => {
                patch_strategic_merge(&current, &scoped_patch, merge_keys).map_err(|source| {
                    TemporaryPatchError::StrategicMerge {
                        patch_name: temporary_patch.name.clone(),
                        source,
                    }
                })?
            }
            PatchType::Json6902 => {
                apply_json_patch(&current, &scoped_patch).map_err(|source| TemporaryPatchError::Json6902 {
                    patch_name: temporary_patch.name.clone(),
                    source,
                })?
            }
        };
    }
    Ok(current)
}

/// Walk `internal_name`'s dot-separated segments into `patch`, returning the remaining
/// sub-value iff every segment resolved to a nested object and something is left over.
fn resolve_scoped_patch(internal_name: &str, patch: &Value) -> Option<Value> {
    let mut current = patch.clone();
    for segment in internal_name.split('.') {
        match current {
            Value::Object(mut map) => {
                current = map.remove(segment)?;
            }
            _ => return None,
        }
    }
    let is_empty = matches!(&current, Value::Object(m) if m.is_empty()) || current.is_null();
    if is_empty {
        None
    } else {
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn matching_patch_applies_to_scoped_node() {
        let current = json!({
            "kind": "Pod",
            "spec": {"containers": [{"name": "foo", "image": "a:1"}]}
        });
        let patches = vec![TemporaryPatch {
            name: "tp1".into(),
            patch_type: PatchType::StrategicMerge,
            patch: json!({
                "foo": {"bar": {"spec": {"containers": [{"name": "foo", "restartPolicy": "OnFailure"}]}}}
            }),
        }];
        let result = apply_patches("foo.bar", &current, &patches, &MergeKeyTable::standard()).unwrap();
        assert_eq!(result["spec"]["containers"][0]["restartPolicy"], "OnFailure");
        assert_eq!(result["spec"]["containers"][0]["image"], "a:1");
    }

    #[test]
    fn non_matching_internal_name_is_skipped() {
        let current = json!({"kind": "Pod", "spec": {}});
        let patches = vec![TemporaryPatch {
            name: "tp1".into(),
            patch_type: PatchType::StrategicMerge,
            patch: json!({"other": {"node": {"spec": {"replicas": 3}}}}),
        }];
        let result = apply_patches("foo.bar", &current, &patches, &MergeKeyTable::standard()).unwrap();
        assert_eq!(result, current);
    }

    #[test]
    fn json_patch_type_is_dispatched_correctly() {
        let current = json!({"kind": "Pod", "spec": {"replicas": 1}});
        let patches = vec![TemporaryPatch {
            name: "tp1".into(),
            patch_type: PatchType::Json6902,
            patch: json!({"foo": {"bar": [{"op": "replace", "path": "/spec/replicas", "value": 5}]}}),
        }];
        let result = apply_patches("foo.bar", &current, &patches, &MergeKeyTable::standard()).unwrap();
        assert_eq!(result["spec"]["replicas"], 5);
    }

    #[test]
    fn delete_on_missing_element_surfaces_as_error() {
        let current = json!({"kind": "Pod", "spec": {"containers": [{"name": "foo"}]}});
        let patches = vec![TemporaryPatch {
            name: "tp1".into(),
            patch_type: PatchType::StrategicMerge,
            patch: json!({
                "foo": {"bar": {"spec": {"containers": [{"name": "missing", "$patch": "delete"}]}}}
            }),
        }];
        let result = apply_patches("foo.bar", &current, &patches, &MergeKeyTable::standard());
        assert!(result.is_err());
    }
}
