//! Strategic merge patch (JSON Merge Patch, RFC 7386, with Kubernetes list-merge
//! directives layered on top).
//!
//! A direct port of `oper8.patch_strategic_merge.patch_strategic_merge`'s recursion, kept
//! as a pure function over a deep-copied manifest.

use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;

const DIRECTIVE_KEY: &str = "$patch";
const DIRECTIVE_REPLACE: &str = "replace";
const DIRECTIVE_MERGE: &str = "merge";
const DIRECTIVE_DELETE: &str = "delete";
const DELETE_FROM_PRIMITIVE_LIST_PREFIX: &str = "$deleteFromPrimitiveList/";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StrategicMergeError {
    #[error("cannot delete from unknown primitive list [{0}]")]
    UnknownPrimitiveList(String),
    #[error("bad primitive list delete directive: patch for [{0}] must be a list")]
    PatchNotAList(String),
    #[error("bad primitive list delete directive: target [{0}] must be a list")]
    TargetNotAList(String),
    #[error("bad primitive list delete directive: element {0} not found in [{1}]")]
    ElementNotFound(String, String),
    #[error("current at [{0}] contains elements without merge key [{1}]")]
    CurrentMissingMergeKey(String, String),
    #[error("desired at [{0}] contains elements without merge key [{1}]")]
    DesiredMissingMergeKey(String, String),
    #[error("invalid [{DIRECTIVE_DELETE}] on missing element [{0}]")]
    DeleteMissingElement(String),
    #[error("invalid directive: [{0}]")]
    InvalidDirective(String),
}

/// A path -> merge-key lookup table. The Kubernetes strategic-merge schema keys this by
/// the full dotted path from the resource kind (e.g. `Deployment.spec.template.spec.containers`);
/// we additionally fall back to matching on the bare field name so that common
/// container/volume/env-shaped lists merge correctly without the caller enumerating every
/// kind that embeds a pod template.
#[derive(Debug, Clone, Default)]
pub struct MergeKeyTable {
    by_path: HashMap<String, String>,
}

impl MergeKeyTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The subset of the standard Kubernetes `patchMergeKey` table covering the fields
    /// operators render most often: containers, volumes, ports, env, and owner references.
    #[must_use]
    pub fn standard() -> Self {
        let mut table = Self::new();
        for field in [
            "containers",
            "initContainers",
            "ephemeralContainers",
            "volumes",
            "volumeMounts",
            "volumeDevices",
            "env",
            "ownerReferences",
            "imagePullSecrets",
            "topologySpreadConstraints",
        ] {
            table.by_path.insert(field.to_string(), "name".to_string());
        }
        table.by_path.insert("ports".to_string(), "containerPort".to_string());
        table.by_path.insert("conditions".to_string(), "type".to_string());
        table
    }

    /// Register (or override) the merge key for an exact dotted path, e.g.
    /// `"Deployment.spec.template.spec.containers"`.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>, merge_key: impl Into<String>) -> Self {
        self.by_path.insert(path.into(), merge_key.into());
        self
    }

    fn lookup(&self, position: &str) -> Option<&str> {
        if let Some(key) = self.by_path.get(position) {
            return Some(key.as_str());
        }
        let last_segment = position.rsplit('.').next().unwrap_or(position);
        self.by_path.get(last_segment).map(String::as_str)
    }
}

/// Apply a strategic merge patch to `current`, returning the merged result. Both inputs
/// are deep-copied; neither is mutated.
pub fn patch_strategic_merge(
    current: &Value,
    patch: &Value,
    merge_keys: &MergeKeyTable,
) -> Result<Value, StrategicMergeError> {
    let position = current.get("kind").and_then(Value::as_str).unwrap_or("").to_string();
    strategic_merge(current.clone(), patch.clone(), &position, merge_keys)
}

fn strategic_merge(
    current: Value,
    desired: Value,
    position: &str,
    merge_keys: &MergeKeyTable,
) -> Result<Value, StrategicMergeError> {
    match (current, desired) {
        (Value::Object(mut current_map), Value::Object(desired_map)) => {
            for (key, val) in desired_map {
                if val.is_null() {
                    current_map.remove(&key);
                } else if let Some(target_key) = key.strip_prefix(DELETE_FROM_PRIMITIVE_LIST_PREFIX) {
                    delete_from_primitive_list(&mut current_map, target_key, &val)?;
                } else if !current_map.contains_key(&key) {
                    current_map.insert(key, val);
                } else {
                    let next_position = format!("{position}.{key}");
                    let existing = current_map.remove(&key).unwrap();
                    let merged = strategic_merge(existing, val, &next_position, merge_keys)?;
                    current_map.insert(key, merged);
                }
            }
            Ok(Value::Object(current_map))
        }
        (Value::Array(current_list), Value::Array(desired_list)) => {
            merge_lists(current_list, desired_list, position, merge_keys)
        }
        (_, desired) => Ok(desired),
    }
}

fn delete_from_primitive_list(
    current_map: &mut Map<String, Value>,
    target_key: &str,
    values_to_remove: &Value,
) -> Result<(), StrategicMergeError> {
    let to_remove = values_to_remove
        .as_array()
        .ok_or_else(|| StrategicMergeError::PatchNotAList(target_key.to_string()))?;
    let target = current_map
        .get_mut(target_key)
        .ok_or_else(|| StrategicMergeError::UnknownPrimitiveList(target_key.to_string()))?;
    let target_list = target
        .as_array_mut()
        .ok_or_else(|| StrategicMergeError::TargetNotAList(target_key.to_string()))?;
    for element in to_remove {
        let position = target_list.iter().position(|v| v == element).ok_or_else(|| {
            StrategicMergeError::ElementNotFound(element.to_string(), target_key.to_string())
        })?;
        target_list.remove(position);
    }
    Ok(())
}

fn merge_lists(
    current_list: Vec<Value>,
    desired_list: Vec<Value>,
    position: &str,
    merge_keys: &MergeKeyTable,
) -> Result<Value, StrategicMergeError> {
    let Some(merge_key) = merge_keys.lookup(position) else {
        return Ok(Value::Array(desired_list));
    };

    let mut current_by_key: Vec<(Value, Map<String, Value>)> = Vec::with_capacity(current_list.len());
    for item in current_list {
        let obj = item
            .as_object()
            .ok_or_else(|| StrategicMergeError::CurrentMissingMergeKey(position.to_string(), merge_key.to_string()))?;
        let key = obj
            .get(merge_key)
            .cloned()
            .ok_or_else(|| StrategicMergeError::CurrentMissingMergeKey(position.to_string(), merge_key.to_string()))?;
        current_by_key.push((key, obj.clone()));
    }

    for item in &desired_list {
        let obj = item
            .as_object()
            .ok_or_else(|| StrategicMergeError::DesiredMissingMergeKey(position.to_string(), merge_key.to_string()))?;
        if !obj.contains_key(merge_key) {
            return Err(StrategicMergeError::DesiredMissingMergeKey(position.to_string(), merge_key.to_string()));
        }
    }

    // Ordered map keyed by the merge-key value, preserving `current`'s original order
    // with new elements appended in `desired`'s order — mirrors the Python `OrderedDict`.
    let mut order: Vec<Value> = current_by_key.iter().map(|(k, _)| k.clone()).collect();
    let mut merged: HashMap<String, Map<String, Value>> = HashMap::new();
    for (key, obj) in current_by_key {
        merged.insert(key_string(&key), obj);
    }

    for item in desired_list {
        let mut obj = item.as_object().unwrap().clone();
        let key = obj.get(merge_key).cloned().unwrap();
        let key_s = key_string(&key);
        let directive = obj
            .remove(DIRECTIVE_KEY)
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| DIRECTIVE_MERGE.to_string());

        match directive.as_str() {
            DIRECTIVE_DELETE => {
                if !merged.contains_key(&key_s) {
                    return Err(StrategicMergeError::DeleteMissingElement(key_s));
                }
                merged.remove(&key_s);
                order.retain(|k| key_string(k) != key_s);
            }
            DIRECTIVE_REPLACE => {
                if !merged.contains_key(&key_s) {
                    order.push(key.clone());
                }
                merged.insert(key_s, obj);
            }
            DIRECTIVE_MERGE => {
                if let Some(existing) = merged.remove(&key_s) {
                    let merged_item = strategic_merge(
                        Value::Object(existing),
                        Value::Object(obj),
                        position,
                        merge_keys,
                    )?;
                    merged.insert(key_s, merged_item.as_object().unwrap().clone());
                } else {
                    order.push(key.clone());
                    merged.insert(key_s, obj);
                }
            }
            other => return Err(StrategicMergeError::InvalidDirective(other.to_string())),
        }
    }

    let result: Vec<Value> = order
        .into_iter()
        .filter_map(|k| merged.remove(&key_string(&k)).map(Value::Object))
        .collect();
    Ok(Value::Array(result))
}

fn key_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dict_merge_adds_and_overwrites_keys() {
        let current = json!({"kind": "ConfigMap", "data": {"a": "1"}});
        let patch = json!({"data": {"b": "2"}});
        let result = patch_strategic_merge(&current, &patch, &MergeKeyTable::standard()).unwrap();
        assert_eq!(result, json!({"kind": "ConfigMap", "data": {"a": "1", "b": "2"}}));
    }

    #[test]
    fn null_deletes_key() {
        let current = json!({"kind": "ConfigMap", "data": {"a": "1", "b": "2"}});
        let patch = json!({"data": {"b": null}});
        let result = patch_strategic_merge(&current, &patch, &MergeKeyTable::standard()).unwrap();
        assert_eq!(result, json!({"kind": "ConfigMap", "data": {"a": "1"}}));
    }

    #[test]
    fn list_without_merge_key_is_replaced_wholesale() {
        let current = json!({"kind": "ConfigMap", "items": [1, 2, 3]});
        let patch = json!({"items": [9]});
        let result = patch_strategic_merge(&current, &patch, &MergeKeyTable::standard()).unwrap();
        assert_eq!(result["items"], json!([9]));
    }

    #[test]
    fn container_list_merges_by_name() {
        let current = json!({
            "kind": "Pod",
            "spec": {"containers": [{"name": "foo", "image": "a:1", "restartPolicy": "Always"}]}
        });
        let patch = json!({"spec": {"containers": [{"name": "foo", "restartPolicy": "OnFailure"}]}});
        let result = patch_strategic_merge(&current, &patch, &MergeKeyTable::standard()).unwrap();
        let container = &result["spec"]["containers"][0];
        assert_eq!(container["image"], "a:1");
        assert_eq!(container["restartPolicy"], "OnFailure");
    }

    #[test]
    fn delete_directive_removes_matching_element() {
        let current = json!({
            "kind": "Pod",
            "spec": {"containers": [{"name": "foo"}, {"name": "bar"}]}
        });
        let patch = json!({"spec": {"containers": [{"name": "bar", "$patch": "delete"}]}});
        let result = patch_strategic_merge(&current, &patch, &MergeKeyTable::standard()).unwrap();
        let names: Vec<&str> = result["spec"]["containers"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["foo"]);
    }

    #[test]
    fn delete_directive_on_missing_element_errors() {
        let current = json!({"kind": "Pod", "spec": {"containers": [{"name": "foo"}]}});
        let patch = json!({"spec": {"containers": [{"name": "missing", "$patch": "delete"}]}});
        let result = patch_strategic_merge(&current, &patch, &MergeKeyTable::standard());
        assert!(result.is_err());
    }

    #[test]
    fn delete_from_primitive_list_removes_scalars() {
        let current = json!({"kind": "ConfigMap", "finalizers": ["a", "b", "c"]});
        let patch = json!({"$deleteFromPrimitiveList/finalizers": ["b"]});
        let result = patch_strategic_merge(&current, &patch, &MergeKeyTable::standard()).unwrap();
        assert_eq!(result["finalizers"], json!(["a", "c"]));
    }

    #[test]
    fn delete_from_primitive_list_missing_value_errors() {
        let current = json!({"kind": "ConfigMap", "finalizers": ["a"]});
        let patch = json!({"$deleteFromPrimitiveList/finalizers": ["z"]});
        assert!(patch_strategic_merge(&current, &patch, &MergeKeyTable::standard()).is_err());
    }

    #[test]
    fn patch_is_pure_and_deterministic() {
        let current = json!({"kind": "ConfigMap", "data": {"a": "1"}});
        let patch = json!({"data": {"b": "2"}});
        let keys = MergeKeyTable::standard();
        let r1 = patch_strategic_merge(&current, &patch, &keys).unwrap();
        let r2 = patch_strategic_merge(&current, &patch, &keys).unwrap();
        assert_eq!(r1, r2);
        // original inputs untouched
        assert_eq!(current, json!({"kind": "ConfigMap", "data": {"a": "1"}}));
    }
}
