//! JSON Patch (RFC 6902) application, delegating the operation semantics to the
//! `json-patch` crate (teacher dependency: `kube-runtime` uses `json-patch` + `jsonptr`
//! for its own finalizer patches).

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JsonPatchError {
    #[error("JSON 6902 patch body must be a list of operations")]
    NotAList,
    #[error("invalid JSON 6902 patch operation: {0}")]
    InvalidOperation(#[from] serde_json::Error),
    #[error("failed to apply JSON 6902 patch: {0}")]
    Apply(#[from] json_patch::PatchError),
}

/// Apply a list of RFC-6902 operations (given as a `serde_json::Value::Array`) to
/// `resource_definition`. Rejects any patch body that is not a JSON array.
pub fn apply_json_patch(resource_definition: &Value, patch: &Value) -> Result<Value, JsonPatchError> {
    if !patch.is_array() {
        return Err(JsonPatchError::NotAList);
    }
    let ops: json_patch::Patch = serde_json::from_value(patch.clone())?;
    let mut document = resource_definition.clone();
    json_patch::patch(&mut document, &ops)?;
    Ok(document)
}
