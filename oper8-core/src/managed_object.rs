//! Wire-level identity for an API object: a cached decomposition of the well-known
//! metadata fields plus the full manifest they were read from.
//!
//! Two instances are equal iff they share a `uid`, or (when `uid` is absent) the same
//! `apiVersion`/`kind`/`name` triple.

use serde_json::Value;
use std::fmt;
use std::hash::{Hash, Hasher};

const LIST_KIND_SUFFIX: &str = "List";

/// Errors constructing a [`ManagedObject`] from a raw manifest.
#[derive(Debug, thiserror::Error)]
pub enum ManagedObjectError {
    #[error("manifest has no 'kind' field")]
    MissingKind,
    #[error("manifest has no 'apiVersion' field")]
    MissingApiVersion,
    #[error("manifest of kind '{0}' has no 'metadata.name'")]
    MissingName(String),
}

/// A read-only view of a Kubernetes object as received from the cluster (or rendered by
/// a component). Immutable once constructed for a given event: later updates to the same
/// resource are represented by constructing a new `ManagedObject`, never by mutating one.
#[derive(Debug, Clone)]
pub struct ManagedObject {
    definition: Value,
    kind: String,
    api_version: String,
    name: Option<String>,
    namespace: Option<String>,
    uid: Option<String>,
    resource_version: Option<String>,
}

impl ManagedObject {
    /// Build a `ManagedObject` from a raw manifest. List kinds (`FooList`) are exempt
    /// from the name requirement.
    pub fn from_manifest(definition: Value) -> Result<Self, ManagedObjectError> {
        let kind = definition
            .get("kind")
            .and_then(Value::as_str)
            .ok_or(ManagedObjectError::MissingKind)?
            .to_string();
        let api_version = definition
            .get("apiVersion")
            .and_then(Value::as_str)
            .ok_or(ManagedObjectError::MissingApiVersion)?
            .to_string();
        let metadata = definition.get("metadata");
        let name = metadata
            .and_then(|m| m.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string);
        if name.is_none() && !kind.ends_with(LIST_KIND_SUFFIX) {
            return Err(ManagedObjectError::MissingName(kind));
        }
        let namespace = metadata
            .and_then(|m| m.get("namespace"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let uid = metadata
            .and_then(|m| m.get("uid"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let resource_version = metadata
            .and_then(|m| m.get("resourceVersion"))
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Self {
            definition,
            kind,
            api_version,
            name,
            namespace,
            uid,
            resource_version,
        })
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    #[must_use]
    pub fn api_version(&self) -> &str {
        &self.api_version
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    #[must_use]
    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    #[must_use]
    pub fn resource_version(&self) -> Option<&str> {
        self.resource_version.as_deref()
    }

    #[must_use]
    pub fn definition(&self) -> &Value {
        &self.definition
    }

    #[must_use]
    pub fn metadata(&self) -> Value {
        self.definition
            .get("metadata")
            .cloned()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()))
    }

    /// Look up a top-level or dotted field from the underlying manifest.
    #[must_use]
    pub fn get(&self, pointer_path: &str) -> Option<&Value> {
        self.definition.get(pointer_path)
    }

    /// The identity used for dedup maps: `uid` if known, else `apiVersion/kind/name`.
    #[must_use]
    pub fn identity_key(&self) -> String {
        match &self.uid {
            Some(uid) => uid.clone(),
            None => format!("{}/{}/{}", self.api_version, self.kind, self.name.as_deref().unwrap_or("")),
        }
    }
}

impl fmt::Display for ManagedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.api_version, self.kind, self.name.as_deref().unwrap_or(""))
    }
}

impl PartialEq for ManagedObject {
    fn eq(&self, other: &Self) -> bool {
        self.identity_key() == other.identity_key()
    }
}
impl Eq for ManagedObject {}

impl Hash for ManagedObject {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity_key().hash(state);
    }
}
