//! Concrete event filters: creation/deletion, generation, resource-version, annotation,
//! pause, label, dependent-watch, and enable/disable.

use super::Filter;
use oper8_client::WatchEventType;
use oper8_core::managed_object::ManagedObject;
use oper8_core::status::READY_TYPE;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, VecDeque};

fn hash_value(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(value).unwrap_or_default());
    format!("{:x}", hasher.finalize())
}

/// Reconcile on creation and deletion events only.
#[derive(Debug, Default)]
pub struct CreationDeletionFilter;

impl Filter for CreationDeletionFilter {
    fn test(&self, _resource: &ManagedObject, event: WatchEventType) -> Option<bool> {
        match event {
            WatchEventType::Added | WatchEventType::Deleted => Some(true),
            WatchEventType::Modified => None,
        }
    }
}

/// Reconcile when `metadata.generation` changes, for kinds that report one.
#[derive(Debug, Default)]
pub struct GenerationFilter {
    generation: Option<i64>,
}

impl Filter for GenerationFilter {
    fn test(&self, resource: &ManagedObject, event: WatchEventType) -> Option<bool> {
        self.generation?;
        if matches!(event, WatchEventType::Added | WatchEventType::Deleted) {
            return None;
        }
        Some(self.generation != current_generation(resource))
    }

    fn update(&mut self, resource: &ManagedObject) {
        self.generation = current_generation(resource);
    }
}

fn current_generation(resource: &ManagedObject) -> Option<i64> {
    resource.metadata().get("generation").and_then(Value::as_i64)
}

/// Reconcile on spec changes for kinds that don't report `generation` (e.g. `Pod`), by
/// hashing every top-level field except `metadata`/`status`/`kind`/`apiVersion`.
#[derive(Debug, Default)]
pub struct NoGenerationFilter {
    supports_generation: bool,
    resource_hashes: BTreeMap<String, String>,
}

impl NoGenerationFilter {
    #[must_use]
    pub fn new(resource: &ManagedObject) -> Self {
        Self {
            supports_generation: current_generation(resource).is_some(),
            resource_hashes: BTreeMap::new(),
        }
    }
}

const HASHED_FIELD_EXCLUSIONS: [&str; 4] = ["metadata", "status", "kind", "apiVersion"];

impl Filter for NoGenerationFilter {
    fn test(&self, resource: &ManagedObject, event: WatchEventType) -> Option<bool> {
        if self.supports_generation || self.resource_hashes.is_empty() {
            return None;
        }
        if matches!(event, WatchEventType::Added | WatchEventType::Deleted) {
            return None;
        }
        let changed = self.resource_hashes.iter().any(|(key, hash)| {
            let current = resource.definition().get(key).map(hash_value).unwrap_or_default();
            &current != hash
        });
        Some(changed)
    }

    fn update(&mut self, resource: &ManagedObject) {
        if self.supports_generation {
            return;
        }
        let Some(object) = resource.definition().as_object() else { return };
        for (key, value) in object {
            if HASHED_FIELD_EXCLUSIONS.contains(&key.as_str()) {
                continue;
            }
            self.resource_hashes.insert(key.clone(), hash_value(value));
        }
    }
}

const RESOURCE_VERSION_KEEP_COUNT: usize = 8;

/// Drop duplicate `resourceVersion`s replayed by a restarted watch connection.
pub struct ResourceVersionFilter {
    seen: VecDeque<String>,
}

impl Default for ResourceVersionFilter {
    fn default() -> Self {
        Self { seen: VecDeque::with_capacity(RESOURCE_VERSION_KEEP_COUNT) }
    }
}

impl Filter for ResourceVersionFilter {
    fn test(&self, resource: &ManagedObject, event: WatchEventType) -> Option<bool> {
        if matches!(event, WatchEventType::Deleted) {
            return None;
        }
        let Some(version) = resource.resource_version() else { return None };
        Some(!self.seen.contains(&version.to_string()))
    }

    fn update(&mut self, resource: &ManagedObject) {
        let Some(version) = resource.resource_version() else { return };
        if self.seen.len() == RESOURCE_VERSION_KEEP_COUNT {
            self.seen.pop_front();
        }
        self.seen.push_back(version.to_string());
    }
}

/// Reconcile when any annotation changes.
#[derive(Debug, Default)]
pub struct AnnotationFilter {
    annotations_hash: Option<String>,
}

impl AnnotationFilter {
    fn annotation_hash(&self, resource: &ManagedObject) -> String {
        hash_value(&annotations_of(resource))
    }
}

impl Filter for AnnotationFilter {
    fn test(&self, resource: &ManagedObject, event: WatchEventType) -> Option<bool> {
        if matches!(event, WatchEventType::Added | WatchEventType::Deleted) {
            return None;
        }
        Some(self.annotations_hash.as_deref() != Some(self.annotation_hash(resource).as_str()))
    }

    fn update(&mut self, resource: &ManagedObject) {
        self.annotations_hash = Some(self.annotation_hash(resource));
    }
}

/// Platform annotation prefixes excluded from [`UserAnnotationFilter`]'s comparison.
const RESERVED_PLATFORM_ANNOTATIONS: [&str; 2] = ["kubectl.kubernetes.io/", "oper8.dev/"];

/// Like [`AnnotationFilter`], but ignores platform-managed annotation keys so a
/// `kubectl apply` or an oper8-internal annotation bump doesn't trigger a reconcile loop.
#[derive(Debug, Default)]
pub struct UserAnnotationFilter {
    annotations_hash: Option<String>,
}

impl UserAnnotationFilter {
    fn annotation_hash(&self, resource: &ManagedObject) -> String {
        let mut filtered = serde_json::Map::new();
        if let Some(map) = annotations_of(resource).as_object() {
            for (key, value) in map {
                if RESERVED_PLATFORM_ANNOTATIONS.iter().any(|prefix| key.starts_with(prefix)) {
                    continue;
                }
                filtered.insert(key.clone(), value.clone());
            }
        }
        hash_value(&Value::Object(filtered))
    }
}

impl Filter for UserAnnotationFilter {
    fn test(&self, resource: &ManagedObject, event: WatchEventType) -> Option<bool> {
        if matches!(event, WatchEventType::Added | WatchEventType::Deleted) {
            return None;
        }
        Some(self.annotations_hash.as_deref() != Some(self.annotation_hash(resource).as_str()))
    }

    fn update(&mut self, resource: &ManagedObject) {
        self.annotations_hash = Some(self.annotation_hash(resource));
    }
}

fn annotations_of(resource: &ManagedObject) -> Value {
    resource.metadata().get("annotations").cloned().unwrap_or_else(|| Value::Object(serde_json::Map::new()))
}

/// Skip resources paused via the `oper8.dev/pause-execution` annotation.
#[derive(Debug, Default)]
pub struct PauseFilter;

impl Filter for PauseFilter {
    fn test(&self, resource: &ManagedObject, _event: WatchEventType) -> Option<bool> {
        let paused = annotations_of(resource).get(crate::engine::PAUSE_ANNOTATION).and_then(Value::as_str) == Some("true");
        Some(!paused)
    }
}

/// Reconcile an owning controller when a dependent's own `Ready` condition reason changes.
#[derive(Debug, Default)]
pub struct SubsystemStatusFilter {
    ready_reason: Option<String>,
}

impl SubsystemStatusFilter {
    fn ready_reason(resource: &ManagedObject) -> Option<String> {
        resource
            .get("status")
            .and_then(|status| status.get("conditions"))
            .and_then(Value::as_array)
            .and_then(|conditions| conditions.iter().find(|c| c.get("type").and_then(Value::as_str) == Some(READY_TYPE)))
            .and_then(|condition| condition.get("reason"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

impl Filter for SubsystemStatusFilter {
    fn test(&self, resource: &ManagedObject, event: WatchEventType) -> Option<bool> {
        if matches!(event, WatchEventType::Added | WatchEventType::Deleted) {
            return None;
        }
        Some(self.ready_reason != Self::ready_reason(resource))
    }

    fn update(&mut self, resource: &ManagedObject) {
        self.ready_reason = Self::ready_reason(resource);
    }
}

/// Ignore creation events for dependents the owning Component is assumed to have just
/// created itself.
#[derive(Debug, Default)]
pub struct DependentWatchFilter;

impl Filter for DependentWatchFilter {
    fn test(&self, _resource: &ManagedObject, event: WatchEventType) -> Option<bool> {
        Some(event != WatchEventType::Added)
    }
}

/// Reconcile only resources whose labels match every entry in `labels`.
#[derive(Debug, Clone)]
pub struct LabelFilter {
    labels: BTreeMap<String, String>,
}

impl LabelFilter {
    #[must_use]
    pub fn new(labels: BTreeMap<String, String>) -> Self {
        Self { labels }
    }
}

impl Filter for LabelFilter {
    fn test(&self, resource: &ManagedObject, _event: WatchEventType) -> Option<bool> {
        let resource_labels = resource.metadata().get("labels").cloned().unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        Some(self.labels.iter().all(|(key, value)| resource_labels.get(key).and_then(Value::as_str) == Some(value.as_str())))
    }
}

/// Unconditionally reject every event.
#[derive(Debug, Default)]
pub struct DisableFilter;

impl Filter for DisableFilter {
    fn test(&self, _resource: &ManagedObject, _event: WatchEventType) -> Option<bool> {
        Some(false)
    }
}

/// Unconditionally accept every event.
#[derive(Debug, Default)]
pub struct EnableFilter;

impl Filter for EnableFilter {
    fn test(&self, _resource: &ManagedObject, _event: WatchEventType) -> Option<bool> {
        Some(true)
    }
}
