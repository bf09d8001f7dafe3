//! The `ClusterAdapter` trait: the uniform surface the rest of the framework uses to talk
//! to a cluster (real or in-memory).

use async_trait::async_trait;
use oper8_core::resource_id::ResourceId;
use serde_json::Value;
use std::time::Duration;

/// Server-side write strategy for [`ClusterAdapter::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMethod {
    /// Server-side apply, falling back to `Replace` on an immutable-field conflict or a
    /// `422 Unprocessable` response (when the fallback toggle is enabled).
    Default,
    /// A field-level merge (JSON merge patch) that preserves keys the adapter did not set.
    Update,
    /// Always `PUT` the full object.
    Replace,
}

/// A single watch event.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub event_type: WatchEventType,
    pub resource: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

/// Parameters narrowing a `list`/`watch` call. Selectors are carried as raw strings in the
/// published grammar so the real adapter can forward them verbatim to the API server's own
/// selector evaluation, while the dry-run adapter parses them locally via
/// [`oper8_core::selector::Selector`].
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
}

/// Owning CR identity, used to compute the owner reference block `apply` merges in when
/// `manage_owner_refs` is set.
#[derive(Debug, Clone)]
pub struct OwnerIdentity {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    pub namespace: Option<String>,
}

/// Outcome of a write operation: whether it succeeded, and whether it changed cluster
/// state (used to drive the engine's per-component "changed" bookkeeping).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub success: bool,
    pub changed: bool,
}

/// Uniform operations against a Kubernetes-shaped API, implemented once against the real
/// cluster ([`crate::kube_adapter::KubeClusterAdapter`]) and once in-memory
/// ([`crate::dry_run::DryRunClusterAdapter`]) for tests and nested dry-run reconciles.
#[async_trait]
pub trait ClusterAdapter: Send + Sync {
    /// Fetch current state. `Ok(None)` represents a `404 Not Found`, treated as success.
    async fn get(&self, id: &ResourceId) -> Result<Option<Value>, ClusterError>;

    /// List objects of a kind, optionally scoped by namespace and selectors.
    async fn list(&self, api_version: &str, kind: &str, options: &QueryOptions) -> Result<Vec<Value>, ClusterError>;

    /// Open a restartable event stream. Implementations must transparently resume: on
    /// `410 Gone` restart without a resource version, on transient errors resume from
    /// `since_resource_version`, and surface a fatal [`ClusterError::Fatal`] once the
    /// configured retry budget is exhausted.
    async fn watch(
        &self,
        api_version: &str,
        kind: &str,
        options: &QueryOptions,
        since_resource_version: Option<String>,
    ) -> Result<WatchStream, ClusterError>;

    /// Apply a batch of manifests.
    async fn apply(&self, manifests: &[Value], manage_owner_refs: Option<&OwnerIdentity>, method: ApplyMethod) -> Result<Vec<WriteOutcome>, ClusterError>;

    /// Delete each manifest by identity. A `404` is success with `changed=false`.
    async fn disable(&self, manifests: &[Value]) -> Result<Vec<WriteOutcome>, ClusterError>;

    /// Read-modify-write the `status` subresource, serialized per adapter instance.
    async fn set_status(&self, id: &ResourceId, status: &Value) -> Result<WriteOutcome, ClusterError>;

    async fn add_finalizer(&self, id: &ResourceId, name: &str) -> Result<WriteOutcome, ClusterError>;
    async fn remove_finalizer(&self, id: &ResourceId, name: &str) -> Result<WriteOutcome, ClusterError>;
}

/// A boxed stream of watch events, abstracting over the real/dry-run implementations'
/// differing concrete stream types.
pub type WatchStream = std::pin::Pin<Box<dyn futures::Stream<Item = Result<WatchEvent, ClusterError>> + Send>>;

/// Failure classification: transient errors are retried by the caller with backoff,
/// permanent ones surface as `ClusterError`, not-found is usually folded into a successful
/// `Option::None`/`changed=false` result rather than raised here.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("transient cluster error: {0}")]
    Transient(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("conflict after exhausting retry budget: {0}")]
    ConflictRetriesExhausted(String),
    #[error("fatal: retry budget exhausted: {0}")]
    Fatal(String),
    #[error("malformed resource: {0}")]
    Malformed(String),
}

impl ClusterError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::ConflictRetriesExhausted(_))
    }
}

/// Bounded exponential backoff parameters shared by apply/setStatus/finalizer retries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        self.base_backoff.saturating_mul(1 << attempt.min(16))
    }
}
