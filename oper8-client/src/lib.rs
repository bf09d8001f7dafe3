//! The `ClusterAdapter` contract and its two implementations: a real adapter backed by
//! the published `kube`/`k8s-openapi` crates, and an in-memory dry-run adapter used by
//! tests and nested dry-run reconciles.

pub mod adapter;
pub mod dry_run;
pub mod kube_adapter;
pub mod owner_refs;

pub use adapter::{ApplyMethod, ClusterAdapter, ClusterError, OwnerIdentity, QueryOptions, RetryPolicy, WatchEvent, WatchEventType, WatchStream, WriteOutcome};
pub use dry_run::DryRunClusterAdapter;
pub use kube_adapter::KubeClusterAdapter;
