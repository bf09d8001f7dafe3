//! Pure data types and functions shared by the rest of the oper8 workspace: resource
//! identity, managed-object equality, the patch engine, status condition bookkeeping,
//! the dependency-hash stamper, the selector grammar, and process configuration.
//!
//! Nothing in this crate performs I/O; cluster access lives in `oper8-client` and
//! orchestration lives in `oper8-runtime`.

pub mod config;
pub mod deps_hash;
pub mod error;
pub mod managed_object;
pub mod patch;
pub mod resource_id;
pub mod selector;
pub mod status;

pub use config::{Config, ConfigError, LeaderElectionMode};
pub use error::CoreError;
pub use managed_object::{ManagedObject, ManagedObjectError};
pub use resource_id::{ApiVersion, ResourceId};
pub use selector::{Requirement, Selector, SelectorError};
pub use status::{ComponentOutcome, Condition, ConditionStatus, Failure, Reason};
