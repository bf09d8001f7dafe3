//! Aggregate error type for `oper8-core`, used where a caller wants a single error
//! surface across the pure-data layer rather than matching on each module's own enum.

use crate::config::ConfigError;
use crate::managed_object::ManagedObjectError;
use crate::patch::{JsonPatchError, StrategicMergeError, TemporaryPatchError};
use crate::selector::SelectorError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    ManagedObject(#[from] ManagedObjectError),
    #[error(transparent)]
    StrategicMerge(#[from] StrategicMergeError),
    #[error(transparent)]
    JsonPatch(#[from] JsonPatchError),
    #[error(transparent)]
    TemporaryPatch(#[from] TemporaryPatchError),
    #[error(transparent)]
    Selector(#[from] SelectorError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
