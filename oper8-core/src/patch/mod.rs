//! Patch engines: strategic-merge (RFC 7386 + Kubernetes list-merge directives), plain
//! JSON Patch (RFC 6902), and the `TemporaryPatch` dispatch layer built on top of both.

pub mod json_patch;
pub mod strategic_merge;
pub mod temporary;

pub use json_patch::{apply_json_patch, JsonPatchError};
pub use strategic_merge::{patch_strategic_merge, MergeKeyTable, StrategicMergeError};
pub use temporary::{apply_patches, PatchType, TemporaryPatch, TemporaryPatchError};
