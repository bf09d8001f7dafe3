//! Event filters that decide whether a watch event is worth reconciling over, and the
//! `And`/`Or` combinators ([`pipeline::FilterNode`]) that compose them into a pipeline.

pub mod builtin;
pub mod pipeline;

use oper8_core::managed_object::ManagedObject;
use oper8_client::WatchEventType;

pub use pipeline::FilterNode;

/// A single stateful predicate over a resource's watch events. A fresh instance is
/// created per watched resource; `update` lets a filter
/// remember what it last saw (a generation, a resource version, an annotation hash) so
/// `test` can compare against it on the next event.
pub trait Filter: Send + Sync {
    /// Decide whether this event should cause a reconcile. `None` means this filter has
    /// no opinion on the event and should be ignored when combining results.
    fn test(&self, resource: &ManagedObject, event: WatchEventType) -> Option<bool>;

    /// Record state observed on this event. Called unconditionally after `test`,
    /// regardless of its result.
    fn update(&mut self, _resource: &ManagedObject) {}
}
