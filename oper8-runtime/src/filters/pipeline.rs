//! Composition of [`Filter`]s into `And`/`Or` trees: filters in a list are ANDed
//! together, filters in a tuple are ORed.
//!
//! A short-circuiting pipeline could skip re-testing (but not updating) filters once a
//! combinator's outcome is already decided, purely as a performance optimization.
//! `FilterNode` always tests every leaf before updating any of them, trading that
//! optimization for a pipeline that is trivial to reason about — the combined boolean
//! result is identical either way.

use super::Filter;
use oper8_client::WatchEventType;
use oper8_core::managed_object::ManagedObject;

/// A tree of filters. `Leaf` wraps a single stateful [`Filter`]; `All`/`Or` combine their
/// children's results with the given boolean operator, ignoring children that abstain
/// (return `None`).
pub enum FilterNode {
    Leaf(Box<dyn Filter>),
    All(Vec<FilterNode>),
    Any(Vec<FilterNode>),
}

impl FilterNode {
    #[must_use]
    pub fn leaf(filter: impl Filter + 'static) -> Self {
        Self::Leaf(Box::new(filter))
    }

    #[must_use]
    pub fn all(children: Vec<FilterNode>) -> Self {
        Self::All(children)
    }

    #[must_use]
    pub fn any(children: Vec<FilterNode>) -> Self {
        Self::Any(children)
    }

    /// Recursively test every filter without updating any of them.
    #[must_use]
    pub fn test(&self, resource: &ManagedObject, event: WatchEventType) -> Option<bool> {
        match self {
            Self::Leaf(filter) => filter.test(resource, event),
            Self::All(children) => combine(children.iter().map(|c| c.test(resource, event)), |a, b| a && b),
            Self::Any(children) => combine(children.iter().map(|c| c.test(resource, event)), |a, b| a || b),
        }
    }

    /// Recursively update every filter's remembered state, unconditionally.
    pub fn update(&mut self, resource: &ManagedObject) {
        match self {
            Self::Leaf(filter) => filter.update(resource),
            Self::All(children) | Self::Any(children) => {
                for child in children.iter_mut() {
                    child.update(resource);
                }
            }
        }
    }

    /// Test, then update. A pipeline with no opinionated filter (every leaf abstained)
    /// does not reconcile: if no filter cared about the event, nothing fires.
    pub fn update_and_test(&mut self, resource: &ManagedObject, event: WatchEventType) -> bool {
        let result = self.test(resource, event).unwrap_or(false);
        self.update(resource);
        result
    }
}

fn combine(results: impl Iterator<Item = Option<bool>>, op: fn(bool, bool) -> bool) -> Option<bool> {
    results.fold(None, |acc, item| match (acc, item) {
        (acc, None) => acc,
        (None, Some(b)) => Some(b),
        (Some(a), Some(b)) => Some(op(a, b)),
    })
}
