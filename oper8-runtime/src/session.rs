//! Per-reconciliation context. Created at the top of a reconcile,
//! destroyed at the end; never shared across workers.

use crate::graph::ComponentGraph;
use oper8_client::ClusterAdapter;
use oper8_core::config::Config;
use oper8_core::status::Condition;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Opaque unique reconciliation id, logged alongside every event emitted during a
/// reconcile so log lines can be correlated back to a single run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReconciliationId(pub String);

impl ReconciliationId {
    #[must_use]
    pub fn generate() -> Self {
        use rand::Rng;
        let suffix: u64 = rand::thread_rng().gen();
        Self(format!("{suffix:016x}"))
    }
}

/// Per-reconciliation state.
pub struct Session {
    pub id: ReconciliationId,
    pub owner: Value,
    pub config: Arc<Config>,
    pub adapter: Arc<dyn ClusterAdapter>,
    pub graph: ComponentGraph,
    pub status_conditions: Vec<Condition>,
    pub finalizers_to_add: BTreeSet<String>,
    pub finalizers_to_remove: BTreeSet<String>,
}

impl Session {
    #[must_use]
    pub fn new(owner: Value, config: Arc<Config>, adapter: Arc<dyn ClusterAdapter>) -> Self {
        Self {
            id: ReconciliationId::generate(),
            owner,
            config,
            adapter,
            graph: ComponentGraph::new(),
            status_conditions: Vec::new(),
            finalizers_to_add: BTreeSet::new(),
            finalizers_to_remove: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn owner_namespace(&self) -> Option<&str> {
        self.owner.pointer("/metadata/namespace").and_then(Value::as_str)
    }

    #[must_use]
    pub fn owner_name(&self) -> Option<&str> {
        self.owner.pointer("/metadata/name").and_then(Value::as_str)
    }

    #[must_use]
    pub fn owner_uid(&self) -> Option<&str> {
        self.owner.pointer("/metadata/uid").and_then(Value::as_str)
    }

    pub fn add_finalizer(&mut self, name: impl Into<String>) {
        self.finalizers_to_add.insert(name.into());
    }

    pub fn remove_finalizer(&mut self, name: impl Into<String>) {
        self.finalizers_to_remove.insert(name.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconciliation_ids_are_distinct() {
        let a = ReconciliationId::generate();
        let b = ReconciliationId::generate();
        assert_ne!(a, b);
    }
}
