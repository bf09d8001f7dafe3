//! `ComponentGraph`: the DAG over Components within a Session.
//!
//! Invariants enforced at construction-close time: (a) acyclic, (b) each Component name
//! unique, (c) upstream references resolve. Mutated only during setup; frozen thereafter
//! (`ComponentGraph::seal`). Styled after `kube_runtime::reflector`-style typed-registry
//! bookkeeping, generalized to a general DAG since components form a tree, not a flat
//! store.

use crate::component::Component;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("duplicate component name: {0}")]
    DuplicateName(String),
    #[error("component '{0}' declares unknown upstream '{1}'")]
    UnknownUpstream(String, String),
    #[error("cycle detected among components: {0:?}")]
    Cycle(Vec<String>),
}

/// Directed acyclic graph of Components, built during the setup phase of a reconcile and
/// frozen before rollout begins.
pub struct ComponentGraph {
    components: HashMap<String, Arc<dyn Component>>,
    sealed: bool,
}

impl Default for ComponentGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentGraph {
    #[must_use]
    pub fn new() -> Self {
        Self { components: HashMap::new(), sealed: false }
    }

    /// Register a Component. Errors if the name is already taken or the graph is sealed.
    pub fn add(&mut self, component: Arc<dyn Component>) -> Result<(), GraphError> {
        if self.sealed {
            return Err(GraphError::DuplicateName(component.name().to_string()));
        }
        let name = component.name().to_string();
        if self.components.contains_key(&name) {
            return Err(GraphError::DuplicateName(name));
        }
        self.components.insert(name, component);
        Ok(())
    }

    /// Validate upstream references resolve and the graph is acyclic, then freeze it.
    pub fn seal(&mut self) -> Result<(), GraphError> {
        for component in self.components.values() {
            for upstream in component.upstreams() {
                if !self.components.contains_key(upstream) {
                    return Err(GraphError::UnknownUpstream(component.name().to_string(), upstream.clone()));
                }
            }
        }
        self.topological_order()?;
        self.sealed = true;
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Component>> {
        self.components.get(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.components.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Deploy order: a topological sort, ties broken by name for determinism.
    pub fn topological_order(&self) -> Result<Vec<String>, GraphError> {
        let mut indegree: HashMap<&str, usize> = self.components.keys().map(|k| (k.as_str(), 0usize)).collect();
        let mut downstream: HashMap<&str, Vec<&str>> = HashMap::new();
        for component in self.components.values() {
            for upstream in component.upstreams() {
                *indegree.get_mut(component.name()).expect("name present") += 1;
                downstream.entry(upstream.as_str()).or_default().push(component.name());
            }
        }

        let mut ready: Vec<&str> = indegree.iter().filter(|(_, d)| **d == 0).map(|(n, _)| *n).collect();
        ready.sort_unstable();
        let mut order = Vec::with_capacity(self.components.len());
        let mut ready_heap = ready;

        while let Some(name) = ready_heap.first().copied() {
            ready_heap.remove(0);
            order.push(name.to_string());
            if let Some(children) = downstream.get(name) {
                let mut newly_ready = Vec::new();
                for child in children {
                    let entry = indegree.get_mut(child).expect("child present");
                    *entry -= 1;
                    if *entry == 0 {
                        newly_ready.push(*child);
                    }
                }
                ready_heap.extend(newly_ready);
                ready_heap.sort_unstable();
                ready_heap.dedup();
            }
        }

        if order.len() != self.components.len() {
            let remaining: HashSet<String> = self.components.keys().cloned().collect();
            let visited: HashSet<String> = order.iter().cloned().collect();
            let stuck: Vec<String> = remaining.difference(&visited).cloned().collect();
            return Err(GraphError::Cycle(stuck));
        }
        Ok(order)
    }

    /// Finalize order: the reverse of deploy order. Finalization visits Components in
    /// reverse topological order, tearing down downstream resources before upstream ones.
    pub fn finalize_order(&self) -> Result<Vec<String>, GraphError> {
        let mut order = self.topological_order()?;
        order.reverse();
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{ComponentContext, ComponentError, RenderedComponent, VerifyOutcome};
    use async_trait::async_trait;

    struct Stub {
        name: String,
        upstreams: Vec<String>,
    }

    #[async_trait]
    impl Component for Stub {
        fn name(&self) -> &str {
            &self.name
        }
        fn upstreams(&self) -> &[String] {
            &self.upstreams
        }
        async fn render(&self, _ctx: &ComponentContext<'_>) -> Result<RenderedComponent, ComponentError> {
            Ok(RenderedComponent::default())
        }
        async fn verify(&self, _ctx: &ComponentContext<'_>, _rendered: &RenderedComponent) -> Result<VerifyOutcome, ComponentError> {
            Ok(VerifyOutcome::Verified)
        }
    }

    fn stub(name: &str, upstreams: &[&str]) -> Arc<dyn Component> {
        Arc::new(Stub { name: name.to_string(), upstreams: upstreams.iter().map(|s| s.to_string()).collect() })
    }

    #[test]
    fn topological_order_respects_upstreams() {
        let mut graph = ComponentGraph::new();
        graph.add(stub("db", &[])).unwrap();
        graph.add(stub("web", &["db"])).unwrap();
        graph.add(stub("ingress", &["web"])).unwrap();
        graph.seal().unwrap();

        let order = graph.topological_order().unwrap();
        assert_eq!(order, vec!["db", "web", "ingress"]);
    }

    #[test]
    fn finalize_order_is_reversed() {
        let mut graph = ComponentGraph::new();
        graph.add(stub("db", &[])).unwrap();
        graph.add(stub("web", &["db"])).unwrap();
        graph.seal().unwrap();
        assert_eq!(graph.finalize_order().unwrap(), vec!["web", "db"]);
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let mut graph = ComponentGraph::new();
        graph.add(stub("a", &[])).unwrap();
        assert_eq!(graph.add(stub("a", &[])), Err(GraphError::DuplicateName("a".to_string())));
    }

    #[test]
    fn unknown_upstream_is_rejected_on_seal() {
        let mut graph = ComponentGraph::new();
        graph.add(stub("web", &["missing"])).unwrap();
        assert!(matches!(graph.seal(), Err(GraphError::UnknownUpstream(_, _))));
    }

    #[test]
    fn cycle_is_rejected_on_seal() {
        let mut graph = ComponentGraph::new();
        graph.add(stub("a", &["b"])).unwrap();
        graph.add(stub("b", &["a"])).unwrap();
        assert!(matches!(graph.seal(), Err(GraphError::Cycle(_))));
    }
}
