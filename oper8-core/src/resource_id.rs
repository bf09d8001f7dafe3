//! Stable identity for an API object, independent of its manifest.
//!
//! Mirrors `kube_runtime::reflector::ObjectRef`'s `kind.version.group/name.namespace`
//! display convention, but carries the looser oper8 semantics: namespace and name are
//! both optional, since a [`ResourceId`] without a name denotes a collection (used for
//! watch registration) rather than a single resource.

use std::fmt;

/// A group+version pair as it appears in `apiVersion` (e.g. `apps/v1` or bare `v1`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ApiVersion {
    pub group: String,
    pub version: String,
}

impl ApiVersion {
    #[must_use]
    pub fn parse(api_version: &str) -> Self {
        match api_version.split_once('/') {
            Some((group, version)) => Self {
                group: group.to_string(),
                version: version.to_string(),
            },
            None => Self {
                group: String::new(),
                version: api_version.to_string(),
            },
        }
    }

    #[must_use]
    pub fn as_str(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable identity of an API object, or of a collection of objects of one kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceId {
    pub api_version: ApiVersion,
    pub kind: String,
    /// `None` for cluster-scoped resources or cluster-wide collection watches.
    pub namespace: Option<String>,
    /// `None` denotes a collection (kind + namespace) rather than a single resource.
    pub name: Option<String>,
}

impl ResourceId {
    #[must_use]
    pub fn new(api_version: &str, kind: &str) -> Self {
        Self {
            api_version: ApiVersion::parse(api_version),
            kind: kind.to_string(),
            namespace: None,
            name: None,
        }
    }

    #[must_use]
    pub fn within(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// `kind.version.group` — the key used for watch-request tables, independent of
    /// namespace or name.
    #[must_use]
    pub fn global_id(&self) -> String {
        format!("{}.{}.{}", self.kind, self.api_version.version, self.api_version.group)
    }

    /// `namespace.global_id`, or just `global_id` when cluster-scoped.
    #[must_use]
    pub fn namespaced_id(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}.{}", self.global_id()),
            None => self.global_id(),
        }
    }

    /// `name.<namespaced_id>` — fully qualifies a single resource.
    #[must_use]
    pub fn named_id(&self) -> Option<String> {
        self.name
            .as_ref()
            .map(|name| format!("{name}.{}", self.namespaced_id()))
    }

    /// A collection reference for this id's kind/namespace (drops `name`), used when
    /// registering or looking up watches.
    #[must_use]
    pub fn as_collection(&self) -> Self {
        Self {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            namespace: self.namespace.clone(),
            name: None,
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.kind, self.api_version.version, self.api_version.group)?;
        if let Some(name) = &self.name {
            write!(f, "/{name}")?;
        }
        if let Some(ns) = &self.namespace {
            write!(f, ".{ns}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_id_ignores_namespace_and_name() {
        let a = ResourceId::new("apps/v1", "Deployment").within("ns").named("foo");
        let b = ResourceId::new("apps/v1", "Deployment");
        assert_eq!(a.global_id(), b.global_id());
        assert_eq!(a.global_id(), "Deployment.v1.apps");
    }

    #[test]
    fn core_group_is_empty() {
        let id = ResourceId::new("v1", "Pod");
        assert_eq!(id.global_id(), "Pod.v1.");
    }

    #[test]
    fn namespaced_id_includes_namespace_only_when_present() {
        let cluster_scoped = ResourceId::new("v1", "Namespace").named("test");
        assert_eq!(cluster_scoped.namespaced_id(), "Namespace.v1.");

        let namespaced = ResourceId::new("v1", "Pod").within("ns1").named("foo");
        assert_eq!(namespaced.namespaced_id(), "ns1.Pod.v1.");
    }

    #[test]
    fn display_matches_dotted_convention() {
        let id = ResourceId::new("apps/v1", "Deployment").within("ns").named("foo");
        assert_eq!(format!("{id}"), "Deployment.v1.apps/foo.ns");
    }
}
