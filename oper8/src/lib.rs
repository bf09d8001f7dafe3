//! Facade crate for the oper8 operator framework, re-exporting `oper8-core` (data model),
//! `oper8-client` (cluster transport), and `oper8-runtime` (controller machinery) the way
//! the `kube` crate re-exports `kube-core`/`kube-client`/`kube-runtime`.
//!
//! Most operators only need this crate: implement [`Controller`] and [`Component`], build a
//! [`ReconcileEngine`] over a [`ClusterAdapter`], and drive it with a [`ReconcileScheduler`]
//! fed by a [`WatchDispatcher`].
//!
//! ```no_run
//! use oper8::{Config, DryRunClusterAdapter, ReconcileEngine};
//! use std::sync::Arc;
//!
//! # async fn run() {
//! let config = Arc::new(Config::from_env().unwrap());
//! let adapter = Arc::new(DryRunClusterAdapter::new());
//! let engine = ReconcileEngine::new(adapter, Arc::clone(&config));
//! # let _ = engine;
//! # }
//! ```

pub use oper8_core::{
    config, deps_hash, error, managed_object, patch, resource_id, selector, status, ApiVersion,
    Condition, ConditionStatus, ComponentOutcome, Config, ConfigError, CoreError, Failure,
    LeaderElectionMode, ManagedObject, ManagedObjectError, Reason, Requirement, ResourceId,
    Selector, SelectorError,
};

pub use oper8_client::{
    adapter, dry_run, kube_adapter, owner_refs, ApplyMethod, ClusterAdapter, ClusterError,
    DryRunClusterAdapter, KubeClusterAdapter, OwnerIdentity, QueryOptions, RetryPolicy,
    WatchEvent, WatchEventType, WatchStream, WriteOutcome,
};

pub use oper8_runtime::{
    component, controller, dispatcher, engine, filters, graph, heartbeat, leader_election,
    scheduler, session, timer, AnnotationLeaderElection, Component, ComponentContext,
    ComponentError, Controller, ControllerError, DisabledLeaderElection, EngineError, Filter,
    FilterNode, GraphError, HeartbeatWriter, LeaderElection, LeaderForLife, LeaderWithLease,
    OperatorIdentity, ReconcileEngine, ReconcileReason, ReconcileRequest, ReconcileResult,
    ReconciliationId, Session, TimerWheel, WatchDispatcher, WatchRequest, ComponentGraph,
    RenderedComponent, ResourceNode, ReconcileScheduler, VerifyOutcome,
};
