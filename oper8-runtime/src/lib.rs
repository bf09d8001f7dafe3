//! Reconcile engine, watch dispatcher, reconcile scheduler, and leader election: the
//! orchestration layer that turns `oper8-core`'s pure data types and `oper8-client`'s
//! cluster access into a running operator.
//!
//! Mirrors `kube_runtime`'s role in the `kube` workspace: `oper8-core` is the data model
//! (`kube-core`), `oper8-client` is the transport (`kube-client`), and this crate is the
//! controller machinery built on top of both.

pub mod component;
pub mod controller;
pub mod dispatcher;
pub mod engine;
pub mod filters;
pub mod graph;
pub mod heartbeat;
pub mod leader_election;
pub mod scheduler;
pub mod session;
pub mod timer;

pub use component::{Component, ComponentContext, ComponentError, RenderedComponent, ResourceNode, VerifyOutcome};
pub use controller::{Controller, ControllerError, ReconcileResult};
pub use dispatcher::{ReconcileReason, ReconcileRequest, WatchDispatcher, WatchRequest};
pub use engine::{EngineError, ReconcileEngine};
pub use filters::{Filter, FilterNode};
pub use graph::{ComponentGraph, GraphError};
pub use heartbeat::HeartbeatWriter;
pub use leader_election::{AnnotationLeaderElection, DisabledLeaderElection, LeaderElection, LeaderForLife, LeaderWithLease, OperatorIdentity};
pub use scheduler::ReconcileScheduler;
pub use session::{ReconciliationId, Session};
pub use timer::TimerWheel;
