//! The `Controller` trait: user-provided code that populates a Session's
//! `ComponentGraph` and reacts to rollout completion.

use crate::session::Session;
use async_trait::async_trait;
use std::time::Duration;

/// Outcome of a full reconcile, returned to the Scheduler.
#[derive(Debug, Clone)]
pub struct ReconcileResult {
    pub requeue: bool,
    pub requeue_after: Option<Duration>,
    pub terminal_error: Option<String>,
}

impl ReconcileResult {
    #[must_use]
    pub fn stable() -> Self {
        Self { requeue: false, requeue_after: None, terminal_error: None }
    }

    #[must_use]
    pub fn requeue_after(duration: Duration) -> Self {
        Self { requeue: true, requeue_after: Some(duration), terminal_error: None }
    }

    #[must_use]
    pub fn errored(message: impl Into<String>, requeue_after: Duration) -> Self {
        Self { requeue: true, requeue_after: Some(requeue_after), terminal_error: Some(message.into()) }
    }
}

/// A user-defined controller for one (group, version, kind). Statically declares its
/// watched kind and the finalizer it manages, and populates the Session's
/// `ComponentGraph` on each reconcile/finalize pass.
#[async_trait]
pub trait Controller: Send + Sync {
    fn group(&self) -> &str;
    fn version(&self) -> &str;
    fn kind(&self) -> &str;

    /// The finalizer name this controller manages, if any. `None` means finalize
    /// requests short-circuit immediately.
    fn finalizer_name(&self) -> Option<&str> {
        None
    }

    /// Populate `session.graph` with the Components to deploy this reconcile.
    async fn setup_components(&self, session: &mut Session) -> Result<(), ControllerError>;

    /// Populate `session.graph` with the Components to disable during finalization.
    /// Defaults to the same graph as `setup_components`.
    async fn finalize_components(&self, session: &mut Session) -> Result<(), ControllerError> {
        self.setup_components(session).await
    }

    /// Called after every Component deployed and verified.
    async fn after_verify(&self, _session: &mut Session) -> Result<(), ControllerError> {
        Ok(())
    }

    /// Called after every Component deployed successfully, even if unverified.
    async fn after_deploy(&self, _session: &mut Session) -> Result<(), ControllerError> {
        Ok(())
    }

    /// Decide whether (and after how long) to requeue. Default policy: requeue on any
    /// unverified Component or classified transient error.
    fn should_requeue(&self, any_unverified: bool, transient_error: bool) -> Option<Duration> {
        if any_unverified || transient_error {
            Some(Duration::from_secs(30))
        } else {
            None
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("failed to set up components: {0}")]
    Setup(String),
    #[error("post-hook failed: {0}")]
    PostHook(String),
}
