//! Always-leader implementation, used by default for tests and `dry_run`, or whenever
//! leader election is configured off.

use super::LeaderElection;
use async_trait::async_trait;
use oper8_core::resource_id::ResourceId;

#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledLeaderElection;

#[async_trait]
impl LeaderElection for DisabledLeaderElection {
    async fn acquire(&self, _force: bool) -> bool {
        true
    }

    async fn acquire_resource(&self, _resource: &ResourceId) -> bool {
        true
    }

    async fn release(&self) {}

    async fn release_resource(&self, _resource: &ResourceId) {}

    async fn is_leader(&self, _resource: Option<&ResourceId>) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn always_reports_leadership() {
        let election = DisabledLeaderElection;
        assert!(election.acquire(false).await);
        assert!(election.is_leader(None).await);
    }
}
