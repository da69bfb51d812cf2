//! Cluster membership as seen by node operations.

use nodeplane_core::Result;
use tracing::debug;

#[async_trait::async_trait]
pub trait Cluster: Send + Sync {
    /// Fails when taking this node down now would hurt the cluster.
    async fn check_health(&self) -> Result<()>;

    /// Leave the cluster ahead of a graceful reset.
    async fn leave(&self) -> Result<()>;
}

/// A node that is not part of any cluster.
pub struct StandaloneCluster;

#[async_trait::async_trait]
impl Cluster for StandaloneCluster {
    async fn check_health(&self) -> Result<()> {
        debug!("standalone node, cluster health check passes");
        Ok(())
    }

    async fn leave(&self) -> Result<()> {
        debug!("standalone node, nothing to leave");
        Ok(())
    }
}
