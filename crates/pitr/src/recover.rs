//! Top-level recovery driver.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cluster::{ClusterGateway, GtidSetOps};
use crate::error::{PitrError, Result};
use crate::pipeline::ReplayPipeline;
use crate::planner::{BinlogPlanner, RecoverMode, RecoveryRequest};
use crate::storage::{BinlogStore, ObjectBinlogStore, StorageConfig};

/// Single-shot point-in-time recovery run: read the cluster's executed GTID
/// set, plan the segment replay, stream it through the pipeline.
pub struct Recoverer {
    request: RecoveryRequest,
    store: Box<dyn BinlogStore>,
}

impl Recoverer {
    /// Validate the request and open the archive store. No cluster traffic
    /// happens until [`Recoverer::run`].
    pub fn new(
        request: RecoveryRequest,
        storage: &StorageConfig,
        verify_tls: bool,
    ) -> Result<Self> {
        request.validate()?;
        let store = ObjectBinlogStore::open(storage, verify_tls)?;
        Ok(Self {
            request,
            store: Box::new(store),
        })
    }

    /// Run the recovery to completion. The cluster connection is released on
    /// every exit path.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let gateway =
            ClusterGateway::connect(&self.request.host, &self.request.user, &self.request.pass);
        let result = self.run_with(&gateway, &cancel).await;
        if let Err(e) = gateway.close().await {
            warn!(error = %e, "closing cluster connection failed");
        }
        result
    }

    async fn run_with(&self, gateway: &ClusterGateway, cancel: &CancellationToken) -> Result<()> {
        let start_gtid = match cancel.run_until_cancelled(gateway.executed_set()).await {
            None => return Err(PitrError::Cancelled),
            Some(set) => set?,
        };
        info!(%start_gtid, "current executed gtid set");

        let planner = BinlogPlanner::new(self.store.as_ref(), gateway, cancel.clone());
        if self.request.mode == RecoverMode::Transaction {
            if let Some(target) = self.request.gtid.as_deref() {
                planner.preflight(target, &start_gtid).await?;
            }
        }
        let plan = planner.plan(&self.request, &start_gtid).await?;

        // The replayed stream may contain DDL that collides with the helper
        // functions, so they go away before the first statement lands.
        match cancel.run_until_cancelled(gateway.drop_helpers()).await {
            None => return Err(PitrError::Cancelled),
            Some(dropped) => dropped?,
        }

        let pipeline = ReplayPipeline::new(
            self.store.as_ref(),
            gateway.host(),
            &self.request.user,
            self.request.pass.clone(),
        );
        pipeline.run(&plan, cancel).await
    }
}
