use std::sync::Arc;
use std::time;

use doorbell_common::database::DatabaseResult;
use doorbell_common::events::EventSource;
use health::HealthHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Releases claims left behind by workers that died mid-event, so the events get processed again.
pub struct StaleClaimSweeper {
    source: Arc<dyn EventSource>,
    interval: time::Duration,
    stale_after: time::Duration,
    liveness: HealthHandle,
}

impl StaleClaimSweeper {
    pub fn new(
        source: Arc<dyn EventSource>,
        interval: time::Duration,
        stale_after: time::Duration,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            source,
            interval,
            stale_after,
            liveness,
        }
    }

    pub async fn sweep_once(&self) -> DatabaseResult<u64> {
        let released = self.source.reclaim_stale(self.stale_after).await?;

        if released > 0 {
            info!(released, "released stale claims");
            metrics::counter!("doorbell_stale_claims_reclaimed").increment(released);
        }

        Ok(released)
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.sweep_once().await {
                Ok(_) => self.liveness.report_healthy(),
                Err(error) => error!("failed to release stale claims: {}", error),
            }
        }
    }
}
