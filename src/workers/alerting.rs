//! Alert dispatch worker

use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, error, instrument};

use crate::context::ServerContext;
use crate::storage::StorageResult;

/// Deliver every pending alert as one batch and dequeue it
///
/// Returns the number of alerts handed to the dispatcher. Nothing is
/// dispatched or marked when the queue is empty.
pub async fn dispatch_pending(ctx: &ServerContext) -> StorageResult<usize> {
    let alerts = ctx.backend.get_pending_alerts().await?;
    if alerts.is_empty() {
        return Ok(0);
    }

    ctx.alerts.dispatch_server_alerts(&alerts).await;

    let ids: Vec<i64> = alerts.iter().map(|alert| alert.id).collect();
    ctx.backend.mark_alerts_sent(&ids).await?;

    debug!("dispatched {} pending alerts", ids.len());
    Ok(ids.len())
}

#[instrument(name = "alerting_worker", skip_all)]
pub async fn run(ctx: ServerContext, interval: Duration) {
    debug!("starting alerting worker");

    loop {
        if let Err(e) = dispatch_pending(&ctx).await {
            error!("alert dispatch failed: {e}");
            break;
        }
        sleep(interval).await;
    }

    ctx.shutdown.trigger("alerting worker failed");
}
