//! Database cleanup worker

use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, error, instrument};

use crate::context::ServerContext;
use crate::storage::StorageResult;

/// Run one compaction pass
pub async fn compact_once(ctx: &ServerContext) -> StorageResult<()> {
    ctx.backend.cleanup().await?;
    debug!("storage compacted");
    Ok(())
}

#[instrument(name = "cleanup_worker", skip_all)]
pub async fn run(ctx: ServerContext, interval: Duration) {
    debug!("starting cleanup worker");

    loop {
        if let Err(e) = compact_once(&ctx).await {
            error!("database cleanup failed: {e}");
            break;
        }
        sleep(interval).await;
    }

    ctx.shutdown.trigger("cleanup worker failed");
}
