//! Service monitoring worker
//!
//! Declares an outage for every `(ident, mod)` pair whose last report is
//! older than the configured service timeout. The sweep reads all records
//! and then writes the stale ones individually; a report arriving between
//! the read and the write is overwritten and repaired by the agent's next
//! report.

use std::time::Duration;

use chrono::Utc;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use crate::context::ServerContext;
use crate::status;
use crate::storage::{HealthTransition, StatusRecord, StorageResult};

/// Message stored on records the sweep moved into outage
pub fn outage_message(timeout: Duration) -> String {
    format!("No report received for {} seconds", timeout.as_secs())
}

/// Run one sweep as of `now` (epoch milliseconds)
///
/// Returns the number of records moved into outage.
pub async fn sweep(ctx: &ServerContext, now: i64) -> StorageResult<usize> {
    let timeout_ms = i64::try_from(ctx.service_timeout.as_millis()).unwrap_or(i64::MAX);
    let max_age = now.saturating_sub(timeout_ms);

    let records = ctx.backend.list_all_status_records().await?;
    let mut marked = 0;

    for record in records {
        if record.is_outage() || !record.is_stale(max_age) {
            continue;
        }

        let outage = StatusRecord::new(
            record.ident.clone(),
            record.module.clone(),
            status::OUTAGE,
            Some(outage_message(ctx.service_timeout)),
            now,
        );
        let transition = HealthTransition::between(Some(&record), &outage);

        warn!(
            ident = %record.ident,
            module = %record.module,
            "no report since {}, marking as outage",
            record.updated_at
        );

        ctx.backend.process_status_update(&outage, &transition).await?;
        marked += 1;
    }

    Ok(marked)
}

#[instrument(name = "monitor_worker", skip_all)]
pub async fn run(ctx: ServerContext, grace: Duration, interval: Duration) {
    info!("service monitoring starts in {}s", grace.as_secs());
    sleep(grace).await;

    loop {
        match sweep(&ctx, Utc::now().timestamp_millis()).await {
            Ok(0) => {}
            Ok(marked) => debug!("{marked} modules moved into outage"),
            Err(e) => {
                error!("service monitoring failed: {e}");
                break;
            }
        }
        sleep(interval).await;
    }

    ctx.shutdown.trigger("service monitoring worker failed");
}
