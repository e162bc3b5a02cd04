//! Persistence backends
//!
//! Everything the server remembers goes through the [`Backend`] trait:
//! status records, the pending-alert queue, the agent registry and metric
//! samples.
//!
//! ## Backends
//!
//! - **SQLite** (default): single file under the configured data directory
//! - **In-Memory**: no persistence, for testing or throwaway deployments
//!
//! ## Usage
//!
//! ```no_run
//! use gullveig::storage::{Backend, sqlite::SqliteBackend};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = SqliteBackend::open("./server.db", 30).await?;
//!     backend.bootstrap().await?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod error;
pub mod memory;
pub mod schema;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

use std::path::Path;
use std::sync::Arc;

pub use backend::Backend;
pub use error::{StorageError, StorageResult};
pub use schema::{AgentRecord, HealthTransition, MetricRow, PendingAlert, StatusRecord};

use crate::config::{StorageConfig, StorageKind};

/// Database file name inside the data directory
pub const DATABASE_FILE: &str = "server.db";

/// Open the backend selected by the configuration
///
/// The SQLite file is created inside `data_dir` if it does not exist.
pub async fn open(config: &StorageConfig, data_dir: &Path) -> StorageResult<Arc<dyn Backend>> {
    match config.backend {
        StorageKind::Memory => Ok(Arc::new(memory::MemoryBackend::new(config.retention_days))),
        #[cfg(feature = "storage-sqlite")]
        StorageKind::Sqlite => {
            std::fs::create_dir_all(data_dir)?;
            let backend =
                sqlite::SqliteBackend::open(data_dir.join(DATABASE_FILE), config.retention_days)
                    .await?;
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "storage-sqlite"))]
        StorageKind::Sqlite => {
            let _ = data_dir;
            Err(StorageError::ConnectionFailed(
                "sqlite support was not compiled in".to_string(),
            ))
        }
    }
}
