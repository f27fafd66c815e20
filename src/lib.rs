//! Durable key-value event history.
//!
//! Events are held in memory keyed by id and mirrored to a single JSON file.
//! Every write rewrites the whole file, so the file is always directly
//! loadable by the next process.

use std::{path::PathBuf, sync::Arc};

pub mod config;
pub mod db;
pub mod domain;
pub mod errors;

pub use config::HistoryConfig;
pub use db::{file::PersistentEventHistory, memory::MemoryEventHistory, EventHistory};
pub use domain::Event;
pub use errors::{HistoryError, Result};

/// Load the history file at `path` and hand it out as a shared [`EventHistory`].
pub async fn create_history(path: impl Into<PathBuf>) -> Result<Arc<dyn EventHistory>> {
    let history = PersistentEventHistory::create(path).await?;
    Ok(Arc::new(history))
}
