use async_trait::async_trait;

use crate::{domain::Event, errors::Result};

pub mod file;
pub mod memory;

/// Upsert-only history of events keyed by `Event::id`.
#[async_trait]
pub trait EventHistory: Send + Sync {
    /// Insert or replace the event stored under `event.id`.
    async fn put(&self, event: Event) -> Result<()>;

    /// Snapshot of every event currently held. Never touches storage.
    fn get(&self) -> Vec<Event>;
}
