use std::{
    collections::BTreeMap,
    sync::{Arc, PoisonError, RwLock},
};

use async_trait::async_trait;

use crate::{db::EventHistory, domain::Event, errors::Result};

/// Non-durable history, shares state across clones.
#[derive(Clone, Default)]
pub struct MemoryEventHistory {
    events: Arc<RwLock<BTreeMap<String, Event>>>,
}

impl MemoryEventHistory {
    pub fn len(&self) -> usize {
        self.events.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventHistory for MemoryEventHistory {
    async fn put(&self, event: Event) -> Result<()> {
        let event = event.normalized()?;
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event.id.clone(), event);
        Ok(())
    }

    fn get(&self) -> Vec<Event> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    #[tokio::test]
    async fn put_overwrites_by_id() {
        let history = MemoryEventHistory::default();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();

        history.put(Event::new("a", t1)).await.unwrap();
        history.put(Event::new("a", t2)).await.unwrap();
        history.put(Event::new("b", t1)).await.unwrap();

        let events = history.get();
        assert_eq!(events.len(), 2);
        let a = events.iter().find(|event| event.id == "a").unwrap();
        assert_eq!(a.updated_at, t2);
    }

    #[tokio::test]
    async fn clones_share_state_behind_trait_object() {
        let history = MemoryEventHistory::default();
        let shared: Arc<dyn EventHistory> = Arc::new(history.clone());

        shared
            .put(Event::new("a", Utc.timestamp_millis_opt(0).unwrap()))
            .await
            .unwrap();

        assert_eq!(history.len(), 1);
        assert!(!history.is_empty());
    }

    #[test]
    fn get_returns_a_copy() {
        let history = MemoryEventHistory::default();

        let mut snapshot = history.get();
        snapshot.push(Event::new("x", Utc::now()));

        assert!(history.get().is_empty());
    }
}
