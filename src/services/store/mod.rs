use crate::models::*;
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Append-only record of user interactions.
#[async_trait::async_trait]
pub trait InteractionLog: Send + Sync {
    async fn append(&self, event: InteractionEvent) -> Result<()>;

    /// The most recent `limit` events of a user, oldest first.
    async fn events_for_user(&self, user_id: Uuid, limit: usize) -> Result<Vec<InteractionEvent>>;

    /// Events touching any of `item_ids`, optionally restricted to one kind.
    async fn events_for_items(
        &self,
        item_ids: &[Uuid],
        action_type: Option<ActionType>,
    ) -> Result<Vec<InteractionEvent>>;
}

/// Read-only item metadata.
#[async_trait::async_trait]
pub trait ItemCatalog: Send + Sync {
    async fn item(&self, item_id: Uuid) -> Result<Option<ItemFeatures>>;

    async fn items(&self, item_ids: &[Uuid]) -> Result<HashMap<Uuid, ItemFeatures>>;

    /// Candidate items for ranking, most popular first.
    async fn candidate_pool(&self, limit: usize) -> Result<Vec<ItemFeatures>>;
}

/// In-process log and catalog.
pub struct InMemoryStore {
    events: Arc<RwLock<Vec<InteractionEvent>>>,
    by_user: Arc<RwLock<HashMap<Uuid, Vec<usize>>>>,
    by_item: Arc<RwLock<HashMap<Uuid, Vec<usize>>>>,
    items: Arc<RwLock<HashMap<Uuid, ItemFeatures>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            by_user: Arc::new(RwLock::new(HashMap::new())),
            by_item: Arc::new(RwLock::new(HashMap::new())),
            items: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn insert_item(&self, item: ItemFeatures) {
        let mut items = self.items.write().await;
        debug!("Inserted item feature: {}", item.item_id);
        items.insert(item.item_id, item);
    }

    pub async fn batch_insert_items(&self, batch: Vec<ItemFeatures>) {
        let count = batch.len();
        {
            let mut items = self.items.write().await;
            for item in batch {
                items.insert(item.item_id, item);
            }
        }
        info!("Batch inserted {} item features", count);
    }

    pub async fn event_count(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn item_count(&self) -> usize {
        self.items.read().await.len()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl InteractionLog for InMemoryStore {
    async fn append(&self, event: InteractionEvent) -> Result<()> {
        let mut events = self.events.write().await;
        let mut by_user = self.by_user.write().await;
        let mut by_item = self.by_item.write().await;

        let position = events.len();
        // Keep each user's index chronological even if producers send late events.
        let user_index = by_user.entry(event.user_id).or_default();
        let slot = user_index
            .iter()
            .rposition(|&p| events[p].timestamp <= event.timestamp)
            .map_or(0, |p| p + 1);
        user_index.insert(slot, position);

        by_item.entry(event.item_id).or_default().push(position);
        events.push(event);
        Ok(())
    }

    async fn events_for_user(&self, user_id: Uuid, limit: usize) -> Result<Vec<InteractionEvent>> {
        let events = self.events.read().await;
        let by_user = self.by_user.read().await;

        let Some(positions) = by_user.get(&user_id) else {
            return Ok(Vec::new());
        };
        let start = positions.len().saturating_sub(limit);
        Ok(positions[start..].iter().map(|&p| events[p].clone()).collect())
    }

    async fn events_for_items(
        &self,
        item_ids: &[Uuid],
        action_type: Option<ActionType>,
    ) -> Result<Vec<InteractionEvent>> {
        let events = self.events.read().await;
        let by_item = self.by_item.read().await;

        let unique: HashSet<&Uuid> = item_ids.iter().collect();
        let mut positions: Vec<usize> = unique
            .into_iter()
            .filter_map(|id| by_item.get(id))
            .flatten()
            .copied()
            .collect();
        positions.sort_unstable();

        Ok(positions
            .into_iter()
            .map(|p| &events[p])
            .filter(|e| action_type.map_or(true, |kind| e.action_type == kind))
            .cloned()
            .collect())
    }
}

#[async_trait::async_trait]
impl ItemCatalog for InMemoryStore {
    async fn item(&self, item_id: Uuid) -> Result<Option<ItemFeatures>> {
        let items = self.items.read().await;
        Ok(items.get(&item_id).cloned())
    }

    async fn items(&self, item_ids: &[Uuid]) -> Result<HashMap<Uuid, ItemFeatures>> {
        let items = self.items.read().await;
        Ok(item_ids
            .iter()
            .filter_map(|id| items.get(id).map(|item| (*id, item.clone())))
            .collect())
    }

    async fn candidate_pool(&self, limit: usize) -> Result<Vec<ItemFeatures>> {
        let items = self.items.read().await;
        let mut pool: Vec<ItemFeatures> = items.values().cloned().collect();
        pool.sort_by(|a, b| {
            b.popularity
                .partial_cmp(&a.popularity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.item_id.cmp(&b.item_id))
        });
        pool.truncate(limit);
        Ok(pool)
    }
}
