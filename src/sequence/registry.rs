//! Hot-reload sequence registry using ArcSwap
//!
//! Keeps every non-draft sequence definition in memory so trigger matching
//! and step lookups never hit the database on the hot path. Updates swap the
//! whole map atomically; readers are never blocked.

use crate::error::EngineResult;
use crate::sequence::{storage::SequenceStorage, types::SequenceDefinition};
use crate::sequence::types::SequenceStatus;
use arc_swap::ArcSwap;
use std::{collections::HashMap, sync::Arc};

/// Lock-free registry of runtime sequence definitions
///
/// Definitions are immutable while a sequence is active, so a stale entry can
/// only lag behind a pause/resume or an edit of a paused sequence; both paths
/// reload explicitly, and the scheduler refreshes the whole map periodically
/// to pick up changes made by other instances.
#[derive(Debug)]
pub struct SequenceRegistry {
    /// Key: sequence_id, Value: definition with sorted steps
    sequences: ArcSwap<HashMap<String, Arc<SequenceDefinition>>>,
    storage: SequenceStorage,
}

impl SequenceRegistry {
    pub fn new(storage: SequenceStorage) -> Self {
        Self {
            sequences: ArcSwap::new(Arc::new(HashMap::new())),
            storage,
        }
    }

    /// Load every non-draft definition from storage and swap it in
    pub async fn refresh(&self) -> EngineResult<()> {
        let definitions = self.storage.load_runtime_definitions().await?;
        let map: HashMap<String, Arc<SequenceDefinition>> = definitions
            .into_iter()
            .map(|def| (def.sequence.id.clone(), Arc::new(def)))
            .collect();

        let count = map.len();
        self.sequences.store(Arc::new(map));

        tracing::debug!("📚 Sequence registry refreshed with {} definitions", count);
        Ok(())
    }

    /// Reload one sequence after an edit or status change
    ///
    /// Drafts and deleted sequences are dropped from the map.
    pub async fn reload_sequence(&self, sequence_id: &str) -> EngineResult<()> {
        let definition = self.storage.load_definition(sequence_id).await?;

        let current = self.sequences.load();
        let mut next = (**current).clone();
        match definition {
            Some(def) if def.sequence.status != SequenceStatus::Draft => {
                next.insert(sequence_id.to_string(), Arc::new(def));
            }
            _ => {
                next.remove(sequence_id);
            }
        }
        self.sequences.store(Arc::new(next));

        tracing::info!("🔥 Hot-reloaded sequence: {}", sequence_id);
        Ok(())
    }

    /// Cached lookup (lock-free)
    pub fn get(&self, sequence_id: &str) -> Option<Arc<SequenceDefinition>> {
        self.sequences.load().get(sequence_id).cloned()
    }

    /// Cached lookup with a storage fallback for definitions created elsewhere
    pub async fn get_or_load(&self, sequence_id: &str) -> EngineResult<Option<Arc<SequenceDefinition>>> {
        if let Some(def) = self.get(sequence_id) {
            return Ok(Some(def));
        }
        self.reload_sequence(sequence_id).await?;
        Ok(self.get(sequence_id))
    }

    /// Definitions currently accepting triggers
    pub fn active_sequences(&self) -> Vec<Arc<SequenceDefinition>> {
        self.sequences
            .load()
            .values()
            .filter(|def| def.sequence.status == SequenceStatus::Active)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sequences.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::types::{Sequence, SequenceSettings, SequenceStats, TriggerConfig};
    use crate::store::Database;
    use chrono::Utc;

    async fn seeded() -> (SequenceStorage, SequenceRegistry) {
        let db = Database::in_memory().await.unwrap();
        let storage = SequenceStorage::new(db.pool().clone());
        let now = Utc::now();
        for id in ["a", "b"] {
            storage
                .create_sequence(&Sequence {
                    id: id.into(),
                    owner: "acme".into(),
                    name: id.into(),
                    status: SequenceStatus::Draft,
                    trigger: TriggerConfig::Manual,
                    settings: SequenceSettings::default(),
                    stats: SequenceStats::default(),
                    created_at: now,
                    updated_at: now,
                })
                .await
                .unwrap();
        }
        let registry = SequenceRegistry::new(storage.clone());
        (storage, registry)
    }

    #[tokio::test]
    async fn drafts_are_not_cached() {
        let (storage, registry) = seeded().await;
        registry.refresh().await.unwrap();
        assert!(registry.is_empty());

        storage
            .transition("a", &[SequenceStatus::Draft], SequenceStatus::Active, Utc::now())
            .await
            .unwrap();
        assert!(registry.get_or_load("a").await.unwrap().is_some());
        assert!(registry.get_or_load("b").await.unwrap().is_none());
        assert_eq!(registry.active_sequences().len(), 1);
    }

    #[tokio::test]
    async fn reload_drops_deleted_sequences() {
        let (storage, registry) = seeded().await;
        storage
            .transition("a", &[SequenceStatus::Draft], SequenceStatus::Active, Utc::now())
            .await
            .unwrap();
        registry.refresh().await.unwrap();
        assert_eq!(registry.len(), 1);

        storage.delete_sequence("a").await.unwrap();
        registry.reload_sequence("a").await.unwrap();
        assert!(registry.get("a").is_none());
    }
}
