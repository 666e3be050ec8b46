//! Spatial index mapping entities to the chunk they stand in.
//!
//! Interest queries (entity replication windows, tile update fan-out) are
//! answered per chunk extent instead of scanning every entity.

use std::collections::HashMap;

use shared::map::{ChunkExtent, ChunkPosition};
use shared::Position;

#[derive(Debug, Default)]
pub struct EntityLocator {
    chunk_buckets: HashMap<ChunkPosition, Vec<u32>>,
    entity_chunks: HashMap<u32, ChunkPosition>,
}

impl EntityLocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `entity_id` as standing at `position`, moving it between
    /// chunk buckets if it crossed a boundary.
    pub fn set_entity_location(&mut self, entity_id: u32, position: &Position) {
        let chunk = ChunkPosition::from_world(position);

        if let Some(previous) = self.entity_chunks.get(&entity_id) {
            if *previous == chunk {
                return;
            }
            self.remove_from_bucket(entity_id, *previous);
        }

        self.chunk_buckets.entry(chunk).or_default().push(entity_id);
        self.entity_chunks.insert(entity_id, chunk);
    }

    pub fn remove_entity(&mut self, entity_id: u32) {
        if let Some(chunk) = self.entity_chunks.remove(&entity_id) {
            self.remove_from_bucket(entity_id, chunk);
        }
    }

    pub fn entity_chunk(&self, entity_id: u32) -> Option<ChunkPosition> {
        self.entity_chunks.get(&entity_id).copied()
    }

    /// All entities currently inside `extent`, in chunk-scan order.
    pub fn entities_in_extent(&self, extent: &ChunkExtent) -> Vec<u32> {
        let mut found = Vec::new();
        for chunk in extent.chunks() {
            if let Some(bucket) = self.chunk_buckets.get(&chunk) {
                found.extend_from_slice(bucket);
            }
        }
        found
    }

    fn remove_from_bucket(&mut self, entity_id: u32, chunk: ChunkPosition) {
        if let Some(bucket) = self.chunk_buckets.get_mut(&chunk) {
            bucket.retain(|id| *id != entity_id);
            if bucket.is_empty() {
                self.chunk_buckets.remove(&chunk);
            }
        }
    }
}
