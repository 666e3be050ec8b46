//! Tile map core data and the coarse chunk coordinate space.
//!
//! Chunks are the spatial buckets used for area-of-interest tracking: an
//! entity's chunk decides who hears about it, and a dirty tile fans out to
//! every client whose window covers the tile's chunk.
//!
//! The map itself is pure data. Server-only concerns (dirty-tile tracking,
//! update validation) are layered on by the server crate rather than baked
//! in here, so the client can apply authoritative state directly.

use log::error;
use serde::{Deserialize, Serialize};

use crate::components::Position;

/// Tiles along one edge of a chunk.
pub const CHUNK_WIDTH_TILES: u32 = 16;

/// World units along one edge of a tile.
pub const TILE_WORLD_WIDTH: f32 = 32.0;

/// Map size, in chunks.
pub const MAP_WIDTH_CHUNKS: u32 = 8;
pub const MAP_HEIGHT_CHUNKS: u32 = 8;

pub const MAP_WIDTH_TILES: u32 = MAP_WIDTH_CHUNKS * CHUNK_WIDTH_TILES;
pub const MAP_HEIGHT_TILES: u32 = MAP_HEIGHT_CHUNKS * CHUNK_WIDTH_TILES;

pub const WORLD_WIDTH_UNITS: f32 = MAP_WIDTH_TILES as f32 * TILE_WORLD_WIDTH;
pub const WORLD_HEIGHT_UNITS: f32 = MAP_HEIGHT_TILES as f32 * TILE_WORLD_WIDTH;

/// Most sprite layers a single tile may hold.
pub const MAX_TILE_LAYERS: usize = 5;

/// Sprite ID meaning "nothing rendered at this layer".
pub const EMPTY_SPRITE_ID: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TilePosition {
    pub x: u32,
    pub y: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkPosition {
    pub x: i32,
    pub y: i32,
}

impl From<TilePosition> for ChunkPosition {
    fn from(tile: TilePosition) -> Self {
        Self {
            x: (tile.x / CHUNK_WIDTH_TILES) as i32,
            y: (tile.y / CHUNK_WIDTH_TILES) as i32,
        }
    }
}

impl ChunkPosition {
    /// The chunk containing the given world position.
    pub fn from_world(position: &Position) -> Self {
        let chunk_width_units = CHUNK_WIDTH_TILES as f32 * TILE_WORLD_WIDTH;
        Self {
            x: (position.x / chunk_width_units).floor() as i32,
            y: (position.y / chunk_width_units).floor() as i32,
        }
    }
}

/// A rectangle of chunks. May extend outside the map until intersected with
/// the map's extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkExtent {
    pub x: i32,
    pub y: i32,
    pub x_length: i32,
    pub y_length: i32,
}

impl ChunkExtent {
    /// The square window of `radius` chunks around `center` (radius 1 gives
    /// the 3x3 area-of-interest window).
    pub fn centered_on(center: ChunkPosition, radius: i32) -> Self {
        Self {
            x: center.x - radius,
            y: center.y - radius,
            x_length: radius * 2 + 1,
            y_length: radius * 2 + 1,
        }
    }

    /// The full map.
    pub fn map_extent() -> Self {
        Self {
            x: 0,
            y: 0,
            x_length: MAP_WIDTH_CHUNKS as i32,
            y_length: MAP_HEIGHT_CHUNKS as i32,
        }
    }

    /// Shrinks this extent to its intersection with `other`. The result may
    /// be empty (zero-length sides).
    pub fn intersect_with(&mut self, other: &ChunkExtent) {
        let x_min = self.x.max(other.x);
        let y_min = self.y.max(other.y);
        let x_max = (self.x + self.x_length).min(other.x + other.x_length);
        let y_max = (self.y + self.y_length).min(other.y + other.y_length);

        self.x = x_min;
        self.y = y_min;
        self.x_length = (x_max - x_min).max(0);
        self.y_length = (y_max - y_min).max(0);
    }

    pub fn contains(&self, chunk: ChunkPosition) -> bool {
        chunk.x >= self.x
            && chunk.x < (self.x + self.x_length)
            && chunk.y >= self.y
            && chunk.y < (self.y + self.y_length)
    }

    pub fn is_empty(&self) -> bool {
        self.x_length <= 0 || self.y_length <= 0
    }

    pub fn chunks(&self) -> impl Iterator<Item = ChunkPosition> + '_ {
        let (x, y, xl, yl) = (self.x, self.y, self.x_length, self.y_length);
        (y..y + yl).flat_map(move |cy| (x..x + xl).map(move |cx| ChunkPosition { x: cx, y: cy }))
    }
}

/// One tile's sprite layer stack, bottom-up. Rendering is out of scope
/// here; numeric sprite IDs are opaque.
#[derive(Debug, Clone, Default)]
pub struct Tile {
    pub sprite_layers: Vec<u32>,
}

/// The world's tile state, row-major over the whole map.
#[derive(Debug, Clone)]
pub struct TileMap {
    tiles: Vec<Tile>,
}

impl TileMap {
    pub fn new() -> Self {
        let tile_count = (MAP_WIDTH_TILES * MAP_HEIGHT_TILES) as usize;
        Self {
            tiles: vec![Tile::default(); tile_count],
        }
    }

    pub fn in_bounds(x: u32, y: u32) -> bool {
        x < MAP_WIDTH_TILES && y < MAP_HEIGHT_TILES
    }

    pub fn get_tile(&self, x: u32, y: u32) -> Option<&Tile> {
        if !Self::in_bounds(x, y) {
            return None;
        }
        self.tiles.get((y * MAP_WIDTH_TILES + x) as usize)
    }

    /// Sets one sprite layer on one tile, growing the layer stack with
    /// empty layers if needed. Out-of-bounds coordinates or layer indices
    /// are data errors: logged and skipped, never applied.
    pub fn set_sprite_layer(&mut self, x: u32, y: u32, layer_index: usize, sprite_id: u32) -> bool {
        if !Self::in_bounds(x, y) {
            error!("Tile position out of bounds: ({}, {})", x, y);
            return false;
        }
        if layer_index >= MAX_TILE_LAYERS {
            error!("Tile layer index out of bounds: {}", layer_index);
            return false;
        }

        let tile = &mut self.tiles[(y * MAP_WIDTH_TILES + x) as usize];
        while tile.sprite_layers.len() <= layer_index {
            tile.sprite_layers.push(EMPTY_SPRITE_ID);
        }
        tile.sprite_layers[layer_index] = sprite_id;
        true
    }
}

impl Default for TileMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_from_tile_position() {
        let chunk = ChunkPosition::from(TilePosition { x: 0, y: 0 });
        assert_eq!(chunk, ChunkPosition { x: 0, y: 0 });

        let chunk = ChunkPosition::from(TilePosition { x: 16, y: 31 });
        assert_eq!(chunk, ChunkPosition { x: 1, y: 1 });
    }

    #[test]
    fn test_chunk_from_world_position() {
        let chunk_width_units = CHUNK_WIDTH_TILES as f32 * TILE_WORLD_WIDTH;

        let chunk = ChunkPosition::from_world(&Position { x: 0.0, y: 0.0 });
        assert_eq!(chunk, ChunkPosition { x: 0, y: 0 });

        let chunk = ChunkPosition::from_world(&Position {
            x: chunk_width_units * 1.5,
            y: chunk_width_units * 2.5,
        });
        assert_eq!(chunk, ChunkPosition { x: 1, y: 2 });
    }

    #[test]
    fn test_extent_intersection_clips_to_map() {
        // Window centered on the map corner hangs off two edges.
        let mut window = ChunkExtent::centered_on(ChunkPosition { x: 0, y: 0 }, 1);
        window.intersect_with(&ChunkExtent::map_extent());

        assert_eq!(window.x, 0);
        assert_eq!(window.y, 0);
        assert_eq!(window.x_length, 2);
        assert_eq!(window.y_length, 2);
    }

    #[test]
    fn test_extent_disjoint_intersection_is_empty() {
        let mut extent = ChunkExtent::centered_on(ChunkPosition { x: -10, y: -10 }, 1);
        extent.intersect_with(&ChunkExtent::map_extent());
        assert!(extent.is_empty());
        assert_eq!(extent.chunks().count(), 0);
    }

    #[test]
    fn test_extent_contains() {
        let extent = ChunkExtent::centered_on(ChunkPosition { x: 4, y: 4 }, 1);
        assert!(extent.contains(ChunkPosition { x: 3, y: 3 }));
        assert!(extent.contains(ChunkPosition { x: 5, y: 5 }));
        assert!(!extent.contains(ChunkPosition { x: 6, y: 4 }));
    }

    #[test]
    fn test_extent_chunk_iteration() {
        let extent = ChunkExtent::centered_on(ChunkPosition { x: 1, y: 1 }, 1);
        let chunks: Vec<ChunkPosition> = extent.chunks().collect();
        assert_eq!(chunks.len(), 9);
        assert_eq!(chunks[0], ChunkPosition { x: 0, y: 0 });
        assert_eq!(chunks[8], ChunkPosition { x: 2, y: 2 });
    }

    #[test]
    fn test_set_sprite_layer_grows_stack() {
        let mut map = TileMap::new();
        assert!(map.set_sprite_layer(3, 4, 2, 77));

        let tile = map.get_tile(3, 4).unwrap();
        assert_eq!(tile.sprite_layers.len(), 3);
        assert_eq!(tile.sprite_layers[0], EMPTY_SPRITE_ID);
        assert_eq!(tile.sprite_layers[1], EMPTY_SPRITE_ID);
        assert_eq!(tile.sprite_layers[2], 77);
    }

    #[test]
    fn test_set_sprite_layer_rejects_bad_input() {
        let mut map = TileMap::new();
        assert!(!map.set_sprite_layer(MAP_WIDTH_TILES, 0, 0, 1));
        assert!(!map.set_sprite_layer(0, 0, MAX_TILE_LAYERS, 1));
        assert!(map.get_tile(0, 0).unwrap().sprite_layers.is_empty());
    }
}
