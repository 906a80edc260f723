//! Tile ownership and recency tracking: an append-only arena holding every
//! tile of a tileset, plus an intrusive LRU list threaded through the tiles'
//! `lru_prev`/`lru_next` links.

use crate::types::{ChildRange, Tile, TileIndex};

/// Append-only arena owning all tiles of one tileset.
///
/// Tiles are addressed by [`TileIndex`]; the backing storage only ever grows,
/// so indices handed out stay valid until the tileset is torn down. A tile's
/// children occupy one contiguous block, allocated exactly once.
#[derive(Debug, Default)]
pub struct TileArena {
    tiles: Vec<Tile>,
}

impl TileArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn push(&mut self, tile: Tile) -> TileIndex {
        let index = TileIndex(self.tiles.len() as u32);
        self.tiles.push(tile);
        index
    }

    pub fn get(&self, index: TileIndex) -> &Tile {
        &self.tiles[index.as_usize()]
    }

    pub fn get_mut(&mut self, index: TileIndex) -> &mut Tile {
        &mut self.tiles[index.as_usize()]
    }

    /// Allocate `children` as one contiguous block and link them to `parent`.
    ///
    /// A tile's child block is allocated exactly once; a second call returns
    /// the existing range untouched.
    pub fn add_children(&mut self, parent: TileIndex, children: Vec<Tile>) -> ChildRange {
        if let Some(existing) = self.get(parent).children {
            return existing;
        }

        let first = TileIndex(self.tiles.len() as u32);
        let count = children.len() as u32;
        for mut child in children {
            child.parent = Some(parent);
            self.tiles.push(child);
        }

        let range = ChildRange { first, count };
        self.get_mut(parent).children = Some(range);
        range
    }

    pub fn indices(&self) -> impl Iterator<Item = TileIndex> {
        (0..self.tiles.len() as u32).map(TileIndex)
    }
}

/// Intrusive doubly-linked list of tiles ordered by most-recent visit.
///
/// Head is least recently visited (first eviction candidate); tail is most
/// recent. All operations are O(1).
#[derive(Debug, Default)]
pub struct LruList {
    head: Option<TileIndex>,
    tail: Option<TileIndex>,
    len: usize,
}

impl LruList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn head(&self) -> Option<TileIndex> {
        self.head
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, arena: &TileArena, index: TileIndex) -> bool {
        arena.get(index).in_lru
    }

    pub fn next(&self, arena: &TileArena, index: TileIndex) -> Option<TileIndex> {
        arena.get(index).lru_next
    }

    /// Move `index` to the tail (most recently visited), inserting it if it
    /// is not currently in the list.
    pub fn insert_at_tail(&mut self, arena: &mut TileArena, index: TileIndex) {
        if arena.get(index).in_lru {
            if self.tail == Some(index) {
                return;
            }
            self.unlink(arena, index);
        }

        let tile = arena.get_mut(index);
        tile.in_lru = true;
        tile.lru_prev = self.tail;
        tile.lru_next = None;

        match self.tail {
            Some(old_tail) => arena.get_mut(old_tail).lru_next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;
    }

    /// Remove `index` from the list. No-op when it is not a member.
    pub fn remove(&mut self, arena: &mut TileArena, index: TileIndex) {
        if !arena.get(index).in_lru {
            return;
        }
        self.unlink(arena, index);
        let tile = arena.get_mut(index);
        tile.in_lru = false;
        tile.lru_prev = None;
        tile.lru_next = None;
    }

    fn unlink(&mut self, arena: &mut TileArena, index: TileIndex) {
        let (prev, next) = {
            let tile = arena.get(index);
            (tile.lru_prev, tile.lru_next)
        };

        match prev {
            Some(p) => arena.get_mut(p).lru_next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => arena.get_mut(n).lru_prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
    }
}
