//! The cache manager: priority load queues drained under a concurrency cap,
//! and the LRU eviction sweep that enforces the byte budget.

use tracing::debug;

use crate::overlay::RasterTileState;
use crate::tileset::Tileset;
use crate::types::{LoadState, TileIndex};

/// One queued tile load.
#[derive(Debug, Clone, Copy)]
pub struct LoadRecord {
    pub tile: TileIndex,
    /// Smaller is more urgent.
    pub priority: f64,
}

/// One queued availability-subtree load.
#[derive(Debug, Clone, Copy)]
pub struct SubtreeLoadRecord {
    pub tile: TileIndex,
    /// `(subtree-level-index, morton)` of the subtree cell.
    pub key: (u32, u64),
    pub priority: f64,
}

/// The selector's output queues, refilled every frame.
#[derive(Debug, Default)]
pub struct LoadQueues {
    pub high: Vec<LoadRecord>,
    pub medium: Vec<LoadRecord>,
    pub low: Vec<LoadRecord>,
    pub subtree: Vec<SubtreeLoadRecord>,
}

/// Priority band a load is queued at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBand {
    /// Blocker tiles whose absence forces an ancestor to render.
    High,
    /// Tiles wanted for rendering this frame.
    Medium,
    /// Prefetch (preload_ancestors / preload_siblings).
    Low,
}

impl LoadQueues {
    pub fn clear(&mut self) {
        self.high.clear();
        self.medium.clear();
        self.low.clear();
        self.subtree.clear();
    }

    pub fn push(&mut self, band: QueueBand, record: LoadRecord) {
        match band {
            QueueBand::High => self.high.push(record),
            QueueBand::Medium => self.medium.push(record),
            QueueBand::Low => self.low.push(record),
        }
    }

    /// Truncate every band back to the given lengths (used by the kick to
    /// abandon descendant loads).
    pub fn truncate(&mut self, high_len: usize, medium_len: usize, low_len: usize) {
        self.high.truncate(high_len);
        self.medium.truncate(medium_len);
        self.low.truncate(low_len);
    }
}

impl Tileset {
    /// Drain the queues, most urgent band first, dispatching fetches while
    /// the concurrency caps allow.
    pub(crate) fn process_load_queues(&mut self) {
        let cap = self.options.maximum_simultaneous_tile_loads;

        for band in [QueueBand::High, QueueBand::Medium, QueueBand::Low] {
            let mut queue = match band {
                QueueBand::High => std::mem::take(&mut self.queues.high),
                QueueBand::Medium => std::mem::take(&mut self.queues.medium),
                QueueBand::Low => std::mem::take(&mut self.queues.low),
            };
            queue.sort_by(|a, b| a.priority.total_cmp(&b.priority));

            for record in &queue {
                if self.pipeline.loads_in_progress >= cap {
                    break;
                }
                self.dispatch_tile_load(record.tile);
            }

            match band {
                QueueBand::High => self.queues.high = queue,
                QueueBand::Medium => self.queues.medium = queue,
                QueueBand::Low => self.queues.low = queue,
            }
        }

        self.process_subtree_queue();
        self.dispatch_raster_loads();
    }

    fn process_subtree_queue(&mut self) {
        let cap = self.options.maximum_simultaneous_subtree_loads;
        let mut queue = std::mem::take(&mut self.queues.subtree);
        queue.sort_by(|a, b| a.priority.total_cmp(&b.priority));

        for record in &queue {
            if self.pipeline.subtree_loads_in_progress >= cap
                || !self.dispatch_subtree_load(record)
            {
                // Not dispatched: release the cell so the selector can
                // re-queue it next frame.
                let context = self.arena.get(record.tile).context;
                self.pending_subtrees
                    .remove(&(context, record.key.0, record.key.1));
            }
        }
        self.queues.subtree = queue;
    }

    /// Begin fetching one tile's content. Skips tiles that changed state
    /// since they were queued.
    fn dispatch_tile_load(&mut self, index: TileIndex) {
        if self.arena.get(index).load_state != LoadState::Unloaded {
            return;
        }
        let Some(url) = self.resolved_content_url(index) else {
            return;
        };
        let context = self.arena.get(index).context;
        let headers = self.contexts[context].request_headers.clone();

        debug!(tile = %index, url = %url, "Dispatching tile load");
        self.arena.get_mut(index).load_state = LoadState::ContentLoading;
        self.tile_urls.insert(index, url.clone());
        let future = self.accessor.get(&url, &headers);
        self.pipeline.begin_tile_fetch(index, future);
    }

    /// Begin fetching one availability subtree. Returns whether a fetch was
    /// actually dispatched.
    fn dispatch_subtree_load(&mut self, record: &SubtreeLoadRecord) -> bool {
        let context = self.arena.get(record.tile).context;
        let already_loaded = self.contexts[context]
            .implicit
            .as_ref()
            .and_then(|implicit| implicit.availability.as_ref())
            .map(|availability| availability.find(record.key.0, record.key.1).is_some())
            .unwrap_or(true);
        if already_loaded {
            return false;
        }
        let Some(url) = self.resolved_subtree_url(record.tile) else {
            return false;
        };
        let branching_factor = match self.contexts[context].implicit.as_ref() {
            Some(implicit) => implicit.scheme.branching_factor(),
            None => return false,
        };
        let headers = self.contexts[context].request_headers.clone();

        debug!(tile = %record.tile, url = %url, "Dispatching subtree load");
        let future = self.accessor.get(&url, &headers);
        self.pipeline
            .begin_subtree_fetch(record.tile, record.key, branching_factor, future);
        true
    }

    /// Start fetches for overlay tiles, honoring each provider's own
    /// throttle.
    fn dispatch_raster_loads(&mut self) {
        let cap = self.options.maximum_simultaneous_tile_loads;
        for overlay_index in 0..self.overlays.len() {
            let mut to_fetch = Vec::new();
            {
                let provider = &self.overlays[overlay_index];
                if !provider.is_ready() {
                    continue;
                }
                let mut budget = cap.saturating_sub(provider.tiles_currently_loading);
                for raster_index in 0..provider.tile_count() {
                    if budget == 0 {
                        break;
                    }
                    let tile = provider.tile(raster_index);
                    if tile.state == RasterTileState::Unloaded {
                        to_fetch.push((raster_index, provider.url_for(tile.id)));
                        budget -= 1;
                    }
                }
            }

            for (raster_index, url) in to_fetch {
                let provider = &mut self.overlays[overlay_index];
                provider.tile_mut(raster_index).state = RasterTileState::Loading;
                provider.tiles_currently_loading += 1;
                let future = self.accessor.get(&url, &[]);
                self.pipeline
                    .begin_raster_fetch(overlay_index, raster_index, future);
            }
        }
    }

    /// Walk the LRU from its head unloading tile content until the byte
    /// budget is met. Stops at the root: everything at or after it was
    /// visited this frame. Tiles still loading or rendered last frame are
    /// skipped, not unloaded; the sweep continues past them.
    pub(crate) fn unload_cached_tiles(&mut self) {
        let max_bytes = self.options.maximum_cached_bytes;
        let mut current = self.lru.head();

        while self.total_data_bytes() > max_bytes {
            let Some(index) = current else {
                break;
            };
            if Some(index) == self.root {
                break;
            }
            let next = self.lru.next(&self.arena, index);

            if !self.is_tile_referenced(index) && self.unload_tile_content(index) {
                self.lru.remove(&mut self.arena, index);
            }

            current = next;
        }
    }

    /// Whether the tile was selected for rendering in the most recent
    /// traversal (eviction must not pull geometry out from under the
    /// renderer).
    fn is_tile_referenced(&self, index: TileIndex) -> bool {
        use crate::types::SelectionResult;
        let tile = self.arena.get(index);
        matches!(
            tile.last_selection.result(self.previous_frame_number),
            SelectionResult::Rendered | SelectionResult::RenderedAndKicked
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queues_push_and_clear() {
        let mut queues = LoadQueues::default();
        queues.push(
            QueueBand::High,
            LoadRecord {
                tile: TileIndex(0),
                priority: 1.0,
            },
        );
        queues.push(
            QueueBand::Medium,
            LoadRecord {
                tile: TileIndex(1),
                priority: 2.0,
            },
        );
        queues.push(
            QueueBand::Low,
            LoadRecord {
                tile: TileIndex(2),
                priority: 3.0,
            },
        );
        assert_eq!(queues.high.len(), 1);
        assert_eq!(queues.medium.len(), 1);
        assert_eq!(queues.low.len(), 1);

        queues.clear();
        assert!(queues.high.is_empty() && queues.medium.is_empty() && queues.low.is_empty());
    }

    #[test]
    fn truncate_rolls_back_to_marks() {
        let mut queues = LoadQueues::default();
        for i in 0..4 {
            queues.push(
                QueueBand::Medium,
                LoadRecord {
                    tile: TileIndex(i),
                    priority: f64::from(i),
                },
            );
        }
        queues.truncate(0, 2, 0);
        assert_eq!(queues.medium.len(), 2);
        assert_eq!(queues.medium[1].tile, TileIndex(1));
    }
}
