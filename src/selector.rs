//! The per-frame selection traversal.
//!
//! `update_view` walks the tile tree against the frame's frusta, classifying
//! every visited tile: culled, rendered, or refined into its children. Tiles
//! that should render but are not loaded yet are queued at a priority that
//! reflects how central and close they are, and the "kick" keeps a renderable
//! ancestor on screen instead of holes while descendants stream in.

use std::collections::HashSet;

use glam::DVec3;

use crate::cache::{LoadRecord, QueueBand, SubtreeLoadRecord};
use crate::config::interpolate_fog_density;
use crate::geometry::view::is_visible_in_fog;
use crate::geometry::{BoundingVolume, ViewState};
use crate::overlay::RasterTileState;
use crate::tileset::{
    subdivide_octree_volume, subdivide_quadtree_volume, subtree_cell_for_octree,
    subtree_cell_for_quadtree, Tileset, ViewUpdateResult,
};
use crate::types::{
    ContentHandle, LoadState, OctreeTileId, QuadtreeTileId, SelectionResult, SelectionState, Tile,
    TileContent, TileId, TileIndex, TileRefine,
};
use crate::{availability, overlay::RasterMapping};

/// Read-only per-frame inputs to the traversal.
struct FrameState<'a> {
    frustums: &'a [ViewState],
    fog_densities: Vec<f64>,
    last_frame: i32,
    current_frame: i32,
}

/// What a subtree's traversal reported back to its parent.
#[derive(Debug, Clone, Copy)]
struct TraversalDetails {
    /// Whether every selected tile in the subtree is renderable right now.
    all_renderable: bool,
    /// Whether any selected tile was actually rendered last frame.
    any_rendered_last_frame: bool,
    /// Number of selected tiles that cannot render yet.
    not_yet_renderable_count: u32,
}

impl Default for TraversalDetails {
    fn default() -> Self {
        Self {
            all_renderable: true,
            any_rendered_last_frame: false,
            not_yet_renderable_count: 0,
        }
    }
}

impl Tileset {
    /// Run one frame of selection against the given frusta.
    ///
    /// Pumps the async pipeline, traverses the tree, then evicts down to the
    /// byte budget and dispatches queued loads up to the concurrency caps.
    pub fn update_view(&mut self, frustums: &[ViewState]) -> &ViewUpdateResult {
        self.process_async();

        let last_frame = self.previous_frame_number;
        let current_frame = last_frame + 1;

        let mut result = std::mem::take(&mut self.update_result);
        result.tiles_to_render.clear();
        result.tiles_no_longer_rendered.clear();
        result.tiles_visited = 0;
        result.culled_tiles_visited = 0;
        result.tiles_culled = 0;
        result.max_depth_visited = 0;
        result.credits.clear();
        self.queues.clear();

        match self.root {
            Some(root) if !frustums.is_empty() => {
                let fog_densities = frustums
                    .iter()
                    .map(|frustum| {
                        let height = frustum
                            .position_cartographic()
                            .map(|c| c.height)
                            .unwrap_or(0.0);
                        interpolate_fog_density(&self.options.fog_density_table, height)
                    })
                    .collect();
                let frame = FrameState {
                    frustums,
                    fog_densities,
                    last_frame,
                    current_frame,
                };
                self.visit_tile_if_needed(&frame, 0, false, root, &mut result);
            }
            _ => {}
        }

        result.tiles_loading_high_priority = self.queues.high.len() as u32;
        result.tiles_loading_medium_priority = self.queues.medium.len() as u32;
        result.tiles_loading_low_priority = self.queues.low.len() as u32;

        if !result.tiles_to_render.is_empty() {
            if let Some(credit) = &self.options.credit {
                result.credits.push(credit.clone());
            }
        }

        self.update_result = result;
        self.unload_cached_tiles();
        self.process_load_queues();
        self.previous_frame_number = current_frame;

        &self.update_result
    }

    /// Run `update_view` repeatedly, pumping the loader, until every queued
    /// load has settled. `tiles_no_longer_rendered` is reported relative to
    /// the render list before this call.
    pub fn update_view_offline(&mut self, frustums: &[ViewState]) -> &ViewUpdateResult {
        let rendered_before: Vec<TileIndex> = self.update_result.tiles_to_render.clone();

        self.update_view(frustums);
        while !self.is_idle() {
            self.accessor.tick();
            std::thread::yield_now();
            self.update_view(frustums);
        }

        let rendered_now: HashSet<TileIndex> =
            self.update_result.tiles_to_render.iter().copied().collect();
        self.update_result.tiles_no_longer_rendered = rendered_before
            .into_iter()
            .filter(|tile| !rendered_now.contains(tile))
            .collect();

        &self.update_result
    }

    /// Visit a tile whose visibility is not yet known.
    fn visit_tile_if_needed(
        &mut self,
        frame: &FrameState<'_>,
        depth: u32,
        ancestor_meets_sse: bool,
        index: TileIndex,
        result: &mut ViewUpdateResult,
    ) -> TraversalDetails {
        if self.arena.get(index).load_state == LoadState::ContentLoaded {
            self.process_loaded_content(index);
        }
        self.create_implicit_children_if_needed(index);
        self.update_raster_mappings(index);
        self.lru.insert_at_tail(&mut self.arena, index);

        let mut culled = false;
        let mut should_visit = true;

        {
            let tile = self.arena.get(index);
            if self.excluders.iter().any(|e| e.should_exclude(tile)) {
                culled = true;
                should_visit = false;
            }
        }

        let bounding_volume = self.arena.get(index).bounding_volume;
        let visible_in_any_frustum = frame.frustums.iter().any(|frustum| {
            is_visible_from_camera(
                frustum,
                &bounding_volume,
                self.options.render_tiles_under_camera,
            )
        });
        if !visible_in_any_frustum {
            culled = true;
            if self.options.enable_frustum_culling {
                should_visit = false;
            }
        }

        let mut distances = self.acquire_distances();
        distances.clear();
        distances.extend(frame.frustums.iter().map(|frustum| {
            frustum
                .compute_distance_squared_to_bounding_volume(&bounding_volume)
                .max(0.0)
                .sqrt()
        }));

        if should_visit {
            let fog_culled = distances
                .iter()
                .zip(&frame.fog_densities)
                .all(|(distance, density)| !is_visible_in_fog(*distance, *density));
            if fog_culled {
                culled = true;
                if self.options.enable_fog_culling {
                    should_visit = false;
                }
            }
        }

        let details = if should_visit {
            self.visit_tile(frame, depth, ancestor_meets_sse, index, culled, &distances, result)
        } else {
            self.mark_tile_and_children_non_rendered(frame.last_frame, index, result);
            self.arena.get_mut(index).last_selection =
                SelectionState::new(frame.current_frame, SelectionResult::Culled);

            if self.options.preload_siblings {
                self.add_tile_to_load_queue(QueueBand::Low, frame, index, &distances);
            }

            result.tiles_culled += 1;
            TraversalDetails::default()
        };

        self.release_distances(distances);
        details
    }

    /// Visit a tile known to be visible (or force-visited while culled).
    #[allow(clippy::too_many_arguments)]
    fn visit_tile(
        &mut self,
        frame: &FrameState<'_>,
        depth: u32,
        mut ancestor_meets_sse: bool,
        index: TileIndex,
        culled: bool,
        distances: &[f64],
        result: &mut ViewUpdateResult,
    ) -> TraversalDetails {
        result.tiles_visited += 1;
        result.max_depth_visited = result.max_depth_visited.max(depth);
        if culled {
            result.culled_tiles_visited += 1;
        }

        let is_leaf = self
            .arena
            .get(index)
            .children
            .map(|c| c.count == 0)
            .unwrap_or(true);
        if is_leaf {
            return self.render_leaf(frame, index, distances, result);
        }

        let unconditionally_refine = self.arena.get(index).unconditionally_refine;
        let meets_sse = self.meets_sse(frame.frustums, index, distances, culled);
        let waiting_for_children =
            self.queue_load_of_children_required_for_refinement(frame, index, distances);

        if !unconditionally_refine && (meets_sse || ancestor_meets_sse || waiting_for_children) {
            // This tile (or an ancestor) is the one we want this frame; what
            // happens next depends on what we did last frame.
            let last_selection = self.arena.get(index).last_selection;
            if should_render_this_tile(self.arena.get(index), &last_selection, frame.last_frame) {
                // Only load this tile if it, not just an ancestor, meets the
                // SSE.
                if meets_sse && !ancestor_meets_sse {
                    self.add_tile_to_load_queue(QueueBand::Medium, frame, index, distances);
                }
                return self.render_inner_tile(frame, index, result);
            }

            // Rendering now would pop out detail that was visible last
            // frame. Keep traversing so still-visible descendants stay, and
            // load this blocker at high priority when it meets the SSE.
            ancestor_meets_sse = true;
            if meets_sse {
                self.add_tile_to_load_queue(QueueBand::High, frame, index, distances);
            }
        }

        // Refine.
        let mut queued_for_load =
            self.load_and_render_additive_refined_tile(frame, index, result, distances);

        let first_rendered_descendant = result.tiles_to_render.len();
        let load_index_high = self.queues.high.len();
        let load_index_medium = self.queues.medium.len();
        let load_index_low = self.queues.low.len();

        let mut details = self.visit_children(frame, depth, ancestor_meets_sse, index, result);

        let descendants_added = first_rendered_descendant != result.tiles_to_render.len();
        if !descendants_added {
            // All descendants culled even though this tile is visible.
            return self.refine_to_nothing(frame, index, result, details.all_renderable);
        }

        if !details.all_renderable && !details.any_rendered_last_frame {
            // Some descendants aren't ready and none were on screen last
            // frame: kick them out of the render list and show this tile,
            // while their loads continue.
            queued_for_load = self.kick_descendants_and_render_tile(
                frame,
                index,
                result,
                &mut details,
                first_rendered_descendant,
                load_index_high,
                load_index_medium,
                load_index_low,
                queued_for_load,
                distances,
            );
        } else {
            if self.arena.get(index).refine != TileRefine::Add {
                self.mark_tile_non_rendered(frame.last_frame, index, result);
            }
            self.arena.get_mut(index).last_selection =
                SelectionState::new(frame.current_frame, SelectionResult::Refined);
        }

        if self.options.preload_ancestors && !queued_for_load {
            self.add_tile_to_load_queue(QueueBand::Low, frame, index, distances);
        }

        details
    }

    /// Visit the children in declaration order, combining their details.
    // TODO: visit visible children near-to-far rather than in declaration
    // order.
    fn visit_children(
        &mut self,
        frame: &FrameState<'_>,
        depth: u32,
        ancestor_meets_sse: bool,
        index: TileIndex,
        result: &mut ViewUpdateResult,
    ) -> TraversalDetails {
        let Some(range) = self.arena.get(index).children else {
            return TraversalDetails::default();
        };

        let mut details = TraversalDetails::default();
        for child in range.iter() {
            let child_details =
                self.visit_tile_if_needed(frame, depth + 1, ancestor_meets_sse, child, result);
            details.all_renderable &= child_details.all_renderable;
            details.any_rendered_last_frame |= child_details.any_rendered_last_frame;
            details.not_yet_renderable_count += child_details.not_yet_renderable_count;
        }
        details
    }

    fn render_leaf(
        &mut self,
        frame: &FrameState<'_>,
        index: TileIndex,
        distances: &[f64],
        result: &mut ViewUpdateResult,
    ) -> TraversalDetails {
        let last_selection = self.arena.get(index).last_selection;
        self.arena.get_mut(index).last_selection =
            SelectionState::new(frame.current_frame, SelectionResult::Rendered);
        result.tiles_to_render.push(index);

        let priority = self.add_tile_to_load_queue(QueueBand::Medium, frame, index, distances);
        self.queue_subtree_load_if_needed(index, priority);

        let renderable = self.arena.get(index).is_renderable();
        TraversalDetails {
            all_renderable: renderable,
            any_rendered_last_frame: last_selection.result(frame.last_frame)
                == SelectionResult::Rendered,
            not_yet_renderable_count: u32::from(!renderable),
        }
    }

    fn render_inner_tile(
        &mut self,
        frame: &FrameState<'_>,
        index: TileIndex,
        result: &mut ViewUpdateResult,
    ) -> TraversalDetails {
        let last_selection = self.arena.get(index).last_selection;
        self.mark_children_non_rendered(frame.last_frame, index, result);
        self.arena.get_mut(index).last_selection =
            SelectionState::new(frame.current_frame, SelectionResult::Rendered);
        result.tiles_to_render.push(index);

        let renderable = self.arena.get(index).is_renderable();
        TraversalDetails {
            all_renderable: renderable,
            any_rendered_last_frame: last_selection.result(frame.last_frame)
                == SelectionResult::Rendered,
            not_yet_renderable_count: u32::from(!renderable),
        }
    }

    /// All children of a visible tile were culled. For replacive refinement
    /// the tile itself stops rendering too; for additive refinement it keeps
    /// rendering on its own.
    fn refine_to_nothing(
        &mut self,
        frame: &FrameState<'_>,
        index: TileIndex,
        result: &mut ViewUpdateResult,
        children_renderable: bool,
    ) -> TraversalDetails {
        let last_selection = self.arena.get(index).last_selection;
        let mut details = TraversalDetails::default();

        if self.arena.get(index).refine == TileRefine::Add {
            details.all_renderable = self.arena.get(index).is_renderable();
            details.any_rendered_last_frame =
                last_selection.result(frame.last_frame) == SelectionResult::Rendered;
            details.not_yet_renderable_count = u32::from(!children_renderable);
        } else {
            self.mark_tile_non_rendered(frame.last_frame, index, result);
        }

        self.arena.get_mut(index).last_selection =
            SelectionState::new(frame.current_frame, SelectionResult::Refined);
        details
    }

    /// Additive refinement renders the parent along with its children.
    /// Returns whether the tile was queued for load.
    fn load_and_render_additive_refined_tile(
        &mut self,
        frame: &FrameState<'_>,
        index: TileIndex,
        result: &mut ViewUpdateResult,
        distances: &[f64],
    ) -> bool {
        if self.arena.get(index).refine != TileRefine::Add {
            return false;
        }
        result.tiles_to_render.push(index);
        self.add_tile_to_load_queue(QueueBand::Medium, frame, index, distances);
        true
    }

    /// Rewind the render list to before this tile's descendants, mark them
    /// kicked, and render this tile instead. Descendant loads stay queued
    /// unless more than `loading_descendant_limit` of them are still
    /// unrenderable, in which case their loads are abandoned in favor of
    /// loading this tile.
    #[allow(clippy::too_many_arguments)]
    fn kick_descendants_and_render_tile(
        &mut self,
        frame: &FrameState<'_>,
        index: TileIndex,
        result: &mut ViewUpdateResult,
        details: &mut TraversalDetails,
        first_rendered_descendant: usize,
        load_index_high: usize,
        load_index_medium: usize,
        load_index_low: usize,
        queued_for_load: bool,
        distances: &[f64],
    ) -> bool {
        let last_selection = self.arena.get(index).last_selection;
        let mut queued_for_load = queued_for_load;

        // Mark the rendered descendants, and their ancestors up to this
        // tile, as kicked.
        for list_index in first_rendered_descendant..result.tiles_to_render.len() {
            let mut current = Some(result.tiles_to_render[list_index]);
            while let Some(work) = current {
                if work == index {
                    break;
                }
                let tile = self.arena.get_mut(work);
                if tile.last_selection.was_kicked(frame.current_frame) {
                    break;
                }
                tile.last_selection.kick();
                current = tile.parent;
            }
        }

        result.tiles_to_render.truncate(first_rendered_descendant);
        if self.arena.get(index).refine != TileRefine::Add {
            result.tiles_to_render.push(index);
        }
        self.arena.get_mut(index).last_selection =
            SelectionState::new(frame.current_frame, SelectionResult::Rendered);

        let renderable = self.arena.get(index).is_renderable();
        let was_rendered_last_frame =
            last_selection.result(frame.last_frame) == SelectionResult::Rendered;
        let was_really_rendered_last_frame = was_rendered_last_frame && renderable;

        // If we're waiting on heaps of descendants, loading them all will
        // take too long: abandon their loads and load this tile instead,
        // until it can actually render.
        if !was_really_rendered_last_frame
            && details.not_yet_renderable_count > self.options.loading_descendant_limit
        {
            self.queues
                .truncate(load_index_high, load_index_medium, load_index_low);
            if !queued_for_load {
                self.add_tile_to_load_queue(QueueBand::Medium, frame, index, distances);
            }
            details.not_yet_renderable_count = u32::from(!renderable);
            queued_for_load = true;
        }

        details.all_renderable = renderable;
        details.any_rendered_last_frame = was_rendered_last_frame;

        queued_for_load
    }

    /// With `forbid_holes` on, queue every unrenderable replacive child and
    /// report whether refinement has to wait for them.
    fn queue_load_of_children_required_for_refinement(
        &mut self,
        frame: &FrameState<'_>,
        index: TileIndex,
        distances: &[f64],
    ) -> bool {
        if !self.options.forbid_holes {
            return false;
        }
        let Some(range) = self.arena.get(index).children else {
            return false;
        };

        let mut waiting_for_children = false;
        for child in range.iter() {
            let renderable_or_external = {
                let tile = self.arena.get(child);
                tile.is_renderable()
                    || matches!(
                        tile.content.as_ref().map(|c| &c.kind),
                        Some(TileContent::ExternalTileset(_))
                    )
            };
            if renderable_or_external {
                continue;
            }
            waiting_for_children = true;

            // Keep the child's own loading moving while we wait on it.
            if self.arena.get(child).load_state == LoadState::ContentLoaded {
                self.process_loaded_content(child);
            }
            self.create_implicit_children_if_needed(child);
            self.update_raster_mappings(child);
            self.lru.insert_at_tail(&mut self.arena, child);

            // The parent's distances are a fine stand-in: none of the
            // children can display until all are loaded anyway.
            self.add_tile_to_load_queue(QueueBand::Medium, frame, child, distances);
        }
        waiting_for_children
    }

    /// Largest screen-space error across the frusta, compared against the
    /// appropriate budget.
    fn meets_sse(
        &self,
        frustums: &[ViewState],
        index: TileIndex,
        distances: &[f64],
        culled: bool,
    ) -> bool {
        let geometric_error = self.arena.get(index).geometric_error;
        let mut largest_sse = 0.0_f64;
        for (frustum, distance) in frustums.iter().zip(distances) {
            let sse = frustum.compute_screen_space_error(geometric_error, *distance);
            if sse > largest_sse {
                largest_sse = sse;
            }
        }

        if culled {
            !self.options.enforce_culled_screen_space_error
                || largest_sse < self.options.culled_screen_space_error
        } else {
            largest_sse < self.options.maximum_screen_space_error
        }
    }

    /// Queue a tile for loading, returning its computed priority.
    ///
    /// Implicit tiles whose subtree says "tile exists, no content" (and
    /// explicit tiles with an empty content URL) skip the network entirely
    /// and go straight to `ContentLoaded` with empty content.
    fn add_tile_to_load_queue(
        &mut self,
        band: QueueBand,
        frame: &FrameState<'_>,
        index: TileIndex,
        distances: &[f64],
    ) -> f64 {
        let mut priority = f64::MAX;

        let needs_content = self.arena.get(index).load_state == LoadState::Unloaded;
        let needs_rasters = self.any_raster_overlays_need_loading(index);
        if !needs_content && !needs_rasters {
            return priority;
        }

        let center = self.arena.get(index).bounding_volume.center();
        priority = compute_load_priority(frame.frustums, distances, center);

        if !needs_content {
            // Content is resident; the raster scan will pick the overlays
            // up. Nothing to queue for the tile itself.
            return priority;
        }

        let plan = {
            let tile = self.arena.get(index);
            match &tile.id {
                TileId::Url(url) => {
                    if url.is_empty() {
                        Plan::NoContent
                    } else {
                        Plan::Load
                    }
                }
                TileId::Quadtree(id) => {
                    self.implicit_content_plan(tile.context, |levels| {
                        let (cell_level, root, morton) = subtree_cell_for_quadtree(*id, levels);
                        let relative_level = id.level - root.level;
                        let relative_morton = availability::morton2_encode(
                            id.x - (root.x << relative_level),
                            id.y - (root.y << relative_level),
                        );
                        (cell_level, morton, relative_level, relative_morton)
                    })
                }
                TileId::Octree(id) => {
                    self.implicit_content_plan(tile.context, |levels| {
                        let (cell_level, root, morton) = subtree_cell_for_octree(*id, levels);
                        let relative_level = id.level - root.level;
                        let relative_morton = availability::morton3_encode(
                            id.x - (root.x << relative_level),
                            id.y - (root.y << relative_level),
                            id.z - (root.z << relative_level),
                        );
                        (cell_level, morton, relative_level, relative_morton)
                    })
                }
                TileId::UpsampledQuadtree { .. } => Plan::NoContent,
            }
        };

        match plan {
            Plan::Load => self.queues.push(band, LoadRecord { tile: index, priority }),
            Plan::NoContent => {
                let tile = self.arena.get_mut(index);
                if tile.load_state == LoadState::Unloaded {
                    tile.content = Some(ContentHandle::new(TileContent::Empty, 0));
                    tile.load_state = LoadState::ContentLoaded;
                }
            }
            Plan::Unknown => {
                // The enclosing subtree is not resident; nothing is known
                // about this tile's content yet.
            }
        }

        priority
    }

    /// Content plan for an implicit tile: load, known-empty, or unknown
    /// until the subtree arrives.
    fn implicit_content_plan<F>(&self, context: usize, cell: F) -> Plan
    where
        F: FnOnce(u32) -> (u32, u64, u32, u64),
    {
        let Some(implicit) = self.contexts.get(context).and_then(|c| c.implicit.as_ref()) else {
            return Plan::NoContent;
        };
        let Some(availability) = implicit.availability.as_ref() else {
            // Terrain layers: content is available wherever a tile exists.
            return Plan::Load;
        };

        let (cell_level, morton, relative_level, relative_morton) =
            cell(availability.subtree_levels());
        match availability.find(cell_level, morton) {
            Some(subtree) => {
                if subtree.is_content_available(relative_level, relative_morton, 0) {
                    Plan::Load
                } else {
                    Plan::NoContent
                }
            }
            None => Plan::Unknown,
        }
    }

    /// Queue the availability subtree this tile roots, if it is a subtree
    /// root whose blob has not been loaded or queued yet.
    fn queue_subtree_load_if_needed(&mut self, index: TileIndex, priority: f64) {
        let (context, key) = {
            let tile = self.arena.get(index);
            let Some(implicit) = self
                .contexts
                .get(tile.context)
                .and_then(|c| c.implicit.as_ref())
            else {
                return;
            };
            let Some(availability) = implicit.availability.as_ref() else {
                return;
            };
            let levels = availability.subtree_levels();

            let (cell_level, morton) = match &tile.id {
                TileId::Quadtree(id) if id.level % levels == 0 => {
                    let (cell_level, _, morton) = subtree_cell_for_quadtree(*id, levels);
                    (cell_level, morton)
                }
                TileId::Octree(id) if id.level % levels == 0 => {
                    let (cell_level, _, morton) = subtree_cell_for_octree(*id, levels);
                    (cell_level, morton)
                }
                _ => return,
            };

            if availability.find(cell_level, morton).is_some() {
                return;
            }
            (tile.context, (cell_level, morton))
        };

        if self.pending_subtrees.insert((context, key.0, key.1)) {
            self.queues.subtree.push(SubtreeLoadRecord {
                tile: index,
                key,
                priority,
            });
        }
    }

    /// Main-thread follow-up once decoded content arrives: renderer
    /// resources, external-tileset grafting, raster overlay mapping.
    pub(crate) fn process_loaded_content(&mut self, index: TileIndex) {
        let external_document = {
            let tile = self.arena.get(index);
            match tile.content.as_ref().map(|c| &c.kind) {
                Some(TileContent::ExternalTileset(document)) => Some(document.clone()),
                _ => None,
            }
        };

        if let Some(document) = external_document {
            self.graft_external_tileset(index, &document);
        } else {
            let load_resources = self
                .arena
                .get_mut(index)
                .content
                .as_mut()
                .and_then(|content| content.load_thread_resources.take());
            let tile = self.arena.get(index);
            let main_resources = self.renderer.prepare_in_main_thread(tile, load_resources);
            if let Some(content) = self.arena.get_mut(index).content.as_mut() {
                content.main_thread_resources = main_resources;
            }
            self.map_overlays_to_tile(index);
        }

        self.arena.get_mut(index).load_state = LoadState::Done;
    }

    /// Attach one overlay tile mapping per ready overlay whose imagery
    /// covers this tile's footprint.
    fn map_overlays_to_tile(&mut self, index: TileIndex) {
        if self.overlays.is_empty() {
            return;
        }
        let Some(rectangle) = self.arena.get(index).bounding_volume.globe_rectangle() else {
            return;
        };
        if !self.arena.get(index).mapped_raster_tiles.is_empty() {
            return;
        }

        let mut mappings = Vec::new();
        for (overlay_index, provider) in self.overlays.iter_mut().enumerate() {
            if !provider.is_ready() {
                mappings.push(RasterMapping {
                    overlay: overlay_index,
                    loading_tile: Some(provider.placeholder()),
                    ready_tile: None,
                    texture_rect: [0.0, 0.0, 1.0, 1.0],
                });
                continue;
            }

            let level = provider.level_for_rectangle(&rectangle);
            let center = rectangle.center();
            let raster_id = provider_tile_id_at(level, center.longitude, center.latitude);
            let raster_index = provider.get_or_create_tile(raster_id);
            let raster_rect = provider.tile(raster_index).rectangle;
            let texture_rect =
                crate::overlay::RasterOverlayTileProvider::texture_rect(&raster_rect, &rectangle);

            let mut mapping = RasterMapping {
                overlay: overlay_index,
                loading_tile: Some(raster_index),
                ready_tile: None,
                texture_rect,
            };
            mapping.promote_if_loaded(provider);
            mappings.push(mapping);
        }

        self.arena.get_mut(index).mapped_raster_tiles = mappings;
    }

    fn update_raster_mappings(&mut self, index: TileIndex) {
        let Tileset { arena, overlays, .. } = self;
        let tile = arena.get_mut(index);
        for mapping in &mut tile.mapped_raster_tiles {
            if let Some(provider) = overlays.get(mapping.overlay) {
                mapping.promote_if_loaded(provider);
            }
        }
    }

    fn any_raster_overlays_need_loading(&self, index: TileIndex) -> bool {
        self.arena
            .get(index)
            .mapped_raster_tiles
            .iter()
            .any(|mapping| {
                mapping
                    .loading_tile
                    .map(|raster_index| {
                        self.overlays
                            .get(mapping.overlay)
                            .map(|provider| {
                                provider.tile(raster_index).state == RasterTileState::Unloaded
                            })
                            .unwrap_or(false)
                    })
                    .unwrap_or(false)
            })
    }

    /// Materialize the children of an implicit tile once its enclosing
    /// subtree is resident. Terrain layers (uniform availability) always
    /// materialize up to their maximum level.
    pub(crate) fn create_implicit_children_if_needed(&mut self, index: TileIndex) {
        if self.arena.get(index).children.is_some() {
            return;
        }

        let children = {
            let tile = self.arena.get(index);
            let Some(implicit) = self
                .contexts
                .get(tile.context)
                .and_then(|c| c.implicit.as_ref())
            else {
                return;
            };

            match &tile.id {
                TileId::Quadtree(id) => {
                    quadtree_children(tile, implicit, *id)
                }
                TileId::Octree(id) => {
                    octree_children(tile, implicit, *id)
                }
                _ => return,
            }
        };

        if let Some(children) = children {
            self.arena.add_children(index, children);
        }
    }

    fn mark_tile_non_rendered(
        &mut self,
        last_frame: i32,
        index: TileIndex,
        result: &mut ViewUpdateResult,
    ) {
        let last = self.arena.get(index).last_selection.result(last_frame);
        if last == SelectionResult::Rendered {
            result.tiles_no_longer_rendered.push(index);
        }
    }

    fn mark_children_non_rendered(
        &mut self,
        last_frame: i32,
        index: TileIndex,
        result: &mut ViewUpdateResult,
    ) {
        let last = self.arena.get(index).last_selection.result(last_frame);
        if last != SelectionResult::Refined {
            return;
        }
        let Some(range) = self.arena.get(index).children else {
            return;
        };
        for child in range.iter() {
            self.mark_tile_non_rendered(last_frame, child, result);
            self.mark_children_non_rendered(last_frame, child, result);
        }
    }

    fn mark_tile_and_children_non_rendered(
        &mut self,
        last_frame: i32,
        index: TileIndex,
        result: &mut ViewUpdateResult,
    ) {
        self.mark_tile_non_rendered(last_frame, index, result);
        self.mark_children_non_rendered(last_frame, index, result);
    }

    fn acquire_distances(&mut self) -> Vec<f64> {
        self.distances_pool.pop().unwrap_or_default()
    }

    fn release_distances(&mut self, buffer: Vec<f64>) {
        self.distances_pool.push(buffer);
    }
}

/// Plan for a tile's content when it is queued.
enum Plan {
    Load,
    NoContent,
    Unknown,
}

/// Whether the camera sees the volume, or sits directly above it when the
/// under-camera override is on.
fn is_visible_from_camera(
    frustum: &ViewState,
    bounding_volume: &BoundingVolume,
    render_tiles_under_camera: bool,
) -> bool {
    if frustum.is_bounding_volume_visible(bounding_volume) {
        return true;
    }
    if !render_tiles_under_camera {
        return false;
    }
    match (frustum.position_cartographic(), bounding_volume.globe_rectangle()) {
        (Some(position), Some(rectangle)) => rectangle.contains(position),
        _ => false,
    }
}

/// A tile may render if we rendered (or kicked) it last frame, if it was
/// culled or unseen last frame, or if it is ready right now. Even then it may
/// later be kicked in favor of an ancestor.
fn should_render_this_tile(
    tile: &Tile,
    last_selection: &SelectionState,
    last_frame: i32,
) -> bool {
    let original = last_selection.original_result(last_frame);
    if original == SelectionResult::Rendered
        || original == SelectionResult::Culled
        || original == SelectionResult::None
    {
        return true;
    }
    tile.is_renderable()
}

/// Distance-weighted priority, preferring tiles near the view axis. Smaller
/// is more urgent.
fn compute_load_priority(frustums: &[ViewState], distances: &[f64], center: DVec3) -> f64 {
    let mut priority = f64::MAX;
    for (frustum, distance) in frustums.iter().zip(distances) {
        let to_tile = center - frustum.position();
        let magnitude = to_tile.length();
        if magnitude < 1e-5 {
            continue;
        }
        let candidate = (1.0 - (to_tile / magnitude).dot(frustum.direction())) * distance;
        if candidate < priority {
            priority = candidate;
        }
    }
    priority
}

fn provider_tile_id_at(level: u32, longitude: f64, latitude: f64) -> QuadtreeTileId {
    let root = crate::geometry::GlobeRectangle::MAXIMUM;
    let tiles_across = f64::from(1u32 << level.min(31));
    let x = (((longitude - root.west) / root.width()) * tiles_across)
        .floor()
        .clamp(0.0, tiles_across - 1.0) as u32;
    let y = (((latitude - root.south) / root.height()) * tiles_across)
        .floor()
        .clamp(0.0, tiles_across - 1.0) as u32;
    QuadtreeTileId { level, x, y }
}

/// Build the available quadtree children of `tile`, or `None` while the
/// enclosing subtree is still unknown.
fn quadtree_children(
    tile: &Tile,
    implicit: &crate::tileset::ImplicitTilingContext,
    id: QuadtreeTileId,
) -> Option<Vec<Tile>> {
    if id.level >= implicit.maximum_level {
        return None;
    }

    let mut slots: Vec<QuadtreeTileId> = Vec::with_capacity(4);
    for dy in 0..2u32 {
        for dx in 0..2u32 {
            slots.push(QuadtreeTileId {
                level: id.level + 1,
                x: (id.x << 1) | dx,
                y: (id.y << 1) | dy,
            });
        }
    }

    let available: Vec<QuadtreeTileId> = match implicit.availability.as_ref() {
        None => slots, // terrain: uniform availability
        Some(availability) => {
            let levels = availability.subtree_levels();
            let (cell_level, root, morton) = subtree_cell_for_quadtree(id, levels);
            let subtree = availability.find(cell_level, morton)?;

            let relative_level = id.level - root.level;
            let relative_morton = availability::morton2_encode(
                id.x - (root.x << relative_level),
                id.y - (root.y << relative_level),
            );

            slots
                .into_iter()
                .filter(|child| {
                    let local = availability::morton2_encode(child.x & 1, child.y & 1);
                    let child_relative_level = relative_level + 1;
                    let child_relative_morton = (relative_morton << 2) | local;
                    if child_relative_level == levels {
                        subtree.is_subtree_available(child_relative_morton)
                    } else {
                        subtree.is_tile_available(child_relative_level, child_relative_morton)
                    }
                })
                .collect()
        }
    };

    Some(
        available
            .into_iter()
            .map(|child_id| {
                let volume = subdivide_quadtree_volume(
                    &implicit.root_bounding_volume,
                    child_id,
                    implicit.root_tiles_x,
                );
                let mut child = Tile::new(TileId::Quadtree(child_id), volume);
                child.context = tile.context;
                child.transform = tile.transform;
                child.geometric_error = tile.geometric_error * 0.5;
                child.refine = tile.refine;
                child
            })
            .collect(),
    )
}

/// Build the available octree children of `tile`, or `None` while the
/// enclosing subtree is still unknown.
fn octree_children(
    tile: &Tile,
    implicit: &crate::tileset::ImplicitTilingContext,
    id: OctreeTileId,
) -> Option<Vec<Tile>> {
    if id.level >= implicit.maximum_level {
        return None;
    }

    let mut slots: Vec<OctreeTileId> = Vec::with_capacity(8);
    for dz in 0..2u32 {
        for dy in 0..2u32 {
            for dx in 0..2u32 {
                slots.push(OctreeTileId {
                    level: id.level + 1,
                    x: (id.x << 1) | dx,
                    y: (id.y << 1) | dy,
                    z: (id.z << 1) | dz,
                });
            }
        }
    }

    let available: Vec<OctreeTileId> = match implicit.availability.as_ref() {
        None => slots,
        Some(availability) => {
            let levels = availability.subtree_levels();
            let (cell_level, root, morton) = subtree_cell_for_octree(id, levels);
            let subtree = availability.find(cell_level, morton)?;

            let relative_level = id.level - root.level;
            let relative_morton = availability::morton3_encode(
                id.x - (root.x << relative_level),
                id.y - (root.y << relative_level),
                id.z - (root.z << relative_level),
            );

            slots
                .into_iter()
                .filter(|child| {
                    let local =
                        availability::morton3_encode(child.x & 1, child.y & 1, child.z & 1);
                    let child_relative_level = relative_level + 1;
                    let child_relative_morton = (relative_morton << 3) | local;
                    if child_relative_level == levels {
                        subtree.is_subtree_available(child_relative_morton)
                    } else {
                        subtree.is_tile_available(child_relative_level, child_relative_morton)
                    }
                })
                .collect()
        }
    };

    Some(
        available
            .into_iter()
            .map(|child_id| {
                let volume = subdivide_octree_volume(&implicit.root_bounding_volume, child_id);
                let mut child = Tile::new(TileId::Octree(child_id), volume);
                child.context = tile.context;
                child.transform = tile.transform;
                child.geometric_error = tile.geometric_error * 0.5;
                child.refine = tile.refine;
                child
            })
            .collect(),
    )
}
