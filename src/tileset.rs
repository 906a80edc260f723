//! The tileset: owner of the tile arena, contexts, loader pipeline, and
//! per-frame bookkeeping. The traversal itself lives in `selector`; queue
//! draining and eviction live in `cache`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use glam::{DMat3, DMat4, DVec3};
use serde_json::Value;
use tracing::{error, warn};

use crate::availability::{morton2_encode, morton3_encode, AvailabilityTree};
use crate::cache::LoadQueues;
use crate::config::TilesetOptions;
use crate::geometry::ellipsoid::WGS84_A;
use crate::geometry::{
    BoundingRegion, BoundingSphere, BoundingVolume, GlobeRectangle, OrientedBox, S2CellVolume,
};
use crate::loader::{
    AssetAccessor, AssetFuture, Header, LoadCompletion, LoadPipeline, PrepareRendererResources,
};
use crate::overlay::RasterOverlayTileProvider;
use crate::tree::{LruList, TileArena};
use crate::types::{
    ContentHandle, LoadState, OctreeTileId, QuadtreeTileId, Tile, TileContent, TileId, TileIndex,
    TileRefine,
};
use crate::uri;
use crate::ContentFactory;

/// Implicit subdivision scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubdivisionScheme {
    Quadtree,
    Octree,
}

impl SubdivisionScheme {
    pub fn branching_factor(self) -> u32 {
        match self {
            SubdivisionScheme::Quadtree => 4,
            SubdivisionScheme::Octree => 8,
        }
    }
}

/// Template-driven tiling shared by the tiles of one implicit tileset or
/// terrain layer.
pub struct ImplicitTilingContext {
    pub scheme: SubdivisionScheme,
    pub maximum_level: u32,
    /// Tiles across at level 0. One for implicit 3D Tiles; geographic
    /// terrain layers use a 2x1 root tiling.
    pub root_tiles_x: u32,
    /// Content URL template; `{level}`/`{z}`/`{x}`/`{y}`/`{version}`.
    pub content_template: String,
    /// Subtree URL template. Terrain layers have none; availability is then
    /// uniform up to `maximum_level`.
    pub subtree_template: Option<String>,
    pub root_bounding_volume: BoundingVolume,
    /// Loaded subtree availability, when `subtree_template` is set.
    pub availability: Option<AvailabilityTree>,
}

impl ImplicitTilingContext {
    pub fn subtree_levels(&self) -> u32 {
        self.availability
            .as_ref()
            .map(AvailabilityTree::subtree_levels)
            .unwrap_or(0)
    }
}

/// Obtains a fresh bearer token after an auth failure. Exactly one refresh
/// is in flight per context.
pub trait TokenRefresher: Send + Sync {
    fn refresh(&self) -> AssetFuture;
}

/// Refreshes by re-requesting the asset endpoint that issued the original
/// token and reading `accessToken` from its JSON.
pub struct EndpointTokenRefresher {
    accessor: Arc<dyn AssetAccessor>,
    endpoint_url: String,
}

impl TokenRefresher for EndpointTokenRefresher {
    fn refresh(&self) -> AssetFuture {
        self.accessor.get(&self.endpoint_url, &[])
    }
}

/// Bundle of URL base, headers, and tiling shared by tiles served from one
/// endpoint.
pub struct TileContext {
    pub base_url: String,
    pub request_headers: Vec<Header>,
    pub version: Option<String>,
    pub implicit: Option<ImplicitTilingContext>,
    pub token_refresher: Option<Arc<dyn TokenRefresher>>,
    pub(crate) refreshing_token: bool,
}

impl TileContext {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            request_headers: Vec::new(),
            version: None,
            implicit: None,
            token_refresher: None,
            refreshing_token: false,
        }
    }
}

/// Which top-level load failed; handed to the load-error callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TilesetLoadType {
    AssetEndpoint,
    TilesetJson,
}

/// Details of a top-level load failure.
#[derive(Debug, Clone)]
pub struct TilesetLoadFailureDetails {
    pub load_type: TilesetLoadType,
    pub url: String,
    pub status: u16,
    pub message: String,
}

pub type LoadErrorCallback = Box<dyn Fn(&TilesetLoadFailureDetails)>;

/// Decides whether a tile should be excluded from selection entirely (e.g.
/// areas covered by another dataset).
pub trait TileExcluder {
    fn should_exclude(&self, tile: &Tile) -> bool;
}

/// Output of one `update_view`.
#[derive(Debug, Default, Clone)]
pub struct ViewUpdateResult {
    pub tiles_to_render: Vec<TileIndex>,
    pub tiles_no_longer_rendered: Vec<TileIndex>,
    pub tiles_visited: u32,
    pub culled_tiles_visited: u32,
    pub tiles_culled: u32,
    pub max_depth_visited: u32,
    pub tiles_loading_high_priority: u32,
    pub tiles_loading_medium_priority: u32,
    pub tiles_loading_low_priority: u32,
    pub credits: Vec<String>,
}

/// The in-flight top-level document fetch.
enum RootLoad {
    AssetEndpoint {
        future: AssetFuture,
        endpoint_url: String,
    },
    RootDocument {
        future: AssetFuture,
        context: usize,
        url: String,
    },
}

/// A streaming 3D tileset.
pub struct Tileset {
    pub(crate) accessor: Arc<dyn AssetAccessor>,
    pub(crate) factory: Arc<ContentFactory>,
    pub(crate) renderer: Arc<dyn PrepareRendererResources>,
    pub(crate) options: TilesetOptions,
    pub(crate) contexts: Vec<TileContext>,
    pub(crate) arena: TileArena,
    pub(crate) root: Option<TileIndex>,
    pub(crate) lru: LruList,
    pub(crate) queues: LoadQueues,
    pub(crate) pipeline: LoadPipeline,
    pub(crate) overlays: Vec<RasterOverlayTileProvider>,
    pub(crate) excluders: Vec<Box<dyn TileExcluder>>,
    pub(crate) update_result: ViewUpdateResult,
    pub(crate) previous_frame_number: i32,
    pub(crate) total_tile_bytes: i64,
    /// Reusable distance buffers, one per active recursion level.
    pub(crate) distances_pool: Vec<Vec<f64>>,
    /// Resolved content URL per in-flight tile, for decoder dispatch.
    pub(crate) tile_urls: HashMap<TileIndex, String>,
    /// Subtree cells already queued or in flight, to keep the queue free of
    /// duplicates across frames.
    pub(crate) pending_subtrees: HashSet<(usize, u32, u64)>,
    root_load: Option<RootLoad>,
    pending_refreshes: Vec<(usize, AssetFuture)>,
    load_error_callback: Option<LoadErrorCallback>,
}

impl Tileset {
    /// Start streaming the tileset at `url` (a tileset.json, or a layer.json
    /// for quantized-mesh terrain).
    pub fn new(
        accessor: Arc<dyn AssetAccessor>,
        renderer: Arc<dyn PrepareRendererResources>,
        url: &str,
        options: TilesetOptions,
    ) -> Self {
        let mut tileset = Self::empty(accessor, renderer, options);
        let future = tileset.accessor.get(url, &[]);
        tileset.contexts.push(TileContext::new(url));
        tileset.root_load = Some(RootLoad::RootDocument {
            future,
            context: 0,
            url: url.to_owned(),
        });
        tileset
    }

    /// Start streaming from an asset endpoint: a JSON document
    /// `{url, accessToken, type}` that points at the real tileset and
    /// carries a bearer token. 401 responses on tiles trigger a single-flight
    /// token refresh against the same endpoint.
    pub fn from_asset_endpoint(
        accessor: Arc<dyn AssetAccessor>,
        renderer: Arc<dyn PrepareRendererResources>,
        endpoint_url: &str,
        options: TilesetOptions,
    ) -> Self {
        let mut tileset = Self::empty(accessor, renderer, options);
        let future = tileset.accessor.get(endpoint_url, &[]);
        tileset.root_load = Some(RootLoad::AssetEndpoint {
            future,
            endpoint_url: endpoint_url.to_owned(),
        });
        tileset
    }

    fn empty(
        accessor: Arc<dyn AssetAccessor>,
        renderer: Arc<dyn PrepareRendererResources>,
        options: TilesetOptions,
    ) -> Self {
        Self {
            accessor,
            factory: Arc::new(ContentFactory::with_default_decoders()),
            renderer,
            options,
            contexts: Vec::new(),
            arena: TileArena::new(),
            root: None,
            lru: LruList::new(),
            queues: LoadQueues::default(),
            pipeline: LoadPipeline::new(),
            overlays: Vec::new(),
            excluders: Vec::new(),
            update_result: ViewUpdateResult::default(),
            previous_frame_number: 0,
            total_tile_bytes: 0,
            distances_pool: Vec::new(),
            tile_urls: HashMap::new(),
            pending_subtrees: HashSet::new(),
            root_load: None,
            pending_refreshes: Vec::new(),
            load_error_callback: None,
        }
    }

    /// Replace the content factory (decoder registry).
    pub fn set_content_factory(&mut self, factory: ContentFactory) {
        self.factory = Arc::new(factory);
    }

    pub fn set_load_error_callback(&mut self, callback: LoadErrorCallback) {
        self.load_error_callback = Some(callback);
    }

    pub fn add_excluder(&mut self, excluder: Box<dyn TileExcluder>) {
        self.excluders.push(excluder);
    }

    pub fn add_overlay(&mut self, overlay: RasterOverlayTileProvider) {
        self.overlays.push(overlay);
    }

    pub fn options(&self) -> &TilesetOptions {
        &self.options
    }

    pub fn root_tile(&self) -> Option<TileIndex> {
        self.root
    }

    pub fn arena(&self) -> &TileArena {
        &self.arena
    }

    pub fn tile(&self, index: TileIndex) -> &Tile {
        self.arena.get(index)
    }

    /// Total bytes attributed to loaded tile content and overlay imagery.
    pub fn total_data_bytes(&self) -> i64 {
        self.total_tile_bytes
            + self
                .overlays
                .iter()
                .map(RasterOverlayTileProvider::bytes_used)
                .sum::<i64>()
    }

    pub fn loads_in_progress(&self) -> u32 {
        self.pipeline.loads_in_progress
    }

    pub fn subtree_loads_in_progress(&self) -> u32 {
        self.pipeline.subtree_loads_in_progress
    }

    /// Whether any asynchronous work is still outstanding.
    pub fn is_idle(&self) -> bool {
        self.pipeline.is_idle() && self.root_load.is_none() && self.pending_refreshes.is_empty()
    }

    /// Pump the asynchronous machinery: poll in-flight fetches, hand
    /// finished responses to workers, and apply every completed load to the
    /// tile tree. Called at the top of `update_view`.
    pub(crate) fn process_async(&mut self) {
        self.accessor.tick();
        self.process_root_load();
        self.process_token_refreshes();

        let factory = self.factory.clone();
        let renderer = self.renderer.clone();
        let content_options = self.options.content_options.clone();
        self.pipeline
            .pump_fetches(&factory, &renderer, &content_options, &self.tile_urls);

        for completion in self.pipeline.drain_completions() {
            match completion {
                LoadCompletion::Tile {
                    tile,
                    outcome,
                    http_status,
                    load_thread_resources,
                } => self.apply_tile_completion(tile, outcome, http_status, load_thread_resources),
                LoadCompletion::Subtree { tile, key, outcome } => {
                    self.apply_subtree_completion(tile, key, outcome)
                }
                LoadCompletion::Raster {
                    overlay,
                    raster_tile,
                    outcome,
                    load_thread_resources,
                } => {
                    drop(load_thread_resources);
                    if let Some(provider) = self.overlays.get_mut(overlay) {
                        provider.apply_load_result(raster_tile, outcome);
                    }
                }
            }
        }
    }

    fn apply_tile_completion(
        &mut self,
        index: TileIndex,
        outcome: crate::error::Result<TileContent>,
        http_status: u16,
        load_thread_resources: Option<Box<dyn std::any::Any + Send>>,
    ) {
        self.pipeline.loads_in_progress = self.pipeline.loads_in_progress.saturating_sub(1);
        self.tile_urls.remove(&index);

        match outcome {
            Ok(kind) => {
                let mut handle = ContentHandle::new(kind, http_status);
                handle.load_thread_resources = load_thread_resources;
                let bytes = handle.byte_size();

                let tile = self.arena.get_mut(index);
                tile.content = Some(handle);
                tile.bytes_used = bytes;
                tile.load_state = LoadState::ContentLoaded;
                self.total_tile_bytes += bytes;
            }
            Err(e) => {
                let context = self.arena.get(index).context;
                let refreshable = http_status == 401
                    && self
                        .contexts
                        .get(context)
                        .map(|c| c.token_refresher.is_some())
                        .unwrap_or(false);

                let tile = self.arena.get_mut(index);
                tile.content = Some(ContentHandle::new(TileContent::Empty, http_status));
                if refreshable {
                    tile.load_state = LoadState::FailedTemporarily;
                    warn!(tile = %index, error = %e, "Tile auth failed; scheduling token refresh");
                    self.start_token_refresh(context);
                } else {
                    tile.load_state = LoadState::Failed;
                    warn!(tile = %index, error = %e, "Tile content failed to load");
                }
            }
        }
    }

    fn apply_subtree_completion(
        &mut self,
        tile: TileIndex,
        key: (u32, u64),
        outcome: crate::error::Result<crate::availability::SubtreeAvailability>,
    ) {
        self.pipeline.subtree_loads_in_progress =
            self.pipeline.subtree_loads_in_progress.saturating_sub(1);
        let context = self.arena.get(tile).context;
        self.pending_subtrees.remove(&(context, key.0, key.1));

        match outcome {
            Ok(subtree) => {
                if let Some(implicit) = self
                    .contexts
                    .get_mut(context)
                    .and_then(|c| c.implicit.as_mut())
                {
                    if let Some(availability) = implicit.availability.as_mut() {
                        availability.add_loaded_subtree(key.0, key.1, subtree);
                    }
                }
            }
            Err(e) => {
                warn!(tile = %tile, error = %e, "Availability subtree failed to load");
            }
        }
    }

    /// One fetch per context at a time; further 401s while refreshing just
    /// wait for the in-flight refresh.
    fn start_token_refresh(&mut self, context: usize) {
        let Some(ctx) = self.contexts.get_mut(context) else {
            return;
        };
        if ctx.refreshing_token {
            return;
        }
        let Some(refresher) = ctx.token_refresher.clone() else {
            return;
        };
        ctx.refreshing_token = true;
        self.pending_refreshes.push((context, refresher.refresh()));
    }

    fn process_token_refreshes(&mut self) {
        let mut still_pending = Vec::with_capacity(self.pending_refreshes.len());
        let mut finished = Vec::new();
        for (context, mut future) in self.pending_refreshes.drain(..) {
            match future.try_take() {
                None => still_pending.push((context, future)),
                Some(result) => finished.push((context, result)),
            }
        }
        self.pending_refreshes = still_pending;

        for (context, result) in finished {
            let new_token = result.ok().filter(|r| (200..300).contains(&r.status)).and_then(
                |response| {
                    serde_json::from_slice::<Value>(&response.data)
                        .ok()?
                        .get("accessToken")?
                        .as_str()
                        .map(str::to_owned)
                },
            );

            let succeeded = new_token.is_some();
            if let Some(ctx) = self.contexts.get_mut(context) {
                ctx.refreshing_token = false;
                if let Some(token) = new_token {
                    let value = format!("Bearer {token}");
                    match ctx
                        .request_headers
                        .iter_mut()
                        .find(|(name, _)| name == "Authorization")
                    {
                        Some(header) => header.1 = value,
                        None => ctx.request_headers.push(("Authorization".into(), value)),
                    }
                }
            }

            // Revisit every auth-failed tile of this context.
            for index in self.arena.indices().collect::<Vec<_>>() {
                let tile = self.arena.get(index);
                let auth_failed = tile.context == context
                    && tile.load_state == LoadState::FailedTemporarily
                    && tile
                        .content
                        .as_ref()
                        .map(|c| c.http_status == 401)
                        .unwrap_or(false);
                if !auth_failed {
                    continue;
                }
                if succeeded {
                    self.unload_tile_content(index);
                } else {
                    self.arena.get_mut(index).load_state = LoadState::Failed;
                }
            }

            if !succeeded {
                warn!(context, "Token refresh failed; auth-failed tiles are now permanent failures");
            }
        }
    }

    /// Release a tile's content and renderer resources and return it to
    /// `Unloaded`. Refuses while the content is still loading.
    pub(crate) fn unload_tile_content(&mut self, index: TileIndex) -> bool {
        let tile = self.arena.get_mut(index);
        if tile.load_state == LoadState::ContentLoading {
            return false;
        }

        if let Some(mut content) = tile.content.take() {
            let load = content.load_thread_resources.take();
            let main = content.main_thread_resources.take();
            let bytes = tile.bytes_used;
            tile.bytes_used = 0;
            tile.load_state = LoadState::Unloaded;
            tile.mapped_raster_tiles.clear();

            let tile = self.arena.get(index);
            self.renderer.free(tile, load, main);
            self.total_tile_bytes -= bytes;
        } else {
            tile.load_state = LoadState::Unloaded;
        }
        true
    }

    fn report_load_failure(&self, details: TilesetLoadFailureDetails) {
        error!(
            url = %details.url,
            status = details.status,
            "{}", details.message
        );
        if let Some(callback) = &self.load_error_callback {
            callback(&details);
        }
    }

    fn process_root_load(&mut self) {
        let Some(load) = self.root_load.as_mut() else {
            return;
        };

        match load {
            RootLoad::AssetEndpoint {
                future,
                endpoint_url,
            } => {
                let endpoint_url = endpoint_url.clone();
                let Some(result) = future.try_take() else {
                    return;
                };
                self.root_load = None;
                self.handle_endpoint_response(&endpoint_url, result);
            }
            RootLoad::RootDocument {
                future,
                context,
                url,
            } => {
                let (context, url) = (*context, url.clone());
                let Some(result) = future.try_take() else {
                    return;
                };
                self.root_load = None;
                self.handle_root_document_response(context, &url, result);
            }
        }
    }

    fn handle_endpoint_response(
        &mut self,
        endpoint_url: &str,
        result: crate::error::Result<crate::loader::AssetResponse>,
    ) {
        let response = match result {
            Ok(r) if (200..300).contains(&r.status) || r.status == 0 => r,
            Ok(r) => {
                self.report_load_failure(TilesetLoadFailureDetails {
                    load_type: TilesetLoadType::AssetEndpoint,
                    url: endpoint_url.to_owned(),
                    status: r.status,
                    message: format!("Received status code {} for asset endpoint", r.status),
                });
                return;
            }
            Err(e) => {
                self.report_load_failure(TilesetLoadFailureDetails {
                    load_type: TilesetLoadType::AssetEndpoint,
                    url: endpoint_url.to_owned(),
                    status: 0,
                    message: e.to_string(),
                });
                return;
            }
        };

        let document: Value = match serde_json::from_slice(&response.data) {
            Ok(value) => value,
            Err(e) => {
                self.report_load_failure(TilesetLoadFailureDetails {
                    load_type: TilesetLoadType::AssetEndpoint,
                    url: endpoint_url.to_owned(),
                    status: response.status,
                    message: format!("Error when parsing asset endpoint JSON: {e}"),
                });
                return;
            }
        };

        let mut url = document
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let access_token = document
            .get("accessToken")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let asset_type = document.get("type").and_then(Value::as_str).unwrap_or("");

        match asset_type {
            "TERRAIN" => url = uri::resolve(&url, "layer.json"),
            "3DTILES" => {}
            other => {
                self.report_load_failure(TilesetLoadFailureDetails {
                    load_type: TilesetLoadType::AssetEndpoint,
                    url: endpoint_url.to_owned(),
                    status: response.status,
                    message: format!("Received unsupported asset response type: {other}"),
                });
                return;
            }
        }

        let mut context = TileContext::new(url.clone());
        context
            .request_headers
            .push(("Authorization".into(), format!("Bearer {access_token}")));
        context.token_refresher = Some(Arc::new(EndpointTokenRefresher {
            accessor: self.accessor.clone(),
            endpoint_url: endpoint_url.to_owned(),
        }));

        let future = self.accessor.get(&url, &context.request_headers);
        self.contexts.push(context);
        self.root_load = Some(RootLoad::RootDocument {
            future,
            context: self.contexts.len() - 1,
            url,
        });
    }

    fn handle_root_document_response(
        &mut self,
        context: usize,
        url: &str,
        result: crate::error::Result<crate::loader::AssetResponse>,
    ) {
        let response = match result {
            Ok(r) if (200..300).contains(&r.status) || r.status == 0 => r,
            Ok(r) => {
                self.report_load_failure(TilesetLoadFailureDetails {
                    load_type: TilesetLoadType::TilesetJson,
                    url: url.to_owned(),
                    status: r.status,
                    message: format!("Received status code {} for tileset", r.status),
                });
                return;
            }
            Err(e) => {
                self.report_load_failure(TilesetLoadFailureDetails {
                    load_type: TilesetLoadType::TilesetJson,
                    url: url.to_owned(),
                    status: 0,
                    message: e.to_string(),
                });
                return;
            }
        };

        let document: Value = match serde_json::from_slice(&response.data) {
            Ok(value) => value,
            Err(e) => {
                self.report_load_failure(TilesetLoadFailureDetails {
                    load_type: TilesetLoadType::TilesetJson,
                    url: url.to_owned(),
                    status: response.status,
                    message: format!("Error when parsing tileset JSON: {e}"),
                });
                return;
            }
        };

        self.contexts[context].base_url = response.url.clone();

        if let Some(root_json) = document.get("root") {
            let root_json = root_json.clone();
            match self.create_root_tile(&root_json, context) {
                Some(root) => self.root = Some(root),
                None => self.report_load_failure(TilesetLoadFailureDetails {
                    load_type: TilesetLoadType::TilesetJson,
                    url: url.to_owned(),
                    status: response.status,
                    message: "Tileset root tile could not be constructed".into(),
                }),
            }
        } else if document.get("format").and_then(Value::as_str) == Some("quantized-mesh-1.0") {
            self.create_terrain_root(&document, context);
        } else {
            self.report_load_failure(TilesetLoadFailureDetails {
                load_type: TilesetLoadType::TilesetJson,
                url: url.to_owned(),
                status: response.status,
                message: "Tileset JSON has neither a root tile nor a known format".into(),
            });
        }
    }

    /// Build the root tile and its explicit descendants from tileset JSON.
    pub(crate) fn create_root_tile(&mut self, root_json: &Value, context: usize) -> Option<TileIndex> {
        let tile = build_tile_from_json(
            root_json,
            DMat4::IDENTITY,
            TileRefine::Replace,
            context,
        )?;
        let index = self.arena.push(tile);
        self.populate_tile_from_json(index, root_json);
        Some(index)
    }

    /// Recursively create explicit children (or wire up implicit tiling) for
    /// a tile freshly built from JSON.
    pub(crate) fn populate_tile_from_json(&mut self, index: TileIndex, json: &Value) {
        let (transform, refine, context) = {
            let tile = self.arena.get(index);
            (tile.transform, tile.refine, tile.context)
        };

        if let Some(children_json) = json.get("children").and_then(Value::as_array) {
            let mut children = Vec::with_capacity(children_json.len());
            let mut child_docs = Vec::with_capacity(children_json.len());
            for child_json in children_json {
                if let Some(child) = build_tile_from_json(child_json, transform, refine, context) {
                    children.push(child);
                    child_docs.push(child_json);
                }
            }
            let range = self.arena.add_children(index, children);
            for (child_index, child_json) in range.iter().zip(child_docs) {
                self.populate_tile_from_json(child_index, child_json);
            }
        } else if matches!(&self.arena.get(index).id, TileId::Url(url) if !url.is_empty()) {
            self.attach_implicit_tiling(index, json);
        }
    }

    /// Wire up the `3DTILES_implicit_tiling` extension: the tile becomes an
    /// always-refining dummy whose single child is the implicit root.
    fn attach_implicit_tiling(&mut self, index: TileIndex, json: &Value) {
        let Some(implicit_json) = json
            .get("extensions")
            .and_then(|e| e.get("3DTILES_implicit_tiling"))
        else {
            return;
        };

        let scheme = match implicit_json.get("subdivisionScheme").and_then(Value::as_str) {
            Some("QUADTREE") => SubdivisionScheme::Quadtree,
            Some("OCTREE") => SubdivisionScheme::Octree,
            other => {
                error!(?other, "Implicit tiling has an unknown subdivision scheme");
                return;
            }
        };
        let (Some(subtree_levels), Some(maximum_level)) = (
            implicit_json.get("subtreeLevels").and_then(Value::as_u64),
            implicit_json.get("maximumLevel").and_then(Value::as_u64),
        ) else {
            error!("Implicit tiling is missing subtreeLevels or maximumLevel");
            return;
        };
        if subtree_levels == 0 {
            error!("Implicit tiling declares zero subtreeLevels");
            return;
        }
        let Some(subtree_template) = implicit_json
            .get("subtrees")
            .and_then(|s| s.get("uri"))
            .and_then(Value::as_str)
        else {
            error!("Implicit tiling is missing a subtree URI template");
            return;
        };

        let (content_template, bounding_volume, geometric_error, refine, old_context) = {
            let tile = self.arena.get(index);
            let content_template = match &tile.id {
                TileId::Url(url) => url.clone(),
                _ => return,
            };
            (
                content_template,
                tile.bounding_volume,
                tile.geometric_error,
                tile.refine,
                tile.context,
            )
        };

        let old = &self.contexts[old_context];
        let mut context = TileContext::new(old.base_url.clone());
        context.request_headers = old.request_headers.clone();
        context.version = old.version.clone();
        context.token_refresher = old.token_refresher.clone();
        context.implicit = Some(ImplicitTilingContext {
            scheme,
            maximum_level: maximum_level as u32,
            root_tiles_x: 1,
            content_template,
            subtree_template: Some(subtree_template.to_owned()),
            root_bounding_volume: bounding_volume,
            availability: Some(AvailabilityTree::new(
                subtree_levels as u32,
                maximum_level as u32,
            )),
        });
        self.contexts.push(context);
        let new_context = self.contexts.len() - 1;

        let root_id = match scheme {
            SubdivisionScheme::Quadtree => TileId::Quadtree(QuadtreeTileId { level: 0, x: 0, y: 0 }),
            SubdivisionScheme::Octree => TileId::Octree(OctreeTileId {
                level: 0,
                x: 0,
                y: 0,
                z: 0,
            }),
        };
        let mut implicit_root = Tile::new(root_id, bounding_volume);
        implicit_root.context = new_context;
        implicit_root.geometric_error = geometric_error;
        implicit_root.refine = refine;
        implicit_root.transform = self.arena.get(index).transform;
        self.arena.add_children(index, vec![implicit_root]);

        // The extension tile itself is a dummy: no content of its own, always
        // refined into the implicit root.
        let tile = self.arena.get_mut(index);
        tile.context = new_context;
        tile.id = TileId::Url(String::new());
        tile.unconditionally_refine = true;
        tile.content = Some(ContentHandle::new(TileContent::Empty, 0));
        tile.load_state = LoadState::Done;
    }

    /// Build the root tiling for a quantized-mesh terrain layer.json.
    fn create_terrain_root(&mut self, layer_json: &Value, context: usize) {
        let projection = layer_json
            .get("projection")
            .and_then(Value::as_str)
            .unwrap_or("EPSG:4326");
        let root_tiles_x = match projection {
            "EPSG:4326" => 2u32,
            "EPSG:3857" => 1u32,
            other => {
                error!(projection = other, "Tileset contained an unknown projection value");
                return;
            }
        };

        let bounds = layer_json
            .get("bounds")
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_f64)
                    .collect::<Vec<f64>>()
            })
            .unwrap_or_default();
        let rectangle = if bounds.len() >= 4 {
            GlobeRectangle::from_degrees(bounds[0], bounds[1], bounds[2], bounds[3])
        } else {
            GlobeRectangle::MAXIMUM
        };

        let templates = layer_json
            .get("tiles")
            .and_then(Value::as_array)
            .map(|urls| {
                urls.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let Some(mut content_template) = templates.first().cloned() else {
            error!("layer.json has no tile URL templates");
            return;
        };

        // Request the layer extensions we understand via the `extensions`
        // query parameter.
        let advertised = layer_json
            .get("extensions")
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let mut known = vec!["octvertexnormals", "metadata"];
        if self.options.content_options.enable_water_mask {
            known.push("watermask");
        }
        let to_request: Vec<&str> = known
            .into_iter()
            .filter(|ext| advertised.iter().any(|a| a == ext))
            .collect();
        if !to_request.is_empty() {
            let joined = to_request.join("-");
            let separator = if content_template.contains('?') { '&' } else { '?' };
            content_template = format!("{content_template}{separator}extensions={joined}");
        }
        let maximum_level = layer_json
            .get("maxzoom")
            .and_then(Value::as_u64)
            .unwrap_or(30) as u32;

        let version = layer_json
            .get("version")
            .and_then(Value::as_str)
            .map(str::to_owned);

        let root_volume = BoundingVolume::Region(BoundingRegion {
            rectangle,
            minimum_height: -1000.0,
            maximum_height: 9000.0,
        });

        {
            let ctx = &mut self.contexts[context];
            ctx.version = version;
            ctx.request_headers.push((
                "Accept".into(),
                "application/vnd.quantized-mesh,application/octet-stream;q=0.9".into(),
            ));
            ctx.implicit = Some(ImplicitTilingContext {
                scheme: SubdivisionScheme::Quadtree,
                maximum_level,
                root_tiles_x,
                content_template,
                subtree_template: None,
                root_bounding_volume: root_volume,
                availability: None,
            });
        }

        let mut root = Tile::new(TileId::Url(String::new()), root_volume);
        root.context = context;
        root.geometric_error = 999_999_999.0;
        root.unconditionally_refine = true;
        root.content = Some(ContentHandle::new(TileContent::Empty, 0));
        root.load_state = LoadState::Done;
        let root_index = self.arena.push(root);

        let mut children = Vec::with_capacity(root_tiles_x as usize);
        for x in 0..root_tiles_x {
            let width = rectangle.width() / f64::from(root_tiles_x);
            let child_rect = GlobeRectangle::new(
                rectangle.west + width * f64::from(x),
                rectangle.south,
                rectangle.west + width * f64::from(x + 1),
                rectangle.north,
            );
            let volume = BoundingVolume::Region(BoundingRegion {
                rectangle: child_rect,
                minimum_height: -1000.0,
                maximum_height: 9000.0,
            });
            let mut child = Tile::new(
                TileId::Quadtree(QuadtreeTileId { level: 0, x, y: 0 }),
                volume,
            );
            child.context = context;
            child.geometric_error =
                8.0 * quadtree_max_geometric_error() * child_rect.width();
            children.push(child);
        }
        self.arena.add_children(root_index, children);

        self.root = Some(root_index);
    }

    /// Graft an external tileset's root under the tile that referenced it.
    pub(crate) fn graft_external_tileset(&mut self, index: TileIndex, document: &Value) {
        let Some(root_json) = document.get("root") else {
            warn!(tile = %index, "External tileset has no root tile");
            return;
        };
        if self.arena.get(index).children.is_some() {
            return;
        }

        let parent_context = self.arena.get(index).context;
        let content_url = match &self.arena.get(index).id {
            TileId::Url(url) => url.clone(),
            _ => String::new(),
        };

        // The external document's relative URLs resolve against its own
        // location, so the grafted tiles get a context of their own.
        let base_url = uri::resolve(&self.contexts[parent_context].base_url, &content_url);
        let mut context = TileContext::new(base_url);
        context.request_headers = self.contexts[parent_context].request_headers.clone();
        context.version = self.contexts[parent_context].version.clone();
        context.token_refresher = self.contexts[parent_context].token_refresher.clone();
        self.contexts.push(context);
        let new_context = self.contexts.len() - 1;

        let (transform, refine) = {
            let tile = self.arena.get(index);
            (tile.transform, tile.refine)
        };
        if let Some(root) = build_tile_from_json(root_json, transform, refine, new_context) {
            let range = self.arena.add_children(index, vec![root]);
            if let Some(child) = range.iter().next() {
                self.populate_tile_from_json(child, root_json);
            }
        }
    }

    /// Resolved content URL for a tile, or `None` when it has nothing to
    /// fetch (empty URL, upsampled tiles).
    pub(crate) fn resolved_content_url(&self, index: TileIndex) -> Option<String> {
        let tile = self.arena.get(index);
        let context = self.contexts.get(tile.context)?;

        let relative = match &tile.id {
            TileId::Url(url) => {
                if url.is_empty() {
                    return None;
                }
                url.clone()
            }
            TileId::Quadtree(id) => {
                let implicit = context.implicit.as_ref()?;
                substitute_quadtree(&implicit.content_template, *id, context.version.as_deref())
            }
            TileId::Octree(id) => {
                let implicit = context.implicit.as_ref()?;
                substitute_octree(&implicit.content_template, *id, context.version.as_deref())
            }
            TileId::UpsampledQuadtree { .. } => return None,
        };

        Some(uri::resolve(&context.base_url, &relative))
    }

    /// Resolved subtree URL for an implicit tile.
    pub(crate) fn resolved_subtree_url(&self, index: TileIndex) -> Option<String> {
        let tile = self.arena.get(index);
        let context = self.contexts.get(tile.context)?;
        let implicit = context.implicit.as_ref()?;
        let template = implicit.subtree_template.as_deref()?;

        let relative = match &tile.id {
            TileId::Quadtree(id) => substitute_quadtree(template, *id, context.version.as_deref()),
            TileId::Octree(id) => substitute_octree(template, *id, context.version.as_deref()),
            _ => return None,
        };

        Some(uri::resolve(&context.base_url, &relative))
    }

    /// Drive the async system until every outstanding load has terminated.
    /// Called by `Drop`; also useful before tearing down an accessor.
    pub fn drain(&mut self) {
        while !self.is_idle() {
            self.accessor.tick();
            self.process_async();
            std::thread::yield_now();
        }
    }
}

impl Drop for Tileset {
    fn drop(&mut self) {
        self.drain();
    }
}

/// Maximum geometric error of a whole-globe quadtree root tile, per radian
/// of tile width.
pub(crate) fn quadtree_max_geometric_error() -> f64 {
    WGS84_A * 0.25 / 65.0
}

fn parse_transform(json: &Value) -> Option<DMat4> {
    let values = json.get("transform")?.as_array()?;
    if values.len() < 16 {
        return None;
    }
    let mut m = [0.0f64; 16];
    for (slot, value) in m.iter_mut().zip(values) {
        *slot = value.as_f64()?;
    }
    Some(DMat4::from_cols_array(&m))
}

/// Parse a bounding volume property (`box`, `region`, `sphere`, or the S2
/// extension) from a tile JSON object.
pub(crate) fn parse_bounding_volume(json: &Value) -> Option<BoundingVolume> {
    if let Some(s2) = json
        .get("extensions")
        .and_then(|e| e.get("3DTILES_bounding_volume_S2"))
    {
        let token = s2.get("token").and_then(Value::as_str).unwrap_or("1");
        let cell_id = S2CellVolume::cell_id_from_token(token)?;
        return Some(BoundingVolume::S2Cell(S2CellVolume {
            cell_id,
            minimum_height: s2.get("minimumHeight").and_then(Value::as_f64).unwrap_or(0.0),
            maximum_height: s2.get("maximumHeight").and_then(Value::as_f64).unwrap_or(0.0),
        }));
    }

    if let Some(values) = json.get("box").and_then(Value::as_array) {
        if values.len() >= 12 {
            let mut v = [0.0f64; 12];
            for (slot, value) in v.iter_mut().zip(values) {
                *slot = value.as_f64()?;
            }
            return Some(BoundingVolume::OrientedBox(OrientedBox {
                center: DVec3::new(v[0], v[1], v[2]),
                half_axes: DMat3::from_cols(
                    DVec3::new(v[3], v[4], v[5]),
                    DVec3::new(v[6], v[7], v[8]),
                    DVec3::new(v[9], v[10], v[11]),
                ),
            }));
        }
    }

    if let Some(values) = json.get("region").and_then(Value::as_array) {
        if values.len() >= 6 {
            let mut v = [0.0f64; 6];
            for (slot, value) in v.iter_mut().zip(values) {
                *slot = value.as_f64()?;
            }
            return Some(BoundingVolume::Region(BoundingRegion {
                rectangle: GlobeRectangle::new(v[0], v[1], v[2], v[3]),
                minimum_height: v[4],
                maximum_height: v[5],
            }));
        }
    }

    if let Some(values) = json.get("sphere").and_then(Value::as_array) {
        if values.len() >= 4 {
            let mut v = [0.0f64; 4];
            for (slot, value) in v.iter_mut().zip(values) {
                *slot = value.as_f64()?;
            }
            return Some(BoundingVolume::Sphere(BoundingSphere {
                center: DVec3::new(v[0], v[1], v[2]),
                radius: v[3],
            }));
        }
    }

    None
}

/// Build one tile (fields only, no children) from tileset JSON.
pub(crate) fn build_tile_from_json(
    json: &Value,
    parent_transform: DMat4,
    parent_refine: TileRefine,
    context: usize,
) -> Option<Tile> {
    if !json.is_object() {
        return None;
    }

    let transform = parent_transform * parse_transform(json).unwrap_or(DMat4::IDENTITY);

    let Some(bounding_volume) = json.get("boundingVolume").and_then(parse_bounding_volume) else {
        error!("Tile did not contain a boundingVolume");
        return None;
    };
    let Some(geometric_error) = json.get("geometricError").and_then(Value::as_f64) else {
        error!("Tile did not contain a geometricError");
        return None;
    };

    let content_uri = json.get("content").and_then(|content| {
        content
            .get("uri")
            .or_else(|| content.get("url"))
            .and_then(Value::as_str)
    });

    let refine = match json.get("refine").and_then(Value::as_str) {
        Some("REPLACE") => TileRefine::Replace,
        Some("ADD") => TileRefine::Add,
        Some(other) => {
            error!(refine = other, "Tile contained an unknown refine value");
            parent_refine
        }
        None => parent_refine,
    };

    let scale = DVec3::new(
        transform.x_axis.truncate().length(),
        transform.y_axis.truncate().length(),
        transform.z_axis.truncate().length(),
    );

    let mut tile = Tile::new(
        TileId::Url(content_uri.unwrap_or_default().to_owned()),
        bounding_volume.transformed_by(&transform),
    );
    tile.context = context;
    tile.transform = transform;
    tile.geometric_error = geometric_error * scale.max_element();
    tile.refine = refine;
    tile.content_bounding_volume = json
        .get("content")
        .and_then(|content| content.get("boundingVolume"))
        .and_then(parse_bounding_volume)
        .map(|v| v.transformed_by(&transform));
    tile.viewer_request_volume = json
        .get("viewerRequestVolume")
        .and_then(parse_bounding_volume)
        .map(|v| v.transformed_by(&transform));

    Some(tile)
}

fn substitute_quadtree(template: &str, id: QuadtreeTileId, version: Option<&str>) -> String {
    uri::substitute_template_parameters(template, |name| match name {
        "level" | "z" => Some(id.level.to_string()),
        "x" => Some(id.x.to_string()),
        "y" => Some(id.y.to_string()),
        "version" => Some(version.unwrap_or_default().to_owned()),
        _ => None,
    })
}

fn substitute_octree(template: &str, id: OctreeTileId, version: Option<&str>) -> String {
    uri::substitute_template_parameters(template, |name| match name {
        "level" => Some(id.level.to_string()),
        "x" => Some(id.x.to_string()),
        "y" => Some(id.y.to_string()),
        "z" => Some(id.z.to_string()),
        "version" => Some(version.unwrap_or_default().to_owned()),
        _ => None,
    })
}

/// Coordinates of the subtree containing an implicit tile, as
/// `(subtree-level-index, subtree root id, morton of the root)`.
pub(crate) fn subtree_cell_for_quadtree(
    id: QuadtreeTileId,
    subtree_levels: u32,
) -> (u32, QuadtreeTileId, u64) {
    let level_index = id.level / subtree_levels;
    let level_in_subtree = id.level % subtree_levels;
    let root = QuadtreeTileId {
        level: level_index * subtree_levels,
        x: id.x >> level_in_subtree,
        y: id.y >> level_in_subtree,
    };
    (level_index, root, morton2_encode(root.x, root.y))
}

pub(crate) fn subtree_cell_for_octree(
    id: OctreeTileId,
    subtree_levels: u32,
) -> (u32, OctreeTileId, u64) {
    let level_index = id.level / subtree_levels;
    let level_in_subtree = id.level % subtree_levels;
    let root = OctreeTileId {
        level: level_index * subtree_levels,
        x: id.x >> level_in_subtree,
        y: id.y >> level_in_subtree,
        z: id.z >> level_in_subtree,
    };
    (level_index, root, morton3_encode(root.x, root.y, root.z))
}

/// Subdivide an implicit root bounding volume down to the given quadtree
/// cell.
pub(crate) fn subdivide_quadtree_volume(
    root: &BoundingVolume,
    id: QuadtreeTileId,
    root_tiles_x: u32,
) -> BoundingVolume {
    match root {
        BoundingVolume::Region(region) => {
            let denominator = f64::from(1u32 << id.level.min(31));
            let rect = region.rectangle;
            let width = rect.width() / (denominator * f64::from(root_tiles_x.max(1)));
            let height = rect.height() / denominator;
            let west = rect.west + width * f64::from(id.x);
            let south = rect.south + height * f64::from(id.y);
            BoundingVolume::Region(BoundingRegion {
                rectangle: GlobeRectangle::new(west, south, west + width, south + height),
                minimum_height: region.minimum_height,
                maximum_height: region.maximum_height,
            })
        }
        BoundingVolume::OrientedBox(obb) => {
            let mut current = *obb;
            for level in (0..id.level).rev() {
                let x_bit = ((id.x >> level) & 1) as u8;
                let y_bit = ((id.y >> level) & 1) as u8;
                current = current.quadrant(x_bit | (y_bit << 1));
            }
            BoundingVolume::OrientedBox(current)
        }
        other => *other,
    }
}

/// Subdivide an implicit root bounding volume down to the given octree cell.
pub(crate) fn subdivide_octree_volume(root: &BoundingVolume, id: OctreeTileId) -> BoundingVolume {
    match root {
        BoundingVolume::Region(region) => {
            let denominator = f64::from(1u32 << id.level.min(31));
            let rect = region.rectangle;
            let width = rect.width() / denominator;
            let height = rect.height() / denominator;
            let height_range =
                (region.maximum_height - region.minimum_height) / denominator;
            let west = rect.west + width * f64::from(id.x);
            let south = rect.south + height * f64::from(id.y);
            let bottom = region.minimum_height + height_range * f64::from(id.z);
            BoundingVolume::Region(BoundingRegion {
                rectangle: GlobeRectangle::new(west, south, west + width, south + height),
                minimum_height: bottom,
                maximum_height: bottom + height_range,
            })
        }
        BoundingVolume::OrientedBox(obb) => {
            let mut current = *obb;
            for level in (0..id.level).rev() {
                let x_bit = ((id.x >> level) & 1) as u8;
                let y_bit = ((id.y >> level) & 1) as u8;
                let z_bit = ((id.z >> level) & 1) as u8;
                current = current.octant(x_bit | (y_bit << 1) | (z_bit << 2));
            }
            BoundingVolume::OrientedBox(current)
        }
        other => *other,
    }
}
