//! The asynchronous load pipeline: asset accessor abstraction, the worker
//! decode stage, and renderer resource preparation hooks.
//!
//! Work is split across exactly two domains. The main thread owns the tile
//! tree and all state transitions; workers (the rayon pool) decode bytes and
//! prepare renderer resources, then hand a [`LoadCompletion`] back over a
//! channel. Suspension points are the network fetch and the worker hop,
//! nothing else.

use std::any::Any;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TryRecvError};

use crate::availability::{self, SubtreeAvailability};
use crate::config::ContentOptions;
use crate::content::glb::GltfModel;
use crate::content::{ContentFactory, ContentInput};
use crate::error::{Result, TileStreamError};
use crate::overlay::RasterImage;
use crate::types::{Tile, TileContent, TileIndex};

/// One HTTP-style request header.
pub type Header = (String, String);

/// Response handed back by an [`AssetAccessor`].
#[derive(Debug, Clone)]
pub struct AssetResponse {
    /// HTTP status; 0 for non-network sources.
    pub status: u16,
    pub content_type: String,
    pub headers: Vec<Header>,
    pub data: Vec<u8>,
    /// The URL the response was served for (diagnostics).
    pub url: String,
}

/// A response slot the main thread polls without blocking.
#[derive(Debug)]
pub struct AssetFuture {
    rx: Receiver<AssetResponse>,
    taken: bool,
}

impl AssetFuture {
    /// A future that is already resolved.
    pub fn ready(response: AssetResponse) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let _ = tx.send(response);
        Self { rx, taken: false }
    }

    /// An unresolved future plus the sender that resolves it.
    pub fn pending() -> (Sender<AssetResponse>, Self) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        (tx, Self { rx, taken: false })
    }

    /// Take the response if it has arrived. Returns `None` while in flight
    /// and `Some(Err(..))` when the sender was dropped without responding.
    pub fn try_take(&mut self) -> Option<Result<AssetResponse>> {
        if self.taken {
            return None;
        }
        match self.rx.try_recv() {
            Ok(response) => {
                self.taken = true;
                Some(Ok(response))
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.taken = true;
                Some(Err(TileStreamError::Transport(
                    "request abandoned without a response".into(),
                )))
            }
        }
    }
}

/// Fetches bytes for the engine. Implementations decide how `tick` drains
/// their I/O runtime; the engine calls it whenever it pumps the pipeline.
pub trait AssetAccessor: Send + Sync {
    fn get(&self, url: &str, headers: &[Header]) -> AssetFuture;
    fn tick(&self) {}
}

/// Serves requests from the local filesystem, resolving URLs relative to a
/// root directory. Completion is immediate; useful for tests and offline
/// datasets.
#[derive(Debug)]
pub struct FilesystemAccessor {
    root: PathBuf,
}

impl FilesystemAccessor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn content_type_for(path: &str) -> &'static str {
        match crate::uri::file_extension(path).as_deref() {
            Some(".json") => "application/json",
            Some(".glb") => "model/gltf-binary",
            Some(".gltf") => "model/gltf+json",
            Some(".png") => "image/png",
            Some(".jpg") | Some(".jpeg") => "image/jpeg",
            _ => "application/octet-stream",
        }
    }
}

impl AssetAccessor for FilesystemAccessor {
    fn get(&self, url: &str, _headers: &[Header]) -> AssetFuture {
        let path = self.root.join(url.trim_start_matches('/'));
        let response = match std::fs::read(&path) {
            Ok(data) => AssetResponse {
                status: 200,
                content_type: Self::content_type_for(url).to_owned(),
                headers: Vec::new(),
                data,
                url: url.to_owned(),
            },
            Err(_) => AssetResponse {
                status: 404,
                content_type: String::new(),
                headers: Vec::new(),
                data: Vec::new(),
                url: url.to_owned(),
            },
        };
        AssetFuture::ready(response)
    }
}

/// Renderer preparation hooks. The load-thread half runs on workers; the
/// main-thread half runs while the engine applies completions.
pub trait PrepareRendererResources: Send + Sync {
    fn prepare_in_load_thread(
        &self,
        model: &GltfModel,
        options: &ContentOptions,
    ) -> Option<Box<dyn Any + Send>>;

    fn prepare_in_main_thread(
        &self,
        tile: &Tile,
        load_thread_result: Option<Box<dyn Any + Send>>,
    ) -> Option<Box<dyn Any + Send>>;

    fn free(
        &self,
        tile: &Tile,
        load_thread_result: Option<Box<dyn Any + Send>>,
        main_thread_result: Option<Box<dyn Any + Send>>,
    );

    fn prepare_raster_in_load_thread(&self, image: &RasterImage) -> Option<Box<dyn Any + Send>> {
        let _ = image;
        None
    }

    fn prepare_raster_in_main_thread(
        &self,
        load_thread_result: Option<Box<dyn Any + Send>>,
    ) -> Option<Box<dyn Any + Send>> {
        load_thread_result
    }

    fn free_raster(
        &self,
        load_thread_result: Option<Box<dyn Any + Send>>,
        main_thread_result: Option<Box<dyn Any + Send>>,
    ) {
        drop(load_thread_result);
        drop(main_thread_result);
    }
}

/// Hook implementation that prepares nothing. The default.
#[derive(Debug, Default)]
pub struct NoopRendererResources;

impl PrepareRendererResources for NoopRendererResources {
    fn prepare_in_load_thread(
        &self,
        _model: &GltfModel,
        _options: &ContentOptions,
    ) -> Option<Box<dyn Any + Send>> {
        None
    }

    fn prepare_in_main_thread(
        &self,
        _tile: &Tile,
        load_thread_result: Option<Box<dyn Any + Send>>,
    ) -> Option<Box<dyn Any + Send>> {
        load_thread_result
    }

    fn free(
        &self,
        _tile: &Tile,
        load_thread_result: Option<Box<dyn Any + Send>>,
        main_thread_result: Option<Box<dyn Any + Send>>,
    ) {
        drop(load_thread_result);
        drop(main_thread_result);
    }
}

/// Result of one pipeline stage, delivered to the main thread.
pub enum LoadCompletion {
    Tile {
        tile: TileIndex,
        outcome: Result<TileContent>,
        http_status: u16,
        load_thread_resources: Option<Box<dyn Any + Send>>,
    },
    Subtree {
        tile: TileIndex,
        /// `(subtree-level-index, morton)` of the subtree cell.
        key: (u32, u64),
        outcome: Result<SubtreeAvailability>,
    },
    Raster {
        overlay: usize,
        raster_tile: usize,
        outcome: Result<RasterImage>,
        load_thread_resources: Option<Box<dyn Any + Send>>,
    },
}

struct PendingTileFetch {
    tile: TileIndex,
    future: AssetFuture,
}

struct PendingSubtreeFetch {
    tile: TileIndex,
    key: (u32, u64),
    branching_factor: u32,
    future: AssetFuture,
}

struct PendingRasterFetch {
    overlay: usize,
    raster_tile: usize,
    future: AssetFuture,
}

/// The in-flight half of the loader: fetches being polled, worker tasks in
/// progress, and the counters backing the concurrency caps.
///
/// `loads_in_progress` is incremented when a fetch begins and decremented by
/// the engine when the completion is applied on the main thread, so a slot
/// stays occupied across the whole fetch → decode → apply chain.
pub struct LoadPipeline {
    pending_tiles: Vec<PendingTileFetch>,
    pending_subtrees: Vec<PendingSubtreeFetch>,
    pending_rasters: Vec<PendingRasterFetch>,
    completion_tx: Sender<LoadCompletion>,
    completion_rx: Receiver<LoadCompletion>,
    pub loads_in_progress: u32,
    pub subtree_loads_in_progress: u32,
}

impl Default for LoadPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadPipeline {
    pub fn new() -> Self {
        let (completion_tx, completion_rx) = crossbeam_channel::unbounded();
        Self {
            pending_tiles: Vec::new(),
            pending_subtrees: Vec::new(),
            pending_rasters: Vec::new(),
            completion_tx,
            completion_rx,
            loads_in_progress: 0,
            subtree_loads_in_progress: 0,
        }
    }

    pub fn begin_tile_fetch(&mut self, tile: TileIndex, future: AssetFuture) {
        self.loads_in_progress += 1;
        self.pending_tiles.push(PendingTileFetch { tile, future });
    }

    pub fn begin_subtree_fetch(
        &mut self,
        tile: TileIndex,
        key: (u32, u64),
        branching_factor: u32,
        future: AssetFuture,
    ) {
        self.subtree_loads_in_progress += 1;
        self.pending_subtrees.push(PendingSubtreeFetch {
            tile,
            key,
            branching_factor,
            future,
        });
    }

    pub fn begin_raster_fetch(&mut self, overlay: usize, raster_tile: usize, future: AssetFuture) {
        self.pending_rasters.push(PendingRasterFetch {
            overlay,
            raster_tile,
            future,
        });
    }

    /// Whether any stage still holds work (used by teardown).
    pub fn is_idle(&self) -> bool {
        self.loads_in_progress == 0
            && self.subtree_loads_in_progress == 0
            && self.pending_rasters.is_empty()
    }

    /// Poll pending fetches and move completed responses onto the worker
    /// pool for decoding. `tile_urls` supplies the resolved URL per tile for
    /// decoder dispatch.
    pub fn pump_fetches(
        &mut self,
        factory: &Arc<ContentFactory>,
        renderer: &Arc<dyn PrepareRendererResources>,
        options: &ContentOptions,
        tile_urls: &HashMap<TileIndex, String>,
    ) {
        let mut still_pending = Vec::with_capacity(self.pending_tiles.len());
        for mut fetch in self.pending_tiles.drain(..) {
            let Some(result) = fetch.future.try_take() else {
                still_pending.push(fetch);
                continue;
            };

            let tx = self.completion_tx.clone();
            match result {
                Err(e) => {
                    let _ = tx.send(LoadCompletion::Tile {
                        tile: fetch.tile,
                        outcome: Err(e),
                        http_status: 0,
                        load_thread_resources: None,
                    });
                }
                Ok(response) if !is_success(response.status) => {
                    let _ = tx.send(LoadCompletion::Tile {
                        tile: fetch.tile,
                        outcome: Err(TileStreamError::Transport(format!(
                            "received status code {} for tile content {}",
                            response.status, response.url
                        ))),
                        http_status: response.status,
                        load_thread_resources: None,
                    });
                }
                Ok(response) if response.data.is_empty() => {
                    let _ = tx.send(LoadCompletion::Tile {
                        tile: fetch.tile,
                        outcome: Err(TileStreamError::Transport(format!(
                            "empty response for tile content {}",
                            response.url
                        ))),
                        http_status: response.status,
                        load_thread_resources: None,
                    });
                }
                Ok(response) => {
                    let tile = fetch.tile;
                    let factory = factory.clone();
                    let renderer = renderer.clone();
                    let options = options.clone();
                    let url = tile_urls
                        .get(&tile)
                        .cloned()
                        .unwrap_or_else(|| response.url.clone());

                    rayon::spawn(move || {
                        let input = ContentInput {
                            url: &url,
                            content_type: &response.content_type,
                            data: &response.data,
                            options: &options,
                        };
                        let outcome = factory.decode(&input);
                        let load_thread_resources = match &outcome {
                            Ok(TileContent::Model(model)) => {
                                renderer.prepare_in_load_thread(model, &options)
                            }
                            _ => None,
                        };
                        let _ = tx.send(LoadCompletion::Tile {
                            tile,
                            outcome,
                            http_status: response.status,
                            load_thread_resources,
                        });
                    });
                }
            }
        }
        self.pending_tiles = still_pending;

        let mut still_pending = Vec::with_capacity(self.pending_subtrees.len());
        for mut fetch in self.pending_subtrees.drain(..) {
            let Some(result) = fetch.future.try_take() else {
                still_pending.push(fetch);
                continue;
            };

            let tx = self.completion_tx.clone();
            match result {
                Err(e) => {
                    let _ = tx.send(LoadCompletion::Subtree {
                        tile: fetch.tile,
                        key: fetch.key,
                        outcome: Err(e),
                    });
                }
                Ok(response) if !is_success(response.status) => {
                    let _ = tx.send(LoadCompletion::Subtree {
                        tile: fetch.tile,
                        key: fetch.key,
                        outcome: Err(TileStreamError::Transport(format!(
                            "received status code {} for subtree {}",
                            response.status, response.url
                        ))),
                    });
                }
                Ok(response) => {
                    let tile = fetch.tile;
                    let key = fetch.key;
                    let branching_factor = fetch.branching_factor;
                    rayon::spawn(move || {
                        let outcome = availability::decode_subtree(&response.data, branching_factor);
                        let _ = tx.send(LoadCompletion::Subtree {
                            tile,
                            key,
                            outcome,
                        });
                    });
                }
            }
        }
        self.pending_subtrees = still_pending;

        let mut still_pending = Vec::with_capacity(self.pending_rasters.len());
        for mut fetch in self.pending_rasters.drain(..) {
            let Some(result) = fetch.future.try_take() else {
                still_pending.push(fetch);
                continue;
            };

            let tx = self.completion_tx.clone();
            let overlay = fetch.overlay;
            let raster_tile = fetch.raster_tile;
            match result {
                Err(e) => {
                    let _ = tx.send(LoadCompletion::Raster {
                        overlay,
                        raster_tile,
                        outcome: Err(e),
                        load_thread_resources: None,
                    });
                }
                Ok(response) if !is_success(response.status) => {
                    let _ = tx.send(LoadCompletion::Raster {
                        overlay,
                        raster_tile,
                        outcome: Err(TileStreamError::Transport(format!(
                            "received status code {} for raster tile {}",
                            response.status, response.url
                        ))),
                        load_thread_resources: None,
                    });
                }
                Ok(response) => {
                    let renderer = renderer.clone();
                    rayon::spawn(move || {
                        let outcome = RasterImage::decode(&response.data);
                        let load_thread_resources = match &outcome {
                            Ok(image) => renderer.prepare_raster_in_load_thread(image),
                            Err(_) => None,
                        };
                        let _ = tx.send(LoadCompletion::Raster {
                            overlay,
                            raster_tile,
                            outcome,
                            load_thread_resources,
                        });
                    });
                }
            }
        }
        self.pending_rasters = still_pending;
    }

    /// Drain all completions workers have delivered so far.
    pub fn drain_completions(&mut self) -> Vec<LoadCompletion> {
        let mut out = Vec::new();
        while let Ok(completion) = self.completion_rx.try_recv() {
            out.push(completion);
        }
        out
    }
}

fn is_success(status: u16) -> bool {
    status == 0 || (200..300).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn wait_for_completions(pipeline: &mut LoadPipeline, count: usize) -> Vec<LoadCompletion> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut out = Vec::new();
        while out.len() < count && Instant::now() < deadline {
            out.extend(pipeline.drain_completions());
            std::thread::sleep(Duration::from_millis(1));
        }
        out
    }

    fn ok_response(data: Vec<u8>, url: &str) -> AssetResponse {
        AssetResponse {
            status: 200,
            content_type: String::new(),
            headers: Vec::new(),
            data,
            url: url.to_owned(),
        }
    }

    #[test]
    fn ready_future_resolves_immediately() {
        let mut future = AssetFuture::ready(ok_response(vec![1, 2, 3], "x"));
        let response = future.try_take().unwrap().unwrap();
        assert_eq!(response.data, vec![1, 2, 3]);
        assert!(future.try_take().is_none());
    }

    #[test]
    fn pending_future_resolves_after_send() {
        let (tx, mut future) = AssetFuture::pending();
        assert!(future.try_take().is_none());
        tx.send(ok_response(vec![9], "y")).unwrap();
        assert_eq!(future.try_take().unwrap().unwrap().data, vec![9]);
    }

    #[test]
    fn dropped_sender_is_a_transport_error() {
        let (tx, mut future) = AssetFuture::pending();
        drop(tx);
        assert!(matches!(
            future.try_take(),
            Some(Err(TileStreamError::Transport(_)))
        ));
    }

    #[test]
    fn filesystem_accessor_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tile.glb"), b"payload").unwrap();

        let accessor = FilesystemAccessor::new(dir.path());
        let mut future = accessor.get("tile.glb", &[]);
        let response = future.try_take().unwrap().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.data, b"payload");
        assert_eq!(response.content_type, "model/gltf-binary");
    }

    #[test]
    fn filesystem_accessor_missing_file_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let accessor = FilesystemAccessor::new(dir.path());
        let mut future = accessor.get("absent.json", &[]);
        assert_eq!(future.try_take().unwrap().unwrap().status, 404);
    }

    #[test]
    fn pipeline_decodes_tile_content_on_workers() {
        let mut pipeline = LoadPipeline::new();
        let factory: Arc<ContentFactory> = Arc::new(ContentFactory::with_default_decoders());
        let renderer: Arc<dyn PrepareRendererResources> = Arc::new(NoopRendererResources);
        let options = ContentOptions::default();

        let glb =
            crate::content::glb::write_glb(&crate::content::glb::test_support::triangle_model())
                .unwrap();
        pipeline.begin_tile_fetch(TileIndex(0), AssetFuture::ready(ok_response(glb, "t.glb")));
        assert_eq!(pipeline.loads_in_progress, 1);

        let mut urls = HashMap::new();
        urls.insert(TileIndex(0), "t.glb".to_owned());
        pipeline.pump_fetches(&factory, &renderer, &options, &urls);

        let completions = wait_for_completions(&mut pipeline, 1);
        assert_eq!(completions.len(), 1);
        match &completions[0] {
            LoadCompletion::Tile {
                tile,
                outcome: Ok(TileContent::Model(model)),
                http_status,
                ..
            } => {
                assert_eq!(*tile, TileIndex(0));
                assert_eq!(*http_status, 200);
                assert_eq!(model.primitive_count(), 1);
            }
            _ => panic!("expected a successful model completion"),
        }
        // The slot stays occupied until the engine applies the completion.
        assert_eq!(pipeline.loads_in_progress, 1);
    }

    #[test]
    fn http_error_statuses_complete_as_transport_errors() {
        let mut pipeline = LoadPipeline::new();
        let factory: Arc<ContentFactory> = Arc::new(ContentFactory::with_default_decoders());
        let renderer: Arc<dyn PrepareRendererResources> = Arc::new(NoopRendererResources);
        let options = ContentOptions::default();

        let response = AssetResponse {
            status: 404,
            content_type: String::new(),
            headers: Vec::new(),
            data: Vec::new(),
            url: "missing.b3dm".to_owned(),
        };
        pipeline.begin_tile_fetch(TileIndex(3), AssetFuture::ready(response));
        pipeline.pump_fetches(&factory, &renderer, &options, &HashMap::new());

        let completions = wait_for_completions(&mut pipeline, 1);
        match &completions[0] {
            LoadCompletion::Tile {
                tile,
                outcome: Err(TileStreamError::Transport(message)),
                http_status,
                ..
            } => {
                assert_eq!(*tile, TileIndex(3));
                assert_eq!(*http_status, 404);
                assert!(message.contains("404"));
            }
            _ => panic!("expected a transport error completion"),
        }
    }

    #[test]
    fn subtree_fetch_decodes_blob() {
        let mut pipeline = LoadPipeline::new();
        let factory: Arc<ContentFactory> = Arc::new(ContentFactory::new());
        let renderer: Arc<dyn PrepareRendererResources> = Arc::new(NoopRendererResources);
        let options = ContentOptions::default();

        let json = r#"{"tileAvailability":{"constant":1},"contentAvailability":{"constant":1},"childSubtreeAvailability":{"constant":0}}"#;
        let mut blob = Vec::new();
        blob.extend_from_slice(b"subt");
        blob.extend_from_slice(&1u32.to_le_bytes());
        blob.extend_from_slice(&(json.len() as u64).to_le_bytes());
        blob.extend_from_slice(&0u64.to_le_bytes());
        blob.extend_from_slice(json.as_bytes());

        pipeline.begin_subtree_fetch(
            TileIndex(1),
            (0, 0),
            4,
            AssetFuture::ready(ok_response(blob, "0.0.0.subtree")),
        );
        assert_eq!(pipeline.subtree_loads_in_progress, 1);
        pipeline.pump_fetches(&factory, &renderer, &options, &HashMap::new());

        let completions = wait_for_completions(&mut pipeline, 1);
        match &completions[0] {
            LoadCompletion::Subtree {
                key,
                outcome: Ok(subtree),
                ..
            } => {
                assert_eq!(*key, (0, 0));
                assert!(subtree.is_tile_available(1, 2));
            }
            _ => panic!("expected a successful subtree completion"),
        }
    }
}
