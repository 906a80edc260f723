//! End-to-end selection and streaming tests over synthetic tilesets served
//! from an in-memory accessor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use glam::{DVec2, DVec3};
use tilestream::config::TilesetOptions;
use tilestream::loader::{
    AssetAccessor, AssetFuture, AssetResponse, Header, NoopRendererResources,
};
use tilestream::types::{LoadState, TileContent, TileIndex};
use tilestream::{Tileset, ViewState};

/// In-memory accessor. Each URL maps to a queue of scripted responses; the
/// last response repeats. With `hold` set, requests park until `release`.
#[derive(Default)]
struct MemoryAccessor {
    responses: Mutex<HashMap<String, Vec<AssetResponse>>>,
    request_log: Mutex<Vec<(String, Vec<Header>)>>,
    hold: AtomicBool,
    parked: Mutex<Vec<(String, crossbeam_channel::Sender<AssetResponse>)>>,
}

impl MemoryAccessor {
    fn new() -> Self {
        Self::default()
    }

    fn serve(&self, url: &str, status: u16, data: Vec<u8>) {
        self.responses
            .lock()
            .unwrap()
            .entry(url.to_owned())
            .or_default()
            .push(AssetResponse {
                status,
                content_type: String::new(),
                headers: Vec::new(),
                data,
                url: url.to_owned(),
            });
    }

    fn requests_for(&self, url: &str) -> Vec<Vec<Header>> {
        self.request_log
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, _)| u == url)
            .map(|(_, headers)| headers.clone())
            .collect()
    }

    fn hold_requests(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    fn release_requests(&self) {
        self.hold.store(false, Ordering::SeqCst);
    }

    fn parked_count(&self) -> usize {
        self.parked.lock().unwrap().len()
    }

    fn response_for(&self, url: &str) -> AssetResponse {
        let mut responses = self.responses.lock().unwrap();
        match responses.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.remove(0),
            Some(queue) if queue.len() == 1 => queue[0].clone(),
            _ => AssetResponse {
                status: 404,
                content_type: String::new(),
                headers: Vec::new(),
                data: Vec::new(),
                url: url.to_owned(),
            },
        }
    }
}

impl AssetAccessor for MemoryAccessor {
    fn get(&self, url: &str, headers: &[Header]) -> AssetFuture {
        self.request_log
            .lock()
            .unwrap()
            .push((url.to_owned(), headers.to_vec()));

        if self.hold.load(Ordering::SeqCst) {
            let (tx, future) = AssetFuture::pending();
            self.parked.lock().unwrap().push((url.to_owned(), tx));
            future
        } else {
            AssetFuture::ready(self.response_for(url))
        }
    }

    fn tick(&self) {
        if self.hold.load(Ordering::SeqCst) {
            return;
        }
        let parked: Vec<_> = self.parked.lock().unwrap().drain(..).collect();
        for (url, tx) in parked {
            let _ = tx.send(self.response_for(&url));
        }
    }
}

/// A minimal GLB whose BIN chunk is `bin_len` zero bytes: one mesh with one
/// primitive, so decoded models are renderable and have a byte size.
fn glb_bytes(bin_len: usize) -> Vec<u8> {
    let json = format!(
        concat!(
            r#"{{"asset":{{"version":"2.0"}},"#,
            r#""buffers":[{{"byteLength":{}}}],"#,
            r#""meshes":[{{"primitives":[{{"attributes":{{}}}}]}}]}}"#
        ),
        bin_len
    );
    let mut json = json.into_bytes();
    while json.len() % 4 != 0 {
        json.push(b' ');
    }
    let mut bin = vec![0u8; bin_len];
    while bin.len() % 4 != 0 {
        bin.push(0);
    }

    let mut total = 12 + 8 + json.len();
    if !bin.is_empty() {
        total += 8 + bin.len();
    }
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&0x4654_6C67u32.to_le_bytes());
    out.extend_from_slice(&2u32.to_le_bytes());
    out.extend_from_slice(&(total as u32).to_le_bytes());
    out.extend_from_slice(&(json.len() as u32).to_le_bytes());
    out.extend_from_slice(&0x4E4F_534Au32.to_le_bytes());
    out.extend_from_slice(&json);
    if !bin.is_empty() {
        out.extend_from_slice(&(bin.len() as u32).to_le_bytes());
        out.extend_from_slice(&0x004E_4942u32.to_le_bytes());
        out.extend_from_slice(&bin);
    }
    out
}

fn sphere_json(x: f64, radius: f64) -> serde_json::Value {
    serde_json::json!({ "sphere": [x, 0.0, 0.0, radius] })
}

/// tileset.json with a root at x=100 and four replace-refined children.
fn quad_tileset_json(refine: &str) -> Vec<u8> {
    let children: Vec<serde_json::Value> = (0..4)
        .map(|i| {
            serde_json::json!({
                "boundingVolume": sphere_json(85.0 + 10.0 * f64::from(i), 6.0),
                "geometricError": 2.0,
                "content": { "uri": format!("tiles/child{i}.glb") },
            })
        })
        .collect();

    serde_json::to_vec(&serde_json::json!({
        "asset": { "version": "1.1" },
        "geometricError": 64.0,
        "root": {
            "boundingVolume": sphere_json(100.0, 30.0),
            "geometricError": 32.0,
            "refine": refine,
            "content": { "uri": "tiles/root.glb" },
            "children": children,
        }
    }))
    .unwrap()
}

fn serve_quad_tileset(accessor: &MemoryAccessor, refine: &str) {
    accessor.serve("tileset.json", 200, quad_tileset_json(refine));
    accessor.serve("tiles/root.glb", 200, glb_bytes(64));
    for i in 0..4 {
        accessor.serve(&format!("tiles/child{i}.glb"), 200, glb_bytes(16));
    }
}

fn looking_along_x() -> ViewState {
    ViewState::create(
        DVec3::ZERO,
        DVec3::X,
        DVec3::Z,
        DVec2::new(1024.0, 768.0),
        60_f64.to_radians(),
        45_f64.to_radians(),
    )
}

fn looking_away_from_x() -> ViewState {
    ViewState::create(
        DVec3::ZERO,
        -DVec3::X,
        DVec3::Z,
        DVec2::new(1024.0, 768.0),
        60_f64.to_radians(),
        45_f64.to_radians(),
    )
}

fn new_tileset(accessor: Arc<MemoryAccessor>, options: TilesetOptions) -> Tileset {
    Tileset::new(
        accessor,
        Arc::new(NoopRendererResources),
        "tileset.json",
        options,
    )
}

/// Find the tile whose explicit content URL is `url`.
fn tile_by_url(tileset: &Tileset, url: &str) -> Option<TileIndex> {
    tileset.arena().indices().find(|&index| {
        matches!(&tileset.tile(index).id, tilestream::types::TileId::Url(u) if u == url)
    })
}

#[test]
fn empty_frustum_set_visits_nothing() {
    let accessor = Arc::new(MemoryAccessor::new());
    serve_quad_tileset(&accessor, "REPLACE");

    let mut tileset = new_tileset(accessor, TilesetOptions::default());
    tileset.update_view_offline(&[looking_along_x()]);

    let result = tileset.update_view(&[]).clone();
    assert_eq!(result.tiles_visited, 0);
    assert!(result.tiles_to_render.is_empty());
}

#[test]
fn hidden_root_is_culled() {
    let accessor = Arc::new(MemoryAccessor::new());
    serve_quad_tileset(&accessor, "REPLACE");

    let mut tileset = new_tileset(accessor, TilesetOptions::default());
    let result = tileset.update_view_offline(&[looking_away_from_x()]).clone();

    assert!(result.tiles_culled >= 1);
    assert!(result.tiles_to_render.is_empty());
}

#[test]
fn coarse_view_renders_root_only() {
    let accessor = Arc::new(MemoryAccessor::new());
    serve_quad_tileset(&accessor, "REPLACE");

    // Generous SSE budget: the root alone satisfies it.
    let options = TilesetOptions {
        maximum_screen_space_error: 100_000.0,
        ..TilesetOptions::default()
    };
    let mut tileset = new_tileset(accessor, options);
    let result = tileset.update_view_offline(&[looking_along_x()]).clone();

    assert_eq!(result.tiles_to_render.len(), 1);
    let root = tileset.root_tile().unwrap();
    assert_eq!(result.tiles_to_render[0], root);
    assert_eq!(tileset.tile(root).load_state, LoadState::Done);
}

#[test]
fn fine_view_refines_to_children() {
    let accessor = Arc::new(MemoryAccessor::new());
    serve_quad_tileset(&accessor, "REPLACE");

    let options = TilesetOptions {
        maximum_screen_space_error: 16.0,
        ..TilesetOptions::default()
    };
    let mut tileset = new_tileset(accessor, options);
    let result = tileset.update_view_offline(&[looking_along_x()]).clone();

    // Replacive refinement: all four children, never the root alongside.
    assert_eq!(result.tiles_to_render.len(), 4);
    let root = tileset.root_tile().unwrap();
    assert!(!result.tiles_to_render.contains(&root));

    for &index in &result.tiles_to_render {
        let tile = tileset.tile(index);
        assert_eq!(tile.load_state, LoadState::Done, "renderability invariant");
        assert!(matches!(
            tile.content.as_ref().map(|c| &c.kind),
            Some(TileContent::Model(_))
        ));
    }
}

#[test]
fn update_view_is_idempotent_across_frames() {
    let accessor = Arc::new(MemoryAccessor::new());
    serve_quad_tileset(&accessor, "REPLACE");

    let mut tileset = new_tileset(accessor, TilesetOptions::default());
    let view = looking_along_x();
    let first: Vec<TileIndex> = tileset.update_view_offline(&[view.clone()]).tiles_to_render.clone();
    let second: Vec<TileIndex> = tileset.update_view(&[view]).tiles_to_render.clone();

    let mut a = first.clone();
    let mut b = second.clone();
    a.sort_by_key(|i| i.as_usize());
    b.sort_by_key(|i| i.as_usize());
    assert_eq!(a, b, "same frustum must select the same tiles");
}

#[test]
fn additive_refinement_renders_parent_with_children() {
    let accessor = Arc::new(MemoryAccessor::new());
    serve_quad_tileset(&accessor, "ADD");

    let options = TilesetOptions {
        maximum_screen_space_error: 16.0,
        ..TilesetOptions::default()
    };
    let mut tileset = new_tileset(accessor, options);
    let result = tileset.update_view_offline(&[looking_along_x()]).clone();

    let root = tileset.root_tile().unwrap();
    assert!(result.tiles_to_render.contains(&root), "additive parent renders");
    assert_eq!(result.tiles_to_render.len(), 5, "parent plus four children");
}

#[test]
fn camera_turn_reports_tiles_no_longer_rendered() {
    let accessor = Arc::new(MemoryAccessor::new());
    serve_quad_tileset(&accessor, "REPLACE");

    let mut tileset = new_tileset(accessor, TilesetOptions::default());
    let rendered = tileset.update_view_offline(&[looking_along_x()]).tiles_to_render.clone();
    assert!(!rendered.is_empty());

    let result = tileset.update_view_offline(&[looking_away_from_x()]).clone();
    assert!(result.tiles_to_render.is_empty());
    for index in rendered {
        assert!(
            result.tiles_no_longer_rendered.contains(&index),
            "{index} should be reported as no longer rendered"
        );
    }
}

#[test]
fn forbid_holes_blocks_refinement_until_children_load() {
    let accessor = Arc::new(MemoryAccessor::new());
    serve_quad_tileset(&accessor, "REPLACE");

    let options = TilesetOptions {
        maximum_screen_space_error: 16.0,
        forbid_holes: true,
        ..TilesetOptions::default()
    };
    let mut tileset = new_tileset(accessor.clone(), options);

    // The tileset.json fetch resolved at construction; park every tile
    // content request so the children cannot load.
    accessor.hold_requests();
    let result = tileset.update_view(&[looking_along_x()]).clone();

    // The parent renders instead of refining; every unloaded replacive
    // child is queued.
    let root = tileset.root_tile().unwrap();
    assert_eq!(result.tiles_to_render, vec![root]);
    assert!(result.tiles_loading_medium_priority >= 4);

    accessor.release_requests();
}

#[test]
fn kick_trigger_abandons_descendant_loads() {
    let accessor = Arc::new(MemoryAccessor::new());
    serve_quad_tileset(&accessor, "REPLACE");

    let options = TilesetOptions {
        maximum_screen_space_error: 16.0,
        loading_descendant_limit: 1,
        preload_ancestors: false,
        preload_siblings: false,
        ..TilesetOptions::default()
    };
    let mut tileset = new_tileset(accessor.clone(), options);

    // The tileset.json resolved at construction; park all content requests.
    accessor.hold_requests();
    let result = tileset.update_view(&[looking_along_x()]).clone();
    assert!(tileset.root_tile().is_some());

    // Four unrenderable descendants exceed the limit of 1: they are kicked
    // from the render list and their loads dropped for the ancestor's.
    let root = tileset.root_tile().unwrap();
    assert_eq!(result.tiles_to_render, vec![root]);
    assert_eq!(result.tiles_loading_medium_priority, 1);
    assert_eq!(result.tiles_loading_high_priority, 0);

    accessor.release_requests();
}

#[test]
fn concurrency_cap_limits_in_flight_loads() {
    let accessor = Arc::new(MemoryAccessor::new());
    serve_quad_tileset(&accessor, "REPLACE");

    let options = TilesetOptions {
        maximum_screen_space_error: 16.0,
        maximum_simultaneous_tile_loads: 2,
        ..TilesetOptions::default()
    };
    let mut tileset = new_tileset(accessor.clone(), options);
    accessor.hold_requests();

    for _ in 0..5 {
        tileset.update_view(&[looking_along_x()]);
        assert!(
            tileset.loads_in_progress() <= 2,
            "cap exceeded: {}",
            tileset.loads_in_progress()
        );
    }

    accessor.release_requests();
}

#[test]
fn lru_eviction_respects_byte_budget() {
    let accessor = Arc::new(MemoryAccessor::new());

    // Three 60-byte children under a tiny root payload.
    let children: Vec<serde_json::Value> = (0..3)
        .map(|i| {
            serde_json::json!({
                "boundingVolume": sphere_json(90.0 + 10.0 * f64::from(i), 8.0),
                "geometricError": 2.0,
                "content": { "uri": format!("tiles/child{i}.glb") },
            })
        })
        .collect();
    let tileset_json = serde_json::to_vec(&serde_json::json!({
        "asset": { "version": "1.1" },
        "geometricError": 64.0,
        "root": {
            "boundingVolume": sphere_json(100.0, 30.0),
            "geometricError": 32.0,
            "refine": "REPLACE",
            "children": children,
        }
    }))
    .unwrap();
    accessor.serve("tileset.json", 200, tileset_json);
    for i in 0..3 {
        accessor.serve(&format!("tiles/child{i}.glb"), 200, glb_bytes(60));
    }

    let options = TilesetOptions {
        maximum_screen_space_error: 16.0,
        maximum_cached_bytes: 100,
        ..TilesetOptions::default()
    };
    let mut tileset = new_tileset(accessor, options);

    let rendered = tileset.update_view_offline(&[looking_along_x()]).tiles_to_render.clone();
    assert_eq!(rendered.len(), 3);
    assert_eq!(tileset.total_data_bytes(), 180);

    // Look away: the children leave the render set, then the sweep evicts
    // down to the budget, oldest first.
    tileset.update_view_offline(&[looking_away_from_x()]);
    tileset.update_view(&[looking_away_from_x()]);

    assert!(
        tileset.total_data_bytes() <= 100,
        "budget exceeded: {}",
        tileset.total_data_bytes()
    );
    let unloaded = (0..3)
        .filter(|i| {
            let index = tile_by_url(&tileset, &format!("tiles/child{i}.glb")).unwrap();
            tileset.tile(index).load_state == LoadState::Unloaded
        })
        .count();
    assert_eq!(unloaded, 2, "exactly the two least-recently-visited unload");
}

#[test]
fn token_refresh_retries_auth_failed_tiles() {
    let accessor = Arc::new(MemoryAccessor::new());

    let endpoint = serde_json::to_vec(&serde_json::json!({
        "url": "scene/tileset.json",
        "accessToken": "token-one",
        "type": "3DTILES",
    }))
    .unwrap();
    let endpoint_refreshed = serde_json::to_vec(&serde_json::json!({
        "url": "scene/tileset.json",
        "accessToken": "token-two",
        "type": "3DTILES",
    }))
    .unwrap();
    accessor.serve("endpoint", 200, endpoint);
    accessor.serve("endpoint", 200, endpoint_refreshed);

    let tileset_json = serde_json::to_vec(&serde_json::json!({
        "asset": { "version": "1.1" },
        "geometricError": 64.0,
        "root": {
            "boundingVolume": sphere_json(100.0, 30.0),
            "geometricError": 1.0,
            "content": { "uri": "tile.glb" },
        }
    }))
    .unwrap();
    accessor.serve("scene/tileset.json", 200, tileset_json);

    // First fetch of the tile is rejected; after the refresh it succeeds.
    accessor.serve("scene/tile.glb", 401, Vec::new());
    accessor.serve("scene/tile.glb", 200, glb_bytes(16));

    let mut tileset = Tileset::from_asset_endpoint(
        accessor.clone(),
        Arc::new(NoopRendererResources),
        "endpoint",
        TilesetOptions::default(),
    );

    let result = tileset.update_view_offline(&[looking_along_x()]).clone();
    assert_eq!(result.tiles_to_render.len(), 1);
    let root = tileset.root_tile().unwrap();
    assert_eq!(tileset.tile(root).load_state, LoadState::Done);

    // Exactly one refresh: the endpoint was hit twice in total.
    assert_eq!(accessor.requests_for("endpoint").len(), 2);

    // The retried tile fetch carried the refreshed bearer token.
    let tile_requests = accessor.requests_for("scene/tile.glb");
    assert_eq!(tile_requests.len(), 2);
    let last_auth = tile_requests[1]
        .iter()
        .find(|(name, _)| name == "Authorization")
        .map(|(_, value)| value.clone());
    assert_eq!(last_auth.as_deref(), Some("Bearer token-two"));
}

#[test]
fn failed_token_refresh_fails_the_tile() {
    let accessor = Arc::new(MemoryAccessor::new());

    let endpoint = serde_json::to_vec(&serde_json::json!({
        "url": "scene/tileset.json",
        "accessToken": "token-one",
        "type": "3DTILES",
    }))
    .unwrap();
    accessor.serve("endpoint", 200, endpoint);
    accessor.serve("endpoint", 500, Vec::new());

    let tileset_json = serde_json::to_vec(&serde_json::json!({
        "asset": { "version": "1.1" },
        "geometricError": 64.0,
        "root": {
            "boundingVolume": sphere_json(100.0, 30.0),
            "geometricError": 1.0,
            "content": { "uri": "tile.glb" },
        }
    }))
    .unwrap();
    accessor.serve("scene/tileset.json", 200, tileset_json);
    accessor.serve("scene/tile.glb", 401, Vec::new());

    let mut tileset = Tileset::from_asset_endpoint(
        accessor.clone(),
        Arc::new(NoopRendererResources),
        "endpoint",
        TilesetOptions::default(),
    );

    for _ in 0..20 {
        tileset.update_view(&[looking_along_x()]);
        if tileset.is_idle() {
            break;
        }
    }
    tileset.drain();

    let root = tileset.root_tile().unwrap();
    assert_eq!(tileset.tile(root).load_state, LoadState::Failed);
}

#[test]
fn external_tileset_grafts_children() {
    let accessor = Arc::new(MemoryAccessor::new());

    let tileset_json = serde_json::to_vec(&serde_json::json!({
        "asset": { "version": "1.1" },
        "geometricError": 64.0,
        "root": {
            "boundingVolume": sphere_json(100.0, 30.0),
            "geometricError": 32.0,
            "refine": "REPLACE",
            "content": { "uri": "sub/external.json" },
        }
    }))
    .unwrap();
    let external_json = serde_json::to_vec(&serde_json::json!({
        "asset": { "version": "1.1" },
        "geometricError": 32.0,
        "root": {
            "boundingVolume": sphere_json(100.0, 30.0),
            "geometricError": 1.0,
            "content": { "uri": "leaf.glb" },
        }
    }))
    .unwrap();
    accessor.serve("tileset.json", 200, tileset_json);
    accessor.serve("sub/external.json", 200, external_json);
    accessor.serve("sub/leaf.glb", 200, glb_bytes(8));

    let mut tileset = new_tileset(accessor.clone(), TilesetOptions::default());
    let result = tileset.update_view_offline(&[looking_along_x()]).clone();

    // The external root's leaf renders; its URL resolved against the
    // external document's own directory.
    assert_eq!(result.tiles_to_render.len(), 1);
    let leaf = tile_by_url(&tileset, "leaf.glb").unwrap();
    assert_eq!(tileset.tile(leaf).load_state, LoadState::Done);
    assert_eq!(accessor.requests_for("sub/leaf.glb").len(), 1);
}

#[test]
fn implicit_quadtree_loads_subtree_then_content() {
    let accessor = Arc::new(MemoryAccessor::new());

    let tileset_json = serde_json::to_vec(&serde_json::json!({
        "asset": { "version": "1.1" },
        "geometricError": 64.0,
        "root": {
            "boundingVolume": { "box": [100.0, 0.0, 0.0,  30.0, 0.0, 0.0,  0.0, 30.0, 0.0,  0.0, 0.0, 30.0] },
            "geometricError": 32.0,
            "refine": "REPLACE",
            "content": { "uri": "content/{level}/{x}/{y}.glb" },
            "extensions": {
                "3DTILES_implicit_tiling": {
                    "subdivisionScheme": "QUADTREE",
                    "subtreeLevels": 2,
                    "maximumLevel": 2,
                    "subtrees": { "uri": "subtrees/{level}.{x}.{y}.subtree" }
                }
            }
        }
    }))
    .unwrap();
    accessor.serve("tileset.json", 200, tileset_json);

    // Every tile and content of the first block exists; no child subtrees.
    let subtree_json = r#"{"tileAvailability":{"constant":1},"contentAvailability":{"constant":1},"childSubtreeAvailability":{"constant":0}}"#;
    let mut subtree = Vec::new();
    subtree.extend_from_slice(b"subt");
    subtree.extend_from_slice(&1u32.to_le_bytes());
    subtree.extend_from_slice(&(subtree_json.len() as u64).to_le_bytes());
    subtree.extend_from_slice(&0u64.to_le_bytes());
    subtree.extend_from_slice(subtree_json.as_bytes());
    accessor.serve("subtrees/0.0.0.subtree", 200, subtree);
    accessor.serve("content/0/0/0.glb", 200, glb_bytes(24));

    // Coarse budget: the implicit root alone is enough detail.
    let options = TilesetOptions {
        maximum_screen_space_error: 100_000.0,
        preload_ancestors: false,
        preload_siblings: false,
        ..TilesetOptions::default()
    };
    let mut tileset = new_tileset(accessor.clone(), options);
    let result = tileset.update_view_offline(&[looking_along_x()]).clone();

    assert_eq!(accessor.requests_for("subtrees/0.0.0.subtree").len(), 1);
    assert_eq!(result.tiles_to_render.len(), 1);
    let rendered = tileset.tile(result.tiles_to_render[0]);
    assert!(matches!(
        rendered.content.as_ref().map(|c| &c.kind),
        Some(TileContent::Model(_))
    ));
    // The implicit root has materialized its four children.
    assert_eq!(rendered.children.map(|c| c.count), Some(4));
}
