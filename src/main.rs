use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use glam::{DVec2, DVec3};
use tracing_subscriber::EnvFilter;

use tilestream::config::CliArgs;
use tilestream::loader::NoopRendererResources;
use tilestream::{FilesystemAccessor, Tileset, ViewState};

fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    // Init tracing
    let filter = if args.verbose {
        EnvFilter::new("tilestream=debug")
    } else {
        EnvFilter::new("tilestream=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let tileset_path = if args.tileset.is_dir() {
        args.tileset.join("tileset.json")
    } else {
        args.tileset.clone()
    };
    let root_dir = tileset_path
        .parent()
        .context("tileset path has no parent directory")?
        .to_path_buf();
    let file_name = tileset_path
        .file_name()
        .and_then(|name| name.to_str())
        .context("tileset path has no file name")?
        .to_owned();

    let accessor = Arc::new(FilesystemAccessor::new(root_dir));
    let mut tileset = Tileset::new(
        accessor,
        Arc::new(NoopRendererResources),
        &file_name,
        args.tileset_options(),
    );

    let camera = DVec3::from_array(args.camera);
    let target = DVec3::from_array(args.look_at);
    let direction = target - camera;
    let up = if direction.normalize_or_zero().dot(DVec3::Z).abs() > 0.99 {
        DVec3::Y
    } else {
        DVec3::Z
    };
    let view = ViewState::create(
        camera,
        direction,
        up,
        DVec2::new(1920.0, 1080.0),
        60_f64.to_radians(),
        34_f64.to_radians(),
    );

    for frame in 0..args.frames {
        let result = tileset.update_view_offline(&[view.clone()]).clone();
        let total_data_bytes = tileset.total_data_bytes();
        println!(
            "frame {:>3}: rendered {:>4}  visited {:>5}  culled {:>5}  max depth {:>2}  cached {:>10} B",
            frame,
            result.tiles_to_render.len(),
            result.tiles_visited,
            result.tiles_culled,
            result.max_depth_visited,
            total_data_bytes,
        );
    }

    let result = tileset.update_view_offline(&[view]).clone();
    let total_data_bytes = tileset.total_data_bytes();
    println!(
        "final: {} tiles rendered, {} bytes cached",
        result.tiles_to_render.len(),
        total_data_bytes
    );

    Ok(())
}
