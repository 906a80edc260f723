use std::path::PathBuf;

use clap::Parser;

/// Fog density sampled at a given camera height.
///
/// The table is kept sorted by `camera_height`; the density at the current
/// camera height is linearly interpolated between the surrounding samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FogDensityAtHeight {
    pub camera_height: f64,
    pub fog_density: f64,
}

/// GPU transcode target for a compressed texture format (opaque to the core;
/// handed through to decoders).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GpuCompressedPixelFormat {
    #[default]
    None,
    Etc2Rgba,
    Bc7Rgba,
    AstcRgba4x4,
}

/// Per-source-format transcode targets for KTX2 content.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ktx2TranscodeTargets {
    pub etc1s: GpuCompressedPixelFormat,
    pub uastc: GpuCompressedPixelFormat,
}

/// Options handed through to content decoders.
#[derive(Debug, Clone, Default)]
pub struct ContentOptions {
    pub enable_water_mask: bool,
    pub ktx2_transcode_targets: Ktx2TranscodeTargets,
}

/// Tuning knobs for tile selection and streaming.
#[derive(Debug, Clone)]
pub struct TilesetOptions {
    /// Maximum screen-space error, in pixels, before a tile refines.
    pub maximum_screen_space_error: f64,
    /// Cap on simultaneously in-flight tile content loads.
    pub maximum_simultaneous_tile_loads: u32,
    /// Cap on simultaneously in-flight availability-subtree loads.
    pub maximum_simultaneous_subtree_loads: u32,
    /// Byte budget; the eviction sweep unloads down to this.
    pub maximum_cached_bytes: i64,
    /// When more descendants than this are still loading, abandon their loads
    /// and render the ancestor instead.
    pub loading_descendant_limit: u32,
    pub preload_ancestors: bool,
    pub preload_siblings: bool,
    /// Refuse to refine until every replacive child is renderable.
    pub forbid_holes: bool,
    pub enable_frustum_culling: bool,
    pub enable_fog_culling: bool,
    /// Apply `culled_screen_space_error` to culled-but-visited tiles.
    pub enforce_culled_screen_space_error: bool,
    pub culled_screen_space_error: f64,
    /// Consider tiles directly below the camera visible even when the frustum
    /// misses them (keeps the ground under the camera loaded).
    pub render_tiles_under_camera: bool,
    /// Sorted `(camera_height, fog_density)` samples.
    pub fog_density_table: Vec<FogDensityAtHeight>,
    /// Attribution text surfaced with every frame that renders tiles.
    pub credit: Option<String>,
    pub content_options: ContentOptions,
}

impl Default for TilesetOptions {
    fn default() -> Self {
        Self {
            maximum_screen_space_error: 16.0,
            maximum_simultaneous_tile_loads: 20,
            maximum_simultaneous_subtree_loads: 20,
            maximum_cached_bytes: 512 * 1024 * 1024,
            loading_descendant_limit: 20,
            preload_ancestors: true,
            preload_siblings: true,
            forbid_holes: false,
            enable_frustum_culling: true,
            enable_fog_culling: true,
            enforce_culled_screen_space_error: true,
            culled_screen_space_error: 64.0,
            render_tiles_under_camera: true,
            fog_density_table: default_fog_density_table(),
            credit: None,
            content_options: ContentOptions::default(),
        }
    }
}

/// Default fog curve: dense near the ground, vanishing above ~1000 km.
fn default_fog_density_table() -> Vec<FogDensityAtHeight> {
    [
        (359.393, 2.0e-5),
        (829.518, 2.0e-4),
        (1_593.217, 1.0e-4),
        (2_461.894, 7.0e-5),
        (4_249.605, 5.0e-5),
        (9_128.166, 3.0e-5),
        (12_667.465, 1.9e-5),
        (29_103.244, 1.0e-5),
        (61_014.3, 4.3e-6),
        (96_890.813, 3.0e-6),
        (154_457.059, 1.8e-6),
        (286_497.188, 1.0e-6),
        (601_346.688, 4.0e-7),
        (1_211_717.25, 1.0e-7),
        (2_423_434.5, 4.0e-8),
        (4_846_869.0, 0.0),
    ]
    .iter()
    .map(|&(camera_height, fog_density)| FogDensityAtHeight {
        camera_height,
        fog_density,
    })
    .collect()
}

/// Interpolate the fog density for a camera at the given height.
///
/// Clamps to the first/last table entry outside the covered range. An empty
/// table disables fog (density 0).
pub fn interpolate_fog_density(table: &[FogDensityAtHeight], height: f64) -> f64 {
    if table.is_empty() {
        return 0.0;
    }

    let next = table.partition_point(|entry| entry.camera_height < height);
    if next == table.len() {
        return table[table.len() - 1].fog_density;
    }
    if next == 0 {
        return table[0].fog_density;
    }

    let prev = &table[next - 1];
    let next = &table[next];
    let t = ((height - prev.camera_height) / (next.camera_height - prev.camera_height))
        .clamp(0.0, 1.0);
    prev.fog_density + (next.fog_density - prev.fog_density) * t
}

/// CLI argument definition (clap derive) for the diagnostic binary.
#[derive(Parser, Debug)]
#[command(
    name = "tilestream",
    about = "Stream a 3D Tiles dataset and report per-frame selection statistics",
    version
)]
pub struct CliArgs {
    /// Path to a tileset.json (or a directory containing one)
    #[arg(short = 't', long)]
    pub tileset: PathBuf,

    /// Number of frames to simulate
    #[arg(long, default_value_t = 10)]
    pub frames: u32,

    /// Screen-space error budget in pixels
    #[arg(long, default_value_t = 16.0)]
    pub sse: f64,

    /// Camera position as "x,y,z"
    #[arg(long, default_value = "0,-500,300", value_parser = parse_vec3)]
    pub camera: [f64; 3],

    /// Camera look-at target as "x,y,z"
    #[arg(long, default_value = "0,0,0", value_parser = parse_vec3)]
    pub look_at: [f64; 3],

    /// Eviction threshold in bytes
    #[arg(long, default_value_t = 512 * 1024 * 1024)]
    pub max_cached_bytes: i64,

    /// Enable verbose logging
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

fn parse_vec3(s: &str) -> std::result::Result<[f64; 3], String> {
    let parts: Vec<&str> = s.split(',').collect();
    if parts.len() != 3 {
        return Err(format!("expected \"x,y,z\", got \"{s}\""));
    }
    let mut out = [0.0; 3];
    for (slot, part) in out.iter_mut().zip(&parts) {
        *slot = part
            .trim()
            .parse::<f64>()
            .map_err(|e| format!("bad component \"{part}\": {e}"))?;
    }
    Ok(out)
}

impl CliArgs {
    /// Build `TilesetOptions` from the parsed arguments.
    pub fn tileset_options(&self) -> TilesetOptions {
        TilesetOptions {
            maximum_screen_space_error: self.sse,
            maximum_cached_bytes: self.max_cached_bytes,
            ..TilesetOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options() {
        let opts = TilesetOptions::default();
        assert_eq!(opts.maximum_screen_space_error, 16.0);
        assert_eq!(opts.maximum_simultaneous_tile_loads, 20);
        assert_eq!(opts.maximum_cached_bytes, 512 * 1024 * 1024);
        assert_eq!(opts.loading_descendant_limit, 20);
        assert!(opts.enable_frustum_culling);
        assert!(opts.enable_fog_culling);
        assert!(!opts.forbid_holes);
        assert!(!opts.fog_density_table.is_empty());
    }

    #[test]
    fn fog_table_is_sorted() {
        let table = default_fog_density_table();
        for pair in table.windows(2) {
            assert!(pair[0].camera_height < pair[1].camera_height);
        }
    }

    #[test]
    fn fog_interpolation_clamps_below_and_above() {
        let table = default_fog_density_table();
        assert_eq!(interpolate_fog_density(&table, 0.0), table[0].fog_density);
        assert_eq!(
            interpolate_fog_density(&table, 1.0e9),
            table[table.len() - 1].fog_density
        );
    }

    #[test]
    fn fog_interpolation_midpoint() {
        let table = vec![
            FogDensityAtHeight {
                camera_height: 0.0,
                fog_density: 1.0,
            },
            FogDensityAtHeight {
                camera_height: 100.0,
                fog_density: 3.0,
            },
        ];
        assert!((interpolate_fog_density(&table, 50.0) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn fog_interpolation_empty_table() {
        assert_eq!(interpolate_fog_density(&[], 123.0), 0.0);
    }

    #[test]
    fn cli_args_to_options() {
        let args = CliArgs::parse_from([
            "tilestream",
            "-t",
            "scene/tileset.json",
            "--frames",
            "3",
            "--sse",
            "8",
            "--camera",
            "1,2,3",
            "--max-cached-bytes",
            "100",
            "-v",
        ]);

        assert_eq!(args.tileset, PathBuf::from("scene/tileset.json"));
        assert_eq!(args.frames, 3);
        assert_eq!(args.camera, [1.0, 2.0, 3.0]);
        assert!(args.verbose);

        let opts = args.tileset_options();
        assert_eq!(opts.maximum_screen_space_error, 8.0);
        assert_eq!(opts.maximum_cached_bytes, 100);
    }

    #[test]
    fn cli_args_rejects_bad_camera() {
        assert!(parse_vec3("1,2").is_err());
        assert!(parse_vec3("a,b,c").is_err());
        assert!(parse_vec3("1, 2, 3").is_ok());
    }
}
