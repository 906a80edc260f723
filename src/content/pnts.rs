//! Point cloud (`pnts`) tiles, decoded into a glTF model with a single
//! `POINTS` primitive.

use gltf_json::accessor::{ComponentType, GenericComponentType, Type as AccessorType};
use gltf_json::mesh::{Mode, Primitive, Semantic};
use gltf_json::validation::{Checked, USize64};
use gltf_json::Root;
use serde::Deserialize;

use crate::content::glb::GltfModel;
use crate::content::{ContentDecoder, ContentFactory, ContentInput};
use crate::error::{Result, TileStreamError};
use crate::types::TileContent;

const HEADER_LEN: usize = 28;

#[derive(Debug, Deserialize)]
struct FeatureTableHeader {
    #[serde(rename = "POINTS_LENGTH")]
    points_length: u32,
    #[serde(rename = "POSITION")]
    position: Option<BinaryBodyReference>,
    #[serde(rename = "POSITION_QUANTIZED")]
    position_quantized: Option<BinaryBodyReference>,
}

#[derive(Debug, Deserialize)]
struct BinaryBodyReference {
    #[serde(rename = "byteOffset")]
    byte_offset: u64,
}

/// Decoder for Point Cloud (`pnts`) tiles.
///
/// Reads `POINTS_LENGTH` and `POSITION` from the feature table and
/// synthesizes a one-primitive glTF. Quantized positions and per-point
/// attributes beyond position are not carried over.
#[derive(Debug, Default)]
pub struct PointCloudDecoder;

impl ContentDecoder for PointCloudDecoder {
    fn decode(&self, _factory: &ContentFactory, input: &ContentInput<'_>) -> Result<TileContent> {
        let data = input.data;
        let url = input.url;

        if data.len() < HEADER_LEN {
            return Err(TileStreamError::Format(format!(
                "pnts tile {url} is shorter than its 28-byte header"
            )));
        }
        if &data[0..4] != b"pnts" {
            return Err(TileStreamError::Format(format!(
                "pnts tile {url} has the wrong magic"
            )));
        }
        let version = u32::from_le_bytes(data[4..8].try_into().unwrap());
        if version != 1 {
            return Err(TileStreamError::Format(format!(
                "unsupported pnts version {version} in {url}"
            )));
        }
        let byte_length = u32::from_le_bytes(data[8..12].try_into().unwrap()) as usize;
        let ft_json_length = u32::from_le_bytes(data[12..16].try_into().unwrap()) as usize;
        let ft_bin_length = u32::from_le_bytes(data[16..20].try_into().unwrap()) as usize;

        if byte_length > data.len() || HEADER_LEN + ft_json_length + ft_bin_length > byte_length {
            return Err(TileStreamError::Format(format!(
                "pnts tile {url} has inconsistent section lengths"
            )));
        }

        let ft_json_bytes = &data[HEADER_LEN..HEADER_LEN + ft_json_length];
        let feature_table: FeatureTableHeader = serde_json::from_slice(ft_json_bytes)
            .map_err(|e| TileStreamError::Format(format!("pnts feature table in {url}: {e}")))?;

        if feature_table.position_quantized.is_some() {
            return Err(TileStreamError::Format(format!(
                "pnts tile {url} uses quantized positions, which are not supported"
            )));
        }
        let position = feature_table.position.ok_or_else(|| {
            TileStreamError::Format(format!("pnts tile {url} has no POSITION attribute"))
        })?;

        let count = feature_table.points_length as usize;
        let positions_bytes = count * 12;
        let body_start = HEADER_LEN + ft_json_length;
        let positions_start = body_start + position.byte_offset as usize;
        if positions_start + positions_bytes > body_start + ft_bin_length {
            return Err(TileStreamError::Semantic(format!(
                "pnts tile {url} declares {count} points but its binary body is too short"
            )));
        }

        let bin = data[positions_start..positions_start + positions_bytes].to_vec();

        // min/max are required on POSITION accessors.
        let mut min = [f32::INFINITY; 3];
        let mut max = [f32::NEG_INFINITY; 3];
        for point in bin.chunks_exact(12) {
            for axis in 0..3 {
                let v = f32::from_le_bytes(point[axis * 4..axis * 4 + 4].try_into().unwrap());
                min[axis] = min[axis].min(v);
                max[axis] = max[axis].max(v);
            }
        }
        if count == 0 {
            min = [0.0; 3];
            max = [0.0; 3];
        }

        let mut root = Root {
            asset: gltf_json::Asset {
                version: "2.0".into(),
                ..Default::default()
            },
            ..Default::default()
        };

        let buffer = root.push(gltf_json::Buffer {
            byte_length: USize64::from(bin.len()),
            uri: None,
            name: None,
            extensions: Default::default(),
            extras: Default::default(),
        });
        let view = root.push(gltf_json::buffer::View {
            buffer,
            byte_length: USize64::from(bin.len()),
            byte_offset: Some(USize64(0)),
            byte_stride: None,
            name: None,
            target: None,
            extensions: Default::default(),
            extras: Default::default(),
        });
        let accessor = root.push(gltf_json::Accessor {
            buffer_view: Some(view),
            byte_offset: Some(USize64(0)),
            count: USize64::from(count),
            component_type: Checked::Valid(GenericComponentType(ComponentType::F32)),
            type_: Checked::Valid(AccessorType::Vec3),
            min: Some(serde_json::json!(min)),
            max: Some(serde_json::json!(max)),
            name: None,
            normalized: false,
            sparse: None,
            extensions: Default::default(),
            extras: Default::default(),
        });

        let mut attributes = std::collections::BTreeMap::new();
        attributes.insert(Checked::Valid(Semantic::Positions), accessor);
        let mesh = root.push(gltf_json::Mesh {
            primitives: vec![Primitive {
                attributes,
                indices: None,
                material: None,
                mode: Checked::Valid(Mode::Points),
                targets: None,
                extensions: Default::default(),
                extras: Default::default(),
            }],
            weights: None,
            name: None,
            extensions: Default::default(),
            extras: Default::default(),
        });
        let node = root.push(gltf_json::Node {
            mesh: Some(mesh),
            ..Default::default()
        });
        let scene = root.push(gltf_json::Scene {
            nodes: vec![node],
            name: None,
            extensions: Default::default(),
            extras: Default::default(),
        });
        root.scene = Some(scene);

        Ok(TileContent::Model(GltfModel {
            root,
            bin: Some(bin),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContentOptions;

    fn build_pnts(points: &[[f32; 3]]) -> Vec<u8> {
        let mut ft_json = format!(
            r#"{{"POINTS_LENGTH":{},"POSITION":{{"byteOffset":0}}}}"#,
            points.len()
        )
        .into_bytes();
        while ft_json.len() % 8 != 0 {
            ft_json.push(b' ');
        }

        let mut ft_bin = Vec::new();
        for point in points {
            for component in point {
                ft_bin.extend_from_slice(&component.to_le_bytes());
            }
        }

        let byte_length = HEADER_LEN + ft_json.len() + ft_bin.len();
        let mut out = Vec::with_capacity(byte_length);
        out.extend_from_slice(b"pnts");
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&(byte_length as u32).to_le_bytes());
        out.extend_from_slice(&(ft_json.len() as u32).to_le_bytes());
        out.extend_from_slice(&(ft_bin.len() as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&ft_json);
        out.extend_from_slice(&ft_bin);
        out
    }

    fn decode(data: &[u8]) -> Result<TileContent> {
        let factory = ContentFactory::new();
        let options = ContentOptions::default();
        PointCloudDecoder.decode(
            &factory,
            &ContentInput {
                url: "cloud.pnts",
                content_type: "",
                data,
                options: &options,
            },
        )
    }

    #[test]
    fn decodes_points_into_points_primitive() {
        let pnts = build_pnts(&[[0.0, 0.0, 0.0], [1.0, 2.0, 3.0], [-1.0, 0.5, 4.0]]);
        match decode(&pnts).unwrap() {
            TileContent::Model(model) => {
                assert_eq!(model.primitive_count(), 1);
                assert_eq!(
                    model.root.meshes[0].primitives[0].mode,
                    Checked::Valid(Mode::Points)
                );
                assert_eq!(model.root.accessors[0].count.0, 3);
                assert_eq!(model.bin.as_ref().unwrap().len(), 36);
            }
            other => panic!("expected model, got {other:?}"),
        }
    }

    #[test]
    fn accessor_bounds_cover_all_points() {
        let pnts = build_pnts(&[[5.0, -2.0, 0.0], [1.0, 7.0, -3.0]]);
        match decode(&pnts).unwrap() {
            TileContent::Model(model) => {
                let accessor = &model.root.accessors[0];
                assert_eq!(accessor.min, Some(serde_json::json!([1.0, -2.0, -3.0])));
                assert_eq!(accessor.max, Some(serde_json::json!([5.0, 7.0, 0.0])));
            }
            other => panic!("expected model, got {other:?}"),
        }
    }

    #[test]
    fn point_count_inconsistent_with_body_is_semantic_error() {
        // A feature table claiming 99 points over a 12-byte binary body.
        let json = br#"{"POINTS_LENGTH":99,"POSITION":{"byteOffset":0}}"#;
        let mut out = Vec::new();
        out.extend_from_slice(b"pnts");
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // patched below
        out.extend_from_slice(&(json.len() as u32).to_le_bytes());
        out.extend_from_slice(&12u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(json);
        out.extend_from_slice(&[0u8; 12]);
        let total = out.len() as u32;
        out[8..12].copy_from_slice(&total.to_le_bytes());

        assert!(matches!(decode(&out), Err(TileStreamError::Semantic(_))));
    }

    #[test]
    fn quantized_positions_are_unsupported() {
        let json =
            br#"{"POINTS_LENGTH":1,"POSITION_QUANTIZED":{"byteOffset":0},"QUANTIZED_VOLUME_SCALE":[1,1,1],"QUANTIZED_VOLUME_OFFSET":[0,0,0]}"#;
        let mut out = Vec::new();
        out.extend_from_slice(b"pnts");
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // patched below
        out.extend_from_slice(&(json.len() as u32).to_le_bytes());
        out.extend_from_slice(&6u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(json);
        out.extend_from_slice(&[0u8; 6]);
        let total = out.len() as u32;
        out[8..12].copy_from_slice(&total.to_le_bytes());

        assert!(matches!(decode(&out), Err(TileStreamError::Format(_))));
    }

    #[test]
    fn missing_position_is_an_error() {
        let json = br#"{"POINTS_LENGTH":0}"#;
        let mut out = Vec::new();
        out.extend_from_slice(b"pnts");
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(json.len() as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(json);
        let total = out.len() as u32;
        out[8..12].copy_from_slice(&total.to_le_bytes());

        assert!(decode(&out).is_err());
    }
}
