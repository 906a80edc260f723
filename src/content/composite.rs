//! Composite (`cmpt`) tiles: a container of embedded tiles, each re-dispatched
//! through the content factory and merged into a single model.

use tracing::warn;

use crate::content::{ContentDecoder, ContentFactory, ContentInput};
use crate::error::{Result, TileStreamError};
use crate::types::TileContent;

const OUTER_HEADER_LEN: usize = 16;
const INNER_HEADER_LEN: usize = 12;

/// Decoder for `cmpt` containers.
///
/// Layout: 16-byte header `{magic 'cmpt', version 1, byteLength, tilesLength}`
/// followed by `tilesLength` inner tiles, each with its own 12-byte
/// `{magic, version, byteLength}` header. Inner models are merged by
/// appending; when inputs disagree on up-axis the first input wins.
#[derive(Debug, Default)]
pub struct CompositeDecoder;

impl ContentDecoder for CompositeDecoder {
    fn decode(&self, factory: &ContentFactory, input: &ContentInput<'_>) -> Result<TileContent> {
        let data = input.data;
        let url = input.url;

        if data.len() < OUTER_HEADER_LEN {
            return Err(TileStreamError::Format(format!(
                "composite tile {url} must be at least 16 bytes"
            )));
        }
        if &data[0..4] != b"cmpt" {
            return Err(TileStreamError::Format(format!(
                "composite tile {url} does not have the expected magic 'cmpt'"
            )));
        }
        let version = u32::from_le_bytes(data[4..8].try_into().unwrap());
        if version != 1 {
            return Err(TileStreamError::Format(format!(
                "unsupported composite tile version {version} in {url}"
            )));
        }
        let byte_length = u32::from_le_bytes(data[8..12].try_into().unwrap()) as usize;
        if byte_length > data.len() {
            return Err(TileStreamError::Format(format!(
                "composite tile {url} declares {byte_length} bytes but only {} are present",
                data.len()
            )));
        }
        let tiles_length = u32::from_le_bytes(data[12..16].try_into().unwrap());

        let mut merged: Option<TileContent> = None;
        let mut pos = OUTER_HEADER_LEN;

        for _ in 0..tiles_length {
            if pos >= byte_length {
                break;
            }
            if pos + INNER_HEADER_LEN > byte_length {
                warn!(url, "Composite tile ends before all embedded tiles could be read");
                break;
            }
            let inner_length =
                u32::from_le_bytes(data[pos + 8..pos + 12].try_into().unwrap()) as usize;
            if inner_length < INNER_HEADER_LEN || pos + inner_length > byte_length {
                warn!(url, "Composite tile ends before all embedded tiles could be read");
                break;
            }

            let inner = &data[pos..pos + inner_length];
            pos += inner_length;

            match factory.decode(&input.derive(inner)) {
                Ok(TileContent::Model(model)) => match &mut merged {
                    None => merged = Some(TileContent::Model(model)),
                    Some(TileContent::Model(base)) => base.merge(model),
                    Some(_) => {}
                },
                Ok(other) => {
                    warn!(
                        url,
                        "Ignoring non-model content of type {other:?} embedded in composite"
                    );
                }
                Err(e) => {
                    warn!(url, error = %e, "Failed to decode a tile embedded in composite");
                }
            }
        }

        merged.ok_or_else(|| {
            TileStreamError::Format(format!(
                "composite tile {url} does not contain any loadable inner tiles"
            ))
        })
    }
}
