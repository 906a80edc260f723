//! External tileset content: a tileset.json referenced as tile content. The
//! decoder validates and parses the document; grafting the external root
//! under the referencing tile happens on the main thread.

use crate::content::{ContentDecoder, ContentFactory, ContentInput};
use crate::error::{Result, TileStreamError};
use crate::types::TileContent;

#[derive(Debug, Default)]
pub struct ExternalTilesetDecoder;

impl ContentDecoder for ExternalTilesetDecoder {
    fn decode(&self, _factory: &ContentFactory, input: &ContentInput<'_>) -> Result<TileContent> {
        let document: serde_json::Value = serde_json::from_slice(input.data)
            .map_err(|e| TileStreamError::Format(format!("tileset JSON {}: {e}", input.url)))?;

        if !document.is_object() {
            return Err(TileStreamError::Format(format!(
                "tileset JSON {} is not an object",
                input.url
            )));
        }

        Ok(TileContent::ExternalTileset(document))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContentOptions;

    fn decode(data: &[u8]) -> Result<TileContent> {
        let factory = ContentFactory::new();
        let options = ContentOptions::default();
        ExternalTilesetDecoder.decode(
            &factory,
            &ContentInput {
                url: "external/tileset.json",
                content_type: "application/json",
                data,
                options: &options,
            },
        )
    }

    #[test]
    fn parses_tileset_document() {
        let data = br#"{"asset": {"version": "1.0"}, "geometricError": 10, "root": {}}"#;
        match decode(data).unwrap() {
            TileContent::ExternalTileset(doc) => {
                assert_eq!(doc["asset"]["version"], "1.0");
            }
            other => panic!("expected external tileset, got {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            decode(b"{not json"),
            Err(TileStreamError::Format(_))
        ));
    }

    #[test]
    fn rejects_non_object_document() {
        assert!(decode(b"[1, 2, 3]").is_err());
    }
}
