//! Value encodings applied between caller values and stored blocks.

use std::{
    fmt::{
        self,
        Debug,
        Formatter,
    },
    sync::Arc,
};

use crate::{
    Error,
    Result,
};

/// A user-supplied value codec.
///
/// `encode` runs on every appended value before it is hashed and stored;
/// `decode` runs on every block returned by a read. Both sides see the exact
/// stored bytes, so any framing the codec adds must be reversed by it.
pub trait Codec: Send + Sync {
    /// Encodes a caller value into the block bytes to store.
    fn encode(&self, value: &[u8]) -> Result<Vec<u8>>;

    /// Decodes stored block bytes back into a caller value.
    fn decode(&self, block: &[u8]) -> Result<Vec<u8>>;
}

/// The value encoding active on a feed.
///
/// Selected by name at feed creation; `binary` stores values untouched,
/// `utf-8` enforces valid UTF-8, and `json` normalizes every value to a
/// single compact JSON document terminated by a newline so that the raw data
/// file is line-parseable.
#[derive(Clone, Default)]
pub enum ValueEncoding {
    #[default]
    Binary,
    Utf8,
    Json,
    Custom(Arc<dyn Codec>),
}

impl ValueEncoding {
    /// Resolves a codec name. Recognized names are `binary`, `utf-8` (also
    /// `utf8`), and `json`.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "binary" => Some(Self::Binary),
            "utf-8" | "utf8" => Some(Self::Utf8),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    pub(crate) fn encode(&self, value: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Binary => Ok(value.to_vec()),
            Self::Utf8 => {
                std::str::from_utf8(value).map_err(|e| Error::Codec(Box::new(e)))?;
                Ok(value.to_vec())
            }
            Self::Json => {
                let value: serde_json::Value =
                    serde_json::from_slice(value).map_err(|e| Error::Codec(Box::new(e)))?;
                let mut block =
                    serde_json::to_vec(&value).map_err(|e| Error::Codec(Box::new(e)))?;
                block.push(b'\n');
                Ok(block)
            }
            Self::Custom(codec) => codec.encode(value),
        }
    }

    pub(crate) fn decode(&self, block: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Binary => Ok(block.to_vec()),
            Self::Utf8 => {
                std::str::from_utf8(block).map_err(|e| Error::Codec(Box::new(e)))?;
                Ok(block.to_vec())
            }
            Self::Json => {
                let block = block.strip_suffix(b"\n").unwrap_or(block);
                serde_json::from_slice::<serde_json::Value>(block)
                    .map_err(|e| Error::Codec(Box::new(e)))?;
                Ok(block.to_vec())
            }
            Self::Custom(codec) => codec.decode(block),
        }
    }
}

impl Debug for ValueEncoding {
    fn fmt(&self, formatter: &mut Formatter) -> fmt::Result {
        let name = match self {
            Self::Binary => "binary",
            Self::Utf8 => "utf-8",
            Self::Json => "json",
            Self::Custom(..) => "custom",
        };
        formatter.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::ValueEncoding;

    #[test]
    fn json_blocks_are_newline_terminated() {
        let codec = ValueEncoding::Json;
        let block = codec.encode(br#"{"a": 1}"#).expect("value is valid json");
        assert!(block.ends_with(b"\n"));
        assert!(!block[..block.len() - 1].contains(&b'\n'));
        let value = codec.decode(&block).expect("block is valid json");
        assert_eq!(br#"{"a":1}"#.to_vec(), value);
    }

    #[test]
    fn json_rejects_invalid_documents() {
        assert!(ValueEncoding::Json.encode(b"{not json").is_err());
    }

    #[test]
    fn utf8_rejects_invalid_sequences() {
        assert!(ValueEncoding::Utf8.encode(&[0xff, 0xfe]).is_err());
        assert!(ValueEncoding::Utf8.encode("snø".as_bytes()).is_ok());
    }

    #[test]
    fn binary_is_identity() {
        let codec = ValueEncoding::Binary;
        let input = [0_u8, 1, 2, 0xff];
        assert_eq!(input.to_vec(), codec.encode(&input).expect("binary never fails"));
        assert_eq!(input.to_vec(), codec.decode(&input).expect("binary never fails"));
    }
}
