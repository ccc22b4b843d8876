//! Wire framing for image records arriving on the bus.
//!
//! A frame is a 4-byte big-endian header length `L`, then `L` bytes of UTF-8
//! JSON metadata, then the encoded image (PNG/JPEG) filling the rest of the
//! payload. Decoding is pure and has no network or accelerator dependency.

use bytes::{BufMut, Bytes, BytesMut};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Size of the big-endian length prefix
pub const HEADER_PREFIX_LEN: usize = 4;

/// Placeholder used for metadata keys the producer did not send
pub const UNKNOWN_LABEL: &str = "unknown";

/// Reasons a payload is rejected as a frame
#[derive(Error, Debug)]
pub enum MalformedFrame {
    #[error("Frame too short: {len} bytes, need at least {HEADER_PREFIX_LEN}")]
    TooShort { len: usize },

    #[error("Header length {declared} exceeds remaining payload of {available} bytes")]
    HeaderOverrun { declared: usize, available: usize },

    #[error("Metadata is not a valid JSON object: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("Image bytes could not be decoded: {0}")]
    Image(#[from] image::ImageError),
}

/// Producer-supplied metadata attached to every frame.
///
/// Only `color_label` and `shape_label` carry meaning for the pipeline; any
/// other keys are preserved untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(Map<String, Value>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a string value, replacing any previous one
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), Value::String(value.into()));
        self
    }

    /// Look up a key as text, falling back to `"unknown"`
    pub fn label(&self, key: &str) -> String {
        match self.0.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => UNKNOWN_LABEL.to_string(),
            Some(other) => other.to_string(),
        }
    }

    pub fn color_label(&self) -> String {
        self.label("color_label")
    }

    pub fn shape_label(&self) -> String {
        self.label("shape_label")
    }

    /// Ground truth in the form `<color_label>_<shape_label>`
    pub fn ground_truth(&self) -> String {
        format!("{}_{}", self.color_label(), self.shape_label())
    }
}

/// A frame that passed every wire check
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub metadata: Metadata,
    /// The metadata JSON exactly as it appeared on the wire
    pub header: Bytes,
    /// The encoded image exactly as it appeared on the wire
    pub image_bytes: Bytes,
    /// The image decoded to 8-bit RGB
    pub image: RgbImage,
}

/// Decode a raw bus payload into metadata and image.
pub fn decode(raw: &[u8]) -> Result<DecodedFrame, MalformedFrame> {
    if raw.len() < HEADER_PREFIX_LEN {
        return Err(MalformedFrame::TooShort { len: raw.len() });
    }

    let (prefix, rest) = raw.split_at(HEADER_PREFIX_LEN);
    let declared = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    if declared > rest.len() {
        return Err(MalformedFrame::HeaderOverrun {
            declared,
            available: rest.len(),
        });
    }

    let (header, image_slice) = rest.split_at(declared);
    let metadata: Metadata = serde_json::from_slice(header)?;
    let image = image::load_from_memory(image_slice)?.to_rgb8();

    Ok(DecodedFrame {
        metadata,
        header: Bytes::copy_from_slice(header),
        image_bytes: Bytes::copy_from_slice(image_slice),
        image,
    })
}

impl DecodedFrame {
    /// Re-frame the original header and image bytes.
    ///
    /// Identical to the payload this frame was decoded from, whatever key
    /// order or whitespace the producer used.
    pub fn to_payload(&self) -> Result<Vec<u8>, MalformedFrame> {
        frame_parts(&self.header, &self.image_bytes)
    }
}

/// Encode metadata and an already-encoded image into a wire payload.
///
/// The header is written as compact JSON with keys in sorted order.
pub fn encode(metadata: &Metadata, image_bytes: &[u8]) -> Result<Vec<u8>, MalformedFrame> {
    let header = serde_json::to_vec(metadata)?;
    frame_parts(&header, image_bytes)
}

fn frame_parts(header: &[u8], image_bytes: &[u8]) -> Result<Vec<u8>, MalformedFrame> {
    let declared = u32::try_from(header.len()).map_err(|_| MalformedFrame::HeaderOverrun {
        declared: header.len(),
        available: u32::MAX as usize,
    })?;

    let mut buf = BytesMut::with_capacity(HEADER_PREFIX_LEN + header.len() + image_bytes.len());
    buf.put_u32(declared);
    buf.put_slice(header);
    buf.put_slice(image_bytes);
    Ok(buf.to_vec())
}
