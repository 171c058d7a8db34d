//! Transport encoding for images: base64 strings in JSON on one side, decoded
//! RGB rasters on the other.

use std::io::Cursor;

use base64::{prelude::BASE64_STANDARD, Engine};
use image::{DynamicImage, ImageFormat};

use crate::error::InvalidImageEncoding;

/// Decode a base64 PNG/JPEG (optionally wrapped in a `data:` URI) into an RGB8 image.
pub fn decode(b64: &str) -> Result<DynamicImage, InvalidImageEncoding> {
    let payload = strip_data_uri(b64.trim());
    let compact: String = payload
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    let bytes = BASE64_STANDARD.decode(compact.as_bytes())?;
    let img = image::load_from_memory(&bytes)?;
    Ok(DynamicImage::ImageRgb8(img.to_rgb8()))
}

/// Serialize an image as PNG and base64-encode it.
pub fn encode(img: &DynamicImage) -> Result<String, image::ImageError> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(BASE64_STANDARD.encode(&bytes))
}

fn strip_data_uri(s: &str) -> &str {
    if !s.starts_with("data:") {
        return s;
    }
    match s.split_once(";base64,") {
        Some((_, data)) => data,
        None => s,
    }
}
