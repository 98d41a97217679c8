//! Image encoding: normalized `DynamicImage` → PNG bytes for the engines.
//!
//! PNG is lossless, so the binarized strokes the normalizer produced reach
//! the recognizer exactly as computed. JPEG ringing around glyph edges costs
//! Tesseract measurable accuracy on small print.

use crate::error::DocStructError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode an image as PNG.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, DocStructError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .map_err(|e| DocStructError::NormalizationFailure(format!("PNG encoding failed: {e}")))?;
    debug!("Encoded {}x{} image → {} bytes PNG", img.width(), img.height(), buf.len());
    Ok(buf)
}

/// Base64 body for JSON request payloads.
pub fn to_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, GrayImage};

    #[test]
    fn encode_small_image() {
        let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(10, 10, Luma([255])));
        let png = encode_png(&img).expect("encode should succeed");
        assert_eq!(&png[..4], b"\x89PNG");
        let back = image::load_from_memory(&png).unwrap();
        assert_eq!((back.width(), back.height()), (10, 10));
    }

    #[test]
    fn base64_round_trip() {
        let b64 = to_base64(b"abc");
        assert_eq!(b64, "YWJj");
        assert_eq!(STANDARD.decode(b64).unwrap(), b"abc");
    }
}
