//! Image decoding into the pipeline's RGB buffer.
//!
//! Accepts raw image bytes (PNG, JPEG, BMP, WebP) and produces an
//! [`RgbImageData`]. Alpha is dropped; grayscale inputs are expanded to
//! three equal channels.

use crate::types::{PipelineError, RgbImageData};

/// Decode raw image bytes into 8-bit RGB.
///
/// # Errors
///
/// Returns [`PipelineError::EmptyInput`] if `bytes` is empty.
/// Returns [`PipelineError::ImageDecode`] if the image format is
/// unrecognized or the data is corrupt.
#[must_use = "returns the decoded image"]
pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImageData, PipelineError> {
    if bytes.is_empty() {
        return Err(PipelineError::EmptyInput);
    }

    let img = image::load_from_memory(bytes)?;
    Ok(RgbImageData::from(img.to_rgb8()))
}
