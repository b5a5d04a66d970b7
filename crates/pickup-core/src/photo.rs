//! Registration photo thumbnails.

use image::ImageFormat;
use std::io::Cursor;
use thiserror::Error;

/// Default longest side of a stored guardian thumbnail.
pub const DEFAULT_PHOTO_MAX_SIDE: u32 = 160;

#[derive(Error, Debug)]
pub enum PhotoError {
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
}

/// Decode a still image and re-encode it as a PNG no larger than
/// `max_side` on either axis, preserving aspect ratio.
pub fn thumbnail_png(encoded: &[u8], max_side: u32) -> Result<Vec<u8>, PhotoError> {
    let img = image::load_from_memory(encoded)?;
    let thumb = if img.width() > max_side || img.height() > max_side {
        img.thumbnail(max_side, max_side)
    } else {
        img
    };

    let mut out = Cursor::new(Vec::new());
    thumb.write_to(&mut out, ImageFormat::Png)?;
    tracing::debug!(
        width = thumb.width(),
        height = thumb.height(),
        bytes = out.get_ref().len(),
        "encoded photo thumbnail"
    );
    Ok(out.into_inner())
}
