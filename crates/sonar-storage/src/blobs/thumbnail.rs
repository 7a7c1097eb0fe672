//! Image downscaling for the thumbnails-only body policy

use std::io::Cursor;

use image::ImageFormat;

use crate::error::StoreError;

/// Result of thumbnailing an image body
pub(crate) struct Thumbnail {
    /// Re-encoded PNG, or `None` when the image already fits
    pub data: Option<Vec<u8>>,
    /// Dimensions of the original image
    pub width: u32,
    pub height: u32,
}

/// Decode `data` and downscale it to fit within `max_dimension`
pub(crate) fn make_thumbnail(data: &[u8], max_dimension: u32) -> Result<Thumbnail, StoreError> {
    let image = image::load_from_memory(data)
        .map_err(|e| StoreError::blob(format!("undecodable image: {e}")))?;
    let (width, height) = (image.width(), image.height());
    if width <= max_dimension && height <= max_dimension {
        return Ok(Thumbnail {
            data: None,
            width,
            height,
        });
    }

    let thumbnail = image.thumbnail(max_dimension, max_dimension);
    let mut encoded = Vec::new();
    thumbnail
        .write_to(&mut Cursor::new(&mut encoded), ImageFormat::Png)
        .map_err(|e| StoreError::blob(format!("thumbnail encoding failed: {e}")))?;

    Ok(Thumbnail {
        data: Some(encoded),
        width,
        height,
    })
}

/// Pixel size of an encoded image without decoding the pixels
pub(crate) fn image_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    image::ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

#[cfg(test)]
pub(crate) mod tests {
    use image::{ImageBuffer, Rgb};

    use super::*;

    /// PNG with per-pixel noise so it does not compress away
    pub(crate) fn noisy_png(width: u32, height: u32) -> Vec<u8> {
        let image = ImageBuffer::from_fn(width, height, |x, y| {
            let v = (x.wrapping_mul(7919) ^ y.wrapping_mul(104_729)) as u8;
            Rgb([v, v.wrapping_mul(3), v.wrapping_add(x as u8)])
        });
        let mut out = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn test_large_image_is_downscaled() {
        let png = noisy_png(600, 300);
        let thumbnail = make_thumbnail(&png, 256).unwrap();
        assert_eq!((thumbnail.width, thumbnail.height), (600, 300));

        let data = thumbnail.data.unwrap();
        let decoded = image::load_from_memory(&data).unwrap();
        assert_eq!(decoded.width(), 256);
        assert!(decoded.height() <= 256);
    }

    #[test]
    fn test_small_image_is_kept() {
        let png = noisy_png(32, 32);
        let thumbnail = make_thumbnail(&png, 256).unwrap();
        assert!(thumbnail.data.is_none());
        assert_eq!(thumbnail.width, 32);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(make_thumbnail(b"definitely not an image", 256).is_err());
    }

    #[test]
    fn test_image_dimensions() {
        assert_eq!(image_dimensions(&noisy_png(40, 20)), Some((40, 20)));
        assert_eq!(image_dimensions(b"nope"), None);
    }
}
