use std::io::Cursor;

use image::{DynamicImage, ImageFormat};

use crate::engine::Frame;
use crate::error::MuxError;

/// JPEG-encodes `frame`, scaled down to fit within `max_edge` pixels.
pub fn encode_thumbnail(frame: &Frame, max_edge: u32) -> Result<Vec<u8>, MuxError> {
    let image = DynamicImage::ImageRgb8(frame.clone());
    let (width, height) = frame.dimensions();
    let image = if max_edge > 0 && width.max(height) > max_edge {
        image.thumbnail(max_edge, max_edge)
    } else {
        image
    };

    let mut bytes = Cursor::new(Vec::new());
    image
        .write_to(&mut bytes, ImageFormat::Jpeg)
        .map_err(|e| MuxError::Thumbnail(e.to_string()))?;
    Ok(bytes.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thumbnail_is_downscaled_jpeg() {
        let frame = Frame::from_pixel(960, 540, image::Rgb([200, 10, 10]));
        let bytes = encode_thumbnail(&frame, 480).unwrap();
        assert_eq!(image::guess_format(&bytes).unwrap(), ImageFormat::Jpeg);
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.width(), 480);
        assert_eq!(decoded.height(), 270);
    }

    #[test]
    fn test_small_frame_keeps_size() {
        let frame = Frame::from_pixel(64, 32, image::Rgb([0, 0, 0]));
        let decoded = image::load_from_memory(&encode_thumbnail(&frame, 480).unwrap()).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 32));
    }
}
