use std::io::Cursor;
use std::path::Path;

use image::imageops::FilterType;
use image::{ImageFormat, RgbImage};

use super::error::IndexError;

/// Side length images are resized to before embedding.
pub const IMAGE_SIDE: u32 = 224;

/// Decode image bytes into a square RGB bitmap ready for embedding.
pub fn decode_image(path: &Path, bytes: &[u8]) -> Result<RgbImage, IndexError> {
    let decoded = image::load_from_memory(bytes).map_err(|e| IndexError::ImageDecode {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(decoded
        .resize_exact(IMAGE_SIDE, IMAGE_SIDE, FilterType::Triangle)
        .to_rgb8())
}

/// PNG encoding of a bitmap, used for transport to the embedding endpoint.
pub fn encode_png(image: &RgbImage) -> anyhow::Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, ImageFormat::Png)?;
    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| image::Rgb([x as u8, y as u8, 128]));
        encode_png(&img).unwrap()
    }

    #[test]
    fn test_decode_resizes_to_square() {
        let img = decode_image(Path::new("a.png"), &png_bytes(40, 10)).unwrap();
        assert_eq!(img.dimensions(), (IMAGE_SIDE, IMAGE_SIDE));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = decode_image(Path::new("a.png"), b"definitely not an image").unwrap_err();
        assert!(matches!(err, IndexError::ImageDecode { .. }));
    }
}
