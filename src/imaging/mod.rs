//! Image decode, resize and re-encode
//!
//! All pixel work runs on the blocking pool. Output is lossy WebP at the
//! requested quality. Alpha survives when the source has it.

use bytes::Bytes;
use image::imageops::FilterType;
use image::DynamicImage;

use crate::error::{Error, Result};

/// Content type of every encoded image this crate produces
pub const OUTPUT_CONTENT_TYPE: &str = "image/webp";

/// Default served width
pub const DEFAULT_WIDTH: u32 = 640;

/// Default served quality
pub const DEFAULT_QUALITY: u8 = 75;

/// Largest width a caller may request
pub const MAX_WIDTH: u32 = 4096;

/// Resize + re-encode parameters for one served variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformParams {
    pub width: u32,
    pub quality: u8,
}

impl Default for TransformParams {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            quality: DEFAULT_QUALITY,
        }
    }
}

impl TransformParams {
    /// Validate caller-supplied parameters
    pub fn new(width: u32, quality: u8) -> Result<Self> {
        if width == 0 || width > MAX_WIDTH {
            return Err(Error::InvalidRequest(format!(
                "width must be between 1 and {}, got {}",
                MAX_WIDTH, width
            )));
        }
        validate_quality(quality)?;
        Ok(Self { width, quality })
    }
}

/// Reject encoder qualities outside 1..=100
pub fn validate_quality(quality: u8) -> Result<()> {
    if quality == 0 || quality > 100 {
        return Err(Error::InvalidRequest(format!(
            "quality must be between 1 and 100, got {}",
            quality
        )));
    }
    Ok(())
}

/// Decode arbitrary supported input and re-encode it canonically, keeping
/// its dimensions. Used by ingest.
pub async fn normalize(data: Bytes, quality: u8) -> Result<Bytes> {
    if data.is_empty() {
        return Err(Error::ImageDecode("empty input".to_string()));
    }
    tokio::task::spawn_blocking(move || {
        let img = decode(&data)?;
        encode_webp(&img, quality).map_err(Error::ImageDecode)
    })
    .await?
}

/// Resize to `params.width` (aspect preserved) and re-encode
pub async fn transform(image_id: &str, data: Bytes, params: TransformParams) -> Result<Bytes> {
    let id = image_id.to_string();
    tokio::task::spawn_blocking(move || {
        let fail = |reason: String| Error::Transform {
            image_id: id.clone(),
            reason,
        };
        let img = decode(&data).map_err(|e| fail(e.to_string()))?;
        let resized = resize_to_width(&img, params.width);
        encode_webp(&resized, params.quality).map_err(fail)
    })
    .await?
}

fn decode(data: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(data).map_err(|e| Error::ImageDecode(e.to_string()))
}

/// Scale to an exact width, deriving the height from the source aspect ratio
fn resize_to_width(img: &DynamicImage, width: u32) -> DynamicImage {
    if img.width() == width {
        return img.clone();
    }
    let height = (img.height() as u64 * width as u64 + img.width() as u64 / 2) / img.width() as u64;
    let height = height.clamp(1, u32::MAX as u64) as u32;
    img.resize_exact(width, height, FilterType::Lanczos3)
}

fn encode_webp(img: &DynamicImage, quality: u8) -> std::result::Result<Bytes, String> {
    let (width, height) = (img.width(), img.height());
    let encoded = if img.color().has_alpha() {
        let rgba = img.to_rgba8();
        webp::Encoder::from_rgba(&rgba, width, height).encode_simple(false, quality as f32)
    } else {
        let rgb = img.to_rgb8();
        webp::Encoder::from_rgb(&rgb, width, height).encode_simple(false, quality as f32)
    }
    .map_err(|e| format!("webp encode failed: {:?}", e))?;
    Ok(Bytes::copy_from_slice(&encoded))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use image::{ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
    use std::io::Cursor;

    fn png(width: u32, height: u32) -> Bytes {
        let img = RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x % 256) as u8, (y % 256) as u8, 128, 200])
        });
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        Bytes::from(out.into_inner())
    }

    #[tokio::test]
    async fn test_normalize_keeps_dimensions_and_outputs_webp() {
        let out = normalize(png(80, 120), 75).await.unwrap();
        assert_eq!(&out[..4], b"RIFF");
        assert_eq!(&out[8..12], b"WEBP");
        assert_eq!(image::guess_format(&out).unwrap(), ImageFormat::WebP);

        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (80, 120));
        assert!(decoded.color().has_alpha());
    }

    #[tokio::test]
    async fn test_opaque_input_encodes_without_alpha() {
        let img = RgbImage::from_fn(64, 32, |x, _| Rgb([(x * 4) as u8, 40, 90]));
        let mut src = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut src, ImageFormat::Png)
            .unwrap();

        let params = TransformParams::new(32, 75).unwrap();
        let out = transform("opaque", Bytes::from(src.into_inner()), params)
            .await
            .unwrap();
        assert_eq!(image::guess_format(&out).unwrap(), ImageFormat::WebP);

        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 16));
        assert!(!decoded.color().has_alpha());
    }

    #[tokio::test]
    async fn test_lower_quality_is_smaller() {
        let source = png(256, 256);
        let params_hi = TransformParams::new(256, 95).unwrap();
        let params_lo = TransformParams::new(256, 10).unwrap();
        let hi = transform("img", source.clone(), params_hi).await.unwrap();
        let lo = transform("img", source, params_lo).await.unwrap();
        assert!(lo.len() < hi.len());
    }

    #[tokio::test]
    async fn test_normalize_rejects_garbage_and_empty() {
        assert_matches!(
            normalize(Bytes::from_static(b"not an image"), 75).await,
            Err(Error::ImageDecode(_))
        );
        assert_matches!(normalize(Bytes::new(), 75).await, Err(Error::ImageDecode(_)));
    }

    #[tokio::test]
    async fn test_transform_preserves_aspect_ratio() {
        let params = TransformParams::new(400, 80).unwrap();
        let out = transform("img", png(800, 1200), params).await.unwrap();

        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (400, 600));
    }

    #[tokio::test]
    async fn test_transform_is_deterministic() {
        let params = TransformParams::new(50, 60).unwrap();
        let source = png(100, 100);
        let first = transform("img", source.clone(), params).await.unwrap();
        let second = transform("img", source, params).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_transform_failure_names_image() {
        let err = transform(
            "broken",
            Bytes::from_static(b"\x89PNG truncated"),
            TransformParams::default(),
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::Transform { ref image_id, .. } if image_id == "broken");
    }

    #[test]
    fn test_params_validation() {
        assert!(TransformParams::new(1, 1).is_ok());
        assert!(TransformParams::new(MAX_WIDTH, 100).is_ok());
        assert_matches!(TransformParams::new(0, 75), Err(Error::InvalidRequest(_)));
        assert_matches!(TransformParams::new(MAX_WIDTH + 1, 75), Err(Error::InvalidRequest(_)));
        assert_matches!(TransformParams::new(640, 0), Err(Error::InvalidRequest(_)));
        assert_matches!(TransformParams::new(640, 101), Err(Error::InvalidRequest(_)));
        assert_eq!(TransformParams::default().width, 640);
        assert_eq!(TransformParams::default().quality, 75);
    }
}
