//! Two-stage backup compression: lossy image preprocessing (resize +
//! JPEG re-encode) when the key looks like an image, always followed by
//! zstd. CPU-heavy work is dispatched to a blocking thread pool so it
//! never stalls the async runtime.

use std::io::Cursor;

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};

use crate::error::{Result, S3GcError};

const IMAGE_EXTENSIONS: &[&str] = &[
    ".jpg", ".jpeg", ".png", ".gif", ".webp", ".bmp", ".tiff", ".tif",
];

/// The codec a backup blob was written with. Stored as a one-byte header
/// so a decompressor reading the blob years later never has to guess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Codec {
    Zstd = 0x01,
}

impl Codec {
    fn from_byte(b: u8) -> Result<Self> {
        match b {
            0x01 => Ok(Codec::Zstd),
            other => Err(S3GcError::Backup(format!("unknown backup codec byte {other:#x}"))),
        }
    }
}

pub fn is_image_key(s3_key: &str) -> bool {
    let lower = s3_key.to_lowercase();
    IMAGE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Compresses `raw_bytes` for backup storage. Image keys are
/// resized/re-encoded to JPEG first (lossy — see [`crate::restore`] module
/// docs); any other key, or an image that fails to decode, is passed
/// through as-is into the zstd stage. The returned buffer is prefixed with
/// a one-byte codec tag.
pub async fn compress_for_backup(
    s3_key: &str,
    raw_bytes: bytes::Bytes,
    zstd_level: i32,
    preprocess_images: bool,
    max_image_dim: u32,
    jpeg_quality: u8,
) -> Result<Vec<u8>> {
    let key = s3_key.to_string();
    tokio::task::spawn_blocking(move || {
        let processed = if preprocess_images && is_image_key(&key) {
            match preprocess_image_sync(&raw_bytes, max_image_dim, jpeg_quality) {
                Ok(jpeg) => jpeg,
                Err(err) => {
                    tracing::warn!(s3_key = %key, error = %err, "image preprocessing failed, falling back to raw bytes");
                    raw_bytes.to_vec()
                }
            }
        } else {
            raw_bytes.to_vec()
        };

        let compressed = zstd::stream::encode_all(Cursor::new(&processed), zstd_level)
            .map_err(|e| S3GcError::Backup(format!("zstd compression failed for {key}: {e}")))?;

        let mut out = Vec::with_capacity(compressed.len() + 1);
        out.push(Codec::Zstd as u8);
        out.extend_from_slice(&compressed);
        Ok(out)
    })
    .await
    .map_err(|e| S3GcError::Backup(format!("compression task panicked: {e}")))?
}

/// Reverses [`compress_for_backup`]. Note this returns the *preprocessed*
/// image bytes for image keys, not the original upload — preprocessing is
/// lossy and the original bytes are gone the moment the backup is written.
pub async fn decompress_backup(blob: Vec<u8>) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || {
        let (tag, body) = blob
            .split_first()
            .ok_or_else(|| S3GcError::Backup("empty backup blob".to_string()))?;
        match Codec::from_byte(*tag)? {
            Codec::Zstd => zstd::stream::decode_all(Cursor::new(body))
                .map_err(|e| S3GcError::Backup(format!("zstd decompression failed: {e}"))),
        }
    })
    .await
    .map_err(|e| S3GcError::Backup(format!("decompression task panicked: {e}")))?
}

fn preprocess_image_sync(raw_bytes: &[u8], max_dim: u32, jpeg_quality: u8) -> Result<Vec<u8>> {
    let img = image::load_from_memory(raw_bytes)
        .map_err(|e| S3GcError::Backup(format!("image decode failed: {e}")))?;

    let (width, height) = (img.width(), img.height());
    let img = if width.max(height) > max_dim {
        img.resize(max_dim, max_dim, FilterType::Lanczos3)
    } else {
        img
    };

    // Flatten any transparency onto white before JPEG re-encoding, mirroring
    // the composite-on-white behavior used for RGBA/palette/luminance-alpha
    // sources.
    let rgb: DynamicImage = match img {
        DynamicImage::ImageRgb8(_) => img,
        other => {
            let rgba = other.to_rgba8();
            let mut background = image::RgbImage::from_pixel(
                rgba.width(),
                rgba.height(),
                image::Rgb([255, 255, 255]),
            );
            for (x, y, pixel) in rgba.enumerate_pixels() {
                let alpha = pixel[3] as f32 / 255.0;
                let blend = |channel: u8, bg: u8| -> u8 {
                    ((channel as f32 * alpha) + (bg as f32 * (1.0 - alpha))) as u8
                };
                background.put_pixel(
                    x,
                    y,
                    image::Rgb([
                        blend(pixel[0], 255),
                        blend(pixel[1], 255),
                        blend(pixel[2], 255),
                    ]),
                );
            }
            DynamicImage::ImageRgb8(background)
        }
    };

    let mut out = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, jpeg_quality);
    encoder
        .encode_image(&rgb)
        .map_err(|e| S3GcError::Backup(format!("jpeg encode failed: {e}")))?;
    let _ = ImageFormat::Jpeg;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_png() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(4, 4, image::Rgb([10, 20, 30]));
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn is_image_key_matches_known_extensions() {
        assert!(is_image_key("avatars/user.JPG"));
        assert!(is_image_key("a/b/c.png"));
        assert!(!is_image_key("docs/readme.md"));
    }

    #[tokio::test]
    async fn round_trips_non_image_bytes_through_zstd() {
        let raw = bytes::Bytes::from_static(b"hello world, this is not an image");
        let compressed = compress_for_backup("notes.txt", raw.clone(), 19, true, 1024, 60)
            .await
            .unwrap();
        assert_eq!(compressed[0], Codec::Zstd as u8);

        let restored = decompress_backup(compressed).await.unwrap();
        assert_eq!(restored, raw.to_vec());
    }

    #[tokio::test]
    async fn preprocesses_image_before_zstd() {
        let png = tiny_png();
        let compressed = compress_for_backup(
            "avatars/a.png",
            bytes::Bytes::from(png.clone()),
            19,
            true,
            1024,
            60,
        )
        .await
        .unwrap();

        let restored = decompress_backup(compressed).await.unwrap();
        // Re-encoded as JPEG, so bytes differ from the source PNG, but the
        // result must still decode as a valid image.
        assert_ne!(restored, png);
        assert!(image::load_from_memory(&restored).is_ok());
    }

    #[tokio::test]
    async fn falls_back_to_raw_bytes_when_image_decode_fails() {
        let garbage = bytes::Bytes::from_static(b"not actually a jpeg");
        let compressed = compress_for_backup("broken.jpg", garbage.clone(), 19, true, 1024, 60)
            .await
            .unwrap();
        let restored = decompress_backup(compressed).await.unwrap();
        assert_eq!(restored, garbage.to_vec());
    }
}
