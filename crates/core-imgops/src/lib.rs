//! Pure image operations: decode+resize, perceptual hashing with bit-shift
//! quantization, square rotations, and the pixelwise mean-squared diff.
//!
//! Everything here works on raw interleaved RGB byte buffers so the hot
//! comparison path never touches the decoder. All buffers produced by
//! [`decode_and_resize`] share one fixed square shape per run, which is what
//! lets the diff kernel and the rotation search stay allocation-light.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Bytes per pixel of the interleaved RGB buffers.
pub const CHANNELS: usize = 3;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("failed to encode {path}: {source}")]
    Encode {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("unexpected shape for {path}: expected {expected_w}x{expected_h}, got {got_w}x{got_h}")]
    Shape {
        path: PathBuf,
        expected_w: u32,
        expected_h: u32,
        got_w: u32,
        got_h: u32,
    },
    #[error("pixel buffer length mismatch: {left} vs {right}")]
    BufferMismatch { left: usize, right: usize },
}

/// Decode an image and resize it to the target shape.
///
/// Returns the resized RGB buffer together with the original dimensions
/// (needed for the aspect-ratio short-circuit).
pub fn decode_and_resize(
    path: &Path,
    target: (u32, u32),
) -> Result<(Vec<u8>, (u32, u32)), DecodeError> {
    use image::GenericImageView;

    let img = image::open(path).map_err(|source| DecodeError::Decode {
        path: path.to_path_buf(),
        source,
    })?;
    let original = img.dimensions();
    let resized = img
        .resize_exact(target.0, target.1, image::imageops::FilterType::Triangle)
        .to_rgb8()
        .into_raw();
    Ok((resized, original))
}

/// Decode an already-resized thumbnail, rejecting any shape drift.
pub fn load_thumbnail(path: &Path, target: (u32, u32)) -> Result<Vec<u8>, DecodeError> {
    use image::GenericImageView;

    let img = image::open(path).map_err(|source| DecodeError::Decode {
        path: path.to_path_buf(),
        source,
    })?;
    let (w, h) = img.dimensions();
    if (w, h) != target {
        return Err(DecodeError::Shape {
            path: path.to_path_buf(),
            expected_w: target.0,
            expected_h: target.1,
            got_w: w,
            got_h: h,
        });
    }
    Ok(img.to_rgb8().into_raw())
}

/// Write an RGB buffer as a PNG thumbnail.
pub fn store_thumbnail(
    pixels: &[u8],
    target: (u32, u32),
    path: &Path,
) -> Result<(), DecodeError> {
    image::save_buffer(
        path,
        pixels,
        target.0,
        target.1,
        image::ExtendedColorType::Rgb8,
    )
    .map_err(|source| DecodeError::Encode {
        path: path.to_path_buf(),
        source,
    })
}

/// Quantize each channel byte by the configured shift.
///
/// Positive shifts discard low bits so near-identical images collide;
/// shift 0 preserves exact pixel identity; negative shifts amplify small
/// differences by shifting left (wrapping).
fn quantize(pixels: &[u8], shift: i32) -> Vec<u8> {
    match shift {
        0 => pixels.to_vec(),
        s if s > 0 => pixels.iter().map(|v| v >> s as u32).collect(),
        s => pixels.iter().map(|v| v.wrapping_shl(-s as u32)).collect(),
    }
}

/// Digest of the quantized buffer, stable across processes and runs.
pub fn perceptual_hash(pixels: &[u8], shift: i32) -> String {
    blake3::hash(&quantize(pixels, shift)).to_hex().to_string()
}

/// Rotate a square RGB buffer 90 degrees clockwise.
pub fn rotate90(pixels: &[u8], edge: u32) -> Vec<u8> {
    let e = edge as usize;
    debug_assert_eq!(pixels.len(), e * e * CHANNELS);
    let mut out = vec![0u8; pixels.len()];
    for y in 0..e {
        for x in 0..e {
            let src = (y * e + x) * CHANNELS;
            let dst = (x * e + (e - 1 - y)) * CHANNELS;
            out[dst..dst + CHANNELS].copy_from_slice(&pixels[src..src + CHANNELS]);
        }
    }
    out
}

/// Hashes of the buffer at 0/90/180/270 degrees, derived from three
/// successive rotations of the decoded square buffer (never re-decoded).
pub fn rotated_hashes(pixels: &[u8], edge: u32, shift: i32) -> [String; 4] {
    let h0 = perceptual_hash(pixels, shift);
    let r90 = rotate90(pixels, edge);
    let h90 = perceptual_hash(&r90, shift);
    let r180 = rotate90(&r90, edge);
    let h180 = perceptual_hash(&r180, shift);
    let r270 = rotate90(&r180, edge);
    let h270 = perceptual_hash(&r270, shift);
    [h0, h90, h180, h270]
}

fn mse(a: &[u8], b: &[u8]) -> f32 {
    let sum: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let d = x as f64 - y as f64;
            d * d
        })
        .sum();
    (sum / a.len() as f64) as f32
}

/// Mean squared difference between two equally-shaped square RGB buffers.
///
/// With `rotate` set, returns the minimum over the four rotations of `b`.
pub fn diff(a: &[u8], b: &[u8], edge: u32, rotate: bool) -> Result<f32, DecodeError> {
    if a.len() != b.len() {
        return Err(DecodeError::BufferMismatch {
            left: a.len(),
            right: b.len(),
        });
    }
    if !rotate {
        return Ok(mse(a, b));
    }
    let mut best = mse(a, b);
    let mut rotated = rotate90(b, edge);
    best = best.min(mse(a, &rotated));
    rotated = rotate90(&rotated, edge);
    best = best.min(mse(a, &rotated));
    rotated = rotate90(&rotated, edge);
    best = best.min(mse(a, &rotated));
    Ok(best)
}

/// Orientation-insensitive aspect ratio: longer side over shorter side.
///
/// All pixel comparisons happen on square thumbnails, so 2:1 and 1:2
/// originals are the same shape as far as the diff is concerned.
pub fn aspect(px: i64, py: i64) -> f32 {
    let (long, short) = if px >= py { (px, py) } else { (py, px) };
    if short <= 0 {
        return 0.0;
    }
    long as f32 / short as f32
}
