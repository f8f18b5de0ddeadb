use std::path::{Path, PathBuf};

use crate::derivative::cache::DerivativeCache;
use crate::derivative::STANDARD_HEIGHTS;
use crate::error::{Error, Result};
use crate::metadata::image::read_orientation;

const JPEG_QUALITY: u8 = 80;

/// Produce a JPEG derivative of `source` fitting within
/// `height × height`, without upscaling, honoring EXIF orientation.
/// Passing `None` converts at full size (format change only).
///
/// Decode failures surface as [`Error::InvalidImage`].
pub fn convert_image(source: &Path, height: Option<u32>, out: &Path) -> Result<PathBuf> {
    let img = image::open(source)
        .map_err(|e| Error::InvalidImage(format!("cannot decode {}: {e}", source.display())))?;
    let img = upright(img, read_orientation(source));

    let resized = match height {
        Some(h) if img.width() > h || img.height() > h => img.thumbnail(h, h),
        _ => img,
    };

    if let Some(parent) = out.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // Write through a unique temp name so readers never observe a
    // half-written artifact and concurrent producers (the all-sizes batch
    // and a blocking single-size job) never share a scratch file.
    static TMP_COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
    let tmp = out.with_extension(format!(
        "tmp{}",
        TMP_COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    ));
    {
        let file = std::fs::File::create(&tmp)?;
        let mut writer = std::io::BufWriter::new(file);
        let encoder =
            image::codecs::jpeg::JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY);
        // JPEG has no alpha; flatten unconditionally.
        resized
            .to_rgb8()
            .write_with_encoder(encoder)
            .map_err(|e| Error::InvalidImage(format!("cannot encode {}: {e}", out.display())))?;
    }
    std::fs::rename(&tmp, out)?;
    tracing::debug!("image variant written: {:?}", out);
    Ok(out.to_path_buf())
}

/// Batch conversion to every standard size (smallest first so thumbnails
/// appear early). Existing artifacts are skipped; the first failure
/// aborts the batch since later sizes would fail the same way.
pub fn convert_all_sizes(source: &Path, cache: &DerivativeCache, hash: &str) -> Result<PathBuf> {
    let mut last = PathBuf::new();
    for height in STANDARD_HEIGHTS {
        let out = cache.image_path(hash, &height.to_string());
        if out.is_file() {
            last = out;
            continue;
        }
        last = convert_image(source, Some(height), &out)?;
    }
    Ok(last)
}

/// Rotate a decoded image upright. Every EXIF orientation tag decomposes
/// into clockwise quarter-turns plus an optional horizontal flip; the
/// rotation is applied, the flip component (tags 2/4/5/7, rare in
/// practice) is logged and skipped.
fn upright(img: image::DynamicImage, orientation: Option<u16>) -> image::DynamicImage {
    let tag = orientation.unwrap_or(1);
    let (quarter_turns, flipped) = match tag {
        2 => (0, true),
        3 => (2, false),
        4 => (2, true),
        5 => (1, true),
        6 => (1, false),
        7 => (3, true),
        8 => (3, false),
        _ => (0, false),
    };
    if flipped {
        tracing::debug!("ignoring flip component of orientation {}", tag);
    }
    match quarter_turns {
        1 => img.rotate90(),
        2 => img.rotate180(),
        3 => img.rotate270(),
        _ => img,
    }
}
