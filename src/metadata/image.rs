use std::io::Read;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::index::record::{Dimensions, GeoPoint, MediaMetadata};
use crate::metadata::format;

/// How much of a file the XMP scan reads. Embedded XMP packets sit in the
/// APP1 area near the start of the file.
const XMP_SCAN_LIMIT: usize = 512 * 1024;

/// Extract EXIF/XMP-derived metadata from an image file.
///
/// Never panics and never fails the caller: on any error the failure is
/// logged and `None` comes back, so the indexer can still write a record
/// with baseline stat fields.
pub fn extract_image_metadata(path: &Path) -> Option<MediaMetadata> {
    match std::panic::catch_unwind(|| extract_inner(path)) {
        Ok(meta) => meta,
        Err(_) => {
            tracing::warn!("panic in extract_image_metadata for {:?}", path);
            None
        }
    }
}

fn extract_inner(path: &Path) -> Option<MediaMetadata> {
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) => {
            tracing::debug!("cannot open {:?}: {}", path, e);
            return None;
        }
    };

    let mut meta = MediaMetadata::default();

    let mut buf_reader = std::io::BufReader::new(file);
    match exif::Reader::new().read_from_container(&mut buf_reader) {
        Ok(exif) => populate_from_exif(&mut meta, &exif),
        Err(e) => {
            tracing::debug!("no EXIF in {:?}: {}", path, e);
        }
    }

    // EXIF had no usable pixel dimensions: decode the image header only.
    if meta.dimensions.is_none() {
        match image::image_dimensions(path) {
            Ok((width, height)) => meta.dimensions = Some(Dimensions { width, height }),
            Err(e) => tracing::debug!("cannot read dimensions of {:?}: {}", path, e),
        }
    }

    if let Some(xmp) = scan_xmp(path) {
        if meta.rating.is_none() {
            meta.rating = xmp.rating;
        }
        if meta.tags.is_empty() {
            meta.set_tags(xmp.subjects);
        }
    }

    Some(meta)
}

fn populate_from_exif(meta: &mut MediaMetadata, exif: &exif::Exif) {
    meta.date_taken = read_datetime(exif, exif::Tag::DateTimeOriginal)
        .or_else(|| read_datetime(exif, exif::Tag::DateTimeDigitized));
    meta.camera_make = read_ascii(exif, exif::Tag::Make);
    meta.camera_model = read_ascii(exif, exif::Tag::Model);
    meta.lens = read_ascii(exif, exif::Tag::LensModel);
    meta.exposure_time =
        read_number(exif, exif::Tag::ExposureTime).map(format::format_exposure);
    meta.aperture = read_number(exif, exif::Tag::FNumber).map(format::format_aperture);
    meta.iso = read_number(exif, exif::Tag::PhotographicSensitivity).map(|v| v as u32);
    meta.focal_length =
        read_number(exif, exif::Tag::FocalLength).map(format::format_focal_length);

    let width = read_number(exif, exif::Tag::PixelXDimension);
    let height = read_number(exif, exif::Tag::PixelYDimension);
    if let (Some(w), Some(h)) = (width, height) {
        if w > 0.0 && h > 0.0 {
            meta.dimensions = Some(Dimensions {
                width: w as u32,
                height: h as u32,
            });
        }
    }

    meta.location = read_gps(exif);
}

/// Read the EXIF Orientation tag (1–8) for a file, for derivative
/// generation. `None` when absent or unreadable.
pub fn read_orientation(path: &Path) -> Option<u16> {
    let file = std::fs::File::open(path).ok()?;
    let mut buf_reader = std::io::BufReader::new(file);
    let exif = exif::Reader::new().read_from_container(&mut buf_reader).ok()?;
    let field = exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)?;
    match &field.value {
        exif::Value::Short(v) => v.first().copied(),
        _ => None,
    }
}

fn read_datetime(exif: &exif::Exif, tag: exif::Tag) -> Option<chrono::DateTime<chrono::Utc>> {
    let s = read_ascii(exif, tag)?;
    parse_exif_datetime(&s)
}

/// EXIF timestamps use colon-separated dates (`"YYYY:MM:DD HH:MM:SS"`)
/// and carry no zone; they are taken as UTC. Trailing subsecond or
/// garbage bytes after the 19-character core are ignored.
pub fn parse_exif_datetime(s: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    let s = s.trim();
    let core = s.get(..19).unwrap_or(s);
    chrono::NaiveDateTime::parse_from_str(core, "%Y:%m:%d %H:%M:%S")
        .ok()
        .map(|ndt| ndt.and_utc())
}

fn read_ascii(exif: &exif::Exif, tag: exif::Tag) -> Option<String> {
    let field = exif.get_field(tag, exif::In::PRIMARY)?;
    match &field.value {
        exif::Value::Ascii(vecs) => {
            let s = vecs
                .first()
                .and_then(|v| std::str::from_utf8(v).ok())?
                .trim()
                .trim_end_matches('\0')
                .trim()
                .to_string();
            if s.is_empty() {
                None
            } else {
                Some(s)
            }
        }
        _ => None,
    }
}

/// Numeric coercion over EXIF value types: integers, floats, rationals
/// resolved to their quotient, and numeric ASCII strings.
fn read_number(exif: &exif::Exif, tag: exif::Tag) -> Option<f64> {
    let field = exif.get_field(tag, exif::In::PRIMARY)?;
    value_to_f64(&field.value)
}

fn value_to_f64(value: &exif::Value) -> Option<f64> {
    match value {
        exif::Value::Byte(v) => v.first().map(|x| *x as f64),
        exif::Value::Short(v) => v.first().map(|x| *x as f64),
        exif::Value::Long(v) => v.first().map(|x| *x as f64),
        exif::Value::SByte(v) => v.first().map(|x| *x as f64),
        exif::Value::SShort(v) => v.first().map(|x| *x as f64),
        exif::Value::SLong(v) => v.first().map(|x| *x as f64),
        exif::Value::Float(v) => v.first().map(|x| *x as f64),
        exif::Value::Double(v) => v.first().copied(),
        exif::Value::Rational(v) => v.first().map(|r| r.to_f64()),
        exif::Value::SRational(v) => v.first().map(|r| r.to_f64()),
        exif::Value::Ascii(vecs) => vecs
            .first()
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(|s| s.trim().trim_end_matches('\0').parse::<f64>().ok()),
        _ => None,
    }
}

/// A location needs both coordinates; a lone latitude or longitude is
/// dropped.
fn read_gps(exif: &exif::Exif) -> Option<GeoPoint> {
    let lat = read_coordinate(exif, exif::Tag::GPSLatitude, exif::Tag::GPSLatitudeRef, 'S')?;
    let lon = read_coordinate(
        exif,
        exif::Tag::GPSLongitude,
        exif::Tag::GPSLongitudeRef,
        'W',
    )?;
    Some(GeoPoint { lat, lon })
}

fn read_coordinate(
    exif: &exif::Exif,
    value_tag: exif::Tag,
    ref_tag: exif::Tag,
    negative_ref: char,
) -> Option<f64> {
    let field = exif.get_field(value_tag, exif::In::PRIMARY)?;
    let degrees = match &field.value {
        // Degrees / minutes / seconds rational triplet.
        exif::Value::Rational(v) if v.len() >= 3 => {
            v[0].to_f64() + v[1].to_f64() / 60.0 + v[2].to_f64() / 3600.0
        }
        other => value_to_f64(other)?,
    };
    if !degrees.is_finite() {
        return None;
    }
    let sign = match read_ascii(exif, ref_tag) {
        Some(r) if r.to_ascii_uppercase().starts_with(negative_ref) => -1.0,
        _ => 1.0,
    };
    Some(sign * degrees)
}

// ── XMP ──────────────────────────────────────────────────────────────────────

struct XmpFields {
    rating: Option<f64>,
    subjects: Vec<String>,
}

static XMP_RATING_ATTR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"xmp:Rating\s*=\s*"(-?[0-9]+(?:\.[0-9]+)?)""#).unwrap());
static XMP_RATING_ELEM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<xmp:Rating>\s*(-?[0-9]+(?:\.[0-9]+)?)\s*</xmp:Rating>").unwrap());
static XMP_SUBJECT_BAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<dc:subject>(.*?)</dc:subject>").unwrap());
static XMP_LIST_ITEM: Lazy<Regex> = Lazy::new(|| Regex::new(r"<rdf:li[^>]*>([^<]+)</rdf:li>").unwrap());

/// Scan the head of a file for an embedded XMP packet and pull out the
/// rating and subject keywords. Works on the raw bytes, so it does not
/// care which container (JPEG APP1, TIFF, sidecar-style) holds the packet.
fn scan_xmp(path: &Path) -> Option<XmpFields> {
    let mut file = std::fs::File::open(path).ok()?;
    let mut buf = vec![0u8; XMP_SCAN_LIMIT];
    let n = file.read(&mut buf).ok()?;
    buf.truncate(n);
    let text = String::from_utf8_lossy(&buf);

    let start = text.find("<x:xmpmeta")?;
    let end = text[start..].find("</x:xmpmeta>")? + start;
    let packet = &text[start..end];

    let rating = XMP_RATING_ATTR
        .captures(packet)
        .or_else(|| XMP_RATING_ELEM.captures(packet))
        .and_then(|c| c[1].parse::<f64>().ok());

    let subjects = XMP_SUBJECT_BAG
        .captures(packet)
        .map(|bag| {
            XMP_LIST_ITEM
                .captures_iter(&bag[1])
                .map(|c| c[1].trim().to_string())
                .collect()
        })
        .unwrap_or_default();

    Some(XmpFields { rating, subjects })
}
