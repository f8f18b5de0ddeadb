use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Normalize an inbound path to the canonical relative POSIX form used as
/// the index key: forward slashes, no empty or `.` segments, no leading
/// slash. Any `..` segment is rejected outright — there is no legitimate
/// reason for a request or a record key to climb out of the media root.
///
/// Every inbound request path and every record write goes through this one
/// helper so the two can never disagree about what a key looks like.
pub fn normalize(input: &str) -> Result<String> {
    let cleaned = input.replace('\\', "/");
    let mut segments: Vec<&str> = Vec::new();
    for seg in cleaned.split('/') {
        match seg {
            "" | "." => continue,
            ".." => {
                return Err(Error::Forbidden(format!("path escapes root: {input}")));
            }
            s => segments.push(s),
        }
    }
    if segments.is_empty() {
        return Err(Error::BadRequest("empty path".to_string()));
    }
    Ok(segments.join("/"))
}

/// Like [`normalize`] but an empty result is allowed (the media root
/// itself). Used for directory-scoped queries and folder listings.
pub fn normalize_dir(input: &str) -> Result<String> {
    let cleaned = input.replace('\\', "/");
    let mut segments: Vec<&str> = Vec::new();
    for seg in cleaned.split('/') {
        match seg {
            "" | "." => continue,
            ".." => {
                return Err(Error::Forbidden(format!("path escapes root: {input}")));
            }
            s => segments.push(s),
        }
    }
    Ok(segments.join("/"))
}

/// Resolve a normalized relative path against the media root and verify the
/// joined absolute form still lives inside it. Symlinked roots are fine —
/// the check is purely lexical, matching the normalization above.
pub fn resolve_in_root(root: &Path, relative: &str) -> Result<PathBuf> {
    let normalized = normalize(relative)?;
    let abs = root.join(&normalized);
    if !abs.starts_with(root) {
        return Err(Error::Forbidden(format!("path escapes root: {relative}")));
    }
    Ok(abs)
}

/// Turn an absolute path under `root` into the canonical relative key.
/// Returns `None` when the path is not under the root.
pub fn relative_key(root: &Path, abs: &Path) -> Option<String> {
    let rel = abs.strip_prefix(root).ok()?;
    let mut segments: Vec<String> = Vec::new();
    for comp in rel.components() {
        match comp {
            std::path::Component::Normal(s) => segments.push(s.to_string_lossy().into_owned()),
            std::path::Component::CurDir => continue,
            _ => return None,
        }
    }
    if segments.is_empty() {
        return None;
    }
    Some(segments.join("/"))
}

/// Parent directory portion of a relative key ("" for root-level files).
pub fn parent_dir(relative: &str) -> String {
    match relative.rsplit_once('/') {
        Some((dir, _)) => dir.to_string(),
        None => String::new(),
    }
}

/// Base name portion of a relative key.
pub fn base_name(relative: &str) -> &str {
    match relative.rsplit_once('/') {
        Some((_, name)) => name,
        None => relative,
    }
}

/// Map a file extension to a MIME type. Unknown extensions yield `None`;
/// callers serving bytes fall back to `application/octet-stream`.
pub fn mime_for_path(path: &Path) -> Option<String> {
    mime_guess::from_path(path).first().map(|m| m.to_string())
}

pub fn is_image_mime(mime: &str) -> bool {
    mime.starts_with("image/")
}

pub fn is_video_mime(mime: &str) -> bool {
    mime.starts_with("video/")
}
