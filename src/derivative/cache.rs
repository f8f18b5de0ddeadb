use std::path::{Path, PathBuf};
use std::time::SystemTime;

use filetime::FileTime;

/// Content-addressed derivative cache. Layout under the cache root:
///
/// ```text
/// images/<hash>/<variant>.jpg
/// videothumbs/<hash>/<height>.jpg
/// hls/<hash>/<height>/{playlist.m3u8, segment_NNN.ts}
/// hls-mbr/<hash>/{master.m3u8, <height>p/{playlist.m3u8, segment_NNN.ts}}
/// ```
///
/// `<hash>` is the blake3 digest of the absolute source path. Entries are
/// immutable once complete and the whole tree is safe to delete at any
/// time; everything regenerates on demand.
#[derive(Clone)]
pub struct DerivativeCache {
    root: PathBuf,
}

impl DerivativeCache {
    pub fn new(root: PathBuf) -> Self {
        DerivativeCache { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stable digest of the absolute source path. Path-based (not
    /// content-based) so keying a derivative never reads the source.
    pub fn source_hash(path: &Path) -> String {
        blake3::hash(path.to_string_lossy().as_bytes())
            .to_hex()
            .to_string()
    }

    /// `variant` is a height ("640") or "original" (format-changed, full
    /// size).
    pub fn image_path(&self, hash: &str, variant: &str) -> PathBuf {
        self.root.join("images").join(hash).join(format!("{variant}.jpg"))
    }

    pub fn video_thumb_path(&self, hash: &str, height: u32) -> PathBuf {
        self.root
            .join("videothumbs")
            .join(hash)
            .join(format!("{height}.jpg"))
    }

    pub fn hls_dir(&self, hash: &str, height: u32) -> PathBuf {
        self.root.join("hls").join(hash).join(height.to_string())
    }

    pub fn hls_playlist(&self, hash: &str, height: u32) -> PathBuf {
        self.hls_dir(hash, height).join("playlist.m3u8")
    }

    pub fn hls_mbr_dir(&self, hash: &str) -> PathBuf {
        self.root.join("hls-mbr").join(hash)
    }

    pub fn hls_mbr_master(&self, hash: &str) -> PathBuf {
        self.hls_mbr_dir(hash).join("master.m3u8")
    }

    pub fn hls_mbr_variant_dir(&self, hash: &str, height: u32) -> PathBuf {
        self.hls_mbr_dir(hash).join(format!("{height}p"))
    }

    /// Cache hit: refresh the entry's mtime so LRU eviction sees the
    /// access, and return the path. `None` when the artifact is absent.
    pub fn lookup(&self, path: &Path) -> Option<PathBuf> {
        if path.is_file() {
            touch(path);
            Some(path.to_path_buf())
        } else {
            None
        }
    }

    /// Size-capped LRU eviction: walk the cache, order evictable units by
    /// last access (mtime) and delete oldest-first until the tree fits
    /// `max_bytes`. HLS renditions are evicted as a whole directory so a
    /// playlist never outlives its segments.
    pub fn enforce_budget(&self, max_bytes: u64) {
        let mut units = collect_units(&self.root);
        let mut total: u64 = units.iter().map(|u| u.bytes).sum();
        if total <= max_bytes {
            return;
        }
        units.sort_by_key(|u| u.accessed);
        for unit in units {
            if total <= max_bytes {
                break;
            }
            let result = if unit.is_dir {
                std::fs::remove_dir_all(&unit.path)
            } else {
                std::fs::remove_file(&unit.path)
            };
            match result {
                Ok(()) => {
                    tracing::debug!("cache evicted {:?} ({} bytes)", unit.path, unit.bytes);
                    total = total.saturating_sub(unit.bytes);
                }
                Err(e) => tracing::warn!("cache eviction failed for {:?}: {}", unit.path, e),
            }
        }
    }
}

/// Mark an artifact as just-used. Failures are irrelevant; eviction order
/// degrades to write time.
pub(crate) fn touch(path: &Path) {
    let now = FileTime::from_system_time(SystemTime::now());
    let _ = filetime::set_file_mtime(path, now);
}

struct EvictionUnit {
    path: PathBuf,
    bytes: u64,
    accessed: SystemTime,
    is_dir: bool,
}

/// Evictable units: single files under `images/` and `videothumbs/`,
/// whole rendition directories under `hls/<hash>/<height>` and
/// `hls-mbr/<hash>`.
fn collect_units(root: &Path) -> Vec<EvictionUnit> {
    let mut units = Vec::new();

    for family in ["images", "videothumbs"] {
        for hash_dir in read_dirs(&root.join(family)) {
            for file in read_files(&hash_dir) {
                if let Ok(meta) = file.metadata() {
                    units.push(EvictionUnit {
                        path: file,
                        bytes: meta.len(),
                        accessed: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                        is_dir: false,
                    });
                }
            }
        }
    }

    for hash_dir in read_dirs(&root.join("hls")) {
        for rendition in read_dirs(&hash_dir) {
            units.push(dir_unit(rendition));
        }
    }
    for hash_dir in read_dirs(&root.join("hls-mbr")) {
        units.push(dir_unit(hash_dir));
    }

    units
}

fn dir_unit(path: PathBuf) -> EvictionUnit {
    let mut bytes = 0u64;
    let mut accessed = SystemTime::UNIX_EPOCH;
    for entry in walkdir::WalkDir::new(&path).into_iter().flatten() {
        if let Ok(meta) = entry.metadata() {
            if meta.is_file() {
                bytes += meta.len();
                if let Ok(modified) = meta.modified() {
                    accessed = accessed.max(modified);
                }
            }
        }
    }
    EvictionUnit {
        path,
        bytes,
        accessed,
        is_dir: true,
    }
}

fn read_dirs(path: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(path)
        .into_iter()
        .flatten()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.path())
        .collect()
}

fn read_files(path: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(path)
        .into_iter()
        .flatten()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|e| e.path())
        .collect()
}
