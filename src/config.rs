use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Runtime configuration. Only `media_root` is required; everything else
/// has a serde default so a minimal JSON document like
/// `{"media_root": "/photos"}` is a complete configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Config {
    /// Absolute directory to index.
    pub media_root: PathBuf,

    /// Path of the persisted JSON index. Defaults to
    /// `<media_root>/.photarium/index.json`.
    #[serde(default)]
    pub index_file: Option<PathBuf>,

    /// Root of the derivative cache. Defaults to
    /// `<media_root>/.photarium/cache`.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    /// Attach the filesystem watcher after the initial scan.
    #[serde(default = "default_true")]
    pub watch: bool,

    /// Debounce watcher events until writes settle (~200 ms).
    #[serde(default = "default_true")]
    pub await_write_finish: bool,

    /// Bounded parallelism for the metadata-extraction phase.
    #[serde(default = "default_scan_parallelism")]
    pub scan_parallelism: usize,

    /// Worker threads for the derivative processing queue. Kept small:
    /// each job shells out to an encoder.
    #[serde(default = "default_queue_workers")]
    pub queue_workers: usize,

    /// Byte budget for the derivative cache; `None` disables eviction.
    #[serde(default)]
    pub cache_max_bytes: Option<u64>,

    /// Route prefix the derivative service uses when rewriting HLS
    /// playlist segment URIs back through the files endpoint.
    #[serde(default = "default_route_prefix")]
    pub route_prefix: String,

    /// Passed through to the transport adapter.
    #[serde(default)]
    pub cors_origin: Option<String>,
    #[serde(default)]
    pub cors_allow_credentials: bool,
    /// Path prefix served from static uploads by the transport adapter.
    #[serde(default)]
    pub upload_prefix: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_scan_parallelism() -> usize {
    20
}

fn default_queue_workers() -> usize {
    2
}

fn default_route_prefix() -> String {
    "/api/files".to_string()
}

impl Config {
    pub fn new(media_root: impl Into<PathBuf>) -> Self {
        Self {
            media_root: media_root.into(),
            index_file: None,
            cache_dir: None,
            watch: true,
            await_write_finish: true,
            scan_parallelism: default_scan_parallelism(),
            queue_workers: default_queue_workers(),
            cache_max_bytes: None,
            route_prefix: default_route_prefix(),
            cors_origin: None,
            cors_allow_credentials: false,
            upload_prefix: None,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::BadRequest(format!("cannot read config {path:?}: {e}")))?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| Error::BadRequest(format!("invalid config {path:?}: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.media_root.is_absolute() {
            return Err(Error::BadRequest(format!(
                "media_root must be absolute, got {:?}",
                self.media_root
            )));
        }
        if self.scan_parallelism == 0 || self.queue_workers == 0 {
            return Err(Error::BadRequest(
                "scan_parallelism and queue_workers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn index_file(&self) -> PathBuf {
        self.index_file
            .clone()
            .unwrap_or_else(|| self.media_root.join(".photarium").join("index.json"))
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| self.media_root.join(".photarium").join("cache"))
    }
}
