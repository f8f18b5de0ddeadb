use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::derivative::cache::DerivativeCache;
use crate::derivative::image as image_job;
use crate::derivative::queue::{JobKey, JobKind, MediaQueue, Priority};
use crate::derivative::video as video_job;
use crate::error::{Error, Result};
use crate::index::record::FileRecord;
use crate::index::store::IndexStore;
use crate::pathnorm;

pub const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
pub const SEGMENT_CONTENT_TYPE: &str = "video/mp2t";
pub const JPEG_CONTENT_TYPE: &str = "image/jpeg";
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Cap on synchronous derivative production per request.
const JOB_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_HLS_HEIGHT: u32 = 640;
const PREVIEW_HEIGHT: u32 = 320;
const DEFAULT_WEBSAFE_HEIGHT: u32 = 640;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Representation {
    WebSafe,
    Preview,
    Hls,
}

impl Representation {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "webSafe" => Ok(Representation::WebSafe),
            "preview" => Ok(Representation::Preview),
            "hls" => Ok(Representation::Hls),
            other => Err(Error::BadRequest(format!("unknown representation: {other}"))),
        }
    }
}

/// Target height: one of the standard ladder steps, or the source's own
/// size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Height {
    #[default]
    Original,
    Pixels(u32),
}

impl Height {
    pub fn parse(s: &str) -> Result<Self> {
        if s == "original" {
            return Ok(Height::Original);
        }
        let pixels: u32 = s
            .parse()
            .map_err(|_| Error::BadRequest(format!("invalid height: {s}")))?;
        if !crate::derivative::STANDARD_HEIGHTS.contains(&pixels) {
            return Err(Error::BadRequest(format!(
                "height must be one of {:?} or \"original\", got {pixels}",
                crate::derivative::STANDARD_HEIGHTS
            )));
        }
        Ok(Height::Pixels(pixels))
    }
}

impl<'de> Deserialize<'de> for Height {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        let text = match &value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            _ => return Err(serde::de::Error::custom("height must be a number or string")),
        };
        Height::parse(&text).map_err(serde::de::Error::custom)
    }
}

/// Parameter bundle for a single-file request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FetchParams {
    pub representation: Option<Representation>,
    pub height: Option<Height>,
    /// Segment file name within an HLS rendition.
    pub segment: Option<String>,
    /// Variant height of a rendition (`640` or `640p`).
    pub variant: Option<String>,
}

/// What the transport adapter sends back.
#[derive(Debug)]
pub enum MediaResponse {
    /// Stream a file from disk.
    File {
        path: PathBuf,
        content_type: String,
        /// Advertise `Accept-Ranges: bytes` (videos).
        accept_ranges: bool,
    },
    /// A playlist body rewritten so segment URIs point back through the
    /// files endpoint. `content_duration` feeds `X-Content-Duration`.
    Playlist {
        body: String,
        content_duration: Option<f64>,
    },
}

/// Request-time selection of a representation: cache lookup, job
/// submission and partial-playlist serving.
///
/// Cheap to clone; clones share the store, cache and queue.
#[derive(Clone)]
pub struct MediaService {
    root: PathBuf,
    route_prefix: String,
    store: IndexStore,
    cache: DerivativeCache,
    queue: MediaQueue,
    cache_max_bytes: Option<u64>,
}

impl MediaService {
    pub fn new(
        root: PathBuf,
        route_prefix: String,
        store: IndexStore,
        cache: DerivativeCache,
        queue: MediaQueue,
        cache_max_bytes: Option<u64>,
    ) -> Self {
        MediaService {
            root,
            route_prefix,
            store,
            cache,
            queue,
            cache_max_bytes,
        }
    }

    /// Resolve a single-file request to a response. Dispatch order: HLS,
    /// video thumbnail, image variant, original bytes — the first
    /// handler that claims the request wins.
    pub fn fetch(&self, raw_path: &str, params: &FetchParams) -> Result<MediaResponse> {
        let key = pathnorm::normalize(raw_path)?;
        let abs = self.root.join(&key);
        let stat = std::fs::metadata(&abs).map_err(|_| Error::NotFound(key.clone()))?;
        if !stat.is_file() {
            return Err(Error::NotFound(format!("not a file: {key}")));
        }

        let mime = pathnorm::mime_for_path(&abs);
        let is_image = mime.as_deref().is_some_and(pathnorm::is_image_mime);
        let is_video = mime.as_deref().is_some_and(pathnorm::is_video_mime);
        let needs_resize = matches!(params.height, Some(Height::Pixels(_)));
        let needs_format_change = params.representation == Some(Representation::WebSafe)
            && matches!(mime.as_deref(), Some("image/heic") | Some("image/heif"));

        if is_video && params.representation == Some(Representation::Hls) {
            return self.fetch_hls(&key, &abs, params);
        }
        if is_video
            && (matches!(
                params.representation,
                Some(Representation::Preview) | Some(Representation::WebSafe)
            ) || needs_resize)
        {
            return self.fetch_video_thumb(&abs, params);
        }
        if is_image && (needs_resize || needs_format_change) {
            return self.fetch_image_variant(&abs, params);
        }

        Ok(MediaResponse::File {
            path: abs,
            content_type: mime.unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            accept_ranges: is_video,
        })
    }

    // ── HLS ──────────────────────────────────────────────────────────────

    fn fetch_hls(&self, key: &str, abs: &Path, params: &FetchParams) -> Result<MediaResponse> {
        let hash = DerivativeCache::source_hash(abs);

        if let Some(segment) = &params.segment {
            return self.fetch_hls_segment(&hash, segment, params.variant.as_deref());
        }

        if self.cache.hls_mbr_master(&hash).is_file() {
            return self.fetch_hls_mbr(key, &hash, params.variant.as_deref());
        }

        // Single-stream on demand.
        let height = match params.height {
            Some(Height::Pixels(p)) => p,
            _ => DEFAULT_HLS_HEIGHT,
        };
        let dir = self.cache.hls_dir(&hash, height);
        let playlist_path = dir.join("playlist.m3u8");

        let finished = std::fs::read_to_string(&playlist_path)
            .map(|content| content.contains("#EXT-X-ENDLIST"))
            .unwrap_or(false);
        if !finished {
            let source = abs.to_path_buf();
            let job_dir = dir.clone();
            let ticket = self.queue.submit(
                JobKey::new(JobKind::Hls, hash.clone(), height.to_string()),
                Priority::UserBlocked,
                move || video_job::run_hls_transcode(&source, height, &job_dir),
            );
            self.wait_for_serveable_playlist(&dir, &ticket)?;
        }

        let body = std::fs::read_to_string(&playlist_path)?;
        let rewritten = video_job::rewrite_playlist(&body, |uri| {
            format!(
                "{}/{}?representation=hls&variant={}&segment={}",
                self.route_prefix, key, height, uri
            )
        });
        Ok(MediaResponse::Playlist {
            body: rewritten,
            content_duration: self.indexed_duration(key),
        })
    }

    /// Wait until the rendition has enough segments to serve, but fail
    /// fast when the transcode job errors out instead of sitting on the
    /// 30 s cap.
    fn wait_for_serveable_playlist(
        &self,
        dir: &Path,
        ticket: &crate::derivative::queue::JobTicket,
    ) -> Result<()> {
        let deadline = Instant::now() + video_job::SEGMENT_WAIT_TIMEOUT;
        loop {
            if video_job::wait_for_playlist(dir, video_job::MIN_SEGMENTS_TO_SERVE, Duration::ZERO)
                .is_ok()
            {
                return Ok(());
            }
            if let Some(result) = ticket.wait_timeout(Duration::from_millis(200)) {
                result?;
                return Ok(()); // job finished, playlist is complete
            }
            if Instant::now() >= deadline {
                return Err(Error::Internal(format!(
                    "timed out waiting for segments in {dir:?}"
                )));
            }
        }
    }

    fn fetch_hls_segment(
        &self,
        hash: &str,
        segment: &str,
        variant: Option<&str>,
    ) -> Result<MediaResponse> {
        if segment.contains(['/', '\\']) || segment.contains("..") || !segment.ends_with(".ts") {
            return Err(Error::BadRequest(format!("invalid segment name: {segment}")));
        }
        let height = parse_variant(variant.ok_or_else(|| {
            Error::BadRequest("segment requests need a variant".to_string())
        })?)?;

        let dir = if self.cache.hls_mbr_master(hash).is_file() {
            self.cache.hls_mbr_variant_dir(hash, height)
        } else {
            self.cache.hls_dir(hash, height)
        };
        let path = dir.join(segment);
        let path = self
            .cache
            .lookup(&path)
            .ok_or_else(|| Error::NotFound(format!("segment not ready: {segment}")))?;
        Ok(MediaResponse::File {
            path,
            content_type: SEGMENT_CONTENT_TYPE.to_string(),
            accept_ranges: false,
        })
    }

    /// Pre-encoded multi-bitrate rendition: master or variant playlist,
    /// URIs rewritten through the endpoint.
    fn fetch_hls_mbr(&self, key: &str, hash: &str, variant: Option<&str>) -> Result<MediaResponse> {
        let content_duration = self.indexed_duration(key);
        match variant {
            None => {
                let body = std::fs::read_to_string(self.cache.hls_mbr_master(hash))?;
                // Master entries look like "640p/playlist.m3u8".
                let rewritten = video_job::rewrite_playlist(&body, |uri| {
                    let height = uri.split('/').next().unwrap_or(uri);
                    format!(
                        "{}/{}?representation=hls&variant={}",
                        self.route_prefix,
                        key,
                        height.trim_end_matches('p')
                    )
                });
                Ok(MediaResponse::Playlist {
                    body: rewritten,
                    content_duration,
                })
            }
            Some(variant) => {
                let height = parse_variant(variant)?;
                let playlist = self.cache.hls_mbr_variant_dir(hash, height).join("playlist.m3u8");
                let body = std::fs::read_to_string(&playlist)
                    .map_err(|_| Error::NotFound(format!("no {height}p rendition")))?;
                let rewritten = video_job::rewrite_playlist(&body, |uri| {
                    format!(
                        "{}/{}?representation=hls&variant={}&segment={}",
                        self.route_prefix, key, height, uri
                    )
                });
                Ok(MediaResponse::Playlist {
                    body: rewritten,
                    content_duration,
                })
            }
        }
    }

    fn indexed_duration(&self, key: &str) -> Option<f64> {
        match self.store.get(key) {
            Some(FileRecord::Full(record)) => record.metadata.duration,
            _ => None,
        }
    }

    // ── Video thumbnails ─────────────────────────────────────────────────

    fn fetch_video_thumb(&self, abs: &Path, params: &FetchParams) -> Result<MediaResponse> {
        let height = match (params.representation, params.height) {
            (Some(Representation::Preview), _) => PREVIEW_HEIGHT,
            (_, Some(Height::Pixels(p))) => p,
            _ => DEFAULT_WEBSAFE_HEIGHT,
        };
        let hash = DerivativeCache::source_hash(abs);
        let out = self.cache.video_thumb_path(&hash, height);

        if let Some(path) = self.cache.lookup(&out) {
            return Ok(jpeg_response(path));
        }

        let source = abs.to_path_buf();
        let job_out = out.clone();
        let ticket = self.queue.submit(
            JobKey::new(JobKind::VideoThumb, hash, height.to_string()),
            Priority::UserBlocked,
            move || video_job::make_video_thumbnail(&source, height, &job_out),
        );
        let path = self.wait_for_job(&ticket)?;
        self.enforce_cache_budget();
        Ok(jpeg_response(path))
    }

    // ── Image variants ───────────────────────────────────────────────────

    fn fetch_image_variant(&self, abs: &Path, params: &FetchParams) -> Result<MediaResponse> {
        let hash = DerivativeCache::source_hash(abs);
        let (variant, target) = match params.height {
            Some(Height::Pixels(p)) => (p.to_string(), Some(p)),
            // Format change only (e.g. HEIC → webSafe at full size).
            _ => ("original".to_string(), None),
        };
        let out = self.cache.image_path(&hash, &variant);

        if let Some(path) = self.cache.lookup(&out) {
            return Ok(jpeg_response(path));
        }

        // Warm the whole ladder in the background; the grid will ask for
        // the other sizes next.
        {
            let source = abs.to_path_buf();
            let cache = self.cache.clone();
            let batch_hash = hash.clone();
            self.queue.submit(
                JobKey::new(JobKind::ImageVariant, hash.clone(), "all"),
                Priority::UserImplicit,
                move || image_job::convert_all_sizes(&source, &cache, &batch_hash),
            );
        }

        let source = abs.to_path_buf();
        let job_out = out.clone();
        let ticket = self.queue.submit(
            JobKey::new(JobKind::ImageVariant, hash, variant),
            Priority::UserBlocked,
            move || image_job::convert_image(&source, target, &job_out),
        );
        let path = self.wait_for_job(&ticket)?;
        self.enforce_cache_budget();
        Ok(jpeg_response(path))
    }

    fn wait_for_job(&self, ticket: &crate::derivative::queue::JobTicket) -> Result<PathBuf> {
        ticket
            .wait_timeout(JOB_WAIT_TIMEOUT)
            .ok_or_else(|| Error::Internal("derivative processing timed out".to_string()))?
    }

    fn enforce_cache_budget(&self) {
        if let Some(budget) = self.cache_max_bytes {
            self.cache.enforce_budget(budget);
        }
    }

    pub fn queue(&self) -> &MediaQueue {
        &self.queue
    }

    pub fn cache(&self) -> &DerivativeCache {
        &self.cache
    }
}

fn jpeg_response(path: PathBuf) -> MediaResponse {
    MediaResponse::File {
        path,
        content_type: JPEG_CONTENT_TYPE.to_string(),
        accept_ranges: false,
    }
}

/// Variant heights arrive as `640` or `640p`.
fn parse_variant(variant: &str) -> Result<u32> {
    variant
        .trim_end_matches('p')
        .parse()
        .map_err(|_| Error::BadRequest(format!("invalid variant: {variant}")))
}

// ── Range requests ───────────────────────────────────────────────────────────

/// A resolved, inclusive byte range within a file of `total` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

impl ByteRange {
    /// A resolved range always covers at least one byte.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` header value for a 206 response.
    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.total)
    }
}

/// Parse a `Range` header (`bytes=start-end`, `bytes=start-`,
/// `bytes=-suffix`) against a file size. `None` means the header is
/// unusable and the transport should fall back to a full 200 response.
pub fn parse_range(header: &str, total: u64) -> Option<ByteRange> {
    if total == 0 {
        return None;
    }
    let spec = header.strip_prefix("bytes=")?.trim();
    let (start_text, end_text) = spec.split_once('-')?;
    let range = match (start_text.is_empty(), end_text.is_empty()) {
        (true, false) => {
            // Suffix form: last N bytes.
            let suffix: u64 = end_text.parse().ok()?;
            if suffix == 0 {
                return None;
            }
            ByteRange {
                start: total.saturating_sub(suffix),
                end: total - 1,
                total,
            }
        }
        (false, true) => ByteRange {
            start: start_text.parse().ok()?,
            end: total - 1,
            total,
        },
        (false, false) => ByteRange {
            start: start_text.parse().ok()?,
            end: end_text.parse::<u64>().ok()?.min(total - 1),
            total,
        },
        (true, true) => return None,
    };
    if range.start > range.end || range.start >= total {
        return None;
    }
    Some(range)
}

/// Read the bytes of a resolved range.
pub fn read_range(path: &Path, range: &ByteRange) -> Result<Vec<u8>> {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(range.start))?;
    let mut buf = vec![0u8; range.len() as usize];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::record::{FullRecord, MediaMetadata};
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    struct Fixture {
        service: MediaService,
        root: TempDir,
        store: IndexStore,
        queue: MediaQueue,
    }

    fn setup() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let store = IndexStore::in_memory();
        let queue = MediaQueue::new(2);
        let cache = DerivativeCache::new(root.path().join(".photarium/cache"));
        let service = MediaService::new(
            root.path().to_path_buf(),
            "/api/files".to_string(),
            store.clone(),
            cache,
            queue.clone(),
            None,
        );
        Fixture {
            service,
            root,
            store,
            queue,
        }
    }

    fn write_png(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
        let path = dir.join(name);
        image::DynamicImage::new_rgb8(width, height).save(&path).unwrap();
        path
    }

    fn index_video(store: &IndexStore, key: &str, duration: f64) {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        store.upsert(FileRecord::Full(FullRecord {
            relative_path: key.to_string(),
            directory: crate::pathnorm::parent_dir(key),
            name: crate::pathnorm::base_name(key).to_string(),
            size: 10,
            mime_type: Some("video/mp4".to_string()),
            date_created: None,
            date_modified: now,
            metadata: MediaMetadata {
                duration: Some(duration),
                ..Default::default()
            },
            last_indexed_at: now,
        }));
    }

    #[test]
    fn test_traversal_and_missing_paths() {
        let f = setup();
        assert!(matches!(
            f.service.fetch("../escape.jpg", &FetchParams::default()),
            Err(Error::Forbidden(_))
        ));
        assert!(matches!(
            f.service.fetch("missing.jpg", &FetchParams::default()),
            Err(Error::NotFound(_))
        ));
        f.queue.shutdown();
    }

    #[test]
    fn test_original_bytes_with_mime_and_ranges_flag() {
        let f = setup();
        std::fs::write(f.root.path().join("notes.txt"), b"hello").unwrap();
        std::fs::write(f.root.path().join("clip.mp4"), b"not really video").unwrap();

        match f.service.fetch("notes.txt", &FetchParams::default()).unwrap() {
            MediaResponse::File {
                content_type,
                accept_ranges,
                ..
            } => {
                assert_eq!(content_type, "text/plain");
                assert!(!accept_ranges);
            }
            other => panic!("expected File, got {other:?}"),
        }

        match f.service.fetch("clip.mp4", &FetchParams::default()).unwrap() {
            MediaResponse::File {
                content_type,
                accept_ranges,
                ..
            } => {
                assert_eq!(content_type, "video/mp4");
                assert!(accept_ranges, "videos advertise range support");
            }
            other => panic!("expected File, got {other:?}"),
        }
        f.queue.shutdown();
    }

    #[test]
    fn test_unknown_extension_defaults_to_octet_stream() {
        let f = setup();
        std::fs::write(f.root.path().join("blob.zzznope"), b"??").unwrap();
        match f.service.fetch("blob.zzznope", &FetchParams::default()).unwrap() {
            MediaResponse::File { content_type, .. } => {
                assert_eq!(content_type, DEFAULT_CONTENT_TYPE);
            }
            other => panic!("expected File, got {other:?}"),
        }
        f.queue.shutdown();
    }

    #[test]
    fn test_image_resize_produces_cached_jpeg() {
        let f = setup();
        write_png(f.root.path(), "photo.png", 1200, 900);
        let params = FetchParams {
            height: Some(Height::Pixels(320)),
            ..Default::default()
        };

        let MediaResponse::File {
            path, content_type, ..
        } = f.service.fetch("photo.png", &params).unwrap()
        else {
            panic!("expected File");
        };
        assert_eq!(content_type, JPEG_CONTENT_TYPE);
        let img = image::open(&path).unwrap();
        assert!(img.width() <= 320 && img.height() <= 320);

        // Second fetch hits the cache (same artifact path).
        let MediaResponse::File { path: again, .. } = f.service.fetch("photo.png", &params).unwrap()
        else {
            panic!("expected File");
        };
        assert_eq!(path, again);
        f.queue.shutdown();
    }

    #[test]
    fn test_image_request_warms_full_ladder() {
        let f = setup();
        let source = write_png(f.root.path(), "photo.png", 2400, 1800);
        let params = FetchParams {
            height: Some(Height::Pixels(160)),
            ..Default::default()
        };
        f.service.fetch("photo.png", &params).unwrap();

        // The UserImplicit batch job fills the other sizes; wait for it.
        let hash = DerivativeCache::source_hash(&source);
        let deadline = Instant::now() + Duration::from_secs(15);
        let all_present = || {
            crate::derivative::STANDARD_HEIGHTS
                .iter()
                .all(|h| f.service.cache().image_path(&hash, &h.to_string()).is_file())
        };
        while !all_present() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(all_present(), "background batch must fill the ladder");
        f.queue.shutdown();
    }

    #[test]
    fn test_corrupt_image_maps_to_invalid_image() {
        let f = setup();
        std::fs::write(f.root.path().join("broken.jpg"), b"not a jpeg").unwrap();
        let params = FetchParams {
            height: Some(Height::Pixels(320)),
            ..Default::default()
        };
        let result = f.service.fetch("broken.jpg", &params);
        assert!(matches!(result, Err(Error::InvalidImage(_))));
        f.queue.shutdown();
    }

    #[test]
    fn test_height_parsing_is_strict() {
        assert_eq!(Height::parse("original").unwrap(), Height::Original);
        assert_eq!(Height::parse("640").unwrap(), Height::Pixels(640));
        assert!(matches!(Height::parse("123"), Err(Error::BadRequest(_))));
        assert!(matches!(Height::parse("huge"), Err(Error::BadRequest(_))));
    }

    #[test]
    fn test_representation_parsing() {
        assert_eq!(
            Representation::parse("webSafe").unwrap(),
            Representation::WebSafe
        );
        assert_eq!(
            Representation::parse("preview").unwrap(),
            Representation::Preview
        );
        assert_eq!(Representation::parse("hls").unwrap(), Representation::Hls);
        assert!(Representation::parse("websafe").is_err());
    }

    #[test]
    fn test_hls_playlist_served_from_finished_cache() {
        // A completed rendition on disk serves without touching ffmpeg:
        // the playlist is rewritten through the endpoint and carries the
        // indexed duration.
        let f = setup();
        let abs = f.root.path().join("movie.mp4");
        std::fs::write(&abs, b"fake video").unwrap();
        index_video(&f.store, "movie.mp4", 30.0);

        let hash = DerivativeCache::source_hash(&abs);
        let dir = f.service.cache().hls_dir(&hash, 640);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("playlist.m3u8"),
            "#EXTM3U\n#EXTINF:4.0,\nsegment_000.ts\n#EXTINF:4.0,\nsegment_001.ts\n#EXTINF:4.0,\nsegment_002.ts\n#EXT-X-ENDLIST\n",
        )
        .unwrap();
        for i in 0..3 {
            std::fs::write(dir.join(format!("segment_00{i}.ts")), b"ts").unwrap();
        }

        let params = FetchParams {
            representation: Some(Representation::Hls),
            ..Default::default()
        };
        let MediaResponse::Playlist {
            body,
            content_duration,
        } = f.service.fetch("movie.mp4", &params).unwrap()
        else {
            panic!("expected Playlist");
        };

        assert_eq!(content_duration, Some(30.0));
        let segment_lines: Vec<&str> = body
            .lines()
            .filter(|l| !l.starts_with('#') && !l.trim().is_empty())
            .collect();
        assert_eq!(segment_lines.len(), 3);
        for line in segment_lines {
            assert!(
                line.starts_with("/api/files/movie.mp4?representation=hls&variant=640&segment=segment_"),
                "unexpected segment URI: {line}"
            );
        }
        f.queue.shutdown();
    }

    #[test]
    fn test_hls_segment_serving_and_validation() {
        let f = setup();
        let abs = f.root.path().join("movie.mp4");
        std::fs::write(&abs, b"fake video").unwrap();

        let hash = DerivativeCache::source_hash(&abs);
        let dir = f.service.cache().hls_dir(&hash, 640);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("segment_000.ts"), b"mpegts").unwrap();

        let params = FetchParams {
            representation: Some(Representation::Hls),
            segment: Some("segment_000.ts".to_string()),
            variant: Some("640".to_string()),
            ..Default::default()
        };
        let MediaResponse::File {
            path, content_type, ..
        } = f.service.fetch("movie.mp4", &params).unwrap()
        else {
            panic!("expected File");
        };
        assert_eq!(content_type, SEGMENT_CONTENT_TYPE);
        assert_eq!(std::fs::read(path).unwrap(), b"mpegts");

        // Escaping segment names are rejected, missing ones are 404.
        for bad in ["../../etc/passwd", "a/b.ts", "segment_000.mp4"] {
            let params = FetchParams {
                representation: Some(Representation::Hls),
                segment: Some(bad.to_string()),
                variant: Some("640".to_string()),
                ..Default::default()
            };
            assert!(
                matches!(f.service.fetch("movie.mp4", &params), Err(Error::BadRequest(_))),
                "{bad} must be rejected"
            );
        }
        let params = FetchParams {
            representation: Some(Representation::Hls),
            segment: Some("segment_999.ts".to_string()),
            variant: Some("640".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            f.service.fetch("movie.mp4", &params),
            Err(Error::NotFound(_))
        ));
        f.queue.shutdown();
    }

    #[test]
    fn test_hls_mbr_master_and_variant_serving() {
        let f = setup();
        let abs = f.root.path().join("movie.mp4");
        std::fs::write(&abs, b"fake video").unwrap();
        index_video(&f.store, "movie.mp4", 120.0);

        let hash = DerivativeCache::source_hash(&abs);
        let mbr = f.service.cache().hls_mbr_dir(&hash);
        let variant_dir = f.service.cache().hls_mbr_variant_dir(&hash, 640);
        std::fs::create_dir_all(&variant_dir).unwrap();
        std::fs::write(mbr.join("master.m3u8"), video_job::master_playlist(&[640])).unwrap();
        std::fs::write(
            variant_dir.join("playlist.m3u8"),
            "#EXTM3U\n#EXTINF:4.0,\nsegment_000.ts\n#EXT-X-ENDLIST\n",
        )
        .unwrap();
        std::fs::write(variant_dir.join("segment_000.ts"), b"ts").unwrap();

        // Master: variant URI rewritten through the endpoint.
        let params = FetchParams {
            representation: Some(Representation::Hls),
            ..Default::default()
        };
        let MediaResponse::Playlist { body, .. } = f.service.fetch("movie.mp4", &params).unwrap()
        else {
            panic!("expected Playlist");
        };
        assert!(body.contains("/api/files/movie.mp4?representation=hls&variant=640"));

        // Variant playlist: segment URIs carry variant + segment.
        let params = FetchParams {
            representation: Some(Representation::Hls),
            variant: Some("640".to_string()),
            ..Default::default()
        };
        let MediaResponse::Playlist { body, .. } = f.service.fetch("movie.mp4", &params).unwrap()
        else {
            panic!("expected Playlist");
        };
        assert!(body
            .contains("/api/files/movie.mp4?representation=hls&variant=640&segment=segment_000.ts"));

        // Segment requests route into the mbr variant directory.
        let params = FetchParams {
            representation: Some(Representation::Hls),
            variant: Some("640".to_string()),
            segment: Some("segment_000.ts".to_string()),
            ..Default::default()
        };
        assert!(f.service.fetch("movie.mp4", &params).is_ok());
        f.queue.shutdown();
    }

    #[test]
    fn test_parse_range_forms() {
        assert_eq!(
            parse_range("bytes=0-499", 1000),
            Some(ByteRange {
                start: 0,
                end: 499,
                total: 1000
            })
        );
        assert_eq!(
            parse_range("bytes=500-", 1000),
            Some(ByteRange {
                start: 500,
                end: 999,
                total: 1000
            })
        );
        assert_eq!(
            parse_range("bytes=-200", 1000),
            Some(ByteRange {
                start: 800,
                end: 999,
                total: 1000
            })
        );
        // End clamps to the file size.
        assert_eq!(
            parse_range("bytes=900-2000", 1000),
            Some(ByteRange {
                start: 900,
                end: 999,
                total: 1000
            })
        );
        assert_eq!(parse_range("bytes=1000-", 1000), None);
        assert_eq!(parse_range("bytes=5-2", 1000), None);
        assert_eq!(parse_range("bytes=-0", 1000), None);
        assert_eq!(parse_range("lines=0-5", 1000), None);
        assert_eq!(parse_range("bytes=0-10", 0), None);
    }

    #[test]
    fn test_read_range_returns_exact_window() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("data.bin");
        std::fs::write(&path, b"0123456789").unwrap();
        let range = parse_range("bytes=2-5", 10).unwrap();
        assert_eq!(read_range(&path, &range).unwrap(), b"2345");
        assert_eq!(range.content_range(), "bytes 2-5/10");
        assert_eq!(range.len(), 4);
    }
}
