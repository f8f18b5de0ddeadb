use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::Context;

use crate::error::{Error, Result};

/// Segment length requested from the encoder.
const SEGMENT_SECONDS: u32 = 4;

/// A playlist is served once this many segments exist (or the encode
/// finished earlier for short inputs).
pub const MIN_SEGMENTS_TO_SERVE: usize = 3;

/// Hard cap on the segment wait; exceeding it errors instead of hanging
/// the request.
pub const SEGMENT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

const SEGMENT_POLL: Duration = Duration::from_millis(200);

fn ffmpeg_binary() -> String {
    std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string())
}

/// Decode one frame near the start of the video, scale it to `height`
/// and write a JPEG poster. Inputs shorter than the initial seek fall
/// back to the first frame.
pub fn make_video_thumbnail(source: &Path, height: u32, out: &Path) -> Result<PathBuf> {
    if let Some(parent) = out.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if grab_frame(source, height, out, 1.0).is_err() {
        grab_frame(source, height, out, 0.0)
            .map_err(|e| Error::Internal(format!("cannot extract poster frame: {e:#}")))?;
    }
    Ok(out.to_path_buf())
}

fn grab_frame(source: &Path, height: u32, out: &Path, seek_seconds: f64) -> anyhow::Result<()> {
    let output = Command::new(ffmpeg_binary())
        .arg("-y")
        .arg("-v")
        .arg("error")
        .arg("-ss")
        .arg(format!("{seek_seconds}"))
        .arg("-i")
        .arg(source.as_os_str())
        .arg("-frames:v")
        .arg("1")
        .arg("-vf")
        .arg(format!("scale=-2:{height}"))
        .arg(out.as_os_str())
        .output()
        .with_context(|| format!("failed to run ffmpeg on {}", source.display()))?;
    if !output.status.success() {
        anyhow::bail!(
            "ffmpeg exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    if !out.is_file() {
        anyhow::bail!("ffmpeg produced no frame at seek {seek_seconds}");
    }
    Ok(())
}

/// Segment-based transcode of `source` to `height` into `dir`. The
/// encoder appends completed segments to the playlist as it goes, so
/// playlist requests can be served while this still runs. Blocks until
/// the encode finishes and returns the playlist path.
pub fn run_hls_transcode(source: &Path, height: u32, dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let playlist = dir.join("playlist.m3u8");
    let output = Command::new(ffmpeg_binary())
        .arg("-y")
        .arg("-v")
        .arg("error")
        .arg("-i")
        .arg(source.as_os_str())
        .arg("-vf")
        .arg(format!("scale=-2:{height}"))
        .arg("-c:v")
        .arg("libx264")
        .arg("-preset")
        .arg("veryfast")
        .arg("-crf")
        .arg("23")
        .arg("-c:a")
        .arg("aac")
        .arg("-ac")
        .arg("2")
        .arg("-f")
        .arg("hls")
        .arg("-hls_time")
        .arg(SEGMENT_SECONDS.to_string())
        .arg("-hls_list_size")
        .arg("0")
        .arg("-hls_segment_filename")
        .arg(dir.join("segment_%03d.ts").as_os_str())
        .arg(playlist.as_os_str())
        .output()
        .map_err(|e| Error::Internal(format!("failed to run ffmpeg: {e}")))?;
    if !output.status.success() {
        return Err(Error::Internal(format!(
            "hls transcode failed ({}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(playlist)
}

/// Pre-encoded multi-bitrate rendition: one variant directory per height
/// plus a master playlist referencing them.
pub fn run_hls_mbr_transcode(source: &Path, heights: &[u32], dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    for &height in heights {
        run_hls_transcode(source, height, &dir.join(format!("{height}p")))?;
    }
    let master = dir.join("master.m3u8");
    std::fs::write(&master, master_playlist(heights))?;
    Ok(master)
}

/// Master playlist body for the given variant heights.
pub fn master_playlist(heights: &[u32]) -> String {
    let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
    for &height in heights {
        out.push_str(&format!(
            "#EXT-X-STREAM-INF:BANDWIDTH={},NAME=\"{height}p\"\n{height}p/playlist.m3u8\n",
            bandwidth_for_height(height)
        ));
    }
    out
}

fn bandwidth_for_height(height: u32) -> u64 {
    match height {
        0..=160 => 300_000,
        161..=320 => 700_000,
        321..=640 => 1_500_000,
        641..=1080 => 4_000_000,
        _ => 12_000_000,
    }
}

/// Wait until the playlist in `dir` is serveable: at least
/// `min_segments` segments on disk, or the encode already finished
/// (`#EXT-X-ENDLIST`). Polls every 200 ms up to `timeout`.
pub fn wait_for_playlist(dir: &Path, min_segments: usize, timeout: Duration) -> Result<PathBuf> {
    let playlist = dir.join("playlist.m3u8");
    let deadline = Instant::now() + timeout;
    loop {
        if playlist.is_file() {
            if list_segments(dir).len() >= min_segments {
                return Ok(playlist);
            }
            if std::fs::read_to_string(&playlist)
                .map(|content| content.contains("#EXT-X-ENDLIST"))
                .unwrap_or(false)
            {
                return Ok(playlist);
            }
        }
        if Instant::now() >= deadline {
            return Err(Error::Internal(format!(
                "timed out waiting for segments in {dir:?}"
            )));
        }
        std::thread::sleep(SEGMENT_POLL);
    }
}

/// Completed segment files in filename order.
pub fn list_segments(dir: &Path) -> Vec<String> {
    let mut segments: Vec<String> = std::fs::read_dir(dir)
        .into_iter()
        .flatten()
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| name.starts_with("segment_") && name.ends_with(".ts"))
        .collect();
    segments.sort();
    segments
}

/// Rewrite every URI line of a playlist (segment files in media
/// playlists, variant playlists in masters) through `rewrite`; tag lines
/// and blanks pass through untouched.
pub fn rewrite_playlist(content: &str, rewrite: impl Fn(&str) -> String) -> String {
    let mut out = String::with_capacity(content.len());
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            out.push_str(line);
        } else {
            out.push_str(&rewrite(trimmed));
        }
        out.push('\n');
    }
    out
}
