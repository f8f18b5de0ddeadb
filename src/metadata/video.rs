use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::index::record::{Dimensions, MediaMetadata};

/// Probe a video file with `ffprobe` and map the result onto the shared
/// metadata struct (dimensions, duration, framerate, codecs).
///
/// Like the image extractor this never fails the caller: probe errors are
/// logged and `None` comes back so the indexer still writes baseline stats.
pub fn probe_video(path: &Path) -> Option<MediaMetadata> {
    match run_ffprobe(path) {
        Ok(meta) => Some(meta),
        Err(e) => {
            tracing::warn!("ffprobe failed for {:?}: {:#}", path, e);
            None
        }
    }
}

fn ffprobe_binary() -> String {
    std::env::var("FFPROBE_PATH").unwrap_or_else(|_| "ffprobe".to_string())
}

fn run_ffprobe(path: &Path) -> Result<MediaMetadata> {
    let output = Command::new(ffprobe_binary())
        .arg("-v")
        .arg("error")
        .arg("-print_format")
        .arg("json")
        .arg("-show_format")
        .arg("-show_streams")
        .arg(path.as_os_str())
        .output()
        .with_context(|| format!("failed to run ffprobe on {}", path.display()))?;

    if !output.status.success() {
        anyhow::bail!(
            "ffprobe exited with {} for {}: {}",
            output.status,
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let parsed: ProbeOutput = serde_json::from_slice(&output.stdout)
        .with_context(|| format!("unparseable ffprobe output for {}", path.display()))?;
    Ok(metadata_from_probe(parsed))
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    format: Option<ProbeFormat>,
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    #[serde(default)]
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    #[serde(default)]
    codec_type: Option<String>,
    #[serde(default)]
    codec_name: Option<String>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    avg_frame_rate: Option<String>,
    #[serde(default)]
    r_frame_rate: Option<String>,
    #[serde(default)]
    duration: Option<String>,
}

fn metadata_from_probe(probe: ProbeOutput) -> MediaMetadata {
    let mut meta = MediaMetadata::default();

    let video = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));
    let audio = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"));

    if let Some(v) = video {
        if let (Some(width), Some(height)) = (v.width, v.height) {
            if width > 0 && height > 0 {
                meta.dimensions = Some(Dimensions { width, height });
            }
        }
        meta.video_codec = v.codec_name.clone();
        meta.framerate = v
            .avg_frame_rate
            .as_deref()
            .and_then(parse_frame_rate)
            .or_else(|| v.r_frame_rate.as_deref().and_then(parse_frame_rate));
    }
    if let Some(a) = audio {
        meta.audio_codec = a.codec_name.clone();
    }

    meta.duration = probe
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .and_then(|d| d.trim().parse::<f64>().ok())
        .or_else(|| {
            video
                .and_then(|v| v.duration.as_deref())
                .and_then(|d| d.trim().parse::<f64>().ok())
        })
        .filter(|d| d.is_finite() && *d >= 0.0);

    meta
}

/// Reduce an ffprobe `num/den` frame-rate string to a float. A zero
/// denominator (ffprobe's "unknown") and non-finite or non-positive
/// results are rejected.
pub fn parse_frame_rate(s: &str) -> Option<f64> {
    let s = s.trim();
    let value = match s.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => s.parse().ok()?,
    };
    if value.is_finite() && value > 0.0 {
        Some(value)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame_rate() {
        assert_eq!(parse_frame_rate("30000/1001"), Some(30000.0 / 1001.0));
        assert_eq!(parse_frame_rate("25/1"), Some(25.0));
        assert_eq!(parse_frame_rate("24"), Some(24.0));
        // ffprobe reports 0/0 for streams with no frame rate
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("30/0"), None);
        assert_eq!(parse_frame_rate("0/1"), None);
        assert_eq!(parse_frame_rate("garbage"), None);
    }

    #[test]
    fn test_metadata_from_probe_output() {
        let json = r#"{
            "streams": [
                {"codec_type": "video", "codec_name": "h264",
                 "width": 1920, "height": 1080,
                 "avg_frame_rate": "30000/1001", "r_frame_rate": "30/1"},
                {"codec_type": "audio", "codec_name": "aac"}
            ],
            "format": {"duration": "30.033000"}
        }"#;
        let probe: ProbeOutput = serde_json::from_str(json).unwrap();
        let meta = metadata_from_probe(probe);

        assert_eq!(
            meta.dimensions,
            Some(Dimensions {
                width: 1920,
                height: 1080
            })
        );
        assert_eq!(meta.video_codec.as_deref(), Some("h264"));
        assert_eq!(meta.audio_codec.as_deref(), Some("aac"));
        assert!((meta.duration.unwrap() - 30.033).abs() < 1e-9);
        assert!((meta.framerate.unwrap() - 30000.0 / 1001.0).abs() < 1e-9);
    }

    #[test]
    fn test_framerate_falls_back_to_r_frame_rate() {
        let json = r#"{
            "streams": [
                {"codec_type": "video", "codec_name": "vp9",
                 "width": 640, "height": 360,
                 "avg_frame_rate": "0/0", "r_frame_rate": "24/1",
                 "duration": "12.5"}
            ]
        }"#;
        let probe: ProbeOutput = serde_json::from_str(json).unwrap();
        let meta = metadata_from_probe(probe);
        assert_eq!(meta.framerate, Some(24.0));
        // No format block: stream duration stands in.
        assert_eq!(meta.duration, Some(12.5));
    }

    #[test]
    fn test_empty_probe_output() {
        let probe: ProbeOutput = serde_json::from_str("{}").unwrap();
        let meta = metadata_from_probe(probe);
        assert!(meta.dimensions.is_none());
        assert!(meta.duration.is_none());
        assert!(meta.video_codec.is_none());
    }

    #[test]
    fn test_probe_missing_file_is_none() {
        // No ffprobe run succeeds on a missing path; the adapter swallows
        // the failure.
        assert!(probe_video(Path::new("/nonexistent/clip.mp4")).is_none());
    }
}
