use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Indexing stage of a record. A record only ever moves forward through
/// these stages; it regresses only by being removed and re-discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Discovered,
    FileInfo,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

/// Extracted media metadata. One flat struct of optionals covers both
/// families: EXIF-derived fields stay `None` for videos and codec fields
/// stay `None` for images.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<Dimensions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_taken: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub camera_make: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub camera_model: Option<String>,
    /// Formatted, e.g. `1/250s` or `2s`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exposure_time: Option<String>,
    /// Formatted, e.g. `f/2.8`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aperture: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iso: Option<u32>,
    /// Formatted, e.g. `35mm`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub focal_length: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lens: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
    /// Deduplicated, trimmed, non-empty. Use [`MediaMetadata::set_tags`].
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub framerate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_codec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_codec: Option<String>,
}

impl MediaMetadata {
    /// Store tags trimmed, non-empty and deduplicated (first occurrence
    /// wins, original casing kept).
    pub fn set_tags(&mut self, tags: impl IntoIterator<Item = String>) {
        let mut seen = std::collections::HashSet::new();
        self.tags = tags
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .filter(|t| seen.insert(t.to_lowercase()))
            .collect();
    }
}

/// Stage 1: created by the directory walk. Carries no stat results;
/// `last_indexed_at` is always null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredRecord {
    #[serde(alias = "path")]
    pub relative_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Always `null` for this stage; present so the persisted document
    /// keeps the discriminant visible.
    #[serde(default)]
    pub last_indexed_at: Option<DateTime<Utc>>,
}

/// Stage 2: `stat()` results plus MIME inference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfoRecord {
    #[serde(alias = "path")]
    pub relative_path: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_created: Option<DateTime<Utc>>,
    pub date_modified: DateTime<Utc>,
    pub last_indexed_at: DateTime<Utc>,
}

/// Stage 3: everything, including extracted metadata. Queries only ever
/// see this stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullRecord {
    #[serde(alias = "path")]
    pub relative_path: String,
    /// Parent directory portion of `relative_path` ("" at the root).
    pub directory: String,
    /// Base name portion of `relative_path`.
    pub name: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_created: Option<DateTime<Utc>>,
    pub date_modified: DateTime<Utc>,
    pub metadata: MediaMetadata,
    pub last_indexed_at: DateTime<Utc>,
}

impl FullRecord {
    /// The date a record is filtered and bucketed by:
    /// `date_taken` → `date_created` → `date_modified`.
    pub fn effective_date(&self) -> DateTime<Utc> {
        self.metadata
            .date_taken
            .or(self.date_created)
            .unwrap_or(self.date_modified)
    }
}

/// Union of the three indexing stages, keyed by `relative_path`.
///
/// Serialized untagged: a document entry is recognized by its fields, with
/// the richest shape tried first. The `path` alias on `relative_path`
/// migrates records written by older versions of the index document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileRecord {
    Full(FullRecord),
    FileInfo(FileInfoRecord),
    Discovered(DiscoveredRecord),
}

impl FileRecord {
    pub fn discovered(relative_path: String, mime_type: Option<String>) -> Self {
        FileRecord::Discovered(DiscoveredRecord {
            relative_path,
            mime_type,
            last_indexed_at: None,
        })
    }

    pub fn relative_path(&self) -> &str {
        match self {
            FileRecord::Full(r) => &r.relative_path,
            FileRecord::FileInfo(r) => &r.relative_path,
            FileRecord::Discovered(r) => &r.relative_path,
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            FileRecord::Full(_) => Stage::Full,
            FileRecord::FileInfo(_) => Stage::FileInfo,
            FileRecord::Discovered(_) => Stage::Discovered,
        }
    }

    pub fn mime_type(&self) -> Option<&str> {
        match self {
            FileRecord::Full(r) => r.mime_type.as_deref(),
            FileRecord::FileInfo(r) => r.mime_type.as_deref(),
            FileRecord::Discovered(r) => r.mime_type.as_deref(),
        }
    }

    pub fn last_indexed_at(&self) -> Option<DateTime<Utc>> {
        match self {
            FileRecord::Full(r) => Some(r.last_indexed_at),
            FileRecord::FileInfo(r) => Some(r.last_indexed_at),
            FileRecord::Discovered(_) => None,
        }
    }

    pub fn as_full(&self) -> Option<&FullRecord> {
        match self {
            FileRecord::Full(r) => Some(r),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    fn ts(s: &str) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .unwrap()
            .and_utc()
    }

    fn full(path: &str) -> FullRecord {
        FullRecord {
            relative_path: path.to_string(),
            directory: crate::pathnorm::parent_dir(path),
            name: crate::pathnorm::base_name(path).to_string(),
            size: 11,
            mime_type: Some("image/jpeg".to_string()),
            date_created: None,
            date_modified: ts("2024-03-15 10:00:00"),
            metadata: MediaMetadata::default(),
            last_indexed_at: ts("2024-03-15 10:00:01"),
        }
    }

    #[test]
    fn test_untagged_roundtrip_keeps_stage() {
        let records = vec![
            FileRecord::Discovered(DiscoveredRecord {
                relative_path: "a.jpg".to_string(),
                mime_type: Some("image/jpeg".to_string()),
                last_indexed_at: None,
            }),
            FileRecord::FileInfo(FileInfoRecord {
                relative_path: "b.jpg".to_string(),
                size: 5,
                mime_type: None,
                date_created: None,
                date_modified: ts("2024-01-01 00:00:00"),
                last_indexed_at: ts("2024-01-01 00:00:01"),
            }),
            FileRecord::Full(full("c/d.jpg")),
        ];
        let json = serde_json::to_string(&records).unwrap();
        let back: Vec<FileRecord> = serde_json::from_str(&json).unwrap();
        assert_eq!(back[0].stage(), Stage::Discovered);
        assert_eq!(back[1].stage(), Stage::FileInfo);
        assert_eq!(back[2].stage(), Stage::Full);
        assert_eq!(back, records);
    }

    #[test]
    fn test_discovered_serializes_null_discriminant() {
        let record = FileRecord::discovered("a.jpg".to_string(), None);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"last_indexed_at\":null"));
    }

    #[test]
    fn test_legacy_path_field_migrates() {
        // Index documents written before the relative_path rename carry
        // "path"; load must accept both spellings.
        let json = r#"{"path": "old/name.jpg", "last_indexed_at": null}"#;
        let record: FileRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.relative_path(), "old/name.jpg");
        assert_eq!(record.stage(), Stage::Discovered);
    }

    #[test]
    fn test_effective_date_fallback_chain() {
        let mut r = full("a.jpg");
        assert_eq!(r.effective_date(), r.date_modified);

        r.date_created = Some(ts("2024-02-01 00:00:00"));
        assert_eq!(r.effective_date(), ts("2024-02-01 00:00:00"));

        r.metadata.date_taken = Some(ts("2024-01-15 00:00:00"));
        assert_eq!(r.effective_date(), ts("2024-01-15 00:00:00"));
    }

    #[test]
    fn test_set_tags_dedups_and_trims() {
        let mut m = MediaMetadata::default();
        m.set_tags(vec![
            " Holiday ".to_string(),
            "holiday".to_string(),
            "".to_string(),
            "  ".to_string(),
            "Beach".to_string(),
        ]);
        assert_eq!(m.tags, vec!["Holiday".to_string(), "Beach".to_string()]);
    }

    #[test]
    fn test_metadata_omits_absent_fields() {
        let m = MediaMetadata {
            iso: Some(200),
            ..Default::default()
        };
        let json = serde_json::to_string(&m).unwrap();
        assert_eq!(json, r#"{"iso":200}"#);
    }
}
