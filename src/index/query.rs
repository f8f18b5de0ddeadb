use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::index::filter::FilterNode;
use crate::index::record::{FileRecord, FullRecord};

const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortBy {
    Name,
    DateTaken,
    DateCreated,
    Rating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryOptions {
    pub sort_by: Option<SortBy>,
    pub order: Option<SortOrder>,
    /// 1-indexed.
    pub page: Option<usize>,
    pub page_size: Option<usize>,
    /// Metadata keys to project. `None` omits metadata entirely;
    /// an empty list projects an empty metadata object.
    pub metadata: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryItem {
    pub relative_path: String,
    pub directory: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub items: Vec<QueryItem>,
    /// Filtered (pre-pagination) count.
    pub total: usize,
    pub page: usize,
}

/// Evaluate a query: filter (non-Full records never survive), sort,
/// paginate, project.
pub fn run(
    records: &[FileRecord],
    filter: Option<&FilterNode>,
    options: &QueryOptions,
) -> QueryResult {
    let mut survivors: Vec<&FullRecord> = records
        .iter()
        .filter_map(FileRecord::as_full)
        .filter(|r| filter.map_or(true, |f| f.matches(r)))
        .collect();

    sort_records(&mut survivors, options);

    let total = survivors.len();
    let page = options.page.unwrap_or(1).max(1);
    let page_size = options.page_size.unwrap_or(DEFAULT_PAGE_SIZE).max(1);
    let start = (page - 1).saturating_mul(page_size);

    let items = survivors
        .into_iter()
        .skip(start)
        .take(page_size)
        .map(|r| project(r, options.metadata.as_deref()))
        .collect();

    QueryResult { items, total, page }
}

/// Select the records surviving the filter, unsorted. Aggregations build
/// on this instead of the paginated pipeline.
pub fn survivors<'a>(records: &'a [FileRecord], filter: Option<&FilterNode>) -> Vec<&'a FullRecord> {
    records
        .iter()
        .filter_map(FileRecord::as_full)
        .filter(|r| filter.map_or(true, |f| f.matches(r)))
        .collect()
}

enum SortKey {
    Text(String),
    Date(DateTime<Utc>),
    Number(f64),
}

fn sort_key(record: &FullRecord, by: SortBy) -> Option<SortKey> {
    match by {
        SortBy::Name => Some(SortKey::Text(record.name.to_lowercase())),
        SortBy::DateTaken => record.metadata.date_taken.map(SortKey::Date),
        SortBy::DateCreated => record.date_created.map(SortKey::Date),
        SortBy::Rating => record.metadata.rating.map(SortKey::Number),
    }
}

fn compare_keys(a: &SortKey, b: &SortKey) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (SortKey::Text(a), SortKey::Text(b)) => a.cmp(b),
        (SortKey::Date(a), SortKey::Date(b)) => a.cmp(b),
        (SortKey::Number(a), SortKey::Number(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
        // Mixed key kinds cannot happen for a single sortBy.
        _ => Ordering::Equal,
    }
}

fn sort_records(records: &mut [&FullRecord], options: &QueryOptions) {
    let by = options.sort_by.unwrap_or(SortBy::Name);
    let descending = options.order == Some(SortOrder::Desc);

    records.sort_by(|a, b| {
        use std::cmp::Ordering;
        let primary = match (sort_key(a, by), sort_key(b, by)) {
            (Some(ka), Some(kb)) => {
                let ord = compare_keys(&ka, &kb);
                if descending {
                    ord.reverse()
                } else {
                    ord
                }
            }
            // Missing sort values go last regardless of order.
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        // Ties break by name then path, always ascending.
        primary
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
            .then_with(|| a.relative_path.cmp(&b.relative_path))
    });
}

/// Project the requested metadata keys onto an item. `size`, `mime_type`
/// and `date_created` are promoted from the record into the metadata view
/// when requested; absent keys are omitted.
fn project(record: &FullRecord, keys: Option<&[String]>) -> QueryItem {
    let metadata = keys.map(|keys| {
        let mut map = serde_json::Map::new();
        for key in keys {
            let canonical = canonical_key(key);
            if let Some(value) = metadata_value(record, &canonical) {
                map.insert(canonical, value);
            }
        }
        map
    });
    QueryItem {
        relative_path: record.relative_path.clone(),
        directory: record.directory.clone(),
        name: record.name.clone(),
        metadata,
    }
}

fn canonical_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for c in key.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

fn metadata_value(record: &FullRecord, key: &str) -> Option<Value> {
    let m = &record.metadata;
    match key {
        // Promoted from the record itself.
        "size" => Some(Value::from(record.size)),
        "mime_type" => record.mime_type.clone().map(Value::from),
        "date_created" => record.date_created.map(|d| Value::from(d.to_rfc3339())),
        "date_modified" => Some(Value::from(record.date_modified.to_rfc3339())),

        "dimensions" => m.dimensions.map(|d| serde_json::json!({"width": d.width, "height": d.height})),
        "date_taken" => m.date_taken.map(|d| Value::from(d.to_rfc3339())),
        "location" => m.location.map(|l| serde_json::json!({"lat": l.lat, "lon": l.lon})),
        "camera_make" => m.camera_make.clone().map(Value::from),
        "camera_model" => m.camera_model.clone().map(Value::from),
        "exposure_time" => m.exposure_time.clone().map(Value::from),
        "aperture" => m.aperture.clone().map(Value::from),
        "iso" => m.iso.map(Value::from),
        "focal_length" => m.focal_length.clone().map(Value::from),
        "lens" => m.lens.clone().map(Value::from),
        "rating" => m.rating.map(Value::from),
        "tags" => {
            if m.tags.is_empty() {
                None
            } else {
                Some(Value::from(m.tags.clone()))
            }
        }
        "duration" => m.duration.map(Value::from),
        "framerate" => m.framerate.map(Value::from),
        "video_codec" => m.video_codec.clone().map(Value::from),
        "audio_codec" => m.audio_codec.clone().map(Value::from),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::filter::parse_filter;
    use crate::index::record::MediaMetadata;
    use chrono::TimeZone;
    use serde_json::json;

    fn full(path: &str, f: impl FnOnce(&mut FullRecord)) -> FileRecord {
        let mut record = FullRecord {
            relative_path: path.to_string(),
            directory: crate::pathnorm::parent_dir(path),
            name: crate::pathnorm::base_name(path).to_string(),
            size: 100,
            mime_type: Some("image/jpeg".to_string()),
            date_created: None,
            date_modified: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            metadata: MediaMetadata::default(),
            last_indexed_at: Utc.timestamp_opt(1_700_000_100, 0).unwrap(),
        };
        f(&mut record);
        FileRecord::Full(record)
    }

    fn sample_set() -> Vec<FileRecord> {
        vec![
            full("b.jpg", |r| {
                r.metadata.rating = Some(2.0);
                r.metadata.date_taken = Some(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap());
            }),
            full("a.jpg", |r| {
                r.metadata.rating = Some(5.0);
                r.metadata.date_taken = Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
            }),
            full("c.jpg", |r| {
                // No rating, no date_taken: sorts last under both keys.
                r.metadata.iso = Some(100);
            }),
            FileRecord::discovered("pending.jpg".to_string(), None),
        ]
    }

    #[test]
    fn test_non_full_records_are_excluded() {
        let records = sample_set();
        let result = run(&records, None, &QueryOptions::default());
        assert_eq!(result.total, 3);
        assert!(result.items.iter().all(|i| i.relative_path != "pending.jpg"));
    }

    #[test]
    fn test_default_sort_is_name_ascending() {
        let records = sample_set();
        let result = run(&records, None, &QueryOptions::default());
        let names: Vec<&str> = result.items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["a.jpg", "b.jpg", "c.jpg"]);
    }

    #[test]
    fn test_sort_by_rating_desc_missing_last() {
        let records = sample_set();
        let options = QueryOptions {
            sort_by: Some(SortBy::Rating),
            order: Some(SortOrder::Desc),
            ..Default::default()
        };
        let result = run(&records, None, &options);
        let names: Vec<&str> = result.items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["a.jpg", "b.jpg", "c.jpg"]);

        // Ascending flips the rated records but the unrated one stays last.
        let options = QueryOptions {
            sort_by: Some(SortBy::Rating),
            order: Some(SortOrder::Asc),
            ..Default::default()
        };
        let result = run(&records, None, &options);
        let names: Vec<&str> = result.items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["b.jpg", "a.jpg", "c.jpg"]);
    }

    #[test]
    fn test_pagination_partitions_the_set() {
        let records: Vec<FileRecord> = (0..7).map(|i| full(&format!("f{i}.jpg"), |_| {})).collect();
        let mut seen = Vec::new();
        let mut page = 1;
        loop {
            let options = QueryOptions {
                page: Some(page),
                page_size: Some(3),
                ..Default::default()
            };
            let result = run(&records, None, &options);
            assert_eq!(result.total, 7);
            assert_eq!(result.page, page);
            if result.items.is_empty() {
                break;
            }
            seen.extend(result.items.iter().map(|i| i.relative_path.clone()));
            page += 1;
        }
        // Pages partition the filtered set: no overlap, full coverage.
        assert_eq!(seen.len(), 7);
        let unique: std::collections::HashSet<_> = seen.iter().collect();
        assert_eq!(unique.len(), 7);
    }

    #[test]
    fn test_page_defaults() {
        let records = sample_set();
        let result = run(&records, None, &QueryOptions::default());
        assert_eq!(result.page, 1);
        // page 0 clamps to 1
        let options = QueryOptions {
            page: Some(0),
            ..Default::default()
        };
        assert_eq!(run(&records, None, &options).page, 1);
    }

    #[test]
    fn test_filtered_result_is_subset_of_unfiltered() {
        let records = sample_set();
        let filter = parse_filter(&json!({"rating": {"min": 3}})).unwrap();
        let filtered = run(&records, Some(&filter), &QueryOptions::default());
        let all = run(&records, None, &QueryOptions::default());
        for item in &filtered.items {
            assert!(all.items.iter().any(|i| i.relative_path == item.relative_path));
        }
        assert_eq!(filtered.total, 1);
        assert_eq!(filtered.items[0].relative_path, "a.jpg");
    }

    #[test]
    fn test_projection_empty_list_yields_empty_metadata() {
        let records = sample_set();
        let options = QueryOptions {
            metadata: Some(vec![]),
            ..Default::default()
        };
        let result = run(&records, None, &options);
        for item in &result.items {
            assert_eq!(item.metadata.as_ref().unwrap().len(), 0);
        }
    }

    #[test]
    fn test_projection_selects_keys_and_promotes_record_fields() {
        let records = sample_set();
        let options = QueryOptions {
            metadata: Some(vec![
                "rating".to_string(),
                "size".to_string(),
                "mimeType".to_string(),
                "dimensions".to_string(),
            ]),
            ..Default::default()
        };
        let result = run(&records, None, &options);
        let a = &result.items[0]; // a.jpg
        let meta = a.metadata.as_ref().unwrap();
        assert_eq!(meta.get("rating"), Some(&json!(5.0)));
        assert_eq!(meta.get("size"), Some(&json!(100)));
        assert_eq!(meta.get("mime_type"), Some(&json!("image/jpeg")));
        // Absent keys are omitted, not null.
        assert!(!meta.contains_key("dimensions"));
        // Keys outside the projection never appear.
        assert!(!meta.contains_key("iso"));
    }

    #[test]
    fn test_no_projection_omits_metadata() {
        let records = sample_set();
        let result = run(&records, None, &QueryOptions::default());
        assert!(result.items.iter().all(|i| i.metadata.is_none()));
    }

    #[test]
    fn test_options_deserialize_camel_case() {
        let options: QueryOptions = serde_json::from_str(
            r#"{"sortBy": "dateTaken", "order": "desc", "pageSize": 200, "metadata": ["dateTaken"]}"#,
        )
        .unwrap();
        assert_eq!(options.sort_by, Some(SortBy::DateTaken));
        assert_eq!(options.order, Some(SortOrder::Desc));
        assert_eq!(options.page_size, Some(200));
    }
}
