use chrono::{DateTime, NaiveDate, Utc};
use globset::{GlobBuilder, GlobMatcher};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::index::record::FullRecord;

/// Parsed filter expression. The JSON blob is parsed (and its globs
/// compiled) once; evaluation walks the tree per record.
#[derive(Debug)]
pub enum FilterNode {
    And(Vec<FilterNode>),
    Or(Vec<FilterNode>),
    Leaf(Box<LeafFilter>),
}

impl FilterNode {
    pub fn matches(&self, record: &FullRecord) -> bool {
        match self {
            FilterNode::And(children) => children.iter().all(|c| c.matches(record)),
            FilterNode::Or(children) => children.iter().any(|c| c.matches(record)),
            FilterNode::Leaf(leaf) => leaf.matches(record),
        }
    }
}

/// Parse a filter JSON document into a [`FilterNode`].
///
/// `{"operation": "and"|"or", "conditions": [...]}` recurses; any other
/// object is a leaf whose clauses are AND-composed. Clause keys are
/// accepted in both snake_case and camelCase since filters arrive as
/// URL-encoded JSON written by several clients.
pub fn parse_filter(value: &Value) -> Result<FilterNode> {
    let obj = value
        .as_object()
        .ok_or_else(|| Error::BadRequest("filter must be a JSON object".to_string()))?;

    if let Some(op) = obj.get("operation") {
        let op = op
            .as_str()
            .ok_or_else(|| Error::BadRequest("operation must be a string".to_string()))?;
        let conditions = obj
            .get("conditions")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::BadRequest("conditions must be an array".to_string()))?;
        let children = conditions
            .iter()
            .map(parse_filter)
            .collect::<Result<Vec<_>>>()?;
        return match op {
            "and" => Ok(FilterNode::And(children)),
            "or" => Ok(FilterNode::Or(children)),
            other => Err(Error::BadRequest(format!("unknown operation: {other}"))),
        };
    }

    Ok(FilterNode::Leaf(Box::new(parse_leaf(obj)?)))
}

// ── Leaf clauses ─────────────────────────────────────────────────────────────

#[derive(Debug)]
enum StringMatch {
    /// Case-insensitive literal equality.
    Literal(String),
    Glob(GlobMatcher),
}

impl StringMatch {
    fn parse(pattern: &str) -> Result<Self> {
        if is_glob(pattern) {
            Ok(StringMatch::Glob(compile_glob(pattern)?))
        } else {
            Ok(StringMatch::Literal(pattern.to_lowercase()))
        }
    }

    fn matches(&self, value: &str) -> bool {
        match self {
            StringMatch::Literal(lit) => value.to_lowercase() == *lit,
            StringMatch::Glob(glob) => glob.is_match(value),
        }
    }
}

/// Filename clause: a literal compares against the base name; a glob
/// containing `/` runs against the full relative path, otherwise against
/// the base name.
#[derive(Debug)]
enum FilenameMatch {
    Literal(String),
    GlobName(GlobMatcher),
    GlobPath(GlobMatcher),
}

impl FilenameMatch {
    fn parse(pattern: &str) -> Result<Self> {
        if !is_glob(pattern) {
            Ok(FilenameMatch::Literal(pattern.to_lowercase()))
        } else if pattern.contains('/') {
            Ok(FilenameMatch::GlobPath(compile_glob(pattern)?))
        } else {
            Ok(FilenameMatch::GlobName(compile_glob(pattern)?))
        }
    }

    fn matches(&self, record: &FullRecord) -> bool {
        match self {
            FilenameMatch::Literal(lit) => record.name.to_lowercase() == *lit,
            FilenameMatch::GlobName(glob) => glob.is_match(&record.name),
            FilenameMatch::GlobPath(glob) => glob.is_match(&record.relative_path),
        }
    }
}

/// Directory clause: a literal matches the directory itself and all of
/// its descendants; the empty string matches only the root.
#[derive(Debug)]
enum DirectoryMatch {
    Literal(String),
    Glob(GlobMatcher),
}

impl DirectoryMatch {
    fn parse(pattern: &str) -> Result<Self> {
        if is_glob(pattern) {
            Ok(DirectoryMatch::Glob(compile_glob(pattern)?))
        } else {
            Ok(DirectoryMatch::Literal(pattern.to_lowercase()))
        }
    }

    fn matches(&self, directory: &str) -> bool {
        match self {
            DirectoryMatch::Literal(lit) if lit.is_empty() => directory.is_empty(),
            DirectoryMatch::Literal(lit) => {
                let dir = directory.to_lowercase();
                dir == *lit || dir.starts_with(&format!("{lit}/"))
            }
            DirectoryMatch::Glob(glob) => glob.is_match(directory),
        }
    }
}

/// Inclusive bounding box; unset sides default to ±∞. When the box
/// crosses the antimeridian (west > east) the longitude test becomes
/// `[west, 180] ∪ [-180, east]`.
#[derive(Debug, Clone, Copy)]
pub struct GeoBounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl GeoBounds {
    fn parse(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::BadRequest("location must be an object".to_string()))?;
        let side = |keys: [&str; 2], default: f64| -> Result<f64> {
            for key in keys {
                if let Some(v) = obj.get(key) {
                    return v.as_f64().ok_or_else(|| {
                        Error::BadRequest(format!("location.{key} must be a number"))
                    });
                }
            }
            Ok(default)
        };
        Ok(GeoBounds {
            min_lat: side(["minLat", "min_lat"], f64::NEG_INFINITY)?,
            max_lat: side(["maxLat", "max_lat"], f64::INFINITY)?,
            min_lon: side(["minLon", "min_lon"], f64::NEG_INFINITY)?,
            max_lon: side(["maxLon", "max_lon"], f64::INFINITY)?,
        })
    }

    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        if lat < self.min_lat || lat > self.max_lat {
            return false;
        }
        if self.min_lon > self.max_lon {
            lon >= self.min_lon || lon <= self.max_lon
        } else {
            lon >= self.min_lon && lon <= self.max_lon
        }
    }

    pub fn crosses_antimeridian(&self) -> bool {
        self.min_lon > self.max_lon
    }
}

#[derive(Debug)]
struct DateRange {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

#[derive(Debug)]
enum RatingFilter {
    /// OR of exact equalities.
    Values(Vec<f64>),
    /// Inclusive range.
    Range { min: Option<f64>, max: Option<f64> },
}

#[derive(Debug)]
enum Predicate {
    Range { min: Option<Value>, max: Option<Value> },
    StartsWith(String),
    NotStartsWith(String),
    Equals(Value),
    /// `null` literal: matches records missing the field.
    Null,
}

#[derive(Debug, Default)]
pub struct LeafFilter {
    path: Vec<StringMatch>,
    filename: Vec<FilenameMatch>,
    directory: Vec<DirectoryMatch>,
    mime_type: Vec<StringMatch>,
    camera_make: Vec<String>,
    camera_model: Vec<String>,
    location: Option<GeoBounds>,
    date_range: Option<DateRange>,
    rating: Option<RatingFilter>,
    tags: Vec<String>,
    tags_match_all: bool,
    q: Option<String>,
    predicates: Vec<(String, Predicate)>,
}

fn parse_leaf(obj: &serde_json::Map<String, Value>) -> Result<LeafFilter> {
    let mut leaf = LeafFilter::default();
    for (key, value) in obj {
        match key.as_str() {
            "path" => leaf.path = parse_patterns(value, StringMatch::parse)?,
            "filename" => leaf.filename = parse_patterns(value, FilenameMatch::parse)?,
            "directory" => leaf.directory = parse_patterns(value, DirectoryMatch::parse)?,
            "mime_type" | "mimeType" => leaf.mime_type = parse_patterns(value, StringMatch::parse)?,
            "camera_make" | "cameraMake" => leaf.camera_make = parse_lowercase_list(key, value)?,
            "camera_model" | "cameraModel" => leaf.camera_model = parse_lowercase_list(key, value)?,
            "location" => leaf.location = Some(GeoBounds::parse(value)?),
            "date_range" | "dateRange" => leaf.date_range = Some(parse_date_range(value)?),
            "rating" => leaf.rating = Some(parse_rating(value)?),
            "tags" => leaf.tags = parse_lowercase_list(key, value)?,
            "tags_match_all" | "tagsMatchAll" => {
                leaf.tags_match_all = value.as_bool().ok_or_else(|| {
                    Error::BadRequest("tags_match_all must be a boolean".to_string())
                })?
            }
            "q" => {
                let q = value
                    .as_str()
                    .ok_or_else(|| Error::BadRequest("q must be a string".to_string()))?
                    .trim()
                    .to_lowercase();
                if !q.is_empty() {
                    leaf.q = Some(q);
                }
            }
            // Anything else is a scalar-field predicate leaf.
            other => leaf
                .predicates
                .push((normalize_field_key(other), parse_predicate(other, value)?)),
        }
    }
    Ok(leaf)
}

fn parse_patterns<T>(value: &Value, parse: fn(&str) -> Result<T>) -> Result<Vec<T>> {
    let items = value
        .as_array()
        .ok_or_else(|| Error::BadRequest("expected an array of patterns".to_string()))?;
    items
        .iter()
        .map(|v| {
            v.as_str()
                .ok_or_else(|| Error::BadRequest("patterns must be strings".to_string()))
                .and_then(parse)
        })
        .collect()
}

fn parse_lowercase_list(key: &str, value: &Value) -> Result<Vec<String>> {
    let items = value
        .as_array()
        .ok_or_else(|| Error::BadRequest(format!("{key} must be an array")))?;
    items
        .iter()
        .map(|v| {
            v.as_str()
                .map(|s| s.to_lowercase())
                .ok_or_else(|| Error::BadRequest(format!("{key} entries must be strings")))
        })
        .collect()
}

fn parse_date_range(value: &Value) -> Result<DateRange> {
    let obj = value
        .as_object()
        .ok_or_else(|| Error::BadRequest("date_range must be an object".to_string()))?;
    let parse_side = |key: &str, end_of_day: bool| -> Result<Option<DateTime<Utc>>> {
        match obj.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => parse_date_bound(s, end_of_day)
                .map(Some)
                .ok_or_else(|| Error::BadRequest(format!("invalid date_range.{key}: {s}"))),
            Some(_) => Err(Error::BadRequest(format!("date_range.{key} must be a string"))),
        }
    };
    Ok(DateRange {
        start: parse_side("start", false)?,
        end: parse_side("end", true)?,
    })
}

/// Accept RFC3339 timestamps or bare dates. A bare date used as the `end`
/// bound covers the whole day.
fn parse_date_bound(s: &str, end_of_day: bool) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
    let time = if end_of_day {
        date.and_hms_opt(23, 59, 59)?
    } else {
        date.and_hms_opt(0, 0, 0)?
    };
    Some(DateTime::from_naive_utc_and_offset(time, Utc))
}

fn parse_rating(value: &Value) -> Result<RatingFilter> {
    match value {
        Value::Array(items) => {
            let values = items
                .iter()
                .map(|v| {
                    v.as_f64()
                        .ok_or_else(|| Error::BadRequest("rating values must be numbers".to_string()))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(RatingFilter::Values(values))
        }
        Value::Object(obj) => Ok(RatingFilter::Range {
            min: obj.get("min").and_then(Value::as_f64),
            max: obj.get("max").and_then(Value::as_f64),
        }),
        _ => Err(Error::BadRequest(
            "rating must be an array or a {min,max} object".to_string(),
        )),
    }
}

fn parse_predicate(key: &str, value: &Value) -> Result<Predicate> {
    match value {
        Value::Null => Ok(Predicate::Null),
        Value::Object(obj) => {
            if let Some(prefix) = obj.get("startsWith") {
                let prefix = prefix.as_str().ok_or_else(|| {
                    Error::BadRequest(format!("{key}.startsWith must be a string"))
                })?;
                return Ok(Predicate::StartsWith(prefix.to_lowercase()));
            }
            if let Some(prefix) = obj.get("notStartsWith") {
                let prefix = prefix.as_str().ok_or_else(|| {
                    Error::BadRequest(format!("{key}.notStartsWith must be a string"))
                })?;
                return Ok(Predicate::NotStartsWith(prefix.to_lowercase()));
            }
            if obj.contains_key("min") || obj.contains_key("max") {
                return Ok(Predicate::Range {
                    min: obj.get("min").cloned().filter(|v| !v.is_null()),
                    max: obj.get("max").cloned().filter(|v| !v.is_null()),
                });
            }
            Err(Error::BadRequest(format!(
                "unsupported predicate for field {key}"
            )))
        }
        literal => Ok(Predicate::Equals(literal.clone())),
    }
}

fn is_glob(s: &str) -> bool {
    s.contains(['*', '?', '[', ']', '{', '}'])
}

/// Standard glob matching: case-insensitive, dotfiles included, `*`
/// crosses separators.
fn compile_glob(pattern: &str) -> Result<GlobMatcher> {
    GlobBuilder::new(pattern)
        .case_insensitive(true)
        .literal_separator(false)
        .build()
        .map(|g| g.compile_matcher())
        .map_err(|e| Error::BadRequest(format!("invalid glob {pattern:?}: {e}")))
}

fn normalize_field_key(key: &str) -> String {
    // camelCase → snake_case so predicate keys line up with record fields.
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

impl LeafFilter {
    fn matches(&self, record: &FullRecord) -> bool {
        if !self.path.is_empty() && !self.path.iter().any(|m| m.matches(&record.relative_path)) {
            return false;
        }
        if !self.filename.is_empty() && !self.filename.iter().any(|m| m.matches(record)) {
            return false;
        }
        if !self.directory.is_empty()
            && !self.directory.iter().any(|m| m.matches(&record.directory))
        {
            return false;
        }
        if !self.mime_type.is_empty() {
            let Some(mime) = record.mime_type.as_deref() else {
                return false;
            };
            if !self.mime_type.iter().any(|m| m.matches(mime)) {
                return false;
            }
        }
        if !self.camera_make.is_empty() && !field_in_list(&record.metadata.camera_make, &self.camera_make)
        {
            return false;
        }
        if !self.camera_model.is_empty()
            && !field_in_list(&record.metadata.camera_model, &self.camera_model)
        {
            return false;
        }
        if let Some(bounds) = &self.location {
            let Some(location) = record.metadata.location else {
                return false;
            };
            if !bounds.contains(location.lat, location.lon) {
                return false;
            }
        }
        if let Some(range) = &self.date_range {
            let date = record.effective_date();
            if let Some(start) = range.start {
                if date < start {
                    return false;
                }
            }
            if let Some(end) = range.end {
                if date > end {
                    return false;
                }
            }
        }
        if let Some(rating) = &self.rating {
            let Some(value) = record.metadata.rating else {
                return false;
            };
            let ok = match rating {
                RatingFilter::Values(values) => values.iter().any(|v| *v == value),
                RatingFilter::Range { min, max } => {
                    min.map_or(true, |m| value >= m) && max.map_or(true, |m| value <= m)
                }
            };
            if !ok {
                return false;
            }
        }
        if !self.tags.is_empty() {
            let record_tags: Vec<String> = record
                .metadata
                .tags
                .iter()
                .map(|t| t.to_lowercase())
                .collect();
            let ok = if self.tags_match_all {
                self.tags.iter().all(|t| record_tags.contains(t))
            } else {
                self.tags.iter().any(|t| record_tags.contains(t))
            };
            if !ok {
                return false;
            }
        }
        if let Some(q) = &self.q {
            if !search_haystack(record).contains(q.as_str()) {
                return false;
            }
        }
        for (field, predicate) in &self.predicates {
            if !predicate.matches(scalar_field(record, field).as_ref()) {
                return false;
            }
        }
        true
    }
}

fn field_in_list(value: &Option<String>, list: &[String]) -> bool {
    match value {
        Some(v) => list.contains(&v.to_lowercase()),
        None => false,
    }
}

/// The free-text token bag: path, name, directory, MIME and every scalar
/// or array metadata value, lowercased.
pub fn search_haystack(record: &FullRecord) -> String {
    let mut parts: Vec<String> = vec![
        record.relative_path.clone(),
        record.name.clone(),
        record.directory.clone(),
    ];
    if let Some(mime) = &record.mime_type {
        parts.push(mime.clone());
    }
    let m = &record.metadata;
    for s in [
        &m.camera_make,
        &m.camera_model,
        &m.exposure_time,
        &m.aperture,
        &m.focal_length,
        &m.lens,
        &m.video_codec,
        &m.audio_codec,
    ]
    .into_iter()
    .flatten()
    {
        parts.push(s.clone());
    }
    if let Some(iso) = m.iso {
        parts.push(iso.to_string());
    }
    if let Some(rating) = m.rating {
        parts.push(rating.to_string());
    }
    if let Some(date) = m.date_taken {
        parts.push(date.to_rfc3339());
    }
    parts.extend(m.tags.iter().cloned());
    parts.join(" ").to_lowercase()
}

/// Resolve a scalar field by its snake_case name for predicate leaves.
fn scalar_field(record: &FullRecord, field: &str) -> Option<Value> {
    let m = &record.metadata;
    match field {
        "relative_path" | "path" => Some(Value::from(record.relative_path.clone())),
        "name" => Some(Value::from(record.name.clone())),
        "directory" => Some(Value::from(record.directory.clone())),
        "size" => Some(Value::from(record.size)),
        "mime_type" => record.mime_type.clone().map(Value::from),
        "date_taken" => m.date_taken.map(|d| Value::from(d.to_rfc3339())),
        "date_created" => record.date_created.map(|d| Value::from(d.to_rfc3339())),
        "date_modified" => Some(Value::from(record.date_modified.to_rfc3339())),
        "camera_make" => m.camera_make.clone().map(Value::from),
        "camera_model" => m.camera_model.clone().map(Value::from),
        "exposure_time" => m.exposure_time.clone().map(Value::from),
        "aperture" => m.aperture.clone().map(Value::from),
        "iso" => m.iso.map(Value::from),
        "focal_length" => m.focal_length.clone().map(Value::from),
        "lens" => m.lens.clone().map(Value::from),
        "rating" => m.rating.map(Value::from),
        "duration" => m.duration.map(Value::from),
        "framerate" => m.framerate.map(Value::from),
        "video_codec" => m.video_codec.clone().map(Value::from),
        "audio_codec" => m.audio_codec.clone().map(Value::from),
        _ => None,
    }
}

impl Predicate {
    fn matches(&self, value: Option<&Value>) -> bool {
        match self {
            Predicate::Null => value.is_none() || value == Some(&Value::Null),
            Predicate::Equals(expected) => match value {
                Some(actual) => values_equal(actual, expected),
                None => false,
            },
            Predicate::StartsWith(prefix) => value
                .and_then(Value::as_str)
                .map(|s| s.to_lowercase().starts_with(prefix))
                .unwrap_or(false),
            // A missing value trivially does not start with the prefix.
            Predicate::NotStartsWith(prefix) => value
                .and_then(Value::as_str)
                .map(|s| !s.to_lowercase().starts_with(prefix))
                .unwrap_or(true),
            Predicate::Range { min, max } => {
                let Some(actual) = value else {
                    return false;
                };
                min.as_ref().map_or(true, |b| compare(actual, b) >= 0)
                    && max.as_ref().map_or(true, |b| compare(actual, b) <= 0)
            }
        }
    }
}

fn values_equal(actual: &Value, expected: &Value) -> bool {
    match (actual.as_str(), expected.as_str()) {
        (Some(a), Some(e)) => a.eq_ignore_ascii_case(e),
        _ => match (value_as_f64(actual), value_as_f64(expected)) {
            (Some(a), Some(e)) => a == e,
            _ => actual == expected,
        },
    }
}

/// Compare numerically when both sides coerce to numbers, lexically
/// (case-insensitive) otherwise. ISO-8601 dates order correctly under the
/// lexical branch.
fn compare(actual: &Value, bound: &Value) -> i32 {
    if let (Some(a), Some(b)) = (value_as_f64(actual), value_as_f64(bound)) {
        return if a < b {
            -1
        } else if a > b {
            1
        } else {
            0
        };
    }
    let a = actual.as_str().map(str::to_lowercase).unwrap_or_else(|| actual.to_string());
    let b = bound.as_str().map(str::to_lowercase).unwrap_or_else(|| bound.to_string());
    match a.cmp(&b) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }
}

/// Numeric coercion mirrors the extractors: numbers and numeric strings.
fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
