use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::Serialize;

use crate::index::filter::GeoBounds;
use crate::index::record::FullRecord;

/// Beyond this many day buckets the histogram flips to calendar months,
/// keeping bucket spans well under the 28-day switch point.
const MAX_DAY_BUCKETS: i64 = 120;

pub const DEFAULT_CLUSTER_SIZE: usize = 16;

const DAY_MS: i64 = 86_400_000;
/// Nominal month span; calendar months vary, clients only use this for
/// bar widths.
const MONTH_MS: i64 = 30 * DAY_MS;

#[derive(Debug, Clone, Serialize)]
pub struct DateRangeResult {
    pub min_date: Option<DateTime<Utc>>,
    pub max_date: Option<DateTime<Utc>>,
}

/// Min/max effective date across the filtered records.
pub fn date_range(survivors: &[&FullRecord]) -> DateRangeResult {
    let dates = survivors.iter().map(|r| r.effective_date());
    DateRangeResult {
        min_date: dates.clone().min(),
        max_date: dates.max(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Grouping {
    Day,
    Month,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistogramBucket {
    pub start: DateTime<Utc>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DateHistogram {
    pub buckets: Vec<HistogramBucket>,
    pub bucket_size_ms: i64,
    pub min_date: Option<DateTime<Utc>>,
    pub max_date: Option<DateTime<Utc>>,
    pub grouping: Grouping,
}

/// Bucket the filtered records by effective date. Day buckets while the
/// span stays readable, calendar months beyond that; buckets are dense
/// (empty ones included) so clients can draw a continuous axis.
pub fn date_histogram(survivors: &[&FullRecord]) -> DateHistogram {
    let dates: Vec<DateTime<Utc>> = survivors.iter().map(|r| r.effective_date()).collect();
    let (Some(&min), Some(&max)) = (dates.iter().min(), dates.iter().max()) else {
        return DateHistogram {
            buckets: Vec::new(),
            bucket_size_ms: DAY_MS,
            min_date: None,
            max_date: None,
            grouping: Grouping::Day,
        };
    };

    let span_days = (max.date_naive() - min.date_naive()).num_days();
    let grouping = if span_days <= MAX_DAY_BUCKETS {
        Grouping::Day
    } else {
        Grouping::Month
    };

    let buckets = match grouping {
        Grouping::Day => day_buckets(&dates, min.date_naive(), max.date_naive()),
        Grouping::Month => month_buckets(&dates, min.date_naive(), max.date_naive()),
    };

    DateHistogram {
        buckets,
        bucket_size_ms: match grouping {
            Grouping::Day => DAY_MS,
            Grouping::Month => MONTH_MS,
        },
        min_date: Some(min),
        max_date: Some(max),
        grouping,
    }
}

fn day_buckets(dates: &[DateTime<Utc>], min: NaiveDate, max: NaiveDate) -> Vec<HistogramBucket> {
    let mut counts: BTreeMap<NaiveDate, usize> = BTreeMap::new();
    let mut day = min;
    while day <= max {
        counts.insert(day, 0);
        day = day + Duration::days(1);
    }
    for date in dates {
        *counts.entry(date.date_naive()).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .map(|(day, count)| HistogramBucket {
            start: day.and_hms_opt(0, 0, 0).unwrap().and_utc(),
            count,
        })
        .collect()
}

fn month_buckets(dates: &[DateTime<Utc>], min: NaiveDate, max: NaiveDate) -> Vec<HistogramBucket> {
    let month_start = |d: NaiveDate| NaiveDate::from_ymd_opt(d.year(), d.month(), 1).unwrap();
    let next_month = |d: NaiveDate| {
        if d.month() == 12 {
            NaiveDate::from_ymd_opt(d.year() + 1, 1, 1).unwrap()
        } else {
            NaiveDate::from_ymd_opt(d.year(), d.month() + 1, 1).unwrap()
        }
    };

    let mut counts: BTreeMap<NaiveDate, usize> = BTreeMap::new();
    let mut month = month_start(min);
    let last = month_start(max);
    loop {
        counts.insert(month, 0);
        if month == last {
            break;
        }
        month = next_month(month);
    }
    for date in dates {
        *counts.entry(month_start(date.date_naive())).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .map(|(month, count)| HistogramBucket {
            start: month.and_hms_opt(0, 0, 0).unwrap().and_utc(),
            count,
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoCluster {
    pub latitude: f64,
    pub longitude: f64,
    pub count: usize,
    pub sample_path: String,
    pub sample_name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoClusters {
    pub clusters: Vec<GeoCluster>,
    /// Set when more geotagged records matched than were clustered.
    pub truncated: bool,
    pub total: usize,
}

/// Grid-bucket the geotagged records into `cluster_size × cluster_size`
/// cells over the filter bounding box (or the data's own bounds when the
/// filter has none). At most `page_size` records are clustered; the
/// `truncated` bit reports when that cap was hit.
pub fn geo_clusters(
    survivors: &[&FullRecord],
    bounds: Option<GeoBounds>,
    page_size: usize,
    cluster_size: Option<usize>,
) -> GeoClusters {
    let cluster_size = cluster_size.unwrap_or(DEFAULT_CLUSTER_SIZE).max(1);
    let page_size = page_size.max(1);

    let geotagged: Vec<(&FullRecord, f64, f64)> = survivors
        .iter()
        .filter_map(|r| r.metadata.location.map(|l| (*r, l.lat, l.lon)))
        .collect();
    let total = geotagged.len();
    let considered = &geotagged[..total.min(page_size)];

    if considered.is_empty() {
        return GeoClusters {
            clusters: Vec::new(),
            truncated: false,
            total,
        };
    }

    // A crossing box shifts longitudes into a contiguous [0, width) space
    // so cell arithmetic never sees the discontinuity at ±180.
    let crossing = bounds.map(|b| b.crosses_antimeridian()).unwrap_or(false);
    let shift = |lon: f64, west: f64| -> f64 {
        if crossing {
            (lon - west).rem_euclid(360.0)
        } else {
            lon - west
        }
    };

    let (south, north, west, lon_width) = match bounds {
        Some(b) => {
            let south = finite_or(b.min_lat, || data_min(considered, |(_, lat, _)| *lat));
            let north = finite_or(b.max_lat, || data_max(considered, |(_, lat, _)| *lat));
            let west = finite_or(b.min_lon, || data_min(considered, |(_, _, lon)| *lon));
            let width = if crossing {
                (180.0 - west) + (b.max_lon + 180.0)
            } else {
                finite_or(b.max_lon, || data_max(considered, |(_, _, lon)| *lon)) - west
            };
            (south, north, west, width)
        }
        None => {
            let west = data_min(considered, |(_, _, lon)| *lon);
            (
                data_min(considered, |(_, lat, _)| *lat),
                data_max(considered, |(_, lat, _)| *lat),
                west,
                data_max(considered, |(_, _, lon)| *lon) - west,
            )
        }
    };

    let lat_step = ((north - south) / cluster_size as f64).max(f64::EPSILON);
    let lon_step = (lon_width / cluster_size as f64).max(f64::EPSILON);

    struct Cell {
        lat_sum: f64,
        lon_sum: f64,
        count: usize,
        sample_path: String,
        sample_name: String,
    }

    let mut cells: BTreeMap<(usize, usize), Cell> = BTreeMap::new();
    for (record, lat, lon) in considered {
        let row = (((lat - south) / lat_step) as usize).min(cluster_size - 1);
        let col = ((shift(*lon, west) / lon_step) as usize).min(cluster_size - 1);
        let cell = cells.entry((row, col)).or_insert_with(|| Cell {
            lat_sum: 0.0,
            lon_sum: 0.0,
            count: 0,
            sample_path: record.relative_path.clone(),
            sample_name: record.name.clone(),
        });
        cell.lat_sum += lat;
        cell.lon_sum += shift(*lon, west);
        cell.count += 1;
    }

    let clusters = cells
        .into_values()
        .map(|cell| {
            let mut longitude = cell.lon_sum / cell.count as f64 + west;
            if longitude > 180.0 {
                longitude -= 360.0;
            }
            GeoCluster {
                latitude: cell.lat_sum / cell.count as f64,
                longitude,
                count: cell.count,
                sample_path: cell.sample_path,
                sample_name: cell.sample_name,
            }
        })
        .collect();

    GeoClusters {
        clusters,
        truncated: total > considered.len(),
        total,
    }
}

fn finite_or(value: f64, fallback: impl FnOnce() -> f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        fallback()
    }
}

fn data_min<T>(items: &[T], f: impl Fn(&T) -> f64) -> f64 {
    items.iter().map(f).fold(f64::INFINITY, f64::min)
}

fn data_max<T>(items: &[T], f: impl Fn(&T) -> f64) -> f64 {
    items.iter().map(f).fold(f64::NEG_INFINITY, f64::max)
}
