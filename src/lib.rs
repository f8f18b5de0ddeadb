//! photarium — local media library indexer and on-demand derivative
//! server.
//!
//! The library watches a single media root, extracts metadata in stages
//! (discovery → file info → full metadata), persists a queryable index to
//! one JSON document, and produces display artifacts (resized images,
//! video posters, HLS renditions) lazily behind a bounded processing
//! queue. Transport is out of scope: [`Library`] exposes the typed
//! operations a thin HTTP adapter maps routes onto.

pub mod config;
pub mod derivative;
pub mod error;
pub mod index;
pub mod indexer;
pub mod metadata;
pub mod pathnorm;
pub mod status;

use serde_json::Value;

pub use config::Config;
pub use derivative::{FetchParams, MediaResponse, MediaService};
pub use error::{Error, Result};
pub use index::aggregate::{DateHistogram, DateRangeResult, GeoClusters};
pub use index::filter::GeoBounds;
pub use index::query::{QueryOptions, QueryResult};
pub use index::{FileRecord, IndexStore};
pub use indexer::{FolderIndexer, ScanStats};
pub use status::{StatusReporter, StatusSnapshot};

use derivative::{DerivativeCache, MediaQueue};
use index::filter::{parse_filter, FilterNode};
use index::record::FullRecord;

/// Everything wired together over one media root: store, indexer,
/// derivative service, processing queue and status reporter.
pub struct Library {
    config: Config,
    store: IndexStore,
    indexer: FolderIndexer,
    service: MediaService,
    status: StatusReporter,
    queue: MediaQueue,
}

impl Library {
    /// Open (or create) the library for `config.media_root`. Loads the
    /// persisted index; call [`Library::start`] to scan and watch.
    pub fn open(config: Config) -> Result<Library> {
        config.validate()?;
        let store = IndexStore::open(config.index_file());
        let status = StatusReporter::new();
        status.set_database_size(store.len());
        let queue = MediaQueue::new(config.queue_workers);
        let cache = DerivativeCache::new(config.cache_dir());
        let indexer = FolderIndexer::new(&config, store.clone(), status.clone());
        let service = MediaService::new(
            config.media_root.clone(),
            config.route_prefix.clone(),
            store.clone(),
            cache,
            queue.clone(),
            config.cache_max_bytes,
        );
        Ok(Library {
            config,
            store,
            indexer,
            service,
            status,
            queue,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn indexer(&self) -> &FolderIndexer {
        &self.indexer
    }

    pub fn service(&self) -> &MediaService {
        &self.service
    }

    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    pub fn status(&self) -> &StatusReporter {
        &self.status
    }

    /// Scan the media root and attach the watcher (per configuration).
    pub fn start(&self) -> Result<ScanStats> {
        self.indexer.start()
    }

    /// Stop watching, flush the index, drain the processing queue.
    pub fn shutdown(&self) {
        self.indexer.stop(true);
        self.queue.shutdown();
    }

    /// Query records under `directory` (the whole library when `None`).
    /// `filter_json` is the raw filter document from the request.
    pub fn query(
        &self,
        directory: Option<&str>,
        include_subfolders: bool,
        filter_json: Option<&Value>,
        options: &QueryOptions,
    ) -> Result<QueryResult> {
        let filter = parse_optional_filter(filter_json)?;
        let records = self.scoped_records(directory, include_subfolders)?;
        Ok(index::query::run(&records, filter.as_ref(), options))
    }

    pub fn aggregate_date_range(
        &self,
        directory: Option<&str>,
        include_subfolders: bool,
        filter_json: Option<&Value>,
    ) -> Result<DateRangeResult> {
        let filter = parse_optional_filter(filter_json)?;
        let records = self.scoped_records(directory, include_subfolders)?;
        let survivors = index::query::survivors(&records, filter.as_ref());
        Ok(index::aggregate::date_range(&survivors))
    }

    pub fn aggregate_date_histogram(
        &self,
        directory: Option<&str>,
        include_subfolders: bool,
        filter_json: Option<&Value>,
    ) -> Result<DateHistogram> {
        let filter = parse_optional_filter(filter_json)?;
        let records = self.scoped_records(directory, include_subfolders)?;
        let survivors = index::query::survivors(&records, filter.as_ref());
        Ok(index::aggregate::date_histogram(&survivors))
    }

    /// Grid clustering of geotagged records, optionally bounded by the
    /// map viewport.
    pub fn geo_clusters(
        &self,
        directory: Option<&str>,
        include_subfolders: bool,
        filter_json: Option<&Value>,
        bounds: Option<GeoBounds>,
        page_size: usize,
        cluster_size: Option<usize>,
    ) -> Result<GeoClusters> {
        let filter = parse_optional_filter(filter_json)?;
        let records = self.scoped_records(directory, include_subfolders)?;
        let survivors = index::query::survivors(&records, filter.as_ref());
        let survivors: Vec<&FullRecord> = match bounds {
            Some(b) => survivors
                .into_iter()
                .filter(|r| {
                    r.metadata
                        .location
                        .is_some_and(|l| b.contains(l.lat, l.lon))
                })
                .collect(),
            None => survivors,
        };
        Ok(index::aggregate::geo_clusters(
            &survivors,
            bounds,
            page_size,
            cluster_size,
        ))
    }

    /// Single-file access: originals and derivatives.
    pub fn fetch_media(&self, path: &str, params: &FetchParams) -> Result<MediaResponse> {
        self.service.fetch(path, params)
    }

    /// One-level folder listing for the folders surface.
    pub fn list_folders(&self, path: &str) -> Result<Vec<String>> {
        self.indexer.list_subfolders(path)
    }

    pub fn status_snapshot(&self) -> StatusSnapshot {
        self.status.snapshot()
    }

    pub fn status_stream(&self) -> std::sync::mpsc::Receiver<StatusSnapshot> {
        self.status.subscribe()
    }

    fn scoped_records(
        &self,
        directory: Option<&str>,
        include_subfolders: bool,
    ) -> Result<Vec<FileRecord>> {
        let records = self.store.list();
        let Some(raw) = directory else {
            return Ok(records);
        };
        let scope = pathnorm::normalize_dir(raw)?;
        Ok(records
            .into_iter()
            .filter(|record| match record.as_full() {
                Some(full) => dir_in_scope(&full.directory, &scope, include_subfolders),
                None => false,
            })
            .collect())
    }
}

fn dir_in_scope(directory: &str, scope: &str, include_subfolders: bool) -> bool {
    if scope.is_empty() {
        return include_subfolders || directory.is_empty();
    }
    directory == scope
        || (include_subfolders && directory.starts_with(&format!("{scope}/")))
}

fn parse_optional_filter(filter_json: Option<&Value>) -> Result<Option<FilterNode>> {
    filter_json.map(parse_filter).transpose()
}
