pub mod cache;
pub mod image;
pub mod queue;
pub mod service;
pub mod video;

/// The fixed height ladder for image variants, video posters and
/// single-stream HLS renditions.
pub const STANDARD_HEIGHTS: [u32; 5] = [160, 320, 640, 1080, 2160];

pub use cache::DerivativeCache;
pub use queue::{JobKey, JobKind, MediaQueue, Priority};
pub use service::{FetchParams, Height, MediaResponse, MediaService, Representation};
