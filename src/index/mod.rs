pub mod aggregate;
pub mod filter;
pub mod query;
pub mod record;
pub mod store;

pub use record::{FileRecord, FullRecord, MediaMetadata, Stage};
pub use store::IndexStore;
