pub mod format;
pub mod image;
pub mod video;

pub use self::image::extract_image_metadata;
pub use self::video::probe_video;
