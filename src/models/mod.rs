pub mod media;
pub mod tag;

pub use media::{classify, is_hidden, FileType, MediaFile, IMAGE_EXTENSIONS, VIDEO_EXTENSIONS};
pub use tag::Tag;
