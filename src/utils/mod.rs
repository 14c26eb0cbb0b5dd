pub mod hash;

pub use hash::{absolute_path, hash_path};
