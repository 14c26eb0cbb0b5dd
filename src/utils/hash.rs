use std::path::{Path, PathBuf};

/// Absolute form of `path`, resolving symlinks when the file exists.
pub fn absolute_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// BLAKE3 digest of the absolute source path, used as the cache key for
/// every artifact derived from that source. The path is made absolute
/// lexically, so the key does not change once the source is gone.
pub fn hash_path(path: &Path) -> String {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut hasher = blake3::Hasher::new();
    hasher.update(absolute.as_os_str().as_encoded_bytes());
    hasher.finalize().to_hex().to_string()
}
