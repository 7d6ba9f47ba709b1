//! Storage helpers for harvested document content on disk.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Stable storage key for a document, derived from its source URL.
pub fn content_key(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hex::encode(hasher.finalize())
}

/// Construct the storage path for document content.
///
/// Uses a two-level directory structure based on key prefix for filesystem
/// efficiency: `{documents_dir}/{key[0..2]}/{key[0..16]}.{extension}`
pub fn document_storage_path(documents_dir: &Path, key: &str, extension: &str) -> PathBuf {
    documents_dir
        .join(&key[..2])
        .join(format!("{}.{}", &key[..16], extension))
}

/// Persist a downloaded document, keyed by its source URL.
///
/// Returns the path the content was written to.
pub fn save_document(
    documents_dir: &Path,
    url: &str,
    content: &[u8],
    extension: &str,
) -> std::io::Result<PathBuf> {
    let key = content_key(url);
    let path = document_storage_path(documents_dir, &key, extension);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, content)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_content_key_is_stable() {
        let a = content_key("https://www.state.gov/16-629/");
        let b = content_key("https://www.state.gov/16-629/");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_content_key_distinguishes_urls() {
        assert_ne!(
            content_key("https://www.state.gov/16-629/"),
            content_key("https://www.state.gov/10-413")
        );
    }

    #[test]
    fn test_document_storage_path_shape() {
        let key = "abcdef1234567890abcdef1234567890";
        let path = document_storage_path(Path::new("/docs"), key, "pdf");
        assert_eq!(path, PathBuf::from("/docs/ab/abcdef1234567890.pdf"));
    }

    #[test]
    fn test_save_document_round_trip() {
        let dir = tempdir().unwrap();
        let content = b"%PDF-1.4 test";

        let path = save_document(dir.path(), "https://www.state.gov/16-629/", content, "pdf")
            .unwrap();

        assert!(path.exists());
        assert_eq!(std::fs::read(&path).unwrap(), content);
        // Two-char prefix subdirectory.
        let parent = path.parent().unwrap().file_name().unwrap();
        assert_eq!(parent.to_str().unwrap().len(), 2);
    }
}
