//! Content-addressed file store.

use std::collections::HashMap;
use std::path::PathBuf;

use sha2::{Digest, Sha256};

use nimbus_protocol::FileDescriptor;

use crate::error::DeployError;

/// One file's content plus identity.
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Hex SHA-256 of `data`; identifies the content regardless of path.
    pub sha: String,
    pub path: PathBuf,
    pub data: Vec<u8>,
}

/// Immutable mapping from content hash to file entry, built once per
/// deployment session. Identical contents at different paths collapse
/// into a single entry, so each content is described and uploaded once.
#[derive(Debug, Default)]
pub struct FileStore {
    entries: HashMap<String, FileEntry>,
}

impl FileStore {
    /// Reads and hashes every path into a store.
    pub fn hash_files(paths: &[PathBuf]) -> Result<Self, DeployError> {
        let mut entries = HashMap::new();
        for path in paths {
            let data = std::fs::read(path)?;
            let sha = digest(&data);
            entries.insert(
                sha.clone(),
                FileEntry {
                    sha,
                    path: path.clone(),
                    data,
                },
            );
        }
        Ok(Self { entries })
    }

    pub fn get(&self, sha: &str) -> Option<&FileEntry> {
        self.entries.get(sha)
    }

    pub fn contains(&self, sha: &str) -> bool {
        self.entries.contains_key(sha)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Manifest descriptors, sorted by hash for a deterministic handshake.
    pub fn descriptors(&self) -> Vec<FileDescriptor> {
        let mut out: Vec<FileDescriptor> = self
            .entries
            .values()
            .map(|e| FileDescriptor {
                sha: e.sha.clone(),
                size: e.data.len() as u64,
            })
            .collect();
        out.sort_by(|a, b| a.sha.cmp(&b.sha));
        out
    }
}

/// Hex SHA-256 of `data`.
pub fn digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn digest_is_stable_hex_sha256() {
        let sha = digest(b"hello");
        assert_eq!(
            sha,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn identical_contents_collapse_to_one_entry() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("copy.txt");
        let c = dir.path().join("other.txt");
        fs::write(&a, b"same bytes").unwrap();
        fs::write(&b, b"same bytes").unwrap();
        fs::write(&c, b"different").unwrap();

        let store = FileStore::hash_files(&[a, b, c]).unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.contains(&digest(b"same bytes")));
        assert!(store.contains(&digest(b"different")));
        assert_eq!(store.descriptors().len(), 2);
    }

    #[test]
    fn descriptors_carry_sizes_and_sort_by_hash() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        fs::write(&a, vec![1u8; 10]).unwrap();
        fs::write(&b, vec![2u8; 20]).unwrap();

        let store = FileStore::hash_files(&[a, b]).unwrap();
        let descriptors = store.descriptors();
        assert_eq!(descriptors.len(), 2);
        let mut sizes: Vec<u64> = descriptors.iter().map(|d| d.size).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![10, 20]);
        assert!(descriptors[0].sha < descriptors[1].sha);
    }

    #[test]
    fn unreadable_path_is_an_io_error() {
        let result = FileStore::hash_files(&[PathBuf::from("/nonexistent/file.txt")]);
        assert!(matches!(result, Err(DeployError::Io(_))));
    }
}
