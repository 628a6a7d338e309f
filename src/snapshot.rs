//! Source Snapshot Store — content-addressed capture and restore of an
//! experiment's source tree.
//!
//! Hashing follows `groblegark-oddjobs/crates/engine/src/runtime/handlers/command.rs`'s
//! `Sha256::digest(...)` / `format!("{:x}", ...)` idiom. Directory traversal
//! follows row's `workspace` module's recursive-walk style, reworked around
//! content addressing: every file is stored once per `(hash, relative_path)`
//! pair, and restore is a no-op for a file whose destination already
//! carries that hash (distilled spec §4.2: "restore must be idempotent").

use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::storage::Storage;
use crate::{Error, Result};

/// One captured file: its path relative to the source root, and the
/// content hash under which it is stored.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SnapshottedFile {
    pub relative_path: String,
    pub hash: String,
}

fn hash_bytes(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// Walk `root` recursively, collecting every regular file's relative path.
fn walk(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir).map_err(|e| Error::FileRead(dir.to_path_buf(), e))? {
        let entry = entry.map_err(|e| Error::FileRead(dir.to_path_buf(), e))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .map_err(|e| Error::FileRead(path.clone(), e))?;
        if file_type.is_dir() {
            walk(root, &path, out)?;
        } else if file_type.is_file() {
            out.push(
                path.strip_prefix(root)
                    .expect("entry is under root by construction")
                    .to_path_buf(),
            );
        }
    }
    Ok(())
}

/// Recursively snapshot every file under `root` into `storage`, returning
/// the manifest of `(relative_path, hash)` pairs that an experiment document
/// records as `seml.source_files`.
pub fn store_tree(storage: &Storage, root: &Path) -> Result<Vec<SnapshottedFile>> {
    let mut relative_paths = Vec::new();
    walk(root, root, &mut relative_paths)?;
    relative_paths.sort();

    let mut manifest = Vec::with_capacity(relative_paths.len());
    for relative_path in relative_paths {
        let absolute = root.join(&relative_path);
        let content = fs::read(&absolute).map_err(|e| Error::FileRead(absolute.clone(), e))?;
        let hash = hash_bytes(&content);
        let relative_str = relative_path
            .to_str()
            .ok_or_else(|| Error::NonUTF8Path(relative_path.clone()))?
            .to_string();
        storage.store_snapshot_blob(&hash, &relative_str, &content)?;
        manifest.push(SnapshottedFile {
            relative_path: relative_str,
            hash,
        });
    }
    Ok(manifest)
}

/// Restore a previously captured manifest into `to_directory`. Existing
/// files whose on-disk content already hashes to the recorded value are
/// left untouched, making repeated restores into the same directory cheap
/// and side-effect free.
pub fn restore(storage: &Storage, manifest: &[SnapshottedFile], to_directory: &Path) -> Result<()> {
    for file in manifest {
        let destination = to_directory.join(&file.relative_path);

        if let Ok(existing) = fs::read(&destination) {
            if hash_bytes(&existing) == file.hash {
                continue;
            }
        }

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::DirectoryCreate(parent.to_path_buf(), e))?;
        }

        let content = storage
            .load_snapshot_blob(&file.hash, &file.relative_path)?
            .ok_or_else(|| Error::ConfigError(format!(
                "snapshot blob {} for '{}' is missing from storage",
                file.hash, file.relative_path
            )))?;
        fs::write(&destination, content).map_err(|e| Error::FileWrite(destination.clone(), e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::parallel;
    use std::fs;

    #[test]
    #[parallel]
    fn store_and_restore_round_trip() {
        let src = assert_fs_tempdir();
        fs::create_dir_all(src.join("pkg")).unwrap();
        fs::write(src.join("main.py"), b"print('hi')\n").unwrap();
        fs::write(src.join("pkg/util.py"), b"def f(): pass\n").unwrap();

        let storage = Storage::in_memory().unwrap();
        let manifest = store_tree(&storage, &src).unwrap();
        assert_eq!(manifest.len(), 2);

        let dst = assert_fs_tempdir();
        restore(&storage, &manifest, &dst).unwrap();

        assert_eq!(fs::read(dst.join("main.py")).unwrap(), b"print('hi')\n");
        assert_eq!(fs::read(dst.join("pkg/util.py")).unwrap(), b"def f(): pass\n");
    }

    #[test]
    #[parallel]
    fn restore_is_idempotent_when_destination_already_matches() {
        let src = assert_fs_tempdir();
        fs::write(src.join("a.py"), b"a = 1\n").unwrap();

        let storage = Storage::in_memory().unwrap();
        let manifest = store_tree(&storage, &src).unwrap();

        let dst = assert_fs_tempdir();
        restore(&storage, &manifest, &dst).unwrap();
        let first_modified = fs::metadata(dst.join("a.py")).unwrap().modified().unwrap();

        std::thread::sleep(std::time::Duration::from_millis(10));
        restore(&storage, &manifest, &dst).unwrap();
        let second_modified = fs::metadata(dst.join("a.py")).unwrap().modified().unwrap();

        assert_eq!(first_modified, second_modified);
    }

    fn assert_fs_tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("seml-snapshot-test-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }
}
