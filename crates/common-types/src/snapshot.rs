//! Atomic JSON snapshots for persisted state.
//!
//! Every store in the server (accounts, order books, wallets) persists as a
//! single JSON document. Writes go to a temp file in the same directory,
//! fsync, then rename over the target, so a crash never leaves a torn file.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Write `bytes` to `path` atomically (temp file + fsync + rename).
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), SnapshotError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = Path::new(&tmp);

    let mut file = fs::File::create(tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(tmp, path).await?;
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub async fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), SnapshotError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes).await
}

/// Load a JSON snapshot. `Ok(None)` when the file does not exist; corrupt
/// content is an error the caller treats as fatal.
pub async fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, SnapshotError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state.json");

        let mut value = BTreeMap::new();
        value.insert("bitcoin".to_string(), 42u64);
        save_json(&path, &value).await.unwrap();

        let loaded: BTreeMap<String, u64> = load_json(&path).await.unwrap().unwrap();
        assert_eq!(loaded, value);
    }

    #[tokio::test]
    async fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded: Option<u64> = load_json(&dir.path().join("absent.json")).await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        tokio::fs::write(&path, b"{ not json").await.unwrap();
        let loaded: Result<Option<u64>, _> = load_json(&path).await;
        assert!(loaded.is_err());
    }

    #[tokio::test]
    async fn overwrite_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        save_json(&path, &1u64).await.unwrap();
        save_json(&path, &2u64).await.unwrap();

        let loaded: u64 = load_json(&path).await.unwrap().unwrap();
        assert_eq!(loaded, 2);
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name());
        }
        assert_eq!(names, vec![std::ffi::OsString::from("state.json")]);
    }
}
