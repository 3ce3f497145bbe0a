//! Small async file helpers shared by the store and the index.
//!
//! Whole-file writes go through a sibling temp file and a rename so a crash
//! mid-write never leaves a truncated artifact behind.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::StoreError;

pub async fn read_text(path: &Path) -> Result<String, StoreError> {
    fs::read_to_string(path)
        .await
        .map_err(|e| StoreError::io(path, e))
}

/// Replace the contents of `path` atomically.
pub async fn write_text(path: &Path, text: &str) -> Result<(), StoreError> {
    ensure_parent(path).await?;
    let tmp = tmp_sibling(path);
    fs::write(&tmp, text)
        .await
        .map_err(|e| StoreError::io(&tmp, e))?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(StoreError::io(path, e));
    }
    Ok(())
}

/// Append to `path`, creating it when absent.
pub async fn append_text(path: &Path, text: &str) -> Result<(), StoreError> {
    ensure_parent(path).await?;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| StoreError::io(path, e))?;
    file.write_all(text.as_bytes())
        .await
        .map_err(|e| StoreError::io(path, e))?;
    file.flush().await.map_err(|e| StoreError::io(path, e))
}

/// Where `path` lands when archived: `<dir>_archive/<file name>`.
pub fn archive_destination(path: &Path) -> PathBuf {
    let file_name = path.file_name().unwrap_or(path.as_os_str());
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    let archive_dir = match parent.and_then(|p| p.file_name()) {
        Some(dir) => {
            let mut name = dir.to_os_string();
            name.push("_archive");
            parent
                .map(|p| p.with_file_name(&name))
                .unwrap_or_else(|| PathBuf::from(&name))
        }
        None => PathBuf::from("archive"),
    };
    archive_dir.join(file_name)
}

/// Move `path` into its sibling archive directory and return the new path.
pub async fn archive(path: &Path) -> Result<PathBuf, StoreError> {
    if fs::metadata(path).await.is_err() {
        return Err(StoreError::NotFound(path.to_path_buf()));
    }
    let dest = archive_destination(path);
    ensure_parent(&dest).await?;
    fs::rename(path, &dest)
        .await
        .map_err(|e| StoreError::io(path, e))?;
    Ok(dest)
}

pub async fn prepare_directory(dir: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(dir)
        .await
        .map_err(|e| StoreError::io(dir, e))
}

pub async fn exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

async fn ensure_parent(path: &Path) -> Result<(), StoreError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => prepare_directory(parent).await,
        _ => Ok(()),
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
