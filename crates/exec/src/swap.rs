//! Replacing the base model file with a freshly merged one.
//!
//! At every step at least one complete model file exists on disk: the base is
//! copied to `<base>_bck` before it is touched, and restored from that copy if
//! the candidate cannot be put in place.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum SwapError {
    #[error("no new model file at {}", .0.display())]
    MissingCandidate(PathBuf),

    #[error("could not back up {} to {}: {source}", base.display(), backup.display())]
    Backup {
        base: PathBuf,
        backup: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not move {} into place: {source}", candidate.display())]
    Replace {
        candidate: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("model file {} missing after swap", .0.display())]
    Unverified(PathBuf),
}

/// Path of the backup copy kept alongside `base`.
pub fn backup_path(base: &Path) -> PathBuf {
    let mut name: OsString = base.as_os_str().to_os_string();
    name.push("_bck");
    PathBuf::from(name)
}

/// Swap `candidate` in as the new `base`. Returns the backup path when a
/// previous base existed.
pub async fn transplant(base: &Path, candidate: &Path) -> Result<Option<PathBuf>, SwapError> {
    if !exists(candidate).await {
        return Err(SwapError::MissingCandidate(candidate.to_path_buf()));
    }

    let backup = if exists(base).await {
        let backup = backup_path(base);
        debug!(base = %base.display(), backup = %backup.display(), "backing up model");
        fs::copy(base, &backup).await.map_err(|source| SwapError::Backup {
            base: base.to_path_buf(),
            backup: backup.clone(),
            source,
        })?;
        Some(backup)
    } else {
        None
    };

    if let Err(source) = replace(base, candidate).await {
        error!(base = %base.display(), error = %source, "model swap failed");
        if let Some(backup) = &backup {
            restore(base, backup).await;
        }
        return Err(SwapError::Replace {
            candidate: candidate.to_path_buf(),
            source,
        });
    }

    if !exists(base).await {
        if let Some(backup) = &backup {
            restore(base, backup).await;
        }
        return Err(SwapError::Unverified(base.to_path_buf()));
    }

    info!(base = %base.display(), "model file swapped");
    Ok(backup)
}

/// Rename over the base; across filesystems fall back to copying into a
/// sibling temp file and renaming that.
async fn replace(base: &Path, candidate: &Path) -> io::Result<()> {
    match fs::rename(candidate, base).await {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            debug!(error = %rename_err, "rename failed, copying across");
            let mut tmp = base.as_os_str().to_os_string();
            tmp.push(".swap");
            let tmp = PathBuf::from(tmp);
            fs::copy(candidate, &tmp).await?;
            if let Err(e) = fs::rename(&tmp, base).await {
                let _ = fs::remove_file(&tmp).await;
                return Err(e);
            }
            let _ = fs::remove_file(candidate).await;
            Ok(())
        }
    }
}

async fn restore(base: &Path, backup: &Path) {
    if exists(base).await {
        return;
    }
    match fs::copy(backup, base).await {
        Ok(_) => info!(base = %base.display(), "model restored from backup"),
        Err(e) => error!(base = %base.display(), error = %e, "could not restore model from backup"),
    }
}

async fn exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}
