use std::path::{Path, PathBuf};

use chrono::Local;
use tokio::fs;
use tracing::{debug, info, warn};

const STRAY_PREFIXES: &[&str] = &["checkpoint-", "ggml-lora-"];

/// Archive the products of a finished fine-tuning run into
/// `<log_dir>/finetuning_<timestamp>/` and sweep leftover intermediate
/// files out of `scratch_dirs`. Best effort: every failure is logged and
/// skipped. Returns the archive directory.
pub async fn finetune_cleanup(log_dir: &Path, keep: &[PathBuf], scratch_dirs: &[PathBuf]) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d%H%M%S");
    let archive = log_dir.join(format!("finetuning_{stamp}"));
    if let Err(e) = fs::create_dir_all(&archive).await {
        warn!(dir = %archive.display(), error = %e, "could not create finetuning archive");
        return archive;
    }

    for file in keep {
        let Some(name) = file.file_name() else { continue };
        if !fs::try_exists(file).await.unwrap_or(false) {
            warn!(file = %file.display(), "finetuning product not found");
            continue;
        }
        let dest = archive.join(name);
        match move_file(file, &dest).await {
            Ok(()) => info!(file = %file.display(), dest = %dest.display(), "archived finetuning product"),
            Err(e) => warn!(file = %file.display(), error = %e, "could not archive finetuning product"),
        }
    }

    for dir in scratch_dirs {
        sweep(dir).await;
    }
    archive
}

async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    fs::copy(from, to).await?;
    fs::remove_file(from).await
}

async fn sweep(dir: &Path) {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "nothing to sweep");
            return;
        }
    };
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "sweep interrupted");
                break;
            }
        };
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !STRAY_PREFIXES.iter().any(|prefix| name.starts_with(prefix)) {
            continue;
        }
        if !entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        match fs::remove_file(entry.path()).await {
            Ok(()) => debug!(file = %name, "removed intermediate file"),
            Err(e) => debug!(file = %name, error = %e, "could not remove intermediate file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn archives_products_and_sweeps_strays() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        let work = dir.path().join("work");
        std::fs::create_dir_all(&work).unwrap();

        let lora = work.join("ggml-lora-LATEST-f32.gguf");
        let ckpt = work.join("checkpoint-LATEST.gguf");
        let backup = dir.path().join("model.gguf_bck");
        for f in [&lora, &ckpt, &backup] {
            std::fs::write(f, "x").unwrap();
        }
        std::fs::write(work.join("checkpoint-10.gguf"), "x").unwrap();
        std::fs::write(work.join("ggml-lora-10-f32.gguf"), "x").unwrap();
        std::fs::write(work.join("notes.txt"), "x").unwrap();

        let missing = dir.path().join("absent.gguf");
        let archive = finetune_cleanup(&logs, &[lora.clone(), ckpt.clone(), backup.clone(), missing], &[work.clone()]).await;

        assert!(archive.starts_with(&logs));
        assert!(archive.join("ggml-lora-LATEST-f32.gguf").is_file());
        assert!(archive.join("checkpoint-LATEST.gguf").is_file());
        assert!(archive.join("model.gguf_bck").is_file());
        assert!(!lora.exists() && !ckpt.exists() && !backup.exists());

        let mut left: Vec<_> = std::fs::read_dir(&work)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left, ["notes.txt"]);
    }
}
