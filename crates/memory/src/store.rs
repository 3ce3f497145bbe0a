use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::Local;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::artifact::{ArtifactId, ArtifactKind};
use crate::error::StoreError;
use crate::files;
use crate::index::KeywordIndex;

/// On-disk locations owned by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
    pub conversations_dir: PathBuf,
    pub conclusions_dir: PathBuf,
    pub dreams_dir: PathBuf,
    pub index_path: PathBuf,
}

impl StoreLayout {
    /// Lay every directory out under `root`, using the default names.
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            conversations_dir: root.join("conversations"),
            conclusions_dir: root.join("conclusions"),
            dreams_dir: root.join("context"),
            index_path: root.join("conversations").join("short-term-memory.json"),
        }
    }

    pub fn dir_for(&self, kind: ArtifactKind) -> &Path {
        match kind {
            ArtifactKind::Conversation => &self.conversations_dir,
            ArtifactKind::Conclusion => &self.conclusions_dir,
            ArtifactKind::Dream => &self.dreams_dir,
        }
    }
}

/// Keyword-indexed short-term memory.
///
/// Index mutations are serialized behind an async mutex so concurrent
/// `put`/`forget` calls never lose each other's updates. Query operations
/// degrade to empty results on I/O trouble; mutations report the failure.
#[derive(Debug)]
pub struct ArtifactStore {
    layout: StoreLayout,
    index_lock: Mutex<()>,
}

impl ArtifactStore {
    /// Prepare the directories and an empty index file if none exists yet.
    pub async fn open(layout: StoreLayout) -> Result<Self, StoreError> {
        for dir in [
            &layout.conversations_dir,
            &layout.conclusions_dir,
            &layout.dreams_dir,
        ] {
            files::prepare_directory(dir).await?;
        }
        if !files::exists(&layout.index_path).await {
            KeywordIndex::new().save(&layout.index_path).await?;
            info!(path = %layout.index_path.display(), "created empty keyword index");
        }
        Ok(Self {
            layout,
            index_lock: Mutex::new(()),
        })
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    // ── Keyword index ────────────────────────────────────────────────────────

    /// Register `id` under every keyword. Re-adding an existing pair is a no-op.
    pub async fn put<S: AsRef<str>>(&self, keywords: &[S], id: &ArtifactId) -> Result<usize, StoreError> {
        let _guard = self.index_lock.lock().await;
        let mut index = KeywordIndex::load(&self.layout.index_path).await?;
        let applied = index.put(keywords.iter().map(AsRef::as_ref), id);
        index.save(&self.layout.index_path).await?;
        debug!(%id, applied, "indexed artifact");
        Ok(applied)
    }

    /// Union of artifacts under any of `keywords`. Never fails.
    pub async fn search<S: AsRef<str>>(&self, keywords: &[S]) -> BTreeSet<ArtifactId> {
        match self.load_index().await {
            Some(index) => index.search(keywords.iter().map(AsRef::as_ref)),
            None => BTreeSet::new(),
        }
    }

    /// Drop keywords and their associations. Artifact files are untouched.
    pub async fn forget<S: AsRef<str>>(&self, keywords: &[S]) -> Result<usize, StoreError> {
        let _guard = self.index_lock.lock().await;
        let mut index = KeywordIndex::load(&self.layout.index_path).await?;
        let removed = index.forget(keywords.iter().map(AsRef::as_ref));
        if removed > 0 {
            index.save(&self.layout.index_path).await?;
        }
        debug!(removed, "forgot keywords");
        Ok(removed)
    }

    /// Every indexed keyword, sorted. Empty when the index is unreadable.
    pub async fn all_keywords(&self) -> Vec<String> {
        self.load_index()
            .await
            .map(|index| index.all_keywords())
            .unwrap_or_default()
    }

    /// Snapshot of the whole index, for listing.
    pub async fn index(&self) -> Result<KeywordIndex, StoreError> {
        KeywordIndex::load(&self.layout.index_path).await
    }

    async fn load_index(&self) -> Option<KeywordIndex> {
        match KeywordIndex::load(&self.layout.index_path).await {
            Ok(index) => Some(index),
            Err(e) => {
                warn!(error = %e, "keyword index unavailable");
                None
            }
        }
    }

    // ── Artifacts ────────────────────────────────────────────────────────────

    /// Read and join artifacts in the given order, each under its heading.
    /// Unreadable artifacts are skipped.
    pub async fn concatenate<'a>(&self, ids: impl IntoIterator<Item = &'a ArtifactId>) -> String {
        let mut out = String::new();
        for id in ids {
            match files::read_text(id.path()).await {
                Ok(content) => {
                    out.push_str(&id.heading());
                    out.push('\n');
                    out.push_str(&content);
                    out.push('\n');
                }
                Err(e) => warn!(%id, error = %e, "skipping unreadable artifact"),
            }
        }
        out
    }

    pub async fn read(&self, id: &ArtifactId) -> Result<String, StoreError> {
        files::read_text(id.path()).await
    }

    pub async fn write(&self, id: &ArtifactId, text: &str) -> Result<(), StoreError> {
        files::write_text(id.path(), text).await
    }

    pub async fn append(&self, id: &ArtifactId, text: &str) -> Result<(), StoreError> {
        files::append_text(id.path(), text).await
    }

    /// Move the artifact into its `<dir>_archive` sibling.
    pub async fn archive(&self, id: &ArtifactId) -> Result<PathBuf, StoreError> {
        let dest = files::archive(id.path()).await?;
        info!(%id, dest = %dest.display(), "archived artifact");
        Ok(dest)
    }

    /// Pick a fresh timestamped id for `kind` that no file occupies yet.
    pub async fn reserve_id(&self, kind: ArtifactKind) -> ArtifactId {
        let base = ArtifactId::timestamped(self.layout.dir_for(kind), kind, Local::now().naive_local());
        if Self::is_free(&base).await {
            return base;
        }
        let mut n = 1;
        loop {
            let candidate = base.with_suffix(n);
            if Self::is_free(&candidate).await {
                return candidate;
            }
            n += 1;
        }
    }

    /// Neither the id nor its archived counterpart exists, so archiving it
    /// later never overwrites older material.
    async fn is_free(id: &ArtifactId) -> bool {
        !files::exists(id.path()).await && !files::exists(&files::archive_destination(id.path())).await
    }

    /// Persist `text` as a new artifact of `kind`.
    pub async fn create(&self, kind: ArtifactKind, text: &str) -> Result<ArtifactId, StoreError> {
        let id = self.reserve_id(kind).await;
        self.write(&id, text).await?;
        debug!(%id, bytes = text.len(), "created artifact");
        Ok(id)
    }

    /// Persist `text` directly in the archive of `kind`; it never appears in
    /// the live directory. Returns the archived artifact.
    pub async fn create_archived(&self, kind: ArtifactKind, text: &str) -> Result<ArtifactId, StoreError> {
        let reserved = self.reserve_id(kind).await;
        let id = ArtifactId::from_path(files::archive_destination(reserved.path()));
        self.write(&id, text).await?;
        debug!(%id, bytes = text.len(), "created archived artifact");
        Ok(id)
    }

    /// Conclusion artifacts still awaiting consolidation, sorted by id.
    pub async fn pending_conclusions(&self) -> Result<Vec<ArtifactId>, StoreError> {
        self.list(ArtifactKind::Conclusion).await
    }

    /// Live `<prefix>_*.txt` artifacts of `kind`, sorted by id. Temp files
    /// from interrupted writes are not artifacts.
    pub async fn list(&self, kind: ArtifactKind) -> Result<Vec<ArtifactId>, StoreError> {
        let dir = self.layout.dir_for(kind);
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(dir, e)),
        };
        let prefix = format!("{}_", kind.prefix());
        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| StoreError::io(dir, e))? {
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if is_file && name.starts_with(&prefix) && name.ends_with(".txt") {
                found.push(ArtifactId::from_path(entry.path()));
            }
        }
        found.sort();
        Ok(found)
    }
}
