use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{Local, NaiveDateTime};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// File-name timestamp layout shared by every artifact kind.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

static TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z]+_(\d{14})(?:_\d+)?\.txt$").expect("timestamp pattern is valid")
});

// ── Kinds ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// Transcript of one interaction session.
    Conversation,
    /// Adaptation explanation produced by a reflection cycle.
    Conclusion,
    /// Training material synthesized during consolidation.
    Dream,
}

impl ArtifactKind {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Conversation => "conversation",
            Self::Conclusion => "conclusion",
            Self::Dream => "dream",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Conversation => "Conversation",
            Self::Conclusion => "Conclusion",
            Self::Dream => "Dream",
        }
    }

    fn from_file_name(name: &str) -> Option<Self> {
        [Self::Conversation, Self::Conclusion, Self::Dream]
            .into_iter()
            .find(|kind| name.starts_with(&format!("{}_", kind.prefix())))
    }
}

// ── Identifiers ──────────────────────────────────────────────────────────────

/// Identifier of a stored artifact: its path relative to the working
/// directory, exactly as recorded in the keyword index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(String);

impl ArtifactId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Build a timestamped id for `kind` inside `dir`.
    pub fn timestamped(dir: impl AsRef<Path>, kind: ArtifactKind, at: NaiveDateTime) -> Self {
        let name = format!("{}_{}.txt", kind.prefix(), at.format(TIMESTAMP_FORMAT));
        Self::from_path(dir.as_ref().join(name))
    }

    /// Timestamped id for `kind` inside `dir` using the local clock.
    pub fn now(dir: impl AsRef<Path>, kind: ArtifactKind) -> Self {
        Self::timestamped(dir, kind, Local::now().naive_local())
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self(path.into().to_string_lossy().into_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn path(&self) -> &Path {
        Path::new(&self.0)
    }

    pub fn file_name(&self) -> &str {
        self.path()
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(&self.0)
    }

    pub fn kind(&self) -> Option<ArtifactKind> {
        ArtifactKind::from_file_name(self.file_name())
    }

    /// Creation timestamp encoded in the file name, if any.
    pub fn created_at(&self) -> Option<NaiveDateTime> {
        let captures = TIMESTAMP_RE.captures(self.file_name())?;
        NaiveDateTime::parse_from_str(&captures[1], TIMESTAMP_FORMAT).ok()
    }

    /// Same id with a numeric disambiguator before the extension.
    pub(crate) fn with_suffix(&self, n: u32) -> Self {
        let path = self.path();
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::from_path(path.with_file_name(format!("{stem}_{n}.txt")))
    }

    /// Heading placed above the artifact when concatenated.
    pub fn heading(&self) -> String {
        let label = self.kind().map(ArtifactKind::label).unwrap_or("Artifact");
        match self.created_at() {
            Some(at) => format!("{label} from {}", at.format("%Y-%m-%d %H:%M:%S")),
            None => format!("{label} from {}", self.0),
        }
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ArtifactId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}
