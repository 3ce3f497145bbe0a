//! Keyword-indexed short-term memory.
//!
//! Interaction transcripts, conclusions and training material are stored as
//! immutable text artifacts on disk.  A JSON keyword index maps normalized
//! keywords to the artifacts they describe; reflection reads clusters out of
//! it and retires them once examined.

pub mod artifact;
pub mod error;
pub mod files;
pub mod index;
pub mod store;

pub use artifact::{ArtifactId, ArtifactKind};
pub use error::StoreError;
pub use index::{KeywordIndex, normalize_keyword};
pub use store::{ArtifactStore, StoreLayout};
