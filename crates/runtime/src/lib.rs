//! The attention loop: mode flags, idle countdown, interaction sessions,
//! reflection and consolidation, sequenced by [`AttentionScheduler`].

pub mod consolidation;
pub mod countdown;
pub mod flags;
pub mod prompts;
pub mod reflection;
pub mod scheduler;
pub mod session;

#[cfg(test)]
mod testing;

pub use consolidation::{ConsolidationCycle, ConsolidationOutcome, DreamMarkers, DreamUnit, clean_segment, parse_dream};
pub use countdown::{Ticker, countdown};
pub use flags::ModeFlags;
pub use prompts::PromptTemplates;
pub use reflection::{ReflectionCycle, ReflectionOutcome};
pub use scheduler::{AttentionEvent, AttentionScheduler};
pub use session::{LanguageSession, SensoryChannel, TurnOutcome};

use somna_config::AppConfig;
use somna_memory::StoreLayout;

/// Agent's own voice: high-level narration of what it is doing.
pub const MURMUR: &str = "somna::murmur";
/// Mode flag transitions.
pub const FLAG: &str = "somna::flag";
/// Full prompt text sent to the model.
pub const PROMPT: &str = "somna::prompt";
/// Raw model output.
pub const MONOLOGUE: &str = "somna::monologue";

/// Artifact store layout described by the `[paths]` section.
pub fn store_layout(config: &AppConfig) -> StoreLayout {
    StoreLayout {
        conversations_dir: config.paths.conversations_dir.clone().into(),
        conclusions_dir: config.paths.conclusions_dir.clone().into(),
        dreams_dir: config.paths.dreams_dir.clone().into(),
        index_path: config.paths.index_path.clone().into(),
    }
}
