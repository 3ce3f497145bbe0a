use anyhow::{Context, Result};
use somna_llm::{InferenceResource, InvokeOptions, extract_marked, mark_all};
use somna_memory::{ArtifactId, ArtifactKind, ArtifactStore};
use tracing::{debug, error, info, warn};

use crate::flags::ModeFlags;
use crate::prompts::PromptTemplates;
use crate::{MONOLOGUE, MURMUR, PROMPT};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReflectionOutcome {
    /// The keyword index is empty.
    NothingToReflect,
    /// The model picked none of the offered keywords.
    NothingSelected,
    /// Selected keywords led to no readable artifacts. They were retired.
    NoMaterial { selected: Vec<String> },
    /// The conclusion was judged uninspiring and archived straight away.
    Archived { conclusion: ArtifactId, selected: Vec<String> },
    /// The conclusion awaits consolidation.
    Pending { conclusion: ArtifactId, selected: Vec<String> },
}

/// One pass of idle self-reflection over recent conversations.
pub struct ReflectionCycle<'a> {
    store: &'a ArtifactStore,
    prompts: &'a PromptTemplates,
    flags: &'a ModeFlags,
    options: InvokeOptions,
    uninspiring_marker: String,
}

impl<'a> ReflectionCycle<'a> {
    pub fn new(
        store: &'a ArtifactStore,
        prompts: &'a PromptTemplates,
        flags: &'a ModeFlags,
        options: InvokeOptions,
        uninspiring_marker: &str,
    ) -> Self {
        Self {
            store,
            prompts,
            flags,
            options,
            uninspiring_marker: uninspiring_marker.to_lowercase(),
        }
    }

    pub async fn run(&self, model: &dyn InferenceResource) -> Result<ReflectionOutcome> {
        let keywords = self.store.all_keywords().await;
        if keywords.is_empty() {
            info!(target: MURMUR, "nothing to reflect on");
            return Ok(ReflectionOutcome::NothingToReflect);
        }

        let selected = self.select(model, &keywords).await?;
        if selected.is_empty() {
            info!(target: MURMUR, "none of the recent topics caught my interest");
            return Ok(ReflectionOutcome::NothingSelected);
        }
        debug!(?selected, "keywords selected for reflection");

        let outcome = self.reflect_on(model, selected.clone()).await;

        // processed keywords are retired whatever the result
        match self.store.forget(&selected).await {
            Ok(_) => debug!(?selected, "retired reflected keywords"),
            Err(e) => error!(?selected, error = %e, "could not retire reflected keywords"),
        }
        outcome
    }

    async fn select(&self, model: &dyn InferenceResource, keywords: &[String]) -> Result<Vec<String>> {
        let prompt = self.prompts.keyword_selection(&mark_all(keywords));
        debug!(target: PROMPT, %prompt, "keyword selection");
        let raw = model
            .invoke(&prompt, &self.options)
            .await
            .context("keyword selection failed")?;
        debug!(target: MONOLOGUE, %raw, "keyword selection output");
        Ok(extract_marked(&raw))
    }

    async fn reflect_on(&self, model: &dyn InferenceResource, selected: Vec<String>) -> Result<ReflectionOutcome> {
        let ids = self.store.search(&selected).await;
        let material = self.store.concatenate(&ids).await;
        if material.is_empty() {
            warn!(?selected, "selected keywords led to no readable conversations");
            return Ok(ReflectionOutcome::NoMaterial { selected });
        }

        let prompt = self.prompts.perspective_explanation(&material);
        debug!(target: PROMPT, %prompt, "perspective explanation");
        info!(target: MURMUR, "thinking about recent conversations...");
        let explanation = model
            .invoke(&prompt, &self.options)
            .await
            .context("perspective explanation failed")?;
        debug!(target: MONOLOGUE, %explanation, "adaptation explanation");

        // an uninspiring conclusion goes straight to the archive so it can
        // never be picked up as pending
        if explanation.to_lowercase().contains(&self.uninspiring_marker) {
            let conclusion = self
                .store
                .create_archived(ArtifactKind::Conclusion, &explanation)
                .await
                .context("could not archive uninspiring conclusion")?;
            info!(target: MURMUR, %conclusion, ?selected, "nothing of interest found");
            return Ok(ReflectionOutcome::Archived { conclusion, selected });
        }

        let conclusion = self
            .store
            .create(ArtifactKind::Conclusion, &explanation)
            .await
            .context("could not save conclusion")?;
        info!(target: MURMUR, %conclusion, ?selected, "this brought a new perspective");
        self.flags.set_consolidation_pending(true);
        Ok(ReflectionOutcome::Pending { conclusion, selected })
    }
}

#[cfg(test)]
mod tests {
    use somna_memory::StoreLayout;

    use super::*;
    use crate::testing::ScriptedModel;

    async fn seeded() -> (tempfile::TempDir, ArtifactStore, ArtifactId) {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(StoreLayout::under(dir.path())).await.unwrap();
        let id = store
            .create(ArtifactKind::Conversation, "User: Rome?\nYou: Lovely.\n")
            .await
            .unwrap();
        store.put(&["travel", "food"], &id).await.unwrap();
        (dir, store, id)
    }

    fn cycle<'a>(store: &'a ArtifactStore, prompts: &'a PromptTemplates, flags: &'a ModeFlags) -> ReflectionCycle<'a> {
        ReflectionCycle::new(store, prompts, flags, InvokeOptions::default(), "**uninspiring**")
    }

    #[tokio::test]
    async fn empty_index_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(StoreLayout::under(dir.path())).await.unwrap();
        let (prompts, flags) = (PromptTemplates::default(), ModeFlags::new());
        let model = ScriptedModel::replying("x");

        let outcome = cycle(&store, &prompts, &flags).run(&model).await.unwrap();
        assert_eq!(outcome, ReflectionOutcome::NothingToReflect);
        assert_eq!(model.prompt_count(), 0);
    }

    #[tokio::test]
    async fn offered_keywords_are_marked() {
        let (_dir, store, _) = seeded().await;
        let (prompts, flags) = (PromptTemplates::default(), ModeFlags::new());
        let model = ScriptedModel::replying("none");

        let outcome = cycle(&store, &prompts, &flags).run(&model).await.unwrap();
        assert_eq!(outcome, ReflectionOutcome::NothingSelected);
        assert!(model.prompts.lock().unwrap()[0].contains("**food**, **travel**"));
        assert_eq!(store.all_keywords().await.len(), 2);
    }

    #[tokio::test]
    async fn inspiring_conclusion_goes_pending_and_keywords_retire() {
        let (_dir, store, _) = seeded().await;
        let (prompts, flags) = (PromptTemplates::default(), ModeFlags::new());
        let model = ScriptedModel::replying("unused")
            .then("**Travel**")
            .then("I should ask more about places.");

        let outcome = cycle(&store, &prompts, &flags).run(&model).await.unwrap();
        let ReflectionOutcome::Pending { conclusion, selected } = outcome else {
            panic!("expected pending conclusion, got {outcome:?}");
        };
        assert_eq!(selected, vec!["travel"]);
        assert!(flags.is_consolidation_pending());
        assert_eq!(store.pending_conclusions().await.unwrap(), vec![conclusion.clone()]);
        assert_eq!(store.read(&conclusion).await.unwrap(), "I should ask more about places.");
        assert_eq!(store.all_keywords().await, vec!["food"]);

        let prompts_seen = model.prompts.lock().unwrap();
        assert!(prompts_seen[1].contains("User: Rome?"));
        assert!(prompts_seen[1].contains("Conversation from "));
    }

    #[tokio::test]
    async fn uninspiring_conclusion_is_archived() {
        let (_dir, store, _) = seeded().await;
        let (prompts, flags) = (PromptTemplates::default(), ModeFlags::new());
        let model = ScriptedModel::replying("unused")
            .then("**travel** **food**")
            .then("Honestly: **UNINSPIRING**");

        let outcome = cycle(&store, &prompts, &flags).run(&model).await.unwrap();
        let ReflectionOutcome::Archived { conclusion, .. } = outcome else {
            panic!("expected archived conclusion, got {outcome:?}");
        };
        assert!(conclusion.path().starts_with(store.layout().conclusions_dir.with_file_name("conclusions_archive")));
        assert_eq!(store.read(&conclusion).await.unwrap(), "Honestly: **UNINSPIRING**");
        assert!(!flags.is_consolidation_pending());
        assert!(store.pending_conclusions().await.unwrap().is_empty());
        assert!(store.all_keywords().await.is_empty());
    }

    #[tokio::test]
    async fn unwritable_archive_never_leaves_uninspiring_conclusion_pending() {
        let (dir, store, _) = seeded().await;
        // a plain file where the archive directory should be
        std::fs::write(dir.path().join("conclusions_archive"), "").unwrap();
        let (prompts, flags) = (PromptTemplates::default(), ModeFlags::new());
        let model = ScriptedModel::replying("unused")
            .then("**travel**")
            .then("Nothing new. **uninspiring**");

        assert!(cycle(&store, &prompts, &flags).run(&model).await.is_err());
        assert!(!flags.is_consolidation_pending());
        assert!(store.pending_conclusions().await.unwrap().is_empty());
        assert_eq!(store.all_keywords().await, vec!["food"]);
    }

    #[tokio::test]
    async fn missing_material_still_retires_keywords() {
        let (_dir, store, id) = seeded().await;
        std::fs::remove_file(id.path()).unwrap();
        let (prompts, flags) = (PromptTemplates::default(), ModeFlags::new());
        let model = ScriptedModel::replying("**food**");

        let outcome = cycle(&store, &prompts, &flags).run(&model).await.unwrap();
        assert_eq!(outcome, ReflectionOutcome::NoMaterial { selected: vec!["food".into()] });
        assert_eq!(store.all_keywords().await, vec!["travel"]);
        assert!(store.pending_conclusions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_explanation_still_retires_keywords() {
        let (_dir, store, _) = seeded().await;
        let (prompts, flags) = (PromptTemplates::default(), ModeFlags::new());
        let model = ScriptedModel::replying("unused").then("**travel**").then_fail();

        assert!(cycle(&store, &prompts, &flags).run(&model).await.is_err());
        assert_eq!(store.all_keywords().await, vec!["food"]);
        assert!(!flags.is_consolidation_pending());
    }

    #[tokio::test]
    async fn unknown_selection_yields_no_material() {
        let (_dir, store, _) = seeded().await;
        let (prompts, flags) = (PromptTemplates::default(), ModeFlags::new());
        let model = ScriptedModel::replying("**astronomy**");

        let outcome = cycle(&store, &prompts, &flags).run(&model).await.unwrap();
        assert!(matches!(outcome, ReflectionOutcome::NoMaterial { .. }));
        assert_eq!(store.all_keywords().await.len(), 2);
    }
}
