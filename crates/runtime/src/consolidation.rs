use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use somna_config::AppConfig;
use somna_exec::toolchain::{FinetuneJob, MergeJob};
use somna_exec::{Toolchain, finetune_cleanup, transplant};
use somna_llm::{InferenceResource, InvokeOptions};
use somna_memory::{ArtifactId, ArtifactKind, ArtifactStore};
use tracing::{debug, error, info, warn};

use crate::flags::ModeFlags;
use crate::prompts::PromptTemplates;
use crate::{MONOLOGUE, MURMUR, PROMPT};

/// Delimiters framing one synthesized exchange in model output.
#[derive(Debug, Clone, Copy)]
pub struct DreamMarkers<'a> {
    pub stimulus: &'a str,
    pub response: &'a str,
    pub end: &'a str,
}

/// One accepted stimulus/reaction pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DreamUnit {
    pub stimulus: String,
    pub reaction: String,
}

/// Trim and drop everything before the first ASCII letter.
pub fn clean_segment(segment: &str) -> &str {
    let trimmed = segment.trim();
    match trimmed.find(|c: char| c.is_ascii_alphabetic()) {
        Some(start) => &trimmed[start..],
        None => "",
    }
}

/// Extract a training unit from model output. Markers must appear in order
/// and both segments must be non-empty after cleaning.
pub fn parse_dream(text: &str, markers: DreamMarkers<'_>) -> Option<DreamUnit> {
    let stimulus_at = text.find(markers.stimulus)? + markers.stimulus.len();
    let response_at = stimulus_at + text[stimulus_at..].find(markers.response)?;
    let reaction_at = response_at + markers.response.len();
    let end_at = reaction_at + text[reaction_at..].find(markers.end)?;

    let stimulus = clean_segment(&text[stimulus_at..response_at]);
    let reaction = clean_segment(&text[reaction_at..end_at]);
    if stimulus.is_empty() || reaction.is_empty() || reaction == markers.end {
        return None;
    }
    Some(DreamUnit {
        stimulus: stimulus.to_string(),
        reaction: reaction.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsolidationOutcome {
    /// The flag was set but no conclusion was waiting. The flag is cleared.
    NoConclusion,
    Consolidated {
        conclusion: ArtifactId,
        dreams: ArtifactId,
        units: usize,
    },
}

/// Turns one pending conclusion into a fine-tuned replacement of the base
/// model.
pub struct ConsolidationCycle<'a> {
    store: &'a ArtifactStore,
    prompts: &'a PromptTemplates,
    flags: &'a ModeFlags,
    toolchain: &'a Toolchain,
    config: &'a AppConfig,
    options: InvokeOptions,
}

impl<'a> ConsolidationCycle<'a> {
    pub fn new(
        store: &'a ArtifactStore,
        prompts: &'a PromptTemplates,
        flags: &'a ModeFlags,
        toolchain: &'a Toolchain,
        config: &'a AppConfig,
        options: InvokeOptions,
    ) -> Self {
        Self {
            store,
            prompts,
            flags,
            toolchain,
            config,
            options,
        }
    }

    /// Errors leave the pending flag set; it is cleared only once the new
    /// model file is verifiably in place.
    pub async fn run(&self, model: &dyn InferenceResource) -> Result<ConsolidationOutcome> {
        info!(target: MURMUR, "closing eyes for a well-deserved nap");

        let pending = self
            .store
            .pending_conclusions()
            .await
            .context("could not list pending conclusions")?;
        let Some(conclusion) = pending.first().cloned() else {
            warn!("consolidation requested but no conclusion is pending");
            self.flags.set_consolidation_pending(false);
            return Ok(ConsolidationOutcome::NoConclusion);
        };
        if pending.len() > 1 {
            warn!(count = pending.len(), %conclusion, "several conclusions pending, taking the first");
        }

        self.toolchain.verify()?;

        let summary = self
            .store
            .read(&conclusion)
            .await
            .with_context(|| format!("could not read conclusion {conclusion}"))?;
        let dreams = self.store.reserve_id(ArtifactKind::Dream).await;
        let units = match self.train(model, &summary, &dreams).await {
            Ok(units) => units,
            Err(e) => {
                // material from a failed cycle is regenerated on retry
                self.retire_dreams().await;
                return Err(e);
            }
        };

        // the new model is in place from here on, archive failures are not fatal
        self.flags.set_consolidation_pending(pending.len() > 1);
        self.retire_dreams().await;
        if let Err(e) = self.store.archive(&conclusion).await {
            error!(%conclusion, error = %e, "could not archive consolidated conclusion");
        }
        info!(target: MURMUR, %conclusion, units, "self-finetuning session ended");
        Ok(ConsolidationOutcome::Consolidated {
            conclusion,
            dreams,
            units,
        })
    }

    async fn train(&self, model: &dyn InferenceResource, summary: &str, dreams: &ArtifactId) -> Result<usize> {
        let units = self.weave_dreams(model, summary, dreams).await?;
        self.deep_sleep(dreams).await?;
        Ok(units)
    }

    /// Archive every live training-material artifact, including leftovers of
    /// earlier failed cycles.
    async fn retire_dreams(&self) {
        let dreams = match self.store.list(ArtifactKind::Dream).await {
            Ok(dreams) => dreams,
            Err(e) => {
                error!(error = %e, "could not list training material");
                return;
            }
        };
        for id in &dreams {
            if let Err(e) = self.store.archive(id).await {
                error!(%id, error = %e, "could not archive training material");
            }
        }
    }

    async fn weave_dreams(&self, model: &dyn InferenceResource, summary: &str, dreams: &ArtifactId) -> Result<usize> {
        let cfg = &self.config.consolidation;
        let target = cfg.dreams_to_generate.max(1);
        let markers = DreamMarkers {
            stimulus: &cfg.stimulus_marker,
            response: &cfg.response_marker,
            end: &cfg.end_marker,
        };
        let prompt = self.prompts.dream_spinning(summary);
        debug!(target: PROMPT, %prompt, "dream spinning");

        info!(%dreams, target_units = target, "generating training material");

        let mut accepted = 0;
        let mut attempts = 0;
        while accepted < target {
            if cfg.dream_attempt_limit > 0 && attempts >= cfg.dream_attempt_limit {
                bail!("gave up after {attempts} attempts with {accepted} of {target} training units");
            }
            attempts += 1;

            let raw = model
                .invoke(&prompt, &self.options)
                .await
                .context("dream generation failed")?;
            debug!(target: MONOLOGUE, %raw, "dream");

            let Some(unit) = parse_dream(&raw, markers) else {
                debug!(attempts, "malformed dream discarded");
                continue;
            };
            let rendered = self.prompts.dream(&unit.stimulus, &unit.reaction);
            self.store
                .append(dreams, &format!("{rendered}\n"))
                .await
                .context("could not save training material")?;
            accepted += 1;
            debug!(accepted, target, "dream accepted");
        }
        Ok(accepted)
    }

    async fn deep_sleep(&self, dreams: &ArtifactId) -> Result<()> {
        let cfg = &self.config.consolidation;
        let base_model = PathBuf::from(&self.config.model.path);
        let work_dir = Path::new(&cfg.work_dir);
        tokio::fs::create_dir_all(work_dir)
            .await
            .with_context(|| format!("could not create {}", work_dir.display()))?;

        info!(target: MURMUR, "self-finetuning: creating LoRA");
        let finetune = FinetuneJob {
            base_model: base_model.clone(),
            training_data: dreams.path().to_path_buf(),
            threads: cfg.threads,
            epochs: cfg.epochs,
            sample_start: cfg.sample_start.clone(),
            lora_out: cfg.lora_output_path(),
            checkpoint_out: cfg.checkpoint_output_path(),
        };
        self.toolchain.finetune(&finetune).await?;

        info!(target: MURMUR, "self-finetuning: merging base model with LoRA");
        let merge = MergeJob {
            base_model: base_model.clone(),
            lora: finetune.lora_out.clone(),
            output: cfg.merged_model_path(),
            weight: cfg.lora_weight,
        };
        self.toolchain.merge(&merge).await?;

        info!(target: MURMUR, "self-finetuning: transplanting brain to a new one");
        let backup = transplant(&base_model, &merge.output).await?;

        let mut keep = vec![finetune.lora_out, finetune.checkpoint_out];
        keep.extend(backup);
        let log_dir = PathBuf::from(&self.config.paths.log_dir);
        finetune_cleanup(&log_dir, &keep, &[work_dir.to_path_buf(), log_dir.clone()]).await;
        Ok(())
    }
}
