use std::path::{Path, PathBuf};
use std::sync::Arc;

use somna_config::ConsolidationConfig;
use thiserror::Error;
use tracing::info;

use crate::ToolRunner;

#[derive(Debug, Error)]
pub enum ToolchainError {
    #[error("{tool} tool not found at {}", path.display())]
    Missing { tool: &'static str, path: PathBuf },

    #[error("{tool} failed with exit code {code:?}")]
    Failed { tool: &'static str, code: Option<i32> },

    #[error("could not start {tool}: {source}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Parameters of one LoRA fine-tuning run.
#[derive(Debug, Clone, PartialEq)]
pub struct FinetuneJob {
    pub base_model: PathBuf,
    pub training_data: PathBuf,
    pub threads: u32,
    pub epochs: u32,
    pub sample_start: String,
    pub lora_out: PathBuf,
    pub checkpoint_out: PathBuf,
}

impl FinetuneJob {
    pub fn args(&self) -> Vec<String> {
        vec![
            "--model-base".into(),
            path_arg(&self.base_model),
            "--train-data".into(),
            path_arg(&self.training_data),
            "--threads".into(),
            self.threads.to_string(),
            "--sample-start".into(),
            self.sample_start.clone(),
            "--epochs".into(),
            self.epochs.to_string(),
            "--lora-out".into(),
            path_arg(&self.lora_out),
            "--checkpoint-out".into(),
            path_arg(&self.checkpoint_out),
        ]
    }
}

/// Parameters of merging a LoRA adapter into the base model.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeJob {
    pub base_model: PathBuf,
    pub lora: PathBuf,
    pub output: PathBuf,
    pub weight: f32,
}

impl MergeJob {
    pub fn args(&self) -> Vec<String> {
        vec![
            "--model-base".into(),
            path_arg(&self.base_model),
            "--model-out".into(),
            path_arg(&self.output),
            "--lora-scaled".into(),
            path_arg(&self.lora),
            self.weight.to_string(),
        ]
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// The two external binaries consolidation depends on.
#[derive(Clone)]
pub struct Toolchain {
    finetune_tool: PathBuf,
    merge_tool: PathBuf,
    runner: Arc<dyn ToolRunner>,
}

impl std::fmt::Debug for Toolchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Toolchain")
            .field("finetune_tool", &self.finetune_tool)
            .field("merge_tool", &self.merge_tool)
            .finish_non_exhaustive()
    }
}

impl Toolchain {
    pub fn new(finetune_tool: impl Into<PathBuf>, merge_tool: impl Into<PathBuf>, runner: Arc<dyn ToolRunner>) -> Self {
        Self {
            finetune_tool: finetune_tool.into(),
            merge_tool: merge_tool.into(),
            runner,
        }
    }

    pub fn from_config(config: &ConsolidationConfig, runner: Arc<dyn ToolRunner>) -> Self {
        Self::new(config.finetune_tool_path(), config.merge_tool_path(), runner)
    }

    pub fn finetune_tool(&self) -> &Path {
        &self.finetune_tool
    }

    pub fn merge_tool(&self) -> &Path {
        &self.merge_tool
    }

    /// Both binaries must exist as regular files before anything is invoked.
    pub fn verify(&self) -> Result<(), ToolchainError> {
        for (tool, path) in [("finetune", &self.finetune_tool), ("merge", &self.merge_tool)] {
            if !path.is_file() {
                return Err(ToolchainError::Missing {
                    tool,
                    path: path.clone(),
                });
            }
        }
        Ok(())
    }

    pub async fn finetune(&self, job: &FinetuneJob) -> Result<(), ToolchainError> {
        info!(
            base = %job.base_model.display(),
            data = %job.training_data.display(),
            threads = job.threads,
            epochs = job.epochs,
            "fine-tuning LoRA adapter"
        );
        self.invoke("finetune", &self.finetune_tool, job.args()).await
    }

    pub async fn merge(&self, job: &MergeJob) -> Result<(), ToolchainError> {
        info!(
            base = %job.base_model.display(),
            lora = %job.lora.display(),
            out = %job.output.display(),
            weight = job.weight,
            "merging LoRA into base model"
        );
        self.invoke("merge", &self.merge_tool, job.args()).await
    }

    async fn invoke(&self, tool: &'static str, program: &Path, args: Vec<String>) -> Result<(), ToolchainError> {
        let exit = self
            .runner
            .run(program, &args)
            .await
            .map_err(|source| ToolchainError::Spawn { tool, source })?;
        if exit.is_success() {
            Ok(())
        } else {
            Err(ToolchainError::Failed {
                tool,
                code: exit.code,
            })
        }
    }
}
