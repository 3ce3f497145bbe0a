use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

// ── Model ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Base model artifact on disk.  This is the file the consolidation cycle
    /// fine-tunes and replaces.
    pub path: String,
    /// Inference backend: `ollama` or `openrouter`.
    pub provider: String,
    /// Model name served by Ollama.  Every load recreates it from `path`.
    pub name: String,
    /// Base URL for the Ollama API.  Overridden at runtime by the
    /// `OLLAMA_BASE_URL` environment variable when set.
    pub base_url: String,
    pub openrouter_model: String,
    pub temperature: f32,
    pub context_size: u32,
    pub max_tokens: u32,
    /// Prompt batch size.  `0` derives it as `4 × consolidation.threads`.
    pub batch_size: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: "llama-2-13b-chat.Q6_K.gguf".to_string(),
            provider: "ollama".to_string(),
            name: "somna".to_string(),
            base_url: "http://localhost:11434".to_string(),
            openrouter_model: "meta-llama/llama-3.1-8b-instruct".to_string(),
            temperature: 0.7,
            context_size: 4096,
            max_tokens: 4000,
            batch_size: 0,
        }
    }
}

impl ModelConfig {
    /// `true` when the configured provider does not read `path` itself.
    pub fn is_remote(&self) -> bool {
        self.provider.eq_ignore_ascii_case("openrouter")
    }
}

// ── Attention ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttentionConfig {
    /// Seconds without interaction before a reflection cycle starts.
    pub idle_countdown_secs: u64,
    /// Length of one scheduler tick in milliseconds.  Countdown and
    /// inactivity counters advance once per tick.
    pub tick_millis: u64,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            idle_countdown_secs: 120,
            tick_millis: 1000,
        }
    }
}

// ── Interaction ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InteractionConfig {
    /// Ticks without input after which an open session is closed.
    pub inactivity_limit: u64,
    /// Input that ends the session immediately (compared case-insensitively).
    pub termination_token: String,
}

impl Default for InteractionConfig {
    fn default() -> Self {
        Self {
            inactivity_limit: 360,
            termination_token: "end_chat".to_string(),
        }
    }
}

// ── Reflection ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReflectionConfig {
    /// Marker the model uses to declare a cluster not worth consolidating.
    pub uninspiring_marker: String,
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            uninspiring_marker: "**uninspiring**".to_string(),
        }
    }
}

// ── Consolidation ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    pub threads: u32,
    /// Number of accepted training units generated per cycle.
    pub dreams_to_generate: usize,
    /// Upper bound on generation attempts per cycle.  `0` keeps retrying
    /// until `dreams_to_generate` units have been accepted.
    pub dream_attempt_limit: usize,
    pub epochs: u32,
    /// Blend weight of the LoRA adapter when merged into the base model.
    pub lora_weight: f32,
    pub toolchain_dir: String,
    pub finetune_tool: String,
    pub merge_tool: String,
    /// Directory receiving fine-tuning outputs (LoRA, checkpoint, merged model).
    pub work_dir: String,
    pub lora_output: String,
    pub checkpoint_output: String,
    pub merged_model: String,
    pub sample_start: String,
    pub stimulus_marker: String,
    pub response_marker: String,
    pub end_marker: String,
    /// Seconds to wait before retrying a failed consolidation.
    pub retry_backoff_secs: u64,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            threads: 8,
            dreams_to_generate: 1,
            dream_attempt_limit: 0,
            epochs: 1,
            lora_weight: 0.7,
            toolchain_dir: "finetune_bins".to_string(),
            finetune_tool: "finetune".to_string(),
            merge_tool: "export-lora".to_string(),
            work_dir: "finetune_work".to_string(),
            lora_output: "ggml-lora-LATEST-f32.gguf".to_string(),
            checkpoint_output: "checkpoint-LATEST.gguf".to_string(),
            merged_model: "llm_tmp.gguf".to_string(),
            sample_start: "<s>".to_string(),
            stimulus_marker: "**QUESTION**".to_string(),
            response_marker: "**RESPONSE**".to_string(),
            end_marker: "**END**".to_string(),
            retry_backoff_secs: 600,
        }
    }
}

impl ConsolidationConfig {
    pub fn finetune_tool_path(&self) -> PathBuf {
        Path::new(&self.toolchain_dir).join(&self.finetune_tool)
    }

    pub fn merge_tool_path(&self) -> PathBuf {
        Path::new(&self.toolchain_dir).join(&self.merge_tool)
    }

    pub fn lora_output_path(&self) -> PathBuf {
        Path::new(&self.work_dir).join(&self.lora_output)
    }

    pub fn checkpoint_output_path(&self) -> PathBuf {
        Path::new(&self.work_dir).join(&self.checkpoint_output)
    }

    pub fn merged_model_path(&self) -> PathBuf {
        Path::new(&self.work_dir).join(&self.merged_model)
    }
}

// ── Paths ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub conversations_dir: String,
    /// JSON keyword index: `{ "keyword": ["artifact id", ...] }`.
    pub index_path: String,
    pub conclusions_dir: String,
    pub dreams_dir: String,
    /// Optional JSON file overriding the built-in prompt templates.
    pub prompts_path: String,
    pub log_dir: String,
    pub lock_path: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            conversations_dir: "conversations".to_string(),
            index_path: "conversations/short-term-memory.json".to_string(),
            conclusions_dir: "conclusions".to_string(),
            dreams_dir: "context".to_string(),
            prompts_path: "conversations/prompt_templates.json".to_string(),
            log_dir: "logs".to_string(),
            lock_path: ".somna/somna.lock".to_string(),
        }
    }
}

// ── Telemetry ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// `tracing` filter directive for console output.
    pub console_log_level: String,
    /// `tracing` filter directive for the per-run log file.
    pub file_log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            console_log_level: "info".to_string(),
            file_log_level: "debug".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub model: ModelConfig,
    pub attention: AttentionConfig,
    pub interaction: InteractionConfig,
    pub reflection: ReflectionConfig,
    pub consolidation: ConsolidationConfig,
    pub paths: PathsConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("SOMNA_MODEL_PATH") {
            if !value.is_empty() {
                config.model.path = value;
            }
        }

        if let Ok(value) = env::var("OLLAMA_BASE_URL") {
            if !value.is_empty() {
                config.model.base_url = value;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Effective prompt batch size.
    pub fn batch_size(&self) -> u32 {
        if self.model.batch_size > 0 {
            self.model.batch_size
        } else {
            4 * self.consolidation.threads.max(1)
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
