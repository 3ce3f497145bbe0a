//! Scripted stand-ins for the model and the toolchain.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use async_trait::async_trait;
use somna_config::AppConfig;
use somna_exec::{ToolExit, ToolRunner};
use somna_llm::{InferenceError, InferenceResource, InvokeOptions, ModelLoader};

type Responder = dyn Fn(&str) -> Option<String> + Send + Sync;

/// Answers from a queue first, then from a prompt-matching fallback.
/// `None` from either source is an inference failure.
pub struct ScriptedModel {
    queue: Mutex<VecDeque<Option<String>>>,
    fallback: Box<Responder>,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn new(fallback: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            fallback: Box::new(fallback),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(text: &'static str) -> Self {
        Self::new(move |_| Some(text.to_string()))
    }

    pub fn then(self, reply: impl Into<String>) -> Self {
        self.queue.lock().unwrap().push_back(Some(reply.into()));
        self
    }

    pub fn then_fail(self) -> Self {
        self.queue.lock().unwrap().push_back(None);
        self
    }

    pub fn prompt_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl InferenceResource for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, prompt: &str, _options: &InvokeOptions) -> Result<String, InferenceError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let queued = self.queue.lock().unwrap().pop_front();
        let reply = match queued {
            Some(reply) => reply,
            None => (self.fallback)(prompt),
        };
        reply.ok_or_else(|| InferenceError::Status {
            provider: "scripted",
            status: 500,
            body: "scripted failure".to_string(),
        })
    }
}

/// Delegates to a shared [`ScriptedModel`] so tests can inspect it after the
/// scheduler took ownership of the handle.
pub struct SharedModel(pub Arc<ScriptedModel>);

#[async_trait]
impl InferenceResource for SharedModel {
    fn name(&self) -> &str {
        self.0.name()
    }

    async fn invoke(&self, prompt: &str, options: &InvokeOptions) -> Result<String, InferenceError> {
        self.0.invoke(prompt, options).await
    }
}

pub struct FakeLoader {
    pub model: Arc<ScriptedModel>,
    pub loads: AtomicUsize,
    pub fail: bool,
}

impl FakeLoader {
    pub fn new(model: Arc<ScriptedModel>) -> Self {
        Self {
            model,
            loads: AtomicUsize::new(0),
            fail: false,
        }
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelLoader for FakeLoader {
    async fn load(&self) -> Result<Box<dyn InferenceResource>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            bail!("model file not found");
        }
        Ok(Box::new(SharedModel(Arc::clone(&self.model))))
    }
}

/// Pretends to be the toolchain: finetune writes the LoRA output, merge
/// writes the merged model. A configured exit code fails the named tool;
/// `merge_failures` fails that many merges before succeeding.
#[derive(Default)]
pub struct FakeRunner {
    pub calls: Mutex<Vec<PathBuf>>,
    pub fail_finetune: Option<i32>,
    pub fail_merge: Option<i32>,
    pub merge_failures: AtomicUsize,
}

impl FakeRunner {
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

fn arg_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

#[async_trait]
impl ToolRunner for FakeRunner {
    async fn run(&self, program: &Path, args: &[String]) -> std::io::Result<ToolExit> {
        self.calls.lock().unwrap().push(program.to_path_buf());
        let is_finetune = args.iter().any(|a| a == "--train-data");
        if is_finetune {
            if let Some(code) = self.fail_finetune {
                return Ok(ToolExit::failed(code));
            }
            for flag in ["--lora-out", "--checkpoint-out"] {
                if let Some(out) = arg_after(args, flag) {
                    std::fs::write(out, "lora")?;
                }
            }
        } else {
            if let Some(code) = self.fail_merge {
                return Ok(ToolExit::failed(code));
            }
            if self
                .merge_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Ok(ToolExit::failed(1));
            }
            if let Some(out) = arg_after(args, "--model-out") {
                std::fs::write(out, "merged model")?;
            }
        }
        Ok(ToolExit::success())
    }
}

/// Config rooted in `root` with a model file and both tool binaries present.
pub fn sandbox_config(root: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    let p = |rel: &str| root.join(rel).to_string_lossy().into_owned();

    config.model.path = p("model.gguf");
    config.consolidation.toolchain_dir = p("bins");
    config.consolidation.work_dir = p("work");
    config.paths.conversations_dir = p("conversations");
    config.paths.index_path = p("conversations/short-term-memory.json");
    config.paths.conclusions_dir = p("conclusions");
    config.paths.dreams_dir = p("context");
    config.paths.prompts_path = p("conversations/prompt_templates.json");
    config.paths.log_dir = p("logs");

    std::fs::write(&config.model.path, "base model").unwrap();
    std::fs::create_dir_all(&config.consolidation.toolchain_dir).unwrap();
    std::fs::write(config.consolidation.finetune_tool_path(), "").unwrap();
    std::fs::write(config.consolidation.merge_tool_path(), "").unwrap();
    config
}

pub const GOOD_DREAM: &str = "**QUESTION** What changed? **RESPONSE** I listen more closely now. **END**";

/// Leave one unconsumed conclusion in the store laid out under `root`.
pub fn seed_conclusion(root: &Path) {
    let dir = root.join("conclusions");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("conclusion_20240101000000.txt"), "Be kinder.").unwrap();
}
