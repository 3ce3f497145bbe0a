use std::sync::Arc;

use async_trait::async_trait;
use somna_config::InteractionConfig;
use somna_llm::{InferenceResource, InvokeOptions, extract_marked};
use somna_memory::{ArtifactId, ArtifactKind, ArtifactStore};
use tracing::{debug, error, info, warn};

use crate::flags::ModeFlags;
use crate::prompts::PromptTemplates;
use crate::{MONOLOGUE, MURMUR, PROMPT};

/// What became of one input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Reply(String),
    /// The termination token was received; the caller closes the session.
    Terminate,
    /// Inference failed; the turn was dropped from the context.
    Unanswered,
}

/// One kind of bounded exchange with the outside world.
#[async_trait]
pub trait SensoryChannel: Send {
    fn is_open(&self) -> bool;

    /// Open a session and raise the engaged flag.
    fn start(&mut self);

    async fn receive(&mut self, model: &dyn InferenceResource, input: &str) -> TurnOutcome;

    /// Count one idle tick. Returns `true` once the inactivity limit is reached.
    fn tick(&mut self) -> bool;

    /// Keywords describing the exchange so far.
    async fn summarize(&self, model: &dyn InferenceResource) -> Vec<String>;

    /// Write the transcript as a new artifact.
    async fn persist(&self, store: &ArtifactStore) -> Option<ArtifactId>;

    /// Persist, summarize and index the exchange, then reset and lower the
    /// engaged flag. Returns the stored transcript, if any.
    async fn end(&mut self, model: &dyn InferenceResource, store: &ArtifactStore) -> Option<ArtifactId>;
}

/// Text conversation framed as Llama-2 chat turns.
#[derive(Debug)]
pub struct LanguageSession {
    flags: Arc<ModeFlags>,
    prompts: Arc<PromptTemplates>,
    options: InvokeOptions,
    termination_token: String,
    inactivity_limit: u64,
    context: String,
    transcript: String,
    inactivity: u64,
    open: bool,
}

impl LanguageSession {
    pub fn new(
        config: &InteractionConfig,
        flags: Arc<ModeFlags>,
        prompts: Arc<PromptTemplates>,
        options: InvokeOptions,
    ) -> Self {
        let context = prompts.human_interaction.clone();
        Self {
            flags,
            prompts,
            options,
            termination_token: config.termination_token.trim().to_lowercase(),
            inactivity_limit: config.inactivity_limit,
            context,
            transcript: String::new(),
            inactivity: 0,
            open: false,
        }
    }

    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    pub fn inactivity(&self) -> u64 {
        self.inactivity
    }

    fn reset(&mut self) {
        self.context = self.prompts.human_interaction.clone();
        self.transcript.clear();
        self.inactivity = 0;
        self.open = false;
    }
}

#[async_trait]
impl SensoryChannel for LanguageSession {
    fn is_open(&self) -> bool {
        self.open
    }

    fn start(&mut self) {
        if self.open {
            return;
        }
        self.open = true;
        self.inactivity = 0;
        self.flags.set_engaged(true);
        debug!(target: PROMPT, prompt = %self.context, "conversation opened");
    }

    async fn receive(&mut self, model: &dyn InferenceResource, input: &str) -> TurnOutcome {
        let input = input.trim();
        if input.to_lowercase() == self.termination_token {
            return TurnOutcome::Terminate;
        }
        self.inactivity = 0;

        let rollback = self.context.len();
        self.context.push_str(&format!("{input} [/INST] "));
        debug!(target: MONOLOGUE, prompt = %self.context, "awaiting response");

        match model.invoke(&self.context, &self.options).await {
            Ok(response) => {
                let response = response.trim().to_string();
                info!(target: MURMUR, %response, "response generated");
                self.context.push_str(&format!("{response}</s><s> [INST] "));
                self.transcript.push_str(&format!("User: {input}\nYou: {response}\n"));
                TurnOutcome::Reply(response)
            }
            Err(e) => {
                error!(error = %e, "no response to input");
                self.context.truncate(rollback);
                TurnOutcome::Unanswered
            }
        }
    }

    fn tick(&mut self) -> bool {
        self.inactivity += 1;
        self.inactivity >= self.inactivity_limit
    }

    async fn summarize(&self, model: &dyn InferenceResource) -> Vec<String> {
        let prompt = self.prompts.keyword_generation(&self.transcript);
        debug!(target: PROMPT, %prompt, "generating conversation keywords");
        match model.invoke(&prompt, &self.options).await {
            Ok(raw) => {
                debug!(target: MONOLOGUE, %raw, "keyword generation output");
                extract_marked(&raw)
            }
            Err(e) => {
                warn!(error = %e, "could not summarize conversation");
                Vec::new()
            }
        }
    }

    async fn persist(&self, store: &ArtifactStore) -> Option<ArtifactId> {
        match store.create(ArtifactKind::Conversation, &self.transcript).await {
            Ok(id) => Some(id),
            Err(e) => {
                error!(error = %e, "could not save conversation");
                None
            }
        }
    }

    async fn end(&mut self, model: &dyn InferenceResource, store: &ArtifactStore) -> Option<ArtifactId> {
        let saved = if self.transcript.is_empty() {
            debug!("nothing was said, conversation not saved");
            None
        } else {
            let saved = self.persist(store).await;
            if let Some(id) = &saved {
                let keywords = self.summarize(model).await;
                if keywords.is_empty() {
                    warn!(%id, "conversation saved without keywords");
                } else if let Err(e) = store.put(&keywords, id).await {
                    error!(%id, error = %e, "could not index conversation");
                } else {
                    info!(%id, ?keywords, "conversation memorized");
                }
            }
            saved
        };
        self.reset();
        self.flags.set_engaged(false);
        saved
    }
}
