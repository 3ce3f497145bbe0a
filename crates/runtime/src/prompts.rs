//! Prompt templates with built-in defaults, optionally overridden per key
//! from a JSON file.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const HUMAN_INTERACTION: &str = "<s>[INST] <<SYS>>\n\
You are engaged in a conversation. Answer the latest message directly and \
in your own words, drawing on what was said earlier in the exchange.\n\
<</SYS>>\n\n";

const KEYWORD_GENERATION: &str = "[INST] Read the conversation below and list \
the keywords that best describe what it was about. Write every keyword \
between double asterisks, like **keyword**, and write nothing else.\n\n\
Conversation:\n{chat_history} [/INST]";

const KEYWORD_SELECTION: &str = "[INST] These are the topics of your recent \
conversations: {keywords_list}.\nPick the ones you find worth thinking about \
more deeply. Repeat each chosen topic exactly as written, between double \
asterisks. [/INST]";

const PERSPECTIVE_EXPLANATION: &str = "[INST] Below are your recent \
conversations.\n\n{interaction_history}\n\nExplain how these conversations \
should change the way you think or respond in the future. If they bring \
nothing new, answer only with **uninspiring**. [/INST]";

const DREAM_SPINNING: &str = "[INST] You concluded the following about \
yourself:\n\n{adaptation_summary}\n\nWrite one short exchange that shows this \
change in practice. Start the question with **QUESTION**, start your answer \
with **RESPONSE** and finish with **END**. [/INST]";

const DREAM_TEMPLATE: &str = "<s>[INST] {stimulus} [/INST] {reaction}</s>";

/// Every template the runtime renders. Any key missing from the override
/// file keeps its default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptTemplates {
    /// Opening of every conversation; turns are appended to it.
    pub human_interaction: String,
    pub keyword_generation: String,
    pub keyword_selection: String,
    pub perspective_explanation: String,
    pub dream_spinning: String,
    /// Layout of one accepted training unit.
    pub dream_template: String,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self {
            human_interaction: HUMAN_INTERACTION.to_string(),
            keyword_generation: KEYWORD_GENERATION.to_string(),
            keyword_selection: KEYWORD_SELECTION.to_string(),
            perspective_explanation: PERSPECTIVE_EXPLANATION.to_string(),
            dream_spinning: DREAM_SPINNING.to_string(),
            dream_template: DREAM_TEMPLATE.to_string(),
        }
    }
}

impl PromptTemplates {
    /// Defaults overlaid with `path` when it exists. An unreadable or
    /// malformed file is reported and ignored.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "using built-in prompt templates");
                return Self::default();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(templates) => templates,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring malformed prompt templates");
                Self::default()
            }
        }
    }

    pub fn keyword_generation(&self, chat_history: &str) -> String {
        self.keyword_generation.replace("{chat_history}", chat_history)
    }

    pub fn keyword_selection(&self, keywords_list: &str) -> String {
        self.keyword_selection.replace("{keywords_list}", keywords_list)
    }

    pub fn perspective_explanation(&self, interaction_history: &str) -> String {
        self.perspective_explanation
            .replace("{interaction_history}", interaction_history)
    }

    pub fn dream_spinning(&self, adaptation_summary: &str) -> String {
        self.dream_spinning
            .replace("{adaptation_summary}", adaptation_summary)
    }

    pub fn dream(&self, stimulus: &str, reaction: &str) -> String {
        self.dream_template
            .replace("{stimulus}", stimulus)
            .replace("{reaction}", reaction)
    }
}
