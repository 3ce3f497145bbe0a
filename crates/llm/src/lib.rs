//! Inference plumbing: the [`InferenceResource`] seam the runtime talks to,
//! Ollama and OpenRouter clients behind it, and extraction of `**marked**`
//! items from model output.

use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use regex::Regex;
use reqwest::header::CONTENT_LENGTH;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use somna_config::AppConfig;
use thiserror::Error;
use tracing::{debug, info, warn};

const OPENROUTER_ENDPOINT: &str = "https://openrouter.ai/api/v1/chat/completions";

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("{provider} unavailable at {endpoint}: {source}")]
    Unavailable {
        provider: &'static str,
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{provider} error ({status}): {body}")]
    Status {
        provider: &'static str,
        status: u16,
        body: String,
    },

    #[error("{provider} response missing text: {body}")]
    MissingText { provider: &'static str, body: String },

    #[error("OPENROUTER_API_KEY is not set")]
    MissingKey,
}

// ── Options ──────────────────────────────────────────────────────────────────

/// Sampling and sizing knobs passed with every invocation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InvokeOptions {
    pub temperature: f32,
    pub context_size: u32,
    pub batch_size: u32,
    pub max_tokens: u32,
    pub threads: u32,
}

impl InvokeOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            temperature: config.model.temperature,
            context_size: config.model.context_size,
            batch_size: config.batch_size(),
            max_tokens: config.model.max_tokens,
            threads: config.consolidation.threads,
        }
    }
}

impl Default for InvokeOptions {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

// ── Seams ────────────────────────────────────────────────────────────────────

/// A loaded model: prompt in, text out.
#[async_trait]
pub trait InferenceResource: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, prompt: &str, options: &InvokeOptions) -> Result<String, InferenceError>;
}

/// Produces a fresh [`InferenceResource`]; called at wake-up and after every
/// consolidation.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self) -> Result<Box<dyn InferenceResource>>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Provider {
    Ollama,
    OpenRouter,
}

impl Provider {
    pub fn from_name(name: &str) -> Self {
        if name.eq_ignore_ascii_case("openrouter") {
            Self::OpenRouter
        } else {
            Self::Ollama
        }
    }
}

// ── Ollama ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }

    fn endpoint(&self) -> String {
        self.url("/api/generate")
    }

    /// The prompt already carries its own chat framing, so the server's
    /// template is bypassed with `raw`.
    pub fn payload(model: &str, prompt: &str, options: &InvokeOptions) -> Value {
        json!({
            "model": model,
            "prompt": prompt,
            "stream": false,
            "raw": true,
            "options": {
                "temperature": options.temperature,
                "num_ctx": options.context_size,
                "num_batch": options.batch_size,
                "num_predict": options.max_tokens,
                "num_thread": options.threads,
            }
        })
    }

    pub fn parse_body(body: Value) -> Result<String, InferenceError> {
        match body.get("response").and_then(Value::as_str) {
            Some(text) => Ok(text.to_string()),
            None => Err(InferenceError::MissingText {
                provider: "Ollama",
                body: body.to_string(),
            }),
        }
    }

    pub async fn generate(&self, model: &str, prompt: &str, options: &InvokeOptions) -> Result<String, InferenceError> {
        let endpoint = self.endpoint();
        let unavailable = |source| InferenceError::Unavailable {
            provider: "Ollama",
            endpoint: endpoint.clone(),
            source,
        };
        let response = self
            .client
            .post(&endpoint)
            .json(&Self::payload(model, prompt, options))
            .send()
            .await
            .map_err(unavailable)?;

        let status = response.status();
        let body: Value = response.json().await.map_err(unavailable)?;
        if !status.is_success() {
            return Err(InferenceError::Status {
                provider: "Ollama",
                status: status.as_u16(),
                body: body.to_string(),
            });
        }
        Self::parse_body(body)
    }

    pub fn create_payload(model: &str, file_name: &str, digest: &str) -> Value {
        let mut files = serde_json::Map::new();
        files.insert(file_name.to_string(), Value::from(digest));
        json!({
            "model": model,
            "files": files,
            "stream": false,
        })
    }

    /// Upload `path` to the server's blob store unless a blob with the same
    /// digest is already there. Returns the `sha256:<hex>` digest.
    pub async fn push_blob(&self, path: &Path) -> Result<String> {
        let digest = file_digest(path)
            .await
            .with_context(|| format!("could not hash {}", path.display()))?;
        let url = self.url(&format!("/api/blobs/{digest}"));

        let existing = self
            .client
            .head(&url)
            .send()
            .await
            .with_context(|| format!("ollama unavailable at {url}"))?;
        if existing.status().is_success() {
            debug!(%digest, "model blob already present");
            return Ok(digest);
        }

        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("could not open {}", path.display()))?;
        let len = file.metadata().await?.len();
        info!(%digest, bytes = len, "uploading model blob");
        let response = self
            .client
            .post(&url)
            .header(CONTENT_LENGTH, len)
            .body(file)
            .send()
            .await
            .with_context(|| format!("ollama unavailable at {url}"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("ollama rejected blob {digest} ({status}): {body}");
        }
        Ok(digest)
    }

    /// (Re)create the served model `model` from the GGUF file at `path`, so
    /// later generations run on exactly those weights.
    pub async fn create_model(&self, model: &str, path: &Path) -> Result<String> {
        let digest = self.push_blob(path).await?;
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("model.gguf");

        let url = self.url("/api/create");
        let response = self
            .client
            .post(&url)
            .json(&Self::create_payload(model, file_name, &digest))
            .send()
            .await
            .with_context(|| format!("ollama unavailable at {url}"))?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            bail!("ollama could not create model '{model}' ({status}): {body}");
        }
        info!(model, %digest, path = %path.display(), "served model created");
        Ok(digest)
    }
}

async fn file_digest(path: &Path) -> std::io::Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher)?;
        Ok(format!("sha256:{:x}", hasher.finalize()))
    })
    .await
    .map_err(std::io::Error::other)?
}

// ── OpenRouter ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct OpenRouterClient {
    client: reqwest::Client,
}

impl OpenRouterClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_key() -> bool {
        std::env::var("OPENROUTER_API_KEY")
            .map(|key| !key.trim().is_empty())
            .unwrap_or(false)
    }

    pub fn payload(model: &str, prompt: &str, options: &InvokeOptions) -> Value {
        json!({
            "model": model,
            "messages": [
                {"role": "user", "content": prompt}
            ],
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
        })
    }

    pub fn parse_body(body: Value) -> Result<String, InferenceError> {
        body.get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| InferenceError::MissingText {
                provider: "OpenRouter",
                body: body.to_string(),
            })
    }

    pub async fn chat(&self, model: &str, prompt: &str, options: &InvokeOptions) -> Result<String, InferenceError> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or(InferenceError::MissingKey)?;
        let unavailable = |source| InferenceError::Unavailable {
            provider: "OpenRouter",
            endpoint: OPENROUTER_ENDPOINT.to_string(),
            source,
        };

        let response = self
            .client
            .post(OPENROUTER_ENDPOINT)
            .bearer_auth(api_key)
            .header("X-Title", "Somna")
            .json(&Self::payload(model, prompt, options))
            .send()
            .await
            .map_err(unavailable)?;

        let status = response.status();
        let body: Value = response.json().await.map_err(unavailable)?;
        if !status.is_success() {
            return Err(InferenceError::Status {
                provider: "OpenRouter",
                status: status.as_u16(),
                body: body.to_string(),
            });
        }
        Self::parse_body(body)
    }
}

// ── Router ───────────────────────────────────────────────────────────────────

/// Sends prompts to the configured provider, falling back to OpenRouter when
/// a local Ollama server is unreachable and an API key is available.
#[derive(Debug, Clone)]
pub struct LlmRouter {
    primary: Provider,
    ollama: OllamaClient,
    openrouter: OpenRouterClient,
    ollama_model: String,
    openrouter_model: String,
}

impl LlmRouter {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            primary: Provider::from_name(&config.model.provider),
            ollama: OllamaClient::new(config.model.base_url.clone()),
            openrouter: OpenRouterClient::new(),
            ollama_model: config.model.name.clone(),
            openrouter_model: config.model.openrouter_model.clone(),
        }
    }

    pub fn primary(&self) -> Provider {
        self.primary
    }

    pub async fn chat_with_fallback(&self, prompt: &str, options: &InvokeOptions) -> Result<(Provider, String), InferenceError> {
        match self.primary {
            Provider::Ollama => match self.ollama.generate(&self.ollama_model, prompt, options).await {
                Ok(text) => Ok((Provider::Ollama, text)),
                Err(err @ InferenceError::Unavailable { .. }) if OpenRouterClient::has_key() => {
                    warn!(error = %err, "ollama unreachable, falling back to openrouter");
                    let text = self.openrouter.chat(&self.openrouter_model, prompt, options).await?;
                    Ok((Provider::OpenRouter, text))
                }
                Err(err) => Err(err),
            },
            Provider::OpenRouter => Ok((
                Provider::OpenRouter,
                self.openrouter.chat(&self.openrouter_model, prompt, options).await?,
            )),
        }
    }
}

#[async_trait]
impl InferenceResource for LlmRouter {
    fn name(&self) -> &str {
        match self.primary {
            Provider::Ollama => &self.ollama_model,
            Provider::OpenRouter => &self.openrouter_model,
        }
    }

    async fn invoke(&self, prompt: &str, options: &InvokeOptions) -> Result<String, InferenceError> {
        let (provider, text) = self.chat_with_fallback(prompt, options).await?;
        debug!(?provider, chars = text.len(), "inference complete");
        Ok(text)
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

/// Serves the model file at `model.path` under `model.name`, builds an
/// [`LlmRouter`] from configuration and proves it answers. Every load
/// re-registers the file, so a reload after a model swap runs the new weights.
#[derive(Debug, Clone)]
pub struct ConfiguredLoader {
    config: AppConfig,
    health_timeout: Duration,
}

impl ConfiguredLoader {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            health_timeout: Duration::from_secs(120),
        }
    }
}

#[async_trait]
impl ModelLoader for ConfiguredLoader {
    async fn load(&self) -> Result<Box<dyn InferenceResource>> {
        let model = &self.config.model;
        if !model.is_remote() {
            let path = Path::new(&model.path);
            if !path.is_file() {
                bail!("model file not found: {}", model.path);
            }
            OllamaClient::new(model.base_url.clone())
                .create_model(&model.name, path)
                .await
                .with_context(|| format!("could not serve {} as '{}'", model.path, model.name))?;
        }

        let router = LlmRouter::from_config(&self.config);
        let health_check = InvokeOptions {
            max_tokens: 1,
            ..InvokeOptions::from_config(&self.config)
        };
        tokio::time::timeout(self.health_timeout, router.invoke("Hello", &health_check))
            .await
            .context("inference health check timed out")?
            .with_context(|| format!("inference resource '{}' failed health check", router.name()))?;

        info!(provider = ?router.primary(), model = router.name(), "inference resource ready");
        Ok(Box::new(router))
    }
}

// ── Marker extraction ────────────────────────────────────────────────────────

static MARKED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*(.*?)\*\*").expect("marker pattern is valid"));

/// Every `**item**` in `text`, trimmed and lowercased, first occurrence
/// order, duplicates and blanks dropped.
pub fn extract_marked(text: &str) -> Vec<String> {
    let mut items: Vec<String> = Vec::new();
    for captures in MARKED_RE.captures_iter(text) {
        let item = captures[1].trim().to_lowercase();
        if !item.is_empty() && !items.contains(&item) {
            items.push(item);
        }
    }
    items
}

/// Wrap each item as `**item**`, comma separated, for prompts that ask the
/// model to choose among them.
pub fn mark_all<S: AsRef<str>>(items: &[S]) -> String {
    items
        .iter()
        .map(|item| format!("**{}**", item.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn extract_marked_lowercases_and_dedups() {
        let raw = "Keywords: **Rust**, **async IO**, **rust**, ** **, and **Tokio**.";
        assert_eq!(extract_marked(raw), vec!["rust", "async io", "tokio"]);
    }

    #[test]
    fn extract_marked_ignores_unclosed() {
        assert!(extract_marked("no markers here").is_empty());
        assert_eq!(extract_marked("**one** and **two"), vec!["one"]);
    }

    #[test]
    fn mark_all_wraps_each_item() {
        assert_eq!(mark_all(&["travel", "food"]), "**travel**, **food**");
        assert_eq!(mark_all::<&str>(&[]), "");
    }

    #[test]
    fn mark_all_feeds_back_into_extract() {
        let keywords = ["travel", "food"];
        assert_eq!(extract_marked(&mark_all(&keywords)), keywords);
    }

    #[test]
    fn ollama_payload_maps_options() {
        let options = InvokeOptions {
            temperature: 0.5,
            context_size: 2048,
            batch_size: 32,
            max_tokens: 100,
            threads: 8,
        };
        let payload = OllamaClient::payload("somna", "hi", &options);
        assert_eq!(payload["model"], "somna");
        assert_eq!(payload["raw"], true);
        assert_eq!(payload["stream"], false);
        assert_eq!(payload["options"]["num_ctx"], 2048);
        assert_eq!(payload["options"]["num_batch"], 32);
        assert_eq!(payload["options"]["num_predict"], 100);
        assert_eq!(payload["options"]["num_thread"], 8);
    }

    #[test]
    fn options_derive_batch_from_threads() {
        let mut config = AppConfig::default();
        config.consolidation.threads = 6;
        config.model.batch_size = 0;
        let options = InvokeOptions::from_config(&config);
        assert_eq!(options.batch_size, 24);
        assert_eq!(options.threads, 6);
    }

    #[test]
    fn parse_bodies() {
        let ok = OllamaClient::parse_body(json!({"response": "hello"})).unwrap();
        assert_eq!(ok, "hello");
        let err = OllamaClient::parse_body(json!({"error": "boom"})).unwrap_err();
        assert!(matches!(err, InferenceError::MissingText { provider: "Ollama", .. }));

        let ok = OpenRouterClient::parse_body(json!({
            "choices": [{"message": {"content": "hey"}}]
        }))
        .unwrap();
        assert_eq!(ok, "hey");
        assert!(OpenRouterClient::parse_body(json!({"choices": []})).is_err());
    }

    #[test]
    fn provider_from_name() {
        assert_eq!(Provider::from_name("OpenRouter"), Provider::OpenRouter);
        assert_eq!(Provider::from_name("ollama"), Provider::Ollama);
        assert_eq!(Provider::from_name("anything"), Provider::Ollama);
    }

    // ── Fake Ollama server ──────────────────────────────────────────────────

    type Requests = Arc<Mutex<Vec<(String, String, Vec<u8>)>>>;

    /// Minimal HTTP/1.1 responder that records every request. `/api/create`
    /// answers with `create_status`.
    async fn fake_ollama(create_status: &'static str) -> (String, Requests) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests: Requests = Arc::default();
        let log = Arc::clone(&requests);
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let log = Arc::clone(&log);
                tokio::spawn(async move {
                    let mut raw = Vec::new();
                    let mut buf = [0u8; 8192];
                    let head_end = loop {
                        let n = stream.read(&mut buf).await.unwrap();
                        if n == 0 {
                            return;
                        }
                        raw.extend_from_slice(&buf[..n]);
                        if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
                            break pos + 4;
                        }
                    };
                    let head = String::from_utf8_lossy(&raw[..head_end]).to_string();
                    let mut lines = head.lines();
                    let mut request_line = lines.next().unwrap().split_whitespace();
                    let method = request_line.next().unwrap().to_string();
                    let path = request_line.next().unwrap().to_string();
                    let length = lines
                        .filter_map(|line| line.split_once(':'))
                        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                        .map_or(0, |(_, value)| value.trim().parse::<usize>().unwrap());
                    let mut body = raw[head_end..].to_vec();
                    while body.len() < length {
                        let n = stream.read(&mut buf).await.unwrap();
                        if n == 0 {
                            break;
                        }
                        body.extend_from_slice(&buf[..n]);
                    }

                    let (status, reply) = match (method.as_str(), path.as_str()) {
                        ("HEAD", _) => ("404 Not Found", ""),
                        ("POST", p) if p.starts_with("/api/blobs/") => ("201 Created", ""),
                        ("POST", "/api/create") => (create_status, r#"{"status":"success"}"#),
                        ("POST", "/api/generate") => ("200 OK", r#"{"response":"hi"}"#),
                        _ => ("404 Not Found", "{}"),
                    };
                    log.lock().unwrap().push((method, path, body));
                    let response = format!(
                        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{reply}",
                        reply.len()
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        });
        (format!("http://{addr}"), requests)
    }

    fn sha256_of(bytes: &[u8]) -> String {
        format!("sha256:{:x}", Sha256::digest(bytes))
    }

    fn served_config(base_url: String, model_path: &Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.model.provider = "ollama".to_string();
        config.model.name = "somna".to_string();
        config.model.base_url = base_url;
        config.model.path = model_path.to_string_lossy().into_owned();
        config
    }

    #[test]
    fn create_payload_names_the_file_blob() {
        let payload = OllamaClient::create_payload("somna", "llama.gguf", "sha256:abc");
        assert_eq!(payload["model"], "somna");
        assert_eq!(payload["files"]["llama.gguf"], "sha256:abc");
        assert_eq!(payload["stream"], false);
    }

    #[tokio::test]
    async fn reload_serves_the_swapped_model_file() {
        let (base_url, requests) = fake_ollama("200 OK").await;
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("llama.gguf");
        std::fs::write(&model_path, b"original weights").unwrap();
        let loader = ConfiguredLoader::new(served_config(base_url, &model_path));

        loader.load().await.unwrap();
        // consolidation swaps a merged file into the same path
        std::fs::write(&model_path, b"merged weights").unwrap();
        let model = loader.load().await.unwrap();
        assert_eq!(model.name(), "somna");

        let requests = requests.lock().unwrap();
        let uploads: Vec<_> = requests
            .iter()
            .filter(|(method, path, _)| method == "POST" && path.starts_with("/api/blobs/"))
            .collect();
        assert_eq!(uploads.len(), 2);
        assert_eq!(uploads[1].1, format!("/api/blobs/{}", sha256_of(b"merged weights")));
        assert_eq!(uploads[1].2, b"merged weights");

        let creates: Vec<Value> = requests
            .iter()
            .filter(|(_, path, _)| path == "/api/create")
            .map(|(_, _, body)| serde_json::from_slice(body).unwrap())
            .collect();
        assert_eq!(creates.len(), 2);
        assert_eq!(creates[1]["model"], "somna");
        assert_eq!(creates[1]["files"]["llama.gguf"], sha256_of(b"merged weights"));

        // the health check runs after the model is registered
        let create_at = requests.iter().rposition(|(_, path, _)| path == "/api/create").unwrap();
        let generate_at = requests.iter().rposition(|(_, path, _)| path == "/api/generate").unwrap();
        assert!(create_at < generate_at);
    }

    #[tokio::test]
    async fn loader_fails_when_model_cannot_be_created() {
        let (base_url, requests) = fake_ollama("500 Internal Server Error").await;
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("llama.gguf");
        std::fs::write(&model_path, b"weights").unwrap();

        let err = ConfiguredLoader::new(served_config(base_url, &model_path))
            .load()
            .await
            .err()
            .unwrap();
        assert!(format!("{err:#}").contains("could not create model 'somna'"));
        assert!(!requests.lock().unwrap().iter().any(|(_, path, _)| path == "/api/generate"));
    }

    #[tokio::test]
    async fn loader_rejects_missing_model_file() {
        let mut config = AppConfig::default();
        config.model.provider = "ollama".to_string();
        config.model.path = "/nonexistent/model.gguf".to_string();
        let err = ConfiguredLoader::new(config).load().await.err().unwrap();
        assert!(err.to_string().contains("model file not found"));
    }
}
