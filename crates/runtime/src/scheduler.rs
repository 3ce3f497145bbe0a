//! The top-level attention loop.
//!
//! One mode runs at a time. Each step picks, in priority order: a pending
//! consolidation, the open conversation, or an idle countdown that ends in a
//! reflection cycle unless input arrives first.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use somna_config::AppConfig;
use somna_exec::{ToolRunner, Toolchain};
use somna_llm::{InferenceResource, InvokeOptions, ModelLoader};
use somna_memory::{ArtifactId, ArtifactStore};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::MURMUR;
use crate::consolidation::{ConsolidationCycle, ConsolidationOutcome};
use crate::countdown::{Ticker, countdown};
use crate::flags::ModeFlags;
use crate::prompts::PromptTemplates;
use crate::reflection::{ReflectionCycle, ReflectionOutcome};
use crate::session::{LanguageSession, SensoryChannel, TurnOutcome};

/// Everything the loop reports to the outside world.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttentionEvent {
    Reply(String),
    Unanswered,
    SessionOpened,
    SessionClosed { transcript: Option<ArtifactId> },
    Reflected(ReflectionOutcome),
    Consolidated(ConsolidationOutcome),
    Failed { mode: &'static str, error: String },
}

enum Step {
    Continue,
    Shutdown,
}

pub struct AttentionScheduler {
    config: AppConfig,
    store: Arc<ArtifactStore>,
    prompts: Arc<PromptTemplates>,
    flags: Arc<ModeFlags>,
    loader: Arc<dyn ModelLoader>,
    toolchain: Toolchain,
    options: InvokeOptions,
    model: Box<dyn InferenceResource>,
    session: LanguageSession,
    ticker: Ticker,
    events: mpsc::UnboundedSender<AttentionEvent>,
    retry_at: Option<Instant>,
    input_closed: bool,
}

impl AttentionScheduler {
    /// Load the model and restore mode flags from disk. A model that cannot
    /// be loaded is fatal.
    pub async fn wake(
        config: AppConfig,
        store: Arc<ArtifactStore>,
        loader: Arc<dyn ModelLoader>,
        runner: Arc<dyn ToolRunner>,
        events: mpsc::UnboundedSender<AttentionEvent>,
    ) -> Result<Self> {
        info!(target: MURMUR, "just a second, I'm waking up...");
        let model = loader.load().await.context("could not load inference resource")?;

        let prompts = Arc::new(PromptTemplates::load(&config.paths.prompts_path));
        let flags = Arc::new(ModeFlags::new());
        let options = InvokeOptions::from_config(&config);
        let session = LanguageSession::new(
            &config.interaction,
            Arc::clone(&flags),
            Arc::clone(&prompts),
            options,
        );
        let ticker = Ticker::new(Duration::from_millis(config.attention.tick_millis.max(1)));
        let toolchain = Toolchain::from_config(&config.consolidation, runner);

        let scheduler = Self {
            config,
            store,
            prompts,
            flags,
            loader,
            toolchain,
            options,
            model,
            session,
            ticker,
            events,
            retry_at: None,
            input_closed: false,
        };
        scheduler.recover_pending().await;
        Ok(scheduler)
    }

    pub fn flags(&self) -> &Arc<ModeFlags> {
        &self.flags
    }

    /// Drive the loop until `shutdown` turns true. An open conversation is
    /// closed and saved on the way out.
    pub async fn run(mut self, mut input: mpsc::Receiver<String>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("starting attention loop");
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Step::Shutdown = self.step(&mut input, &mut shutdown).await? {
                break;
            }
        }
        if self.session.is_open() {
            self.close_session().await;
        }
        info!("attention loop stopped");
        Ok(())
    }

    async fn step(&mut self, input: &mut mpsc::Receiver<String>, shutdown: &mut watch::Receiver<bool>) -> Result<Step> {
        if self.flags.is_consolidation_pending() && self.retry_due() {
            self.consolidate_now().await?;
            return Ok(Step::Continue);
        }
        if self.session.is_open() {
            return Ok(self.attend(input, shutdown).await);
        }
        Ok(self.idle(input, shutdown).await)
    }

    // ── Interacting ──────────────────────────────────────────────────────────

    async fn attend(&mut self, input: &mut mpsc::Receiver<String>, shutdown: &mut watch::Receiver<bool>) -> Step {
        tokio::select! {
            _ = shutdown_requested(shutdown) => Step::Shutdown,
            line = next_input(input, self.input_closed) => {
                self.accept(line).await;
                Step::Continue
            }
            _ = self.ticker.tick() => {
                if self.session.tick() {
                    info!(limit = self.config.interaction.inactivity_limit, "inactivity limit reached, closing conversation");
                    self.close_session().await;
                }
                Step::Continue
            }
        }
    }

    async fn accept(&mut self, line: Option<String>) {
        match line {
            Some(line) => self.handle_input(line).await,
            None => {
                self.input_closed = true;
                info!("input channel closed");
                if self.session.is_open() {
                    self.close_session().await;
                }
            }
        }
    }

    async fn handle_input(&mut self, line: String) {
        if line.trim().is_empty() {
            return;
        }
        if !self.session.is_open() {
            info!(target: MURMUR, "someone is talking to me");
            self.session.start();
            self.emit(AttentionEvent::SessionOpened);
        }
        let outcome = self.session.receive(self.model.as_ref(), &line).await;
        // inactivity is measured from the latest input
        self.ticker.reset();
        match outcome {
            TurnOutcome::Reply(text) => self.emit(AttentionEvent::Reply(text)),
            TurnOutcome::Unanswered => self.emit(AttentionEvent::Unanswered),
            TurnOutcome::Terminate => self.close_session().await,
        }
    }

    async fn close_session(&mut self) {
        let transcript = self.session.end(self.model.as_ref(), &self.store).await;
        self.emit(AttentionEvent::SessionClosed { transcript });
    }

    // ── Idle ─────────────────────────────────────────────────────────────────

    async fn idle(&mut self, input: &mut mpsc::Receiver<String>, shutdown: &mut watch::Receiver<bool>) -> Step {
        if self.flags.is_consolidation_pending() {
            // waiting out the retry backoff: conversations allowed, reflection not
            return tokio::select! {
                _ = shutdown_requested(shutdown) => Step::Shutdown,
                line = next_input(input, self.input_closed) => {
                    self.accept(line).await;
                    Step::Continue
                }
                _ = self.ticker.tick() => Step::Continue,
            };
        }

        let ticks = self.countdown_ticks();
        debug!(ticks, "idle countdown started");
        tokio::select! {
            _ = shutdown_requested(shutdown) => Step::Shutdown,
            line = next_input(input, self.input_closed) => {
                self.accept(line).await;
                Step::Continue
            }
            _ = countdown(&mut self.ticker, ticks) => {
                self.reflect_now().await;
                Step::Continue
            }
        }
    }

    fn countdown_ticks(&self) -> u64 {
        let period = self.ticker.period().as_millis().max(1) as u64;
        (self.config.attention.idle_countdown_secs * 1000).div_ceil(period)
    }

    // ── Reflecting ───────────────────────────────────────────────────────────

    /// Run one reflection cycle unless a conclusion is already waiting.
    pub async fn reflect_now(&mut self) -> Option<ReflectionOutcome> {
        if self.recover_pending().await {
            debug!("conclusion pending, reflection skipped");
            return None;
        }
        let result = {
            let cycle = ReflectionCycle::new(
                &self.store,
                &self.prompts,
                &self.flags,
                self.options,
                &self.config.reflection.uninspiring_marker,
            );
            cycle.run(self.model.as_ref()).await
        };
        match result {
            Ok(outcome) => {
                debug!(?outcome, "reflection finished");
                self.emit(AttentionEvent::Reflected(outcome.clone()));
                Some(outcome)
            }
            Err(e) => {
                error!(error = format!("{e:#}"), "reflection failed");
                self.emit(AttentionEvent::Failed {
                    mode: "reflection",
                    error: format!("{e:#}"),
                });
                None
            }
        }
    }

    /// Set the pending flag from disk state. Returns whether a conclusion is
    /// waiting.
    async fn recover_pending(&self) -> bool {
        match self.store.pending_conclusions().await {
            Ok(pending) if !pending.is_empty() => {
                if !self.flags.is_consolidation_pending() {
                    info!(count = pending.len(), "found unprocessed conclusions");
                    self.flags.set_consolidation_pending(true);
                }
                true
            }
            Ok(_) => false,
            Err(e) => {
                warn!(error = %e, "could not check for pending conclusions");
                self.flags.is_consolidation_pending()
            }
        }
    }

    // ── Consolidating ────────────────────────────────────────────────────────

    /// Run one consolidation cycle. Only a failure to reload the model
    /// afterwards is returned as an error; cycle failures are reported and
    /// retried after the configured backoff.
    pub async fn consolidate_now(&mut self) -> Result<Option<ConsolidationOutcome>> {
        let result = {
            let cycle = ConsolidationCycle::new(
                &self.store,
                &self.prompts,
                &self.flags,
                &self.toolchain,
                &self.config,
                self.options,
            );
            cycle.run(self.model.as_ref()).await
        };
        match result {
            Ok(outcome) => {
                self.retry_at = None;
                if let ConsolidationOutcome::Consolidated { .. } = outcome {
                    self.model = self
                        .loader
                        .load()
                        .await
                        .context("could not reload inference resource after consolidation")?;
                    info!(target: MURMUR, "awake again, with a slightly different mind");
                }
                self.emit(AttentionEvent::Consolidated(outcome.clone()));
                Ok(Some(outcome))
            }
            Err(e) => {
                let backoff = Duration::from_secs(self.config.consolidation.retry_backoff_secs);
                error!(error = format!("{e:#}"), retry_in = ?backoff, "consolidation failed");
                self.retry_at = Some(Instant::now() + backoff);
                self.emit(AttentionEvent::Failed {
                    mode: "consolidation",
                    error: format!("{e:#}"),
                });
                Ok(None)
            }
        }
    }

    fn retry_due(&self) -> bool {
        self.retry_at.is_none_or(|at| Instant::now() >= at)
    }

    fn emit(&self, event: AttentionEvent) {
        let _ = self.events.send(event);
    }
}

async fn next_input(input: &mut mpsc::Receiver<String>, closed: bool) -> Option<String> {
    if closed {
        std::future::pending().await
    } else {
        input.recv().await
    }
}

/// Resolves once shutdown is signalled or its sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
