//! Console front end for the attention loop: stdin lines go in, replies and
//! mode changes come out.

use std::io::{self, BufRead, Write};

use anyhow::Result;
use somna_runtime::{AttentionEvent, AttentionScheduler, ConsolidationOutcome, ReflectionOutcome};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

pub(crate) async fn run_console(
    scheduler: AttentionScheduler,
    mut events: mpsc::UnboundedReceiver<AttentionEvent>,
) -> Result<()> {
    let (input_tx, input_rx) = mpsc::channel(16);
    spawn_stdin_reader(input_tx);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, shutting down");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => warn!(error = %e, "could not listen for interrupt"),
        }
    });

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Some(line) = render_event(&event) {
                println!("{line}");
                let _ = io::stdout().flush();
            }
        }
    });

    println!("somna is listening. Type to talk, ctrl-c to leave.");
    let result = scheduler.run(input_rx, shutdown_rx).await;
    let _ = printer.await;
    result
}

/// Blocking reader on a plain thread so a pending read never holds up exit.
fn spawn_stdin_reader(tx: mpsc::Sender<String>) {
    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
}

pub(crate) fn render_event(event: &AttentionEvent) -> Option<String> {
    match event {
        AttentionEvent::Reply(text) => Some(format!("AI: {text}")),
        AttentionEvent::Unanswered => Some("(no answer, try again)".to_string()),
        AttentionEvent::SessionOpened => None,
        AttentionEvent::SessionClosed { transcript } => Some(match transcript {
            Some(id) => format!("(conversation saved as {id})"),
            None => "(conversation closed)".to_string(),
        }),
        AttentionEvent::Reflected(outcome) => Some(format!("(reflection: {})", describe_reflection(outcome))),
        AttentionEvent::Consolidated(outcome) => {
            Some(format!("(consolidation: {})", describe_consolidation(outcome)))
        }
        AttentionEvent::Failed { mode, error } => Some(format!("({mode} failed: {error})")),
    }
}

pub(crate) fn describe_reflection(outcome: &ReflectionOutcome) -> String {
    match outcome {
        ReflectionOutcome::NothingToReflect => "nothing to reflect on".to_string(),
        ReflectionOutcome::NothingSelected => "no topic selected".to_string(),
        ReflectionOutcome::NoMaterial { selected } => {
            format!("no conversations found for {}", selected.join(", "))
        }
        ReflectionOutcome::Archived { conclusion, selected } => {
            format!("{} judged uninspiring, archived {conclusion}", selected.join(", "))
        }
        ReflectionOutcome::Pending { conclusion, selected } => {
            format!("new perspective on {} in {conclusion}", selected.join(", "))
        }
    }
}

pub(crate) fn describe_consolidation(outcome: &ConsolidationOutcome) -> String {
    match outcome {
        ConsolidationOutcome::NoConclusion => "no conclusion pending".to_string(),
        ConsolidationOutcome::Consolidated { conclusion, units, .. } => {
            format!("{conclusion} learned from {units} training unit(s)")
        }
    }
}
