//! External process execution for self-consolidation: the [`ToolRunner`]
//! seam, the fine-tuning [`Toolchain`], the model file swap and the cleanup
//! that follows it.

pub mod cleanup;
pub mod swap;
pub mod toolchain;

use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, warn};

pub use cleanup::finetune_cleanup;
pub use swap::{SwapError, transplant};
pub use toolchain::{Toolchain, ToolchainError};

// ── Exit status ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolExit {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
}

impl ToolExit {
    pub fn success() -> Self {
        Self { code: Some(0) }
    }

    pub fn failed(code: i32) -> Self {
        Self { code: Some(code) }
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }
}

// ── Runner ───────────────────────────────────────────────────────────────────

/// Runs an external program to completion and reports its exit status.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(&self, program: &Path, args: &[String]) -> std::io::Result<ToolExit>;
}

/// [`ToolRunner`] backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl ToolRunner for ProcessRunner {
    async fn run(&self, program: &Path, args: &[String]) -> std::io::Result<ToolExit> {
        debug!(program = %program.display(), ?args, "spawning tool");
        let output = tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?;

        let exit = ToolExit {
            code: output.status.code(),
        };
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            debug!(program = %program.display(), stdout = %stdout.trim_end(), "tool output");
        }
        if !exit.is_success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(program = %program.display(), code = ?exit.code, stderr = %stderr.trim_end(), "tool exited unsuccessfully");
        }
        Ok(exit)
    }
}
