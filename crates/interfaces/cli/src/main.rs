mod console;
mod logging;
mod memory_cmds;

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use fs2::FileExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

use somna_config::AppConfig;
use somna_exec::{ProcessRunner, Toolchain};
use somna_llm::{ConfiguredLoader, ModelLoader};
use somna_memory::ArtifactStore;
use somna_runtime::{AttentionScheduler, PromptTemplates, store_layout};

const DEFAULT_CONFIG_PATH: &str = "config/somna.toml";

#[derive(Debug, Parser)]
#[command(
    name = "somna",
    version,
    about = "A conversational agent that reflects while idle and fine-tunes itself on what it learns"
)]
struct Cli {
    /// Configuration file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the attention loop with console input.
    Run,
    /// Run one reflection cycle now.
    Reflect,
    /// Consolidate the pending conclusion, if any.
    Consolidate,
    /// Inspect or edit the short-term keyword index.
    Memory {
        #[command(subcommand)]
        command: MemoryCommands,
    },
    #[command(about = "Manage the configuration file")]
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Check the model file, the fine-tuning toolchain and inference.
    Doctor,
}

#[derive(Debug, Subcommand)]
enum MemoryCommands {
    /// List indexed keywords with their artifact counts.
    Keywords,
    /// Print the artifacts indexed under any of the keywords.
    Search {
        #[arg(required = true)]
        keywords: Vec<String>,
    },
    /// Remove keywords from the index.
    Forget {
        #[arg(required = true)]
        keywords: Vec<String>,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigCommands {
    /// Write the default configuration and prompt templates.
    Init {
        /// Overwrite an existing configuration file.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("invalid configuration in {}", cli.config.display()))?;
    let (_log_guard, log_file) = logging::init(&config.telemetry, Path::new(&config.paths.log_dir))?;
    info!(config = %cli.config.display(), log = %log_file.display(), "somna starting");

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let _lock = acquire_lock(&config.paths.lock_path)?;
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let scheduler = wake(config, events_tx).await?;
            console::run_console(scheduler, events_rx).await?;
        }
        Commands::Reflect => {
            let _lock = acquire_lock(&config.paths.lock_path)?;
            let (events_tx, _events_rx) = mpsc::unbounded_channel();
            let mut scheduler = wake(config, events_tx).await?;
            match scheduler.reflect_now().await {
                Some(outcome) => println!("{}", console::describe_reflection(&outcome)),
                None if scheduler.flags().is_consolidation_pending() => {
                    println!("a conclusion is already pending; run `somna consolidate` first")
                }
                None => bail!("reflection failed, see the log for details"),
            }
        }
        Commands::Consolidate => {
            let _lock = acquire_lock(&config.paths.lock_path)?;
            let (events_tx, _events_rx) = mpsc::unbounded_channel();
            let mut scheduler = wake(config, events_tx).await?;
            if !scheduler.flags().is_consolidation_pending() {
                println!("nothing to consolidate");
                return Ok(());
            }
            match scheduler.consolidate_now().await? {
                Some(outcome) => println!("{}", console::describe_consolidation(&outcome)),
                None => bail!("consolidation failed, see the log for details"),
            }
        }
        Commands::Memory { command } => {
            let store = ArtifactStore::open(store_layout(&config)).await?;
            match command {
                MemoryCommands::Keywords => memory_cmds::run_memory_keywords(&store).await?,
                MemoryCommands::Search { keywords } => memory_cmds::run_memory_search(&store, &keywords).await?,
                MemoryCommands::Forget { keywords } => {
                    let _lock = acquire_lock(&config.paths.lock_path)?;
                    memory_cmds::run_memory_forget(&store, &keywords).await?
                }
            }
        }
        Commands::Config { command } => match command {
            ConfigCommands::Init { force } => init_config(&cli.config, &config, force)?,
        },
        Commands::Doctor => run_doctor(&config).await,
    }

    Ok(())
}

async fn wake(
    config: AppConfig,
    events: mpsc::UnboundedSender<somna_runtime::AttentionEvent>,
) -> Result<AttentionScheduler> {
    let store = Arc::new(ArtifactStore::open(store_layout(&config)).await?);
    let loader = Arc::new(ConfiguredLoader::new(config.clone()));
    AttentionScheduler::wake(config, store, loader, Arc::new(ProcessRunner), events).await
}

/// Exclusive advisory lock held for the life of the returned file.
fn acquire_lock(path: &str) -> Result<File> {
    let path = Path::new(path);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(path)?;
    file.try_lock_exclusive()
        .map_err(|_| anyhow!("another somna instance already holds the lock at {}", path.display()))?;
    Ok(file)
}

fn init_config(path: &Path, current: &AppConfig, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    AppConfig::default().save_to(path)?;
    println!("wrote {}", path.display());

    let prompts_path = Path::new(&current.paths.prompts_path);
    if prompts_path.exists() {
        println!("kept existing prompt templates at {}", prompts_path.display());
    } else {
        if let Some(parent) = prompts_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let rendered = serde_json::to_string_pretty(&PromptTemplates::default())?;
        fs::write(prompts_path, rendered)?;
        println!("wrote {}", prompts_path.display());
    }
    Ok(())
}

async fn run_doctor(config: &AppConfig) {
    println!("somna doctor");
    println!("- provider: {}", config.model.provider);

    if config.model.is_remote() {
        println!("- model: {} (remote)", config.model.openrouter_model);
    } else if Path::new(&config.model.path).is_file() {
        println!("- model file: ok ({})", config.model.path);
    } else {
        println!("- model file: missing ({})", config.model.path);
    }

    let toolchain = Toolchain::from_config(&config.consolidation, Arc::new(ProcessRunner));
    match toolchain.verify() {
        Ok(()) => println!(
            "- toolchain: ok ({}, {})",
            toolchain.finetune_tool().display(),
            toolchain.merge_tool().display()
        ),
        Err(e) => println!("- toolchain: {e}"),
    }

    match ConfiguredLoader::new(config.clone()).load().await {
        Ok(model) => println!("- inference: ok ({})", model.name()),
        Err(e) => {
            warn!(error = format!("{e:#}"), "inference check failed");
            println!("- inference: unavailable ({e:#})");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_is_the_default_command() {
        let cli = Cli::try_parse_from(["somna"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn memory_search_needs_keywords() {
        assert!(Cli::try_parse_from(["somna", "memory", "search"]).is_err());
        let cli = Cli::try_parse_from(["somna", "--config", "x.toml", "memory", "forget", "travel", "food"]).unwrap();
        match cli.command {
            Some(Commands::Memory { command: MemoryCommands::Forget { keywords } }) => {
                assert_eq!(keywords, vec!["travel", "food"])
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn second_lock_holder_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("somna.lock");
        let path = path.to_str().unwrap();
        let _held = acquire_lock(path).unwrap();
        assert!(acquire_lock(path).is_err());
    }

    #[test]
    fn config_init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("somna.toml");
        let mut config = AppConfig::default();
        config.paths.prompts_path = dir.path().join("prompts.json").to_string_lossy().into_owned();

        init_config(&path, &config, false).unwrap();
        assert!(path.is_file());
        let prompts: PromptTemplates =
            serde_json::from_str(&fs::read_to_string(&config.paths.prompts_path).unwrap()).unwrap();
        assert_eq!(prompts, PromptTemplates::default());

        assert!(init_config(&path, &config, false).is_err());
        init_config(&path, &config, true).unwrap();
    }
}
