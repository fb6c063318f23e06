//! CLI entry and dispatch.

use std::path::PathBuf;

use anyhow::{Context, Result};
use cadence_core::config;
use cadence_core::core::interrupt;
use clap::Parser;

use crate::logging;

mod commands;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(version)]
#[command(about = "Turn-orchestration engine for an autonomous coding assistant")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Working directory the task operates on
    #[arg(long, default_value = ".", global = true)]
    root: PathBuf,
}

/// How asks are answered while a task runs.
#[derive(clap::Args, Debug, Clone)]
struct HostArgs {
    /// JSON file of canned model responses (`{"turns": [...]}`)
    #[arg(long, value_name = "FILE", env = "CADENCE_SCRIPT")]
    script: PathBuf,

    /// Approve every ask without prompting
    #[arg(long)]
    yes: bool,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Runs a new task
    Run {
        /// The task text
        #[arg(short, long)]
        task: String,

        /// Attach an image (data URL or path to a PNG/JPEG/WebP file)
        #[arg(long = "image", value_name = "IMAGE")]
        images: Vec<String>,

        /// Turn on auto-approval for every action category
        #[arg(long)]
        auto_approve: bool,

        #[command(flatten)]
        host: HostArgs,
    },

    /// Resumes a saved task
    Resume {
        /// The ID of the task to resume
        #[arg(value_name = "TASK_ID")]
        id: String,

        #[command(flatten)]
        host: HostArgs,
    },

    /// Inspect saved tasks
    Tasks {
        #[command(subcommand)]
        command: TaskCommands,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(clap::Subcommand)]
enum TaskCommands {
    /// Lists saved tasks, newest first
    List,
    /// Shows the message log of a task
    Show {
        /// The ID of the task to show
        #[arg(value_name = "TASK_ID")]
        id: String,
    },
}

#[derive(clap::Subcommand)]
enum ConfigCommands {
    /// Show the path to the config file
    Path,
    /// Initialize a default config file (if not present)
    Init,
    /// Generate a fresh config from Rust defaults (for xtask)
    Generate,
    /// Turn auto-approval on or off in the config file
    AutoApproval {
        #[arg(value_enum)]
        state: Toggle,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum Toggle {
    On,
    Off,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let config = config::Config::load().context("load config")?;
    let _log_guard = logging::init(&config.log)?;

    interrupt::init()?;

    let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;

    rt.block_on(async move { dispatch(cli, config).await })
}

async fn dispatch(cli: Cli, mut config: config::Config) -> Result<()> {
    let Cli { command, root } = cli;

    match command {
        Commands::Run {
            task,
            images,
            auto_approve,
            host,
        } => {
            if auto_approve {
                commands::run::enable_auto_approval(&mut config);
            }
            commands::run::run(commands::run::RunOptions {
                root: &root,
                task,
                images,
                script: &host.script,
                yes: host.yes,
                config,
            })
            .await
        }

        Commands::Resume { id, host } => {
            commands::resume::run(&id, &root, &host.script, host.yes, config).await
        }

        Commands::Tasks { command } => match command {
            TaskCommands::List => commands::tasks::list().await,
            TaskCommands::Show { id } => commands::tasks::show(&id).await,
        },

        Commands::Config { command } => match command {
            ConfigCommands::Path => {
                commands::config::path();
                Ok(())
            }
            ConfigCommands::Init => commands::config::init(),
            ConfigCommands::Generate => commands::config::generate(),
            ConfigCommands::AutoApproval { state } => {
                commands::config::auto_approval(matches!(state, Toggle::On))
            }
        },
    }
}
