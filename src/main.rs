use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use task_mux::cli::{self, ApprovalMode, OutputMode};
use task_mux::config::EngineConfig;
use task_mux::engine::Engine;
use task_mux::logging;
use task_mux::shutdown::{CancellationToken, setup_signal_handlers};
use task_mux::store::TaskSpec;

#[derive(Parser)]
#[command(name = "taskmux")]
#[command(about = "Task orchestration engine - run jobs on a bounded worker pool and chain them into workflows")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project directory (defaults to current)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Load configuration from this file instead of the standard hierarchy
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = OutputMode::Console)]
    output: OutputMode,

    /// Write logs to this file as well
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Write logs to a timestamped file under the user config directory
    #[arg(long, global = true, conflicts_with = "log_file")]
    save_log: bool,

    /// Enable debug output
    #[arg(long, global = true)]
    debug: bool,

    /// Suppress normal output
    #[arg(long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a single task and wait for it
    RunTask {
        /// Instruction for the worker
        prompt: String,

        /// Task type (selects the worker)
        #[arg(long = "type", default_value = "task")]
        task_type: String,

        /// Queue priority (higher runs first)
        #[arg(long)]
        priority: Option<i32>,

        /// Timeout per attempt in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Retry budget
        #[arg(long)]
        retries: Option<u32>,

        /// Context values as key=value
        #[arg(long = "context", short = 'c')]
        context: Vec<String>,
    },

    /// Run a workflow template
    RunWorkflow {
        /// Template id
        template: String,

        /// Context values as key=value
        #[arg(long = "context", short = 'c')]
        context: Vec<String>,

        /// How to answer approval gates
        #[arg(long, value_enum, default_value_t = ApprovalMode::Prompt)]
        approvals: ApprovalMode,
    },

    /// Validate a workflow template (id or file path) without running it
    Validate {
        template: String,
    },

    /// Print the effective configuration
    Config,
}

impl Commands {
    fn run_name(&self) -> &'static str {
        match self {
            Commands::RunTask { .. } => "task",
            Commands::RunWorkflow { .. } => "workflow",
            Commands::Validate { .. } => "validate",
            Commands::Config => "config",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_file = match (&cli.log_file, cli.save_log) {
        (Some(path), _) => Some(path.clone()),
        (None, true) => Some(logging::default_log_path(cli.command.run_name())?),
        (None, false) => None,
    };
    let log_guard = logging::init_logging(cli.debug, cli.quiet, log_file)?;

    let project_dir = cli.dir.as_deref();
    let config = match &cli.config {
        Some(path) => EngineConfig::load_file(path)?,
        None => EngineConfig::load(project_dir)?,
    };
    if let Err(errors) = config.validate() {
        anyhow::bail!("invalid configuration:\n  {}", errors.join("\n  "));
    }

    let mode = if cli.quiet { OutputMode::Quiet } else { cli.output };
    let handler = cli::create_handler(mode, cli.debug);

    let code = match cli.command {
        Commands::Config => cli::show_config(&config)?,

        Commands::Validate { template } => {
            cli::validate_template(&template, project_dir, &config.workflow, &*handler)
        }

        Commands::RunTask {
            prompt,
            task_type,
            priority,
            timeout_ms,
            retries,
            context,
        } => {
            let spec = TaskSpec {
                context: cli::parse_context(&context)?,
                priority,
                timeout_ms,
                retries,
                ..TaskSpec::new(task_type, prompt)
            };

            let shutdown = CancellationToken::new();
            tokio::spawn(setup_signal_handlers(shutdown.clone()));
            let engine = Engine::start(config, cli.dir.clone()).context("starting engine")?;
            let code = cli::run_task(&engine, spec, &shutdown, &*handler).await;
            engine.shutdown().await;
            code?
        }

        Commands::RunWorkflow {
            template,
            context,
            approvals,
        } => {
            let context = cli::parse_context(&context)?;
            let shutdown = CancellationToken::new();
            tokio::spawn(setup_signal_handlers(shutdown.clone()));
            let engine = Engine::start(config, cli.dir.clone()).context("starting engine")?;
            let code =
                cli::run_workflow(&engine, &template, context, approvals, &shutdown, &*handler)
                    .await;
            engine.shutdown().await;
            code?
        }
    };

    // exit skips destructors, flush the file writer first
    drop(log_guard);
    std::process::exit(code);
}
