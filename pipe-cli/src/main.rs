use clap::{ArgAction, Parser, Subcommand};
use color_eyre::Result;

mod commands;
mod output;
mod status_ui;

/// pipe - a declarative shell-pipeline runner
///
/// Runs YAML-defined pipelines of shell commands with dependencies,
/// retries, caching, and resumable run state.
#[derive(Parser, Debug)]
#[command(name = "pipe", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Pipeline name (under the pipe files directory) or a path to a
    /// pipeline YAML file
    #[arg(value_name = "PIPELINE")]
    pipeline: Option<String>,

    /// Resume a previous run by id
    #[arg(long, value_name = "RUN_ID")]
    resume: Option<String>,

    /// Increase verbosity (-v streams log lines, -vv streams all step output)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,

    /// Variable overrides, e.g. `pipe deploy -- region=eu-west-1`
    #[arg(last = true, value_name = "KEY=VALUE")]
    vars: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List known pipelines
    List,

    /// Load a pipeline and report validation and lint findings
    Validate {
        /// Pipeline name or YAML path
        name: String,
    },

    /// Scaffold a new pipeline definition
    Init {
        /// Name of the pipeline to create
        name: String,
    },

    /// Show a pipeline's variables, steps, and dependency edges
    Inspect {
        /// Pipeline name or YAML path
        name: String,
    },

    /// Inspect or clear the step cache
    Cache(commands::cache::CacheArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Some(Commands::List) => commands::list::execute(),
        Some(Commands::Validate { name }) => commands::validate::execute(&name),
        Some(Commands::Init { name }) => commands::init::execute(&name),
        Some(Commands::Inspect { name }) => commands::inspect::execute(&name),
        Some(Commands::Cache(args)) => commands::cache::execute(args),
        None => match cli.pipeline {
            Some(name) => {
                commands::run::execute(&name, cli.resume.as_deref(), cli.verbose, &cli.vars).await
            }
            None => {
                use clap::CommandFactory;
                Cli::command().print_help()?;
                Ok(())
            }
        },
    }
}

fn init_tracing(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let default = match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .init();
}
