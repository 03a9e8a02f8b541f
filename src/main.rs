use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use commands::GlobalArgs;

mod commands;
mod tty;

use commands::{config, exec, report, update};
use mupdate::output;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "mupdate")]
#[command(version = VERSION)]
#[command(about = "Cluster maintenance updates and parallel command execution")]
struct Cli {
    /// YAML file overriding the built-in configuration
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Environment id(s), replaces `filters.cluster`
    #[arg(long, global = true, value_delimiter = ',')]
    env: Vec<u32>,

    /// Node id(s), replaces `filters.id`
    #[arg(long, global = true, value_delimiter = ',')]
    node: Vec<u32>,

    /// Log debug output to stderr
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Prepare an environment for a maintenance update and start it
    Update(update::UpdateArgs),
    /// Show what a noop deployment task would change
    Report(report::ReportArgs),
    /// Run a command on many hosts in parallel
    Exec(exec::ExecArgs),
    /// Inspect configuration
    Config(config::ConfigArgs),
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let global = GlobalArgs {
        config_file: cli.config,
        env: cli.env,
        node: cli.node,
    };

    let (json_result, exit_code) = commands::run_json(cli.command, &global);
    if let Err(err) = output::print_json_result(json_result) {
        tracing::error!(error = %err, "failed to print response");
    }

    std::process::ExitCode::from(output::exit_code_to_u8(exit_code))
}
