use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use serde::Serialize;

use mupdate::batch::{Batch, WorkItem};
use mupdate::executor::CommandResult;
use mupdate::lock;
use mupdate::shell;
use mupdate::ssh::{ssh_node_tracked, RemoteCommand};

use super::CmdResult;

#[derive(Args)]
pub struct ExecArgs {
    /// Target hosts (loopback addresses run locally)
    #[arg(long = "host", required = true, value_delimiter = ',')]
    pub hosts: Vec<String>,

    /// Maximum number of hosts handled at once [default: from config]
    #[arg(long)]
    pub maxthreads: Option<usize>,

    /// Per-host timeout in seconds [default: from config]
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Local script streamed to `bash -s` on every host
    #[arg(long)]
    pub script: Option<PathBuf>,

    /// Local file fed to the command's stdin
    #[arg(long)]
    pub input_file: Option<PathBuf>,

    /// File on the target receiving stdout
    #[arg(long)]
    pub output_file: Option<PathBuf>,

    /// Prepended to the command (e.g. `nice -n 10`)
    #[arg(long)]
    pub prefix: Option<String>,

    /// Command to execute.
    ///
    /// A single argument is passed to the shell as is; several arguments
    /// are quoted individually.
    #[arg(num_args = 0.., trailing_var_arg = true)]
    pub command: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ExecOutput {
    command: String,
    /// Another `exec` held the lock.
    skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    results: Option<BTreeMap<String, CommandResult>>,
}

pub fn run(args: ExecArgs, global: &super::GlobalArgs) -> CmdResult<ExecOutput> {
    let config = global.load_config()?;

    let command = match args.command.as_slice() {
        [] => String::new(),
        [single] => single.clone(),
        many => shell::quote_args(many),
    };
    if command.is_empty() && args.script.is_none() {
        return Err(mupdate::Error::validation_missing_argument(vec![
            "command".to_string(),
            "--script".to_string(),
        ]));
    }

    let timeout = args
        .timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.timeout());
    let maxthreads = args.maxthreads.unwrap_or(config.maxthreads);

    let mut template = RemoteCommand::new("", command.clone())
        .ssh_opts(&config.ssh_opts)
        .env_vars(&config.env_vars)
        .timeout(timeout);
    template.script = args.script;
    template.input_file = args.input_file;
    template.output_file = args.output_file;
    template.prefix = args.prefix;

    let items: Vec<WorkItem<CommandResult>> = args
        .hosts
        .iter()
        .map(|host| {
            let mut spec = template.clone();
            spec.host = host.clone();
            WorkItem::new(move |ctx, _| ssh_node_tracked(&spec, Some(ctx.tracker())))
                .arg("host", host.as_str())
                .key(host.as_str())
        })
        .collect();

    // A worker fault (e.g. the shell cannot be spawned) exits the process
    // with status 42 before any result is printed.
    let results = lock::run_with_lock("exec", || {
        Batch::new(maxthreads)
            .keyed()
            .run_or_exit(items)
            .map(|result| result.into_keyed().unwrap_or_default())
    })?;

    let exit_code = match &results {
        Some(results) if results.values().any(|r| !r.success()) => 1,
        _ => 0,
    };

    Ok((
        ExecOutput {
            command,
            skipped: results.is_none(),
            results,
        },
        exit_code,
    ))
}
