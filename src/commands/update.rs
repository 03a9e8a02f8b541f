use std::path::PathBuf;

use clap::Args;
use serde::Serialize;

use mupdate::client::FuelCli;
use mupdate::updates::{self, UpdateOptions, UpdateReport};

use super::CmdResult;

#[derive(Args)]
pub struct UpdateArgs {
    /// Patch the environment and start the update (otherwise only validate)
    #[arg(long)]
    pub install: bool,

    /// Repositories used for the update
    #[arg(long, num_args = 1.., default_values_t = updates::default_repos())]
    pub repos: Vec<String>,

    /// Restart RabbitMQ during the update
    #[arg(long, visible_alias = "restart-rabbitmq")]
    pub restart_rabbit: bool,

    /// Restart MySQL during the update
    #[arg(long)]
    pub restart_mysql: bool,

    /// Save unpatched copies of the documents here before uploading
    #[arg(long, value_name = "DIR")]
    pub backup_dir: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
pub struct UpdateOutput {
    command: &'static str,
    env: u32,
    /// Another update held the lock.
    skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<UpdateReport>,
}

pub fn run(args: UpdateArgs, global: &super::GlobalArgs) -> CmdResult<UpdateOutput> {
    let config = global.load_config()?;
    let env = global.single_env(&config)?;
    let client = FuelCli::new(&config);

    let options = UpdateOptions {
        repos: args.repos,
        restart_rabbit: args.restart_rabbit,
        restart_mysql: args.restart_mysql,
        install: args.install,
        backup_dir: args.backup_dir,
    };

    let report = updates::install_updates(&client, env, &options)?;

    Ok((
        UpdateOutput {
            command: "update",
            env,
            skipped: report.is_none(),
            report,
        },
        0,
    ))
}
