use std::path::PathBuf;

use mupdate::config::{Config, ConfigOverrides};

pub type CmdResult<T> = mupdate::Result<(T, i32)>;

/// Options shared by every subcommand.
pub(crate) struct GlobalArgs {
    pub config_file: Option<PathBuf>,
    pub env: Vec<u32>,
    pub node: Vec<u32>,
}

impl GlobalArgs {
    pub fn load_config(&self) -> mupdate::Result<Config> {
        Config::load(&ConfigOverrides {
            config_file: self.config_file.clone(),
            env: self.env.clone(),
            node: self.node.clone(),
        })
    }

    /// The single environment a command operates on.
    pub fn single_env(&self, config: &Config) -> mupdate::Result<u32> {
        match config.filters.cluster.as_slice() {
            [env] => Ok(*env),
            [] => Err(mupdate::Error::validation_missing_argument(vec![
                "--env".to_string(),
            ])),
            many => Err(mupdate::Error::validation_invalid_argument(
                "env",
                "exactly one environment is required",
                None,
                Some(many.iter().map(u32::to_string).collect()),
            )),
        }
    }
}

pub mod config;
pub mod exec;
pub mod report;
pub mod update;

/// Dispatch a command to its handler and map result to JSON.
macro_rules! dispatch {
    ($args:expr, $global:expr, $module:ident) => {
        mupdate::output::map_cmd_result_to_json($module::run($args, $global))
    };
}

pub(crate) fn run_json(
    command: crate::Commands,
    global: &GlobalArgs,
) -> (mupdate::Result<serde_json::Value>, i32) {
    crate::tty::status("mupdate is working...");

    match command {
        crate::Commands::Update(args) => dispatch!(args, global, update),
        crate::Commands::Report(args) => dispatch!(args, global, report),
        crate::Commands::Exec(args) => dispatch!(args, global, exec),
        crate::Commands::Config(args) => dispatch!(args, global, config),
    }
}
