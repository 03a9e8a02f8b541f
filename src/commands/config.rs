use clap::{Args, Subcommand};
use serde::Serialize;
use serde_json::Value;

use mupdate::config::Config;

use super::CmdResult;

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommand,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Display the effective configuration (defaults + file + flags)
    Show {
        /// Show a single option
        key: Option<String>,
    },
}

#[derive(Debug, Serialize)]
pub struct ConfigOutput {
    command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    config: Option<Config>,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
}

pub fn run(args: ConfigArgs, global: &super::GlobalArgs) -> CmdResult<ConfigOutput> {
    match args.command {
        ConfigCommand::Show { key } => show(global, key),
    }
}

fn show(global: &super::GlobalArgs, key: Option<String>) -> CmdResult<ConfigOutput> {
    let config = global.load_config()?;

    let output = match key {
        Some(key) => ConfigOutput {
            command: "config.show".to_string(),
            config: None,
            value: Some(config.get(&key)?),
            key: Some(key),
        },
        None => ConfigOutput {
            command: "config.show".to_string(),
            config: Some(config.redacted()),
            key: None,
            value: None,
        },
    };

    Ok((output, 0))
}
