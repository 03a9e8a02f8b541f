use clap::Args;
use serde::Serialize;

use mupdate::client::FuelCli;
use mupdate::report::{self, ReportRow};

use super::CmdResult;

#[derive(Args)]
pub struct ReportArgs {
    /// Id of the noop deployment task
    pub task: u64,
}

#[derive(Debug, Serialize)]
pub struct ReportOutput {
    task: u64,
    columns: [&'static str; 3],
    rows: Vec<ReportRow>,
}

pub fn run(args: ReportArgs, global: &super::GlobalArgs) -> CmdResult<ReportOutput> {
    let config = global.load_config()?;
    let client = FuelCli::new(&config);
    let rows = report::noop_report(&client, args.task)?;

    Ok((
        ReportOutput {
            task: args.task,
            columns: report::COLUMNS,
            rows,
        },
        0,
    ))
}
