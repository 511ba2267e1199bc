mod cli;
mod config;
mod run;

use std::process::ExitCode;

/// Exit status for every failure after argument parsing.
const FAILURE: u8 = 255;

fn main() -> ExitCode {
    let cli = cli::parse();
    run::initialise_tracing();

    match run::run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::from(FAILURE)
        }
    }
}
