use clap::Parser;
use echo_stress::config::Cli;
use echo_stress::{logging, LoadGenerator};
use std::process::ExitCode;
use tracing::error;

fn run(cli: Cli) -> echo_stress::Result<()> {
    logging::init_logging(&cli.log_level)?;
    let config = cli.into_config()?;
    let mut generator = LoadGenerator::new(config.target, config.options);
    generator.start(config.connection_count, config.duration)?;
    print!("{}", generator.collect_results()?);
    Ok(())
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // --help and --version are not failures, unless they can't be printed.
            return match err.print() {
                Ok(()) if !err.use_stderr() => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "load run failed");
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}
