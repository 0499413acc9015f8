use std::env::consts::{ARCH, FAMILY, OS};
use std::io;
use std::sync::Arc;

use anyhow::Error;
use clap::Parser;
use tracing::trace;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::MakeWriter;

use crate::harvest::logger::init_logger;
use crate::harvest::{Cli, Configuration};
use crate::program::Program;

mod harvest;
mod program;

fn main() -> Result<(), Error> {
    let cli = Cli::parse();
    let config = load_configuration(&cli, io::stderr)?;

    // Held until exit so the file writer flushes
    let _guard = initialize_logger(&config);
    log_system_information();

    let program = Program::new(Arc::new(config));
    program.run()
}

/// Loads, overrides and validates the configuration.
///
/// The real logger depends on the loaded configuration, so loader messages go
/// through a plain bootstrap subscriber writing to `writer`.
fn load_configuration<W>(cli: &Cli, writer: W) -> Result<Configuration, Error>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let bootstrap = tracing_subscriber::fmt()
        .with_target(false)
        .with_ansi(false)
        .with_writer(writer)
        .finish();
    let loaded = tracing::subscriber::with_default(bootstrap, || Configuration::load(&cli.config))?;
    let config = loaded.apply_overrides(&cli.overrides());
    config.validate()?;
    Ok(config)
}

/// Initializes the logger, falling back to stderr-only reporting if it cannot be installed.
fn initialize_logger(config: &Configuration) -> Option<WorkerGuard> {
    match init_logger(&config.logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logger: {}. Continuing without structured logs.", e);
            None
        }
    }
}

/// Logs important information about the system being used.
fn log_system_information() {
    trace!("Printing system information out into log for debug purposes...");
    trace!("ARCH:           \"{}\"", ARCH);
    trace!("FAMILY:         \"{}\"", FAMILY);
    trace!("OS:             \"{}\"", OS);
}
