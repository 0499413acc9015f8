use std::env::current_dir;
use std::sync::Arc;

use anyhow::{Context, Error};
use console::{style, Term};
use tracing::{error, info, trace};

use crate::harvest::{Configuration, Orchestrator};

/// The name of the cargo package.
const NAME: &str = env!("CARGO_PKG_NAME");

/// The version of the cargo package.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The authors who created the package.
const AUTHORS: &str = env!("CARGO_PKG_AUTHORS");

/// A program class that handles the flow of one harvesting run.
pub(crate) struct Program {
    config: Arc<Configuration>,
}

impl Program {
    /// Creates a new instance of the program.
    pub(crate) fn new(config: Arc<Configuration>) -> Self {
        Self { config }
    }

    /// Runs the harvester.
    pub(crate) fn run(&self) -> Result<(), Error> {
        let term = Term::stdout();
        term.set_title("image harvester");
        trace!("Starting image harvester...");
        trace!("Program Name: {}", NAME);
        trace!("Program Version: {}", VERSION);
        trace!("Program Authors: {}", AUTHORS);
        let working_dir = current_dir().context("Failed to get working directory")?;
        trace!("Program Working Directory: {}", working_dir.display());

        // All fetches share one thread; concurrency comes from interleaving, not parallelism
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to build async runtime")?;

        let orchestrator = Orchestrator::new(self.config.clone()).with_progress_bar(term.is_term());
        info!(
            "Harvesting \"{}\" into {} (run {})",
            self.config.keyword,
            self.config.save_folder().display(),
            orchestrator.run_id()
        );

        let summary = match runtime.block_on(orchestrator.run()) {
            Ok(summary) => summary,
            Err(e) => {
                error!("Run failed: {}", e);
                return Err(e.into());
            }
        };

        println!(
            "{} {} images saved to {} ({} found, {} already downloaded, {} fetched, {} duplicates removed)",
            style("Done:").green().bold(),
            summary.final_count,
            self.config.save_folder().display(),
            summary.candidates,
            summary.already_downloaded,
            summary.promoted,
            summary.duplicates_removed,
        );
        Ok(())
    }
}
