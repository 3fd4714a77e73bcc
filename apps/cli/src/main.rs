//! Examflow CLI — exam-question ingestion and taxonomy reconciliation.
//!
//! Turns raw exam material (CSV batches, scanned images) into classified
//! records in a Subject→Topic taxonomy via OCR and an ML classifier.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
