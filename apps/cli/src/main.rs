//! PostVault CLI — recurring content ingestion for post-feed sites.
//!
//! Watches configured listing pages, downloads new video attachments, and
//! optionally ships them to a remote object store.

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
