//! Quick HN Importer - Command line front end
//!
//! Wires the library to a file-backed store, the HTTP sources and a headless host whose
//! road network is read from GeoJSON.

mod commands;
mod logging;
mod prompt;
mod settings;

use clap::Parser;
use settings::Settings;

fn main() -> anyhow::Result<()> {
    let settings = Settings::parse();
    logging::setup_logging();
    tracing::info!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(commands::run(settings))
}
