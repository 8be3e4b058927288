mod args;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ddreloc::catalog::TraceStore;
use ddreloc::config::RelocationConfig;
use ddreloc::pipeline::{Collaborators, Relocator};
use ddreloc::quakeml::{QuakeMlReader, QuakeMlWriter, StationXmlReader};
use ddreloc::wdir::WorkingDirectory;

use args::Args;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = RelocationConfig::load(&args.config)
        .with_context(|| format!("loading configuration {}", args.config.display()))?;
    let wdir = WorkingDirectory::open(&args.working_dir)
        .with_context(|| format!("opening working directory {}", args.working_dir.display()))?;

    let mut waveforms = TraceStore::new();
    for path in &args.waveform_files {
        waveforms
            .load_ascii(path)
            .with_context(|| format!("loading waveform file {}", path.display()))?;
    }
    info!(traces = waveforms.len(), "waveform store ready");

    let event_reader = QuakeMlReader;
    let station_reader = StationXmlReader;
    let catalog_writer = QuakeMlWriter;
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| wdir.output_file("relocated.xml"));

    let relocator = Relocator::new(
        config,
        wdir,
        Collaborators {
            events: &event_reader,
            stations: &station_reader,
            waveforms: &waveforms,
            catalog_writer: &catalog_writer,
        },
    )?;
    let summary = relocator.run(&args.event_files, &args.station_files, &output)?;

    println!(
        "relocated {}/{} events ({} cross-correlation pairs, shift offset {} m) -> {}",
        summary.relocated,
        summary.total_events,
        summary.cross_correlation_pairs,
        summary.shift_offset_m,
        output.display()
    );
    Ok(())
}
