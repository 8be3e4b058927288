use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about = "Double-difference relocation pipeline driver",
    long_about = None,
    arg_required_else_help = true,
    after_help = "Examples:\n  ddreloc --config reloc.yaml --events catalog.xml --stations inventory.xml --working-dir runs/june\n  ddreloc -c reloc.yaml --events a.xml b.xml --stations inventory.xml --waveforms traces/*.txt -w runs/june --output relocated.xml\n"
)]
pub struct Args {
    /// Pipeline configuration file (YAML)
    #[arg(long, short = 'c')]
    pub config: PathBuf,

    /// QuakeML event catalog file(s)
    #[arg(long = "events", required = true, num_args = 1..)]
    pub event_files: Vec<PathBuf>,

    /// StationXML inventory file(s)
    #[arg(long = "stations", required = true, num_args = 1..)]
    pub station_files: Vec<PathBuf>,

    /// Plain-text waveform trace file(s): header line
    /// `station_id channel start_time sampling_rate_hz`, one sample per line
    #[arg(long = "waveforms", num_args = 0..)]
    pub waveform_files: Vec<PathBuf>,

    /// Working directory owned by this run
    #[arg(long, short = 'w', visible_alias = "wdir")]
    pub working_dir: PathBuf,

    /// Output catalog path (default: <working-dir>/output_files/relocated.xml)
    #[arg(long)]
    pub output: Option<PathBuf>,
}
