use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "packetclassifier")]
#[command(
    about = "Classify packet captures into traffic categories and flag anomalies",
    long_about = None
)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Classify a pcap/pcapng capture file
    Classify(ClassifyArgs),

    /// Train the ensemble and report training-set metrics
    Train(TrainArgs),

    /// List the port and layer rules used to label packets
    Protocols,
}

/// Options shared by every command that trains the ensemble
#[derive(clap::Args, Debug)]
pub struct ModelArgs {
    /// JSON file with ensemble settings
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Seed for synthetic training data, CNN initialisation and forest sampling
    #[arg(long)]
    pub seed: Option<u64>,

    /// Number of synthetic training samples (overrides the config file)
    #[arg(long)]
    pub samples: Option<usize>,
}

#[derive(Parser, Debug)]
pub struct ClassifyArgs {
    /// Capture file to analyze
    #[arg(short, long)]
    pub file: PathBuf,

    /// Print the report as JSON
    #[arg(short, long)]
    pub json: bool,

    #[command(flatten)]
    pub model: ModelArgs,
}

#[derive(Parser, Debug)]
pub struct TrainArgs {
    /// Print the training report as JSON
    #[arg(short, long)]
    pub json: bool,

    #[command(flatten)]
    pub model: ModelArgs,
}
