use clap::{Parser, Subcommand};
use slide_embed::artifact::{read_artifact, SlideArtifact};
use slide_embed::manifest::{Ledger, LedgerMode};
use slide_embed::tensor::format_shape;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "manifest_status")]
#[command(about = "Inspect a feature extraction run", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the run summary
    Summary {
        manifest: PathBuf,
    },
    /// List failed slides with their errors
    Failed {
        manifest: PathBuf,
        /// Also print the recorded traceback
        #[arg(long)]
        traceback: bool,
    },
    /// Describe a written slide artifact
    Artifact {
        path: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Summary { manifest } => match Ledger::load(&manifest, LedgerMode::ReadOnly) {
            Ok(ledger) => {
                println!("{}", ledger.summary());
                println!("pending: {}", ledger.select_pending().len());
            }
            Err(e) => eprintln!("Failed to load manifest: {}", e),
        },
        Commands::Failed { manifest, traceback } => match Ledger::load(&manifest, LedgerMode::ReadOnly) {
            Ok(ledger) => {
                let failed = ledger.failed_rows();
                if failed.is_empty() {
                    println!("No failed slides.");
                }
                for row in failed {
                    println!("{}\t{}", row.slide_path, row.error.as_deref().unwrap_or("-"));
                    if traceback {
                        if let Some(tb) = &row.traceback {
                            println!("{}", tb);
                        }
                    }
                }
            }
            Err(e) => eprintln!("Failed to load manifest: {}", e),
        },
        Commands::Artifact { path } => match read_artifact(&path) {
            Ok(SlideArtifact::TileFeatures { indices, features }) => {
                println!("tile features: {} tiles, shape {}", indices.len(), format_shape(features.shape()));
            }
            Ok(SlideArtifact::SlideEmbedding(embedding)) => {
                println!("slide embedding: shape {}", format_shape(embedding.shape()));
            }
            Err(e) => eprintln!("Failed to read artifact: {}", e),
        },
    }
}
