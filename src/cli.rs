use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Packs a directory into an archive using its sidecar metadata
    Pack {
        /// Input directory path
        #[arg(required = true)]
        input: PathBuf,

        /// Sidecar metadata file (defaults to <input>/metadata.json)
        sidecar: Option<PathBuf>,

        /// Output archive file path (optional)
        output: Option<PathBuf>,

        /// Store script bodies without LZSS compression
        #[arg(long, default_value_t = false)]
        store: bool,
    },
    /// Extracts an archive into a directory, plus a metadata.json sidecar
    Extract {
        /// Input archive file path
        #[arg(required = true)]
        input: PathBuf,

        /// Output directory path (optional)
        output: Option<PathBuf>,
    },
    /// Lists the entries of an archive
    List {
        /// Input archive file path
        #[arg(required = true)]
        input: PathBuf,
    },
}
