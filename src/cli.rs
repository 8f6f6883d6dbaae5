//! Command-line surface.

use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Sync completed rTorrent payloads from a seedbox over SSH/SFTP"
)]
pub struct Args {
    /// Path to the TOML configuration file
    #[arg(default_value = "config.toml")]
    pub config: PathBuf,

    /// Stat and hash only; skip downloads and label updates
    #[arg(long)]
    pub dry_run: bool,
}
