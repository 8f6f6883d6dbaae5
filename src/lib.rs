//! Seedbox synchronization library.
//!
//! A concurrent pipeline that pulls completed rTorrent payloads from a
//! remote seedbox over SSH/SFTP, skipping files that are already present and
//! byte-identical, then relabels each fully-synced torrent so it is not
//! processed again.

pub mod cli;
pub mod collect;
pub mod config;
pub mod context;
pub mod error;
pub mod logger;
pub mod pool;
pub mod progress;
pub mod queue;
pub mod rtorrent;
pub mod scgi;
pub mod ssh;
pub mod stages;
