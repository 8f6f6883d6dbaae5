//! seedsync - pull completed torrent payloads off a seedbox.
//!
//! The driver lists every torrent in the main view, dispatches them oldest
//! completion first, waits for one result per torrent, and tears the
//! pipeline down.

use anyhow::Result;
use clap::Parser;
use crossbeam_channel::bounded;

use seedsync::cli::Args;
use seedsync::context::SharedContext;
use seedsync::rtorrent::VIEW_MAIN;
use seedsync::stages::torrent::TorrentUnit;

fn main() -> Result<()> {
    let args = Args::parse();
    let ctx = SharedContext::new(&args.config, args.dry_run)?;

    ctx.log.info("getting torrents...");
    let mut torrents = ctx.rpc.torrents(VIEW_MAIN)?;
    ctx.log.info(&format!("fetched {} torrents", torrents.len()));

    // Oldest completions first, so long-finished payloads land before
    // anything fresh.
    torrents.sort_by_key(|t| t.finished);

    let count = torrents.len();
    let (done_tx, done_rx) = bounded(count);
    for torrent in torrents {
        let name = format!("Torrent {}", torrent.name);
        let done_tx = done_tx.clone();
        let unit = TorrentUnit::new(
            ctx.clone(),
            torrent,
            Box::new(move |result| {
                let _ = done_tx.send((name, result));
            }),
        );
        ctx.torrents.send(unit);
    }
    drop(done_tx);

    let mut failures = 0usize;
    for _ in 0..count {
        match done_rx.recv() {
            Ok((name, Err(err))) => {
                failures += 1;
                ctx.log.error(&format!("error processing {name}: {err}"));
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }

    ctx.close();
    if failures > 0 {
        ctx.log.warn(&format!("{failures} torrent(s) failed to sync"));
    }
    Ok(())
}
