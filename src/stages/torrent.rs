//! Torrent stage: filter, list files, fan out file units, await every result
//! in a detached thread, then relabel on clean completion.

use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver};

use crate::collect::collect_exact;
use crate::context::SharedContext;
use crate::error::{join_errors, SyncError};
use crate::logger::SyncLog;
use crate::queue::{Callback, Handler};
use crate::rtorrent::{Torrent, TorrentRpc};
use crate::stages::file::FileUnit;

pub struct TorrentUnit {
    ctx: Arc<SharedContext>,
    log: SyncLog,
    name: String,
    torrent: Torrent,
    callback: Option<Callback>,
}

impl TorrentUnit {
    pub fn new(ctx: Arc<SharedContext>, torrent: Torrent, callback: Callback) -> Self {
        let name = format!("Torrent {}", torrent.name);
        let log = ctx.log.with_prefix(&name);
        TorrentUnit {
            ctx,
            log,
            name,
            torrent,
            callback: Some(callback),
        }
    }

    fn complete(&mut self, result: Result<(), SyncError>) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }
}

impl Handler for TorrentUnit {
    fn handle(&mut self) {
        if !self.torrent.completed {
            self.log.info("skipping torrent: not yet completed");
            self.complete(Ok(()));
            return;
        }
        if self.torrent.label == self.ctx.sync_tag() {
            self.log.info("skipping torrent: already labeled as synced");
            self.complete(Ok(()));
            return;
        }

        self.log.info("listing files...");
        let files = match self.ctx.rpc.files(&self.torrent) {
            Ok(files) => files,
            Err(err) => {
                self.log.error(&format!("failed to list files: {err}"));
                self.complete(Err(err));
                return;
            }
        };
        if files.is_empty() {
            self.log.info("torrent has no files");
            self.complete(Ok(()));
            return;
        }

        let count = files.len();
        self.log.info(&format!("found {count} file(s)"));
        let many_files = count > 1;

        // Buffered to the file count so enqueueing the units can never block
        // on result delivery.
        let (result_tx, result_rx) = bounded(count);
        for file in files {
            let result_tx = result_tx.clone();
            let unit = FileUnit::new(
                self.ctx.clone(),
                &self.name,
                self.torrent.clone(),
                file,
                many_files,
                Box::new(move |result| {
                    let _ = result_tx.send(result);
                }),
            );
            self.ctx.files.send(unit);
        }
        drop(result_tx);

        self.log.debug("waiting for all files to be processed...");
        let Some(callback) = self.callback.take() else {
            return;
        };
        let ctx = self.ctx.clone();
        let torrent = self.torrent.clone();
        let log = self.log.clone();
        // Wait in a detached thread; the single torrent worker must be free
        // to start listing the next torrent while this one's files drain.
        thread::spawn(move || {
            let result = finish_torrent(
                ctx.rpc.as_ref(),
                &torrent,
                &result_rx,
                count,
                ctx.dry_run,
                ctx.sync_tag(),
                &log,
            );
            callback(result);
        });
    }

    fn fail(&mut self, err: SyncError) {
        self.complete(Err(err));
    }
}

/// Collect exactly `count` file results, then relabel if and only if every
/// file succeeded and dry-run is off.
pub(crate) fn finish_torrent(
    rpc: &dyn TorrentRpc,
    torrent: &Torrent,
    results: &Receiver<Result<(), SyncError>>,
    count: usize,
    dry_run: bool,
    sync_tag: &str,
    log: &SyncLog,
) -> Result<(), SyncError> {
    let (values, closed) = collect_exact(results, count);
    let errors: Vec<SyncError> = values
        .into_iter()
        .filter_map(Result::err)
        .chain(closed)
        .collect();

    if let Err(err) = join_errors(errors) {
        log.error(&format!("failed to process all files: {err}"));
        return Err(err);
    }

    log.info("all files processed");
    if dry_run {
        log.info("dry-run enabled, skipping label update");
        return Ok(());
    }

    log.info("updating label...");
    if let Err(err) = rpc.set_label(torrent, sync_tag) {
        log.error(&format!("failed to set label: {err}"));
        return Err(err);
    }
    Ok(())
}
