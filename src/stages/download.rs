//! Download stage: stream one remote file to disk over a pooled SFTP
//! connection, with a byte-progress bar.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::sync::Arc;

use crate::context::SharedContext;
use crate::error::SyncError;
use crate::logger::SyncLog;
use crate::progress;
use crate::queue::{Callback, Handler};
use crate::ssh::SshPair;
use crate::stages::file::FileMetadata;

pub struct DownloadUnit {
    ctx: Arc<SharedContext>,
    log: SyncLog,
    file_path: String,
    local: FileMetadata,
    remote: FileMetadata,
    callback: Option<Callback>,
}

impl DownloadUnit {
    pub fn new(
        ctx: Arc<SharedContext>,
        parent: &str,
        file_path: &str,
        local: FileMetadata,
        remote: FileMetadata,
        callback: Callback,
    ) -> Self {
        let log = ctx.log.with_prefix(&format!("{parent} download"));
        DownloadUnit {
            ctx,
            log,
            file_path: file_path.to_string(),
            local,
            remote,
            callback: Some(callback),
        }
    }

    fn complete(&mut self, result: Result<(), SyncError>) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }

    fn run(&mut self) -> Result<(), SyncError> {
        self.log.info(&format!(
            "downloading {} to {}",
            self.remote.path.display(),
            self.local.path.display()
        ));
        if self.ctx.dry_run {
            self.log.warn("dry run: skipping download");
            return Ok(());
        }

        // A pooled connection, not the shared RPC one: parallel downloads get
        // their own multiplexed sessions and RPC latency stays unaffected.
        let conn = self.ctx.ssh_pool.get(&self.log).map_err(|err| {
            self.log
                .error(&format!("failed to dial ssh connection: {err}"));
            err
        })?;
        let result = self.transfer(&conn);
        if self.ctx.ssh_pool.put(conn).is_err() {
            self.log.trace("pool closed; dropping connection");
        }
        result
    }

    fn transfer(&self, conn: &SshPair) -> Result<(), SyncError> {
        if let Some(parent) = self.local.path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                self.log
                    .error(&format!("failed to create parent directory: {err}"));
                SyncError::local_io(parent, err)
            })?;
        }

        let local_file = File::create(&self.local.path).map_err(|err| {
            self.log.error(&format!(
                "failed to create local file {}: {err}",
                self.local.path.display()
            ));
            SyncError::local_io(&self.local.path, err)
        })?;

        let mut remote_file = conn.sftp.open(&self.remote.path).map_err(|err| {
            self.log.error(&format!(
                "failed to open remote file {}: {err}",
                self.remote.path.display()
            ));
            SyncError::Sftp {
                op: "open",
                path: self.remote.path.clone(),
                reason: err.to_string(),
            }
        })?;

        let bar = progress::transfer_bar(
            &self.ctx.progress,
            &format!("downloading {}", self.file_path),
            self.remote.size,
        );
        let mut writer = bar.wrap_write(BufWriter::new(local_file));
        let copied = io::copy(&mut remote_file, &mut writer);
        let flushed = writer.flush();
        progress::remove(&self.ctx.progress, &bar);

        let copied = copied.map_err(|err| {
            self.log.error(&format!(
                "failed to copy {} to {}: {err}",
                self.remote.path.display(),
                self.local.path.display()
            ));
            SyncError::Sftp {
                op: "download",
                path: self.remote.path.clone(),
                reason: err.to_string(),
            }
        })?;
        flushed.map_err(|err| SyncError::local_io(&self.local.path, err))?;

        self.log.debug(&format!("downloaded {copied} bytes"));
        Ok(())
    }
}

impl Handler for DownloadUnit {
    fn handle(&mut self) {
        let result = self.run();
        self.complete(result);
    }

    fn fail(&mut self, err: SyncError) {
        self.complete(Err(err));
    }
}
