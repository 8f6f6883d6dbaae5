//! File stage: stat both sides, then short-circuit, download directly, or
//! fork a hash comparison.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver};

use crate::collect::collect_exact;
use crate::context::SharedContext;
use crate::error::{join_errors, SyncError};
use crate::logger::SyncLog;
use crate::queue::{Callback, Handler};
use crate::rtorrent::{Torrent, TorrentFile};
use crate::stages::download::DownloadUnit;
use crate::stages::local_hash::LocalHashUnit;
use crate::stages::remote_hash::RemoteHashUnit;

/// What is known about one side of a file, filled progressively: stat first,
/// digest later. An absent file has zero size and no digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub path: PathBuf,
    pub size: u64,
    pub exists: bool,
    pub md5: Option<[u8; 16]>,
}

impl FileMetadata {
    pub fn absent(path: PathBuf) -> Self {
        FileMetadata {
            path,
            size: 0,
            exists: false,
            md5: None,
        }
    }

    pub fn present(path: PathBuf, size: u64) -> Self {
        FileMetadata {
            path,
            size,
            exists: true,
            md5: None,
        }
    }
}

/// Completion callback for the hash stages; the digested metadata rides back
/// through it.
pub type HashCallback = Box<dyn FnOnce(Result<FileMetadata, SyncError>) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Download(Reason),
    CompareHashes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    LocalMissing,
    SizeDiffers,
}

/// The stat-level decision. Hash comparison happens only when both sides
/// exist at the same size.
pub fn decide(local: &FileMetadata, remote: &FileMetadata) -> Decision {
    if !local.exists {
        Decision::Download(Reason::LocalMissing)
    } else if local.size != remote.size {
        Decision::Download(Reason::SizeDiffers)
    } else {
        Decision::CompareHashes
    }
}

pub fn remote_path(torrent: &Torrent, file: &TorrentFile) -> PathBuf {
    Path::new(&torrent.path).join(&file.path)
}

/// Single-file torrents have no enclosing directory in rTorrent, so their
/// payload lands directly under the destination.
pub fn local_path(
    destination: &Path,
    torrent: &Torrent,
    file: &TorrentFile,
    many_files: bool,
) -> PathBuf {
    if many_files {
        destination.join(&torrent.name).join(&file.path)
    } else {
        destination.join(&file.path)
    }
}

pub struct FileUnit {
    ctx: Arc<SharedContext>,
    log: SyncLog,
    name: String,
    torrent: Torrent,
    file: TorrentFile,
    many_files: bool,
    callback: Option<Callback>,
}

impl FileUnit {
    pub fn new(
        ctx: Arc<SharedContext>,
        parent: &str,
        torrent: Torrent,
        file: TorrentFile,
        many_files: bool,
        callback: Callback,
    ) -> Self {
        let name = if many_files {
            format!("{parent} File {}", file.path)
        } else {
            format!("File {}", file.path)
        };
        let log = ctx.log.with_prefix(&name);
        FileUnit {
            ctx,
            log,
            name,
            torrent,
            file,
            many_files,
            callback: Some(callback),
        }
    }

    fn complete(&mut self, result: Result<(), SyncError>) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }

    fn stat_remote(&self) -> Result<FileMetadata, SyncError> {
        let path = remote_path(&self.torrent, &self.file);
        self.log.debug(&format!("stat remote {}", path.display()));

        let stat = self.ctx.ssh.sftp.stat(&path).map_err(|err| {
            self.log
                .error(&format!("remote: failed to stat file: {err}"));
            if err.code() == ssh2::ErrorCode::SFTP(LIBSSH2_FX_NO_SUCH_FILE) {
                SyncError::RemoteMissing(path.clone())
            } else {
                SyncError::Sftp {
                    op: "stat",
                    path: path.clone(),
                    reason: err.to_string(),
                }
            }
        })?;

        let actual = stat.size.unwrap_or(0);
        if actual != self.file.size {
            self.log.error(&format!(
                "remote: size mismatch: {actual} != {}",
                self.file.size
            ));
            return Err(SyncError::SizeMismatch {
                path,
                expected: self.file.size,
                actual,
            });
        }
        Ok(FileMetadata::present(path, self.file.size))
    }

    fn stat_local(&self) -> Result<FileMetadata, SyncError> {
        let path = local_path(
            &self.ctx.config.local.destination,
            &self.torrent,
            &self.file,
            self.many_files,
        );
        self.log.debug(&format!("stat local {}", path.display()));

        match fs::metadata(&path) {
            Ok(stat) => Ok(FileMetadata::present(path, stat.len())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(FileMetadata::absent(path)),
            Err(err) => {
                self.log
                    .error(&format!("local: failed to stat file: {err}"));
                Err(SyncError::local_io(path, err))
            }
        }
    }

    fn enqueue_download(&mut self, local: FileMetadata, remote: FileMetadata) {
        let Some(callback) = self.callback.take() else {
            return;
        };
        let unit = DownloadUnit::new(
            self.ctx.clone(),
            &self.name,
            &self.file.path,
            local,
            remote,
            callback,
        );
        self.ctx.downloads.send(unit);
    }

    fn fork_hashes(&mut self, local: FileMetadata, remote: FileMetadata) {
        // Capacity covers both results so neither hash worker blocks on
        // delivery while the other is still running.
        let (tx, rx) = bounded(2);

        let local_tx = tx.clone();
        self.ctx.local_hashes.send(LocalHashUnit::new(
            self.ctx.clone(),
            &self.name,
            &self.file.path,
            local,
            Box::new(move |result| {
                let _ = local_tx.send((HashKind::Local, result));
            }),
        ));

        let remote_tx = tx;
        self.ctx.remote_hashes.send(RemoteHashUnit::new(
            self.ctx.clone(),
            &self.name,
            &self.file.path,
            remote,
            Box::new(move |result| {
                let _ = remote_tx.send((HashKind::Remote, result));
            }),
        ));

        self.log.debug("waiting for md5sum results");
        let Some(callback) = self.callback.take() else {
            return;
        };
        let ctx = self.ctx.clone();
        let log = self.log.clone();
        let name = self.name.clone();
        let file_path = self.file.path.clone();
        // Join in a detached thread so the file worker slot frees up while
        // the digests compute.
        thread::spawn(move || join_hashes(ctx, log, name, file_path, rx, callback));
    }
}

impl Handler for FileUnit {
    fn handle(&mut self) {
        let remote = match self.stat_remote() {
            Ok(meta) => meta,
            Err(err) => {
                self.complete(Err(err));
                return;
            }
        };
        let local = match self.stat_local() {
            Ok(meta) => meta,
            Err(err) => {
                self.complete(Err(err));
                return;
            }
        };

        match decide(&local, &remote) {
            Decision::Download(Reason::LocalMissing) => {
                self.log.info(&format!(
                    "local file {} does not exist, downloading",
                    local.path.display()
                ));
                self.enqueue_download(local, remote);
            }
            Decision::Download(Reason::SizeDiffers) => {
                self.log.info(&format!(
                    "local file {} size mismatch, downloading",
                    local.path.display()
                ));
                self.enqueue_download(local, remote);
            }
            Decision::CompareHashes => self.fork_hashes(local, remote),
        }
    }

    fn fail(&mut self, err: SyncError) {
        self.complete(Err(err));
    }
}

fn join_hashes(
    ctx: Arc<SharedContext>,
    log: SyncLog,
    name: String,
    file_path: String,
    rx: Receiver<(HashKind, Result<FileMetadata, SyncError>)>,
    callback: Callback,
) {
    let (values, closed) = collect_exact(&rx, 2);

    let mut local = None;
    let mut remote = None;
    let mut errors: Vec<SyncError> = closed.into_iter().collect();
    for (kind, result) in values {
        match result {
            Ok(meta) => match kind {
                HashKind::Local => local = Some(meta),
                HashKind::Remote => remote = Some(meta),
            },
            Err(err) => errors.push(err),
        }
    }

    if let Err(err) = join_errors(errors) {
        log.error(&format!("error getting md5sums: {err}"));
        callback(Err(err));
        return;
    }
    let (Some(local), Some(remote)) = (local, remote) else {
        callback(Err(SyncError::ChannelClosed));
        return;
    };

    if local.md5.is_some() && local.md5 == remote.md5 {
        log.info("local file md5sum matches remote");
        callback(Ok(()));
        return;
    }

    log.info("local file md5sum mismatch, downloading");
    let unit = DownloadUnit::new(ctx.clone(), &name, &file_path, local, remote, callback);
    ctx.downloads.send(unit);
}

const LIBSSH2_FX_NO_SUCH_FILE: i32 = 2;
