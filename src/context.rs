//! Shared pipeline context: every collaborator the stages need, plus the
//! teardown order that keeps fan-in waits from deadlocking.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use indicatif::MultiProgress;

use crate::config::Config;
use crate::error::{ScgiError, SyncError};
use crate::logger::SyncLog;
use crate::pool::{Pool, PoolConfig};
use crate::queue::WorkQueue;
use crate::rtorrent::{RtorrentClient, TorrentRpc};
use crate::scgi::{ScgiStream, ScgiTransport};
use crate::ssh::{self, SharedSsh, SshPair};
use crate::stages::download::DownloadUnit;
use crate::stages::file::FileUnit;
use crate::stages::local_hash::LocalHashUnit;
use crate::stages::remote_hash::RemoteHashUnit;
use crate::stages::torrent::TorrentUnit;

pub const LOG_FILE: &str = "seedbox-sync.log";

// Pooled download connections linger this long before being dropped.
const POOL_IDLE_TIME: Duration = Duration::from_secs(60);

pub struct SharedContext {
    pub progress: MultiProgress,
    pub log: SyncLog,
    pub config: Config,
    pub dry_run: bool,
    /// Connections for parallel downloads. The RPC pair below is deliberately
    /// separate so downloads neither serialize behind RPC nor starve it.
    pub ssh_pool: Pool<SshPair>,
    /// Long-lived pair backing RPC dials, remote hash sessions, and remote
    /// stats.
    pub ssh: SharedSsh,
    pub rpc: Box<dyn TorrentRpc>,
    pub torrents: WorkQueue<TorrentUnit>,
    pub files: WorkQueue<FileUnit>,
    pub remote_hashes: WorkQueue<RemoteHashUnit>,
    pub local_hashes: WorkQueue<LocalHashUnit>,
    pub downloads: WorkQueue<DownloadUnit>,
}

impl SharedContext {
    pub fn new(config_path: &Path, dry_run: bool) -> Result<Arc<SharedContext>, SyncError> {
        // The progress area must exist before any log line is emitted so the
        // console sink has somewhere to print through.
        let progress = MultiProgress::new();
        let log = SyncLog::open(progress.clone(), Path::new(LOG_FILE), "seedsync");

        let config = Config::load(config_path)?;

        let ssh_pool = {
            let ssh_config = config.remote.ssh.clone();
            Pool::new(
                PoolConfig::new(move |log: &SyncLog| ssh::dial(&ssh_config, log))
                    .max_idle(config.local.download_threads)
                    .max_idle_time(POOL_IDLE_TIME)
                    .debug(log.with_prefix("ssh-pool")),
            )
        };

        let ssh: SharedSsh = Arc::new(ssh_pool.get(&log)?);

        let rpc: Box<dyn TorrentRpc> = {
            let session = ssh.clone();
            let socket = config.remote.rtorrent.socket.clone();
            let dial_log = log.with_prefix("rtorrent");
            let transport = ScgiTransport::new(move || {
                dial_log.trace(&format!("connecting to {socket} over ssh"));
                let channel = session
                    .session
                    .channel_direct_streamlocal(&socket, None)
                    .map_err(|e| ScgiError::Dial(format!("{socket}: {e}")))?;
                Ok(Box::new(channel) as Box<dyn ScgiStream>)
            });
            Box::new(RtorrentClient::new(transport, log.with_prefix("rtorrent")))
        };

        let downloads = WorkQueue::new(
            "download",
            &log,
            config.local.download_threads,
            config.local.download_buffer,
        );
        let local_hashes = WorkQueue::new("local-md5sum", &log, config.local.md5sum_threads, 0);
        let remote_hashes = WorkQueue::new("remote-md5sum", &log, config.remote.md5sum_threads, 0);
        let files = WorkQueue::new("file", &log, config.file_workers(), 0);
        let torrents = WorkQueue::new("torrent", &log, 1, 0);

        Ok(Arc::new(SharedContext {
            progress,
            log,
            config,
            dry_run,
            ssh_pool,
            ssh,
            rpc,
            torrents,
            files,
            remote_hashes,
            local_hashes,
            downloads,
        }))
    }

    pub fn sync_tag(&self) -> &str {
        &self.config.remote.rtorrent.sync_tag
    }

    /// Tear down in reverse dependency order: each queue closes only after
    /// every producer that feeds it has closed, so no fan-in is left waiting
    /// on a unit that can no longer run.
    pub fn close(&self) {
        self.torrents.close();
        self.files.close();
        self.remote_hashes.close();
        self.local_hashes.close();
        self.downloads.close();
        self.ssh_pool.close();
        self.log.debug("pipeline closed");
        self.log.flush();
    }
}
