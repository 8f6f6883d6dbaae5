//! TOML configuration with in-place defaulting.
//!
//! The file is parsed once at startup; `apply_defaults` fills every optional
//! knob and rejects the file when a required key is missing, so the rest of
//! the program reads fully-populated fields.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::SyncError;

// Private key filenames probed under ~/.ssh when no keyfile is configured.
const KNOWN_KEY_FILES: &[&str] = &[
    "id_rsa",
    "id_ecdsa",
    "id_ecdsa_sk",
    "id_ed25519",
    "id_ed25519_sk",
    "id_dsa",
];

const DEFAULT_DOWNLOAD_THREADS: usize = 4;
const DEFAULT_SYNC_TAG: &str = "sync";
const BUFFER_PER_THREAD: usize = 64;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub local: LocalConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LocalConfig {
    #[serde(default)]
    pub destination: PathBuf,
    #[serde(default)]
    pub download_threads: usize,
    #[serde(default)]
    pub download_buffer: usize,
    #[serde(default)]
    pub md5sum_threads: usize,
    #[serde(default)]
    pub md5sum_buffer: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RemoteConfig {
    #[serde(default)]
    pub md5sum_threads: usize,
    #[serde(default)]
    pub md5sum_buffer: usize,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub rtorrent: RtorrentConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SshConfig {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub keyfile: Option<PathBuf>,
    /// OpenSSH known_hosts file to verify the server key against. When unset
    /// the host key is not checked.
    #[serde(default)]
    pub known_hosts: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RtorrentConfig {
    #[serde(default)]
    pub socket: String,
    #[serde(default)]
    pub sync_tag: String,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, SyncError> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| SyncError::Config(format!("read {}: {err}", path.display())))?;
        let mut config: Config = toml::from_str(&text)
            .map_err(|err| SyncError::Config(format!("parse {}: {err}", path.display())))?;
        config.apply_defaults()?;
        Ok(config)
    }

    pub fn apply_defaults(&mut self) -> Result<(), SyncError> {
        self.local.apply_defaults()?;
        self.remote.apply_defaults()
    }

    /// Worker count for the file stage: enough that short-circuiting files
    /// never starve whichever downstream stage is widest.
    pub fn file_workers(&self) -> usize {
        self.local
            .md5sum_threads
            .max(self.remote.md5sum_threads)
            .max(self.local.download_threads)
    }
}

impl LocalConfig {
    fn apply_defaults(&mut self) -> Result<(), SyncError> {
        if self.destination.as_os_str().is_empty() {
            return Err(SyncError::Config("local.destination must be set".into()));
        }
        if self.download_threads == 0 {
            self.download_threads = DEFAULT_DOWNLOAD_THREADS;
        }
        if self.download_buffer == 0 {
            self.download_buffer = self.download_threads * BUFFER_PER_THREAD;
        }
        if self.md5sum_threads == 0 {
            self.md5sum_threads = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
        }
        if self.md5sum_buffer == 0 {
            self.md5sum_buffer = self.md5sum_threads * BUFFER_PER_THREAD;
        }
        Ok(())
    }
}

impl RemoteConfig {
    fn apply_defaults(&mut self) -> Result<(), SyncError> {
        if self.md5sum_threads == 0 {
            self.md5sum_threads = 1;
        }
        if self.md5sum_buffer == 0 {
            self.md5sum_buffer = self.md5sum_threads * BUFFER_PER_THREAD;
        }
        self.ssh.apply_defaults()?;
        self.rtorrent.apply_defaults()
    }
}

impl SshConfig {
    fn apply_defaults(&mut self) -> Result<(), SyncError> {
        if self.hostname.is_empty() {
            return Err(SyncError::Config("remote.ssh.hostname must be set".into()));
        }
        if self.port == 0 {
            self.port = 22;
        }
        if self.username.is_empty() {
            self.username = std::env::var("USER").unwrap_or_else(|_| "root".into());
        }
        if self.keyfile.is_none() {
            self.keyfile = Some(scan_for_private_key()?);
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

impl RtorrentConfig {
    fn apply_defaults(&mut self) -> Result<(), SyncError> {
        if self.socket.is_empty() {
            return Err(SyncError::Config(
                "remote.rtorrent.socket must be set".into(),
            ));
        }
        if self.sync_tag.is_empty() {
            self.sync_tag = DEFAULT_SYNC_TAG.into();
        }
        Ok(())
    }
}

fn scan_for_private_key() -> Result<PathBuf, SyncError> {
    let home = dirs::home_dir()
        .ok_or_else(|| SyncError::Config("cannot determine home directory".into()))?;
    for name in KNOWN_KEY_FILES {
        let path = home.join(".ssh").join(name);
        if path.exists() {
            return Ok(path);
        }
    }
    Err(SyncError::Config("no private key found in ~/.ssh".into()))
}
