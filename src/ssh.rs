//! SSH session management: dialing, authentication, host-key checking, and
//! the session+SFTP pair the pipeline passes around.

use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;

use ssh2::{CheckResult, KnownHostFileKind, Session, Sftp};

use crate::config::SshConfig;
use crate::error::SyncError;
use crate::logger::SyncLog;

/// An authenticated SSH session with an SFTP channel on top. Sessions are
/// multiplexed, so exec channels and SFTP operations share one TCP
/// connection.
pub struct SshPair {
    pub session: Session,
    pub sftp: Sftp,
}

pub type SharedSsh = Arc<SshPair>;

pub fn dial(config: &SshConfig, log: &SyncLog) -> Result<SshPair, SyncError> {
    let addr = config.addr();
    let fail = |reason: String| SyncError::SshDial {
        addr: addr.clone(),
        reason,
    };

    log.debug(&format!("connecting to {addr}"));
    let tcp = TcpStream::connect(&addr).map_err(|e| fail(e.to_string()))?;

    let mut session = Session::new().map_err(|e| fail(e.to_string()))?;
    session.set_tcp_stream(tcp);
    session.handshake().map_err(|e| fail(e.to_string()))?;

    verify_host_key(&session, config, log)?;

    let keyfile = config
        .keyfile
        .as_deref()
        .ok_or_else(|| SyncError::Config("remote.ssh.keyfile is not set".into()))?;
    session
        .userauth_pubkey_file(&config.username, None, keyfile, None)
        .map_err(|e| fail(format!("public key auth with {}: {e}", keyfile.display())))?;
    if !session.authenticated() {
        return Err(fail("authentication did not complete".into()));
    }

    let sftp = session.sftp().map_err(|e| fail(e.to_string()))?;
    log.debug(&format!("connected to {addr}"));
    Ok(SshPair { session, sftp })
}

/// Check the server key against the configured known_hosts file. Without one
/// the key is accepted blind, with a warning.
fn verify_host_key(session: &Session, config: &SshConfig, log: &SyncLog) -> Result<(), SyncError> {
    let Some(path) = &config.known_hosts else {
        log.warn("host key not verified; set remote.ssh.known-hosts to enable verification");
        return Ok(());
    };

    let (key, _) = session.host_key().ok_or_else(|| SyncError::SshDial {
        addr: config.addr(),
        reason: "server offered no host key".into(),
    })?;
    check_known_hosts(session, path, &config.hostname, config.port, key)
}

/// Look `key` up in an OpenSSH-format known_hosts file. Anything but a match
/// is a dial failure.
fn check_known_hosts(
    session: &Session,
    path: &Path,
    hostname: &str,
    port: u16,
    key: &[u8],
) -> Result<(), SyncError> {
    let fail = |reason: String| SyncError::SshDial {
        addr: format!("{hostname}:{port}"),
        reason,
    };

    let mut known = session.known_hosts().map_err(|e| fail(e.to_string()))?;
    known
        .read_file(path, KnownHostFileKind::OpenSSH)
        .map_err(|e| fail(format!("read {}: {e}", path.display())))?;

    match known.check_port(hostname, port, key) {
        CheckResult::Match => Ok(()),
        CheckResult::NotFound => Err(fail(format!(
            "host key not found in {}",
            path.display()
        ))),
        CheckResult::Mismatch => Err(fail("host key mismatch".into())),
        CheckResult::Failure => Err(fail("host key check failed".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssh2::KnownHostKeyFormat;
    use std::path::PathBuf;
    use tempfile::TempDir;

    const HOST: &str = "seedbox.example.net";
    const KEY: &[u8] = b"0123456789abcdef0123456789abcdef";

    /// Write a known_hosts fixture holding `KEY` for `HOST`, through the
    /// library so the file is genuine OpenSSH format.
    fn fixture(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("known_hosts");
        let session = Session::new().unwrap();
        let mut known = session.known_hosts().unwrap();
        known
            .add(HOST, KEY, "", KnownHostKeyFormat::Ed25519)
            .unwrap();
        known
            .write_file(&path, KnownHostFileKind::OpenSSH)
            .unwrap();
        path
    }

    #[test]
    fn test_matching_key_passes() {
        let dir = TempDir::new().unwrap();
        let path = fixture(&dir);

        let session = Session::new().unwrap();
        check_known_hosts(&session, &path, HOST, 22, KEY).unwrap();
    }

    #[test]
    fn test_unknown_host_is_a_dial_error() {
        let dir = TempDir::new().unwrap();
        let path = fixture(&dir);

        let session = Session::new().unwrap();
        let err = check_known_hosts(&session, &path, "other.example.net", 22, KEY).unwrap_err();
        assert!(matches!(err, SyncError::SshDial { .. }));
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_mismatched_key_is_a_dial_error() {
        let dir = TempDir::new().unwrap();
        let path = fixture(&dir);

        let session = Session::new().unwrap();
        let err = check_known_hosts(&session, &path, HOST, 22, b"another key entirely.........")
            .unwrap_err();
        assert!(matches!(err, SyncError::SshDial { .. }));
        assert!(err.to_string().contains("mismatch"));
    }

    #[test]
    fn test_unreadable_file_is_a_dial_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("no_such_known_hosts");

        let session = Session::new().unwrap();
        let err = check_known_hosts(&session, &missing, HOST, 22, KEY).unwrap_err();
        assert!(err.to_string().contains("read"));
    }
}
