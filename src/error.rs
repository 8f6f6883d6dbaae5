//! Error kinds shared across the pipeline.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Anything that can go wrong while syncing. Per-unit errors travel through
/// the one-shot callbacks and are joined at fan-in points; only configuration
/// and initial connection errors abort the process.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("ssh dial to {addr} failed: {reason}")]
    SshDial { addr: String, reason: String },

    #[error("ssh {op} failed: {reason}")]
    Ssh { op: &'static str, reason: String },

    #[error("sftp {op} {path} failed: {reason}")]
    Sftp {
        op: &'static str,
        path: PathBuf,
        reason: String,
    },

    #[error("rpc {method} failed: {reason}")]
    Rpc { method: String, reason: String },

    #[error("remote file {0} does not exist")]
    RemoteMissing(PathBuf),

    #[error("{path} size mismatch: {actual} != {expected}")]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("i/o on {path}: {source}")]
    LocalIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Scgi(#[from] ScgiError),

    #[error("pool is closed")]
    PoolClosed,

    #[error("channel closed before the expected results arrived")]
    ChannelClosed,

    #[error("recovered from panic: {0}")]
    PanicRecovered(String),

    #[error("{}", join_messages(.0))]
    Multiple(Vec<SyncError>),
}

impl SyncError {
    pub fn local_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SyncError::LocalIo {
            path: path.into(),
            source,
        }
    }
}

/// Errors produced by the SCGI round-tripper.
#[derive(Debug, Error)]
pub enum ScgiError {
    #[error("scgi: dial failed: {0}")]
    Dial(String),

    #[error("scgi: header write failed: {0}")]
    HeaderWrite(#[source] io::Error),

    #[error("scgi: body write failed: {0}")]
    BodyWrite(#[source] io::Error),

    #[error("scgi: response read failed: {0}")]
    Read(#[source] io::Error),

    #[error("scgi: malformed status line {0:?}")]
    MalformedStatus(String),

    #[error("scgi: first response header is not Status: {0:?}")]
    MissingStatus(String),

    #[error("scgi: unparsable status code in {0:?}")]
    BadStatusCode(String),
}

/// Collapse a batch of errors into a single result, preserving every message.
/// An empty batch is success; a single error passes through unchanged.
pub fn join_errors<I>(errors: I) -> Result<(), SyncError>
where
    I: IntoIterator<Item = SyncError>,
{
    let mut errors: Vec<SyncError> = errors.into_iter().collect();
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(SyncError::Multiple(errors)),
    }
}

fn join_messages(errors: &[SyncError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_empty_is_ok() {
        assert!(join_errors(Vec::new()).is_ok());
    }

    #[test]
    fn test_join_single_passes_through() {
        let err = join_errors(vec![SyncError::PoolClosed]).unwrap_err();
        assert!(matches!(err, SyncError::PoolClosed));
    }

    #[test]
    fn test_join_many_preserves_messages() {
        let err = join_errors(vec![
            SyncError::PoolClosed,
            SyncError::ChannelClosed,
        ])
        .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("pool is closed"));
        assert!(text.contains("channel closed"));
    }
}
