//! Remote hash stage: run `md5sum` on the seedbox over a fresh exec channel
//! and parse the digest out of stdout. Sessions are cheap on a multiplexed
//! client, so this never touches the download pool.

use std::io::{self, Read, Write};
use std::sync::Arc;

use crate::context::SharedContext;
use crate::error::SyncError;
use crate::logger::SyncLog;
use crate::progress;
use crate::queue::Handler;
use crate::stages::file::{FileMetadata, HashCallback};

pub struct RemoteHashUnit {
    ctx: Arc<SharedContext>,
    log: SyncLog,
    file_path: String,
    meta: Option<FileMetadata>,
    callback: Option<HashCallback>,
}

impl RemoteHashUnit {
    pub fn new(
        ctx: Arc<SharedContext>,
        parent: &str,
        file_path: &str,
        meta: FileMetadata,
        callback: HashCallback,
    ) -> Self {
        let log = ctx.log.with_prefix(&format!("{parent} remote md5sum"));
        RemoteHashUnit {
            ctx,
            log,
            file_path: file_path.to_string(),
            meta: Some(meta),
            callback: Some(callback),
        }
    }

    fn complete(&mut self, result: Result<FileMetadata, SyncError>) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }

    fn run(&self, mut meta: FileMetadata) -> Result<FileMetadata, SyncError> {
        let quoted = shell_escape::unix::escape(meta.path.to_string_lossy());
        let cmd = format!("md5sum -b {quoted}");
        self.log.debug(&format!("remote exec: {cmd}"));

        let bar = progress::spinner(
            &self.ctx.progress,
            &format!("remote md5sum {}", self.file_path),
        );
        let result = self.exec(&cmd);
        progress::remove(&self.ctx.progress, &bar);

        let digest = result?;
        self.log
            .trace(&format!("remote md5sum: {}", hex::encode(digest)));
        meta.md5 = Some(digest);
        Ok(meta)
    }

    fn exec(&self, cmd: &str) -> Result<[u8; 16], SyncError> {
        let ssh_err = |reason: String| SyncError::Ssh {
            op: "md5sum",
            reason,
        };

        let mut channel = self
            .ctx
            .ssh
            .session
            .channel_session()
            .map_err(|err| {
                self.log
                    .error(&format!("error creating ssh session: {err}"));
                SyncError::Ssh {
                    op: "session",
                    reason: err.to_string(),
                }
            })?;
        channel.exec(cmd).map_err(|err| ssh_err(err.to_string()))?;

        let mut stdout = String::new();
        channel
            .read_to_string(&mut stdout)
            .map_err(|err| ssh_err(err.to_string()))?;

        // Anything md5sum prints on stderr goes to the log at warn level.
        let mut stderr_log =
            LineLogger::new(self.log.with_prefix(&format!("{} stderr", self.log.prefix())));
        let _ = io::copy(&mut channel.stderr(), &mut stderr_log);
        drop(stderr_log);

        let _ = channel.wait_close();
        let status = channel
            .exit_status()
            .map_err(|err| ssh_err(err.to_string()))?;
        if status != 0 {
            self.log
                .error(&format!("remote md5sum exited with status {status}"));
            return Err(ssh_err(format!("exit status {status}")));
        }

        parse_md5sum(&stdout)
    }
}

impl Handler for RemoteHashUnit {
    fn handle(&mut self) {
        let Some(meta) = self.meta.take() else {
            return;
        };
        let result = self.run(meta);
        self.complete(result);
    }

    fn fail(&mut self, err: SyncError) {
        self.complete(Err(err));
    }
}

/// `md5sum` prints `<32 hex chars><space><name>`; anything else is a
/// protocol error.
pub fn parse_md5sum(output: &str) -> Result<[u8; 16], SyncError> {
    let ssh_err = |reason: String| SyncError::Ssh {
        op: "md5sum",
        reason,
    };

    let Some((digest_hex, _)) = output.split_once(' ') else {
        return Err(ssh_err(format!("output has no space: {output:?}")));
    };
    let bytes = hex::decode(digest_hex)
        .map_err(|err| ssh_err(format!("bad digest {digest_hex:?}: {err}")))?;
    <[u8; 16]>::try_from(bytes)
        .map_err(|_| ssh_err(format!("digest has wrong length: {digest_hex:?}")))
}

/// Buffers bytes and logs each complete line at warn level; a trailing
/// partial line is flushed on drop.
pub struct LineLogger {
    log: SyncLog,
    buf: Vec<u8>,
}

impl LineLogger {
    pub fn new(log: SyncLog) -> Self {
        LineLogger {
            log,
            buf: Vec::new(),
        }
    }

    fn emit(&self, line: &[u8]) {
        if !line.is_empty() {
            self.log.warn(&String::from_utf8_lossy(line));
        }
    }
}

impl Write for LineLogger {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            self.emit(&line);
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for LineLogger {
    fn drop(&mut self) {
        let rest = std::mem::take(&mut self.buf);
        self.emit(&rest);
    }
}
