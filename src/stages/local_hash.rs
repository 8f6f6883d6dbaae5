//! Local hash stage: stream a file on disk through MD5.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::sync::Arc;

use crate::context::SharedContext;
use crate::error::SyncError;
use crate::logger::SyncLog;
use crate::progress;
use crate::queue::Handler;
use crate::stages::file::{FileMetadata, HashCallback};

pub struct LocalHashUnit {
    ctx: Arc<SharedContext>,
    log: SyncLog,
    file_path: String,
    meta: Option<FileMetadata>,
    callback: Option<HashCallback>,
}

impl LocalHashUnit {
    pub fn new(
        ctx: Arc<SharedContext>,
        parent: &str,
        file_path: &str,
        meta: FileMetadata,
        callback: HashCallback,
    ) -> Self {
        let log = ctx.log.with_prefix(&format!("{parent} local md5sum"));
        LocalHashUnit {
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
        self.log.debug(&format!("md5sum {}", meta.path.display()));

        let file = File::open(&meta.path).map_err(|err| {
            self.log.error(&format!(
                "error opening file {}: {err}",
                meta.path.display()
            ));
            SyncError::local_io(&meta.path, err)
        })?;

        let bar = progress::transfer_bar(
            &self.ctx.progress,
            &format!("local md5sum {}", self.file_path),
            meta.size,
        );
        let mut reader = bar.wrap_read(BufReader::new(file));
        let digest = md5_stream(&mut reader);
        progress::remove(&self.ctx.progress, &bar);

        let digest = digest.map_err(|err| {
            self.log.error(&format!(
                "error hashing file {}: {err}",
                meta.path.display()
            ));
            SyncError::local_io(&meta.path, err)
        })?;

        self.log.trace(&format!("md5sum: {}", hex::encode(digest)));
        meta.md5 = Some(digest);
        Ok(meta)
    }
}

impl Handler for LocalHashUnit {
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

/// MD5 of everything `reader` yields.
pub fn md5_stream(reader: &mut impl Read) -> io::Result<[u8; 16]> {
    let mut context = md5::Context::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        context.consume(&buf[..n]);
    }
    Ok(context.compute().0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_md5_stream_empty() {
        let digest = md5_stream(&mut Cursor::new(b"")).unwrap();
        assert_eq!(hex::encode(digest), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn test_md5_stream_known_vector() {
        let digest = md5_stream(&mut Cursor::new(b"hello")).unwrap();
        assert_eq!(hex::encode(digest), "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn test_md5_stream_matches_one_shot() {
        let data = vec![0xabu8; 200_000];
        let digest = md5_stream(&mut Cursor::new(&data)).unwrap();
        assert_eq!(digest, md5::compute(&data).0);
    }

    #[test]
    fn test_md5_of_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"seedbox").unwrap();

        let mut file = File::open(&path).unwrap();
        let digest = md5_stream(&mut file).unwrap();
        assert_eq!(digest, md5::compute(b"seedbox").0);
    }
}
