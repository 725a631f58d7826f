//! Chunked image copy
//!
//! Reads the frozen base image in fixed-size chunks. All-zero chunks are
//! skipped with a seek when sparse copying is enabled and the destination
//! length is fixed up at the end, the way `cp --sparse=auto` behaves.

use crate::config::CopyConfig;
use hotclone_core::{AbortSignal, BlockCopier, CopyError, CopyProgress};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{debug, info};

/// Copies regular files and block devices chunk by chunk
#[derive(Debug, Clone)]
pub struct FileBlockCopier {
    chunk_size: usize,
    sparse: bool,
}

impl FileBlockCopier {
    /// Copier with the configured chunk size and sparse behavior
    pub fn new(config: &CopyConfig) -> Self {
        Self {
            chunk_size: config.chunk_size.max(1),
            sparse: config.sparse,
        }
    }

    /// Override the chunk size
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }
}

impl Default for FileBlockCopier {
    fn default() -> Self {
        Self::new(&CopyConfig::default())
    }
}

impl BlockCopier for FileBlockCopier {
    fn copy(
        &self,
        source: &Path,
        dest: &Path,
        on_progress: &mut dyn FnMut(CopyProgress),
        abort: &dyn AbortSignal,
    ) -> Result<u64, CopyError> {
        let mut src = File::open(source)?;
        // seek works for block devices, where metadata().len() is zero
        let total_bytes = src.seek(SeekFrom::End(0))?;
        src.seek(SeekFrom::Start(0))?;

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut dst = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(dest)?;
        let dest_is_file = dst.metadata()?.is_file();
        let sparse = self.sparse && dest_is_file;

        debug!(
            target: "hotclone::copy",
            source = %source.display(),
            dest = %dest.display(),
            total_bytes,
            chunk_size = self.chunk_size,
            sparse,
            "Starting copy"
        );

        let mut buf = vec![0u8; self.chunk_size];
        let mut copied = 0u64;
        loop {
            if abort.is_aborted() {
                debug!(target: "hotclone::copy", dest = %dest.display(), copied, "Copy aborted");
                return Err(CopyError::Cancelled);
            }
            let n = read_full(&mut src, &mut buf)?;
            if n == 0 {
                break;
            }
            let chunk = &buf[..n];
            if sparse && chunk.iter().all(|b| *b == 0) {
                dst.seek(SeekFrom::Current(n as i64))?;
            } else {
                dst.write_all(chunk)?;
            }
            copied += n as u64;
            on_progress(CopyProgress {
                bytes_copied: copied,
                total_bytes,
            });
        }

        if dest_is_file {
            // trailing holes are not materialized by the seek alone
            dst.set_len(copied)?;
        }
        dst.sync_all()?;

        info!(
            target: "hotclone::copy",
            source = %source.display(),
            dest = %dest.display(),
            bytes = copied,
            "Copy finished"
        );
        Ok(copied)
    }

    fn discard(&self, dest: &Path) -> Result<(), CopyError> {
        match fs::symlink_metadata(dest) {
            Ok(meta) if meta.is_file() => {
                fs::remove_file(dest)?;
                debug!(target: "hotclone::copy", dest = %dest.display(), "Discarded partial copy");
                Ok(())
            }
            // block devices are never removed
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Fill `buf` unless the reader hits end of file first
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
