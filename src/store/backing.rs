//! Spill file shared by the file-backed runs of one part.
//!
//! Appends only ever move the write cursor forward, and every run reads a
//! range that was fully written before the run existed, so positional
//! reads can interleave with appends. The file is removed when it is
//! closed or when the last run referencing it goes away.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::config::ValidatedConfig;
use crate::error::{MimeError, Result};

struct FileState {
    file: NamedTempFile,
    write_pos: u64,
}

/// Random-access spill file with append and positional read.
pub struct BackingFile {
    path: PathBuf,
    state: Mutex<Option<FileState>>,
}

impl BackingFile {
    /// Create a new spill file according to the configured directory and naming.
    pub fn create(config: &ValidatedConfig) -> std::io::Result<Self> {
        let file = config.create_spill_file()?;
        let path = file.path().to_path_buf();
        debug!(path = %path.display(), "Created spill file");
        Ok(Self {
            path,
            state: Mutex::new(Some(FileState { file, write_pos: 0 })),
        })
    }

    /// Path of the spill file on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written so far.
    pub fn len(&self) -> u64 {
        self.state.lock().as_ref().map_or(0, |s| s.write_pos)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `true` once [`BackingFile::close`] or [`BackingFile::persist`] ran.
    pub fn is_closed(&self) -> bool {
        self.state.lock().is_none()
    }

    /// Append `data` and return the offset it was written at.
    pub fn write_to(&self, data: &[u8]) -> Result<u64> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or_else(|| self.closed_error())?;
        let pointer = state.write_pos;
        let file = state.file.as_file_mut();
        file.seek(SeekFrom::Start(pointer))
            .map_err(|e| MimeError::io(&self.path, e))?;
        file.write_all(data)
            .map_err(|e| MimeError::io(&self.path, e))?;
        state.write_pos += data.len() as u64;
        Ok(pointer)
    }

    /// Fill `buf` from `pointer`. The range must already be written.
    pub fn read(&self, pointer: u64, buf: &mut [u8]) -> Result<()> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or_else(|| self.closed_error())?;
        if pointer + buf.len() as u64 > state.write_pos {
            return Err(MimeError::illegal_state(format!(
                "read of {} bytes at {} beyond written length {}",
                buf.len(),
                pointer,
                state.write_pos
            )));
        }
        let file = state.file.as_file_mut();
        file.seek(SeekFrom::Start(pointer))
            .map_err(|e| MimeError::io(&self.path, e))?;
        file.read_exact(buf)
            .map_err(|e| MimeError::io(&self.path, e))?;
        Ok(())
    }

    /// Delete the file now. Later reads and writes fail. Repeated calls are no-ops.
    pub fn close(&self) {
        if let Some(state) = self.state.lock().take() {
            let path = self.path.clone();
            if let Err(e) = state.file.close() {
                warn!(path = %path.display(), error = %e, "Failed to remove spill file");
            } else {
                debug!(path = %path.display(), "Removed spill file");
            }
        }
    }

    /// Move the file to `dest`, copying when a rename is not possible.
    ///
    /// The spill file is closed afterwards.
    pub fn persist(&self, dest: &Path) -> Result<()> {
        let state = self.state.lock().take().ok_or_else(|| self.closed_error())?;
        match state.file.persist(dest) {
            Ok(_) => Ok(()),
            Err(e) => {
                debug!(error = %e.error, "Rename failed, copying spill file instead");
                let mut src = e.file.reopen().map_err(|e| MimeError::io(&self.path, e))?;
                let mut out = File::create(dest).map_err(|e| MimeError::io(dest, e))?;
                std::io::copy(&mut src, &mut out).map_err(|e| MimeError::io(dest, e))?;
                Ok(())
            }
        }
    }

    fn closed_error(&self) -> MimeError {
        MimeError::illegal_state(format!("spill file '{}' is closed", self.path.display()))
    }
}

impl std::fmt::Debug for BackingFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackingFile")
            .field("path", &self.path)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;

    fn config(dir: &Path) -> ValidatedConfig {
        StoreConfig::new().temp_dir(dir).validate().unwrap()
    }

    #[test]
    fn test_write_returns_previous_offset() {
        let dir = tempfile::tempdir().unwrap();
        let file = BackingFile::create(&config(dir.path())).unwrap();
        assert_eq!(file.write_to(b"hello").unwrap(), 0);
        assert_eq!(file.write_to(b" world").unwrap(), 5);
        assert_eq!(file.len(), 11);

        let mut buf = [0u8; 5];
        file.read(6, &mut buf).unwrap();
        assert_eq!(&buf, b"world");
        // Reads do not disturb the append cursor.
        assert_eq!(file.write_to(b"!").unwrap(), 11);
    }

    #[test]
    fn test_read_beyond_written_fails() {
        let dir = tempfile::tempdir().unwrap();
        let file = BackingFile::create(&config(dir.path())).unwrap();
        file.write_to(b"abc").unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(
            file.read(0, &mut buf),
            Err(MimeError::IllegalState(_))
        ));
    }

    #[test]
    fn test_close_deletes_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let file = BackingFile::create(&config(dir.path())).unwrap();
        file.write_to(b"abc").unwrap();
        let path = file.path().to_path_buf();
        assert!(path.exists());

        file.close();
        file.close();
        assert!(!path.exists());
        assert!(file.is_closed());
        assert!(file.write_to(b"x").is_err());
    }

    #[test]
    fn test_drop_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let file = BackingFile::create(&config(dir.path())).unwrap();
        let path = file.path().to_path_buf();
        drop(file);
        assert!(!path.exists());
    }

    #[test]
    fn test_persist_moves_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = BackingFile::create(&config(dir.path())).unwrap();
        file.write_to(b"payload").unwrap();
        let dest = dir.path().join("out.bin");
        file.persist(&dest).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"payload");
        assert!(file.is_closed());
    }

    #[test]
    fn test_concurrent_reads_while_appending() {
        let dir = tempfile::tempdir().unwrap();
        let file = std::sync::Arc::new(BackingFile::create(&config(dir.path())).unwrap());
        let first = file.write_to(&[7u8; 1024]).unwrap();

        std::thread::scope(|s| {
            let reader = std::sync::Arc::clone(&file);
            s.spawn(move || {
                for _ in 0..100 {
                    let mut buf = [0u8; 1024];
                    reader.read(first, &mut buf).unwrap();
                    assert!(buf.iter().all(|&b| b == 7));
                }
            });
            for i in 0..100u8 {
                file.write_to(&[i; 64]).unwrap();
            }
        });
        assert_eq!(file.len(), 1024 + 100 * 64);
    }
}
