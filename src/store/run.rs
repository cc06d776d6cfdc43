//! Byte runs: the write-once storage behind one chunk.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;
use crate::store::backing::BackingFile;

/// A fixed span of body bytes, held in memory or in a spill file.
///
/// Cloning is cheap: memory runs share their buffer and file runs share
/// the spill file handle.
#[derive(Debug, Clone)]
pub enum ByteRun {
    Memory(Bytes),
    File {
        file: Arc<BackingFile>,
        offset: u64,
        len: usize,
    },
}

impl ByteRun {
    /// Append `data` to `file` and describe where it landed.
    pub fn write_file(file: &Arc<BackingFile>, data: &[u8]) -> Result<Self> {
        let offset = file.write_to(data)?;
        Ok(ByteRun::File {
            file: Arc::clone(file),
            offset,
            len: data.len(),
        })
    }

    pub fn len(&self) -> usize {
        match self {
            ByteRun::Memory(b) => b.len(),
            ByteRun::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_in_memory(&self) -> bool {
        matches!(self, ByteRun::Memory(_))
    }

    /// Copy bytes starting at `at` into `buf`. Returns the count copied.
    pub fn read_at(&self, at: usize, buf: &mut [u8]) -> Result<usize> {
        let n = buf.len().min(self.len().saturating_sub(at));
        if n == 0 {
            return Ok(0);
        }
        match self {
            ByteRun::Memory(b) => buf[..n].copy_from_slice(&b[at..at + n]),
            ByteRun::File { file, offset, .. } => file.read(offset + at as u64, &mut buf[..n])?,
        }
        Ok(n)
    }

    /// The whole run as a buffer. Memory runs are returned without copying.
    pub fn to_bytes(&self) -> Result<Bytes> {
        match self {
            ByteRun::Memory(b) => Ok(b.clone()),
            ByteRun::File { file, offset, len } => {
                let mut buf = vec![0u8; *len];
                file.read(*offset, &mut buf)?;
                Ok(Bytes::from(buf))
            }
        }
    }

    /// Move a memory run into `file`. File runs are returned unchanged.
    pub fn spill(&self, file: &Arc<BackingFile>) -> Result<Self> {
        match self {
            ByteRun::Memory(b) => ByteRun::write_file(file, b),
            ByteRun::File { .. } => Ok(self.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;

    #[test]
    fn test_memory_read_at() {
        let run = ByteRun::Memory(Bytes::from_static(b"abcdef"));
        let mut buf = [0u8; 4];
        assert_eq!(run.read_at(4, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(run.read_at(6, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_spill_preserves_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StoreConfig::new().temp_dir(dir.path()).validate().unwrap();
        let file = Arc::new(BackingFile::create(&cfg).unwrap());
        file.write_to(b"unrelated prefix").unwrap();

        let run = ByteRun::Memory(Bytes::from_static(b"spilled run"));
        let spilled = run.spill(&file).unwrap();
        assert!(!spilled.is_in_memory());
        assert_eq!(spilled.len(), run.len());
        assert_eq!(spilled.to_bytes().unwrap(), run.to_bytes().unwrap());

        let mut buf = [0u8; 3];
        assert_eq!(spilled.read_at(8, &mut buf).unwrap(), 3);
        assert_eq!(&buf, b"run");
    }
}
