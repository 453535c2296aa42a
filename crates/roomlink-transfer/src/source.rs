//! ---
//! rl_section: "04-transfer"
//! rl_subsection: "module"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Chunked transfer sessions, sender engine and slave-side receiver."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::{Result, TransferError};

/// Random-access byte source with a known size feeding the sender.
pub trait AssetSource: Send {
    /// Total bytes to deliver.
    fn total_size(&self) -> usize;
    /// Fill `buf` from `offset`; short reads are an error.
    fn read_at(&mut self, offset: usize, buf: &mut [u8]) -> Result<()>;
    /// Label for logs.
    fn label(&self) -> String;
}

/// In-memory image.
#[derive(Debug, Clone)]
pub struct MemorySource {
    label: String,
    bytes: Vec<u8>,
}

impl MemorySource {
    /// Wrap a buffer.
    pub fn new(label: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            label: label.into(),
            bytes,
        }
    }
}

impl AssetSource for MemorySource {
    fn total_size(&self) -> usize {
        self.bytes.len()
    }

    fn read_at(&mut self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let end = offset + buf.len();
        if end > self.bytes.len() {
            return Err(TransferError::ShortRead {
                offset,
                expected: buf.len(),
            });
        }
        buf.copy_from_slice(&self.bytes[offset..end]);
        Ok(())
    }

    fn label(&self) -> String {
        self.label.clone()
    }
}

/// Image read from disk chunk by chunk.
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    file: File,
    len: usize,
}

impl FileSource {
    /// Open an image file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let len = file.metadata()?.len() as usize;
        Ok(Self { path, file, len })
    }
}

impl AssetSource for FileSource {
    fn total_size(&self) -> usize {
        self.len
    }

    fn read_at(&mut self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let expected = buf.len();
        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file.read_exact(buf).map_err(|err| match err.kind() {
            std::io::ErrorKind::UnexpectedEof => TransferError::ShortRead { offset, expected },
            _ => TransferError::Source(err),
        })
    }

    fn label(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn memory_source_reads_slices() {
        let mut source = MemorySource::new("logo", (0u8..10).collect());
        let mut buf = [0u8; 4];
        source.read_at(6, &mut buf).unwrap();
        assert_eq!(buf, [6, 7, 8, 9]);
        assert!(matches!(
            source.read_at(8, &mut buf),
            Err(TransferError::ShortRead { offset: 8, .. })
        ));
    }

    #[test]
    fn file_source_reports_size_and_reads() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"firmware-image").unwrap();
        let mut source = FileSource::open(file.path()).unwrap();
        assert_eq!(source.total_size(), 14);
        let mut buf = [0u8; 5];
        source.read_at(9, &mut buf).unwrap();
        assert_eq!(&buf, b"image");
    }
}
