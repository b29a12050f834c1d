use std::fs;
use std::path::{Path, PathBuf};

use tracing::trace;

use crate::error::{Result, TigStoreError};
use crate::index::MAX_OFFSET;
use crate::io::{FileIo, StdFileIo};

pub const RECORD_PREFIX_LEN: u64 = 4;

pub(crate) fn data_file_path(dir: &Path, version: u32) -> PathBuf {
    dir.join(format!("seqDB.v{version:03}.dat"))
}

/// One version's append-only payload file. Records are a 4-byte length
/// prefix followed by codec output; readers address them by offset alone.
/// The append tail is tracked explicitly, so appends never seek and reads
/// never disturb the write position.
#[derive(Debug)]
pub struct DataFile {
    io: StdFileIo,
    version: u32,
    tail: u64,
}

impl DataFile {
    /// Open for appending, creating the file if needed. Existing content is
    /// preserved; new records land at the current end.
    pub fn open_rw(dir: &Path, version: u32) -> Result<Self> {
        let io = StdFileIo::open_rw(data_file_path(dir, version))?;
        let tail = io.len()?;
        Ok(Self { io, version, tail })
    }

    /// Open an existing file for reads only.
    pub fn open_ro(dir: &Path, version: u32) -> Result<Self> {
        let io = StdFileIo::open_ro(data_file_path(dir, version))?;
        let tail = io.len()?;
        Ok(Self { io, version, tail })
    }

    /// Start an empty file at an explicit path, discarding any stale one.
    /// Used for compaction staging.
    pub(crate) fn create_at(path: &Path, version: u32) -> Result<Self> {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        let io = StdFileIo::open_rw(path)?;
        Ok(Self {
            io,
            version,
            tail: 0,
        })
    }

    pub fn len(&self) -> u64 {
        self.tail
    }

    pub fn is_empty(&self) -> bool {
        self.tail == 0
    }

    /// Append one record and return the offset it was written at.
    pub fn append(&mut self, payload: &[u8]) -> Result<u64> {
        let off = self.tail;
        if off > MAX_OFFSET {
            return Err(TigStoreError::OffsetOverflow {
                version: self.version,
            });
        }
        let prefix = (payload.len() as u32).to_le_bytes();
        self.io
            .write_at(off, &prefix)
            .map_err(|e| self.io_at(off, e))?;
        self.io
            .write_at(off + RECORD_PREFIX_LEN, payload)
            .map_err(|e| self.io_at(off, e))?;
        self.tail = off + RECORD_PREFIX_LEN + payload.len() as u64;
        trace!(version = self.version, off, len = payload.len(), "datafile.append");
        Ok(off)
    }

    /// Read the record starting at `offset`. A record that starts or ends
    /// past the end of the file means the index references data that was
    /// never fully written.
    pub fn read_record(&self, offset: u64) -> Result<Vec<u8>> {
        let len = self.io.len().map_err(|e| self.io_at(offset, e))?;
        if offset + RECORD_PREFIX_LEN > len {
            return Err(TigStoreError::CorruptStore(format!(
                "record at version {} offset {offset} starts past end of data file ({len} bytes)",
                self.version
            )));
        }
        let mut prefix = [0u8; RECORD_PREFIX_LEN as usize];
        self.io
            .read_at(offset, &mut prefix)
            .map_err(|e| self.io_at(offset, e))?;
        let payload_len = u64::from(u32::from_le_bytes(prefix));
        let end = offset + RECORD_PREFIX_LEN + payload_len;
        if end > len {
            return Err(TigStoreError::CorruptStore(format!(
                "record at version {} offset {offset} extends to {end}, past end of data file ({len} bytes)",
                self.version
            )));
        }
        let mut payload = vec![0u8; payload_len as usize];
        self.io
            .read_at(offset + RECORD_PREFIX_LEN, &mut payload)
            .map_err(|e| self.io_at(offset, e))?;
        trace!(version = self.version, offset, len = payload_len, "datafile.read");
        Ok(payload)
    }

    pub fn sync(&self) -> Result<()> {
        self.io.sync_all()
    }

    fn io_at(&self, offset: u64, err: TigStoreError) -> TigStoreError {
        match err {
            TigStoreError::Io(source) => TigStoreError::IoAt {
                version: self.version,
                offset,
                source,
            },
            other => other,
        }
    }
}
