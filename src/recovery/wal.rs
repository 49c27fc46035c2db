//! Write-ahead log file
//!
//! ### Frame format
//! Each record is one frame:
//! - 4-byte little-endian length prefix
//! - bincode-encoded [`LogRecord`]
//!
//! Every append is synced before it returns; one record is the unit of
//! durability. A crash in the middle of an append leaves a torn final frame,
//! which readers stop at and the next writer truncates away. An append that
//! fails in the running process is cut back the same way before the error is
//! returned; if even that fails the writer refuses further appends.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use log::{debug, error, warn};

use super::log::LogRecord;
use crate::error::{GraniteError, Result};

const LEN_PREFIX: usize = 4;

/// How an append reaches stable storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// `fdatasync`: file contents only
    #[default]
    Data,
    /// `fsync`: contents and metadata
    Full,
}

/// Append-only WAL writer
#[derive(Debug)]
pub struct WalWriter {
    path: PathBuf,
    file: File,
    sync: SyncMode,
    appended: u64,
    /// Byte length of the complete frames in the file
    len: u64,
    /// Set when a failed append could not be cut back
    poisoned: bool,
}

impl WalWriter {
    /// Open (or create) the WAL at `path` for appending.
    ///
    /// A torn final frame left by a crash is cut off first, so new frames
    /// always follow the last complete one.
    pub fn open(path: impl AsRef<Path>, sync: SyncMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let scan = WalReader::scan(&path)?;

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        if scan.torn {
            warn!(
                "truncating torn WAL tail in '{}' at byte {}",
                path.display(),
                scan.valid_len
            );
            file.set_len(scan.valid_len)?;
            file.sync_all()?;
        }

        Ok(Self {
            path,
            file,
            sync,
            appended: 0,
            len: scan.valid_len,
            poisoned: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and sync it. Returns the frame size in bytes.
    ///
    /// On failure nothing of the record is left in the file.
    pub fn append(&mut self, record: &LogRecord) -> Result<usize> {
        if self.poisoned {
            return Err(GraniteError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!(
                    "WAL '{}' holds a partial frame from a failed append",
                    self.path.display()
                ),
            )));
        }

        let encoded = bincode::serialize(record)
            .map_err(|e| GraniteError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        let len = encoded.len() as u32;

        let mut frame = Vec::with_capacity(LEN_PREFIX + encoded.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&encoded);

        if let Err(e) = self.write_frame(&frame) {
            error!("WAL append to '{}' failed: {}", self.path.display(), e);
            self.discard_partial();
            return Err(e.into());
        }

        self.len += frame.len() as u64;
        self.appended += 1;
        debug!("appended {} record ({} bytes)", record.kind_name(), frame.len());
        Ok(frame.len())
    }

    /// Records appended through this writer
    pub fn appended(&self) -> u64 {
        self.appended
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.file.write_all(frame)?;
        self.file.flush()?;
        match self.sync {
            SyncMode::Data => self.file.sync_data(),
            SyncMode::Full => self.file.sync_all(),
        }
    }

    /// Cut the file back to its last complete frame.
    fn discard_partial(&mut self) {
        match self.file.set_len(self.len).and_then(|_| self.file.sync_all()) {
            Ok(()) => warn!("WAL cut back to byte {} after failed append", self.len),
            Err(e) => {
                error!(
                    "cannot cut WAL '{}' back to byte {}: {}; refusing further appends",
                    self.path.display(),
                    self.len,
                    e
                );
                self.poisoned = true;
            }
        }
    }
}

/// Result of scanning a WAL file
#[derive(Debug, Default)]
pub struct WalScan {
    pub records: Vec<LogRecord>,
    /// Byte length of the complete frames
    pub valid_len: u64,
    /// Whether an incomplete final frame followed them
    pub torn: bool,
}

/// Sequential WAL reader
pub struct WalReader;

impl WalReader {
    /// Every complete record in file order. A missing file reads as empty.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<LogRecord>> {
        Ok(Self::scan(path)?.records)
    }

    pub fn scan(path: impl AsRef<Path>) -> Result<WalScan> {
        let path = path.as_ref();
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(WalScan::default()),
            Err(e) => return Err(e.into()),
        };
        let mut reader = BufReader::new(file);
        let mut scan = WalScan::default();

        loop {
            let mut len_buf = [0u8; LEN_PREFIX];
            match read_full(&mut reader, &mut len_buf)? {
                0 => break,
                n if n < LEN_PREFIX => {
                    scan.torn = true;
                    break;
                }
                _ => {}
            }

            let len = u32::from_le_bytes(len_buf) as usize;
            let mut body = vec![0u8; len];
            if read_full(&mut reader, &mut body)? < len {
                scan.torn = true;
                break;
            }

            let record: LogRecord = bincode::deserialize(&body).map_err(|e| {
                GraniteError::MalformedLog(format!(
                    "record {} at byte {}: {}",
                    scan.records.len(),
                    scan.valid_len,
                    e
                ))
            })?;
            scan.records.push(record);
            scan.valid_len += (LEN_PREFIX + len) as u64;
        }

        if scan.torn {
            warn!(
                "ignoring torn WAL tail in '{}' after {} records",
                path.display(),
                scan.records.len()
            );
        }
        Ok(scan)
    }
}

/// Read until `buf` is full or EOF; returns the bytes read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}
