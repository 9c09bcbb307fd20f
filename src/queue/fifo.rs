//! Byte FIFOs backing persistable queues.

use std::collections::VecDeque;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

/// Ordered store of encoded items that outlives a queue's workers.
pub trait ByteFifo: Send + Sync {
    fn push_back(&self, data: &[u8]) -> io::Result<()>;

    /// Remove and return the oldest record.
    fn pop_front(&self) -> io::Result<Option<Vec<u8>>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release the store. Records already written are kept.
    fn close(&self) -> io::Result<()>;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process FIFO. Survives queue restarts within the process only.
#[derive(Default)]
pub struct MemoryByteFifo {
    records: Mutex<VecDeque<Vec<u8>>>,
}

impl MemoryByteFifo {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ByteFifo for MemoryByteFifo {
    fn push_back(&self, data: &[u8]) -> io::Result<()> {
        lock(&self.records).push_back(data.to_vec());
        Ok(())
    }

    fn pop_front(&self) -> io::Result<Option<Vec<u8>>> {
        Ok(lock(&self.records).pop_front())
    }

    fn len(&self) -> usize {
        lock(&self.records).len()
    }

    fn close(&self) -> io::Result<()> {
        Ok(())
    }
}

/// File-backed FIFO of length-prefixed records.
///
/// Each record is a little-endian `u32` length followed by the bytes. The
/// whole file is rewritten through a temporary file and a rename on every
/// change, so a crash leaves either the old or the new contents.
pub struct FileByteFifo {
    path: PathBuf,
    state: Mutex<FileState>,
}

struct FileState {
    records: VecDeque<Vec<u8>>,
    closed: bool,
}

impl FileByteFifo {
    /// Open `path`, loading existing records. Missing files start empty.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let records = match fs::read(&path) {
            Ok(bytes) => decode(&bytes)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => VecDeque::new(),
            Err(e) => return Err(e),
        };
        debug!(path = %path.display(), records = records.len(), "opened fifo");

        Ok(Self {
            path,
            state: Mutex::new(FileState {
                records,
                closed: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, records: &VecDeque<Vec<u8>>) -> io::Result<()> {
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            for record in records {
                let len = u32::try_from(record.len())
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "record too large"))?;
                file.write_all(&len.to_le_bytes())?;
                file.write_all(record)?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "fifo is closed")
}

fn decode(mut bytes: &[u8]) -> io::Result<VecDeque<Vec<u8>>> {
    let mut records = VecDeque::new();
    while !bytes.is_empty() {
        if bytes.len() < 4 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "truncated record header"));
        }
        let (header, rest) = bytes.split_at(4);
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if rest.len() < len {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "truncated record"));
        }
        let (record, rest) = rest.split_at(len);
        records.push_back(record.to_vec());
        bytes = rest;
    }
    Ok(records)
}

impl ByteFifo for FileByteFifo {
    fn push_back(&self, data: &[u8]) -> io::Result<()> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(closed_error());
        }
        state.records.push_back(data.to_vec());
        if let Err(e) = self.persist(&state.records) {
            state.records.pop_back();
            return Err(e);
        }
        Ok(())
    }

    fn pop_front(&self) -> io::Result<Option<Vec<u8>>> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(closed_error());
        }
        let Some(record) = state.records.pop_front() else {
            return Ok(None);
        };
        if let Err(e) = self.persist(&state.records) {
            state.records.push_front(record);
            return Err(e);
        }
        Ok(Some(record))
    }

    fn len(&self) -> usize {
        lock(&self.state).records.len()
    }

    fn close(&self) -> io::Result<()> {
        lock(&self.state).closed = true;
        Ok(())
    }
}
