//! Lobby files: named blobs a member advertises, filled chunk by chunk on the receiving side.

use crate::integrity::FileHash;
use crate::protocol::FileRecord;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FileError {
    #[error("chunk of {chunk} bytes overflows {filename} ({have}/{size})")]
    Overflow {
        filename: String,
        have: u64,
        chunk: usize,
        size: u64,
    },
}

/// A named binary blob of known size and digest.
///
/// Files we own are created complete with [`LobbyFile::from_bytes`]. Files advertised by
/// others start empty ([`LobbyFile::advertised`]) and fill up via [`LobbyFile::append`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LobbyFile {
    pub filename: String,
    pub hash: FileHash,
    pub size: u64,
    buffer: Vec<u8>,
}

impl LobbyFile {
    pub fn from_bytes(filename: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            hash: FileHash::of(&content),
            size: content.len() as u64,
            buffer: content,
        }
    }

    pub fn advertised(filename: impl Into<String>, size: u64, hash: FileHash) -> Self {
        Self {
            filename: filename.into(),
            hash,
            size,
            buffer: Vec::new(),
        }
    }

    pub fn from_record(record: &FileRecord) -> Self {
        Self::advertised(record.filename.clone(), record.size, record.hash)
    }

    pub fn to_record(&self) -> FileRecord {
        FileRecord {
            filename: self.filename.clone(),
            size: self.size,
            hash: self.hash,
        }
    }

    /// Append a received chunk. Never grows past the advertised size.
    pub fn append(&mut self, chunk: &[u8]) -> Result<(), FileError> {
        let have = self.buffer.len() as u64;
        if have + chunk.len() as u64 > self.size {
            return Err(FileError::Overflow {
                filename: self.filename.clone(),
                have,
                chunk: chunk.len(),
                size: self.size,
            });
        }
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    /// Drop any received content, e.g. before re-requesting.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn available(&self) -> u64 {
        self.buffer.len() as u64
    }

    pub fn is_complete(&self) -> bool {
        self.available() == self.size
    }

    /// Complete and matching the advertised digest.
    pub fn is_valid(&self) -> bool {
        self.is_complete() && self.hash.matches(&self.buffer)
    }

    /// Received fraction in `0.0..=1.0`. An empty file counts as done.
    pub fn progress(&self) -> f64 {
        if self.size == 0 {
            return 1.0;
        }
        self.available() as f64 / self.size as f64
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer
    }
}

/// An in-progress upload of one of our files to one member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingFileTransfer {
    pub receiver: u8,
    pub filename: String,
    pub sent: u64,
    pub size: u64,
}

impl OutgoingFileTransfer {
    pub fn new(receiver: u8, filename: impl Into<String>, size: u64) -> Self {
        Self {
            receiver,
            filename: filename.into(),
            sent: 0,
            size,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.sent >= self.size
    }

    pub fn progress(&self) -> f64 {
        if self.size == 0 {
            return 1.0;
        }
        self.sent as f64 / self.size as f64
    }
}
