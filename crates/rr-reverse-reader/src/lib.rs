//! Read a file back to front, one byte at a time.
//!
//! Intended to feed a line scanner over the tail of a (possibly huge) log file without
//! loading the whole thing: callers read fixed-size chunks from the end of the file and
//! reverse each chunk's lines themselves. Throughput is intentionally sacrificed for
//! simplicity, since this only ever services bounded tails.

use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use fs_err::File;

/// Steps a file's read position backward one byte per call to [`Read::read`].
///
/// Not [`Sync`]; a single `ReverseReader` is meant to be driven by one caller at a time.
pub struct ReverseReader {
    file: File,
    offset: u64,
}

impl ReverseReader {
    /// Open `path` and seek to its end, ready to read backward.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let offset = file.seek(SeekFrom::End(0))?;
        Ok(Self { file, offset })
    }

    /// Wrap an already-open file, reading backward from its current position.
    pub fn from_file(mut file: File) -> io::Result<Self> {
        let offset = file.stream_position()?;
        Ok(Self { file, offset })
    }

    /// How many unread bytes remain before the start of the file.
    pub fn remaining(&self) -> u64 {
        self.offset
    }
}

impl Read for ReverseReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut written = 0;
        let mut one = [0u8; 1];

        while written < buf.len() && self.offset > 0 {
            self.offset -= 1;
            self.file.seek(SeekFrom::Start(self.offset))?;
            self.file.read_exact(&mut one)?;
            buf[written] = one[0];
            written += 1;
        }

        Ok(written)
    }
}
