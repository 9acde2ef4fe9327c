use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use crate::fetcher::ProgressSnapshot;

enum Frontier {
    Fixed(u64),
    Live(ProgressSnapshot),
}

impl Frontier {
    fn offset(&self) -> u64 {
        match self {
            Frontier::Fixed(len) => *len,
            Frontier::Live(snapshot) => snapshot.downloaded_size(),
        }
    }
}

/// Reads a cache file that may still be growing.
///
/// The file is pre-allocated to its full length, so bytes past the
/// downloaded offset exist but are not valid yet. Reads stop at that offset
/// and return `Ok(0)` there until more data lands.
pub struct CacheReader {
    file: File,
    position: u64,
    len: u64,
    frontier: Frontier,
}

impl CacheReader {
    /// For a file that is already fully downloaded.
    pub fn complete(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            position: 0,
            len,
            frontier: Frontier::Fixed(len),
        })
    }

    /// For a file whose first `valid_len` bytes are known to be written.
    pub fn upto(path: impl AsRef<Path>, valid_len: u64) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            position: 0,
            len,
            frontier: Frontier::Fixed(valid_len),
        })
    }

    /// For a file an active fetch is writing; `snapshot` comes from that fetch.
    pub fn growing(path: impl AsRef<Path>, snapshot: ProgressSnapshot) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            position: 0,
            len,
            frontier: Frontier::Live(snapshot),
        })
    }

    pub fn available(&self) -> u64 {
        self.frontier.offset().min(self.len)
    }

    pub fn position(&self) -> u64 {
        self.position
    }
}

impl Read for CacheReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let limit = self.available().saturating_sub(self.position);
        if limit == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(limit) as usize;
        self.file.seek(SeekFrom::Start(self.position))?;
        let read = self.file.read(&mut buf[..want])?;
        self.position += read as u64;
        Ok(read)
    }
}

impl Seek for CacheReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.len.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        match target {
            Some(target) => {
                self.position = target;
                Ok(target)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of cache file",
            )),
        }
    }
}
