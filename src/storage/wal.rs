//! Durable log of storage mutations.
//!
//! Each frame is `[u32 len][bincode WalRecord][u32 crc32]`, little endian.
//! A crash can leave a torn frame at the tail; replay stops at the first
//! frame that is short or fails its checksum and keeps everything before it.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::Revision;

/// One committed mutation of the storage tree. Values are kept as JSON text:
/// bincode cannot round-trip a self-describing `serde_json::Value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalRecord {
    Put {
        revision: Revision,
        path: String,
        json: String,
    },
    Removed {
        revision: Revision,
        path: String,
    },
}

impl WalRecord {
    pub fn revision(&self) -> Revision {
        match self {
            WalRecord::Put { revision, .. } | WalRecord::Removed { revision, .. } => *revision,
        }
    }
}

fn write_frame(out: &mut impl Write, record: &WalRecord) -> io::Result<()> {
    let body = bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(body.len()).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "record too large"))?;
    out.write_all(&len.to_le_bytes())?;
    out.write_all(&body)?;
    out.write_all(&crc32fast::hash(&body).to_le_bytes())
}

/// Fill `buf` completely. `Ok(false)` on end of file, including a partial read.
fn read_full(input: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match input.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

enum Frame {
    Record(WalRecord),
    End,
    Torn,
}

fn read_frame(input: &mut impl Read) -> io::Result<Frame> {
    let mut word = [0u8; 4];
    if !read_full(input, &mut word)? {
        return Ok(Frame::End);
    }
    let mut body = vec![0u8; u32::from_le_bytes(word) as usize];
    if !read_full(input, &mut body)? || !read_full(input, &mut word)? {
        return Ok(Frame::Torn);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&body) {
        return Ok(Frame::Torn);
    }
    Ok(bincode::deserialize(&body).map_or(Frame::Torn, Frame::Record))
}

/// Append handle on the log file. Owned by the backend's writer task.
pub struct Wal {
    out: BufWriter<File>,
    path: PathBuf,
    staging: PathBuf,
    since_compaction: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            out: BufWriter::new(open_append(path)?),
            path: path.to_path_buf(),
            staging: path.with_extension("wal.tmp"),
            since_compaction: 0,
        })
    }

    /// Buffer one record. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, record: &WalRecord) -> io::Result<()> {
        write_frame(&mut self.out, record)?;
        self.since_compaction += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.out.flush()?;
        self.out.get_ref().sync_all()
    }

    /// Records appended since the log was opened or last compacted.
    pub fn appends_since_compact(&self) -> u64 {
        self.since_compaction
    }

    /// Replace the whole log with `records`: write them to a staging file,
    /// fsync, then rename over the live log.
    pub fn rewrite(&mut self, records: &[WalRecord]) -> io::Result<()> {
        self.flush_sync()?;
        {
            let mut staged = BufWriter::new(File::create(&self.staging)?);
            for record in records {
                write_frame(&mut staged, record)?;
            }
            staged.flush()?;
            staged.get_ref().sync_all()?;
        }
        fs::rename(&self.staging, &self.path)?;
        self.out = BufWriter::new(open_append(&self.path)?);
        self.since_compaction = 0;
        Ok(())
    }

    /// Every intact record in the log at `path`, in append order. A missing
    /// file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<WalRecord>> {
        let mut input = match File::open(path) {
            Ok(f) => BufReader::new(f),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut records = Vec::new();
        loop {
            match read_frame(&mut input)? {
                Frame::Record(record) => records.push(record),
                Frame::End => break,
                Frame::Torn => {
                    warn!(
                        "{}: discarding torn tail after {} records",
                        path.display(),
                        records.len()
                    );
                    break;
                }
            }
        }
        Ok(records)
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}
