use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{error, warn};

use crate::model::Event;

const FRAME_OVERHEAD: u64 = 8;

/// Encode a single event to [len][bincode][crc32] format. Returns the frame size.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<u64> {
    let payload = bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(payload.len() as u64 + FRAME_OVERHEAD)
}

/// Read `buf.len()` bytes, or `Ok(false)` on a clean or torn end of file.
fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Next intact event, or `None` at end of log, a torn frame, a CRC mismatch
/// or an undecodable payload.
fn read_event(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_or_eof(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
    if !read_or_eof(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_or_eof(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Some((event, len as u64 + FRAME_OVERHEAD))),
        Err(_) => Ok(None),
    }
}

/// Events recovered from disk and the byte length of the intact prefix.
#[derive(Debug)]
pub struct Replay {
    pub events: Vec<Event>,
    pub valid_len: u64,
    pub file_len: u64,
}

impl Replay {
    pub fn has_torn_tail(&self) -> bool {
        self.valid_len < self.file_len
    }
}

/// Append-only write-ahead log holding every unit, occupancy and hold change.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A truncated or corrupt tail (crash mid-write) is discarded on recovery.
/// - A batch that fails to write is cut back off the file before anything
///   else is appended, so one failed batch never hides later records.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// File length covered by acknowledged, fsynced batches.
    committed_len: u64,
    /// Set when a failed batch could not be cut back off the file.
    poisoned: bool,
    #[cfg(test)]
    faults: Faults,
}

/// Injected failures for exercising the rollback path.
#[cfg(test)]
#[derive(Default)]
struct Faults {
    /// Frames to write before the next one fails partway through.
    fail_after: Option<usize>,
    fail_rollback: bool,
}

impl Wal {
    /// Open (or create) the WAL file at `path` for appending.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let committed_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            committed_len,
            poisoned: false,
            #[cfg(test)]
            faults: Faults::default(),
        })
    }

    /// Replay the log, cut off any torn tail so later appends are not hidden
    /// behind it, then open for appending.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let replay = Self::replay(path)?;
        if replay.has_torn_tail() {
            warn!(
                "WAL {}: discarding {} trailing bytes after {} intact records",
                path.display(),
                replay.file_len - replay.valid_len,
                replay.events.len()
            );
            OpenOptions::new().write(true).open(path)?.set_len(replay.valid_len)?;
        }
        Ok((Self::open(path)?, replay.events))
    }

    /// Append a single event and fsync.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_batch(std::iter::once(event))
    }

    /// Write and fsync a group of events as one unit. On any failure the
    /// file is truncated back to its last committed length; if even that
    /// fails the log refuses further appends.
    pub fn append_batch<'a>(&mut self, events: impl IntoIterator<Item = &'a Event>) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other(
                "WAL poisoned: a failed batch could not be rolled back",
            ));
        }
        match self.write_batch(events) {
            Ok((bytes, frames)) => {
                self.committed_len += bytes;
                self.appends_since_compact += frames;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = self.rollback() {
                    error!(
                        "WAL {}: cannot truncate failed batch ({rollback}); refusing further appends",
                        self.path.display()
                    );
                    self.poisoned = true;
                }
                Err(e)
            }
        }
    }

    /// Encode every event, then flush and fsync. Returns bytes and frames written.
    fn write_batch<'a>(&mut self, events: impl IntoIterator<Item = &'a Event>) -> io::Result<(u64, u64)> {
        let mut bytes = 0;
        let mut frames = 0;
        for event in events {
            #[cfg(test)]
            self.inject_write_fault()?;
            bytes += encode_event(&mut self.writer, event)?;
            frames += 1;
        }
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok((bytes, frames))
    }

    /// Discard buffered bytes and cut the file back to `committed_len`.
    fn rollback(&mut self) -> io::Result<()> {
        #[cfg(test)]
        if self.faults.fail_rollback {
            return Err(io::Error::other("injected truncate failure"));
        }
        // Swap in a writer over a second handle first: dropping a BufWriter
        // flushes it, and the buffered frames must never reach the file.
        let fresh = BufWriter::new(self.writer.get_ref().try_clone()?);
        let (_, _discarded) = std::mem::replace(&mut self.writer, fresh).into_parts();
        let file = self.writer.get_ref();
        file.set_len(self.committed_len)?;
        file.sync_all()?;
        warn!(
            "WAL {}: failed batch truncated back to {} bytes",
            self.path.display(),
            self.committed_len
        );
        Ok(())
    }

    #[cfg(test)]
    fn inject_write_fault(&mut self) -> io::Result<()> {
        match self.faults.fail_after {
            Some(0) => {
                self.faults.fail_after = None;
                // Half a length prefix reaches the disk, as a short write would.
                self.writer.write_all(&[0xAB, 0xCD])?;
                self.writer.flush()?;
                Err(io::Error::other("injected write failure"))
            }
            Some(n) => {
                self.faults.fail_after = Some(n - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write compacted events to a temp file and fsync.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Atomic swap: rename the temp file over the WAL and reopen.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.committed_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        self.poisoned = false;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Read every intact event from disk. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Replay {
                    events: Vec::new(),
                    valid_len: 0,
                    file_len: 0,
                });
            }
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut valid_len = 0u64;

        while let Some((event, frame_len)) = read_event(&mut reader)? {
            events.push(event);
            valid_len += frame_len;
        }

        Ok(Replay {
            events,
            valid_len,
            file_len,
        })
    }
}
