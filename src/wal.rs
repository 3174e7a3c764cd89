use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Written once at the start of every log file. Bumped whenever `Event` changes shape.
const MAGIC: &[u8; 8] = b"SLOTWAL\x01";

/// Returns the number of bytes the record takes on disk.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<u64> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(payload.len() as u64 + 8)
}

/// `Ok(false)` on a clean or torn end of file.
fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Next intact record, or `None` at the end of the valid prefix.
fn read_entry(reader: &mut impl Read) -> io::Result<Option<Event>> {
    let mut len_buf = [0u8; 4];
    if !read_exact_or_eof(reader, &mut len_buf)? {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(len_buf) as usize];
    if !read_exact_or_eof(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_exact_or_eof(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize::<Event>(&payload).ok())
}

/// Append-only Write-Ahead Log.
///
/// Layout: an 8-byte magic header, then per entry `[u32: len][bincode: Event][u32: crc32]`.
/// A torn or corrupt tail (crash mid-write) ends replay at the last intact entry.
///
/// A batch is all-or-nothing: when writing or syncing it fails, the file is cut
/// back to `synced_len` and the writer's buffer is thrown away, so no byte of the
/// failed batch can reach disk with a later flush.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// File length covered by the last successful fsync.
    synced_len: u64,
    /// Set while a failed batch may still have bytes in the buffer or the file.
    dirty: bool,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the log at `path`, writing the header into a fresh file.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut synced_len = file.metadata()?.len();
        let mut writer = BufWriter::new(file);
        if synced_len == 0 {
            writer.write_all(MAGIC)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
            synced_len = MAGIC.len() as u64;
        }
        Ok(Self {
            writer,
            path: path.to_path_buf(),
            synced_len,
            dirty: false,
            appends_since_compact: 0,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_batch(std::iter::once(event))
    }

    /// Write every event and fsync once. On error nothing of the batch survives,
    /// in memory or on disk.
    pub fn append_batch<'a>(&mut self, events: impl IntoIterator<Item = &'a Event>) -> io::Result<()> {
        if self.dirty {
            self.discard_unsynced()?;
        }
        match self.write_synced(events) {
            Ok((bytes, count)) => {
                self.synced_len += bytes;
                self.appends_since_compact += count;
                Ok(())
            }
            Err(e) => {
                self.dirty = true;
                if let Err(rollback) = self.discard_unsynced() {
                    tracing::error!("WAL rollback failed, retrying before the next batch: {rollback}");
                }
                Err(e)
            }
        }
    }

    /// Bytes and records written, once they are on disk.
    fn write_synced<'a>(&mut self, events: impl IntoIterator<Item = &'a Event>) -> io::Result<(u64, u64)> {
        let (mut bytes, mut count) = (0, 0);
        for event in events {
            bytes += encode_event(&mut self.writer, event)?;
            count += 1;
        }
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok((bytes, count))
    }

    /// Drop whatever the writer still buffers and cut the file back to `synced_len`.
    fn discard_unsynced(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        file.set_len(self.synced_len)?;
        file.sync_all()?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // `into_parts` hands back the buffer instead of flushing it.
        let _ = stale.into_parts();
        self.dirty = false;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Phase one of compaction: write the snapshot to a sibling temp file and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let file = File::create(Self::tmp_path(path))?;
        let mut writer = BufWriter::new(file);
        writer.write_all(MAGIC)?;
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Phase two: rename the snapshot over the live log and reopen it for appends.
    /// Anything still buffered belongs to the replaced file and is dropped with it.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.synced_len = file.metadata()?.len();
        let _ = std::mem::replace(&mut self.writer, BufWriter::new(file)).into_parts();
        self.dirty = false;
        self.appends_since_compact = 0;
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

    /// Every intact event in the log, in append order. A missing file is an empty log;
    /// a file with a foreign header is refused rather than misread.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);

        let mut header = [0u8; 8];
        if !read_exact_or_eof(&mut reader, &mut header)? {
            return Ok(Vec::new());
        }
        if &header != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is not a slotline WAL", path.display()),
            ));
        }

        let mut events = Vec::new();
        while let Some(event) = read_entry(&mut reader)? {
            events.push(event);
        }
        Ok(events)
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        // BufWriter flushes on drop; a failed batch must not ride along.
        if self.dirty {
            let _ = self.discard_unsynced();
        }
    }
}
