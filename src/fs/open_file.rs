//! In-memory coordination of one open ciphertext file.
//!
//! An [`OpenCryptoFile`] is the single process-wide handle for one physical
//! ciphertext file. All cleartext channels targeting that file share it: the
//! chunk cache, the tracked cleartext length, and the pending last-modified
//! time live here. The registry (see [`crate::fs::registry`]) guarantees
//! at-most-one instance per physical path.
//!
//! Lifecycle: `Open` → (last channel closed) → `Closing` → (dirty chunks and
//! metadata flushed) → `Closed`. A file in `Closing` rejects new channels but
//! stays registered until its final flush completes.
//!
//! Concurrency is serialized per chunk, never per call: the chunk cache's
//! readers/writer lock and the backing cursor mutex (both inside
//! [`crate::fs::chunks`]) are only ever held for the single chunk read or
//! write they serialize, so a multi-chunk operation on one channel does not
//! stall other channels for its whole duration.

use std::fs::OpenOptions;
use std::io::{Read, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::crypto::keys::MasterKey;
use crate::fs::chunks::{ChunkCache, ChunkIo};
use crate::fs::content::{
    self, ContentError, FileContext, FileHeader, HEADER_SIZE, PAYLOAD_SIZE,
};
use crate::fs::registry::OpenFileRegistry;

/// Errors from channel and open-file operations.
#[derive(Error, Debug)]
pub enum FileError {
    /// The channel has already been closed.
    #[error("Channel is closed")]
    ChannelClosed,

    /// The file is closing or closed and accepts no new operations.
    #[error("File is not open")]
    NotOpen,

    /// The channel was not opened for reading.
    #[error("Channel not opened for reading")]
    NotReadable,

    /// The channel was not opened for writing.
    #[error("Channel not opened for writing")]
    NotWritable,

    /// Seek target is out of the representable range.
    #[error("Invalid seek offset")]
    InvalidSeek,

    /// Content-layer failure (crypto, framing, or I/O).
    #[error(transparent)]
    Content(#[from] ContentError),
}

/// Lifecycle states of an [`OpenCryptoFile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Open,
    Closing,
    Closed,
}

#[derive(Debug)]
struct Lifecycle {
    state: FileState,
    channels: usize,
    /// Pending last-modified time, persisted on the final close.
    modified: Option<SystemTime>,
}

/// One physical ciphertext file, currently open via one or more channels.
#[derive(Debug)]
pub struct OpenCryptoFile {
    path: PathBuf,
    io: ChunkIo,
    cache: ChunkCache,
    /// Tracked cleartext length: max of the value derived from the
    /// ciphertext size at open time and any in-memory dirty extension.
    length: AtomicU64,
    lifecycle: Mutex<Lifecycle>,
}

impl OpenCryptoFile {
    /// Open (or create) the ciphertext file at `path`.
    ///
    /// For an existing non-empty file the header is read and decrypted once;
    /// for a new or empty file a fresh header is generated and written out
    /// immediately.
    ///
    /// The backing file is opened read-write so later writers can share the
    /// handle a reader created first; on a write-protected host file it
    /// degrades to read-only, and writes fail at the channel level.
    ///
    /// The returned handle starts with a channel count of 1.
    pub fn open(
        path: PathBuf,
        create: bool,
        master_key: Arc<MasterKey>,
        cache_capacity: usize,
    ) -> Result<Self, FileError> {
        let context = FileContext::new().with_path(path.clone());

        let (mut file, writable) = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(&path)
        {
            Ok(file) => (file, true),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                let file = OpenOptions::new()
                    .read(true)
                    .open(&path)
                    .map_err(|e| ContentError::io_with_context(e, context.clone()))?;
                (file, false)
            }
            Err(e) => return Err(ContentError::io_with_context(e, context.clone()).into()),
        };

        let ciphertext_len = file
            .metadata()
            .map_err(|e| ContentError::io_with_context(e, context.clone()))?
            .len();

        let (header, needs_header_write) = if ciphertext_len == 0 {
            (FileHeader::create(), writable)
        } else {
            let mut encrypted_header = [0u8; HEADER_SIZE];
            file.read_exact(&mut encrypted_header)
                .map_err(|e| ContentError::io_with_context(e, context.clone()))?;
            let header = content::decrypt_header(&encrypted_header, &master_key, &context)?;
            (header, false)
        };

        let io = ChunkIo::new(file, header, master_key, context);
        if needs_header_write {
            io.write_header()?;
        }

        let length = content::cleartext_size_or_zero(ciphertext_len.max(HEADER_SIZE as u64));
        debug!(path = %path.display(), cleartext_len = length, "Opened ciphertext file");

        Ok(Self {
            path,
            io,
            cache: ChunkCache::new(cache_capacity),
            length: AtomicU64::new(length),
            lifecycle: Mutex::new(Lifecycle {
                state: FileState::Open,
                channels: 1,
                modified: None,
            }),
        })
    }

    /// The canonical ciphertext path this handle is registered under.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> FileState {
        self.lock_lifecycle().state
    }

    /// Register one more channel. Fails when the file is closing or closed,
    /// in which case the caller must treat this handle as absent.
    pub fn retain(&self) -> bool {
        let mut lifecycle = self.lock_lifecycle();
        if lifecycle.state != FileState::Open {
            return false;
        }
        lifecycle.channels += 1;
        true
    }

    /// Drop one channel. Returns `true` when this was the last one and the
    /// file has entered `Closing`; the caller must then run [`finalize`].
    ///
    /// [`finalize`]: OpenCryptoFile::finalize
    pub fn release(&self) -> bool {
        let mut lifecycle = self.lock_lifecycle();
        debug_assert!(lifecycle.channels > 0);
        lifecycle.channels = lifecycle.channels.saturating_sub(1);
        if lifecycle.channels == 0 {
            lifecycle.state = FileState::Closing;
            true
        } else {
            false
        }
    }

    /// Flush dirty chunks, persist the pending last-modified time, and
    /// transition to `Closed`.
    pub fn finalize(&self) -> Result<(), FileError> {
        let flush_result = self.cache.flush(&self.io).and_then(|()| self.io.sync());

        let modified = {
            let mut lifecycle = self.lock_lifecycle();
            lifecycle.state = FileState::Closed;
            lifecycle.modified.take()
        };
        if let Some(time) = modified {
            // Timestamp persistence is best-effort pass-through
            if let Err(e) = self.io.set_modified(time) {
                warn!(path = %self.path.display(), error = %e, "Failed to persist last-modified time");
            }
        }

        debug!(path = %self.path.display(), "Closed ciphertext file");
        flush_result.map_err(FileError::from)
    }

    /// Current cleartext length.
    pub fn size(&self) -> u64 {
        self.length.load(Ordering::Acquire)
    }

    /// Last write time observed in memory, if any write happened since open.
    pub fn modified(&self) -> Option<SystemTime> {
        self.lock_lifecycle().modified
    }

    fn ensure_open(&self) -> Result<(), FileError> {
        if self.lock_lifecycle().state == FileState::Open {
            Ok(())
        } else {
            Err(FileError::NotOpen)
        }
    }

    /// Read cleartext into `buf` starting at `offset`. Returns the number of
    /// bytes read; 0 at or past end-of-file.
    ///
    /// Each affected chunk is served under its own cache-lock acquisition; a
    /// read overlapping a concurrent multi-chunk write observes that write
    /// chunk by chunk.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, FileError> {
        self.ensure_open()?;

        let length = self.size();
        if offset >= length || buf.is_empty() {
            return Ok(0);
        }
        let end = (offset + buf.len() as u64).min(length);
        let total = (end - offset) as usize;

        let payload = PAYLOAD_SIZE as u64;
        let mut copied = 0usize;
        let mut pos = offset;
        while pos < end {
            let index = pos / payload;
            let start = (pos % payload) as usize;
            let n = (((index + 1) * payload).min(end) - pos) as usize;

            self.cache.with_chunk(&self.io, index, |data| {
                let available = data.len().saturating_sub(start).min(n);
                buf[copied..copied + available].copy_from_slice(&data[start..start + available]);
                // Holes (sparse or short chunks) read as zeros
                if available < n {
                    buf[copied + available..copied + n].fill(0);
                }
            })?;

            copied += n;
            pos += n as u64;
        }

        trace!(offset, read = total, "Read cleartext range");
        Ok(total)
    }

    /// Write cleartext at `offset`, extending the file as needed. A write
    /// past the current end zero-fills the gap first.
    ///
    /// Chunks are dirtied one cache-lock acquisition at a time; only the
    /// individual chunk update is atomic with respect to other channels.
    pub fn write_at(&self, data: &[u8], offset: u64) -> Result<usize, FileError> {
        self.ensure_open()?;
        self.write_range(data, offset)?;
        Ok(data.len())
    }

    /// Append at the current end of file; returns the offset written at.
    ///
    /// The range is reserved by advancing the tracked length up front, so
    /// concurrent appenders get disjoint offsets.
    pub fn append(&self, data: &[u8]) -> Result<u64, FileError> {
        self.ensure_open()?;

        let mut offset = self.length.load(Ordering::Acquire);
        loop {
            match self.length.compare_exchange_weak(
                offset,
                offset + data.len() as u64,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => offset = current,
            }
        }

        self.write_range(data, offset)?;
        Ok(offset)
    }

    fn write_range(&self, data: &[u8], offset: u64) -> Result<(), FileError> {
        let length = self.size();
        if offset > length {
            self.zero_fill(length, offset)?;
        }

        self.write_chunks(data, offset)?;

        let end = offset + data.len() as u64;
        self.length.fetch_max(end, Ordering::AcqRel);
        self.lock_lifecycle().modified = Some(SystemTime::now());
        trace!(offset, written = data.len(), "Wrote cleartext range");
        Ok(())
    }

    fn write_chunks(&self, data: &[u8], offset: u64) -> Result<(), FileError> {
        let payload = PAYLOAD_SIZE as u64;
        let length = self.size();
        let mut remaining = data;
        let mut pos = offset;
        while !remaining.is_empty() {
            let index = pos / payload;
            let start = (pos % payload) as usize;
            let n = remaining.len().min(PAYLOAD_SIZE - start);

            let chunk_extent = chunk_extent(length, index);
            self.cache
                .update_chunk(&self.io, index, start, &remaining[..n], chunk_extent)?;

            remaining = &remaining[n..];
            pos += n as u64;
        }
        Ok(())
    }

    fn zero_fill(&self, from: u64, to: u64) -> Result<(), FileError> {
        let zeroes = [0u8; 4096];
        let mut pos = from;
        while pos < to {
            let n = ((to - pos) as usize).min(zeroes.len());
            self.write_chunks(&zeroes[..n], pos)?;
            pos += n as u64;
        }
        Ok(())
    }

    /// Set the cleartext length to `len`, shrinking or zero-extending.
    pub fn truncate(&self, len: u64) -> Result<(), FileError> {
        self.ensure_open()?;

        let current = self.size();
        if len < current {
            self.cache.truncate(&self.io, len)?;
            self.length.store(len, Ordering::Release);
        } else if len > current {
            self.zero_fill(current, len)?;
            self.length.store(len, Ordering::Release);
        }
        self.lock_lifecycle().modified = Some(SystemTime::now());
        Ok(())
    }

    /// Write dirty chunks through without closing.
    pub fn flush(&self) -> Result<(), FileError> {
        self.ensure_open()?;
        self.cache.flush(&self.io)?;
        self.io.sync()?;
        Ok(())
    }
}

/// Cleartext extent of chunk `index` within a file of length `file_len`.
fn chunk_extent(file_len: u64, index: u64) -> usize {
    let payload = PAYLOAD_SIZE as u64;
    let chunk_start = index * payload;
    let chunk_end = chunk_start + payload;
    if chunk_end <= file_len {
        PAYLOAD_SIZE
    } else if chunk_start >= file_len {
        0
    } else {
        (file_len - chunk_start) as usize
    }
}

/// Flags controlling how a cleartext channel behaves.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptionsCleartext {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub create_new: bool,
    pub truncate: bool,
    pub append: bool,
}

impl OpenOptionsCleartext {
    pub fn read() -> Self {
        Self {
            read: true,
            ..Default::default()
        }
    }

    pub fn write() -> Self {
        Self {
            read: true,
            write: true,
            create: true,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_truncate(mut self) -> Self {
        self.truncate = true;
        self
    }

    #[must_use]
    pub fn with_create_new(mut self) -> Self {
        self.create = true;
        self.create_new = true;
        self
    }

    #[must_use]
    pub fn with_append(mut self) -> Self {
        self.append = true;
        self
    }
}

/// A cleartext channel over one [`OpenCryptoFile`].
///
/// Each channel carries its own position cursor; all channels on one file
/// share the chunk cache and observe each other's writes. Dropping a channel
/// closes it best-effort; call [`close`](CleartextFileChannel::close) to
/// observe flush errors.
#[derive(Debug)]
pub struct CleartextFileChannel {
    file: Arc<OpenCryptoFile>,
    registry: Arc<OpenFileRegistry>,
    position: Mutex<u64>,
    readable: bool,
    writable: bool,
    append: bool,
    closed: AtomicBool,
}

impl CleartextFileChannel {
    pub(crate) fn new(
        file: Arc<OpenCryptoFile>,
        registry: Arc<OpenFileRegistry>,
        options: &OpenOptionsCleartext,
    ) -> Self {
        Self {
            file,
            registry,
            position: Mutex::new(0),
            readable: options.read || !options.write,
            writable: options.write,
            append: options.append,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_not_closed(&self) -> Result<(), FileError> {
        if self.closed.load(Ordering::Acquire) {
            Err(FileError::ChannelClosed)
        } else {
            Ok(())
        }
    }

    fn lock_position(&self) -> std::sync::MutexGuard<'_, u64> {
        self.position.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current cleartext size of the underlying file.
    pub fn size(&self) -> Result<u64, FileError> {
        self.ensure_not_closed()?;
        Ok(self.file.size())
    }

    /// Read at the channel position, advancing it.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, FileError> {
        self.ensure_not_closed()?;
        if !self.readable {
            return Err(FileError::NotReadable);
        }
        let mut position = self.lock_position();
        let n = self.file.read_at(buf, *position)?;
        *position += n as u64;
        Ok(n)
    }

    /// Read at an explicit offset without touching the channel position.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, FileError> {
        self.ensure_not_closed()?;
        if !self.readable {
            return Err(FileError::NotReadable);
        }
        self.file.read_at(buf, offset)
    }

    /// Write at the channel position (or at end-of-file in append mode),
    /// advancing the position.
    pub fn write(&self, data: &[u8]) -> Result<usize, FileError> {
        self.ensure_not_closed()?;
        if !self.writable {
            return Err(FileError::NotWritable);
        }
        let mut position = self.lock_position();
        if self.append {
            let offset = self.file.append(data)?;
            *position = offset + data.len() as u64;
        } else {
            self.file.write_at(data, *position)?;
            *position += data.len() as u64;
        }
        Ok(data.len())
    }

    /// Write at an explicit offset without touching the channel position.
    pub fn write_at(&self, data: &[u8], offset: u64) -> Result<usize, FileError> {
        self.ensure_not_closed()?;
        if !self.writable {
            return Err(FileError::NotWritable);
        }
        self.file.write_at(data, offset)
    }

    /// Move the channel position.
    pub fn seek(&self, pos: SeekFrom) -> Result<u64, FileError> {
        self.ensure_not_closed()?;
        let mut position = self.lock_position();
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset,
            SeekFrom::End(delta) => add_signed(self.file.size(), delta)?,
            SeekFrom::Current(delta) => add_signed(*position, delta)?,
        };
        *position = new_pos;
        Ok(new_pos)
    }

    /// Cut or zero-extend the file to `len` cleartext bytes.
    pub fn truncate(&self, len: u64) -> Result<(), FileError> {
        self.ensure_not_closed()?;
        if !self.writable {
            return Err(FileError::NotWritable);
        }
        self.file.truncate(len)
    }

    /// Force dirty chunks to the backing file.
    pub fn flush(&self) -> Result<(), FileError> {
        self.ensure_not_closed()?;
        self.file.flush()
    }

    /// Close the channel, releasing its reference on the open file. The last
    /// channel triggers the final flush and metadata persistence.
    pub fn close(&self) -> Result<(), FileError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.registry.release(&self.file)
    }
}

impl Drop for CleartextFileChannel {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(path = %self.file.path().display(), error = %e, "Error closing channel on drop");
        }
    }
}

fn add_signed(base: u64, delta: i64) -> Result<u64, FileError> {
    base.checked_add_signed(delta).ok_or(FileError::InvalidSeek)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_extent() {
        let c = PAYLOAD_SIZE as u64;
        assert_eq!(chunk_extent(0, 0), 0);
        assert_eq!(chunk_extent(10, 0), 10);
        assert_eq!(chunk_extent(c, 0), PAYLOAD_SIZE);
        assert_eq!(chunk_extent(c + 5, 0), PAYLOAD_SIZE);
        assert_eq!(chunk_extent(c + 5, 1), 5);
        assert_eq!(chunk_extent(c, 1), 0);
        assert_eq!(chunk_extent(3 * c, 5), 0);
    }

    #[test]
    fn test_open_options_presets() {
        let r = OpenOptionsCleartext::read();
        assert!(r.read && !r.write && !r.create);

        let w = OpenOptionsCleartext::write();
        assert!(w.read && w.write && w.create && !w.truncate);

        let t = OpenOptionsCleartext::write().with_truncate();
        assert!(t.truncate);

        let n = OpenOptionsCleartext::write().with_create_new();
        assert!(n.create && n.create_new);
    }
}
