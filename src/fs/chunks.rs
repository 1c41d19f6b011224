//! Random-access chunk I/O and the per-file chunk cache.
//!
//! [`ChunkIo`] maps chunk ordinals onto ciphertext offsets and performs the
//! actual encrypt/decrypt per chunk. [`ChunkCache`] sits on top of it with a
//! small bounded LRU of decrypted chunk buffers carrying dirty flags, so that
//! cleartext writes smaller than a chunk do not pay a full
//! read-decrypt-encrypt-write cycle each time.
//!
//! Locking: the backing file cursor is guarded by a `Mutex`; the cache is
//! guarded by a `RwLock` so cached reads can proceed concurrently. LRU
//! ordering is kept in a per-entry atomic clock, which cached reads can bump
//! under the read lock.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::trace;

use crate::crypto::keys::MasterKey;
use crate::fs::content::{
    self, chunk_offset, ContentError, FileContext, FileHeader, CHUNK_SIZE, PAYLOAD_SIZE,
};

/// Default number of decrypted chunks kept per open file.
pub const DEFAULT_CACHE_CAPACITY: usize = 5;

/// Encrypting random-access view of one ciphertext file.
///
/// Chunk `n` occupies ciphertext bytes `88 + n·32816 .. 88 + (n+1)·32816`.
#[derive(Debug)]
pub struct ChunkIo {
    file: Mutex<File>,
    header: FileHeader,
    master_key: Arc<MasterKey>,
    context: FileContext,
}

impl ChunkIo {
    pub fn new(
        file: File,
        header: FileHeader,
        master_key: Arc<MasterKey>,
        context: FileContext,
    ) -> Self {
        Self {
            file: Mutex::new(file),
            header,
            master_key,
            context,
        }
    }

    /// The file header used for chunk MAC computation.
    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    fn lock_file(&self) -> std::sync::MutexGuard<'_, File> {
        // A poisoned cursor lock still guards a structurally valid File.
        self.file.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Read and decrypt chunk `index`.
    ///
    /// A read past the ciphertext end yields an empty buffer; a partial
    /// trailing chunk yields its decrypted partial bytes.
    pub fn read_chunk(&self, index: u64) -> Result<Vec<u8>, ContentError> {
        let mut encrypted = vec![0u8; CHUNK_SIZE];
        let read = {
            let mut file = self.lock_file();
            file.seek(SeekFrom::Start(chunk_offset(index)))
                .map_err(|e| ContentError::io_with_context(e, self.context.clone()))?;
            read_up_to(&mut *file, &mut encrypted)
                .map_err(|e| ContentError::io_with_context(e, self.context.clone()))?
        };

        if read == 0 {
            trace!(chunk = index, "Read past ciphertext end, empty chunk");
            return Ok(Vec::new());
        }

        content::decrypt_chunk(
            &encrypted[..read],
            index,
            &self.header,
            &self.master_key,
            &self.context,
        )
    }

    /// Encrypt and write `cleartext` as chunk `index`.
    pub fn write_chunk(&self, index: u64, cleartext: &[u8]) -> Result<(), ContentError> {
        debug_assert!(cleartext.len() <= PAYLOAD_SIZE);
        let encrypted =
            content::encrypt_chunk(cleartext, index, &self.header, &self.master_key)?;

        let mut file = self.lock_file();
        file.seek(SeekFrom::Start(chunk_offset(index)))
            .map_err(|e| ContentError::io_with_context(e, self.context.clone()))?;
        file.write_all(&encrypted)
            .map_err(|e| ContentError::io_with_context(e, self.context.clone()))?;
        Ok(())
    }

    /// Write the encrypted header at offset 0.
    pub fn write_header(&self) -> Result<(), ContentError> {
        let encrypted = content::encrypt_header(&self.header, &self.master_key)?;
        let mut file = self.lock_file();
        file.seek(SeekFrom::Start(0))
            .map_err(|e| ContentError::io_with_context(e, self.context.clone()))?;
        file.write_all(&encrypted)
            .map_err(|e| ContentError::io_with_context(e, self.context.clone()))?;
        Ok(())
    }

    /// Current ciphertext file length in bytes.
    pub fn ciphertext_len(&self) -> Result<u64, ContentError> {
        let file = self.lock_file();
        let meta = file
            .metadata()
            .map_err(|e| ContentError::io_with_context(e, self.context.clone()))?;
        Ok(meta.len())
    }

    /// Cut the ciphertext file to exactly `len` bytes.
    pub fn set_ciphertext_len(&self, len: u64) -> Result<(), ContentError> {
        let file = self.lock_file();
        file.set_len(len)
            .map_err(|e| ContentError::io_with_context(e, self.context.clone()))?;
        Ok(())
    }

    /// Flush the backing file to the OS.
    pub fn sync(&self) -> Result<(), ContentError> {
        let mut file = self.lock_file();
        file.flush()
            .map_err(|e| ContentError::io_with_context(e, self.context.clone()))?;
        Ok(())
    }

    /// Persist the last-modified timestamp on the backing file.
    pub fn set_modified(&self, time: std::time::SystemTime) -> Result<(), ContentError> {
        let file = self.lock_file();
        let times = std::fs::FileTimes::new().set_modified(time);
        file.set_times(times)
            .map_err(|e| ContentError::io_with_context(e, self.context.clone()))?;
        Ok(())
    }
}

/// Read until `buf` is full or EOF; returns the number of bytes read.
fn read_up_to(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match file.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

#[derive(Debug)]
struct CachedChunk {
    data: Vec<u8>,
    dirty: bool,
    last_used: AtomicU64,
}

/// Bounded LRU of decrypted chunk buffers for one open file.
///
/// Eviction of a dirty entry writes it through to the [`ChunkIo`]; flushing
/// writes all dirty entries in ascending chunk order.
#[derive(Debug)]
pub struct ChunkCache {
    capacity: usize,
    clock: AtomicU64,
    chunks: RwLock<HashMap<u64, CachedChunk>>,
}

impl ChunkCache {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "chunk cache capacity must be at least 1");
        Self {
            capacity,
            clock: AtomicU64::new(0),
            chunks: RwLock::new(HashMap::new()),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Run `f` over the decrypted contents of chunk `index`, loading it into
    /// the cache on a miss.
    pub fn with_chunk<R>(
        &self,
        io: &ChunkIo,
        index: u64,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R, ContentError> {
        {
            let chunks = self.chunks.read().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = chunks.get(&index) {
                entry.last_used.store(self.tick(), Ordering::Relaxed);
                return Ok(f(&entry.data));
            }
        }

        let mut chunks = self.chunks.write().unwrap_or_else(|e| e.into_inner());
        // Another thread may have loaded it while we waited for the lock
        if let Some(entry) = chunks.get(&index) {
            entry.last_used.store(self.tick(), Ordering::Relaxed);
            return Ok(f(&entry.data));
        }

        let data = io.read_chunk(index)?;
        self.evict_if_full(io, &mut chunks)?;
        let entry = chunks.entry(index).or_insert(CachedChunk {
            data,
            dirty: false,
            last_used: AtomicU64::new(self.tick()),
        });
        Ok(f(&entry.data))
    }

    /// Overwrite `data` into chunk `index` starting at `start` bytes into the
    /// chunk, marking it dirty.
    ///
    /// `current_chunk_len` is the chunk's cleartext extent as implied by the
    /// file's current length; it decides whether a cache miss needs to load
    /// the old chunk (partial overlap) or can start from scratch (full
    /// overwrite).
    pub fn update_chunk(
        &self,
        io: &ChunkIo,
        index: u64,
        start: usize,
        data: &[u8],
        current_chunk_len: usize,
    ) -> Result<(), ContentError> {
        debug_assert!(start + data.len() <= PAYLOAD_SIZE);

        let mut chunks = self.chunks.write().unwrap_or_else(|e| e.into_inner());

        if !chunks.contains_key(&index) {
            let full_overwrite = start == 0 && data.len() >= current_chunk_len;
            let buffer = if full_overwrite {
                Vec::with_capacity(data.len())
            } else {
                io.read_chunk(index)?
            };
            self.evict_if_full(io, &mut chunks)?;
            chunks.insert(
                index,
                CachedChunk {
                    data: buffer,
                    dirty: false,
                    last_used: AtomicU64::new(0),
                },
            );
        }

        let entry = chunks.get_mut(&index).expect("entry just ensured");
        if entry.data.len() < start {
            entry.data.resize(start, 0);
        }
        let end = start + data.len();
        if entry.data.len() < end {
            entry.data.resize(end, 0);
        }
        entry.data[start..end].copy_from_slice(data);
        entry.dirty = true;
        entry.last_used.store(self.tick(), Ordering::Relaxed);
        Ok(())
    }

    /// Write all dirty chunks through in ascending index order.
    ///
    /// The cache lock is re-acquired per chunk, so a flush never blocks
    /// other channels longer than one chunk write.
    pub fn flush(&self, io: &ChunkIo) -> Result<(), ContentError> {
        let mut cursor = 0u64;
        loop {
            let mut chunks = self.chunks.write().unwrap_or_else(|e| e.into_inner());
            let next = chunks
                .iter_mut()
                .filter(|(&index, chunk)| index >= cursor && chunk.dirty)
                .min_by_key(|(&index, _)| index);
            match next {
                None => return Ok(()),
                Some((&index, entry)) => {
                    io.write_chunk(index, &entry.data)?;
                    entry.dirty = false;
                    cursor = index + 1;
                }
            }
        }
    }

    /// Shrink the cached view to a new cleartext length.
    ///
    /// Trims the final partial chunk (writing it through immediately so the
    /// ciphertext stays well formed), discards cached chunks beyond it, and
    /// cuts the ciphertext file to the corresponding size.
    pub fn truncate(&self, io: &ChunkIo, new_cleartext_len: u64) -> Result<(), ContentError> {
        let payload = PAYLOAD_SIZE as u64;
        let last_index = new_cleartext_len / payload;
        let remainder = (new_cleartext_len % payload) as usize;

        let mut chunks = self.chunks.write().unwrap_or_else(|e| e.into_inner());

        // Drop cached chunks past the new end without writing them back
        chunks.retain(|&i, _| {
            if remainder > 0 {
                i <= last_index
            } else {
                i < last_index
            }
        });

        if remainder > 0 {
            // The new final chunk becomes partial: rewrite it at its new size
            let mut data = match chunks.remove(&last_index) {
                Some(entry) => entry.data,
                None => io.read_chunk(last_index)?,
            };
            data.truncate(remainder);
            io.write_chunk(last_index, &data)?;
            chunks.insert(
                last_index,
                CachedChunk {
                    data,
                    dirty: false,
                    last_used: AtomicU64::new(self.tick()),
                },
            );
        }

        io.set_ciphertext_len(content::ciphertext_size(new_cleartext_len))?;
        Ok(())
    }

    /// Drop every cached chunk without writing anything back.
    pub fn clear(&self) {
        self.chunks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn evict_if_full(
        &self,
        io: &ChunkIo,
        chunks: &mut HashMap<u64, CachedChunk>,
    ) -> Result<(), ContentError> {
        while chunks.len() >= self.capacity {
            let oldest = chunks
                .iter()
                .min_by_key(|(_, c)| c.last_used.load(Ordering::Relaxed))
                .map(|(&i, _)| i)
                .expect("cache is non-empty");
            let entry = chunks.remove(&oldest).expect("key from iteration");
            if entry.dirty {
                trace!(chunk = oldest, "Evicting dirty chunk, writing through");
                io.write_chunk(oldest, &entry.data)?;
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn cached_indices(&self) -> Vec<u64> {
        let chunks = self.chunks.read().unwrap();
        let mut keys: Vec<u64> = chunks.keys().copied().collect();
        keys.sort_unstable();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::TempDir;

    fn test_master_key() -> Arc<MasterKey> {
        Arc::new(MasterKey::new([7u8; 32], [13u8; 32]).unwrap())
    }

    fn test_io(dir: &TempDir) -> ChunkIo {
        let path = dir.path().join("chunks.bin");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .unwrap();
        let io = ChunkIo::new(
            file,
            FileHeader::create(),
            test_master_key(),
            FileContext::new().with_path(path),
        );
        io.write_header().unwrap();
        io
    }

    #[test]
    fn test_chunk_io_roundtrip() {
        let dir = TempDir::new().unwrap();
        let io = test_io(&dir);

        io.write_chunk(0, b"first chunk").unwrap();
        io.write_chunk(1, b"second chunk").unwrap();

        // chunk 1 starts at its fixed offset, so chunk 0 occupies a full slot
        assert_eq!(io.read_chunk(1).unwrap(), b"second chunk");
    }

    #[test]
    fn test_read_past_end_is_empty() {
        let dir = TempDir::new().unwrap();
        let io = test_io(&dir);
        assert!(io.read_chunk(0).unwrap().is_empty());
        assert!(io.read_chunk(17).unwrap().is_empty());
    }

    #[test]
    fn test_cache_read_through() {
        let dir = TempDir::new().unwrap();
        let io = test_io(&dir);
        io.write_chunk(0, b"cached data").unwrap();

        let cache = ChunkCache::new(5);
        let len = cache
            .with_chunk(&io, 0, |data| {
                assert_eq!(data, b"cached data");
                data.len()
            })
            .unwrap();
        assert_eq!(len, 11);
        assert_eq!(cache.cached_indices(), vec![0]);
    }

    #[test]
    fn test_cache_write_and_flush_ordering() {
        let dir = TempDir::new().unwrap();
        let io = test_io(&dir);
        let cache = ChunkCache::new(5);

        // Dirty three chunks out of order; flush must land them all
        cache.update_chunk(&io, 2, 0, b"two", 0).unwrap();
        cache.update_chunk(&io, 0, 0, b"zero", 0).unwrap();
        cache.update_chunk(&io, 1, 0, b"one", 0).unwrap();
        cache.flush(&io).unwrap();

        assert_eq!(io.read_chunk(0).unwrap(), b"zero");
        assert_eq!(io.read_chunk(1).unwrap(), b"one");
        assert_eq!(io.read_chunk(2).unwrap(), b"two");
    }

    #[test]
    fn test_partial_update_preserves_rest_of_chunk() {
        let dir = TempDir::new().unwrap();
        let io = test_io(&dir);
        io.write_chunk(0, b"AAAAAAAAAA").unwrap();

        let cache = ChunkCache::new(5);
        cache.update_chunk(&io, 0, 3, b"BBB", 10).unwrap();
        cache.flush(&io).unwrap();

        assert_eq!(io.read_chunk(0).unwrap(), b"AAABBBAAAA");
    }

    #[test]
    fn test_full_overwrite_skips_load() {
        let dir = TempDir::new().unwrap();
        let io = test_io(&dir);
        // Deliberately leave garbage that would fail decryption if loaded
        io.set_ciphertext_len(chunk_offset(0) + 10).unwrap();

        let cache = ChunkCache::new(5);
        cache.update_chunk(&io, 0, 0, b"replacement", 10).unwrap();
        cache.flush(&io).unwrap();
        // Cut the stale tail the garbage left behind
        io.set_ciphertext_len(chunk_offset(0) + (11 + 48) as u64)
            .unwrap();

        assert_eq!(io.read_chunk(0).unwrap(), b"replacement");
    }

    #[test]
    fn test_dirty_eviction_writes_through() {
        let dir = TempDir::new().unwrap();
        let io = test_io(&dir);
        let cache = ChunkCache::new(2);

        cache.update_chunk(&io, 0, 0, b"zero", 0).unwrap();
        cache.update_chunk(&io, 1, 0, b"one", 0).unwrap();
        // Inserting a third chunk evicts the least recently used (0)
        cache.update_chunk(&io, 2, 0, b"two", 0).unwrap();

        assert!(!cache.cached_indices().contains(&0));
        // The evicted dirty chunk must already be on disk
        assert_eq!(io.read_chunk(0).unwrap(), b"zero");
    }

    #[test]
    fn test_lru_order_respects_reads() {
        let dir = TempDir::new().unwrap();
        let io = test_io(&dir);
        let cache = ChunkCache::new(2);

        cache.update_chunk(&io, 0, 0, b"zero", 0).unwrap();
        cache.update_chunk(&io, 1, 0, b"one", 0).unwrap();
        // Touch chunk 0 so chunk 1 becomes the eviction candidate
        cache.with_chunk(&io, 0, |_| ()).unwrap();
        cache.update_chunk(&io, 2, 0, b"two", 0).unwrap();

        let cached = cache.cached_indices();
        assert!(cached.contains(&0));
        assert!(!cached.contains(&1));
    }

    #[test]
    fn test_truncate_trims_final_chunk() {
        let dir = TempDir::new().unwrap();
        let io = test_io(&dir);
        let cache = ChunkCache::new(5);

        cache.update_chunk(&io, 0, 0, b"0123456789", 0).unwrap();
        cache.flush(&io).unwrap();
        io.set_ciphertext_len(content::ciphertext_size(10)).unwrap();

        cache.truncate(&io, 4).unwrap();

        assert_eq!(io.ciphertext_len().unwrap(), content::ciphertext_size(4));
        assert_eq!(io.read_chunk(0).unwrap(), b"0123");
    }

    #[test]
    fn test_truncate_to_zero() {
        let dir = TempDir::new().unwrap();
        let io = test_io(&dir);
        let cache = ChunkCache::new(5);

        cache.update_chunk(&io, 0, 0, b"payload", 0).unwrap();
        cache.update_chunk(&io, 1, 0, b"more", 0).unwrap();
        cache.flush(&io).unwrap();

        cache.truncate(&io, 0).unwrap();

        assert_eq!(
            io.ciphertext_len().unwrap(),
            content::HEADER_SIZE as u64,
            "truncate to zero leaves only the header"
        );
        assert!(cache.cached_indices().is_empty());
        assert!(io.read_chunk(0).unwrap().is_empty());
    }
}
