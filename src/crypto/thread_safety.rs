//! `Send`/`Sync` for [`MasterKey`].
//!
//! `MemSafe<[u8; 32]>` keeps a raw pointer to its mprotect-managed page, so
//! the compiler will not derive `Send` or `Sync` for anything containing it.
//! Sharing is nevertheless sound here: both key cells sit behind `RwLock`,
//! and the only reads of the protected pages happen inside the `with_*`
//! accessors in `keys.rs`, which take a guard first.
//!
//! The rest of the crate leans on these impls. One `Arc<MasterKey>` is held
//! simultaneously by the path mapper (filename encryption), the open-file
//! registry (chunk MACs on every read and write), and the vault state table,
//! all of which are driven from arbitrary caller threads.

use super::keys::MasterKey;

// SAFETY: the MemSafe cells are owned by MasterKey and reachable only
// through their RwLocks. The protected pages are plain bytes with no thread
// affinity, and mlock/mprotect operate per-process, so moving the owner to
// another thread changes nothing the kernel cares about.
unsafe impl Send for MasterKey {}

// SAFETY: key material is only dereferenced inside the `with_*` accessors,
// which hold the corresponding RwLock write guard for the whole access, so
// no two threads ever observe a protected page concurrently.
unsafe impl Sync for MasterKey {}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::MasterKey;
    use crate::fs::content::{self, FileContext, FileHeader};
    use crate::fs::name;

    fn require_send_sync<T: Send + Sync>() {}

    #[test]
    fn master_key_is_shareable() {
        require_send_sync::<MasterKey>();
        require_send_sync::<Arc<MasterKey>>();
    }

    #[test]
    fn concurrent_name_encryption_agrees_across_threads() {
        // The path mapper encrypts entry names from many threads against one
        // shared key; AES-SIV is deterministic, so all threads must agree.
        let key = Arc::new(MasterKey::new([21u8; 32], [22u8; 32]).unwrap());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let key = Arc::clone(&key);
            handles.push(thread::spawn(move || {
                (0..50)
                    .map(|i| {
                        let cleartext = format!("file-{i}.txt");
                        name::encrypt_name(&cleartext, "shared-dir-id", &key).unwrap()
                    })
                    .collect::<Vec<_>>()
            }));
        }

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for other in &results[1..] {
            assert_eq!(&results[0], other);
        }
    }

    #[test]
    fn concurrent_chunk_crypto_roundtrips() {
        // Chunk encryption reaches for the shared MAC key on every call;
        // this is the registry's access pattern under parallel file I/O.
        let key = Arc::new(MasterKey::new([23u8; 32], [24u8; 32]).unwrap());

        let mut handles = Vec::new();
        for fill in 0..4u8 {
            let key = Arc::clone(&key);
            handles.push(thread::spawn(move || {
                let header = FileHeader::create();
                let payload = vec![fill; 1024];
                for index in 0..20 {
                    let sealed =
                        content::encrypt_chunk(&payload, index, &header, &key).unwrap();
                    let opened = content::decrypt_chunk(
                        &sealed,
                        index,
                        &header,
                        &key,
                        &FileContext::new(),
                    )
                    .unwrap();
                    assert_eq!(opened, payload);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
