//! Shared-version registry client.
//!
//! In `shared` mode several passthrough instances over the same source tree
//! coordinate through an external registry: each canonical inode is assigned
//! a slot in a memory-mapped table of version counters, and every mutation
//! bumps the inode's counter so the other instances can drop stale caches.
//!
//! The registry speaks fixed-size records over a sequenced-packet Unix
//! socket. A dedicated reader thread matches `VERSION` replies to pending
//! `GET` requests by their cookie. The whole subsystem is best-effort: if
//! the socket is missing, the write fails, or the registry disconnects,
//! affected inodes simply keep `version_offset == 0` and versioning becomes
//! a no-op for them.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use super::inode::InodeKey;
use super::sys;

const OP_GET: u64 = 1;
const OP_PUT: u64 = 2;
const OP_VERSION: u64 = 3;

/// Every request and reply is four native-endian u64 words.
pub const RECORD_SIZE: usize = 32;

fn encode_record(words: [u64; 4]) -> [u8; RECORD_SIZE] {
    let mut buf = [0u8; RECORD_SIZE];
    for (chunk, word) in buf.chunks_exact_mut(8).zip(words) {
        chunk.copy_from_slice(&word.to_ne_bytes());
    }
    buf
}

fn decode_record(buf: &[u8; RECORD_SIZE]) -> [u64; 4] {
    let mut words = [0u64; 4];
    for (word, chunk) in words.iter_mut().zip(buf.chunks_exact(8)) {
        *word = u64::from_ne_bytes(chunk.try_into().unwrap_or_else(|_| unreachable!()));
    }
    words
}

/// What the registry assigned for one inode.
#[derive(Debug, Clone, Copy)]
pub struct Registration {
    /// Slot in the version table; 0 disables versioning for the inode.
    pub offset: u64,
    /// Cookie to release the slot with on eviction.
    pub refid: u64,
}

struct PendingMap {
    pending: Mutex<FxHashMap<u64, SyncSender<Registration>>>,
    /// Set once the reader thread observed a disconnect; from then on no GET
    /// is posted and none can block.
    dead: AtomicBool,
}

/// The memory-mapped table of per-slot version counters.
pub struct VersionTable {
    base: NonNull<AtomicI64>,
    slots: usize,
    map_len: usize,
}

// SAFETY: the mapping is shared memory explicitly designed for cross-process
// atomic access; all reads and writes go through AtomicI64.
unsafe impl Send for VersionTable {}
// SAFETY: as above.
unsafe impl Sync for VersionTable {}

impl VersionTable {
    /// Map `path` read-write shared. The file's size fixes the slot count.
    pub fn open(path: &Path) -> io::Result<Self> {
        let c = sys::to_cstring(path.as_os_str())?;
        let fd = sys::open(&c, libc::O_RDWR | libc::O_CLOEXEC)?;
        let st = sys::stat_fd(fd.as_raw_fd())?;
        let map_len = st.st_size as usize;

        // SAFETY: we map a fresh region (addr = NULL) of exactly the file's
        // size and check the result before use.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(VersionTable {
            base: NonNull::new(addr.cast::<AtomicI64>())
                .unwrap_or_else(|| unreachable!("mmap success never returns NULL")),
            slots: map_len / std::mem::size_of::<i64>(),
            map_len,
        })
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    fn slot(&self, offset: u64) -> Option<&AtomicI64> {
        if offset == 0 || offset as usize >= self.slots {
            return None;
        }
        // SAFETY: the offset is in bounds and the mapping lives as long as
        // `self`; AtomicI64 has the same layout as the mapped i64 counters.
        Some(unsafe { &*self.base.as_ptr().add(offset as usize) })
    }

    pub fn read(&self, offset: u64) -> i64 {
        self.slot(offset)
            .map_or(0, |counter| counter.load(Ordering::SeqCst))
    }

    pub fn bump(&self, offset: u64) {
        if let Some(counter) = self.slot(offset) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for VersionTable {
    fn drop(&mut self) {
        // SAFETY: the region was mapped by us with exactly this length and
        // is unmapped exactly once.
        unsafe {
            libc::munmap(self.base.as_ptr().cast::<libc::c_void>(), self.map_len);
        }
    }
}

/// Connected client of the shared-version registry.
pub struct RegistryClient {
    sock: OwnedFd,
    state: Arc<PendingMap>,
    table: VersionTable,
    next_cookie: AtomicU64,
}

impl RegistryClient {
    /// Connect to the registry and map the version table.
    ///
    /// `Ok(None)` means nobody is listening on the socket: versioning is
    /// disabled and the server keeps running. A mapped-table failure after a
    /// successful connect is an error; in shared mode the caller treats it
    /// as fatal.
    pub fn connect(socket_path: &Path, table_path: &Path) -> io::Result<Option<Self>> {
        let addr = sys::to_cstring(socket_path.as_os_str())?;
        let sock = match sys::seqpacket_connect(&addr) {
            Ok(sock) => sock,
            Err(e) => {
                warn!(path = %socket_path.display(), "cannot reach the inode registry: {e}");
                return Ok(None);
            }
        };

        let table = VersionTable::open(table_path)?;
        debug!(
            slots = table.slots(),
            "mapped shared version table, registry connected"
        );

        let state = Arc::new(PendingMap {
            pending: Mutex::new(FxHashMap::default()),
            dead: AtomicBool::new(false),
        });

        let reader_sock = sock.try_clone()?;
        let reader_state = Arc::clone(&state);
        std::thread::Builder::new()
            .name("ireg-reader".into())
            .spawn(move || reader_loop(&reader_sock, &reader_state))?;

        Ok(Some(RegistryClient {
            sock,
            state,
            table,
            next_cookie: AtomicU64::new(1),
        }))
    }

    pub fn table(&self) -> &VersionTable {
        &self.table
    }

    /// Ask the registry for the version slot of `key`. Degrades to `None`
    /// (versioning disabled for this inode) on any failure.
    pub fn get(&self, key: InodeKey) -> Option<Registration> {
        if self.state.dead.load(Ordering::Acquire) {
            return None;
        }

        let cookie = self.next_cookie.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = sync_channel(1);
        self.state
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(cookie, tx);

        let record = encode_record([OP_GET, cookie, key.dev, key.ino]);
        match sys::send_nosignal(self.sock.as_raw_fd(), &record) {
            Ok(n) if n == RECORD_SIZE => {}
            Ok(n) => {
                warn!(written = n, "short write to the inode registry");
                self.abandon(cookie);
                return None;
            }
            Err(e) => {
                warn!("write to the inode registry failed: {e}");
                self.abandon(cookie);
                return None;
            }
        }

        // The sender side lives in the pending map; if the reader thread
        // exits it drains the map and this recv fails instead of blocking.
        rx.recv().ok()
    }

    /// Release a slot previously handed out by [`RegistryClient::get`].
    pub fn put(&self, refid: u64) {
        if refid == 0 || self.state.dead.load(Ordering::Acquire) {
            return;
        }
        let record = encode_record([OP_PUT, refid, 0, 0]);
        match sys::send_nosignal(self.sock.as_raw_fd(), &record) {
            Ok(n) if n == RECORD_SIZE => {}
            Ok(n) => warn!(written = n, "short write to the inode registry"),
            Err(e) => warn!("write to the inode registry failed: {e}"),
        }
    }

    fn abandon(&self, cookie: u64) {
        self.state
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&cookie);
    }
}

fn reader_loop(sock: &OwnedFd, state: &PendingMap) {
    loop {
        let mut buf = [0u8; 64];
        let n = match sys::read(sock.as_raw_fd(), &mut buf) {
            Ok(0) => {
                debug!("disconnected from the inode registry");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                warn!("read from the inode registry failed: {e}");
                break;
            }
        };
        if n != RECORD_SIZE {
            warn!(size = n, "unexpected record size from the inode registry");
            continue;
        }

        let words = decode_record(
            buf[..RECORD_SIZE]
                .try_into()
                .unwrap_or_else(|_| unreachable!()),
        );
        let [op, cookie, offset, refid] = words;
        if op != OP_VERSION {
            warn!(op, "unexpected opcode from the inode registry");
            continue;
        }

        let sender = state
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&cookie);
        match sender {
            Some(tx) => {
                // The requester may have already abandoned the cookie.
                let _ = tx.send(Registration { offset, refid });
            }
            None => warn!(cookie, "reply for an unknown registry request"),
        }
    }

    // Wake every in-flight GET before the thread exits; they observe the
    // dropped senders and degrade to an unversioned inode.
    state.dead.store(true, Ordering::Release);
    state
        .pending
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clear();
}
