//! Canonical inode table.
//!
//! Every host object the kernel has been told about is represented by exactly
//! one [`InodeData`], keyed by its `(device, inode)` pair and pinned by an
//! `O_PATH` descriptor. Node ids handed to the kernel are generational slab
//! indices: the slot index lives in the low bits, the slot's generation in
//! the high bits, so a forgotten id can never resurrect a reused slot. The
//! root is addressed by a reserved sentinel and never enters the slab.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tracing::trace;

/// Node id as seen by the kernel transport.
pub type NodeId = u64;

/// The reserved sentinel for the mount root (`FUSE_ROOT_ID`).
pub const ROOT_ID: NodeId = 1;

const SLOT_BITS: u32 = 48;
const SLOT_MASK: u64 = (1 << SLOT_BITS) - 1;

/// Host identity of an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeKey {
    pub dev: u64,
    pub ino: u64,
}

impl InodeKey {
    pub fn of(st: &libc::stat64) -> Self {
        InodeKey {
            dev: st.st_dev,
            ino: st.st_ino,
        }
    }
}

/// One canonical host inode.
///
/// Everything except `refcount` is immutable for the object's lifetime, so
/// handlers read `fd` and `is_symlink` without any lock once they hold an
/// `Arc` to the object. `refcount` is only ever written under the table
/// mutex. The anchor descriptor closes when the last `Arc` drops, which is
/// at eviction unless a concurrent handler still holds a clone.
#[derive(Debug)]
pub struct InodeData {
    key: InodeKey,
    fd: OwnedFd,
    is_symlink: bool,
    refcount: AtomicU64,
    version_offset: u64,
    registry_refid: u64,
}

impl InodeData {
    pub fn new(fd: OwnedFd, st: &libc::stat64, version_offset: u64, registry_refid: u64) -> Self {
        InodeData {
            key: InodeKey::of(st),
            fd,
            is_symlink: st.st_mode & libc::S_IFMT == libc::S_IFLNK,
            refcount: AtomicU64::new(1),
            version_offset,
            registry_refid,
        }
    }

    /// The root inode: pinned with a refcount of 2 so that no balanced
    /// forget sequence can ever release it.
    pub fn new_root(fd: OwnedFd, st: &libc::stat64, version_offset: u64, registry_refid: u64) -> Self {
        let root = InodeData::new(fd, st, version_offset, registry_refid);
        root.refcount.store(2, Ordering::Relaxed);
        root
    }

    pub fn key(&self) -> InodeKey {
        self.key
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn is_symlink(&self) -> bool {
        self.is_symlink
    }

    pub fn version_offset(&self) -> u64 {
        self.version_offset
    }

    pub fn registry_refid(&self) -> u64 {
        self.registry_refid
    }

    /// Current reference count. Only meaningful as a diagnostic: the value
    /// may change the moment it is read.
    pub fn refcount(&self) -> u64 {
        self.refcount.load(Ordering::Relaxed)
    }
}

/// Result of [`InodeTable::intern`].
pub struct Interned {
    pub id: NodeId,
    pub inode: Arc<InodeData>,
    /// The caller's candidate, handed back when another thread interned the
    /// same key first. The caller owns its cleanup (registry slot, anchor fd).
    pub rejected: Option<InodeData>,
}

struct Slot {
    generation: u64,
    inode: Option<Arc<InodeData>>,
}

struct Inner {
    slots: Vec<Slot>,
    free: Vec<usize>,
    by_key: FxHashMap<InodeKey, NodeId>,
}

/// The canonical `(dev, ino)` → inode map.
///
/// One mutex serializes every structural mutation and all refcount
/// arithmetic. The root inode lives outside the slab: it is addressed by
/// [`ROOT_ID`], preallocated with a refcount of 2, and never evicted.
pub struct InodeTable {
    inner: Mutex<Inner>,
    root: Arc<InodeData>,
}

fn encode(generation: u64, slot: usize) -> NodeId {
    debug_assert!((slot as u64) <= SLOT_MASK);
    (generation & 0xffff) << SLOT_BITS | slot as u64
}

fn decode(id: NodeId) -> (u64, usize) {
    (id >> SLOT_BITS, (id & SLOT_MASK) as usize)
}

impl InodeTable {
    /// `root` must carry a refcount of at least 2; it is never dropped by the
    /// table.
    pub fn new(root: Arc<InodeData>) -> Self {
        debug_assert!(root.refcount() >= 2, "root must be pinned");
        InodeTable {
            inner: Mutex::new(Inner {
                slots: Vec::new(),
                free: Vec::new(),
                by_key: FxHashMap::default(),
            }),
            root,
        }
    }

    pub fn root(&self) -> &Arc<InodeData> {
        &self.root
    }

    /// Decode a node id without touching any refcount.
    pub fn get(&self, id: NodeId) -> Option<Arc<InodeData>> {
        if id == ROOT_ID {
            return Some(Arc::clone(&self.root));
        }
        let (generation, slot) = decode(id);
        if generation == 0 {
            return None;
        }
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let s = inner.slots.get(slot)?;
        if s.generation & 0xffff != generation {
            return None;
        }
        s.inode.as_ref().map(Arc::clone)
    }

    /// Look up by host identity; a hit transfers one reference to the caller.
    pub fn find(&self, key: InodeKey) -> Option<(NodeId, Arc<InodeData>)> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = *inner.by_key.get(&key)?;
        let (_, slot) = decode(id);
        let inode = inner.slots[slot]
            .inode
            .as_ref()
            .map(Arc::clone)
            .unwrap_or_else(|| unreachable!("by_key entry points at an empty slot"));
        debug_assert!(inode.refcount() > 0);
        inode.refcount.fetch_add(1, Ordering::Relaxed);
        Some((id, inode))
    }

    /// Insert `candidate` (refcount 1) unless its key is already present.
    ///
    /// On a lost race the existing inode is returned with one extra reference
    /// (exactly as [`InodeTable::find`] would have granted) and the candidate
    /// comes back in `rejected` for the caller to dismantle.
    pub fn intern(&self, candidate: InodeData) -> Interned {
        debug_assert_eq!(candidate.refcount(), 1);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(&id) = inner.by_key.get(&candidate.key) {
            let (_, slot) = decode(id);
            let inode = inner.slots[slot]
                .inode
                .as_ref()
                .map(Arc::clone)
                .unwrap_or_else(|| unreachable!("by_key entry points at an empty slot"));
            inode.refcount.fetch_add(1, Ordering::Relaxed);
            return Interned {
                id,
                inode,
                rejected: Some(candidate),
            };
        }

        let key = candidate.key;
        let inode = Arc::new(candidate);
        let slot = match inner.free.pop() {
            Some(slot) => slot,
            None => {
                inner.slots.push(Slot {
                    generation: 1,
                    inode: None,
                });
                inner.slots.len() - 1
            }
        };
        let id = encode(inner.slots[slot].generation, slot);
        inner.slots[slot].inode = Some(Arc::clone(&inode));
        inner.by_key.insert(key, id);
        trace!(id, dev = key.dev, ino = key.ino, "interned inode");
        Interned {
            id,
            inode,
            rejected: None,
        }
    }

    /// Take one more reference on an inode already held.
    pub fn ref_again(&self, inode: &InodeData) {
        let _guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inode.refcount.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop `n` references. Returns the inode when this released the last
    /// one and it was evicted; the caller finishes the teardown (registry
    /// slot release) outside the lock. The root only ever decrements.
    pub fn unref(&self, id: NodeId, n: u64) -> Option<Arc<InodeData>> {
        if n == 0 {
            return None;
        }
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if id == ROOT_ID {
            let old = self.root.refcount.fetch_sub(n, Ordering::Relaxed);
            debug_assert!(old > n, "root refcount must never reach zero");
            return None;
        }

        let (generation, slot) = decode(id);
        let Some(s) = inner.slots.get_mut(slot) else {
            return None;
        };
        if s.generation & 0xffff != generation {
            return None;
        }
        let Some(inode) = s.inode.as_ref() else {
            return None;
        };

        let old = inode.refcount.fetch_sub(n, Ordering::Relaxed);
        debug_assert!(old >= n, "refcount underflow");
        if old > n {
            return None;
        }

        let inode = s
            .inode
            .take()
            .unwrap_or_else(|| unreachable!("slot emptied while locked"));
        s.generation += 1;
        if s.generation & 0xffff == 0 {
            // Generation zero is reserved so encoded ids never collide with
            // the root sentinel.
            s.generation += 1;
        }
        inner.free.push(slot);
        inner.by_key.remove(&inode.key);
        trace!(id, "evicted inode");
        Some(inode)
    }

    /// Number of non-root inodes currently tracked.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .by_key
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::sys;

    fn make_inode(path: &std::path::Path) -> InodeData {
        let c = sys::to_cstring(path.as_os_str()).unwrap();
        let fd = sys::open(&c, libc::O_PATH | libc::O_CLOEXEC).unwrap();
        let st = sys::stat_fd(fd.as_raw_fd()).unwrap();
        InodeData::new(fd, &st, 0, 0)
    }

    fn make_root(path: &std::path::Path) -> Arc<InodeData> {
        let c = sys::to_cstring(path.as_os_str()).unwrap();
        let fd = sys::open(&c, libc::O_PATH | libc::O_CLOEXEC).unwrap();
        let st = sys::stat_fd(fd.as_raw_fd()).unwrap();
        Arc::new(InodeData::new_root(fd, &st, 0, 0))
    }

    #[test]
    fn ids_roundtrip_and_avoid_the_root_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"").unwrap();
        let table = InodeTable::new(make_root(dir.path()));

        let interned = table.intern(make_inode(&dir.path().join("f")));
        assert!(interned.rejected.is_none());
        assert!(interned.id >= 1 << SLOT_BITS, "ids never collide with the sentinel");

        let got = table.get(interned.id).unwrap();
        assert_eq!(got.key(), interned.inode.key());
    }

    #[test]
    fn intern_race_loser_gets_the_winner() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"").unwrap();
        let table = InodeTable::new(make_root(dir.path()));

        let first = table.intern(make_inode(&dir.path().join("f")));
        let second = table.intern(make_inode(&dir.path().join("f")));

        assert_eq!(second.id, first.id);
        assert!(second.rejected.is_some());
        assert_eq!(first.inode.refcount(), 2);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn find_transfers_a_reference() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"").unwrap();
        let table = InodeTable::new(make_root(dir.path()));
        let interned = table.intern(make_inode(&dir.path().join("f")));

        let (id, inode) = table.find(interned.inode.key()).unwrap();
        assert_eq!(id, interned.id);
        assert_eq!(inode.refcount(), 2);

        assert!(table.find(InodeKey { dev: 0, ino: 0 }).is_none());
    }

    #[test]
    fn unref_evicts_at_zero_and_invalidates_the_id() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"").unwrap();
        let table = InodeTable::new(make_root(dir.path()));
        let interned = table.intern(make_inode(&dir.path().join("f")));
        let id = interned.id;
        table.find(interned.inode.key()).unwrap();
        drop(interned);

        assert!(table.unref(id, 1).is_none());
        let evicted = table.unref(id, 1).expect("last reference evicts");
        assert_eq!(table.len(), 0);
        assert!(table.get(id).is_none(), "evicted id is stale");
        drop(evicted);
    }

    #[test]
    fn slot_reuse_changes_the_generation() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"").unwrap();
        std::fs::write(dir.path().join("b"), b"").unwrap();
        let table = InodeTable::new(make_root(dir.path()));

        let a = table.intern(make_inode(&dir.path().join("a")));
        let a_id = a.id;
        drop(a);
        table.unref(a_id, 1);

        let b = table.intern(make_inode(&dir.path().join("b")));
        assert_ne!(b.id, a_id, "reused slot must produce a fresh id");
        assert!(table.get(a_id).is_none());
        assert!(table.get(b.id).is_some());
    }

    #[test]
    fn root_is_special() {
        let dir = tempfile::tempdir().unwrap();
        let table = InodeTable::new(make_root(dir.path()));

        assert!(table.get(ROOT_ID).is_some());
        table.ref_again(table.root());
        assert!(table.unref(ROOT_ID, 1).is_none());
        assert_eq!(table.root().refcount(), 2);
        assert_eq!(table.len(), 0, "root never enters the key map");
    }
}
