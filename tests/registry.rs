//! Shared-version mode against a stand-in registry speaking the wire
//! protocol over a sequenced-packet socket.

mod common;

use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mirrorfs::fs::registry::RECORD_SIZE;
use mirrorfs::fs::{sys, MirrorFs, ROOT_ID};

const OP_GET: u64 = 1;
const OP_PUT: u64 = 2;
const OP_VERSION: u64 = 3;

fn words_of(buf: &[u8]) -> [u64; 4] {
    let mut words = [0u64; 4];
    for (word, chunk) in words.iter_mut().zip(buf.chunks_exact(8)) {
        *word = u64::from_ne_bytes(chunk.try_into().unwrap());
    }
    words
}

fn record_of(words: [u64; 4]) -> [u8; RECORD_SIZE] {
    let mut buf = [0u8; RECORD_SIZE];
    for (chunk, word) in buf.chunks_exact_mut(8).zip(words) {
        chunk.copy_from_slice(&word.to_ne_bytes());
    }
    buf
}

/// A single-connection registry: assigns version-table slots 1, 2, 3, ... in
/// GET order and records every released refid.
struct FakeRegistry {
    puts: Arc<Mutex<Vec<u64>>>,
    conn: Arc<Mutex<Option<OwnedFd>>>,
}

impl FakeRegistry {
    fn spawn(socket_path: &Path) -> Self {
        let listener = {
            let c = sys::to_cstring(socket_path.as_os_str()).unwrap();
            sys::seqpacket_listen(&c).unwrap()
        };
        let puts = Arc::new(Mutex::new(Vec::new()));
        let conn = Arc::new(Mutex::new(None::<OwnedFd>));

        let thread_puts = Arc::clone(&puts);
        let thread_conn = Arc::clone(&conn);
        std::thread::spawn(move || {
            let accepted = sys::accept(listener.as_raw_fd()).unwrap();
            let fd = accepted.as_raw_fd();
            *thread_conn.lock().unwrap() = Some(accepted);

            let mut next_offset = 1u64;
            loop {
                let mut buf = [0u8; 64];
                let n = match sys::read(fd, &mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if n != RECORD_SIZE {
                    continue;
                }
                let [op, cookie, _dev, _ino] = words_of(&buf[..RECORD_SIZE]);
                match op {
                    OP_GET => {
                        let reply =
                            record_of([OP_VERSION, cookie, next_offset, 1000 + next_offset]);
                        next_offset += 1;
                        if sys::write(fd, &reply).is_err() {
                            break;
                        }
                    }
                    OP_PUT => {
                        // The PUT record carries the refid where GET carries
                        // its cookie.
                        thread_puts.lock().unwrap().push(cookie);
                    }
                    _ => {}
                }
            }
        });

        FakeRegistry { puts, conn }
    }

    fn disconnect(&self) {
        // shutdown() rather than close(): it tears the connection down even
        // while the server thread sits in read(), and delivers EOF to the
        // client right away.
        if let Some(conn) = self.conn.lock().unwrap().as_ref() {
            // SAFETY: no memory is involved; the descriptor stays owned.
            unsafe {
                libc::shutdown(conn.as_raw_fd(), libc::SHUT_RDWR);
            }
        }
    }

    fn wait_for_put(&self, refid: u64) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if self.puts.lock().unwrap().contains(&refid) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }
}

struct SharedSetup {
    _src: tempfile::TempDir,
    _scratch: tempfile::TempDir,
    registry: FakeRegistry,
    fs: MirrorFs,
    source: PathBuf,
}

fn shared_setup() -> SharedSetup {
    let src = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();

    let socket_path = scratch.path().join("ireg.sock");
    let table_path = scratch.path().join("versions");
    std::fs::write(&table_path, vec![0u8; 64 * 8]).unwrap();

    let registry = FakeRegistry::spawn(&socket_path);
    let fs = common::mirror_with(src.path(), |cfg| {
        cfg.shared = true;
        cfg.registry_socket = socket_path.clone();
        cfg.version_table = table_path.clone();
    });

    let source = src.path().to_path_buf();
    SharedSetup {
        _src: src,
        _scratch: scratch,
        registry,
        fs,
        source,
    }
}

#[test]
fn lookups_receive_version_slots_and_mutations_bump_them() {
    let setup = shared_setup();
    let fs = &setup.fs;
    let ctx = common::caller();

    // The root registered first and owns slot 1, still at version 0.
    assert_eq!(fs.version_of(ROOT_ID).unwrap(), 0);

    let dir = fs.mkdir(&ctx, ROOT_ID, "d".as_ref(), 0o755).unwrap();
    assert_eq!(dir.version_offset, 2, "slots are handed out in GET order");
    assert_eq!(dir.initial_version, 0);
    assert_eq!(
        fs.version_of(ROOT_ID).unwrap(),
        1,
        "mkdir bumped its parent"
    );

    let (file, opened) = fs
        .create(&ctx, dir.ino, "f".as_ref(), 0o644, libc::O_WRONLY)
        .unwrap();
    assert_ne!(file.version_offset, 0);
    assert_eq!(fs.version_of(dir.ino).unwrap(), 1, "create bumped the parent");

    let before = fs.version_of(file.ino).unwrap();
    fs.write(file.ino, opened.fh, 0, b"xyz").unwrap();
    assert!(
        fs.version_of(file.ino).unwrap() > before,
        "every write bumps the file's version"
    );
    fs.release(opened.fh).unwrap();
}

#[test]
fn eviction_releases_the_registry_slot() {
    let setup = shared_setup();
    let fs = &setup.fs;

    std::fs::write(setup.source.join("a"), b"x").unwrap();
    let entry = common::lookup_root(fs, "a");
    assert_eq!(entry.version_offset, 2);

    fs.forget(entry.ino, 1);
    assert!(
        setup.registry.wait_for_put(1002),
        "the slot's refid is PUT back on eviction"
    );
}

#[test]
fn registry_disconnect_degrades_to_unversioned_inodes() {
    let setup = shared_setup();
    let fs = &setup.fs;

    std::fs::write(setup.source.join("a"), b"x").unwrap();
    std::fs::write(setup.source.join("b"), b"y").unwrap();

    let a = common::lookup_root(fs, "a");
    assert_ne!(a.version_offset, 0);

    setup.registry.disconnect();

    // The next registration either hits the closed socket or a drained
    // reader; both must degrade, never block or kill the process.
    let b = common::lookup_root(fs, "b");
    assert_eq!(b.version_offset, 0);
    assert_eq!(fs.version_of(b.ino).unwrap(), 0);

    // Everything else keeps working.
    let opened = fs.open(b.ino, libc::O_RDONLY).unwrap();
    assert_eq!(fs.read(opened.fh, 0, 1).unwrap(), b"y");
    fs.release(opened.fh).unwrap();
    fs.forget_multi(&[(a.ino, 1), (b.ino, 1)]);
}

#[test]
fn absent_registry_disables_versioning_entirely() {
    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("a"), b"x").unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let table_path = scratch.path().join("versions");
    std::fs::write(&table_path, vec![0u8; 8 * 8]).unwrap();

    let fs = common::mirror_with(src.path(), |cfg| {
        cfg.shared = true;
        cfg.registry_socket = scratch.path().join("nobody.sock");
        cfg.version_table = table_path.clone();
    });

    assert_eq!(fs.version_of(ROOT_ID).unwrap(), 0);
    let entry = common::lookup_root(&fs, "a");
    assert_eq!(entry.version_offset, 0);

    let opened = fs.open(entry.ino, libc::O_RDONLY).unwrap();
    assert_eq!(fs.read(opened.fh, 0, 1).unwrap(), b"x");
    fs.release(opened.fh).unwrap();
}
