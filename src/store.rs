//! Backing-store abstraction and the two bundled implementations.
//!
//! The cache reads sliver contents from, and writes them through to, a
//! [`BackingStore`]. Offsets are absolute file offsets; callers hand in
//! buffers sized to the transfer. A short read is not an error: bytes past
//! what the store returns are holes and stay zero in the slab. Writes must
//! land whole.
//!
//! [`FileStore`] keeps one flat data file per file id under a root
//! directory. [`MemStore`] is the in-memory double used by tests and
//! embedders that want fault injection.

use crate::types::FileId;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub trait BackingStore: Send + Sync + 'static {
    /// Read up to `buf.len()` bytes at `off`, returning how many bytes the
    /// store had. The remainder of `buf` is untouched.
    fn read_at(&self, fid: FileId, off: u64, buf: &mut [u8]) -> Result<usize>;

    /// Write all of `buf` at `off`.
    fn write_at(&self, fid: FileId, off: u64, buf: &[u8]) -> Result<()>;

    /// Current length of the file's backing data.
    fn len(&self, fid: FileId) -> Result<u64>;
}

/// One flat file per file id under a root directory.
pub struct FileStore {
    root: PathBuf,
    handles: Mutex<HashMap<FileId, Arc<File>>>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            handles: Mutex::new(HashMap::new()),
        })
    }

    fn handle(&self, fid: FileId) -> Result<Arc<File>> {
        if let Some(file) = self.handles.lock().get(&fid) {
            return Ok(Arc::clone(file));
        }
        let path = self.root.join(format!("{:016x}.data", fid.0));
        let file = Arc::new(
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?,
        );
        Ok(Arc::clone(
            self.handles
                .lock()
                .entry(fid)
                .or_insert(file),
        ))
    }
}

impl BackingStore for FileStore {
    fn read_at(&self, fid: FileId, off: u64, buf: &mut [u8]) -> Result<usize> {
        let file = self.handle(fid)?;
        let mut done = 0;
        while done < buf.len() {
            match file.read_at(&mut buf[done..], off + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(done)
    }

    fn write_at(&self, fid: FileId, off: u64, buf: &[u8]) -> Result<()> {
        let file = self.handle(fid)?;
        file.write_all_at(buf, off)?;
        Ok(())
    }

    fn len(&self, fid: FileId) -> Result<u64> {
        Ok(self.handle(fid)?.metadata()?.len())
    }
}

/// In-memory backing store with fault injection for tests.
#[derive(Default)]
pub struct MemStore {
    files: Mutex<HashMap<FileId, Vec<u8>>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    reads: AtomicUsize,
    writes: AtomicUsize,
    read_delay_ms: AtomicUsize,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `read_at` calls so far, failed ones included.
    pub fn read_calls(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of `write_at` calls so far, failed ones included.
    pub fn write_calls(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// Make every subsequent read fail with an I/O error.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    /// Make every subsequent write fail with an I/O error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Stall every subsequent read, to hold a fault open in tests.
    pub fn set_read_delay(&self, delay: std::time::Duration) {
        self.read_delay_ms
            .store(delay.as_millis() as usize, Ordering::Relaxed);
    }

    /// Seed a file's contents directly, bypassing the failure toggles.
    pub fn seed(&self, fid: FileId, off: u64, data: &[u8]) {
        let mut files = self.files.lock();
        let file = files.entry(fid).or_default();
        let end = off as usize + data.len();
        if file.len() < end {
            file.resize(end, 0);
        }
        file[off as usize..end].copy_from_slice(data);
    }

    /// Raw copy of a file's bytes as the store sees them.
    pub fn contents(&self, fid: FileId) -> Vec<u8> {
        self.files.lock().get(&fid).cloned().unwrap_or_default()
    }
}

impl BackingStore for MemStore {
    fn read_at(&self, fid: FileId, off: u64, buf: &mut [u8]) -> Result<usize> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let delay = self.read_delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            std::thread::sleep(std::time::Duration::from_millis(delay as u64));
        }
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(Error::Io(std::io::Error::other("injected read failure")));
        }
        let files = self.files.lock();
        let Some(file) = files.get(&fid) else {
            return Ok(0);
        };
        if off as usize >= file.len() {
            return Ok(0);
        }
        let avail = file.len() - off as usize;
        let n = buf.len().min(avail);
        buf[..n].copy_from_slice(&file[off as usize..off as usize + n]);
        Ok(n)
    }

    fn write_at(&self, fid: FileId, off: u64, buf: &[u8]) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(Error::Io(std::io::Error::other("injected write failure")));
        }
        self.seed(fid, off, buf);
        Ok(())
    }

    fn len(&self, fid: FileId) -> Result<u64> {
        Ok(self
            .files
            .lock()
            .get(&fid)
            .map(|f| f.len() as u64)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::process;

    #[test]
    fn test_mem_store_round_trip_and_holes() {
        let store = MemStore::new();
        let fid = FileId(1);
        store.write_at(fid, 10, b"abc").expect("write");
        let mut buf = [0xffu8; 8];
        let n = store.read_at(fid, 8, &mut buf).expect("read");
        // Bytes 8..13 exist (two zero-fill, three written); the rest is
        // past EOF and reported short.
        assert_eq!(n, 5);
        assert_eq!(&buf[..5], &[0, 0, b'a', b'b', b'c']);
        assert_eq!(store.len(fid).expect("len"), 13);
    }

    #[test]
    fn test_mem_store_fault_injection() {
        let store = MemStore::new();
        let fid = FileId(2);
        store.set_fail_writes(true);
        assert!(store.write_at(fid, 0, b"x").is_err());
        store.set_fail_writes(false);
        store.write_at(fid, 0, b"x").expect("write after clearing");
        store.set_fail_reads(true);
        let mut buf = [0u8; 1];
        assert!(store.read_at(fid, 0, &mut buf).is_err());
    }

    #[test]
    fn test_file_store_read_past_eof_is_short() {
        let root = env::temp_dir().join(format!("slivercache_store_{}", process::id()));
        let store = FileStore::new(&root).expect("file store");
        let fid = FileId(3);
        store.write_at(fid, 0, b"hello").expect("write");
        let mut buf = [0u8; 16];
        let n = store.read_at(fid, 0, &mut buf).expect("read");
        assert_eq!(n, 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(store.len(fid).expect("len"), 5);
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_file_store_reuses_handles() {
        let root = env::temp_dir().join(format!("slivercache_handles_{}", process::id()));
        let store = FileStore::new(&root).expect("file store");
        let fid = FileId(4);
        store.write_at(fid, 0, b"one").expect("first write");
        store.write_at(fid, 3, b"two").expect("second write");
        let mut buf = [0u8; 6];
        assert_eq!(store.read_at(fid, 0, &mut buf).expect("read"), 6);
        assert_eq!(&buf, b"onetwo");
        std::fs::remove_dir_all(&root).ok();
    }
}
