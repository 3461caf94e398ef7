//! Read-only memory-mapped store with a sliding window, shared by the
//! LVC, chart and tape readers. Cross-process coordination for the
//! LVC rides on an advisory flock with a caller-bounded wait; the
//! tape needs none (append-only writer, readers re-check the header's
//! write offset).

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use memmap2::{Mmap, MmapOptions};

use crate::error::StoreError;

fn page_size() -> u64 {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 }
}

pub struct MappedStore {
    file: File,
    path: PathBuf,
    file_len: u64,
    map: Mmap,
    /// Window offset the caller asked for.
    off: u64,
    /// Page-alignment slack at the front of `map`.
    lead: u64,
}

impl MappedStore {
    fn err_open(path: &Path, e: std::io::Error) -> StoreError {
        StoreError::Open {
            path: path.display().to_string(),
            source: e,
        }
    }

    /// Map the entire file read-only.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<MappedStore, StoreError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Self::err_open(path, e))?;
        let file_len = file
            .metadata()
            .map_err(|e| Self::err_open(path, e))?
            .len();
        let map = unsafe { MmapOptions::new().map(&file) }.map_err(|e| Self::err_open(path, e))?;
        Ok(MappedStore {
            file,
            path: path.to_path_buf(),
            file_len,
            map,
            off: 0,
            lead: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    /// Re-stat the file; an append-only writer may have grown it.
    pub fn refresh_len(&mut self) -> Result<u64, StoreError> {
        self.file_len = self
            .file
            .metadata()
            .map_err(|e| Self::err_open(&self.path, e))?
            .len();
        Ok(self.file_len)
    }

    /// Slide the window to `offset` for at least `size` bytes
    /// (clamped to the file). The mapping itself starts at the
    /// enclosing page boundary.
    pub fn map(&mut self, offset: u64, size: u64) -> Result<(), StoreError> {
        if offset > self.file_len {
            return Err(StoreError::Truncated {
                path: self.path.display().to_string(),
                need: offset,
                have: self.file_len,
            });
        }
        let size = size.min(self.file_len - offset);
        let page = page_size();
        let aligned = offset / page * page;
        let lead = offset - aligned;
        let map = unsafe {
            MmapOptions::new()
                .offset(aligned)
                .len((lead + size) as usize)
                .map(&self.file)
        }
        .map_err(|e| Self::err_open(&self.path, e))?;
        self.map = map;
        self.off = offset;
        self.lead = lead;
        Ok(())
    }

    /// Window offset within the file.
    pub fn offset(&self) -> u64 {
        self.off
    }

    /// Bytes visible at the window.
    pub fn data(&self) -> &[u8] {
        &self.map[self.lead as usize..]
    }

    pub fn len(&self) -> u64 {
        (self.map.len() as u64).saturating_sub(self.lead)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Advisory lock on the store's file, released on drop.
pub struct FileLockGuard<'a> {
    file: &'a File,
}

impl<'a> Drop for FileLockGuard<'a> {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// Take the cross-process lock, waiting up to `wait` (`None` waits
/// forever). Exceeding the bound comes back as `TimedOut` with no
/// side effects.
pub fn lock_file(file: &File, wait: Option<Duration>) -> Result<FileLockGuard<'_>, StoreError> {
    let deadline = wait.map(|w| Instant::now() + w);
    loop {
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(FileLockGuard { file });
        }
        if let Some(d) = deadline {
            if Instant::now() >= d {
                return Err(StoreError::TimedOut(wait.unwrap_or_default()));
            }
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

impl MappedStore {
    pub fn lock(&self, wait: Option<Duration>) -> Result<FileLockGuard<'_>, StoreError> {
        lock_file(&self.file, wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fixture(len: usize) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.bin");
        let mut f = File::create(&path).unwrap();
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        f.write_all(&data).unwrap();
        (dir, path)
    }

    #[test]
    fn open_maps_whole_file() {
        let (_d, path) = fixture(8192);
        let store = MappedStore::open(&path).unwrap();
        assert_eq!(store.file_len(), 8192);
        assert_eq!(store.data().len(), 8192);
        assert_eq!(store.data()[251], 0);
    }

    #[test]
    fn window_slides_to_unaligned_offsets() {
        let (_d, path) = fixture(16384);
        let mut store = MappedStore::open(&path).unwrap();
        store.map(1000, 500).unwrap();
        assert_eq!(store.offset(), 1000);
        assert_eq!(store.len(), 500);
        assert_eq!(store.data()[0], (1000 % 251) as u8);
    }

    #[test]
    fn window_clamps_at_eof() {
        let (_d, path) = fixture(1000);
        let mut store = MappedStore::open(&path).unwrap();
        store.map(900, 4096).unwrap();
        assert_eq!(store.len(), 100);
        assert!(store.map(2000, 16).is_err());
    }

    #[test]
    fn missing_file_is_open_error() {
        match MappedStore::open("/nonexistent/tickwire.lvc") {
            Err(StoreError::Open { .. }) => (),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn lock_times_out_when_held() {
        let (_d, path) = fixture(64);
        let store = MappedStore::open(&path).unwrap();
        let _held = store.lock(None).unwrap();
        // second handle on the same file: flock is per-open-file
        let f2 = File::open(&path).unwrap();
        let result = lock_file(&f2, Some(Duration::from_millis(30)));
        match result {
            Err(StoreError::TimedOut(_)) => (),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }
}
