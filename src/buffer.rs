//! Socket byte buffers.
//!
//! Two shapes share one contract: the linear buffer backs the read
//! side (frame assembly needs contiguous bytes), the circular buffer
//! backs the write side where wrap-around costs nothing. Both hold a
//! hard cap and optionally tee outbound bytes to a raw-log file that
//! rolls when it reaches the cap.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const MAX_BUF_SIZ: usize = 10 * 1024 * 1024;

pub struct RawLog {
    file: File,
    path: PathBuf,
    cap: u64,
    written: u64,
}

impl RawLog {
    pub fn open<P: AsRef<Path>>(path: P, cap: u64) -> std::io::Result<RawLog> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(RawLog {
            file,
            path: path.as_ref().to_path_buf(),
            cap,
            written: 0,
        })
    }

    fn log(&mut self, bytes: &[u8]) {
        if self.written + bytes.len() as u64 > self.cap {
            if self.file.seek(SeekFrom::Start(0)).is_err() || self.file.set_len(0).is_err() {
                return;
            }
            self.written = 0;
            log::debug!("[rawlog={}] rolled at cap {}", self.path.display(), self.cap);
        }
        if self.file.write_all(bytes).is_ok() {
            self.written += bytes.len() as u64;
        }
    }
}

/// Contiguous buffer with a consume-compact discipline.
pub struct Buffer {
    buf: Vec<u8>,
    cp: usize,
    max: usize,
    total: u64,
    raw_log: Option<RawLog>,
}

impl Buffer {
    pub fn new(init: usize, max: usize) -> Self {
        let mut b = Buffer {
            buf: Vec::new(),
            cp: 0,
            max,
            total: 0,
            raw_log: None,
        };
        b.init(init);
        b
    }

    pub fn init(&mut self, size: usize) {
        self.buf = vec![0u8; size.min(self.max)];
        self.cp = 0;
    }

    pub fn set_raw_log(&mut self, rl: RawLog) {
        self.raw_log = Some(rl);
    }

    /// Double the allocation until `to` fits, capped. Contents are
    /// preserved either way; false means the cap was in the way.
    pub fn grow(&mut self, to: usize) -> bool {
        if to <= self.buf.len() {
            return true;
        }
        if to > self.max {
            return false;
        }
        let mut sz = self.buf.len().max(1);
        while sz < to {
            sz *= 2;
        }
        self.buf.resize(sz.min(self.max), 0);
        true
    }

    pub fn reset(&mut self) {
        self.cp = 0;
    }

    pub fn len(&self) -> usize {
        self.cp
    }

    pub fn is_empty(&self) -> bool {
        self.cp == 0
    }

    pub fn cap(&self) -> usize {
        self.max
    }

    pub fn n_alloc(&self) -> usize {
        self.buf.len()
    }

    pub fn n_left(&self) -> usize {
        self.buf.len() - self.cp
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.cp]
    }

    /// Append, growing as needed. False leaves the buffer unchanged.
    pub fn append(&mut self, bytes: &[u8]) -> bool {
        let need = self.cp + bytes.len();
        if !self.grow(need) {
            return false;
        }
        self.buf[self.cp..need].copy_from_slice(bytes);
        self.cp = need;
        self.total += bytes.len() as u64;
        true
    }

    /// Compact after the head `n` bytes were consumed.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.cp);
        self.buf.copy_within(n..self.cp, 0);
        self.cp -= n;
    }

    /// One read attempt into the free tail, doubling first when full.
    pub fn read_in<R: Read>(&mut self, r: &mut R) -> std::io::Result<usize> {
        if self.n_left() == 0 && !self.grow(self.buf.len() * 2) {
            return Ok(0);
        }
        let cp = self.cp;
        let n = r.read(&mut self.buf[cp..])?;
        self.cp += n;
        self.total += n as u64;
        Ok(n)
    }

    /// One write attempt from the head; written bytes are consumed
    /// and teed to the raw log.
    pub fn write_out<W: Write>(&mut self, w: &mut W) -> std::io::Result<usize> {
        if self.cp == 0 {
            return Ok(0);
        }
        let n = w.write(&self.buf[..self.cp])?;
        if let Some(rl) = self.raw_log.as_mut() {
            rl.log(&self.buf[..n]);
        }
        self.consume(n);
        Ok(n)
    }
}

/// Ring with independent begin/end indices and a hard cap.
pub struct CircularBuffer {
    buf: Vec<u8>,
    beg: usize,
    end: usize,
    used: usize,
    total: u64,
    raw_log: Option<RawLog>,
}

impl CircularBuffer {
    pub fn new(cap: usize) -> Self {
        CircularBuffer {
            buf: vec![0u8; cap],
            beg: 0,
            end: 0,
            used: 0,
            total: 0,
            raw_log: None,
        }
    }

    pub fn set_raw_log(&mut self, rl: RawLog) {
        self.raw_log = Some(rl);
    }

    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn cap(&self) -> usize {
        self.buf.len()
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn reset(&mut self) {
        self.beg = 0;
        self.end = 0;
        self.used = 0;
    }

    /// Enqueue with wrap. False when the ring would overflow; the
    /// ring is left untouched in that case.
    pub fn push(&mut self, bytes: &[u8]) -> bool {
        if self.used + bytes.len() > self.buf.len() {
            return false;
        }
        let cap = self.buf.len();
        let first = bytes.len().min(cap - self.end);
        self.buf[self.end..self.end + first].copy_from_slice(&bytes[..first]);
        if first < bytes.len() {
            self.buf[..bytes.len() - first].copy_from_slice(&bytes[first..]);
        }
        self.end = (self.end + bytes.len()) % cap;
        self.used += bytes.len();
        self.total += bytes.len() as u64;
        true
    }

    /// Drain begin→end in at most two writes across the wrap.
    pub fn write_out<W: Write>(&mut self, w: &mut W) -> std::io::Result<usize> {
        if self.used == 0 {
            return Ok(0);
        }
        let cap = self.buf.len();
        let first = self.used.min(cap - self.beg);
        let mut n = w.write(&self.buf[self.beg..self.beg + first])?;
        if let Some(rl) = self.raw_log.as_mut() {
            rl.log(&self.buf[self.beg..self.beg + n]);
        }
        if n == first && self.used > first {
            match w.write(&self.buf[..self.used - first]) {
                Ok(m) => {
                    if let Some(rl) = self.raw_log.as_mut() {
                        rl.log(&self.buf[..m]);
                    }
                    n += m;
                }
                // first half went out; report it rather than the error
                Err(_) => (),
            }
        }
        self.beg = (self.beg + n) % cap;
        self.used -= n;
        if self.used == 0 {
            self.beg = 0;
            self.end = 0;
        }
        Ok(n)
    }
}
