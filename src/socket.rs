//! Per-connection socket state.
//!
//! Application threads append to the circular output buffer under the
//! socket mutex and wake the drain task; only the pump thread touches
//! the stream. Overflow past the ring's cap is staged in a separate
//! mutex-protected region so a publisher can keep writing while the
//! drain side catches up.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crossbeam_utils::atomic::AtomicCell;
use futures::future::{select, Either};
use futures::pin_mut;
use rand::seq::SliceRandom;
use smol::io::AsyncWriteExt;
use smol::net::TcpStream;

use crate::buffer::{Buffer, CircularBuffer, RawLog, MAX_BUF_SIZ};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ChanCfg {
    /// Dial sweep candidates, tried in order (shuffled first when
    /// `randomize` is set) until one answers.
    pub hosts: Vec<(String, u16)>,
    pub user: String,
    pub auth: String,
    pub hb_interval: Duration,
    pub out_buf_cap: usize,
    pub in_buf_init: usize,
    pub randomize: bool,
    /// Packed integer forms in the envelope.
    pub pack: bool,
    pub hi_mark_pct: usize,
    pub lo_mark_pct: usize,
    /// Bound on the application event FIFO.
    pub fifo_cap: usize,
    /// Tee outbound bytes to this file, rolling at the output cap.
    pub raw_log: Option<String>,
}

impl Default for ChanCfg {
    fn default() -> Self {
        ChanCfg {
            hosts: vec![("localhost".to_string(), 9998)],
            user: "tickwire".to_string(),
            auth: String::new(),
            hb_interval: Duration::from_secs(30),
            out_buf_cap: MAX_BUF_SIZ,
            in_buf_init: 64 * 1024,
            randomize: false,
            pack: true,
            hi_mark_pct: 75,
            lo_mark_pct: 25,
            fifo_cap: 16 * 1024,
            raw_log: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConnState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, PartialEq)]
pub enum HbAction {
    None,
    SendPing,
    Timeout,
}

#[derive(Default)]
pub struct ChanStats {
    pub n_byte_rx: AtomicU64,
    pub n_byte_tx: AtomicU64,
    pub n_msg_rx: AtomicU64,
    pub n_msg_tx: AtomicU64,
}

type MarkHook = std::sync::Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct MarkHooks {
    on_hi: Option<MarkHook>,
    on_lo: Option<MarkHook>,
}

pub struct Socket {
    hosts: Vec<(String, u16)>,
    randomize: bool,
    hi_mark_pct: usize,
    lo_mark_pct: usize,
    state: AtomicCell<ConnState>,
    stream: Mutex<Option<TcpStream>>,
    out: Mutex<CircularBuffer>,
    overflow: Mutex<Vec<u8>>,
    overflowed: AtomicBool,
    hi_latched: AtomicBool,
    hooks: Mutex<MarkHooks>,
    wr_wake_tx: smol::channel::Sender<()>,
    wr_wake_rx: smol::channel::Receiver<()>,
    /// Bumped on every attach; a drain task outlives its connection
    /// only until it notices the epoch moved.
    epoch: AtomicU64,
    last_rx: AtomicCell<Instant>,
    last_tx: AtomicCell<Instant>,
    peer: Mutex<String>,
    last_err: Mutex<String>,
    pub stats: ChanStats,
}

impl Socket {
    pub fn new(cfg: &ChanCfg) -> Socket {
        let (tx, rx) = smol::channel::bounded(1);
        let mut out = CircularBuffer::new(cfg.out_buf_cap);
        if let Some(path) = &cfg.raw_log {
            match RawLog::open(path, cfg.out_buf_cap as u64) {
                Ok(rl) => out.set_raw_log(rl),
                Err(e) => log::warn!("[rawlog={}] open failed: {}", path, e),
            }
        }
        Socket {
            hosts: cfg.hosts.clone(),
            randomize: cfg.randomize,
            hi_mark_pct: cfg.hi_mark_pct,
            lo_mark_pct: cfg.lo_mark_pct,
            state: AtomicCell::new(ConnState::Idle),
            stream: Mutex::new(None),
            out: Mutex::new(out),
            overflow: Mutex::new(Vec::new()),
            overflowed: AtomicBool::new(false),
            hi_latched: AtomicBool::new(false),
            hooks: Mutex::new(MarkHooks::default()),
            wr_wake_tx: tx,
            wr_wake_rx: rx,
            epoch: AtomicU64::new(0),
            last_rx: AtomicCell::new(Instant::now()),
            last_tx: AtomicCell::new(Instant::now()),
            peer: Mutex::new(String::new()),
            last_err: Mutex::new(String::new()),
            stats: ChanStats::default(),
        }
    }

    pub fn state(&self) -> ConnState {
        self.state.load()
    }

    pub fn peer(&self) -> String {
        self.peer.lock().unwrap().clone()
    }

    pub fn last_error(&self) -> String {
        self.last_err.lock().unwrap().clone()
    }

    pub fn is_writable(&self) -> bool {
        self.state.load() == ConnState::Connected
    }

    pub fn set_mark_hooks<H, L>(&self, on_hi: H, on_lo: L)
    where
        H: Fn() + Send + Sync + 'static,
        L: Fn() + Send + Sync + 'static,
    {
        let mut hooks = self.hooks.lock().unwrap();
        hooks.on_hi = Some(std::sync::Arc::new(on_hi));
        hooks.on_lo = Some(std::sync::Arc::new(on_lo));
    }

    /// Sweep the (host, port) list until a connect lands. The sweep
    /// order is randomized when configured so a farm of subscribers
    /// spreads across gateways.
    pub async fn connect(&self) -> anyhow::Result<TcpStream> {
        self.state.store(ConnState::Connecting);
        let mut hosts = self.hosts.clone();
        if self.randomize {
            hosts.shuffle(&mut rand::thread_rng());
        }
        let mut last_err = None;
        for (host, port) in &hosts {
            let dial = TcpStream::connect((host.as_str(), *port));
            pin_mut!(dial);
            let deadline = smol::Timer::after(DIAL_TIMEOUT);
            pin_mut!(deadline);
            let attempt = match select(dial, deadline).await {
                Either::Left((res, _)) => res,
                Either::Right(_) => Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timed out",
                )),
            };
            match attempt {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    self.attach(stream.clone());
                    log::info!("[sock] connected {}:{}", host, port);
                    return Ok(stream);
                }
                Err(e) => {
                    log::warn!("[sock] dial {}:{} failed: {}", host, port, e);
                    last_err = Some(e);
                }
            }
        }
        let reason = last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no hosts configured".to_string());
        self.record_error(&reason);
        self.state.store(ConnState::Disconnected);
        Err(anyhow::anyhow!("dial failed: {}", reason))
    }

    /// Adopt an already-established stream (accepted connections).
    pub fn attach(&self, stream: TcpStream) {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        *self.peer.lock().unwrap() = peer;
        *self.stream.lock().unwrap() = Some(stream);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.last_rx.store(Instant::now());
        self.last_tx.store(Instant::now());
        self.overflowed.store(false, Ordering::SeqCst);
        self.state.store(ConnState::Connected);
    }

    fn record_error(&self, reason: &str) {
        *self.last_err.lock().unwrap() = reason.to_string();
    }

    /// Serialize into the output ring. What does not fit is staged in
    /// the overflow region and `false` comes back; the connection is
    /// left up — upper layers decide.
    pub fn write(&self, bytes: &[u8]) -> bool {
        let ok = {
            let mut out = self.out.lock().unwrap();
            if out.push(bytes) {
                true
            } else {
                let fits = out.cap() - out.len();
                let (head, rest) = bytes.split_at(fits);
                if fits > 0 {
                    out.push(head);
                }
                self.overflow.lock().unwrap().extend_from_slice(rest);
                self.overflowed.store(true, Ordering::SeqCst);
                false
            }
        };
        self.after_push();
        let _ = self.wr_wake_tx.try_send(());
        ok
    }

    fn after_push(&self) {
        let (len, cap) = {
            let out = self.out.lock().unwrap();
            (out.len(), out.cap())
        };
        if len * 100 >= cap * self.hi_mark_pct && !self.hi_latched.swap(true, Ordering::SeqCst) {
            // take the hook out of the lock; it may call back in
            let hook = self.hooks.lock().unwrap().on_hi.clone();
            if let Some(f) = hook {
                f();
            }
        }
    }

    fn after_drain(&self) {
        let (len, cap) = {
            let out = self.out.lock().unwrap();
            (out.len(), out.cap())
        };
        let backlog = !self.overflow.lock().unwrap().is_empty();
        if !backlog
            && len * 100 <= cap * self.lo_mark_pct
            && self.hi_latched.swap(false, Ordering::SeqCst)
        {
            let hook = self.hooks.lock().unwrap().on_lo.clone();
            if let Some(f) = hook {
                f();
            }
        }
    }

    /// Move staged overflow into ring space freed by the drain.
    fn refill_from_overflow(&self) {
        let mut ovr = self.overflow.lock().unwrap();
        if ovr.is_empty() {
            return;
        }
        let mut out = self.out.lock().unwrap();
        let fits = (out.cap() - out.len()).min(ovr.len());
        if fits > 0 {
            let moved: Vec<u8> = ovr.drain(..fits).collect();
            out.push(&moved);
        }
        if ovr.is_empty() {
            self.overflowed.store(false, Ordering::SeqCst);
        }
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed.load(Ordering::SeqCst)
    }

    pub fn out_len(&self) -> usize {
        self.out.lock().unwrap().len()
    }

    /// Drain task body; runs on the pump until the connection it was
    /// spawned for dies or the socket disconnects.
    pub async fn drain_loop(&self, mut stream: TcpStream) {
        let epoch = self.epoch.load(Ordering::SeqCst);
        loop {
            if self.epoch.load(Ordering::SeqCst) != epoch
                || self.state.load() != ConnState::Connected
            {
                // hand any wake this task consumed to the live one
                let _ = self.wr_wake_tx.try_send(());
                break;
            }
            let mut chunk = Vec::new();
            {
                let mut out = self.out.lock().unwrap();
                let _ = out.write_out(&mut chunk);
            }
            if chunk.is_empty() {
                self.refill_from_overflow();
                if self.out.lock().unwrap().is_empty() {
                    self.after_drain();
                    match self.wr_wake_rx.recv().await {
                        Ok(()) => continue,
                        Err(_) => break,
                    }
                }
                continue;
            }
            if let Err(e) = stream.write_all(&chunk).await {
                if self.epoch.load(Ordering::SeqCst) == epoch {
                    self.disconnect(&format!("write: {}", e));
                }
                break;
            }
            self.last_tx.store(Instant::now());
            self.stats
                .n_byte_tx
                .fetch_add(chunk.len() as u64, Ordering::Relaxed);
            self.refill_from_overflow();
            self.after_drain();
        }
    }

    /// Called by the reader for every inbound chunk.
    pub fn touch_rx(&self, n: usize) {
        self.last_rx.store(Instant::now());
        self.stats.n_byte_rx.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn idle_rx(&self) -> Duration {
        self.last_rx.load().elapsed()
    }

    pub fn idle_tx(&self) -> Duration {
        self.last_tx.load().elapsed()
    }

    /// One-second heartbeat decision: ping after `interval` of rx
    /// silence, give up after three of them.
    pub fn heartbeat_check(&self, interval: Duration) -> HbAction {
        if self.state.load() != ConnState::Connected {
            return HbAction::None;
        }
        let idle = self.idle_rx();
        if idle >= interval * 3 {
            HbAction::Timeout
        } else if idle >= interval {
            HbAction::SendPing
        } else {
            HbAction::None
        }
    }

    pub fn disconnect(&self, reason: &str) {
        if self.state.swap(ConnState::Disconnected) == ConnState::Disconnected {
            return;
        }
        self.record_error(reason);
        if let Some(stream) = self.stream.lock().unwrap().take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.out.lock().unwrap().reset();
        self.overflow.lock().unwrap().clear();
        let _ = self.wr_wake_tx.try_send(());
        log::warn!("[sock peer={}] disconnected: {}", self.peer(), reason);
    }
}

/// Length-prefixed frame assembly over the linear input buffer.
pub struct Framer {
    buf: Buffer,
}

impl Framer {
    pub fn new(init: usize) -> Framer {
        Framer {
            buf: Buffer::new(init, MAX_BUF_SIZ),
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) -> bool {
        self.buf.append(bytes)
    }

    /// Pop one complete frame (envelope length leads every message).
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        let held = self.buf.as_slice();
        if held.len() < 4 {
            return None;
        }
        let len = u32::from_be_bytes([held[0], held[1], held[2], held[3]]) as usize;
        if len < 4 || len > self.buf.cap() {
            // poisoned length; surface as a frame so the decoder can fail it
            let frame = held.to_vec();
            self.buf.reset();
            return Some(frame);
        }
        if held.len() < len {
            return None;
        }
        let frame = held[..len].to_vec();
        self.buf.consume(len);
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sock(cap: usize) -> Socket {
        let cfg = ChanCfg {
            out_buf_cap: cap,
            ..Default::default()
        };
        Socket::new(&cfg)
    }

    #[test]
    fn overflow_stages_excess_and_returns_false() {
        let s = sock(1024);
        assert!(s.write(&vec![1u8; 512]));
        assert!(!s.write(&vec![2u8; 1024]));
        assert!(s.overflowed());
        assert_eq!(s.out_len(), 1024);
        assert_eq!(s.overflow.lock().unwrap().len(), 512);
    }

    #[test]
    fn hi_mark_fires_once_until_drained() {
        use std::sync::atomic::AtomicUsize;
        use std::sync::Arc;
        let s = sock(1000);
        let his = Arc::new(AtomicUsize::new(0));
        let los = Arc::new(AtomicUsize::new(0));
        let (h2, l2) = (his.clone(), los.clone());
        s.set_mark_hooks(
            move || {
                h2.fetch_add(1, Ordering::SeqCst);
            },
            move || {
                l2.fetch_add(1, Ordering::SeqCst);
            },
        );
        s.write(&vec![0u8; 700]);
        s.write(&vec![0u8; 100]);
        assert_eq!(his.load(Ordering::SeqCst), 1);
        assert_eq!(los.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn heartbeat_thresholds() {
        let s = sock(64);
        s.state.store(ConnState::Connected);
        s.last_rx.store(Instant::now());
        assert_eq!(s.heartbeat_check(Duration::from_secs(5)), HbAction::None);
        s.last_rx
            .store(Instant::now() - Duration::from_secs(6));
        assert_eq!(
            s.heartbeat_check(Duration::from_secs(5)),
            HbAction::SendPing
        );
        s.last_rx
            .store(Instant::now() - Duration::from_secs(16));
        assert_eq!(s.heartbeat_check(Duration::from_secs(5)), HbAction::Timeout);
    }

    #[test]
    fn framer_reassembles_split_frames() {
        let mut f = Framer::new(64);
        let mut frame = Vec::new();
        frame.extend_from_slice(&20u32.to_be_bytes());
        frame.extend_from_slice(&[7u8; 16]);
        f.feed(&frame[..3]);
        assert!(f.next_frame().is_none());
        f.feed(&frame[3..10]);
        assert!(f.next_frame().is_none());
        f.feed(&frame[10..]);
        let got = f.next_frame().unwrap();
        assert_eq!(got, frame);
        assert!(f.next_frame().is_none());
    }

    #[test]
    fn framer_handles_back_to_back_frames() {
        let mut f = Framer::new(64);
        let mut one = Vec::new();
        one.extend_from_slice(&8u32.to_be_bytes());
        one.extend_from_slice(b"abcd");
        let mut both = one.clone();
        both.extend_from_slice(&one);
        f.feed(&both);
        assert_eq!(f.next_frame().unwrap(), one);
        assert_eq!(f.next_frame().unwrap(), one);
        assert!(f.next_frame().is_none());
    }
}
