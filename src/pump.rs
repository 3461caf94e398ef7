//! Per-channel I/O thread.
//!
//! One dedicated thread drives a smol executor plus a timer table and
//! idle callbacks. Every socket future a channel owns is spawned onto
//! this executor, so socket state, decoding and cache population all
//! mutate on a single thread; the loop suspends only in the ≤100 ms
//! tick. Timer/idle add and remove are queued and applied at the next
//! turn, so a callback may reshape the tables it is called from.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use smol::Executor;

const POLL: Duration = Duration::from_millis(100);

type Callback = Box<dyn FnMut() + Send>;

struct TimerEntry {
    id: u64,
    period: Duration,
    due: Instant,
    one_shot: bool,
    done: bool,
    f: Callback,
}

struct IdleEntry {
    id: u64,
    f: Callback,
}

enum Op {
    AddTimer(TimerEntry),
    DelTimer(u64),
    AddIdle(IdleEntry),
    DelIdle(u64),
}

pub struct Pump {
    ex: Arc<Executor<'static>>,
    running: AtomicBool,
    started: AtomicBool,
    ops: Mutex<Vec<Op>>,
    next_id: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Pump {
    pub fn new() -> Arc<Pump> {
        Arc::new(Pump {
            ex: Arc::new(Executor::new()),
            running: AtomicBool::new(false),
            started: AtomicBool::new(false),
            ops: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            thread: Mutex::new(None),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the I/O thread. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.running.store(true, Ordering::SeqCst);
        let pump = self.clone();
        let handle = std::thread::Builder::new()
            .name("tickwire-pump".into())
            .spawn(move || pump.run())
            .expect("spawn pump thread");
        *self.thread.lock().unwrap() = Some(handle);
    }

    fn run(self: Arc<Self>) {
        let ex = self.ex.clone();
        let drive = async {
            let mut timers: Vec<TimerEntry> = Vec::new();
            let mut idles: Vec<IdleEntry> = Vec::new();
            while self.running.load(Ordering::SeqCst) {
                smol::Timer::after(POLL).await;
                for op in self.ops.lock().unwrap().drain(..) {
                    match op {
                        Op::AddTimer(t) => timers.push(t),
                        Op::DelTimer(id) => timers.retain(|t| t.id != id),
                        Op::AddIdle(i) => idles.push(i),
                        Op::DelIdle(id) => idles.retain(|i| i.id != id),
                    }
                }
                let now = Instant::now();
                for t in timers.iter_mut() {
                    if now >= t.due && !t.done {
                        (t.f)();
                        t.due = now + t.period;
                        t.done = t.one_shot;
                    }
                }
                timers.retain(|t| !t.done);
                for i in idles.iter_mut() {
                    (i.f)();
                }
            }
            log::debug!("[pump] exit");
        };
        smol::block_on(ex.run(drive));
    }

    /// Run a socket future on the I/O thread.
    pub fn spawn<F>(&self, fut: F) -> smol::Task<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.ex.spawn(fut)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn add_timer<F: FnMut() + Send + 'static>(&self, period: Duration, f: F) -> u64 {
        let id = self.next_id();
        self.ops.lock().unwrap().push(Op::AddTimer(TimerEntry {
            id,
            period,
            due: Instant::now() + period,
            one_shot: false,
            done: false,
            f: Box::new(f),
        }));
        id
    }

    pub fn add_oneshot<F: FnMut() + Send + 'static>(&self, delay: Duration, f: F) -> u64 {
        let id = self.next_id();
        self.ops.lock().unwrap().push(Op::AddTimer(TimerEntry {
            id,
            period: delay,
            due: Instant::now() + delay,
            one_shot: true,
            done: false,
            f: Box::new(f),
        }));
        id
    }

    pub fn remove_timer(&self, id: u64) {
        self.ops.lock().unwrap().push(Op::DelTimer(id));
    }

    pub fn add_idle<F: FnMut() + Send + 'static>(&self, f: F) -> u64 {
        let id = self.next_id();
        self.ops
            .lock()
            .unwrap()
            .push(Op::AddIdle(IdleEntry { id, f: Box::new(f) }));
        id
    }

    pub fn remove_idle(&self, id: u64) {
        self.ops.lock().unwrap().push(Op::DelIdle(id));
    }

    /// Mark for exit and join the I/O thread. Spawned tasks are
    /// dropped with the executor's queue.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.thread.lock().unwrap().take();
        if let Some(h) = handle {
            let _ = h.join();
        }
        self.ops.lock().unwrap().clear();
    }
}

impl Drop for Pump {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn repeating_timer_fires() {
        let pump = Pump::new();
        pump.start();
        let (tx, rx) = mpsc::channel();
        pump.add_timer(Duration::from_millis(120), move || {
            let _ = tx.send(());
        });
        std::thread::sleep(Duration::from_millis(500));
        pump.stop();
        let fired = rx.try_iter().count();
        assert!(fired >= 2, "timer fired {} times", fired);
    }

    #[test]
    fn oneshot_fires_once() {
        let pump = Pump::new();
        pump.start();
        let (tx, rx) = mpsc::channel();
        pump.add_oneshot(Duration::from_millis(50), move || {
            let _ = tx.send(());
        });
        std::thread::sleep(Duration::from_millis(450));
        pump.stop();
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn tasks_and_timers_share_one_thread() {
        let pump = Pump::new();
        pump.start();
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        pump.spawn(async move {
            let _ = tx.send(std::thread::current().id());
        })
        .detach();
        pump.add_oneshot(Duration::from_millis(50), move || {
            let _ = tx2.send(std::thread::current().id());
        });
        let a = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let b = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        pump.stop();
        assert_eq!(a, b);
    }

    #[test]
    fn idle_callback_runs_every_turn() {
        let pump = Pump::new();
        pump.start();
        let (tx, rx) = mpsc::channel();
        let id = pump.add_idle(move || {
            let _ = tx.send(());
        });
        std::thread::sleep(Duration::from_millis(350));
        pump.remove_idle(id);
        pump.stop();
        assert!(rx.try_iter().count() >= 2);
    }

    #[test]
    fn stop_joins_quickly() {
        let pump = Pump::new();
        pump.start();
        let t0 = Instant::now();
        pump.stop();
        assert!(t0.elapsed() < Duration::from_secs(1));
        assert!(!pump.is_running());
    }
}
