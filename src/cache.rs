//! Conflated per-stream record cache and the application event FIFO.
//!
//! The I/O thread caches every inbound field list and enqueues an
//! event; the application thread drains events at its own pace.
//! Conflated streams coalesce to one queue entry per record — the
//! fields are materialized from the record's pending set at drain
//! time, so a slow reader sees the latest value once instead of every
//! intermediate tick.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use dashmap::DashMap;

use crate::codec::{Field, MsgType, StreamState};

struct CachedField {
    fld: Field,
    upd: bool,
}

#[derive(Default)]
struct RecordInner {
    flds: HashMap<i32, CachedField>,
    pending: Vec<i32>,
    t_upd: f64,
}

/// One cached stream, created on first image.
pub struct Record {
    svc: String,
    tkr: String,
    stream_id: u32,
    inner: Mutex<RecordInner>,
}

impl Record {
    pub fn new(svc: &str, tkr: &str, stream_id: u32) -> Self {
        Record {
            svc: svc.to_string(),
            tkr: tkr.to_string(),
            stream_id,
            inner: Mutex::new(RecordInner::default()),
        }
    }

    pub fn svc(&self) -> &str {
        &self.svc
    }

    pub fn tkr(&self) -> &str {
        &self.tkr
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Seconds-since-epoch of the last merge.
    pub fn t_upd(&self) -> f64 {
        self.inner.lock().unwrap().t_upd
    }

    /// Merge an incoming field list: replace stored values, flag them
    /// updated, and append newly-flagged fids to the pending set.
    pub fn cache(&self, fields: &[Field]) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        for f in fields {
            match inner.flds.get_mut(&f.fid) {
                Some(c) => {
                    c.fld = f.clone();
                    if !c.upd {
                        c.upd = true;
                        inner.pending.push(f.fid);
                    }
                }
                None => {
                    inner.flds.insert(
                        f.fid,
                        CachedField {
                            fld: f.clone(),
                            upd: true,
                        },
                    );
                    inner.pending.push(f.fid);
                }
            }
        }
        inner.t_upd = crate::util::unix_ns_now() as f64 / 1e9;
    }

    /// Drain the pending set, clearing updated flags.
    pub fn get_upds(&self) -> Vec<Field> {
        let mut inner = self.inner.lock().unwrap();
        let fids: Vec<i32> = inner.pending.drain(..).collect();
        let mut out = Vec::with_capacity(fids.len());
        for fid in fids {
            if let Some(c) = inner.flds.get_mut(&fid) {
                c.upd = false;
                out.push(c.fld.clone());
            }
        }
        out
    }

    /// Point-in-time copy of every cached field.
    pub fn get_cache(&self) -> Vec<Field> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<Field> = inner.flds.values().map(|c| c.fld.clone()).collect();
        out.sort_by_key(|f| f.fid);
        out
    }

    pub fn get_field(&self, fid: i32) -> Option<Field> {
        let inner = self.inner.lock().unwrap();
        inner.flds.get(&fid).map(|c| c.fld.clone())
    }

    pub fn n_fields(&self) -> usize {
        self.inner.lock().unwrap().flds.len()
    }
}

fn key_of(svc: &str, tkr: &str) -> String {
    format!("{}|{}", svc, tkr)
}

/// Stream records keyed by id and by (service, ticker).
#[derive(Default)]
pub struct RecordCache {
    by_id: DashMap<u32, Arc<Record>>,
    by_key: DashMap<String, u32>,
}

impl RecordCache {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn create(&self, svc: &str, tkr: &str, stream_id: u32) -> Arc<Record> {
        let rec = Arc::new(Record::new(svc, tkr, stream_id));
        self.by_id.insert(stream_id, rec.clone());
        self.by_key.insert(key_of(svc, tkr), stream_id);
        rec
    }

    pub fn by_id(&self, stream_id: u32) -> Option<Arc<Record>> {
        self.by_id.get(&stream_id).map(|r| r.value().clone())
    }

    pub fn by_name(&self, svc: &str, tkr: &str) -> Option<Arc<Record>> {
        let id = *self.by_key.get(&key_of(svc, tkr))?.value();
        self.by_id(id)
    }

    pub fn remove(&self, stream_id: u32) -> Option<Arc<Record>> {
        let (_, rec) = self.by_id.remove(&stream_id)?;
        self.by_key.remove(&key_of(rec.svc(), rec.tkr()));
        Some(rec)
    }

    pub fn clear(&self) {
        self.by_id.clear();
        self.by_key.clear();
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn iter_ids(&self) -> Vec<u32> {
        self.by_id.iter().map(|e| *e.key()).collect()
    }
}

/// What the application drains from the FIFO.
#[derive(Debug, Clone)]
pub struct Update {
    pub mt: MsgType,
    pub state: Option<StreamState>,
    pub stream_id: u32,
    pub svc: String,
    pub tkr: String,
    pub fields: Vec<Field>,
    pub text: Option<String>,
}

enum Queued {
    Direct(Update),
    Conflated(Arc<Record>),
}

struct FifoInner {
    q: VecDeque<Queued>,
    queued_recs: HashSet<u32>,
    n_dropped: u64,
    stopped: bool,
}

/// Bounded FIFO between the I/O thread and the application thread.
pub struct EventFifo {
    inner: Mutex<FifoInner>,
    cv: Condvar,
    cap: usize,
}

impl EventFifo {
    pub fn new(cap: usize) -> Self {
        EventFifo {
            inner: Mutex::new(FifoInner {
                q: VecDeque::new(),
                queued_recs: HashSet::new(),
                n_dropped: 0,
                stopped: false,
            }),
            cv: Condvar::new(),
            cap,
        }
    }

    fn push(&self, inner: &mut FifoInner, item: Queued) {
        if inner.q.len() >= self.cap {
            if let Some(Queued::Conflated(rec)) = inner.q.pop_front() {
                inner.queued_recs.remove(&rec.stream_id());
            }
            inner.n_dropped += 1;
        }
        inner.q.push_back(item);
    }

    /// Enqueue an unconflated message (image, status, connect edge).
    pub fn add(&self, upd: Update) {
        let mut inner = self.inner.lock().unwrap();
        self.push(&mut inner, Queued::Direct(upd));
        self.cv.notify_one();
    }

    /// Enqueue a conflated tick: one marker per record however many
    /// updates arrive before the drain.
    pub fn add_conflated(&self, rec: Arc<Record>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.queued_recs.insert(rec.stream_id()) {
            self.push(&mut inner, Queued::Conflated(rec));
            self.cv.notify_one();
        }
    }

    /// Block up to `timeout` for something to drain. Returns the
    /// queue depth; zero means timeout or stop.
    pub fn wait(&self, timeout: Duration) -> usize {
        let inner = self.inner.lock().unwrap();
        if inner.stopped {
            return 0;
        }
        if !inner.q.is_empty() {
            return inner.q.len();
        }
        let (inner, _) = self
            .cv
            .wait_timeout_while(inner, timeout, |i| i.q.is_empty() && !i.stopped)
            .unwrap();
        if inner.stopped {
            0
        } else {
            inner.q.len()
        }
    }

    pub fn get_one_upd(&self) -> Option<Update> {
        let mut inner = self.inner.lock().unwrap();
        match inner.q.pop_front()? {
            Queued::Direct(upd) => Some(upd),
            Queued::Conflated(rec) => {
                inner.queued_recs.remove(&rec.stream_id());
                drop(inner);
                Some(Update {
                    mt: MsgType::Update,
                    state: None,
                    stream_id: rec.stream_id(),
                    svc: rec.svc().to_string(),
                    tkr: rec.tkr().to_string(),
                    fields: rec.get_upds(),
                    text: None,
                })
            }
        }
    }

    /// Purge anything queued for a closed stream.
    pub fn close(&self, stream_id: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.queued_recs.remove(&stream_id);
        inner.q.retain(|item| match item {
            Queued::Direct(u) => u.stream_id != stream_id,
            Queued::Conflated(r) => r.stream_id() != stream_id,
        });
    }

    /// Release any pending wait with zero updates.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.stopped = true;
        inner.q.clear();
        inner.queued_recs.clear();
        self.cv.notify_all();
    }

    pub fn n_dropped(&self) -> u64 {
        self.inner.lock().unwrap().n_dropped
    }
}
