//! Publish/subscribe channels.
//!
//! A `SubChannel` dials a gateway, mounts with the plaintext
//! user/auth exchange, and turns inbound frames into cached records
//! and application events. A `PubChannel` listens, answers opens, and
//! writes images/updates through. All I/O futures for a channel run
//! on its pump thread; application threads come in only through the
//! public API (coarse mutex) and the event FIFO.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_utils::atomic::AtomicCell;
use dashmap::DashMap;
use smol::io::AsyncReadExt;
use smol::net::{TcpListener, TcpStream};

use crate::cache::{EventFifo, RecordCache, Update};
use crate::codec::{
    BinHdr, Codec, DataType, Field, MsgBody, MsgType, Protocol, StreamState,
};
use crate::pump::Pump;
use crate::schema::{Schema, SchemaRef};
use crate::socket::{ChanCfg, ConnState, Framer, HbAction, Socket};

/// Application event surface. Callbacks run on the pump thread; no
/// channel lock is held, so calling back into the channel is safe.
pub trait ChannelListener: Send + Sync {
    fn on_connect(&self, _up: bool, _reason: &str) {}
    fn on_service(&self, _svc: &str, _up: bool) {}
    fn on_data(&self, _upd: &Update) {}
    fn on_schema(&self, _schema: &Schema) {}
    fn on_q_hi_mark(&self) {}
    fn on_q_lo_mark(&self) {}
}

/// No-op listener for callers that only drain the FIFO.
pub struct NullListener;

impl ChannelListener for NullListener {}

#[derive(Debug, Clone, Copy, PartialEq)]
enum StreamPhase {
    Opened,
    Imaged,
    Closed,
}

#[derive(Debug, Clone)]
struct StreamInfo {
    svc: String,
    tkr: String,
    phase: StreamPhase,
}

fn key_of(svc: &str, tkr: &str) -> String {
    format!("{}|{}", svc, tkr)
}

pub struct SubChannel {
    cfg: ChanCfg,
    sock: Arc<Socket>,
    pump: Arc<Pump>,
    codec: Mutex<Codec>,
    schema: SchemaRef,
    cache: RecordCache,
    fifo: Arc<EventFifo>,
    listener: Arc<dyn ChannelListener>,
    streams: DashMap<u32, StreamInfo>,
    by_key: DashMap<String, u32>,
    next_tag: AtomicCell<u32>,
    stopping: AtomicBool,
    api_mtx: Mutex<()>,
}

impl SubChannel {
    /// Dial and run. Returns immediately; connection edges arrive via
    /// `ChannelListener::on_connect`.
    pub fn start(cfg: ChanCfg, listener: Arc<dyn ChannelListener>) -> Arc<SubChannel> {
        let pump = Pump::new();
        let sock = Arc::new(Socket::new(&cfg));
        let chan = Arc::new(SubChannel {
            codec: Mutex::new(Codec::new(cfg.pack)),
            fifo: Arc::new(EventFifo::new(cfg.fifo_cap)),
            cfg,
            sock: sock.clone(),
            pump: pump.clone(),
            schema: SchemaRef::new(),
            cache: RecordCache::new(),
            listener: listener.clone(),
            streams: DashMap::new(),
            by_key: DashMap::new(),
            next_tag: AtomicCell::new(1),
            stopping: AtomicBool::new(false),
            api_mtx: Mutex::new(()),
        });
        {
            let l = listener.clone();
            sock.set_mark_hooks(
                {
                    let l = l.clone();
                    move || l.on_q_hi_mark()
                },
                move || l.on_q_lo_mark(),
            );
        }
        pump.start();
        {
            let chan = chan.clone();
            let hb = chan.cfg.hb_interval;
            let c2 = chan.clone();
            chan.pump.add_timer(Duration::from_secs(1), move || {
                match c2.sock.heartbeat_check(hb) {
                    HbAction::SendPing => {
                        let ping = c2.codec.lock().unwrap().ping();
                        c2.sock.write(&ping);
                    }
                    HbAction::Timeout => c2.sock.disconnect("heartbeat timeout"),
                    HbAction::None => (),
                }
            });
        }
        {
            let chan2 = chan.clone();
            chan.pump
                .spawn(async move { chan2.conn_loop().await })
                .detach();
        }
        chan
    }

    async fn conn_loop(self: Arc<Self>) {
        while !self.stopping.load(Ordering::SeqCst) {
            match self.sock.connect().await {
                Ok(stream) => {
                    self.send_mount();
                    self.reopen_streams();
                    self.listener.on_connect(true, &self.sock.peer());
                    {
                        let sock = self.sock.clone();
                        let wr = stream.clone();
                        self.pump
                            .spawn(async move { sock.drain_loop(wr).await })
                            .detach();
                    }
                    let reason = self.read_loop(stream).await;
                    self.sock.disconnect(&reason);
                    let reason = self.sock.last_error();
                    self.listener.on_connect(false, &reason);
                    self.fifo.add(Update {
                        mt: MsgType::Status,
                        state: Some(StreamState::Recovering),
                        stream_id: 0,
                        svc: String::new(),
                        tkr: String::new(),
                        fields: vec![],
                        text: Some(reason),
                    });
                }
                Err(e) => {
                    self.listener.on_connect(false, &e.to_string());
                }
            }
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }
            smol::Timer::after(Duration::from_secs(1)).await;
        }
    }

    async fn read_loop(&self, mut stream: TcpStream) -> String {
        let mut framer = Framer::new(self.cfg.in_buf_init);
        let mut chunk = vec![0u8; 64 * 1024];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) => return self.close_reason("connection reset"),
                Ok(n) => {
                    self.sock.touch_rx(n);
                    if !framer.feed(&chunk[..n]) {
                        return "input buffer overflow".to_string();
                    }
                    while let Some(frame) = framer.next_frame() {
                        self.sock.stats.n_msg_rx.fetch_add(1, Ordering::Relaxed);
                        if let Err(e) = self.dispatch(&frame) {
                            return format!("protocol: {}", e);
                        }
                    }
                }
                Err(e) => return self.close_reason(&e.to_string()),
            }
            if self.sock.state() != ConnState::Connected {
                return self.close_reason("disconnected");
            }
        }
    }

    /// A local disconnect (heartbeat, stop) already recorded why.
    fn close_reason(&self, fallback: &str) -> String {
        let recorded = self.sock.last_error();
        if self.sock.state() == ConnState::Disconnected && !recorded.is_empty() {
            recorded
        } else {
            fallback.to_string()
        }
    }

    fn dispatch(&self, frame: &[u8]) -> anyhow::Result<()> {
        let wm = self.codec.lock().unwrap().decode(frame)?;
        match wm.hdr.mt {
            MsgType::Image => self.on_image(wm.hdr, wm.body),
            MsgType::Update => self.on_update(wm.hdr, wm.body),
            MsgType::Status => self.on_status(wm.hdr, wm.body),
            MsgType::Ctl => self.on_ctl(wm.body),
            MsgType::Ping => {
                // any send within the window acks; otherwise answer
                if self.sock.idle_tx() >= self.cfg.hb_interval {
                    let ping = self.codec.lock().unwrap().ping();
                    self.sock.write(&ping);
                }
                Ok(())
            }
            MsgType::Drop => self.on_drop(wm.hdr),
            MsgType::Mount => {
                log::info!("[sub] mount ack from {}", self.sock.peer());
                Ok(())
            }
            other => {
                log::debug!("[sub] ignoring {:?}", other);
                Ok(())
            }
        }
    }

    fn on_image(&self, hdr: BinHdr, body: MsgBody) -> anyhow::Result<()> {
        let mut fields = match body {
            MsgBody::Fields(fl) => fl,
            _ => anyhow::bail!("image without field list"),
        };
        let tag = hdr.tag;
        let info = match self.streams.get_mut(&tag) {
            Some(mut e) => {
                e.value_mut().phase = StreamPhase::Imaged;
                e.value().clone()
            }
            None => {
                log::warn!("[sub] image for unknown stream tag {}", tag);
                return Ok(());
            }
        };
        self.schema.get().decorate(&mut fields);
        let rec = self
            .cache
            .by_id(tag)
            .unwrap_or_else(|| self.cache.create(&info.svc, &info.tkr, tag));
        rec.cache(&fields);
        rec.get_upds(); // image delivers everything below; clear pending
        let upd = Update {
            mt: MsgType::Image,
            state: Some(StreamState::Up),
            stream_id: tag,
            svc: info.svc,
            tkr: info.tkr,
            fields,
            text: None,
        };
        self.listener.on_data(&upd);
        self.fifo.add(upd);
        Ok(())
    }

    fn on_update(&self, hdr: BinHdr, body: MsgBody) -> anyhow::Result<()> {
        let mut fields = match body {
            MsgBody::Fields(fl) => fl,
            _ => anyhow::bail!("update without field list"),
        };
        let tag = hdr.tag;
        let imaged = self
            .streams
            .get(&tag)
            .map(|e| e.value().phase == StreamPhase::Imaged)
            .unwrap_or(false);
        if !imaged {
            // updates without a prior image are discarded
            log::debug!("[sub] dropping update for unimaged stream {}", tag);
            return Ok(());
        }
        let rec = match self.cache.by_id(tag) {
            Some(rec) => rec,
            None => return Ok(()),
        };
        self.schema.get().decorate(&mut fields);
        rec.cache(&fields);
        let upd = Update {
            mt: MsgType::Update,
            state: None,
            stream_id: tag,
            svc: rec.svc().to_string(),
            tkr: rec.tkr().to_string(),
            fields,
            text: None,
        };
        self.listener.on_data(&upd);
        self.fifo.add_conflated(rec);
        Ok(())
    }

    fn on_status(&self, hdr: BinHdr, body: MsgBody) -> anyhow::Result<()> {
        let (state, text) = match body {
            MsgBody::Status { state, text } => (state, text),
            _ => anyhow::bail!("status without state"),
        };
        let (svc, tkr) = self
            .streams
            .get(&hdr.tag)
            .map(|e| (e.value().svc.clone(), e.value().tkr.clone()))
            .unwrap_or_default();
        // stale / dead are delivered but the stream stays
        let upd = Update {
            mt: MsgType::Status,
            state: Some(state),
            stream_id: hdr.tag,
            svc,
            tkr,
            fields: vec![],
            text: Some(text),
        };
        self.listener.on_data(&upd);
        self.fifo.add(upd);
        Ok(())
    }

    fn on_ctl(&self, body: MsgBody) -> anyhow::Result<()> {
        let text = match body {
            MsgBody::Text(t) => t,
            _ => return Ok(()),
        };
        if text.trim_start().starts_with("<schema") {
            let schema = Schema::from_xml(&text)?;
            log::info!("[sub] schema received: {} fields", schema.len());
            self.schema.replace(schema);
            self.listener.on_schema(&self.schema.get());
        } else {
            for (svc, up) in crate::codec::xml::parse_svc_states(&text) {
                self.listener.on_service(&svc, up);
            }
        }
        Ok(())
    }

    fn on_drop(&self, hdr: BinHdr) -> anyhow::Result<()> {
        if let Some((tag, info)) = self.streams.remove(&hdr.tag) {
            self.by_key.remove(&key_of(&info.svc, &info.tkr));
            self.cache.remove(tag);
            self.fifo.close(tag);
            log::info!("[sub] server dropped {}|{}", info.svc, info.tkr);
        }
        Ok(())
    }

    fn send_mount(&self) {
        let codec = self.codec.lock().unwrap();
        let hdr = BinHdr::new(MsgType::Mount, DataType::Control, 0);
        let buf = codec.encode(
            hdr,
            &MsgBody::Mount {
                user: self.cfg.user.clone(),
                auth: self.cfg.auth.clone(),
            },
        );
        self.sock.write(&buf);
    }

    fn send_open(&self, tag: u32, svc: &str, tkr: &str) {
        let codec = self.codec.lock().unwrap();
        let hdr = BinHdr::new(MsgType::Open, DataType::Control, tag);
        let buf = codec.encode(
            hdr,
            &MsgBody::Item {
                svc: svc.to_string(),
                tkr: tkr.to_string(),
            },
        );
        self.sock.write(&buf);
        self.sock.stats.n_msg_tx.fetch_add(1, Ordering::Relaxed);
    }

    fn reopen_streams(&self) {
        for mut e in self.streams.iter_mut() {
            // a fresh connection owes us a fresh image
            e.value_mut().phase = StreamPhase::Opened;
            let (tag, svc, tkr) = (*e.key(), e.value().svc.clone(), e.value().tkr.clone());
            drop(e);
            self.send_open(tag, &svc, &tkr);
        }
    }

    /// Open a stream. The image arrives on the event surface; the
    /// returned id correlates it.
    pub fn subscribe(&self, svc: &str, tkr: &str) -> u32 {
        let _g = self.api_mtx.lock().unwrap();
        let key = key_of(svc, tkr);
        if let Some(tag) = self.by_key.get(&key) {
            return *tag.value();
        }
        let tag = self.next_tag.fetch_add(1);
        self.streams.insert(
            tag,
            StreamInfo {
                svc: svc.to_string(),
                tkr: tkr.to_string(),
                phase: StreamPhase::Opened,
            },
        );
        self.by_key.insert(key, tag);
        if self.sock.state() == ConnState::Connected {
            self.send_open(tag, svc, tkr);
        }
        tag
    }

    /// Close a stream and forget its record immediately (the close is
    /// not acknowledged on this wire).
    pub fn unsubscribe(&self, svc: &str, tkr: &str) {
        let _g = self.api_mtx.lock().unwrap();
        let key = key_of(svc, tkr);
        let tag = match self.by_key.remove(&key) {
            Some((_, tag)) => tag,
            None => return,
        };
        if let Some(mut e) = self.streams.get_mut(&tag) {
            e.value_mut().phase = StreamPhase::Closed;
        }
        if self.sock.state() == ConnState::Connected {
            let codec = self.codec.lock().unwrap();
            let hdr = BinHdr::new(MsgType::Close, DataType::Control, tag);
            let buf = codec.encode(
                hdr,
                &MsgBody::Item {
                    svc: svc.to_string(),
                    tkr: tkr.to_string(),
                },
            );
            self.sock.write(&buf);
        }
        self.streams.remove(&tag);
        self.cache.remove(tag);
        self.fifo.close(tag);
    }

    /// Switch binary ↔ XML. Refused while output is in flight.
    pub fn set_protocol(&self, p: Protocol) -> anyhow::Result<()> {
        let _g = self.api_mtx.lock().unwrap();
        if self.sock.out_len() > 0 {
            anyhow::bail!("protocol change requires an idle output buffer");
        }
        self.codec.lock().unwrap().set_protocol(p);
        log::info!("[sub] protocol now {:?}", p);
        Ok(())
    }

    pub fn set_schema(&self, xml: &str) -> anyhow::Result<()> {
        let schema = Schema::from_xml(xml)?;
        self.schema.replace(schema);
        Ok(())
    }

    pub fn get_schema(&self) -> Arc<Schema> {
        self.schema.get()
    }

    pub fn cache(&self) -> &RecordCache {
        &self.cache
    }

    pub fn state(&self) -> ConnState {
        self.sock.state()
    }

    /// Block the application thread for events.
    pub fn wait(&self, timeout: Duration) -> usize {
        self.fifo.wait(timeout)
    }

    pub fn get_one_upd(&self) -> Option<Update> {
        self.fifo.get_one_upd()
    }

    /// Mark for exit, close the socket, drain timers, join the I/O
    /// thread. A pending `wait` returns immediately with nothing.
    pub fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sock.disconnect("stop requested");
        self.fifo.stop();
        self.pump.stop();
        self.cache.clear();
    }
}

/// Publisher event surface. Returning false from `on_pub_open`
/// refuses the stream; the channel answers with a dead status.
pub trait PubListener: Send + Sync {
    fn on_connect(&self, _up: bool, _peer: &str) {}
    fn on_pub_open(&self, _svc: &str, _tkr: &str, _tag: u32) -> bool {
        true
    }
    fn on_pub_close(&self, _svc: &str, _tkr: &str) {}
}

struct PubConn {
    sock: Arc<Socket>,
}

pub struct PubChannel {
    cfg: ChanCfg,
    pump: Arc<Pump>,
    codec: Codec,
    listener: Arc<dyn PubListener>,
    conns: DashMap<u64, PubConn>,
    next_conn: AtomicCell<u64>,
    /// (svc|tkr) → (conn, tag) for open streams.
    opens: DashMap<String, (u64, u32)>,
    schema: SchemaRef,
    stopping: AtomicBool,
    local_addr: std::net::SocketAddr,
}

impl PubChannel {
    pub fn bind(
        addr: &str,
        cfg: ChanCfg,
        listener: Arc<dyn PubListener>,
    ) -> anyhow::Result<Arc<PubChannel>> {
        let tcp = smol::block_on(TcpListener::bind(addr))?;
        let local_addr = tcp.local_addr()?;
        let pump = Pump::new();
        pump.start();
        let chan = Arc::new(PubChannel {
            codec: Codec::new(cfg.pack),
            cfg,
            pump: pump.clone(),
            listener,
            conns: DashMap::new(),
            next_conn: AtomicCell::new(1),
            opens: DashMap::new(),
            schema: SchemaRef::new(),
            stopping: AtomicBool::new(false),
            local_addr,
        });
        let chan2 = chan.clone();
        pump.spawn(async move { chan2.accept_loop(tcp).await }).detach();
        log::info!("[pub] listening on {}", local_addr);
        Ok(chan)
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    async fn accept_loop(self: Arc<Self>, tcp: TcpListener) {
        while !self.stopping.load(Ordering::SeqCst) {
            let (stream, peer) = match tcp.accept().await {
                Ok(x) => x,
                Err(e) => {
                    log::warn!("[pub] accept: {}", e);
                    break;
                }
            };
            log::info!("[pub] new connection: {}", peer);
            let id = self.next_conn.fetch_add(1);
            let sock = Arc::new(Socket::new(&self.cfg));
            sock.attach(stream.clone());
            self.conns.insert(id, PubConn { sock: sock.clone() });
            self.listener.on_connect(true, &peer.to_string());
            {
                let sock = sock.clone();
                let wr = stream.clone();
                self.pump
                    .spawn(async move { sock.drain_loop(wr).await })
                    .detach();
            }
            let chan = self.clone();
            self.pump
                .spawn(async move { chan.conn_loop(id, sock, stream).await })
                .detach();
        }
    }

    async fn conn_loop(self: Arc<Self>, id: u64, sock: Arc<Socket>, mut stream: TcpStream) {
        let mut framer = Framer::new(self.cfg.in_buf_init);
        let mut chunk = vec![0u8; 64 * 1024];
        let reason = loop {
            match stream.read(&mut chunk).await {
                Ok(0) => break "peer closed".to_string(),
                Ok(n) => {
                    sock.touch_rx(n);
                    if !framer.feed(&chunk[..n]) {
                        break "input buffer overflow".to_string();
                    }
                    let mut failed = None;
                    while let Some(frame) = framer.next_frame() {
                        if let Err(e) = self.dispatch(id, &sock, &frame) {
                            failed = Some(format!("protocol: {}", e));
                            break;
                        }
                    }
                    if let Some(reason) = failed {
                        break reason;
                    }
                }
                Err(e) => break e.to_string(),
            }
        };
        sock.disconnect(&reason);
        self.conns.remove(&id);
        self.opens.retain(|_, (conn, _)| *conn != id);
        self.listener.on_connect(false, &reason);
    }

    fn dispatch(&self, id: u64, sock: &Arc<Socket>, frame: &[u8]) -> anyhow::Result<()> {
        let wm = self.codec.decode(frame)?;
        match wm.hdr.mt {
            MsgType::Mount => {
                let user = match wm.body {
                    MsgBody::Mount { user, .. } => user,
                    _ => anyhow::bail!("mount without credentials"),
                };
                log::info!("[pub] mount from user={}", user);
                let hdr = BinHdr::new(MsgType::Mount, DataType::Control, 0);
                let ack = MsgBody::Mount {
                    user,
                    auth: String::new(),
                };
                sock.write(&self.codec.encode(hdr, &ack));
                let schema = self.schema.get();
                if !schema.is_empty() {
                    let hdr = BinHdr::new(MsgType::Ctl, DataType::Control, 0);
                    sock.write(&self.codec.encode(hdr, &MsgBody::Text(schema.to_xml())));
                }
            }
            MsgType::Open => {
                let (svc, tkr) = match wm.body {
                    MsgBody::Item { svc, tkr } => (svc, tkr),
                    _ => anyhow::bail!("open without item"),
                };
                let tag = wm.hdr.tag;
                // register before the callback so the application can
                // publish from inside it
                self.opens.insert(key_of(&svc, &tkr), (id, tag));
                if !self.listener.on_pub_open(&svc, &tkr, tag) {
                    self.opens.remove(&key_of(&svc, &tkr));
                    let hdr = BinHdr::new(MsgType::Status, DataType::Status, tag);
                    let body = MsgBody::Status {
                        state: StreamState::Dead,
                        text: format!("unknown service {}", svc),
                    };
                    sock.write(&self.codec.encode(hdr, &body));
                }
            }
            MsgType::Close => {
                if let MsgBody::Item { svc, tkr } = wm.body {
                    self.opens.remove(&key_of(&svc, &tkr));
                    self.listener.on_pub_close(&svc, &tkr);
                }
            }
            MsgType::Ping => {
                if sock.idle_tx() >= self.cfg.hb_interval {
                    sock.write(&self.codec.ping());
                }
            }
            other => log::debug!("[pub] ignoring {:?}", other),
        }
        Ok(())
    }

    /// Write an image or update through the open stream for
    /// (service, ticker). False when nothing is open or the output
    /// buffer refused the frame.
    pub fn publish(&self, svc: &str, tkr: &str, fields: &[Field], image: bool) -> bool {
        let (conn, tag) = match self.opens.get(&key_of(svc, tkr)) {
            Some(e) => *e.value(),
            None => return false,
        };
        let conn = match self.conns.get(&conn) {
            Some(c) => c.sock.clone(),
            None => return false,
        };
        let (mt, dt) = if image {
            (MsgType::Image, DataType::Image)
        } else {
            (MsgType::Update, DataType::Update)
        };
        let hdr = BinHdr::new(mt, dt, tag);
        let buf = self.codec.encode(hdr, &MsgBody::Fields(fields.to_vec()));
        conn.stats.n_msg_tx.fetch_add(1, Ordering::Relaxed);
        conn.write(&buf)
    }

    /// Deliver a status (stale/dead/recovering) on an open stream.
    pub fn publish_status(&self, svc: &str, tkr: &str, state: StreamState, text: &str) -> bool {
        let (conn, tag) = match self.opens.get(&key_of(svc, tkr)) {
            Some(e) => *e.value(),
            None => return false,
        };
        let conn = match self.conns.get(&conn) {
            Some(c) => c.sock.clone(),
            None => return false,
        };
        let hdr = BinHdr::new(MsgType::Status, DataType::Status, tag);
        let body = MsgBody::Status {
            state,
            text: text.to_string(),
        };
        conn.write(&self.codec.encode(hdr, &body))
    }

    /// Install the dictionary announced to mounting subscribers.
    pub fn set_schema(&self, xml: &str) -> anyhow::Result<()> {
        let schema = Schema::from_xml(xml)?;
        self.schema.replace(schema);
        let text = self.schema.get().to_xml();
        for e in self.conns.iter() {
            let hdr = BinHdr::new(MsgType::Ctl, DataType::Control, 0);
            e.value().sock.write(&self.codec.encode(hdr, &MsgBody::Text(text.clone())));
        }
        Ok(())
    }

    /// Announce service states ("svc:up;svc:down") to every peer.
    pub fn announce_services(&self, list: &str) {
        for e in self.conns.iter() {
            let hdr = BinHdr::new(MsgType::Ctl, DataType::Control, 0);
            e.value()
                .sock
                .write(&self.codec.encode(hdr, &MsgBody::Text(list.to_string())));
        }
    }

    pub fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        for e in self.conns.iter() {
            e.value().sock.disconnect("stop requested");
        }
        self.conns.clear();
        self.opens.clear();
        self.pump.stop();
    }
}
