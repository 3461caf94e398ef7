//! Append-only tape reader.
//!
//! A tape is written by the server-resident recorder and consumed
//! read-only here: fixed header, per-stream record descriptors, a
//! per-second daily index of file offsets, then length-prefixed
//! timestamped messages. The header records the writer's byte order
//! and word size; a tape cut on the other endianness is read through
//! swapping accessors instead of being rejected. All tape times are
//! normalized to unix nanoseconds at this boundary.

use std::collections::{HashMap, HashSet};

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use chrono::Timelike;

use crate::codec::{Codec, Field, MsgBody};
use crate::error::{StoreError, TapeError};
use crate::mmap::MappedStore;
use crate::util::local_from_unix_ns;

pub const TAPE_SIG: &str = "005 gateaRecorder";
pub const TAPE_SIG_LEGACY: &str = "004 gateaRecorder";
pub const TAPE_NAMELEN: usize = 256;
pub const SECPERDAY: u32 = 86_400;

pub const HDR_FIXED: usize = 212;
pub const RECDESC_SIZ: usize = 64 + TAPE_NAMELEN + 5 * 8 + 2 * 4;
/// Per-message header: len, dbIdx, tv_sec, tv_usec, nUpd (4 each),
/// nFldMod, bLast4 (1 each), last (8).
pub const MSG_HDR_SIZ: usize = 30;

const DEFAULT_WIN: u64 = 64 * 1024 * 1024;

/// Fixed tape header with endian-dispatching accessors. The raw bytes
/// are snapped at open so the view is stable while the writer runs.
#[derive(Clone)]
pub struct TapeHeader {
    raw: Vec<u8>,
    big: bool,
}

macro_rules! accessor {
    ($name:ident, u64, $off:expr) => {
        pub fn $name(&self) -> u64 {
            self.rd_u64($off)
        }
    };
    ($name:ident, u32, $off:expr) => {
        pub fn $name(&self) -> u32 {
            self.rd_u32($off)
        }
    };
    ($name:ident, u16, $off:expr) => {
        pub fn $name(&self) -> u16 {
            self.rd_u16($off)
        }
    };
}

impl TapeHeader {
    fn new(raw: Vec<u8>) -> TapeHeader {
        let big = raw[160] == 1;
        TapeHeader { raw, big }
    }

    fn rd_u64(&self, off: usize) -> u64 {
        if self.big {
            BigEndian::read_u64(&self.raw[off..off + 8])
        } else {
            LittleEndian::read_u64(&self.raw[off..off + 8])
        }
    }

    fn rd_u32(&self, off: usize) -> u32 {
        if self.big {
            BigEndian::read_u32(&self.raw[off..off + 4])
        } else {
            LittleEndian::read_u32(&self.raw[off..off + 4])
        }
    }

    fn rd_u16(&self, off: usize) -> u16 {
        if self.big {
            BigEndian::read_u16(&self.raw[off..off + 2])
        } else {
            LittleEndian::read_u16(&self.raw[off..off + 2])
        }
    }

    pub fn signature(&self) -> String {
        cstr(&self.raw, 0, 24)
    }

    pub fn version(&self) -> String {
        cstr(&self.raw, 24, 80)
    }

    accessor!(file_siz, u64, 104);
    accessor!(hdr_siz, u64, 112);
    accessor!(cur_loc, u64, 120);
    accessor!(win_siz, u64, 128);
    accessor!(t_create, u64, 136);
    accessor!(t_eod, u64, 144);
    accessor!(cur_time_ns, u64, 152);

    pub fn is_big_endian(&self) -> bool {
        self.big
    }

    pub fn word_siz(&self) -> u8 {
        self.raw[161]
    }

    accessor!(sec_per_idx, u32, 164);
    accessor!(num_sec_idx, u32, 168);
    accessor!(num_rec, u32, 172);
    accessor!(max_rec, u32, 176);
    accessor!(msg_proto, u16, 180);
    accessor!(wire_proto, u16, 182);
    accessor!(n_msg, u64, 188);
    accessor!(n_byte, u64, 196);
    accessor!(t_msg_ns, u64, 204);
}

fn cstr(buf: &[u8], off: usize, max: usize) -> String {
    let raw = &buf[off..off + max];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(max);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Per-stream descriptor from the header's record table.
#[derive(Debug, Clone, PartialEq)]
pub struct TapeRecDesc {
    pub svc: String,
    pub tkr: String,
    pub n_msg: u64,
    pub n_byte: u64,
    pub loc: u64,
    pub loc_img: u64,
    pub t_msg_ns: u64,
    pub db_idx: i32,
    pub stream_id: i32,
}

/// One tape message: metadata plus a zero-copy view of the payload
/// bytes inside the mapped window.
#[derive(Debug)]
pub struct TapeMsg<'a> {
    pub stream_id: u32,
    pub t_ns: u64,
    pub n_upd: u32,
    pub n_fld_mod: u8,
    pub last: f64,
    pub msg_proto: u16,
    pub wire_proto: u16,
    pub data: &'a [u8],
}

struct MsgHdr {
    len: u32,
    db_idx: u32,
    tv_sec: u32,
    tv_usec: u32,
    n_upd: u32,
    n_fld_mod: u8,
    last: f64,
}

impl MsgHdr {
    fn t_ns(&self) -> u64 {
        self.tv_sec as u64 * 1_000_000_000 + self.tv_usec as u64 * 1_000
    }
}

fn read_msg_hdr(buf: &[u8], big: bool) -> MsgHdr {
    let rd32 = |off: usize| {
        if big {
            BigEndian::read_u32(&buf[off..off + 4])
        } else {
            LittleEndian::read_u32(&buf[off..off + 4])
        }
    };
    // bLast4 marks a last-value written as a 4-byte float
    let last = if buf[21] != 0 {
        f32::from_bits(rd32(22)) as f64
    } else if big {
        f64::from_bits(BigEndian::read_u64(&buf[22..30]))
    } else {
        f64::from_bits(LittleEndian::read_u64(&buf[22..30]))
    };
    MsgHdr {
        len: rd32(0),
        db_idx: rd32(4),
        tv_sec: rd32(8),
        tv_usec: rd32(12),
        n_upd: rd32(16),
        n_fld_mod: buf[20],
        last,
    }
}

pub struct TapeReader {
    store: MappedStore,
    hdr: TapeHeader,
    recs: Vec<TapeRecDesc>,
    idx: Vec<u64>,
    pos: u64,
    win_siz: u64,
}

impl TapeReader {
    pub fn open(path: &str) -> Result<TapeReader, StoreError> {
        let mut store = MappedStore::open(path)?;
        if store.file_len() < HDR_FIXED as u64 {
            return Err(StoreError::Truncated {
                path: path.to_string(),
                need: HDR_FIXED as u64,
                have: store.file_len(),
            });
        }
        store.map(0, HDR_FIXED as u64)?;
        let hdr = TapeHeader::new(store.data()[..HDR_FIXED].to_vec());
        let sig = hdr.signature();
        if sig != TAPE_SIG && sig != TAPE_SIG_LEGACY {
            return Err(StoreError::Signature {
                path: path.to_string(),
                got: sig,
            });
        }
        if hdr.file_siz() > store.file_len() || hdr.cur_loc() > hdr.file_siz() {
            return Err(StoreError::Truncated {
                path: path.to_string(),
                need: hdr.file_siz(),
                have: store.file_len(),
            });
        }
        let tbl_len =
            hdr.max_rec() as u64 * RECDESC_SIZ as u64 + hdr.num_sec_idx() as u64 * 8;
        store.map(HDR_FIXED as u64, tbl_len)?;
        let big = hdr.is_big_endian();
        let data = store.data();
        let mut recs = Vec::with_capacity(hdr.num_rec() as usize);
        let mut off = 0usize;
        for _ in 0..hdr.num_rec().min(hdr.max_rec()) {
            let rd64 = |o: usize| {
                if big {
                    BigEndian::read_u64(&data[o..o + 8])
                } else {
                    LittleEndian::read_u64(&data[o..o + 8])
                }
            };
            let rd32 = |o: usize| {
                if big {
                    BigEndian::read_i32(&data[o..o + 4])
                } else {
                    LittleEndian::read_i32(&data[o..o + 4])
                }
            };
            let base = off + 64 + TAPE_NAMELEN;
            recs.push(TapeRecDesc {
                svc: cstr(data, off, 64),
                tkr: cstr(data, off + 64, TAPE_NAMELEN),
                n_msg: rd64(base),
                n_byte: rd64(base + 8),
                loc: rd64(base + 16),
                loc_img: rd64(base + 24),
                t_msg_ns: rd64(base + 32),
                db_idx: rd32(base + 40),
                stream_id: rd32(base + 44),
            });
            off += RECDESC_SIZ;
        }
        let idx_off = hdr.max_rec() as usize * RECDESC_SIZ;
        let mut idx = Vec::with_capacity(hdr.num_sec_idx() as usize);
        for i in 0..hdr.num_sec_idx() as usize {
            let o = idx_off + i * 8;
            idx.push(if big {
                BigEndian::read_u64(&data[o..o + 8])
            } else {
                LittleEndian::read_u64(&data[o..o + 8])
            });
        }
        for w in idx.windows(2) {
            if w[1] != 0 && w[0] > w[1] {
                log::warn!("[tape={}] daily index not monotone", path);
                break;
            }
        }
        let win_siz = match hdr.win_siz() {
            0 => DEFAULT_WIN,
            w => w,
        };
        log::info!(
            "[tape={}] {} msgs, {} streams, endian={}, word={}",
            path,
            hdr.n_msg(),
            recs.len(),
            if big { "big" } else { "little" },
            hdr.word_siz()
        );
        let mut rdr = TapeReader {
            store,
            hdr,
            recs,
            idx,
            pos: 0,
            win_siz,
        };
        rdr.rewind()?;
        Ok(rdr)
    }

    pub fn header(&self) -> &TapeHeader {
        &self.hdr
    }

    /// Enumerate the per-stream record descriptors.
    pub fn query(&self) -> &[TapeRecDesc] {
        &self.recs
    }

    /// The per-second (or per-`sec_per_idx`) offset index.
    pub fn daily_index(&self) -> &[u64] {
        &self.idx
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }

    fn data_start(&self) -> u64 {
        self.hdr.hdr_siz()
    }

    fn data_end(&self) -> u64 {
        self.hdr.cur_loc()
    }

    /// Re-snap the header: an actively-written tape advances its
    /// write offset and readers observe new bytes here.
    pub fn refresh(&mut self) -> Result<u64, StoreError> {
        self.store.refresh_len()?;
        let keep_pos = self.pos;
        self.store.map(0, HDR_FIXED as u64)?;
        self.hdr = TapeHeader::new(self.store.data()[..HDR_FIXED].to_vec());
        self.pos = keep_pos;
        Ok(self.data_end())
    }

    fn ensure(&mut self, need: u64) -> Result<(), TapeError> {
        let have_from = self.store.offset();
        let have_to = have_from + self.store.len();
        if self.pos >= have_from && self.pos + need <= have_to {
            return Ok(());
        }
        let win = self.win_siz.max(need);
        self.store
            .map(self.pos, win)
            .map_err(|_| TapeError::BadPosition(self.pos))?;
        if self.store.len() < need {
            return Err(TapeError::EndOfTape);
        }
        Ok(())
    }

    /// Position after the header (or at `pos`) and return the next
    /// message's timestamp, 0 when the tape is empty.
    pub fn rewind(&mut self) -> Result<u64, StoreError> {
        self.pos = self.data_start();
        Ok(self.peek_ts())
    }

    pub fn rewind_to_pos(&mut self, pos: u64) -> u64 {
        if pos < self.data_start() || pos >= self.data_end() {
            self.pos = self.data_end();
            return 0;
        }
        self.pos = pos;
        self.peek_ts()
    }

    fn peek_ts(&mut self) -> u64 {
        match self.peek_hdr() {
            Some(h) => h.t_ns(),
            None => 0,
        }
    }

    fn peek_hdr(&mut self) -> Option<MsgHdr> {
        if self.pos + MSG_HDR_SIZ as u64 > self.data_end() {
            return None;
        }
        if self.ensure(MSG_HDR_SIZ as u64).is_err() {
            return None;
        }
        let off = (self.pos - self.store.offset()) as usize;
        let h = read_msg_hdr(
            &self.store.data()[off..off + MSG_HDR_SIZ],
            self.hdr.is_big_endian(),
        );
        if (h.len as usize) < MSG_HDR_SIZ {
            return None;
        }
        Some(h)
    }

    /// Seek by wall-clock time: hop to the daily-index bucket for the
    /// target's second-of-day, then walk forward viewing messages
    /// until the first with timestamp ≥ target. Returns that
    /// message's timestamp, 0 when the target is past the last one.
    pub fn rewind_to(&mut self, t_ns: u64) -> u64 {
        let lt = local_from_unix_ns(t_ns);
        let sec_of_day = lt.num_seconds_from_midnight();
        let per = self.hdr.sec_per_idx().max(1);
        let bucket = ((sec_of_day / per) as usize).min(self.idx.len().saturating_sub(1));
        let hop = self.idx.get(bucket).copied().unwrap_or(0);
        self.pos = hop.max(self.data_start());
        loop {
            match self.peek_hdr() {
                None => return 0,
                Some(h) => {
                    if h.t_ns() >= t_ns {
                        return h.t_ns();
                    }
                    self.pos += h.len as u64;
                }
            }
        }
    }

    /// Decode one message and advance. The payload is a view into the
    /// mapped window, valid until the next call re-maps it.
    pub fn read(&mut self) -> Result<TapeMsg<'_>, TapeError> {
        if self.pos + MSG_HDR_SIZ as u64 > self.data_end() {
            return Err(TapeError::EndOfTape);
        }
        self.ensure(MSG_HDR_SIZ as u64)?;
        let off = (self.pos - self.store.offset()) as usize;
        let h = read_msg_hdr(
            &self.store.data()[off..off + MSG_HDR_SIZ],
            self.hdr.is_big_endian(),
        );
        if (h.len as usize) < MSG_HDR_SIZ || self.pos + h.len as u64 > self.data_end() {
            return Err(TapeError::BadPosition(self.pos));
        }
        self.ensure(h.len as u64)?;
        let off = (self.pos - self.store.offset()) as usize;
        self.pos += h.len as u64;
        let data = &self.store.data()[off + MSG_HDR_SIZ..off + h.len as usize];
        Ok(TapeMsg {
            stream_id: h.db_idx,
            t_ns: h.t_ns(),
            n_upd: h.n_upd,
            n_fld_mod: h.n_fld_mod,
            last: h.last,
            msg_proto: self.hdr.msg_proto(),
            wire_proto: self.hdr.wire_proto(),
            data,
        })
    }
}

/// A bounded, optionally sampled query over a tape.
pub struct TapeSlice {
    by_time: bool,
    t0: u64,
    t1: u64,
    interval_ns: u64,
    fid_set: HashSet<i32>,
    off0: u64,
    n_msg: usize,
    /// Per-stream last value of every requested field.
    lvc: HashMap<u32, HashMap<i32, Field>>,
}

/// One sampled (or raw) slice emission.
#[derive(Debug, Clone)]
pub struct SliceSample {
    pub t_ns: u64,
    pub stream_id: u32,
    pub fields: Vec<Field>,
}

/// "HH:MM:SS[.mmm]" against today's local midnight, in unix ns.
pub fn day_time_ns(s: &str) -> anyhow::Result<u64> {
    let (hms, ms) = match s.find('.') {
        Some(dot) => (&s[..dot], s[dot + 1..].parse::<u64>().unwrap_or(0)),
        None => (s, 0),
    };
    let parts: Vec<u32> = hms
        .trim()
        .split(':')
        .map(|p| p.parse::<u32>())
        .collect::<Result<_, _>>()?;
    anyhow::ensure!(parts.len() == 3, "expected HH:MM:SS[.mmm], got {:?}", s);
    let now = chrono::Local::now();
    let t = crate::util::midnight_of(now)
        + chrono::Duration::seconds((parts[0] * 3600 + parts[1] * 60 + parts[2]) as i64);
    Ok(t.timestamp() as u64 * 1_000_000_000 + ms * 1_000_000)
}

impl TapeSlice {
    /// Window form the dump tools take on the command line:
    /// `"09:30:00 - 09:35:00"`.
    pub fn by_time_str(window: &str, interval_s: u32, fids: &[i32]) -> anyhow::Result<TapeSlice> {
        let mut it = window.splitn(2, '-');
        let t0 = day_time_ns(it.next().unwrap_or(""))?;
        let t1 = day_time_ns(it.next().unwrap_or(""))?;
        anyhow::ensure!(t0 <= t1, "window ends before it starts");
        Ok(TapeSlice::by_time(t0, t1, interval_s, fids))
    }

    pub fn by_time(t0_ns: u64, t1_ns: u64, interval_s: u32, fids: &[i32]) -> TapeSlice {
        TapeSlice {
            by_time: true,
            t0: t0_ns,
            t1: t1_ns,
            interval_ns: interval_s as u64 * 1_000_000_000,
            fid_set: fids.iter().copied().collect(),
            off0: 0,
            n_msg: 0,
            lvc: HashMap::new(),
        }
    }

    pub fn by_offset(off0: u64, n_msg: usize) -> TapeSlice {
        TapeSlice {
            by_time: false,
            t0: 0,
            t1: u64::max_value(),
            interval_ns: 0,
            fid_set: HashSet::new(),
            off0,
            n_msg,
            lvc: HashMap::new(),
        }
    }

    pub fn is_sampled(&self) -> bool {
        self.by_time && self.interval_ns > 0
    }

    pub fn in_range(&self, t_ns: u64) -> bool {
        t_ns >= self.t0 && t_ns <= self.t1
    }

    fn keep(&self, f: &Field) -> bool {
        self.fid_set.is_empty() || self.fid_set.contains(&f.fid)
    }

    fn cache(&mut self, stream: u32, fields: &[Field]) {
        let slot = self.lvc.entry(stream).or_insert_with(HashMap::new);
        for f in fields {
            slot.insert(f.fid, f.clone());
        }
    }

    fn emit_tick(&self, t_ns: u64, out: &mut Vec<SliceSample>) {
        let mut streams: Vec<u32> = self.lvc.keys().copied().collect();
        streams.sort();
        for sid in streams {
            let slot = &self.lvc[&sid];
            let mut fields: Vec<Field> = slot.values().cloned().collect();
            fields.sort_by_key(|f| f.fid);
            out.push(SliceSample {
                t_ns,
                stream_id: sid,
                fields,
            });
        }
    }

    /// Drive the slice over `reader`, collecting samples. Sampled
    /// slices deliver the most-recent value of every requested field
    /// at each tick even when the update rate is lower.
    pub fn pump(&mut self, reader: &mut TapeReader, codec: &Codec) -> Vec<SliceSample> {
        let mut out = Vec::new();
        if self.by_time {
            if reader.rewind_to(self.t0) == 0 {
                return out;
            }
        } else if reader.rewind_to_pos(self.off0) == 0 {
            return out;
        }
        let mut next_tick = self.t0.saturating_add(self.interval_ns);
        let mut n_read = 0usize;
        loop {
            if !self.by_time && n_read >= self.n_msg {
                break;
            }
            let (stream_id, t_ns, fields) = match reader.read() {
                Err(_) => break,
                Ok(msg) => {
                    let fields = match codec.decode(msg.data) {
                        Ok(wm) => match wm.body {
                            MsgBody::Fields(fl) => fl,
                            _ => Vec::new(),
                        },
                        Err(e) => {
                            log::warn!("[slice] undecodable payload: {}", e);
                            Vec::new()
                        }
                    };
                    (msg.stream_id, msg.t_ns, fields)
                }
            };
            n_read += 1;
            if self.by_time && t_ns > self.t1 {
                break;
            }
            let kept: Vec<Field> = fields.into_iter().filter(|f| self.keep(f)).collect();
            if self.is_sampled() {
                while t_ns >= next_tick && next_tick <= self.t1 {
                    self.emit_tick(next_tick, &mut out);
                    next_tick += self.interval_ns;
                }
                self.cache(stream_id, &kept);
            } else if !kept.is_empty() || !self.by_time {
                out.push(SliceSample {
                    t_ns,
                    stream_id,
                    fields: kept,
                });
            }
        }
        if self.is_sampled() {
            while next_tick <= self.t1 {
                self.emit_tick(next_tick, &mut out);
                next_tick += self.interval_ns;
            }
        }
        out
    }
}

#[cfg(test)]
pub(crate) mod testgen {
    use super::*;
    use byteorder::WriteBytesExt;
    use std::io::Write;

    pub struct TapeFixture<'a> {
        pub big: bool,
        pub sec_per_idx: u32,
        pub recs: Vec<(&'a str, &'a str)>,
        /// (db_idx, unix ns, payload)
        pub msgs: Vec<(u32, u64, Vec<u8>)>,
    }

    fn pad(buf: &mut Vec<u8>, s: &str, width: usize) {
        let b = s.as_bytes();
        buf.extend_from_slice(&b[..b.len().min(width)]);
        buf.resize(buf.len() + width - b.len().min(width), 0);
    }

    macro_rules! w64 {
        ($buf:expr, $big:expr, $v:expr) => {
            if $big {
                $buf.write_u64::<BigEndian>($v).unwrap()
            } else {
                $buf.write_u64::<LittleEndian>($v).unwrap()
            }
        };
    }
    macro_rules! w32 {
        ($buf:expr, $big:expr, $v:expr) => {
            if $big {
                $buf.write_u32::<BigEndian>($v).unwrap()
            } else {
                $buf.write_u32::<LittleEndian>($v).unwrap()
            }
        };
    }

    pub fn write_tape(path: &std::path::Path, fix: &TapeFixture) {
        let big = fix.big;
        let num_sec_idx = SECPERDAY / fix.sec_per_idx;
        let max_rec = fix.recs.len() as u32;
        let hdr_siz = HDR_FIXED as u64
            + max_rec as u64 * RECDESC_SIZ as u64
            + num_sec_idx as u64 * 8;

        // message region + per-second index
        let mut body = Vec::new();
        let mut idx = vec![0u64; num_sec_idx as usize];
        let mut last_loc = hdr_siz;
        let mut prev_bucket = 0usize;
        for (db_idx, t_ns, payload) in &fix.msgs {
            let loc = hdr_siz + body.len() as u64;
            let lt = crate::util::local_from_unix_ns(*t_ns);
            let bucket =
                (lt.num_seconds_from_midnight() / fix.sec_per_idx) as usize;
            for b in prev_bucket..=bucket.min(idx.len() - 1) {
                if idx[b] == 0 {
                    idx[b] = loc;
                }
            }
            prev_bucket = bucket.min(idx.len() - 1) + 1;
            let len = (MSG_HDR_SIZ + payload.len()) as u32;
            w32!(body, big, len);
            w32!(body, big, *db_idx);
            w32!(body, big, (t_ns / 1_000_000_000) as u32);
            w32!(body, big, ((t_ns % 1_000_000_000) / 1_000) as u32);
            w32!(body, big, 1); // nUpd
            body.push(0); // nFldMod
            body.push(0); // bLast4
            w64!(body, big, 0f64.to_bits()); // last
            body.extend_from_slice(payload);
            last_loc = hdr_siz + body.len() as u64;
        }
        // buckets after the final message keep the last offset
        for b in prev_bucket..idx.len() {
            if idx[b] == 0 {
                idx[b] = last_loc;
            }
        }

        let mut out = Vec::new();
        pad(&mut out, TAPE_SIG, 24);
        pad(&mut out, "tickwire test tape", 80);
        w64!(out, big, hdr_siz + body.len() as u64); // file_siz
        w64!(out, big, hdr_siz);
        w64!(out, big, hdr_siz + body.len() as u64); // cur_loc
        w64!(out, big, 0); // win_siz -> default
        w64!(out, big, 1_754_000_000_000_000_000); // t_create
        w64!(out, big, 0); // t_eod
        w64!(out, big, fix.msgs.last().map(|m| m.1).unwrap_or(0));
        out.push(if big { 1 } else { 0 });
        out.push(8); // word size
        out.extend_from_slice(&[0, 0]);
        w32!(out, big, fix.sec_per_idx);
        w32!(out, big, num_sec_idx);
        w32!(out, big, fix.recs.len() as u32);
        w32!(out, big, max_rec);
        // msg/wire protocol (binary)
        if big {
            out.write_u16::<BigEndian>(1).unwrap();
            out.write_u16::<BigEndian>(1).unwrap();
        } else {
            out.write_u16::<LittleEndian>(1).unwrap();
            out.write_u16::<LittleEndian>(1).unwrap();
        }
        w32!(out, big, 0); // pad2
        w64!(out, big, fix.msgs.len() as u64); // n_msg
        w64!(out, big, body.len() as u64); // n_byte
        w64!(out, big, fix.msgs.last().map(|m| m.1).unwrap_or(0));
        assert_eq!(out.len(), HDR_FIXED);

        for (i, (svc, tkr)) in fix.recs.iter().enumerate() {
            pad(&mut out, svc, 64);
            pad(&mut out, tkr, TAPE_NAMELEN);
            let n = fix.msgs.iter().filter(|m| m.0 == i as u32).count() as u64;
            w64!(out, big, n); // n_msg
            w64!(out, big, 0); // n_byte
            w64!(out, big, 0); // loc
            w64!(out, big, 0); // loc_img
            w64!(out, big, 0); // t_msg_ns
            w32!(out, big, i as u32); // db_idx
            w32!(out, big, (100 + i) as u32); // stream_id
        }
        for v in &idx {
            w64!(out, big, *v);
        }
        out.extend_from_slice(&body);
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(&out).unwrap();
    }

    /// Unix ns for today's local HH:MM:SS.mmm — keeps fixtures inside
    /// the daily index whatever day the test runs.
    pub fn today_at(h: u32, m: u32, s: u32, ms: u32) -> u64 {
        use chrono::Local;
        let t = crate::util::midnight_of(Local::now())
            + chrono::Duration::seconds((h * 3600 + m * 60 + s) as i64)
            + chrono::Duration::milliseconds(ms as i64);
        t.timestamp() as u64 * 1_000_000_000 + (ms as u64 % 1000) * 1_000_000
    }
}

#[cfg(test)]
mod tests {
    use super::testgen::*;
    use super::*;
    use crate::codec::{BinHdr, DataType, MsgType, Value};

    fn frame(fields: Vec<Field>) -> Vec<u8> {
        let codec = Codec::new(true);
        codec.encode(
            BinHdr::new(MsgType::Update, DataType::Update, 9),
            &MsgBody::Fields(fields),
        )
    }

    fn fixture(big: bool) -> (tempfile::TempDir, TapeReader) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("day.tape");
        write_tape(
            &path,
            &TapeFixture {
                big,
                sec_per_idx: 1,
                recs: vec![("IDN", "IBM"), ("IDN", "MSFT")],
                msgs: vec![
                    (
                        0,
                        today_at(9, 30, 0, 0),
                        frame(vec![Field::new(25, Value::Double(185.10))]),
                    ),
                    (
                        0,
                        today_at(9, 30, 0, 500),
                        frame(vec![Field::new(25, Value::Double(185.25))]),
                    ),
                    (
                        1,
                        today_at(9, 30, 1, 0),
                        frame(vec![Field::new(25, Value::Double(415.00))]),
                    ),
                ],
            },
        );
        let rdr = TapeReader::open(path.to_str().unwrap()).unwrap();
        (dir, rdr)
    }

    #[test]
    fn rewind_returns_first_timestamp() {
        let (_d, mut rdr) = fixture(false);
        let ts = rdr.rewind().unwrap();
        assert_eq!(ts, today_at(9, 30, 0, 0));
    }

    #[test]
    fn read_streams_forward_and_ends() {
        let (_d, mut rdr) = fixture(false);
        rdr.rewind().unwrap();
        let mut seen = Vec::new();
        loop {
            match rdr.read() {
                Ok(m) => seen.push((m.stream_id, m.t_ns, m.data.to_vec())),
                Err(TapeError::EndOfTape) => break,
                Err(e) => panic!("{}", e),
            }
        }
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].0, 0);
        assert_eq!(seen[2].0, 1);
        assert!(seen[0].1 < seen[1].1 && seen[1].1 < seen[2].1);
        // payload survives byte-for-byte
        let codec = Codec::new(true);
        let wm = codec.decode(&seen[2].2).unwrap();
        assert_eq!(
            wm.body,
            MsgBody::Fields(vec![Field::new(25, Value::Double(415.00))])
        );
    }

    #[test]
    fn rewind_to_seeks_between_messages() {
        let (_d, mut rdr) = fixture(false);
        let ts = rdr.rewind_to(today_at(9, 30, 0, 600));
        assert_eq!(ts, today_at(9, 30, 1, 0));
        let msg = rdr.read().unwrap();
        assert_eq!(msg.t_ns, today_at(9, 30, 1, 0));
        assert_eq!(msg.stream_id, 1);
    }

    #[test]
    fn rewind_to_past_end_returns_zero() {
        let (_d, mut rdr) = fixture(false);
        assert_eq!(rdr.rewind_to(today_at(18, 0, 0, 0)), 0);
        assert!(matches!(rdr.read(), Err(TapeError::EndOfTape)));
    }

    #[test]
    fn rewind_to_before_first_lands_on_first() {
        let (_d, mut rdr) = fixture(false);
        let ts = rdr.rewind_to(today_at(1, 0, 0, 0));
        assert_eq!(ts, today_at(9, 30, 0, 0));
    }

    #[test]
    fn cross_endian_tape_reads_identically() {
        let (_dl, mut little) = fixture(false);
        let (_db, mut big) = fixture(true);
        assert!(big.header().is_big_endian());
        assert_eq!(little.header().n_msg(), big.header().n_msg());
        assert_eq!(little.header().hdr_siz(), big.header().hdr_siz());
        assert_eq!(little.header().sec_per_idx(), big.header().sec_per_idx());
        assert_eq!(little.query(), big.query());
        little.rewind().unwrap();
        big.rewind().unwrap();
        loop {
            match (little.read(), big.read()) {
                (Ok(a), Ok(b)) => {
                    assert_eq!(a.t_ns, b.t_ns);
                    assert_eq!(a.stream_id, b.stream_id);
                    assert_eq!(a.data, b.data);
                }
                (Err(TapeError::EndOfTape), Err(TapeError::EndOfTape)) => break,
                other => panic!("diverged: {:?}", other.0.is_ok()),
            }
        }
    }

    #[test]
    fn time_window_parses() {
        let slice = TapeSlice::by_time_str("09:30:00 - 09:35:00", 5, &[25]).unwrap();
        assert!(slice.is_sampled());
        assert_eq!(slice.t1 - slice.t0, 300 * 1_000_000_000);
        assert!(TapeSlice::by_time_str("09:35:00 - 09:30:00", 5, &[]).is_err());
        assert!(TapeSlice::by_time_str("bogus", 5, &[]).is_err());
    }

    #[test]
    fn daily_index_is_monotone() {
        let (_d, rdr) = fixture(false);
        let idx = rdr.daily_index();
        assert_eq!(idx.len(), SECPERDAY as usize);
        for w in idx.windows(2) {
            assert!(w[0] <= w[1], "index regressed: {} > {}", w[0], w[1]);
        }
        assert!(idx[0] >= rdr.header().hdr_siz());
    }

    #[test]
    fn query_surfaces_stream_descriptors() {
        let (_d, rdr) = fixture(false);
        let q = rdr.query();
        assert_eq!(q.len(), 2);
        assert_eq!(q[0].svc, "IDN");
        assert_eq!(q[0].tkr, "IBM");
        assert_eq!(q[0].n_msg, 2);
        assert_eq!(q[1].tkr, "MSFT");
        assert_eq!(q[1].stream_id, 101);
    }

    #[test]
    fn slice_by_offset_counts_messages() {
        let (_d, mut rdr) = fixture(false);
        let start = rdr.header().hdr_siz();
        let codec = Codec::new(true);
        let mut slice = TapeSlice::by_offset(start, 2);
        let out = slice.pump(&mut rdr, &codec);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].fields[0].value, Value::Double(185.10));
    }

    #[test]
    fn sampled_slice_carries_last_value_forward() {
        let (_d, mut rdr) = fixture(false);
        let codec = Codec::new(true);
        // 4-second window, 1-second ticks, only fid 25
        let mut slice = TapeSlice::by_time(
            today_at(9, 30, 0, 0),
            today_at(9, 30, 3, 0),
            1,
            &[25],
        );
        let out = slice.pump(&mut rdr, &codec);
        // ticks at 09:30:01/02/03; stream 0 repeats its 185.25 while idle
        let s0: Vec<&SliceSample> = out.iter().filter(|s| s.stream_id == 0).collect();
        assert_eq!(s0.len(), 3);
        assert!(s0
            .iter()
            .all(|s| s.fields[0].value == Value::Double(185.25)));
        let s1: Vec<&SliceSample> = out.iter().filter(|s| s.stream_id == 1).collect();
        assert_eq!(s1.len(), 2);
        assert_eq!(s1[0].t_ns, today_at(9, 30, 2, 0));
    }
}
