//! Chart database reader: per-(service, ticker, fid) circular float
//! series at a fixed interval, wrapping at midnight.

use std::collections::HashMap;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::StoreError;
use crate::mmap::MappedStore;

pub const CDB_SIG: &str = "002 ChartDb";
pub const CDB_SVCLEN: usize = 64;
pub const CDB_TKRLEN: usize = 256;
pub const SECPERDAY: u32 = 86_400;

const HDR_SIZ: usize = 40;
const REC_FIXED: usize = CDB_SVCLEN + CDB_TKRLEN + 5 * 4 + 6 * 4;

fn rd_str(buf: &[u8], off: usize, max: usize) -> String {
    let raw = &buf[off..off + max];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(max);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Query row: one record's identity and shape.
#[derive(Debug, Clone, PartialEq)]
pub struct ChartRecord {
    pub svc: String,
    pub tkr: String,
    pub fid: i32,
    pub interval: u32,
    pub n_tck: u32,
    pub n_upd: u32,
}

/// Snapshot of one record's series.
#[derive(Debug, Clone)]
pub struct ChartView {
    pub svc: String,
    pub tkr: String,
    pub fid: i32,
    pub interval: u32,
    pub cur_tck: usize,
    pub t_upd: u32,
    pub values: Vec<f32>,
}

impl ChartView {
    /// Seconds since local midnight of sample slot `i`.
    pub fn sample_time(&self, i: usize) -> u32 {
        i as u32 * self.interval
    }
}

pub struct ChartDb {
    store: MappedStore,
    date: u32,
    recs: HashMap<String, usize>,
}

fn key_of(svc: &str, tkr: &str, fid: i32) -> String {
    format!("{}|{}|{}", svc, tkr, fid)
}

impl ChartDb {
    pub fn open(path: &str) -> Result<ChartDb, StoreError> {
        let store = MappedStore::open(path)?;
        let data = store.data();
        if data.len() < HDR_SIZ {
            return Err(StoreError::Truncated {
                path: path.to_string(),
                need: HDR_SIZ as u64,
                have: data.len() as u64,
            });
        }
        let sig = rd_str(data, 0, 16);
        if sig != CDB_SIG {
            return Err(StoreError::Signature {
                path: path.to_string(),
                got: sig,
            });
        }
        let file_siz = LittleEndian::read_u64(&data[16..24]);
        if file_siz > store.file_len() {
            return Err(StoreError::Truncated {
                path: path.to_string(),
                need: file_siz,
                have: store.file_len(),
            });
        }
        let free_idx = LittleEndian::read_u32(&data[24..28]) as usize;
        let n_tkr = LittleEndian::read_u32(&data[28..32]);
        let hdr_siz = LittleEndian::read_u32(&data[32..36]) as usize;
        let date = LittleEndian::read_u32(&data[36..40]);

        let mut recs = HashMap::new();
        let end = free_idx.min(data.len());
        let mut off = hdr_siz.max(HDR_SIZ);
        while off + REC_FIXED <= end {
            let svc = rd_str(data, off, CDB_SVCLEN);
            let tkr = rd_str(data, off + CDB_SVCLEN, CDB_TKRLEN);
            let fid = LittleEndian::read_i32(&data[off + 324..off + 328]);
            let siz = LittleEndian::read_u32(&data[off + 340..off + 344]) as usize;
            if siz < REC_FIXED {
                break;
            }
            recs.insert(key_of(&svc, &tkr, fid), off);
            off += siz;
        }
        if recs.len() != n_tkr as usize {
            log::warn!(
                "[cdb={}] header says {} records, found {}",
                path,
                n_tkr,
                recs.len()
            );
        }
        log::info!("[cdb={}] date={} {} records", path, date, recs.len());
        Ok(ChartDb { store, date, recs })
    }

    /// YYYYMMDD the file covers.
    pub fn date(&self) -> u32 {
        self.date
    }

    pub fn len(&self) -> usize {
        self.recs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recs.is_empty()
    }

    /// Enumerate every record.
    pub fn query(&self) -> Vec<ChartRecord> {
        let data = self.store.data();
        let mut offs: Vec<usize> = self.recs.values().copied().collect();
        offs.sort();
        offs.into_iter()
            .map(|off| ChartRecord {
                svc: rd_str(data, off, CDB_SVCLEN),
                tkr: rd_str(data, off + CDB_SVCLEN, CDB_TKRLEN),
                fid: LittleEndian::read_i32(&data[off + 324..off + 328]),
                interval: LittleEndian::read_i32(&data[off + 328..off + 332]) as u32,
                n_tck: LittleEndian::read_i32(&data[off + 336..off + 340]) as u32,
                n_upd: LittleEndian::read_u32(&data[off + 356..off + 360]),
            })
            .collect()
    }

    /// Snapshot one series with its write position.
    pub fn view(&self, svc: &str, tkr: &str, fid: i32) -> Option<ChartView> {
        let off = *self.recs.get(&key_of(svc, tkr, fid))?;
        let data = self.store.data();
        let interval = LittleEndian::read_i32(&data[off + 328..off + 332]) as u32;
        let cur_tck = LittleEndian::read_i32(&data[off + 332..off + 336]) as usize;
        let n_tck = LittleEndian::read_i32(&data[off + 336..off + 340]) as usize;
        let t_upd = LittleEndian::read_u32(&data[off + 348..off + 352]);
        let floats = &data[off + REC_FIXED..off + REC_FIXED + n_tck * 4];
        let mut values = vec![0f32; n_tck];
        LittleEndian::read_f32_into(floats, &mut values);
        Some(ChartView {
            svc: svc.to_string(),
            tkr: tkr.to_string(),
            fid,
            interval,
            cur_tck,
            t_upd,
            values,
        })
    }
}

#[cfg(test)]
pub(crate) mod testgen {
    use super::*;
    use byteorder::WriteBytesExt;
    use std::io::Write;

    fn pad(buf: &mut Vec<u8>, s: &str, width: usize) {
        let b = s.as_bytes();
        buf.extend_from_slice(&b[..b.len().min(width)]);
        buf.resize(buf.len() + width - b.len().min(width), 0);
    }

    pub fn write_chart(
        path: &std::path::Path,
        date: u32,
        items: &[(&str, &str, i32, u32, usize, &[f32])],
    ) {
        let mut body = Vec::new();
        for (i, (svc, tkr, fid, interval, cur_tck, samples)) in items.iter().enumerate() {
            let n_tck = (SECPERDAY / interval) as usize;
            let mut rec = Vec::new();
            pad(&mut rec, svc, CDB_SVCLEN);
            pad(&mut rec, tkr, CDB_TKRLEN);
            rec.write_i32::<LittleEndian>(i as i32).unwrap();
            rec.write_i32::<LittleEndian>(*fid).unwrap();
            rec.write_i32::<LittleEndian>(*interval as i32).unwrap();
            rec.write_i32::<LittleEndian>(*cur_tck as i32).unwrap();
            rec.write_i32::<LittleEndian>(n_tck as i32).unwrap();
            rec.write_u32::<LittleEndian>((REC_FIXED + n_tck * 4) as u32)
                .unwrap();
            rec.write_u32::<LittleEndian>(1_754_000_000).unwrap(); // t_create
            rec.write_u32::<LittleEndian>(1_754_003_600).unwrap(); // t_upd
            rec.write_u32::<LittleEndian>(0).unwrap(); // t_upd_us
            rec.write_u32::<LittleEndian>(samples.len() as u32).unwrap(); // n_upd
            rec.write_u32::<LittleEndian>(0).unwrap(); // t_dead
            let mut data = vec![0f32; n_tck];
            data[..samples.len()].copy_from_slice(samples);
            for v in &data {
                rec.write_f32::<LittleEndian>(*v).unwrap();
            }
            body.extend_from_slice(&rec);
        }
        let mut out = Vec::new();
        pad(&mut out, CDB_SIG, 16);
        out.write_u64::<LittleEndian>((HDR_SIZ + body.len()) as u64)
            .unwrap();
        out.write_u32::<LittleEndian>((HDR_SIZ + body.len()) as u32)
            .unwrap();
        out.write_u32::<LittleEndian>(items.len() as u32).unwrap();
        out.write_u32::<LittleEndian>(HDR_SIZ as u32).unwrap();
        out.write_u32::<LittleEndian>(date).unwrap();
        out.extend_from_slice(&body);
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(&out).unwrap();
    }
}
