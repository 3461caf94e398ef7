//! Last-value cache reader.
//!
//! The LVC file is shared across processes: a server-resident writer
//! mutates it under the file lock, readers take the lock just long
//! enough to copy a slot out. Decode happens after release, against
//! the schema inlined at the file head.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};

use crate::codec::field::{get_value, Field, FieldType, Value};
use crate::error::StoreError;
use crate::mmap::MappedStore;
use crate::schema::{FldDef, Schema};

pub const LVC_SIG: &str = "006 LVC-BINARY";
pub const LVC_SIG_LEGACY: [&str; 4] = ["002 LVC", "003 LVC", "004 LVC", "005 LVC"];
pub const LVC_SVCLEN: usize = 64;
pub const LVC_TKRLEN: usize = 255;

const HDR_FIXED: usize = 44;
const FLDDEF_SIZ: usize = 76;
const SLOT_FIXED: usize = LVC_SVCLEN + LVC_TKRLEN + 1 + 7 * 4;

fn rd_str(buf: &[u8], off: usize, max: usize) -> String {
    let raw = &buf[off..off + max];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(max);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// One decoded record slot.
#[derive(Debug, Clone)]
pub struct LvcData {
    pub svc: String,
    pub tkr: String,
    pub active: bool,
    pub t_create: u32,
    pub t_upd: u32,
    pub t_upd_us: u32,
    pub n_upd: u32,
    pub t_dead: u32,
    pub fields: Vec<Field>,
}

pub struct Lvc {
    store: MappedStore,
    schema: Schema,
    binary: bool,
    services: Vec<String>,
    recs: HashMap<String, usize>,
    filter: Option<HashSet<i32>>,
    wait: Option<Duration>,
}

impl Lvc {
    pub fn open(path: &str) -> Result<Lvc, StoreError> {
        let store = MappedStore::open(path)?;
        let data = store.data();
        if data.len() < HDR_FIXED {
            return Err(StoreError::Truncated {
                path: path.to_string(),
                need: HDR_FIXED as u64,
                have: data.len() as u64,
            });
        }
        let sig = rd_str(data, 0, 16);
        let legacy = LVC_SIG_LEGACY.contains(&sig.as_str());
        if sig != LVC_SIG && !legacy {
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
        let hdr_siz = LittleEndian::read_u32(&data[28..32]) as usize;
        let n_flds = LittleEndian::read_u32(&data[32..36]) as usize;
        let n_svcs = LittleEndian::read_u32(&data[36..40]) as usize;
        let binary = !legacy && data[40] != 0;

        let mut services = Vec::with_capacity(n_svcs);
        let mut off = HDR_FIXED;
        for _ in 0..n_svcs {
            services.push(rd_str(data, off, LVC_SVCLEN));
            off += LVC_SVCLEN;
        }
        let mut defs = Vec::with_capacity(n_flds);
        for _ in 0..n_flds {
            let fid = LittleEndian::read_i32(&data[off..off + 4]);
            let max_len = LittleEndian::read_i32(&data[off + 4..off + 8]) as u32;
            let ftype = LittleEndian::read_i32(&data[off + 8..off + 12]);
            let name = rd_str(data, off + 12, 64);
            if let Some(ftype) = num::FromPrimitive::from_i32(ftype) {
                defs.push(FldDef {
                    fid,
                    name,
                    ftype,
                    max_len,
                });
            } else {
                log::warn!("[lvc={}] fid {} has unknown type {}", path, fid, ftype);
            }
            off += FLDDEF_SIZ;
        }
        if off != hdr_siz {
            log::warn!(
                "[lvc={}] header size {} disagrees with table end {}",
                path,
                hdr_siz,
                off
            );
        }
        let mut lvc = Lvc {
            store,
            schema: Schema::new(defs),
            binary,
            services,
            recs: HashMap::new(),
            filter: None,
            wait: None,
        };
        lvc.load(hdr_siz.max(off), free_idx)?;
        log::info!(
            "[lvc={}] {} records, {} fields, binary={}",
            path,
            lvc.recs.len(),
            lvc.schema.len(),
            binary
        );
        Ok(lvc)
    }

    /// Walk the slot region building the (service|ticker) index.
    fn load(&mut self, from: usize, free_idx: usize) -> Result<(), StoreError> {
        let data = self.store.data();
        let end = free_idx.min(data.len());
        let mut off = from;
        while off + SLOT_FIXED <= end {
            let svc = rd_str(data, off, LVC_SVCLEN);
            let tkr = rd_str(data, off + LVC_SVCLEN, LVC_TKRLEN);
            let siz = LittleEndian::read_u32(&data[off + 320..off + 324]) as usize;
            if siz < SLOT_FIXED {
                return Err(StoreError::Truncated {
                    path: self.store.path().display().to_string(),
                    need: (off + SLOT_FIXED) as u64,
                    have: off as u64,
                });
            }
            self.recs.insert(format!("{}|{}", svc, tkr), off);
            off += siz;
        }
        Ok(())
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn services(&self) -> &[String] {
        &self.services
    }

    pub fn is_binary(&self) -> bool {
        self.binary
    }

    pub fn len(&self) -> usize {
        self.recs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recs.is_empty()
    }

    /// Bound the lock wait for subsequent snaps. Default is infinite.
    pub fn set_wait(&mut self, wait: Option<Duration>) {
        self.wait = wait;
    }

    /// Restrict snap output to a CSV fid subset; empty clears.
    pub fn set_filter(&mut self, csv: &str) {
        let fids: HashSet<i32> = csv
            .split(',')
            .filter_map(|t| t.trim().parse().ok())
            .collect();
        self.filter = if fids.is_empty() { None } else { Some(fids) };
    }

    /// Point-in-time copy of one record. Missing names come back as
    /// `Ok(None)`; a bounded lock wait can surface `TimedOut`.
    pub fn snap(&self, svc: &str, tkr: &str) -> Result<Option<LvcData>, StoreError> {
        let off = match self.recs.get(&format!("{}|{}", svc, tkr)) {
            Some(off) => *off,
            None => return Ok(None),
        };
        let slot = self.copy_slot(off)?;
        Ok(Some(self.decode_slot(&slot)))
    }

    /// Iterate every record slot.
    pub fn snap_all(&self) -> Result<Vec<LvcData>, StoreError> {
        let mut offs: Vec<usize> = self.recs.values().copied().collect();
        offs.sort();
        let mut out = Vec::with_capacity(offs.len());
        for off in offs {
            let slot = self.copy_slot(off)?;
            out.push(self.decode_slot(&slot));
        }
        Ok(out)
    }

    fn copy_slot(&self, off: usize) -> Result<Vec<u8>, StoreError> {
        let _guard = self.store.lock(self.wait)?;
        let data = self.store.data();
        let siz = LittleEndian::read_u32(&data[off + 320..off + 324]) as usize;
        let end = (off + siz).min(data.len());
        Ok(data[off..end].to_vec())
    }

    fn decode_slot(&self, slot: &[u8]) -> LvcData {
        let svc = rd_str(slot, 0, LVC_SVCLEN);
        let tkr = rd_str(slot, LVC_SVCLEN, LVC_TKRLEN);
        let active = slot[319] != 0;
        let t_create = LittleEndian::read_u32(&slot[324..328]);
        let t_upd = LittleEndian::read_u32(&slot[328..332]);
        let t_upd_us = LittleEndian::read_u32(&slot[332..336]);
        let n_upd = LittleEndian::read_u32(&slot[336..340]);
        let t_dead = LittleEndian::read_u32(&slot[340..344]);
        let n_fld = LittleEndian::read_u32(&slot[344..348]) as usize;
        let mut fids = Vec::with_capacity(n_fld);
        let mut off = SLOT_FIXED;
        for _ in 0..n_fld {
            if off + 4 > slot.len() {
                break;
            }
            fids.push(LittleEndian::read_i32(&slot[off..off + 4]));
            off += 4;
        }
        let mut fields = Vec::with_capacity(fids.len());
        for fid in fids {
            if off + 3 > slot.len() {
                break;
            }
            let len = LittleEndian::read_u16(&slot[off..off + 2]) as usize;
            let ty_byte = slot[off + 2];
            off += 3;
            if off + len > slot.len() {
                break;
            }
            let payload = &slot[off..off + len];
            off += len;
            if let Some(filter) = &self.filter {
                if !filter.contains(&fid) {
                    continue;
                }
            }
            let def = match self.schema.by_id(fid) {
                Some(def) => def.clone(),
                None => {
                    log::warn!("[lvc] record {}|{} fid {} not in schema", svc, tkr, fid);
                    continue;
                }
            };
            let value = if self.binary {
                let ftype = match num::FromPrimitive::from_u8(ty_byte & 0x7F) {
                    Some(t) => t,
                    None => continue,
                };
                match get_value(ftype, ty_byte & 0x80 != 0, payload, 0) {
                    Ok((v, _)) => v,
                    Err(e) => {
                        log::warn!("[lvc] fid {} decode failed: {}", fid, e);
                        continue;
                    }
                }
            } else {
                match parse_text(def.ftype, payload) {
                    Some(v) => v,
                    None => continue,
                }
            };
            fields.push(Field {
                fid,
                name: Some(def.name.clone()),
                value,
            });
        }
        LvcData {
            svc,
            tkr,
            active,
            t_create,
            t_upd,
            t_upd_us,
            n_upd,
            t_dead,
            fields,
        }
    }
}

/// Legacy text payload: ASCII rendered by the writer, typed by the
/// schema entry.
fn parse_text(ftype: FieldType, payload: &[u8]) -> Option<Value> {
    let text = std::str::from_utf8(payload).ok()?.trim();
    let v = match ftype {
        FieldType::String => Value::Str(text.to_string()),
        FieldType::Int8 => Value::Int8(text.parse().ok()?),
        FieldType::Int16 => Value::Int16(text.parse().ok()?),
        FieldType::Int32 => Value::Int32(text.parse().ok()?),
        FieldType::Int64 => Value::Int64(text.parse().ok()?),
        FieldType::UInt32 => Value::UInt32(text.parse().ok()?),
        FieldType::UInt64 => Value::UInt64(text.parse().ok()?),
        FieldType::Float => Value::Float(text.parse().ok()?),
        FieldType::Double => Value::Double(text.parse().ok()?),
        FieldType::Date => Value::Date(text.parse().ok()?),
        FieldType::Time => Value::Time(text.parse().ok()?),
        FieldType::TimeSec => Value::TimeSec(text.parse().ok()?),
        FieldType::UnixTime => Value::UnixTime(text.parse().ok()?),
        _ => Value::Str(text.to_string()),
    };
    Some(v)
}


#[cfg(test)]
mod tests {
    use super::testgen::*;
    use super::*;

    fn fixture(binary: bool) -> (tempfile::TempDir, Lvc) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.lvc");
        write_lvc(
            &path,
            &sample_defs(),
            &["IDN"],
            &[
                (
                    "IDN",
                    "IBM",
                    vec![
                        Field::new(25, Value::Double(185.45)),
                        Field::new(66, Value::Int64(1_800_000)),
                    ],
                ),
                (
                    "IDN",
                    "MSFT",
                    vec![
                        Field::new(25, Value::Double(415.10)),
                        Field::new(3, Value::Str("MICROSOFT".into())),
                    ],
                ),
            ],
            binary,
        );
        let lvc = Lvc::open(path.to_str().unwrap()).unwrap();
        (dir, lvc)
    }

    #[test]
    fn snap_returns_stored_fields() {
        let (_d, lvc) = fixture(true);
        let data = lvc.snap("IDN", "IBM").unwrap().unwrap();
        assert_eq!(data.fields.len(), 2);
        assert_eq!(data.fields[0].value, Value::Double(185.45));
        assert_eq!(data.fields[0].name.as_deref(), Some("ASK"));
        assert_eq!(data.fields[1].value, Value::Int64(1_800_000));
        assert_eq!(data.t_upd, 1_754_000_100);
        assert!(data.active);
    }

    #[test]
    fn snap_missing_ticker_is_empty() {
        let (_d, lvc) = fixture(true);
        assert!(lvc.snap("IDN", "NOPE").unwrap().is_none());
    }

    #[test]
    fn snap_all_iterates_every_slot() {
        let (_d, lvc) = fixture(true);
        let all = lvc.snap_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].tkr, "IBM");
        assert_eq!(all[1].tkr, "MSFT");
    }

    #[test]
    fn filter_restricts_fields() {
        let (_d, mut lvc) = fixture(true);
        lvc.set_filter("66");
        let data = lvc.snap("IDN", "IBM").unwrap().unwrap();
        assert_eq!(data.fields.len(), 1);
        assert_eq!(data.fields[0].fid, 66);
    }

    #[test]
    fn legacy_text_payload_decodes_by_schema_type() {
        let (_d, lvc) = fixture(false);
        assert!(!lvc.is_binary());
        let data = lvc.snap("IDN", "MSFT").unwrap().unwrap();
        assert_eq!(data.fields[0].value, Value::Double(415.10));
        assert_eq!(data.fields[1].value, Value::Str("MICROSOFT".into()));
    }

    #[test]
    fn bad_signature_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.lvc");
        std::fs::write(&path, b"001 NOT-AN-LVC\0\0padding-padding-padding-padding")
            .unwrap();
        match Lvc::open(path.to_str().unwrap()) {
            Err(StoreError::Signature { .. }) => (),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn schema_comes_from_file_head() {
        let (_d, lvc) = fixture(true);
        assert_eq!(lvc.schema().len(), 4);
        assert_eq!(lvc.schema().by_name("BID").unwrap().fid, 22);
        assert_eq!(lvc.services(), &["IDN".to_string()]);
    }
}
