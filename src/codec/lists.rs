//! Typed recorder payloads.
//!
//! The tape carries arbitrary typed messages, each stamped with a
//! wire-protocol id. Protocol 1 is the field-list codec; the list
//! protocols here cover the common bulk shapes (int, float, double,
//! string lists and string maps) with the same packed-integer
//! discipline as the rest of the wire.

use crate::codec::packed;
use crate::error::CodecError;

pub const PROTO_FIELD_LIST: u16 = 1;
pub const PROTO_INT_LIST: u16 = 2;
pub const PROTO_DOUBLE_LIST: u16 = 3;
pub const PROTO_FLOAT_LIST: u16 = 4;
pub const PROTO_STRING_LIST: u16 = 5;
pub const PROTO_STRING_MAP: u16 = 6;

#[derive(Debug, Clone, PartialEq)]
pub enum ListPayload {
    Ints(Vec<i64>),
    Doubles(Vec<f64>),
    Floats(Vec<f32>),
    Strings(Vec<String>),
    StringMap(Vec<(String, String)>),
}

fn put_str(s: &str, dst: &mut Vec<u8>) {
    packed::put_u64(s.len() as u64, dst);
    dst.extend_from_slice(s.as_bytes());
}

fn get_str(buf: &[u8], at: usize) -> Result<(String, usize), CodecError> {
    let (len, n) = packed::get_u64(buf, at)?;
    let len = len as usize;
    let have = buf.len().saturating_sub(at + n);
    if have < len {
        return Err(CodecError::TruncatedValue {
            pos: at + n,
            need: len,
            have,
        });
    }
    let s = String::from_utf8_lossy(&buf[at + n..at + n + len]).into_owned();
    Ok((s, n + len))
}

impl ListPayload {
    pub fn wire_proto(&self) -> u16 {
        match self {
            ListPayload::Ints(_) => PROTO_INT_LIST,
            ListPayload::Doubles(_) => PROTO_DOUBLE_LIST,
            ListPayload::Floats(_) => PROTO_FLOAT_LIST,
            ListPayload::Strings(_) => PROTO_STRING_LIST,
            ListPayload::StringMap(_) => PROTO_STRING_MAP,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ListPayload::Ints(v) => v.len(),
            ListPayload::Doubles(v) => v.len(),
            ListPayload::Floats(v) => v.len(),
            ListPayload::Strings(v) => v.len(),
            ListPayload::StringMap(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Packed count, then elements. Ints may escape to the fixed
    /// 8-byte form, flagged by a leading marker byte per element set.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.len() * 8);
        packed::put_u64(self.len() as u64, &mut out);
        match self {
            ListPayload::Ints(v) => {
                for i in v {
                    if packed::fits_packed_i64(*i) {
                        out.push(0);
                        packed::put_i64(*i, &mut out);
                    } else {
                        out.push(1);
                        packed::put_i64_fixed(*i, &mut out);
                    }
                }
            }
            ListPayload::Doubles(v) => {
                for d in v {
                    out.extend_from_slice(&d.to_bits().to_be_bytes());
                }
            }
            ListPayload::Floats(v) => {
                for f in v {
                    out.extend_from_slice(&f.to_bits().to_be_bytes());
                }
            }
            ListPayload::Strings(v) => {
                for s in v {
                    put_str(s, &mut out);
                }
            }
            ListPayload::StringMap(v) => {
                for (k, val) in v {
                    put_str(k, &mut out);
                    put_str(val, &mut out);
                }
            }
        }
        out
    }

    /// Decode a payload stamped with `proto`. `Ok(None)` means the
    /// protocol is not a list shape (e.g. a field-list frame).
    pub fn decode(proto: u16, buf: &[u8]) -> Result<Option<ListPayload>, CodecError> {
        if !(PROTO_INT_LIST..=PROTO_STRING_MAP).contains(&proto) {
            return Ok(None);
        }
        let (cnt, mut at) = packed::get_u64(buf, 0)?;
        let cnt = cnt as usize;
        let payload = match proto {
            PROTO_INT_LIST => {
                let mut v = Vec::with_capacity(cnt);
                for _ in 0..cnt {
                    let marker = *buf.get(at).ok_or(CodecError::TruncatedValue {
                        pos: at,
                        need: 1,
                        have: 0,
                    })?;
                    at += 1;
                    let (i, n) = if marker != 0 {
                        packed::get_i64_fixed(buf, at)?
                    } else {
                        packed::get_i64(buf, at)?
                    };
                    at += n;
                    v.push(i);
                }
                ListPayload::Ints(v)
            }
            PROTO_DOUBLE_LIST => {
                let mut v = Vec::with_capacity(cnt);
                for _ in 0..cnt {
                    let (bits, n) = packed::get_u64_fixed(buf, at)?;
                    at += n;
                    v.push(f64::from_bits(bits));
                }
                ListPayload::Doubles(v)
            }
            PROTO_FLOAT_LIST => {
                let mut v = Vec::with_capacity(cnt);
                for _ in 0..cnt {
                    let (bits, n) = packed::get_u32_fixed(buf, at)?;
                    at += n;
                    v.push(f32::from_bits(bits));
                }
                ListPayload::Floats(v)
            }
            PROTO_STRING_LIST => {
                let mut v = Vec::with_capacity(cnt);
                for _ in 0..cnt {
                    let (s, n) = get_str(buf, at)?;
                    at += n;
                    v.push(s);
                }
                ListPayload::Strings(v)
            }
            _ => {
                let mut v = Vec::with_capacity(cnt);
                for _ in 0..cnt {
                    let (k, n) = get_str(buf, at)?;
                    at += n;
                    let (val, n) = get_str(buf, at)?;
                    at += n;
                    v.push((k, val));
                }
                ListPayload::StringMap(v)
            }
        };
        Ok(Some(payload))
    }

    /// One-line rendering for the dump tools.
    pub fn dump(&self) -> String {
        match self {
            ListPayload::Ints(v) => format!(
                "ints[{}] {}",
                v.len(),
                v.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(",")
            ),
            ListPayload::Doubles(v) => format!(
                "doubles[{}] {}",
                v.len(),
                v.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(",")
            ),
            ListPayload::Floats(v) => format!(
                "floats[{}] {}",
                v.len(),
                v.iter().map(|f| f.to_string()).collect::<Vec<_>>().join(",")
            ),
            ListPayload::Strings(v) => format!("strings[{}] {}", v.len(), v.join(",")),
            ListPayload::StringMap(v) => {
                let cells: Vec<String> =
                    v.iter().map(|(k, val)| format!("{}={}", k, val)).collect();
                format!("map[{}] {}", v.len(), cells.join(","))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(p: ListPayload) {
        let buf = p.encode();
        let got = ListPayload::decode(p.wire_proto(), &buf).unwrap().unwrap();
        assert_eq!(got, p);
    }

    #[test]
    fn all_shapes_roundtrip() {
        roundtrip(ListPayload::Ints(vec![0, -5, 1_750_000, i64::max_value()]));
        roundtrip(ListPayload::Doubles(vec![185.32, -0.25, 1e12]));
        roundtrip(ListPayload::Floats(vec![1.5, -2.25]));
        roundtrip(ListPayload::Strings(vec![
            "IBM".to_string(),
            "MSFT".to_string(),
            String::new(),
        ]));
        roundtrip(ListPayload::StringMap(vec![
            ("user".to_string(), "trader1".to_string()),
            ("host".to_string(), "nyc4".to_string()),
        ]));
    }

    #[test]
    fn field_list_proto_is_not_ours() {
        assert!(ListPayload::decode(PROTO_FIELD_LIST, b"anything")
            .unwrap()
            .is_none());
        assert!(ListPayload::decode(99, b"anything").unwrap().is_none());
    }

    #[test]
    fn truncated_list_errors() {
        let buf = ListPayload::Doubles(vec![1.0, 2.0]).encode();
        assert!(matches!(
            ListPayload::decode(PROTO_DOUBLE_LIST, &buf[..buf.len() - 3]),
            Err(CodecError::TruncatedValue { .. })
        ));
    }
}
