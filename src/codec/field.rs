//! Typed field values and their wire forms.
//!
//! A field travels as (packed fid, type byte, payload). The type
//! byte's low 7 bits are the `FieldType` id; bit 0x80 marks the
//! fixed-width escape for a numeric payload that did not fit the
//! packed form. Fixed-width numerics are big-endian on the wire
//! whatever the host is.

use std::fmt;

use num::FromPrimitive;

use crate::codec::packed;
use crate::error::CodecError;

const UNPACKED_FLD: u8 = 0x80;

#[derive(Debug, PartialEq, FromPrimitive, Clone, Copy)]
pub enum FieldType {
    String = 1,
    Int32 = 2,
    Double = 3,
    Date = 4,
    Time = 5,
    TimeSec = 6,
    Float = 7,
    Int8 = 8,
    Int16 = 9,
    Int64 = 10,
    Real = 11,
    ByteStream = 12,
    UnixTime = 13,
    Vector = 14,
    UInt32 = 15,
    UInt64 = 16,
}

impl FieldType {
    pub fn parse(name: &str) -> Option<FieldType> {
        let ty = match name {
            "string" => FieldType::String,
            "int" | "int32" => FieldType::Int32,
            "double" => FieldType::Double,
            "date" => FieldType::Date,
            "time" => FieldType::Time,
            "timeSec" => FieldType::TimeSec,
            "float" => FieldType::Float,
            "int8" => FieldType::Int8,
            "int16" => FieldType::Int16,
            "int64" => FieldType::Int64,
            "real" => FieldType::Real,
            "bytestream" => FieldType::ByteStream,
            "unixTime" => FieldType::UnixTime,
            "vector" => FieldType::Vector,
            "uint32" => FieldType::UInt32,
            "uint64" => FieldType::UInt64,
            _ => return None,
        };
        Some(ty)
    }

    pub fn name(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Int32 => "int32",
            FieldType::Double => "double",
            FieldType::Date => "date",
            FieldType::Time => "time",
            FieldType::TimeSec => "timeSec",
            FieldType::Float => "float",
            FieldType::Int8 => "int8",
            FieldType::Int16 => "int16",
            FieldType::Int64 => "int64",
            FieldType::Real => "real",
            FieldType::ByteStream => "bytestream",
            FieldType::UnixTime => "unixTime",
            FieldType::Vector => "vector",
            FieldType::UInt32 => "uint32",
            FieldType::UInt64 => "uint64",
        }
    }
}

/// Fixed-point value: `mantissa / 10^decimals`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Real {
    pub mantissa: i64,
    pub decimals: u8,
}

impl Real {
    pub fn as_f64(&self) -> f64 {
        self.mantissa as f64 / 10f64.powi(self.decimals as i32)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int32(i32),
    Double(f64),
    /// YYYYMMDD
    Date(u32),
    /// HHMMSS
    Time(u32),
    /// Unix seconds
    TimeSec(u32),
    Float(f32),
    Int8(i8),
    Int16(i16),
    Int64(i64),
    Real(Real),
    Bytes(Vec<u8>),
    /// Unix nanoseconds
    UnixTime(u64),
    Vector(Vec<f64>),
    UInt32(u32),
    UInt64(u64),
}

impl Value {
    pub fn ftype(&self) -> FieldType {
        match self {
            Value::Str(_) => FieldType::String,
            Value::Int32(_) => FieldType::Int32,
            Value::Double(_) => FieldType::Double,
            Value::Date(_) => FieldType::Date,
            Value::Time(_) => FieldType::Time,
            Value::TimeSec(_) => FieldType::TimeSec,
            Value::Float(_) => FieldType::Float,
            Value::Int8(_) => FieldType::Int8,
            Value::Int16(_) => FieldType::Int16,
            Value::Int64(_) => FieldType::Int64,
            Value::Real(_) => FieldType::Real,
            Value::Bytes(_) => FieldType::ByteStream,
            Value::UnixTime(_) => FieldType::UnixTime,
            Value::Vector(_) => FieldType::Vector,
            Value::UInt32(_) => FieldType::UInt32,
            Value::UInt64(_) => FieldType::UInt64,
        }
    }

    /// Numeric view used by the chart feed and dump tools.
    pub fn as_f64(&self) -> Option<f64> {
        let v = match self {
            Value::Int8(v) => *v as f64,
            Value::Int16(v) => *v as f64,
            Value::Int32(v) => *v as f64,
            Value::Int64(v) => *v as f64,
            Value::UInt32(v) => *v as f64,
            Value::UInt64(v) => *v as f64,
            Value::Float(v) => *v as f64,
            Value::Double(v) => *v,
            Value::Real(r) => r.as_f64(),
            _ => return None,
        };
        Some(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{}", s),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Date(v) => write!(f, "{:08}", v),
            Value::Time(v) => write!(f, "{:06}", v),
            Value::TimeSec(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Int8(v) => write!(f, "{}", v),
            Value::Int16(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::Real(r) => write!(f, "{}", r.as_f64()),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::UnixTime(v) => write!(f, "{}ns", v),
            Value::Vector(v) => write!(f, "<{} doubles>", v.len()),
            Value::UInt32(v) => write!(f, "{}", v),
            Value::UInt64(v) => write!(f, "{}", v),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub fid: i32,
    pub name: Option<String>,
    pub value: Value,
}

impl Field {
    pub fn new(fid: i32, value: Value) -> Self {
        Field {
            fid,
            name: None,
            value,
        }
    }
}

fn put_len(len: usize, dst: &mut Vec<u8>) {
    packed::put_u64(len as u64, dst);
}

fn get_len(buf: &[u8], at: usize) -> Result<(usize, usize), CodecError> {
    let (v, n) = packed::get_u64(buf, at)?;
    if v > usize::max_value() as u64 {
        return Err(CodecError::MalformedFrame {
            pos: at,
            what: "length exceeds address space",
        });
    }
    Ok((v as usize, n))
}

/// Append the payload bytes for `v`. Returns true when the fixed
/// escape was taken and the enclosing type byte must carry 0x80.
pub fn put_value(v: &Value, dst: &mut Vec<u8>) -> bool {
    let mut unpacked = false;
    match v {
        Value::Str(s) => {
            put_len(s.len(), dst);
            dst.extend_from_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            put_len(b.len(), dst);
            dst.extend_from_slice(b);
        }
        Value::Vector(v) => {
            put_len(v.len(), dst);
            for d in v {
                dst.extend_from_slice(&d.to_bits().to_be_bytes());
            }
        }
        Value::Int8(v) => dst.push(*v as u8),
        Value::Int16(v) => dst.extend_from_slice(&v.to_be_bytes()),
        Value::Int32(v) => {
            if packed::fits_packed_i64(*v as i64) {
                packed::put_i64(*v as i64, dst);
            } else {
                unpacked = true;
                dst.extend_from_slice(&v.to_be_bytes());
            }
        }
        Value::Int64(v) => {
            if packed::fits_packed_i64(*v) {
                packed::put_i64(*v, dst);
            } else {
                unpacked = true;
                packed::put_i64_fixed(*v, dst);
            }
        }
        Value::UInt32(v) => {
            packed::put_u64(*v as u64, dst);
        }
        Value::UInt64(v) => {
            if *v <= packed::MAX_PACKED {
                packed::put_u64(*v, dst);
            } else {
                unpacked = true;
                packed::put_u64_fixed(*v, dst);
            }
        }
        Value::Float(v) => dst.extend_from_slice(&v.to_bits().to_be_bytes()),
        Value::Double(v) => dst.extend_from_slice(&v.to_bits().to_be_bytes()),
        Value::Real(r) => {
            if packed::fits_packed_i64(r.mantissa) {
                packed::put_i64(r.mantissa, dst);
            } else {
                unpacked = true;
                packed::put_i64_fixed(r.mantissa, dst);
            }
            let mut hint = r.decimals & 0x0F;
            if r.mantissa < 0 {
                hint |= 0x80;
            }
            dst.push(hint);
        }
        Value::Date(v) | Value::Time(v) | Value::TimeSec(v) => {
            packed::put_u64(*v as u64, dst);
        }
        Value::UnixTime(v) => {
            if *v <= packed::MAX_PACKED {
                packed::put_u64(*v, dst);
            } else {
                unpacked = true;
                packed::put_u64_fixed(*v, dst);
            }
        }
    }
    unpacked
}

/// Append one field; returns bytes written.
pub fn put_field(fld: &Field, dst: &mut Vec<u8>) -> usize {
    let mark = dst.len();
    packed::put_u64(fld.fid as u32 as u64, dst);
    let ty_at = dst.len();
    dst.push(fld.value.ftype() as u8);
    if put_value(&fld.value, dst) {
        dst[ty_at] |= UNPACKED_FLD;
    }
    dst.len() - mark
}

/// Decode one field at `buf[at..]`. Returns (field, consumed); the
/// name is left for the schema layer to fill in.
pub fn get_field(buf: &[u8], at: usize) -> Result<(Field, usize), CodecError> {
    let (fid_raw, mut used) = packed::get_u64(buf, at)?;
    let fid = fid_raw as u32 as i32;
    let ty_at = at + used;
    let ty_byte = *buf.get(ty_at).ok_or(CodecError::TruncatedValue {
        pos: ty_at,
        need: 1,
        have: 0,
    })?;
    used += 1;
    let unpacked = ty_byte & UNPACKED_FLD != 0;
    let ftype = FieldType::from_u8(ty_byte & !UNPACKED_FLD).ok_or(CodecError::UnknownType {
        ty: ty_byte,
        pos: ty_at,
    })?;
    let (value, n) = get_value(ftype, unpacked, buf, at + used)?;
    used += n;
    Ok((Field::new(fid, value), used))
}

/// Decode a payload of a known type at `buf[at..]`.
pub fn get_value(
    ftype: FieldType,
    unpacked: bool,
    buf: &[u8],
    at: usize,
) -> Result<(Value, usize), CodecError> {
    let p = at;
    let mut used = 0usize;
    let value = match ftype {
        FieldType::String => {
            let (len, n) = get_len(buf, p)?;
            let bytes = fetch(buf, p + n, len)?;
            used += n + len;
            Value::Str(String::from_utf8_lossy(bytes).into_owned())
        }
        FieldType::ByteStream => {
            let (len, n) = get_len(buf, p)?;
            let bytes = fetch(buf, p + n, len)?;
            used += n + len;
            Value::Bytes(bytes.to_vec())
        }
        FieldType::Vector => {
            let (cnt, n) = get_len(buf, p)?;
            let bytes = fetch(buf, p + n, cnt * 8)?;
            used += n + cnt * 8;
            let mut v = Vec::with_capacity(cnt);
            for i in 0..cnt {
                let mut b = [0u8; 8];
                b.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
                v.push(f64::from_bits(u64::from_be_bytes(b)));
            }
            Value::Vector(v)
        }
        FieldType::Int8 => {
            let b = fetch(buf, p, 1)?;
            used += 1;
            Value::Int8(b[0] as i8)
        }
        FieldType::Int16 => {
            let b = fetch(buf, p, 2)?;
            used += 2;
            Value::Int16(i16::from_be_bytes([b[0], b[1]]))
        }
        FieldType::Int32 => {
            if unpacked {
                let b = fetch(buf, p, 4)?;
                used += 4;
                Value::Int32(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            } else {
                let (v, n) = packed::get_i32(buf, p)?;
                used += n;
                Value::Int32(v)
            }
        }
        FieldType::Int64 => {
            if unpacked {
                let (v, n) = packed::get_i64_fixed(buf, p)?;
                used += n;
                Value::Int64(v)
            } else {
                let (v, n) = packed::get_i64(buf, p)?;
                used += n;
                Value::Int64(v)
            }
        }
        FieldType::UInt32 => {
            let (v, n) = packed::get_u32(buf, p)?;
            used += n;
            Value::UInt32(v)
        }
        FieldType::UInt64 => {
            let (v, n) = if unpacked {
                packed::get_u64_fixed(buf, p)?
            } else {
                packed::get_u64(buf, p)?
            };
            used += n;
            Value::UInt64(v)
        }
        FieldType::Float => {
            let b = fetch(buf, p, 4)?;
            used += 4;
            Value::Float(f32::from_bits(u32::from_be_bytes([b[0], b[1], b[2], b[3]])))
        }
        FieldType::Double => {
            let b = fetch(buf, p, 8)?;
            used += 8;
            let mut a = [0u8; 8];
            a.copy_from_slice(b);
            Value::Double(f64::from_bits(u64::from_be_bytes(a)))
        }
        FieldType::Real => {
            let (m, n) = if unpacked {
                packed::get_i64_fixed(buf, p)?
            } else {
                packed::get_i64(buf, p)?
            };
            let hint_at = p + n;
            let hint = *buf.get(hint_at).ok_or(CodecError::TruncatedValue {
                pos: hint_at,
                need: 1,
                have: 0,
            })?;
            used += n + 1;
            Value::Real(Real {
                mantissa: m,
                decimals: hint & 0x0F,
            })
        }
        FieldType::Date => {
            let (v, n) = packed::get_u32(buf, p)?;
            used += n;
            Value::Date(v)
        }
        FieldType::Time => {
            let (v, n) = packed::get_u32(buf, p)?;
            used += n;
            Value::Time(v)
        }
        FieldType::TimeSec => {
            let (v, n) = packed::get_u32(buf, p)?;
            used += n;
            Value::TimeSec(v)
        }
        FieldType::UnixTime => {
            let (v, n) = if unpacked {
                packed::get_u64_fixed(buf, p)?
            } else {
                packed::get_u64(buf, p)?
            };
            used += n;
            Value::UnixTime(v)
        }
    };
    Ok((value, used))
}

fn fetch(buf: &[u8], at: usize, len: usize) -> Result<&[u8], CodecError> {
    let have = buf.len().saturating_sub(at);
    if have < len {
        return Err(CodecError::TruncatedValue {
            pos: at,
            need: len,
            have,
        });
    }
    Ok(&buf[at..at + len])
}

/// Append a field list; returns bytes written.
pub fn put_field_list(fields: &[Field], dst: &mut Vec<u8>) -> usize {
    let mark = dst.len();
    for f in fields {
        put_field(f, dst);
    }
    dst.len() - mark
}

/// Decode fields until the buffer is exhausted.
pub fn get_field_list(buf: &[u8]) -> Result<Vec<Field>, CodecError> {
    let mut at = 0;
    let mut out = Vec::new();
    while at < buf.len() {
        let (f, n) = get_field(buf, at)?;
        out.push(f);
        at += n;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_fields() -> Vec<Field> {
        vec![
            Field::new(22, Value::Str("IBM".to_string())),
            Field::new(25, Value::Double(185.32)),
            Field::new(66, Value::Int64(1_750_000)),
            Field::new(3, Value::Str("Real-time".to_string())),
            Field::new(6, Value::Real(Real { mantissa: -18545, decimals: 2 })),
            Field::new(7, Value::Float(1.5)),
            Field::new(8, Value::Int8(-3)),
            Field::new(9, Value::Int16(-1024)),
            Field::new(10, Value::UInt32(4_000_000_000)),
            Field::new(11, Value::UInt64(u64::max_value())),
            Field::new(12, Value::Bytes(vec![0, 1, 2, 0xFF])),
            Field::new(13, Value::Date(20260801)),
            Field::new(14, Value::Time(93000)),
            Field::new(15, Value::Vector(vec![1.0, -2.5, 3.25])),
            Field::new(16, Value::UnixTime(1_754_000_000_000_000_000)),
        ]
    }

    #[test]
    fn field_list_idempotent() {
        let fields = sample_fields();
        let mut buf = Vec::new();
        put_field_list(&fields, &mut buf);
        let got = get_field_list(&buf).unwrap();
        assert_eq!(got.len(), fields.len());
        for (a, b) in fields.iter().zip(got.iter()) {
            assert_eq!(a.fid, b.fid);
            assert_eq!(a.value, b.value);
        }
    }

    #[test]
    fn u64_beyond_packed_escapes() {
        let f = Field::new(1, Value::UInt64(u64::max_value()));
        let mut buf = Vec::new();
        put_field(&f, &mut buf);
        // fid(1) + flagged type + 8 fixed bytes
        assert_eq!(buf.len(), 1 + 1 + 8);
        assert_eq!(buf[1], FieldType::UInt64 as u8 | 0x80);
        let (got, used) = get_field(&buf, 0).unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(got.value, Value::UInt64(u64::max_value()));
    }

    #[test]
    fn unknown_type_reports_position() {
        let buf = [0x01u8, 0x7F, 0x00];
        match get_field(&buf, 0) {
            Err(CodecError::UnknownType { ty: 0x7F, pos: 1 }) => (),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn truncated_string_payload() {
        let f = Field::new(5, Value::Str("TICKER".to_string()));
        let mut buf = Vec::new();
        put_field(&f, &mut buf);
        assert!(matches!(
            get_field(&buf[..buf.len() - 2], 0),
            Err(CodecError::TruncatedValue { .. })
        ));
    }

    #[test]
    fn real_hint_carries_sign_and_decimals() {
        let f = Field::new(6, Value::Real(Real { mantissa: -18545, decimals: 2 }));
        let mut buf = Vec::new();
        put_field(&f, &mut buf);
        assert_eq!(buf[buf.len() - 1], 0x82);
        if let Value::Real(r) = get_field(&buf, 0).unwrap().0.value {
            assert_eq!(r.as_f64(), -185.45);
        } else {
            panic!("not a real");
        }
    }
}
