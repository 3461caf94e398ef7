//! Message envelope framing.
//!
//! The length is always four bytes big-endian so a receiver can frame
//! before it knows anything else; tag, time and RTL follow the
//! channel's pack mode. Field order on the wire: len, tag, dt, mt,
//! protocol, reserved, time, RTL.

use chrono::{DateTime, Duration, Local};
use num::FromPrimitive;

use crate::codec::packed;
use crate::error::CodecError;
use crate::util::midnight_of;

#[derive(Debug, PartialEq, FromPrimitive, Clone, Copy)]
pub enum MsgType {
    Mount = 1,
    Image = 2,
    Update = 3,
    Status = 4,
    Drop = 5,
    Open = 6,
    Close = 7,
    Ctl = 8,
    Ping = 9,
    Insert = 10,
    InsAck = 11,
    Query = 12,
}

impl MsgType {
    /// XML envelope element name for this message type.
    pub fn xml_name(&self) -> &'static str {
        match self {
            MsgType::Mount => "MNT",
            MsgType::Image => "IMG",
            MsgType::Update => "UPD",
            MsgType::Status => "STS",
            MsgType::Drop => "DRP",
            MsgType::Open => "OPN",
            MsgType::Close => "CLS",
            MsgType::Ctl => "CTL",
            MsgType::Ping => "Ping",
            MsgType::Insert => "INSERT",
            MsgType::InsAck => "INSACK",
            MsgType::Query => "QUERY",
        }
    }

    pub fn from_xml_name(name: &str) -> Option<MsgType> {
        let mt = match name {
            "MNT" => MsgType::Mount,
            "IMG" => MsgType::Image,
            "UPD" => MsgType::Update,
            "STS" => MsgType::Status,
            "DRP" => MsgType::Drop,
            "OPN" => MsgType::Open,
            "CLS" => MsgType::Close,
            "CTL" => MsgType::Ctl,
            "Ping" => MsgType::Ping,
            "INSERT" => MsgType::Insert,
            "INSACK" => MsgType::InsAck,
            "QUERY" => MsgType::Query,
            _ => return None,
        };
        Some(mt)
    }
}

#[derive(Debug, PartialEq, FromPrimitive, Clone, Copy)]
pub enum DataType {
    Undef = 0,
    Control = 1,
    Image = 2,
    Update = 3,
    Status = 4,
}

#[derive(Debug, PartialEq, FromPrimitive, Clone, Copy)]
pub enum Protocol {
    Binary = 1,
    Xml = 2,
    MarketFeed = 3,
}

/// Header length when everything is unpacked: len(4) + tag(4) +
/// dt/mt/protocol/reserved(4) + time(4) + RTL(4).
pub const HDR_FIXED_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinHdr {
    /// Total message length including this header.
    pub len: u32,
    /// Per-request correlator.
    pub tag: u32,
    pub dt: DataType,
    pub mt: MsgType,
    pub protocol: Protocol,
    /// 100-microsecond ticks since the sender's local midnight.
    pub time: u32,
    /// Round-trip counter, incremented at each hop.
    pub rtl: u32,
}

impl BinHdr {
    pub fn new(mt: MsgType, dt: DataType, tag: u32) -> Self {
        BinHdr {
            len: 0,
            tag,
            dt,
            mt,
            protocol: Protocol::Binary,
            time: crate::util::time100us_now(),
            rtl: 0,
        }
    }
}

/// Append the header with `len` left at zero; the caller patches it
/// once the body is in place. Returns header length in bytes.
pub fn put_hdr(h: &BinHdr, pack: bool, dst: &mut Vec<u8>) -> usize {
    let mark = dst.len();
    packed::put_u32_fixed(h.len, dst);
    if pack {
        packed::put_u32(h.tag, dst);
    } else {
        packed::put_u32_fixed(h.tag, dst);
    }
    dst.push(h.dt as u8);
    dst.push(h.mt as u8);
    dst.push(h.protocol as u8);
    dst.push(0); // reserved
    if pack {
        packed::put_u32(h.time, dst);
        packed::put_u32(h.rtl, dst);
    } else {
        packed::put_u32_fixed(h.time, dst);
        packed::put_u32_fixed(h.rtl, dst);
    }
    dst.len() - mark
}

/// Overwrite the 4-byte length at `at` once the full frame is built.
pub fn patch_len(dst: &mut Vec<u8>, at: usize, len: u32) {
    dst[at..at + 4].copy_from_slice(&len.to_be_bytes());
}

/// Decode a header at the start of `buf`. Returns (header, hdr_len);
/// `buf` need not hold the whole message yet.
pub fn get_hdr(buf: &[u8], pack: bool) -> Result<(BinHdr, usize), CodecError> {
    let (len, _) = packed::get_u32_fixed(buf, 0)?;
    let mut at = 4;
    let (tag, n) = if pack {
        packed::get_u32(buf, at)?
    } else {
        packed::get_u32_fixed(buf, at)?
    };
    at += n;
    let have = buf.len().saturating_sub(at);
    if have < 4 {
        return Err(CodecError::TruncatedValue {
            pos: at,
            need: 4,
            have,
        });
    }
    let dt = DataType::from_u8(buf[at]).ok_or(CodecError::MalformedFrame {
        pos: at,
        what: "bad data type",
    })?;
    let mt = MsgType::from_u8(buf[at + 1]).ok_or(CodecError::MalformedFrame {
        pos: at + 1,
        what: "bad message type",
    })?;
    let protocol =
        Protocol::from_u8(buf[at + 2]).ok_or(CodecError::UnsupportedProtocol(buf[at + 2]))?;
    at += 4; // dt, mt, protocol, reserved
    let (time, n) = if pack {
        packed::get_u32(buf, at)?
    } else {
        packed::get_u32_fixed(buf, at)?
    };
    at += n;
    let (rtl, n) = if pack {
        packed::get_u32(buf, at)?
    } else {
        packed::get_u32_fixed(buf, at)?
    };
    at += n;
    if (len as usize) < at {
        return Err(CodecError::MalformedFrame {
            pos: 0,
            what: "length shorter than header",
        });
    }
    let h = BinHdr {
        len,
        tag,
        dt,
        mt,
        protocol,
        time,
        rtl,
    };
    Ok((h, at))
}

/// Sender wall clock reconstructed from the header's midnight-relative
/// ticks. A result more than 12 hours ahead of now is pulled back 12
/// hours to cover late-evening messages crossing the midnight
/// boundary in the receiver's zone.
pub fn msg_time(time100us: u32) -> DateTime<Local> {
    let now = Local::now();
    let t = midnight_of(now) + Duration::microseconds(time100us as i64 * 100);
    if t.signed_duration_since(now) > Duration::hours(12) {
        t - Duration::hours(12)
    } else {
        t
    }
}
