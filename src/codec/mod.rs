//! Bi-directional translation between in-memory messages and the
//! wire. The binary envelope is common to every protocol; the body is
//! binary field data, an XML document, or marketfeed text depending
//! on the channel's active protocol byte.

pub mod field;
pub mod header;
pub mod lists;
pub mod packed;
pub mod xml;

pub use field::{Field, FieldType, Real, Value};
pub use header::{msg_time, BinHdr, DataType, MsgType, Protocol};

use num::FromPrimitive;

use crate::error::CodecError;

/// Stream status carried by status messages. Stale and dead are
/// delivered to listeners without dropping the stream.
#[derive(Debug, PartialEq, FromPrimitive, Clone, Copy)]
pub enum StreamState {
    Up = 1,
    Stale = 2,
    Dead = 3,
    Recovering = 4,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MsgBody {
    /// Image / update / insert payload.
    Fields(Vec<Field>),
    /// Open / close / drop name the stream.
    Item { svc: String, tkr: String },
    /// Plaintext mount exchange.
    Mount { user: String, auth: String },
    Status { state: StreamState, text: String },
    /// Control plane text: schema XML or `svc:state;...` lists.
    Text(String),
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WireMsg {
    pub hdr: BinHdr,
    pub body: MsgBody,
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

/// Wire codec for one channel. Pack mode and protocol are channel
/// state: pack is fixed at construction, the protocol switches only
/// through the channel's protocol-change operation.
#[derive(Debug, Clone)]
pub struct Codec {
    protocol: Protocol,
    pack: bool,
}

impl Codec {
    pub fn new(pack: bool) -> Self {
        Codec {
            protocol: Protocol::Binary,
            pack,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn pack(&self) -> bool {
        self.pack
    }

    /// The caller (channel) must have verified the output buffer is
    /// idle before switching.
    pub fn set_protocol(&mut self, p: Protocol) {
        self.protocol = p;
    }

    /// Header-only ping frame.
    pub fn ping(&self) -> Vec<u8> {
        let hdr = BinHdr::new(MsgType::Ping, DataType::Control, 0);
        self.encode(hdr, &MsgBody::Empty)
    }

    /// Serialize one message; patches the envelope length.
    pub fn encode(&self, mut hdr: BinHdr, body: &MsgBody) -> Vec<u8> {
        hdr.protocol = self.protocol;
        let mut out = Vec::with_capacity(64);
        header::put_hdr(&hdr, self.pack, &mut out);
        match self.protocol {
            Protocol::Binary => Self::put_body_binary(body, &mut out),
            Protocol::Xml => {
                let x = self.to_xml(&hdr, body);
                out.extend_from_slice(&xml::encode(&x));
            }
            Protocol::MarketFeed => Self::put_body_mf(body, &mut out),
        }
        let len = out.len() as u32;
        header::patch_len(&mut out, 0, len);
        out
    }

    fn put_body_binary(body: &MsgBody, out: &mut Vec<u8>) {
        match body {
            MsgBody::Fields(fl) => {
                field::put_field_list(fl, out);
            }
            MsgBody::Item { svc, tkr } => {
                put_str(svc, out);
                put_str(tkr, out);
            }
            MsgBody::Mount { user, auth } => {
                put_str(user, out);
                put_str(auth, out);
            }
            MsgBody::Status { state, text } => {
                out.push(*state as u8);
                out.extend_from_slice(text.as_bytes());
            }
            MsgBody::Text(t) => out.extend_from_slice(t.as_bytes()),
            MsgBody::Empty => (),
        }
    }

    fn put_body_mf(body: &MsgBody, out: &mut Vec<u8>) {
        // marketfeed rides as FS-separated "fid value" text
        if let MsgBody::Fields(fl) = body {
            let mut first = true;
            for f in fl {
                if !first {
                    out.push(0x1C);
                }
                first = false;
                out.extend_from_slice(format!("{} {}", f.fid, f.value).as_bytes());
            }
        }
    }

    fn to_xml(&self, hdr: &BinHdr, body: &MsgBody) -> xml::XmlMsg {
        let mut x = xml::XmlMsg::new(hdr.mt);
        x.tag = Some(hdr.tag);
        x.time = Some(hdr.time);
        x.rtl = Some(hdr.rtl);
        match body {
            MsgBody::Fields(fl) => x.fields = fl.clone(),
            MsgBody::Item { svc, tkr } => x.item = Some((svc.clone(), tkr.clone())),
            MsgBody::Mount { user, auth } => {
                x.peer = Some(user.clone());
                x.text = Some(auth.clone());
            }
            MsgBody::Status { state, text } => {
                x.text = Some(format!("{}:{}", *state as u8, text));
            }
            MsgBody::Text(t) => x.text = Some(t.clone()),
            MsgBody::Empty => (),
        }
        x
    }

    /// Decode one complete frame (the socket has already enforced
    /// `len` bytes are present).
    pub fn decode(&self, frame: &[u8]) -> Result<WireMsg, CodecError> {
        let (hdr, hlen) = header::get_hdr(frame, self.pack)?;
        if frame.len() < hdr.len as usize {
            return Err(CodecError::TruncatedValue {
                pos: 0,
                need: hdr.len as usize,
                have: frame.len(),
            });
        }
        let body_bytes = &frame[hlen..hdr.len as usize];
        let body = match hdr.protocol {
            Protocol::Binary => Self::get_body_binary(&hdr, body_bytes, hlen)?,
            Protocol::Xml => {
                let x = xml::decode(body_bytes)?;
                Self::from_xml(&hdr, x)?
            }
            Protocol::MarketFeed => Self::get_body_mf(body_bytes),
        };
        Ok(WireMsg { hdr, body })
    }

    fn get_body_binary(hdr: &BinHdr, b: &[u8], base: usize) -> Result<MsgBody, CodecError> {
        let shift = |e: CodecError| match e {
            CodecError::TruncatedValue { pos, need, have } => CodecError::TruncatedValue {
                pos: pos + base,
                need,
                have,
            },
            CodecError::MalformedFrame { pos, what } => CodecError::MalformedFrame {
                pos: pos + base,
                what,
            },
            CodecError::UnknownType { ty, pos } => CodecError::UnknownType {
                ty,
                pos: pos + base,
            },
            other => other,
        };
        let body = match hdr.mt {
            MsgType::Image | MsgType::Update | MsgType::Insert | MsgType::InsAck
            | MsgType::Query => MsgBody::Fields(field::get_field_list(b).map_err(shift)?),
            MsgType::Open | MsgType::Close | MsgType::Drop => {
                let (svc, n) = get_str(b, 0).map_err(shift)?;
                let (tkr, _) = get_str(b, n).map_err(shift)?;
                MsgBody::Item { svc, tkr }
            }
            MsgType::Mount => {
                let (user, n) = get_str(b, 0).map_err(shift)?;
                let (auth, _) = get_str(b, n).map_err(shift)?;
                MsgBody::Mount { user, auth }
            }
            MsgType::Status => {
                if b.is_empty() {
                    return Err(CodecError::TruncatedValue {
                        pos: base,
                        need: 1,
                        have: 0,
                    });
                }
                let state = StreamState::from_u8(b[0]).ok_or(CodecError::MalformedFrame {
                    pos: base,
                    what: "bad stream state",
                })?;
                MsgBody::Status {
                    state,
                    text: String::from_utf8_lossy(&b[1..]).into_owned(),
                }
            }
            MsgType::Ctl => MsgBody::Text(String::from_utf8_lossy(b).into_owned()),
            MsgType::Ping => MsgBody::Empty,
        };
        Ok(body)
    }

    fn get_body_mf(b: &[u8]) -> MsgBody {
        let text = String::from_utf8_lossy(b);
        let mut fl = Vec::new();
        for part in text.split('\u{1C}').filter(|p| !p.is_empty()) {
            let mut it = part.splitn(2, ' ');
            if let (Some(fid), Some(val)) = (it.next(), it.next()) {
                if let Ok(fid) = fid.parse::<i32>() {
                    fl.push(Field::new(fid, Value::Str(val.to_string())));
                }
            }
        }
        MsgBody::Fields(fl)
    }

    fn from_xml(hdr: &BinHdr, x: xml::XmlMsg) -> Result<MsgBody, CodecError> {
        let body = match hdr.mt {
            MsgType::Image | MsgType::Update | MsgType::Insert | MsgType::InsAck
            | MsgType::Query => MsgBody::Fields(x.fields),
            MsgType::Open | MsgType::Close | MsgType::Drop => {
                let (svc, tkr) = x.item.unwrap_or_default();
                MsgBody::Item { svc, tkr }
            }
            MsgType::Mount => MsgBody::Mount {
                user: x.peer.unwrap_or_default(),
                auth: x.text.unwrap_or_default(),
            },
            MsgType::Status => {
                let raw = x.text.unwrap_or_default();
                let mut it = raw.splitn(2, ':');
                let state = it
                    .next()
                    .and_then(|s| s.parse::<u8>().ok())
                    .and_then(StreamState::from_u8)
                    .unwrap_or(StreamState::Dead);
                MsgBody::Status {
                    state,
                    text: it.next().unwrap_or("").to_string(),
                }
            }
            MsgType::Ctl => MsgBody::Text(x.text.unwrap_or_default()),
            MsgType::Ping => MsgBody::Empty,
        };
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(codec: &Codec, mt: MsgType, dt: DataType, body: MsgBody) -> WireMsg {
        let hdr = BinHdr::new(mt, dt, 42);
        let frame = codec.encode(hdr, &body);
        let got = codec.decode(&frame).unwrap();
        assert_eq!(got.hdr.len as usize, frame.len());
        assert_eq!(got.body, body);
        got
    }

    #[test]
    fn binary_bodies_roundtrip() {
        for &pack in &[false, true] {
            let codec = Codec::new(pack);
            roundtrip(
                &codec,
                MsgType::Image,
                DataType::Image,
                MsgBody::Fields(vec![
                    Field::new(22, Value::Str("IBM".to_string())),
                    Field::new(25, Value::Double(185.32)),
                ]),
            );
            roundtrip(
                &codec,
                MsgType::Open,
                DataType::Control,
                MsgBody::Item {
                    svc: "IDN".to_string(),
                    tkr: "IBM".to_string(),
                },
            );
            roundtrip(
                &codec,
                MsgType::Mount,
                DataType::Control,
                MsgBody::Mount {
                    user: "trader1".to_string(),
                    auth: "hunter2".to_string(),
                },
            );
            roundtrip(
                &codec,
                MsgType::Status,
                DataType::Status,
                MsgBody::Status {
                    state: StreamState::Stale,
                    text: "upstream stale".to_string(),
                },
            );
            roundtrip(&codec, MsgType::Ping, DataType::Control, MsgBody::Empty);
        }
    }

    #[test]
    fn xml_protocol_roundtrip() {
        let mut codec = Codec::new(true);
        codec.set_protocol(Protocol::Xml);
        roundtrip(
            &codec,
            MsgType::Update,
            DataType::Update,
            MsgBody::Fields(vec![Field::new(25, Value::Double(185.45))]),
        );
        roundtrip(
            &codec,
            MsgType::Close,
            DataType::Control,
            MsgBody::Item {
                svc: "IDN".to_string(),
                tkr: "IBM".to_string(),
            },
        );
    }

    #[test]
    fn marketfeed_body_parses_as_text_fields() {
        let mut codec = Codec::new(false);
        codec.set_protocol(Protocol::MarketFeed);
        let hdr = BinHdr::new(MsgType::Update, DataType::Update, 1);
        let frame = codec.encode(
            hdr,
            &MsgBody::Fields(vec![
                Field::new(25, Value::Str("185.45".to_string())),
                Field::new(66, Value::Str("1800000".to_string())),
            ]),
        );
        let got = codec.decode(&frame).unwrap();
        match got.body {
            MsgBody::Fields(fl) => {
                assert_eq!(fl.len(), 2);
                assert_eq!(fl[0].fid, 25);
                assert_eq!(fl[0].value, Value::Str("185.45".to_string()));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn ping_is_header_only() {
        let codec = Codec::new(true);
        let frame = codec.ping();
        let got = codec.decode(&frame).unwrap();
        assert_eq!(got.hdr.mt, MsgType::Ping);
        assert_eq!(got.body, MsgBody::Empty);
        assert_eq!(got.hdr.len as usize, frame.len());
    }
}
