//! XML alternate encoding.
//!
//! The envelope element is the message-type name (IMG, UPD, STS, …);
//! fields ride as `<fld>` children so a message decodes without a
//! schema in hand. FIDs lists accept both the FS (0x1C) packed form
//! and plain CSV; service lists split on ';' and service:status pairs
//! on ':'.

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::codec::field::{Field, FieldType, Real, Value};
use crate::codec::header::MsgType;
use crate::error::CodecError;

/// Packed attribute-list separator.
pub const FS: char = '\u{1C}';
pub const SVC_SEP: char = ';';
pub const PAIR_SEP: char = ':';
pub const ITEM_SEP: char = '|';

#[derive(Debug, Clone, Default, PartialEq)]
pub struct XmlMsg {
    pub mt: Option<MsgType>,
    /// (service, ticker)
    pub item: Option<(String, String)>,
    pub tag: Option<u32>,
    pub time: Option<u32>,
    pub rtl: Option<u32>,
    pub fids: Vec<i32>,
    pub peer: Option<String>,
    pub pid: Option<u32>,
    /// Status / control body text.
    pub text: Option<String>,
    pub fields: Vec<Field>,
}

impl XmlMsg {
    pub fn new(mt: MsgType) -> Self {
        XmlMsg {
            mt: Some(mt),
            ..Default::default()
        }
    }

    pub fn with_item(mt: MsgType, svc: &str, tkr: &str) -> Self {
        let mut m = XmlMsg::new(mt);
        m.item = Some((svc.to_string(), tkr.to_string()));
        m
    }
}

fn escape_into(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
}

fn push_attr(out: &mut String, name: &str, val: &str) {
    out.push(' ');
    out.push_str(name);
    out.push_str("=\"");
    escape_into(val, out);
    out.push('"');
}

/// Serialize to the wire form. Always valid UTF-8.
pub fn encode(msg: &XmlMsg) -> Vec<u8> {
    let mt = msg.mt.unwrap_or(MsgType::Ctl);
    let mut out = String::with_capacity(64);
    out.push('<');
    out.push_str(mt.xml_name());
    if let Some((svc, tkr)) = &msg.item {
        push_attr(&mut out, "Item", &format!("{}{}{}", svc, ITEM_SEP, tkr));
    }
    if let Some(tag) = msg.tag {
        push_attr(&mut out, "tag", &tag.to_string());
    }
    if let Some(t) = msg.time {
        push_attr(&mut out, "Time", &t.to_string());
    }
    if let Some(rtl) = msg.rtl {
        push_attr(&mut out, "RTL", &rtl.to_string());
    }
    if !msg.fids.is_empty() {
        let csv = msg
            .fids
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join(",");
        push_attr(&mut out, "FIDs", &csv);
    }
    if let Some(peer) = &msg.peer {
        push_attr(&mut out, "PEER", peer);
    }
    if let Some(pid) = msg.pid {
        push_attr(&mut out, "PID", &pid.to_string());
    }
    if msg.fields.is_empty() && msg.text.is_none() {
        out.push_str("/>");
        return out.into_bytes();
    }
    out.push('>');
    if let Some(text) = &msg.text {
        escape_into(text, &mut out);
    }
    for f in &msg.fields {
        out.push_str("<fld");
        push_attr(&mut out, "fid", &f.fid.to_string());
        if let Some(name) = &f.name {
            push_attr(&mut out, "FieldName", name);
        }
        push_attr(&mut out, "type", f.value.ftype().name());
        if let Value::Real(r) = &f.value {
            push_attr(&mut out, "Decimal", &r.decimals.to_string());
            out.push('>');
            out.push_str(&r.mantissa.to_string());
        } else {
            out.push('>');
            let mut body = String::new();
            value_text(&f.value, &mut body);
            escape_into(&body, &mut out);
        }
        out.push_str("</fld>");
    }
    out.push_str("</");
    out.push_str(mt.xml_name());
    out.push('>');
    out.into_bytes()
}

fn value_text(v: &Value, out: &mut String) {
    match v {
        Value::Str(s) => out.push_str(s),
        Value::Bytes(b) => {
            for x in b {
                out.push_str(&format!("{:02X}", x));
            }
        }
        Value::Vector(ds) => {
            let csv = ds
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(",");
            out.push_str(&csv);
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Split a FIDs attribute: FS-packed or CSV.
pub fn parse_fids(s: &str) -> Vec<i32> {
    s.split(|c| c == FS || c == ',')
        .filter_map(|t| t.trim().parse::<i32>().ok())
        .collect()
}

/// Split "svc:state;svc:state" service-status lists.
pub fn parse_svc_states(s: &str) -> Vec<(String, bool)> {
    s.split(SVC_SEP)
        .filter(|t| !t.is_empty())
        .filter_map(|t| {
            let mut it = t.splitn(2, PAIR_SEP);
            let svc = it.next()?.to_string();
            let up = it.next().map(|st| st == "up").unwrap_or(false);
            Some((svc, up))
        })
        .collect()
}

fn bad(pos: usize, what: &'static str) -> CodecError {
    CodecError::MalformedFrame { pos, what }
}

fn parse_fld(attrs: &[(String, String)], body: &str, pos: usize) -> Result<Field, CodecError> {
    let mut fid = None;
    let mut name = None;
    let mut ftype = None;
    let mut decimals = 0u8;
    for (k, v) in attrs {
        match k.as_str() {
            "fid" => fid = v.parse::<i32>().ok(),
            "FieldName" => name = Some(v.clone()),
            "type" => ftype = FieldType::parse(v),
            "Decimal" => decimals = v.parse().unwrap_or(0),
            _ => (),
        }
    }
    let fid = fid.ok_or_else(|| bad(pos, "fld without fid"))?;
    let ftype = ftype.ok_or_else(|| bad(pos, "fld without type"))?;
    let body = body.trim();
    let value = match ftype {
        FieldType::String => Value::Str(body.to_string()),
        FieldType::Int32 => Value::Int32(body.parse().map_err(|_| bad(pos, "bad int32"))?),
        FieldType::Double => Value::Double(body.parse().map_err(|_| bad(pos, "bad double"))?),
        FieldType::Date => Value::Date(body.parse().map_err(|_| bad(pos, "bad date"))?),
        FieldType::Time => Value::Time(body.parse().map_err(|_| bad(pos, "bad time"))?),
        FieldType::TimeSec => Value::TimeSec(body.parse().map_err(|_| bad(pos, "bad timeSec"))?),
        FieldType::Float => Value::Float(body.parse().map_err(|_| bad(pos, "bad float"))?),
        FieldType::Int8 => Value::Int8(body.parse().map_err(|_| bad(pos, "bad int8"))?),
        FieldType::Int16 => Value::Int16(body.parse().map_err(|_| bad(pos, "bad int16"))?),
        FieldType::Int64 => Value::Int64(body.parse().map_err(|_| bad(pos, "bad int64"))?),
        FieldType::Real => Value::Real(Real {
            mantissa: body.parse().map_err(|_| bad(pos, "bad real mantissa"))?,
            decimals,
        }),
        FieldType::ByteStream => {
            if body.len() % 2 != 0 {
                return Err(bad(pos, "odd hex bytestream"));
            }
            let mut v = Vec::with_capacity(body.len() / 2);
            for i in (0..body.len()).step_by(2) {
                v.push(
                    u8::from_str_radix(&body[i..i + 2], 16)
                        .map_err(|_| bad(pos, "bad hex bytestream"))?,
                );
            }
            Value::Bytes(v)
        }
        FieldType::UnixTime => Value::UnixTime(body.parse().map_err(|_| bad(pos, "bad unixTime"))?),
        FieldType::Vector => {
            let mut v = Vec::new();
            for t in body.split(',').filter(|t| !t.trim().is_empty()) {
                v.push(t.trim().parse().map_err(|_| bad(pos, "bad vector entry"))?);
            }
            Value::Vector(v)
        }
        FieldType::UInt32 => Value::UInt32(body.parse().map_err(|_| bad(pos, "bad uint32"))?),
        FieldType::UInt64 => Value::UInt64(body.parse().map_err(|_| bad(pos, "bad uint64"))?),
    };
    Ok(Field { fid, name, value })
}

/// Decode one XML message.
pub fn decode(buf: &[u8]) -> Result<XmlMsg, CodecError> {
    let text = std::str::from_utf8(buf).map_err(|e| bad(e.valid_up_to(), "not utf-8"))?;
    let mut reader = Reader::from_str(text);
    reader.trim_text(true);
    let mut msg = XmlMsg::default();
    let mut in_fld: Option<(Vec<(String, String)>, usize)> = None;
    let mut fld_body = String::new();
    loop {
        let pos = reader.buffer_position();
        match reader.read_event() {
            Ok(ev) if matches!(ev, Event::Start(_)) || matches!(ev, Event::Empty(_)) => {
                let is_empty = matches!(ev, Event::Empty(_));
                let e = match &ev {
                    Event::Start(e) | Event::Empty(e) => e,
                    _ => unreachable!(),
                };
                let raw_name = e.name();
                let elem = std::str::from_utf8(raw_name.as_ref())
                    .map_err(|_| bad(pos, "bad element name"))?
                    .to_string();
                let mut attrs = Vec::new();
                for a in e.attributes() {
                    let a = a.map_err(|_| bad(pos, "bad attribute"))?;
                    let k = std::str::from_utf8(a.key.as_ref())
                        .map_err(|_| bad(pos, "bad attribute name"))?
                        .to_string();
                    let v = a
                        .unescape_value()
                        .map_err(|_| bad(pos, "bad attribute value"))?
                        .into_owned();
                    attrs.push((k, v));
                }
                if msg.mt.is_none() && in_fld.is_none() {
                    let mt = MsgType::from_xml_name(&elem).ok_or_else(|| bad(pos, "unknown envelope"))?;
                    msg.mt = Some(mt);
                    for (k, v) in &attrs {
                        match k.as_str() {
                            "Item" => {
                                let mut it = v.splitn(2, ITEM_SEP);
                                let svc = it.next().unwrap_or("").to_string();
                                let tkr = it.next().unwrap_or("").to_string();
                                msg.item = Some((svc, tkr));
                            }
                            "tag" => msg.tag = v.parse().ok(),
                            "Time" => msg.time = v.parse().ok(),
                            "RTL" => msg.rtl = v.parse().ok(),
                            "FIDs" => msg.fids = parse_fids(v),
                            "PEER" => msg.peer = Some(v.clone()),
                            "PID" => msg.pid = v.parse().ok(),
                            _ => (),
                        }
                    }
                } else if elem == "fld" {
                    if is_empty {
                        msg.fields.push(parse_fld(&attrs, "", pos)?);
                    } else {
                        in_fld = Some((attrs, pos));
                        fld_body.clear();
                    }
                } else {
                    return Err(bad(pos, "unexpected element"));
                }
            }
            Ok(Event::Text(t)) => {
                let s = t.unescape().map_err(|_| bad(pos, "bad text"))?;
                if in_fld.is_some() {
                    fld_body.push_str(&s);
                } else if msg.mt.is_some() {
                    msg.text = Some(s.into_owned());
                }
            }
            Ok(Event::End(e)) => {
                if e.name().as_ref() == b"fld" {
                    if let Some((attrs, fpos)) = in_fld.take() {
                        msg.fields.push(parse_fld(&attrs, &fld_body, fpos)?);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => (),
            Err(_) => return Err(bad(pos, "xml parse error")),
        }
    }
    if msg.mt.is_none() {
        return Err(bad(0, "no envelope element"));
    }
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_roundtrip() {
        let mut m = XmlMsg::with_item(MsgType::Image, "IDN", "IBM");
        m.tag = Some(5);
        m.time = Some(341_222_187);
        m.rtl = Some(2);
        m.fields = vec![
            Field::new(22, Value::Str("IBM".to_string())),
            Field::new(25, Value::Double(185.32)),
            Field::new(
                6,
                Value::Real(Real {
                    mantissa: -18545,
                    decimals: 2,
                }),
            ),
        ];
        let bytes = encode(&m);
        let got = decode(&bytes).unwrap();
        assert_eq!(got.mt, Some(MsgType::Image));
        assert_eq!(got.item, Some(("IDN".to_string(), "IBM".to_string())));
        assert_eq!(got.tag, Some(5));
        assert_eq!(got.fields, m.fields);
    }

    #[test]
    fn open_with_fid_filter() {
        let mut m = XmlMsg::with_item(MsgType::Open, "IDN", "IBM");
        m.fids = vec![22, 25, 66];
        let got = decode(&encode(&m)).unwrap();
        assert_eq!(got.mt, Some(MsgType::Open));
        assert_eq!(got.fids, vec![22, 25, 66]);
    }

    #[test]
    fn fs_packed_fid_list() {
        assert_eq!(parse_fids("22\u{1C}25\u{1C}66"), vec![22, 25, 66]);
        assert_eq!(parse_fids("22,25,66"), vec![22, 25, 66]);
    }

    #[test]
    fn svc_state_pairs() {
        let v = parse_svc_states("IDN:up;PB:down");
        assert_eq!(
            v,
            vec![("IDN".to_string(), true), ("PB".to_string(), false)]
        );
    }

    #[test]
    fn status_body_text() {
        let mut m = XmlMsg::with_item(MsgType::Status, "IDN", "IBM");
        m.text = Some("stale <upstream>".to_string());
        let got = decode(&encode(&m)).unwrap();
        assert_eq!(got.text.as_deref(), Some("stale <upstream>"));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            decode(b"<NOPE/>"),
            Err(CodecError::MalformedFrame { .. })
        ));
        assert!(matches!(
            decode(&[0xFF, 0xFE, 0x00]),
            Err(CodecError::MalformedFrame { .. })
        ));
        assert!(matches!(
            decode(b"plain text"),
            Err(CodecError::MalformedFrame { .. })
        ));
    }

    #[test]
    fn empty_fld_element_is_empty_string() {
        let got = decode(br#"<UPD Item="IDN|IBM"><fld fid="3" type="string"/></UPD>"#).unwrap();
        assert_eq!(got.fields[0].value, Value::Str(String::new()));
    }
}
