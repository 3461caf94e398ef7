//! Field dictionary: fid ↔ (name, type, max length).
//!
//! One owning instance per channel. Mutation is bulk-replace: a new
//! table is built off to the side and published by swapping the root
//! pointer, so lookups never take a lock.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use arc_swap::ArcSwap;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::codec::field::{Field, FieldType};

#[derive(Debug, Clone, PartialEq)]
pub struct FldDef {
    pub fid: i32,
    pub name: String,
    pub ftype: FieldType,
    pub max_len: u32,
}

#[derive(Debug, Default)]
pub struct Schema {
    defs: Vec<Arc<FldDef>>,
    by_id: HashMap<i32, Arc<FldDef>>,
    by_name: HashMap<String, Arc<FldDef>>,
}

impl Schema {
    pub fn new(defs: Vec<FldDef>) -> Self {
        let mut s = Schema::default();
        for d in defs {
            let d = Arc::new(d);
            s.by_id.insert(d.fid, d.clone());
            s.by_name.insert(d.name.clone(), d.clone());
            s.defs.push(d);
        }
        s
    }

    /// Parse a `<schema><field fid= name= type= len=/>…</schema>`
    /// document, the form the wire and the LVC file head both carry.
    pub fn from_xml(text: &str) -> anyhow::Result<Schema> {
        let mut reader = Reader::from_str(text);
        reader.trim_text(true);
        let mut defs = Vec::new();
        loop {
            match reader.read_event().context("schema xml")? {
                Event::Start(e) | Event::Empty(e) => {
                    if e.name().as_ref() != b"field" {
                        continue;
                    }
                    let mut fid = None;
                    let mut name = None;
                    let mut ftype = None;
                    let mut max_len = 0u32;
                    for a in e.attributes() {
                        let a = a.context("schema attribute")?;
                        let val = a.unescape_value().context("schema attribute value")?;
                        match a.key.as_ref() {
                            b"fid" => fid = val.parse::<i32>().ok(),
                            b"name" => name = Some(val.into_owned()),
                            b"type" => ftype = FieldType::parse(&val),
                            b"len" => max_len = val.parse().unwrap_or(0),
                            _ => (),
                        }
                    }
                    match (fid, name, ftype) {
                        (Some(fid), Some(name), Some(ftype)) => defs.push(FldDef {
                            fid,
                            name,
                            ftype,
                            max_len,
                        }),
                        _ => log::warn!("[schema] skipping incomplete <field> definition"),
                    }
                }
                Event::Eof => break,
                _ => (),
            }
        }
        Ok(Schema::new(defs))
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::from("<schema>");
        for d in &self.defs {
            out.push_str(&format!(
                r#"<field fid="{}" name="{}" type="{}" len="{}"/>"#,
                d.fid,
                d.name,
                d.ftype.name(),
                d.max_len
            ));
        }
        out.push_str("</schema>");
        out
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    pub fn defs(&self) -> &[Arc<FldDef>] {
        &self.defs
    }

    pub fn by_id(&self, fid: i32) -> Option<&Arc<FldDef>> {
        self.by_id.get(&fid)
    }

    /// Case-sensitive.
    pub fn by_name(&self, name: &str) -> Option<&Arc<FldDef>> {
        self.by_name.get(name)
    }

    /// Fill in names on decoded fields.
    pub fn decorate(&self, fields: &mut Vec<Field>) {
        for f in fields.iter_mut() {
            if f.name.is_none() {
                f.name = self.by_id(f.fid).map(|d| d.name.clone());
            }
        }
    }
}

/// Channel-wide schema root. Replace publishes a whole new table;
/// readers load the pointer and go.
pub struct SchemaRef {
    root: ArcSwap<Schema>,
}

impl SchemaRef {
    pub fn new() -> Self {
        SchemaRef {
            root: ArcSwap::from_pointee(Schema::default()),
        }
    }

    pub fn get(&self) -> Arc<Schema> {
        self.root.load_full()
    }

    pub fn replace(&self, schema: Schema) {
        self.root.store(Arc::new(schema));
    }
}

impl Default for SchemaRef {
    fn default() -> Self {
        SchemaRef::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<schema>
        <field fid="22" name="BID" type="double" len="8"/>
        <field fid="25" name="ASK" type="double" len="8"/>
        <field fid="66" name="ACVOL_1" type="int64" len="8"/>
        <field fid="3" name="DSPLY_NAME" type="string" len="64"/>
    </schema>"#;

    #[test]
    fn parse_and_lookup() {
        let s = Schema::from_xml(SAMPLE).unwrap();
        assert_eq!(s.len(), 4);
        assert_eq!(s.by_id(22).unwrap().name, "BID");
        assert_eq!(s.by_name("ACVOL_1").unwrap().fid, 66);
        assert_eq!(s.by_name("ACVOL_1").unwrap().ftype, FieldType::Int64);
        // case-sensitive by design
        assert!(s.by_name("acvol_1").is_none());
    }

    #[test]
    fn xml_roundtrip() {
        let s = Schema::from_xml(SAMPLE).unwrap();
        let again = Schema::from_xml(&s.to_xml()).unwrap();
        assert_eq!(again.len(), s.len());
        assert_eq!(again.by_id(3).unwrap().name, "DSPLY_NAME");
    }

    #[test]
    fn bulk_replace_swaps_root() {
        let root = SchemaRef::new();
        assert!(root.get().is_empty());
        root.replace(Schema::from_xml(SAMPLE).unwrap());
        let held = root.get();
        root.replace(Schema::default());
        // old snapshot stays readable after the swap
        assert_eq!(held.by_id(22).unwrap().name, "BID");
        assert!(root.get().is_empty());
    }
}
