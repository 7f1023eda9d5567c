//! The key-value bag carried on every data frame.
//!
//! Encoded as a nested Y3 node: the root node (field 0x01) holds one child
//! node (field 0x02) per entry with `key`/`value` primitives. Keys are
//! serialized in lexicographic order so identical mappings always encode
//! to identical bytes; decode accepts any order. Unrecognized keys ride
//! along verbatim so relaying endpoints never drop them.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};

use crate::error::Error;
use crate::y3::{NodePacket, put_node, put_primitive, to_utf8};

/// Client id of the frame's originating source.
pub const SOURCE_ID_KEY: &str = "source-id";
/// Trace id propagated end to end.
pub const TID_KEY: &str = "tid";
/// Span id of the hop that produced the frame.
pub const SID_KEY: &str = "sid";
/// "true" when the tid/sid come from a configured tracer.
pub const TRACED_KEY: &str = "traced";
/// "true" when the companion payload is a stream reference.
pub const STREAMED_KEY: &str = "streamed";
/// Optional point-to-point routing target.
pub const TARGET_KEY: &str = "target";

const ROOT_FIELD: u8 = 0x01;
const ENTRY_FIELD: u8 = 0x02;
const KEY_FIELD: u8 = 0x01;
const VALUE_FIELD: u8 = 0x02;

fn bool_str(v: bool) -> &'static str {
    if v { "true" } else { "false" }
}

/// Order-insensitive string map with typed accessors for the recognized keys.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The default metadata written by a source for each outbound frame.
    #[must_use]
    pub fn new_default(source_id: &str, tid: &str, sid: &str, traced: bool, streamed: bool) -> Self {
        let mut m = Self::new();
        m.set(SOURCE_ID_KEY, source_id);
        m.set(TID_KEY, tid);
        m.set(SID_KEY, sid);
        m.set(TRACED_KEY, bool_str(traced));
        m.set(STREAMED_KEY, bool_str(streamed));
        m
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn source_id(&self) -> &str {
        self.get(SOURCE_ID_KEY).unwrap_or_default()
    }

    #[must_use]
    pub fn tid(&self) -> &str {
        self.get(TID_KEY).unwrap_or_default()
    }

    #[must_use]
    pub fn sid(&self) -> &str {
        self.get(SID_KEY).unwrap_or_default()
    }

    #[must_use]
    pub fn traced(&self) -> bool {
        self.get(TRACED_KEY) == Some("true")
    }

    #[must_use]
    pub fn streamed(&self) -> bool {
        self.get(STREAMED_KEY) == Some("true")
    }

    #[must_use]
    pub fn target(&self) -> Option<&str> {
        self.get(TARGET_KEY)
    }

    pub fn set_tid(&mut self, tid: &str) {
        self.set(TID_KEY, tid);
    }

    pub fn set_sid(&mut self, sid: &str) {
        self.set(SID_KEY, sid);
    }

    pub fn set_traced(&mut self, traced: bool) {
        self.set(TRACED_KEY, bool_str(traced));
    }

    pub fn set_streamed(&mut self, streamed: bool) {
        self.set(STREAMED_KEY, bool_str(streamed));
    }

    pub fn set_target(&mut self, target: &str) {
        self.set(TARGET_KEY, target);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Deterministic encode: entries in lexicographic key order.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::new();
        for (key, value) in &self.0 {
            let mut entry = BytesMut::new();
            put_primitive(&mut entry, KEY_FIELD, key.as_bytes());
            put_primitive(&mut entry, VALUE_FIELD, value.as_bytes());
            put_node(&mut body, ENTRY_FIELD, &entry);
        }
        let mut buf = BytesMut::with_capacity(body.len() + 6);
        put_node(&mut buf, ROOT_FIELD, &body);
        buf.freeze()
    }

    /// Accepts entries in any order. An empty block decodes to an empty map.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] on invalid TLV structure or non-UTF-8
    /// keys/values.
    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        if data.is_empty() {
            return Ok(Self::new());
        }
        let (root, _) = NodePacket::decode(data)?;
        let mut map = BTreeMap::new();
        for entry in root.nodes(ENTRY_FIELD) {
            let key = entry
                .primitive(KEY_FIELD)
                .ok_or_else(|| Error::malformed("metadata entry missing key"))?;
            let value = entry.primitive(VALUE_FIELD).unwrap_or_default();
            map.insert(to_utf8(key)?, to_utf8(value)?);
        }
        Ok(Self(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_metadata_fields() {
        let m = Metadata::new_default("src-1", "tid-1", "sid-1", true, false);
        assert_eq!(m.source_id(), "src-1");
        assert_eq!(m.tid(), "tid-1");
        assert_eq!(m.sid(), "sid-1");
        assert!(m.traced());
        assert!(!m.streamed());
        assert_eq!(m.target(), None);
    }

    #[test]
    fn roundtrip() {
        let mut m = Metadata::new_default("src", "t", "s", false, true);
        m.set_target("targetString");
        m.set("x-custom", "kept");
        let decoded = Metadata::decode(&m.encode()).unwrap();
        assert_eq!(decoded, m);
        assert_eq!(decoded.get("x-custom"), Some("kept"));
    }

    #[test]
    fn key_order_independence() {
        // Two wire encodings differing only in entry order decode equal.
        let mut ab = BytesMut::new();
        let mut ba = BytesMut::new();
        for (order, buf) in [(["a", "b"], &mut ab), (["b", "a"], &mut ba)] {
            let mut body = BytesMut::new();
            for key in order {
                let mut entry = BytesMut::new();
                put_primitive(&mut entry, KEY_FIELD, key.as_bytes());
                put_primitive(&mut entry, VALUE_FIELD, format!("v-{key}").as_bytes());
                put_node(&mut body, ENTRY_FIELD, &entry);
            }
            put_node(buf, ROOT_FIELD, &body);
        }
        assert_ne!(ab, ba);
        assert_eq!(
            Metadata::decode(&ab).unwrap(),
            Metadata::decode(&ba).unwrap()
        );
    }

    #[test]
    fn deterministic_encode() {
        let mut first = Metadata::new();
        first.set("zeta", "1");
        first.set("alpha", "2");
        let mut second = Metadata::new();
        second.set("alpha", "2");
        second.set("zeta", "1");
        assert_eq!(first.encode(), second.encode());
    }

    #[test]
    fn empty_block_decodes_empty() {
        assert_eq!(Metadata::decode(&[]).unwrap(), Metadata::new());
        let empty = Metadata::new();
        assert_eq!(Metadata::decode(&empty.encode()).unwrap(), empty);
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(Metadata::decode(&[0x01, 0x02, 0x03]).is_err());
    }
}
