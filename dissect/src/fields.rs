//! Per-session typed field store and the process-wide field registry.
//!
//! The registry is append-only during engine construction and read-only
//! afterwards. Each field slot has a declared type that never changes; the
//! hash-typed variants keep insertion order but store each distinct value at
//! most once per session.

use log::warn;
use serde_json::{json, Map, Value};

pub const FLAG_CNT: u16 = 0x0001;
pub const FLAG_SCNT: u16 = 0x0002;
pub const FLAG_FORCE_UTF8: u16 = 0x0004;
pub const FLAG_HEADERS: u16 = 0x0008;

/// Index into the field registry and every session's field store.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct FieldId(pub usize);

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FieldKind {
    Int,
    IntArray,
    IntHash,
    Str,
    StrArray,
    StrHash,
    IpHash,
}

#[derive(Clone, Debug)]
pub struct FieldDef {
    pub name: &'static str,
    pub kind: FieldKind,
    pub flags: u16,
}

/// The standard field ids, in registration order of [`FieldRegistry::standard`].
pub mod field {
    use super::FieldId;

    pub const TAGS: FieldId = FieldId(0);

    pub const HTTP_HOST: FieldId = FieldId(1);
    pub const HTTP_URLS: FieldId = FieldId(2);
    pub const HTTP_XFF: FieldId = FieldId(3);
    pub const HTTP_UA: FieldId = FieldId(4);
    pub const HTTP_TAGS_REQ: FieldId = FieldId(5);
    pub const HTTP_TAGS_RES: FieldId = FieldId(6);
    pub const HTTP_MD5: FieldId = FieldId(7);
    pub const HTTP_VER_REQ: FieldId = FieldId(8);
    pub const HTTP_VER_RES: FieldId = FieldId(9);

    pub const SSH_VER: FieldId = FieldId(10);
    pub const SSH_KEY: FieldId = FieldId(11);

    pub const DNS_IP: FieldId = FieldId(12);
    pub const DNS_HOST: FieldId = FieldId(13);

    pub const EMAIL_HOST: FieldId = FieldId(14);
    pub const EMAIL_UA: FieldId = FieldId(15);
    pub const EMAIL_SRC: FieldId = FieldId(16);
    pub const EMAIL_DST: FieldId = FieldId(17);
    pub const EMAIL_SUB: FieldId = FieldId(18);
    pub const EMAIL_ID: FieldId = FieldId(19);
    pub const EMAIL_CT: FieldId = FieldId(20);
    pub const EMAIL_MV: FieldId = FieldId(21);
    pub const EMAIL_FN: FieldId = FieldId(22);
    pub const EMAIL_MD5: FieldId = FieldId(23);
    pub const EMAIL_FCT: FieldId = FieldId(24);
    pub const EMAIL_IP: FieldId = FieldId(25);

    pub const IRC_NICK: FieldId = FieldId(26);
    pub const IRC_CHANNELS: FieldId = FieldId(27);
}

/// Append-only table of field definitions.
#[derive(Clone, Debug, Default)]
pub struct FieldRegistry {
    defs: Vec<FieldDef>,
}

impl FieldRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a field and return its id. Init-time only.
    pub fn define(&mut self, name: &'static str, kind: FieldKind, flags: u16) -> FieldId {
        self.defs.push(FieldDef { name, kind, flags });
        FieldId(self.defs.len() - 1)
    }

    pub fn def(&self, id: FieldId) -> &FieldDef {
        &self.defs[id.0]
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// The built-in field table.
    pub fn standard() -> Self {
        use self::FieldKind::*;

        let mut reg = Self::new();
        assert_eq!(field::TAGS, reg.define("ta", StrHash, FLAG_CNT));

        assert_eq!(field::HTTP_HOST, reg.define("ho", StrHash, FLAG_CNT));
        assert_eq!(field::HTTP_URLS, reg.define("us", StrArray, FLAG_CNT));
        assert_eq!(field::HTTP_XFF, reg.define("xff", IpHash, FLAG_SCNT));
        assert_eq!(field::HTTP_UA, reg.define("ua", StrHash, FLAG_CNT));
        assert_eq!(
            field::HTTP_TAGS_REQ,
            reg.define("hh1", StrHash, FLAG_CNT | FLAG_HEADERS)
        );
        assert_eq!(
            field::HTTP_TAGS_RES,
            reg.define("hh2", StrHash, FLAG_CNT | FLAG_HEADERS)
        );
        assert_eq!(field::HTTP_MD5, reg.define("hmd5", StrHash, FLAG_CNT));
        assert_eq!(field::HTTP_VER_REQ, reg.define("hsver", StrHash, FLAG_CNT));
        assert_eq!(field::HTTP_VER_RES, reg.define("hdver", StrHash, FLAG_CNT));

        assert_eq!(field::SSH_VER, reg.define("sshver", StrHash, FLAG_CNT));
        assert_eq!(field::SSH_KEY, reg.define("sshkey", StrHash, FLAG_CNT));

        assert_eq!(field::DNS_IP, reg.define("dnsip", IpHash, FLAG_CNT));
        assert_eq!(field::DNS_HOST, reg.define("dnsho", StrHash, FLAG_CNT));

        assert_eq!(field::EMAIL_HOST, reg.define("eho", StrHash, FLAG_CNT));
        assert_eq!(field::EMAIL_UA, reg.define("eua", StrHash, FLAG_CNT));
        assert_eq!(field::EMAIL_SRC, reg.define("esrc", StrHash, FLAG_CNT));
        assert_eq!(field::EMAIL_DST, reg.define("edst", StrHash, FLAG_CNT));
        assert_eq!(field::EMAIL_SUB, reg.define("esub", StrHash, FLAG_CNT));
        assert_eq!(field::EMAIL_ID, reg.define("eid", StrHash, FLAG_CNT));
        assert_eq!(field::EMAIL_CT, reg.define("ect", StrHash, FLAG_CNT));
        assert_eq!(field::EMAIL_MV, reg.define("emv", StrHash, FLAG_CNT));
        assert_eq!(field::EMAIL_FN, reg.define("efn", StrHash, FLAG_CNT));
        assert_eq!(field::EMAIL_MD5, reg.define("emd5", StrHash, FLAG_CNT));
        assert_eq!(field::EMAIL_FCT, reg.define("efct", StrHash, FLAG_CNT));
        assert_eq!(field::EMAIL_IP, reg.define("eip", IpHash, FLAG_CNT));

        assert_eq!(field::IRC_NICK, reg.define("ircnck", StrHash, FLAG_CNT));
        assert_eq!(field::IRC_CHANNELS, reg.define("ircch", StrHash, FLAG_CNT));

        reg
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FieldValue {
    Int(u32),
    IntArray(Vec<u32>),
    IntHash(Vec<u32>),
    Str(String),
    StrArray(Vec<String>),
    StrHash(Vec<String>),
    IpHash(Vec<u32>),
}

impl FieldValue {
    fn count(&self) -> usize {
        use self::FieldValue::*;
        match self {
            Int(_) | Str(_) => 1,
            IntArray(v) | IntHash(v) | IpHash(v) => v.len(),
            StrArray(v) | StrHash(v) => v.len(),
        }
    }

    fn to_json(&self) -> Value {
        use self::FieldValue::*;
        match self {
            Int(v) => json!(v),
            IntArray(v) | IntHash(v) => json!(v),
            Str(v) => json!(v),
            StrArray(v) | StrHash(v) => json!(v),
            // Stored in wire order, lowest octet first
            IpHash(v) => Value::Array(
                v.iter()
                    .map(|ip| {
                        let o = ip.to_le_bytes();
                        json!(format!("{}.{}.{}.{}", o[0], o[1], o[2], o[3]))
                    })
                    .collect(),
            ),
        }
    }
}

/// Per-session heterogeneous field map, indexed by [`FieldId`].
#[derive(Clone, Debug, Default)]
pub struct FieldStore {
    slots: Vec<Option<FieldValue>>,
}

impl FieldStore {
    pub fn new(reg: &FieldRegistry) -> Self {
        Self {
            slots: vec![None; reg.len()],
        }
    }

    pub fn get(&self, id: FieldId) -> Option<&FieldValue> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    /// Add a string value.
    ///
    /// Returns `true` if the value was stored, `false` if a hash-typed slot
    /// already held an equal entry.
    pub fn add_string(&mut self, reg: &FieldRegistry, id: FieldId, value: String) -> bool {
        match reg.def(id).kind {
            FieldKind::Str => {
                self.slots[id.0] = Some(FieldValue::Str(value));
                true
            }
            FieldKind::StrArray => {
                match self.slots[id.0] {
                    Some(FieldValue::StrArray(ref mut v)) => v.push(value),
                    ref mut slot => *slot = Some(FieldValue::StrArray(vec![value])),
                }
                true
            }
            FieldKind::StrHash => match self.slots[id.0] {
                Some(FieldValue::StrHash(ref mut v)) => {
                    if v.contains(&value) {
                        false
                    } else {
                        v.push(value);
                        true
                    }
                }
                ref mut slot => {
                    *slot = Some(FieldValue::StrHash(vec![value]));
                    true
                }
            },
            kind => {
                warn!("add_string on non-string field {:?} ({:?})", id, kind);
                false
            }
        }
    }

    /// Add an integer (or wire-order IPv4) value.
    pub fn add_int(&mut self, reg: &FieldRegistry, id: FieldId, value: u32) -> bool {
        match reg.def(id).kind {
            FieldKind::Int => {
                self.slots[id.0] = Some(FieldValue::Int(value));
                true
            }
            FieldKind::IntArray => {
                match self.slots[id.0] {
                    Some(FieldValue::IntArray(ref mut v)) => v.push(value),
                    ref mut slot => *slot = Some(FieldValue::IntArray(vec![value])),
                }
                true
            }
            FieldKind::IntHash | FieldKind::IpHash => {
                let kind = reg.def(id).kind;
                match self.slots[id.0] {
                    Some(FieldValue::IntHash(ref mut v)) | Some(FieldValue::IpHash(ref mut v)) => {
                        if v.contains(&value) {
                            false
                        } else {
                            v.push(value);
                            true
                        }
                    }
                    ref mut slot => {
                        *slot = Some(if kind == FieldKind::IpHash {
                            FieldValue::IpHash(vec![value])
                        } else {
                            FieldValue::IntHash(vec![value])
                        });
                        true
                    }
                }
            }
            kind => {
                warn!("add_int on non-int field {:?} ({:?})", id, kind);
                false
            }
        }
    }

    /// Shortcut for the session tag set.
    pub fn add_tag(&mut self, reg: &FieldRegistry, tag: &str) {
        self.add_string(reg, field::TAGS, tag.to_string());
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        match self.get(field::TAGS) {
            Some(FieldValue::StrHash(v)) => v.iter().any(|t| t == tag),
            _ => false,
        }
    }

    /// Render the store as a JSON object keyed by field shortname.
    pub fn document(&self, reg: &FieldRegistry) -> Map<String, Value> {
        let mut doc = Map::new();
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(value) = slot {
                let def = reg.def(FieldId(i));
                doc.insert(def.name.to_string(), value.to_json());
                if def.flags & (FLAG_CNT | FLAG_SCNT) != 0 {
                    doc.insert(format!("{}cnt", def.name), json!(value.count()));
                }
            }
        }
        doc
    }
}
