//! Payload schema descriptions registered with the event builder at
//! Configure time. The on-the-wire dictionary format belongs to the
//! serialization library; these types carry only the field lists.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

/// Scalar element type of one payload field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ScalarKind {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    CharStr,
}

impl ScalarKind {
    /// Element size in bytes. Strings count one byte per element.
    pub const fn size(self) -> usize {
        match self {
            Self::U8 | Self::I8 | Self::CharStr => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::U64 | Self::I64 | Self::F64 => 8,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::CharStr => "charstr",
        }
    }
}

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One named field of a payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Name {
    pub name: String,
    pub kind: ScalarKind,
    pub rank: u32,
}

impl Name {
    pub fn scalar(name: &str, kind: ScalarKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            rank: 0,
        }
    }

    pub fn array(name: &str, kind: ScalarKind, rank: u32) -> Self {
        Self {
            name: name.to_string(),
            kind,
            rank,
        }
    }
}

/// Ordered field list describing one detector payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VarDef {
    pub fields: Vec<Name>,
}

impl VarDef {
    pub fn push(&mut self, name: Name) {
        self.fields.push(name);
    }

    /// Flat payload size assuming rank 0 and one element per field.
    pub fn payload_size(&self) -> usize {
        self.fields.iter().map(|n| n.kind.size()).sum()
    }
}

/// One dictionary entry: detector identity plus its field list.
#[derive(Debug, Clone, Serialize)]
pub struct NamesEntry {
    pub det_name: String,
    pub det_type: String,
    pub det_id: String,
    pub var_def: VarDef,
}

/// Reserved dictionary slots alongside the per-source entries.
pub mod names_index {
    pub const BASE: u32 = 0;
    pub const CHUNK_INFO: u32 = 252;
    pub const STEP_INFO: u32 = 253;
    pub const OFFSET_INFO: u32 = 254;
    pub const RUN_INFO: u32 = 255;
}

/// Dictionary of payload schemas built at Configure and cleared at
/// Unconfigure.
#[derive(Debug, Default)]
pub struct NamesRegistry {
    entries: HashMap<u32, NamesEntry>,
}

impl NamesRegistry {
    pub fn insert(&mut self, names_id: u32, entry: NamesEntry) {
        self.entries.insert(names_id, entry);
    }

    pub fn get(&self, names_id: u32) -> Option<&NamesEntry> {
        self.entries.get(&names_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Serialized snapshot, carried as the Configure transition payload.
    pub fn dump(&self) -> Vec<u8> {
        serde_json::to_vec(&self.entries).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_sizes() {
        assert_eq!(ScalarKind::U8.size(), 1);
        assert_eq!(ScalarKind::I16.size(), 2);
        assert_eq!(ScalarKind::F32.size(), 4);
        assert_eq!(ScalarKind::F64.size(), 8);
        assert_eq!(ScalarKind::CharStr.size(), 1);
    }

    #[test]
    fn test_var_def_payload_size() {
        let mut vd = VarDef::default();
        vd.push(Name::scalar("energy", ScalarKind::F64));
        vd.push(Name::scalar("damageMask", ScalarKind::U32));
        vd.push(Name::scalar("bkg", ScalarKind::I16));
        assert_eq!(vd.payload_size(), 14);
    }

    #[test]
    fn test_registry_clear() {
        let mut reg = NamesRegistry::default();
        reg.insert(
            names_index::BASE,
            NamesEntry {
                det_name: "gmd".to_string(),
                det_type: "gmd".to_string(),
                det_id: "gmd_0".to_string(),
                var_def: VarDef::default(),
            },
        );
        assert_eq!(reg.len(), 1);
        reg.clear();
        assert!(reg.is_empty());
    }
}
