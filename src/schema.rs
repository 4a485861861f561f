//! Record descriptor registry (spec §4.1).
//!
//! A record type is described once, as an ordered list of [`FieldDescriptor`],
//! and that description is turned into a [`RecordLayout`] that precomputes
//! the byte offset and width of every field slot. Readers and the rebuild
//! engine address fields purely by slot + precomputed offset; nothing on the
//! hot path resolves a field by name.
//!
//! The schema parser and code generator that would normally produce
//! per-language accessor types from a `.flat` schema file are out of scope
//! for this crate (see spec §1) — callers hand us a [`FieldDescriptor`] list
//! directly, the way a generated module would.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};

/// The closed set of field types a record slot may declare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Str,
    /// A length-prefixed, homogeneous vector of any of the preceding
    /// scalar or string types. Lists of lists are not part of the closed
    /// set (spec §3) and are rejected at registry construction.
    List(Box<FieldType>),
}

impl FieldType {
    /// Width in bytes of one element, for types the builder lays out
    /// inline in a scalar list. `None` for `Str`, whose elements are
    /// stored as offsets into the interned-string arena, and for `List`,
    /// which never nests.
    pub(crate) fn scalar_width(&self) -> Option<usize> {
        use FieldType::*;
        match self {
            Bool | I8 | U8 => Some(1),
            I16 | U16 => Some(2),
            I32 | U32 | F32 => Some(4),
            I64 | U64 | F64 => Some(8),
            Str | List(_) => None,
        }
    }

    /// Width of the table slot that holds this field: scalars occupy
    /// their native width inline, strings and lists occupy a 4-byte
    /// offset into the arena.
    pub(crate) fn slot_width(&self) -> usize {
        self.scalar_width().unwrap_or(4)
    }

    fn is_enum_compatible(&self) -> bool {
        matches!(
            self,
            FieldType::I8
                | FieldType::I16
                | FieldType::I32
                | FieldType::I64
                | FieldType::U8
                | FieldType::U16
                | FieldType::U32
                | FieldType::U64
        )
    }
}

/// A typed default value for a field that was absent from a decoded
/// buffer (reserved for forward schema evolution; the rebuild engine
/// never produces buffers with missing fields today).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Str(String),
    List(Vec<Value>),
}

/// One declared field of a record type.
#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub name: String,
    pub slot: usize,
    pub ty: FieldType,
    pub default: Option<Value>,
    /// Name of the enum this field's integer value is drawn from, if
    /// any. The engine never resolves this beyond validating that the
    /// declared type is integer-width (spec §4.1: "the engine treats
    /// enums as their underlying integer width").
    pub enum_name: Option<String>,
    /// Free-form, engine-opaque annotation carried alongside a field
    /// declaration (e.g. a downstream codegen hint). Never read by this
    /// crate beyond storing and returning it.
    pub meta: Option<String>,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, slot: usize, ty: FieldType) -> FieldDescriptor {
        FieldDescriptor {
            name: name.into(),
            slot,
            ty,
            default: None,
            enum_name: None,
            meta: None,
        }
    }

    pub fn with_default(mut self, default: Value) -> FieldDescriptor {
        self.default = Some(default);
        self
    }

    pub fn as_enum(mut self, enum_name: impl Into<String>) -> FieldDescriptor {
        self.enum_name = Some(enum_name.into());
        self
    }

    pub fn with_meta(mut self, meta: impl Into<String>) -> FieldDescriptor {
        self.meta = Some(meta.into());
        self
    }
}

/// A materialized, owning copy of a record (spec's "VT"), used whenever a
/// record needs to cross a rebuild: unpacked from the old generation's
/// buffer, carried across the rebuild boundary, and packed again into the
/// next generation's builder.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterializedRecord {
    pub type_name: Arc<str>,
    /// One value per declared field slot, in slot order.
    pub fields: Vec<Value>,
}

/// Precomputed byte layout for one record type: per-slot offset and width,
/// derived once from a [`FieldDescriptor`] list.
#[derive(Debug)]
pub struct RecordLayout {
    pub type_name: Arc<str>,
    pub fields: Vec<FieldDescriptor>,
    /// Byte offset of each slot within a record table, indexed by slot.
    pub(crate) offsets: Vec<usize>,
    /// Total size, in bytes, of one record table.
    pub(crate) table_size: usize,
}

impl RecordLayout {
    fn build(type_name: &str, mut fields: Vec<FieldDescriptor>) -> Result<RecordLayout> {
        fields.sort_by_key(|f| f.slot);
        for (expected, f) in fields.iter().enumerate() {
            if f.slot != expected {
                return Err(Error::SchemaMismatch(format!(
                    "{}: field slots must be contiguous starting at 0, found gap at {}",
                    type_name, expected
                )));
            }
            if let FieldType::List(inner) = &f.ty {
                if matches!(**inner, FieldType::List(_)) {
                    return Err(Error::SchemaMismatch(format!(
                        "{}.{}: lists of lists are not supported",
                        type_name, f.name
                    )));
                }
            }
            if f.enum_name.is_some() && !f.ty.is_enum_compatible() {
                return Err(Error::SchemaMismatch(format!(
                    "{}.{}: enum field must be declared over an integer width",
                    type_name, f.name
                )));
            }
        }

        let mut offsets = Vec::with_capacity(fields.len());
        let mut cursor = 0usize;
        for f in &fields {
            offsets.push(cursor);
            cursor += f.ty.slot_width();
        }

        Ok(RecordLayout {
            type_name: Arc::from(type_name),
            fields,
            offsets,
            table_size: cursor,
        })
    }

    pub fn field(&self, slot: usize) -> Result<&FieldDescriptor> {
        self.fields.get(slot).ok_or(Error::SlotOutOfRange(slot))
    }

    pub(crate) fn offset(&self, slot: usize) -> usize {
        self.offsets[slot]
    }
}

/// Per-record-type list of fields plus the accessor table the engine binds
/// once at construction (spec §4.1). In this reimplementation the
/// "accessor table" is the precomputed [`RecordLayout`] itself: every read
/// is a slot lookup plus fixed arithmetic, never a name resolution.
#[derive(Default)]
pub struct RecordRegistry {
    layouts: HashMap<String, Arc<RecordLayout>>,
}

impl RecordRegistry {
    pub fn new() -> RecordRegistry {
        RecordRegistry::default()
    }

    /// Register a record type. Fails with [`Error::SchemaMismatch`] if any
    /// declared field cannot be given a bound accessor (missing slots,
    /// nested lists, or an enum over a non-integer type).
    pub fn register(
        &mut self,
        type_name: &str,
        fields: Vec<FieldDescriptor>,
    ) -> Result<Arc<RecordLayout>> {
        let layout = Arc::new(RecordLayout::build(type_name, fields)?);
        self.layouts.insert(type_name.to_string(), layout.clone());
        Ok(layout)
    }

    pub fn layout(&self, type_name: &str) -> Option<Arc<RecordLayout>> {
        self.layouts.get(type_name).cloned()
    }
}
