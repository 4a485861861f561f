//! The buffer codec (spec §4.2): packs a shard's record list into a single
//! immutable byte buffer and exposes constant-time random-access readers
//! over it.
//!
//! Layout, all integers big-endian (matching the on-disk conventions used
//! elsewhere in this crate's lineage — see `u64::to_be_bytes` in `robt`):
//!
//! ```text
//! [0..4)   magic "FM01"
//! [4..8)   root offset (u32), absolute position into this same buffer
//! [8..)    arena: interned strings, scalar/string lists, and record
//!          tables, each addressed by its absolute start offset
//! ```
//!
//! The root is always a *vector of offsets* — spec §4.2's "root table with
//! one field". Rather than wrap that vector in an extra one-field table
//! (pure overhead with nothing to distinguish it from the vector itself),
//! the root offset addresses the vector directly.
//!
//! A record table is a flat run of per-slot storage in declared field
//! order: scalar fields are written inline at their native width; string
//! and list fields store a 4-byte offset into the arena. There is no
//! vtable indirection — unlike wire-format FlatBuffers, every record in a
//! shard shares one [`RecordLayout`], decided once at registry
//! construction, so there is nothing for a vtable to abstract over.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::schema::{FieldType, RecordLayout, Value};

const MAGIC: &[u8; 4] = b"FM01";
const HEADER_LEN: usize = 8;

/// A scalar type that can be written into / read out of a length-prefixed
/// list without going through [`Value`].
pub trait ScalarElem: Copy + Sized {
    const WIDTH: usize;
    fn write_be(&self, buf: &mut Vec<u8>);
    fn read_be(bytes: &[u8]) -> Self;
    /// Pull this type's value back out of the matching [`Value`] variant.
    /// Panics if `v` is not that variant — callers only ever reach this
    /// through [`TableBuilder::push_value_list`], which already matched
    /// the declared element type before calling in.
    fn from_value(v: &Value) -> Self;
}

macro_rules! impl_scalar_elem {
    ($t:ty, $w:expr, $variant:path) => {
        impl ScalarElem for $t {
            const WIDTH: usize = $w;
            fn write_be(&self, buf: &mut Vec<u8>) {
                buf.extend_from_slice(&self.to_be_bytes());
            }
            fn read_be(bytes: &[u8]) -> Self {
                <$t>::from_be_bytes(bytes[..$w].try_into().unwrap())
            }
            fn from_value(v: &Value) -> Self {
                match v {
                    $variant(x) => *x,
                    other => panic!("expected {} list element, got {:?}", stringify!($t), other),
                }
            }
        }
    };
}

impl_scalar_elem!(i8, 1, Value::I8);
impl_scalar_elem!(u8, 1, Value::U8);
impl_scalar_elem!(i16, 2, Value::I16);
impl_scalar_elem!(u16, 2, Value::U16);
impl_scalar_elem!(i32, 4, Value::I32);
impl_scalar_elem!(u32, 4, Value::U32);
impl_scalar_elem!(i64, 8, Value::I64);
impl_scalar_elem!(u64, 8, Value::U64);
impl_scalar_elem!(f32, 4, Value::F32);
impl_scalar_elem!(f64, 8, Value::F64);

impl ScalarElem for bool {
    const WIDTH: usize = 1;
    fn write_be(&self, buf: &mut Vec<u8>) {
        buf.push(*self as u8);
    }
    fn read_be(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
    fn from_value(v: &Value) -> Self {
        match v {
            Value::Bool(x) => *x,
            other => panic!("expected bool list element, got {:?}", other),
        }
    }
}

fn read_u32_at(buf: &[u8], offset: u32) -> u32 {
    let o = offset as usize;
    u32::from_be_bytes(buf[o..o + 4].try_into().unwrap())
}

fn read_str_at(buf: &[u8], offset: u32) -> &str {
    let o = offset as usize;
    let len = read_u32_at(buf, offset) as usize;
    std::str::from_utf8(&buf[o + 4..o + 4 + len]).expect("interned string is not valid utf8")
}

/// A growable arena used to build one shard generation or one delta
/// buffer. Strings are interned within the lifetime of a single builder
/// (spec §4.2: "stable offsets for repeated values"); interning does not
/// persist across rebuilds, each of which starts from a fresh builder.
pub struct TableBuilder {
    buf: Vec<u8>,
    strings: HashMap<Box<str>, u32>,
}

impl TableBuilder {
    pub fn new() -> TableBuilder {
        TableBuilder::with_capacity(HEADER_LEN)
    }

    pub fn with_capacity(capacity: usize) -> TableBuilder {
        let mut buf = Vec::with_capacity(capacity.max(HEADER_LEN));
        buf.resize(HEADER_LEN, 0);
        TableBuilder {
            buf,
            strings: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Intern `s`, returning the offset of a previously-interned copy if
    /// one exists in this build.
    pub fn intern_str(&mut self, s: &str) -> u32 {
        if let Some(&off) = self.strings.get(s) {
            return off;
        }
        let off = self.buf.len() as u32;
        self.buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(s.as_bytes());
        self.strings.insert(Box::from(s), off);
        off
    }

    /// Emit a length-prefixed, contiguous array of scalar elements and
    /// return its offset.
    pub fn push_scalar_list<T: ScalarElem>(&mut self, items: &[T]) -> u32 {
        let off = self.buf.len() as u32;
        self.buf.extend_from_slice(&(items.len() as u32).to_be_bytes());
        for item in items {
            item.write_be(&mut self.buf);
        }
        off
    }

    /// Emit a length-prefixed array of string offsets (interning each
    /// string first) and return the array's offset.
    pub fn push_string_list(&mut self, items: &[impl AsRef<str>]) -> u32 {
        let offsets: Vec<u32> = items.iter().map(|s| self.intern_str(s.as_ref())).collect();
        self.push_scalar_list(&offsets)
    }

    /// Reserve a zeroed record table sized for `layout` and return its
    /// offset. Slots are filled in afterwards with `set_*`.
    pub fn start_table(&mut self, layout: &RecordLayout) -> u32 {
        let off = self.buf.len() as u32;
        self.buf.resize(self.buf.len() + layout.table_size, 0);
        off
    }

    fn slot_at(&mut self, table_off: u32, field_off: usize, width: usize) -> &mut [u8] {
        let start = table_off as usize + field_off;
        &mut self.buf[start..start + width]
    }

    pub fn set_scalar<T: ScalarElem>(&mut self, table_off: u32, field_off: usize, value: T) {
        let mut tmp = Vec::with_capacity(T::WIDTH);
        value.write_be(&mut tmp);
        self.slot_at(table_off, field_off, T::WIDTH).copy_from_slice(&tmp);
    }

    pub fn set_offset(&mut self, table_off: u32, field_off: usize, child_off: u32) {
        self.set_scalar(table_off, field_off, child_off)
    }

    /// Pack a [`Value`] into the given field slot, interning/emitting
    /// strings and lists into the arena as needed.
    pub fn set_value(&mut self, table_off: u32, layout: &RecordLayout, slot: usize, value: &Value) {
        let field_off = layout.offset(slot);
        match value {
            Value::Bool(v) => self.set_scalar(table_off, field_off, *v),
            Value::I8(v) => self.set_scalar(table_off, field_off, *v),
            Value::I16(v) => self.set_scalar(table_off, field_off, *v),
            Value::I32(v) => self.set_scalar(table_off, field_off, *v),
            Value::I64(v) => self.set_scalar(table_off, field_off, *v),
            Value::U8(v) => self.set_scalar(table_off, field_off, *v),
            Value::U16(v) => self.set_scalar(table_off, field_off, *v),
            Value::U32(v) => self.set_scalar(table_off, field_off, *v),
            Value::U64(v) => self.set_scalar(table_off, field_off, *v),
            Value::F32(v) => self.set_scalar(table_off, field_off, *v),
            Value::F64(v) => self.set_scalar(table_off, field_off, *v),
            Value::Str(s) => {
                let off = self.intern_str(s);
                self.set_offset(table_off, field_off, off);
            }
            Value::List(items) => {
                let off = self.push_value_list(layout, slot, items);
                self.set_offset(table_off, field_off, off);
            }
        }
    }

    fn push_value_list(&mut self, layout: &RecordLayout, slot: usize, items: &[Value]) -> u32 {
        let elem_ty = match &layout.fields[slot].ty {
            FieldType::List(inner) => inner.as_ref().clone(),
            other => panic!("slot {} is not a list field: {:?}", slot, other),
        };
        match elem_ty {
            FieldType::Str => {
                let strs: Vec<&str> = items
                    .iter()
                    .map(|v| match v {
                        Value::Str(s) => s.as_str(),
                        other => panic!("expected string list element, got {:?}", other),
                    })
                    .collect();
                self.push_string_list(&strs)
            }
            FieldType::Bool => self.push_scalar_list(&values_as::<bool>(items)),
            FieldType::I8 => self.push_scalar_list(&values_as::<i8>(items)),
            FieldType::I16 => self.push_scalar_list(&values_as::<i16>(items)),
            FieldType::I32 => self.push_scalar_list(&values_as::<i32>(items)),
            FieldType::I64 => self.push_scalar_list(&values_as::<i64>(items)),
            FieldType::U8 => self.push_scalar_list(&values_as::<u8>(items)),
            FieldType::U16 => self.push_scalar_list(&values_as::<u16>(items)),
            FieldType::U32 => self.push_scalar_list(&values_as::<u32>(items)),
            FieldType::U64 => self.push_scalar_list(&values_as::<u64>(items)),
            FieldType::F32 => self.push_scalar_list(&values_as::<f32>(items)),
            FieldType::F64 => self.push_scalar_list(&values_as::<f64>(items)),
            FieldType::List(_) => unreachable!("nested lists are rejected at registry construction"),
        }
    }

    /// Pack a full [`crate::schema::MaterializedRecord`] against `layout`,
    /// returning the new table's offset.
    pub fn pack_record(&mut self, layout: &RecordLayout, fields: &[Value]) -> u32 {
        let table_off = self.start_table(layout);
        for (slot, value) in fields.iter().enumerate() {
            self.set_value(table_off, layout, slot, value);
        }
        table_off
    }

    /// Finish a shard buffer: the root is a vector of record table
    /// offsets, in index order.
    pub fn finish_list(mut self, table_offsets: &[u32]) -> Vec<u8> {
        let vec_off = self.push_scalar_list(table_offsets);
        self.buf[0..4].copy_from_slice(MAGIC);
        self.buf[4..8].copy_from_slice(&vec_off.to_be_bytes());
        self.buf
    }

    /// Finish a single-record buffer (used for [`crate::delta::DeltaItem`]
    /// payloads): the root addresses exactly one record table.
    pub fn finish_single(mut self, table_off: u32) -> Vec<u8> {
        self.buf[0..4].copy_from_slice(MAGIC);
        self.buf[4..8].copy_from_slice(&table_off.to_be_bytes());
        self.buf
    }
}

impl Default for TableBuilder {
    fn default() -> Self {
        TableBuilder::new()
    }
}

fn values_as<T: ScalarElem>(items: &[Value]) -> Vec<T> {
    items.iter().map(T::from_value).collect()
}

/// Bytes produced by [`TableBuilder::finish_list`] or
/// [`TableBuilder::finish_single`], validated and ready for random access.
#[derive(Clone, Copy)]
pub struct Buffer<'a> {
    bytes: &'a [u8],
}

impl<'a> Buffer<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Buffer<'a>> {
        if bytes.len() < HEADER_LEN || &bytes[0..4] != MAGIC {
            return Err(Error::InvalidBuffer("missing or bad magic header".into()));
        }
        Ok(Buffer { bytes })
    }

    pub fn root_offset(&self) -> u32 {
        read_u32_at(self.bytes, 4)
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Number of records in a shard-list buffer.
    pub fn list_len(&self) -> u32 {
        read_u32_at(self.bytes, self.root_offset())
    }

    /// Table offset of the `i`-th record in a shard-list buffer.
    pub fn list_elem_offset(&self, i: u32) -> u32 {
        read_u32_at(self.bytes, self.root_offset() + 4 + i * 4)
    }

    pub fn record_at(&self, offset: u32, layout: Arc<RecordLayout>) -> RecordRef<'a> {
        RecordRef {
            buf: self.bytes,
            table_offset: offset,
            layout,
        }
    }

    /// Bind the single record addressed by the root of a delta buffer.
    pub fn single_record(&self, layout: Arc<RecordLayout>) -> RecordRef<'a> {
        self.record_at(self.root_offset(), layout)
    }
}

/// A non-owning cursor into one record table (spec's "V"). All reads are
/// constant-time address arithmetic against the precomputed
/// [`RecordLayout`]; nothing here allocates.
#[derive(Clone)]
pub struct RecordRef<'a> {
    buf: &'a [u8],
    table_offset: u32,
    layout: Arc<RecordLayout>,
}

macro_rules! getter {
    ($name:ident, $t:ty) => {
        pub fn $name(&self, slot: usize) -> $t {
            let off = self.table_offset as usize + self.layout.offset(slot);
            let width = <$t as ScalarElem>::WIDTH;
            <$t as ScalarElem>::read_be(&self.buf[off..off + width])
        }
    };
}

impl<'a> RecordRef<'a> {
    pub fn layout(&self) -> &Arc<RecordLayout> {
        &self.layout
    }

    getter!(get_bool, bool);
    getter!(get_i8, i8);
    getter!(get_i16, i16);
    getter!(get_i32, i32);
    getter!(get_i64, i64);
    getter!(get_u8, u8);
    getter!(get_u16, u16);
    getter!(get_u32, u32);
    getter!(get_u64, u64);
    getter!(get_f32, f32);
    getter!(get_f64, f64);

    fn offset_slot(&self, slot: usize) -> u32 {
        let off = self.table_offset as usize + self.layout.offset(slot);
        read_u32_at(self.buf, off as u32)
    }

    pub fn get_str(&self, slot: usize) -> &'a str {
        read_str_at(self.buf, self.offset_slot(slot))
    }

    pub fn list_len(&self, slot: usize) -> u32 {
        read_u32_at(self.buf, self.offset_slot(slot))
    }

    fn list_elem_offset(&self, slot: usize, i: u32, elem_width: usize) -> u32 {
        self.offset_slot(slot) + 4 + i * elem_width as u32
    }

    pub fn list_elem_scalar<T: ScalarElem>(&self, slot: usize, i: u32) -> T {
        let off = self.list_elem_offset(slot, i, T::WIDTH) as usize;
        T::read_be(&self.buf[off..off + T::WIDTH])
    }

    pub fn list_elem_str(&self, slot: usize, i: u32) -> &'a str {
        let off = self.list_elem_offset(slot, i, 4);
        let str_off = read_u32_at(self.buf, off);
        read_str_at(self.buf, str_off)
    }

    /// Materialize the full record as an owning [`crate::schema::MaterializedRecord`],
    /// copying every field out of the buffer.
    pub fn unpack(&self) -> crate::schema::MaterializedRecord {
        let mut fields = Vec::with_capacity(self.layout.fields.len());
        for (slot, fd) in self.layout.fields.iter().enumerate() {
            fields.push(self.unpack_field(slot, &fd.ty));
        }
        crate::schema::MaterializedRecord {
            type_name: self.layout.type_name.clone(),
            fields,
        }
    }

    fn unpack_field(&self, slot: usize, ty: &FieldType) -> Value {
        match ty {
            FieldType::Bool => Value::Bool(self.get_bool(slot)),
            FieldType::I8 => Value::I8(self.get_i8(slot)),
            FieldType::I16 => Value::I16(self.get_i16(slot)),
            FieldType::I32 => Value::I32(self.get_i32(slot)),
            FieldType::I64 => Value::I64(self.get_i64(slot)),
            FieldType::U8 => Value::U8(self.get_u8(slot)),
            FieldType::U16 => Value::U16(self.get_u16(slot)),
            FieldType::U32 => Value::U32(self.get_u32(slot)),
            FieldType::U64 => Value::U64(self.get_u64(slot)),
            FieldType::F32 => Value::F32(self.get_f32(slot)),
            FieldType::F64 => Value::F64(self.get_f64(slot)),
            FieldType::Str => Value::Str(self.get_str(slot).to_string()),
            FieldType::List(inner) => {
                let len = self.list_len(slot);
                let mut items = Vec::with_capacity(len as usize);
                for i in 0..len {
                    items.push(match inner.as_ref() {
                        FieldType::Bool => Value::Bool(self.list_elem_scalar::<bool>(slot, i)),
                        FieldType::I8 => Value::I8(self.list_elem_scalar::<i8>(slot, i)),
                        FieldType::I16 => Value::I16(self.list_elem_scalar::<i16>(slot, i)),
                        FieldType::I32 => Value::I32(self.list_elem_scalar::<i32>(slot, i)),
                        FieldType::I64 => Value::I64(self.list_elem_scalar::<i64>(slot, i)),
                        FieldType::U8 => Value::U8(self.list_elem_scalar::<u8>(slot, i)),
                        FieldType::U16 => Value::U16(self.list_elem_scalar::<u16>(slot, i)),
                        FieldType::U32 => Value::U32(self.list_elem_scalar::<u32>(slot, i)),
                        FieldType::U64 => Value::U64(self.list_elem_scalar::<u64>(slot, i)),
                        FieldType::F32 => Value::F32(self.list_elem_scalar::<f32>(slot, i)),
                        FieldType::F64 => Value::F64(self.list_elem_scalar::<f64>(slot, i)),
                        FieldType::Str => Value::Str(self.list_elem_str(slot, i).to_string()),
                        FieldType::List(_) => unreachable!("nested lists are rejected"),
                    });
                }
                Value::List(items)
            }
        }
    }
}
