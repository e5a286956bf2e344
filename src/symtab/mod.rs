//! # Symbol Table Module
//!
//! Typed, addressable views of target memory. Two producers fill tables of
//! the same shape — the debug-info reader ([`dwarf`]) working from a linked
//! image, and the model-map reader ([`modelmap`]) working from a
//! self-describing structure in target memory — and the variable layer is
//! agnostic to which one a symbol came from.
//!
//! ## Key pieces
//!
//! - [`TypeDesc`]: type descriptions closed under scalar, fixed-size array,
//!   record, and pointer
//! - [`Value`]: the tagged variant crossing the caller boundary
//! - [`decode_value`] / [`encode_value`]: byte-order aware conversion
//!   between target bytes and values, including bit-field masking and
//!   encode-side range checks
//! - [`SymbolTable`]: path → symbol mapping with `outer.inner.leaf`,
//!   `array[3]`, and pointer-hop navigation
//!
//! Tables are immutable once built; lookups hand out `Arc<Symbol>` clones
//! and need no locking.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::protocol::ByteOrder;

pub mod dwarf;
pub mod modelmap;

/// Scalar interpretation of a memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarKind {
    SignedInt,
    UnsignedInt,
    Float,
}

/// Bit-field placement within its enclosing storage unit. Bit offsets are
/// LSB-first; the debug-info reader converts DWARF3 MSB-relative offsets
/// before they get here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitField {
    pub bit_offset: u8,
    pub bit_width: u8,
}

impl BitField {
    fn mask(&self) -> u64 {
        if self.bit_width >= 64 {
            u64::MAX
        } else {
            (1u64 << self.bit_width) - 1
        }
    }
}

/// One member of a record type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    /// Byte offset from the start of the record.
    pub offset: usize,
    pub ty: TypeDesc,
    /// Present when the member is a bit-field within `ty` as storage unit.
    pub bits: Option<BitField>,
}

/// Type description, closed under the four constructors the wire formats
/// need. Byte order lives on the connection, not the type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypeDesc {
    Scalar {
        kind: ScalarKind,
        /// Width in bytes: 1, 2, 4 or 8.
        width: u8,
    },
    Array {
        element: Box<TypeDesc>,
        len: usize,
    },
    Record {
        fields: Vec<Field>,
        /// Total size including padding.
        size: usize,
    },
    Pointer {
        pointee: Box<TypeDesc>,
        /// Pointer width on the target in bytes.
        width: u8,
    },
}

impl TypeDesc {
    /// Shorthand for a scalar description.
    pub fn scalar(kind: ScalarKind, width: u8) -> Self {
        TypeDesc::Scalar { kind, width }
    }

    /// Total size in bytes. For pointers this is the pointer itself; the
    /// pointee's size applies only after dereferencing.
    pub fn size(&self) -> usize {
        match self {
            TypeDesc::Scalar { width, .. } => *width as usize,
            TypeDesc::Array { element, len } => element.size() * len,
            TypeDesc::Record { size, .. } => *size,
            TypeDesc::Pointer { width, .. } => *width as usize,
        }
    }
}

/// A value crossing the caller boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Signed(i64),
    Unsigned(u64),
    Float(f64),
    Array(Vec<Value>),
    Record(IndexMap<String, Value>),
}

impl Value {
    /// Numeric view as i64, when the variant and range allow.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Signed(v) => Some(*v),
            Value::Unsigned(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Numeric view as u64, when the variant and range allow.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Unsigned(v) => Some(*v),
            Value::Signed(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Numeric view as f64. Integers convert losslessly up to 2^53.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Signed(v) => Some(*v as f64),
            Value::Unsigned(v) => Some(*v as f64),
            _ => None,
        }
    }
}

/// How a symbol's bytes are located on the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Storage {
    /// `address` is the location of the object itself.
    Direct,
    /// A pointer at `pointer_address` is read first; `address` is then the
    /// byte offset added to the pointer's value.
    Indirect {
        pointer_address: u64,
        pointer_width: u8,
    },
}

/// A resolved, immutable symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Symbol {
    pub path: String,
    /// Target address for `Storage::Direct`; offset from the dereferenced
    /// pointer for `Storage::Indirect`.
    pub address: u64,
    pub ty: TypeDesc,
    pub storage: Storage,
    /// Present when the symbol is a bit-field member.
    pub bits: Option<BitField>,
}

/// Mapping from path to symbol. Construction is the producers' business;
/// afterwards the table is read-only and lock-free.
#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: IndexMap<String, Arc<Symbol>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, symbol: Symbol) {
        self.symbols.insert(symbol.path.clone(), Arc::new(symbol));
    }

    /// Fold another table in; later entries win on path collisions.
    pub fn merge(&mut self, other: SymbolTable) {
        for (path, symbol) in other.symbols {
            self.symbols.insert(path, symbol);
        }
    }

    pub fn get(&self, path: &str) -> Option<Arc<Symbol>> {
        self.symbols.get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<Symbol>)> {
        self.symbols.iter()
    }

    /// Resolve a path to a symbol, deriving member and element symbols on
    /// demand: `outer.inner.leaf` walks record fields, `array[3]` indexes
    /// elements, and navigating through a pointer-typed node switches the
    /// derived symbol to indirect storage.
    pub fn resolve(&self, path: &str) -> Result<Arc<Symbol>> {
        if let Some(symbol) = self.symbols.get(path) {
            return Ok(Arc::clone(symbol));
        }
        let (root, rest) = self.split_root(path)?;
        let derived = navigate(&root, rest, path)?;
        Ok(Arc::new(derived))
    }

    /// Longest table entry that prefixes `path` at a `.` or `[` boundary.
    fn split_root<'p>(&self, path: &'p str) -> Result<(Arc<Symbol>, &'p str)> {
        for (pos, ch) in path.char_indices().rev() {
            if ch != '.' && ch != '[' {
                continue;
            }
            if let Some(symbol) = self.symbols.get(&path[..pos]) {
                return Ok((Arc::clone(symbol), &path[pos..]));
            }
        }
        Err(Error::Symbol {
            path: path.to_string(),
        })
    }
}

/// Walk `rest` (`.field`, `[idx]`, in any combination) down from `root`.
fn navigate(root: &Symbol, rest: &str, full_path: &str) -> Result<Symbol> {
    let mut address = root.address;
    let mut storage = root.storage;
    let mut ty = root.ty.clone();
    let mut bits = root.bits;
    let mut remaining = rest;

    while !remaining.is_empty() {
        if bits.is_some() {
            // Bit-fields are terminal.
            return Err(Error::Symbol {
                path: full_path.to_string(),
            });
        }
        // Navigating through a pointer switches to indirect storage with
        // offsets relative to the pointee.
        if let TypeDesc::Pointer { pointee, width } = &ty {
            if matches!(storage, Storage::Indirect { .. }) {
                return Err(Error::Type(format!(
                    "'{}' needs a second pointer hop, only one is supported",
                    full_path
                )));
            }
            storage = Storage::Indirect {
                pointer_address: address,
                pointer_width: *width,
            };
            address = 0;
            ty = (**pointee).clone();
            continue;
        }

        if let Some(stripped) = remaining.strip_prefix('.') {
            let end = stripped
                .find(['.', '['])
                .unwrap_or(stripped.len());
            let (name, rest2) = stripped.split_at(end);
            let TypeDesc::Record { fields, .. } = &ty else {
                return Err(Error::Type(format!(
                    "'{}': '.{}' applied to a non-record",
                    full_path, name
                )));
            };
            let field = fields.iter().find(|f| f.name == name).ok_or_else(|| {
                Error::Symbol {
                    path: full_path.to_string(),
                }
            })?;
            address += field.offset as u64;
            bits = field.bits;
            ty = field.ty.clone();
            remaining = rest2;
        } else if let Some(stripped) = remaining.strip_prefix('[') {
            let end = stripped.find(']').ok_or_else(|| Error::Symbol {
                path: full_path.to_string(),
            })?;
            let index: usize = stripped[..end].parse().map_err(|_| Error::Symbol {
                path: full_path.to_string(),
            })?;
            let TypeDesc::Array { element, len } = &ty else {
                return Err(Error::Type(format!(
                    "'{}': '[{}]' applied to a non-array",
                    full_path, index
                )));
            };
            if index >= *len {
                return Err(Error::Symbol {
                    path: full_path.to_string(),
                });
            }
            address += (element.size() * index) as u64;
            ty = (**element).clone();
            remaining = &stripped[end + 1..];
        } else {
            return Err(Error::Symbol {
                path: full_path.to_string(),
            });
        }
    }

    Ok(Symbol {
        path: full_path.to_string(),
        address,
        ty,
        storage,
        bits,
    })
}

// ---- value codec -------------------------------------------------------

fn scalar_from_bytes(bytes: &[u8], order: ByteOrder) -> u64 {
    let mut raw = [0u8; 8];
    match order {
        ByteOrder::Little => raw[..bytes.len()].copy_from_slice(bytes),
        ByteOrder::Big => raw[8 - bytes.len()..].copy_from_slice(bytes),
    }
    match order {
        ByteOrder::Little => u64::from_le_bytes(raw),
        ByteOrder::Big => u64::from_be_bytes(raw),
    }
}

fn scalar_to_bytes(raw: u64, width: usize, order: ByteOrder) -> Vec<u8> {
    match order {
        ByteOrder::Little => raw.to_le_bytes()[..width].to_vec(),
        ByteOrder::Big => raw.to_be_bytes()[8 - width..].to_vec(),
    }
}

fn sign_extend(raw: u64, bit_width: u32) -> i64 {
    let shift = 64 - bit_width;
    ((raw << shift) as i64) >> shift
}

fn decode_scalar(bytes: &[u8], kind: ScalarKind, width: u8, order: ByteOrder) -> Result<Value> {
    let raw = scalar_from_bytes(bytes, order);
    Ok(match kind {
        ScalarKind::UnsignedInt => Value::Unsigned(raw),
        ScalarKind::SignedInt => Value::Signed(sign_extend(raw, width as u32 * 8)),
        ScalarKind::Float => match width {
            4 => Value::Float(f32::from_bits(raw as u32) as f64),
            8 => Value::Float(f64::from_bits(raw)),
            w => return Err(Error::Type(format!("float of width {}", w))),
        },
    })
}

/// Decode target bytes into a [`Value`] per the type description and the
/// connection's byte order.
pub fn decode_value(bytes: &[u8], ty: &TypeDesc, order: ByteOrder) -> Result<Value> {
    if bytes.len() < ty.size() {
        return Err(Error::Type(format!(
            "{} bytes for a type of size {}",
            bytes.len(),
            ty.size()
        )));
    }
    match ty {
        TypeDesc::Scalar { kind, width } => {
            decode_scalar(&bytes[..*width as usize], *kind, *width, order)
        }
        TypeDesc::Pointer { width, .. } => Ok(Value::Unsigned(scalar_from_bytes(
            &bytes[..*width as usize],
            order,
        ))),
        TypeDesc::Array { element, len } => {
            let stride = element.size();
            let mut values = Vec::with_capacity(*len);
            for i in 0..*len {
                values.push(decode_value(&bytes[i * stride..(i + 1) * stride], element, order)?);
            }
            Ok(Value::Array(values))
        }
        TypeDesc::Record { fields, .. } => {
            let mut record = IndexMap::with_capacity(fields.len());
            for field in fields {
                let slice = bytes
                    .get(field.offset..field.offset + field.ty.size())
                    .ok_or_else(|| {
                        Error::Type(format!("field '{}' lies outside its record", field.name))
                    })?;
                let value = match field.bits {
                    Some(bits) => decode_bit_field(slice, &field.ty, bits, order)?,
                    None => decode_value(slice, &field.ty, order)?,
                };
                record.insert(field.name.clone(), value);
            }
            Ok(Value::Record(record))
        }
    }
}

/// Decode a bit-field from its storage unit: mask LSB-first, then
/// sign-extend as the member type prescribes.
pub fn decode_bit_field(
    bytes: &[u8],
    storage_ty: &TypeDesc,
    bits: BitField,
    order: ByteOrder,
) -> Result<Value> {
    let TypeDesc::Scalar { kind, width } = storage_ty else {
        return Err(Error::Type("bit-field in a non-scalar storage unit".to_string()));
    };
    let raw = scalar_from_bytes(&bytes[..*width as usize], order);
    let field = (raw >> bits.bit_offset) & bits.mask();
    Ok(match kind {
        ScalarKind::SignedInt => Value::Signed(sign_extend(field, bits.bit_width as u32)),
        ScalarKind::UnsignedInt => Value::Unsigned(field),
        ScalarKind::Float => return Err(Error::Type("float bit-field".to_string())),
    })
}

fn unsigned_in_range(raw: u64, width: u8) -> bool {
    width >= 8 || raw < (1u64 << (width * 8))
}

fn signed_in_range(v: i64, width: u8) -> bool {
    if width >= 8 {
        return true;
    }
    let bits = width as u32 * 8;
    let min = -(1i64 << (bits - 1));
    let max = (1i64 << (bits - 1)) - 1;
    v >= min && v <= max
}

fn encode_scalar(value: &Value, kind: ScalarKind, width: u8, order: ByteOrder) -> Result<Vec<u8>> {
    let raw = match kind {
        ScalarKind::UnsignedInt => {
            let v = value
                .as_u64()
                .ok_or_else(|| Error::Type(format!("{:?} into an unsigned field", value)))?;
            if !unsigned_in_range(v, width) {
                return Err(Error::Type(format!(
                    "{} out of range for a {}-byte unsigned field",
                    v, width
                )));
            }
            v
        }
        ScalarKind::SignedInt => {
            let v = value
                .as_i64()
                .ok_or_else(|| Error::Type(format!("{:?} into a signed field", value)))?;
            if !signed_in_range(v, width) {
                return Err(Error::Type(format!(
                    "{} out of range for a {}-byte signed field",
                    v, width
                )));
            }
            (v as u64) & width_mask(width)
        }
        ScalarKind::Float => {
            let v = value
                .as_f64()
                .ok_or_else(|| Error::Type(format!("{:?} into a float field", value)))?;
            match width {
                4 => (v as f32).to_bits() as u64,
                8 => v.to_bits(),
                w => return Err(Error::Type(format!("float of width {}", w))),
            }
        }
    };
    Ok(scalar_to_bytes(raw, width as usize, order))
}

fn width_mask(width: u8) -> u64 {
    if width >= 8 {
        u64::MAX
    } else {
        (1u64 << (width * 8)) - 1
    }
}

/// Encode a [`Value`] into target bytes. Range checks happen here, before
/// any wire traffic: a value that does not fit its destination width (or
/// bit width) is rejected without touching the target.
pub fn encode_value(value: &Value, ty: &TypeDesc, order: ByteOrder) -> Result<Vec<u8>> {
    match ty {
        TypeDesc::Scalar { kind, width } => encode_scalar(value, *kind, *width, order),
        TypeDesc::Pointer { width, .. } => {
            let v = value
                .as_u64()
                .ok_or_else(|| Error::Type(format!("{:?} into a pointer field", value)))?;
            if !unsigned_in_range(v, *width) {
                return Err(Error::Type(format!(
                    "{:#x} out of range for a {}-byte pointer",
                    v, width
                )));
            }
            Ok(scalar_to_bytes(v, *width as usize, order))
        }
        TypeDesc::Array { element, len } => {
            let Value::Array(values) = value else {
                return Err(Error::Type(format!("{:?} into an array", value)));
            };
            if values.len() != *len {
                return Err(Error::Type(format!(
                    "array of {} values into an array of {}",
                    values.len(),
                    len
                )));
            }
            let mut out = Vec::with_capacity(ty.size());
            for v in values {
                out.extend_from_slice(&encode_value(v, element, order)?);
            }
            Ok(out)
        }
        TypeDesc::Record { fields, size } => {
            let Value::Record(map) = value else {
                return Err(Error::Type(format!("{:?} into a record", value)));
            };
            let mut out = vec![0u8; *size];
            for field in fields {
                let v = map
                    .get(&field.name)
                    .ok_or_else(|| Error::Type(format!("missing field '{}'", field.name)))?;
                match field.bits {
                    Some(bits) => {
                        encode_bit_field_into(&mut out, field, bits, v, order)?;
                    }
                    None => {
                        let bytes = encode_value(v, &field.ty, order)?;
                        out.get_mut(field.offset..field.offset + bytes.len())
                            .ok_or_else(|| {
                                Error::Type(format!(
                                    "field '{}' lies outside its record",
                                    field.name
                                ))
                            })?
                            .copy_from_slice(&bytes);
                    }
                }
            }
            Ok(out)
        }
    }
}

/// Read-modify-write one bit-field into the record buffer, so several
/// bit-fields sharing a storage unit compose.
pub(crate) fn encode_bit_field_into(
    buffer: &mut [u8],
    field: &Field,
    bits: BitField,
    value: &Value,
    order: ByteOrder,
) -> Result<()> {
    let TypeDesc::Scalar { kind, width } = field.ty else {
        return Err(Error::Type("bit-field in a non-scalar storage unit".to_string()));
    };
    let raw_field = match kind {
        ScalarKind::SignedInt => {
            let v = value
                .as_i64()
                .ok_or_else(|| Error::Type(format!("{:?} into a signed bit-field", value)))?;
            let min = -(1i64 << (bits.bit_width - 1));
            let max = (1i64 << (bits.bit_width - 1)) - 1;
            if v < min || v > max {
                return Err(Error::Type(format!(
                    "{} out of range for a {}-bit signed field",
                    v, bits.bit_width
                )));
            }
            (v as u64) & bits.mask()
        }
        ScalarKind::UnsignedInt => {
            let v = value
                .as_u64()
                .ok_or_else(|| Error::Type(format!("{:?} into an unsigned bit-field", value)))?;
            if v > bits.mask() {
                return Err(Error::Type(format!(
                    "{} out of range for a {}-bit unsigned field",
                    v, bits.bit_width
                )));
            }
            v
        }
        ScalarKind::Float => return Err(Error::Type("float bit-field".to_string())),
    };
    let slice = buffer
        .get_mut(field.offset..field.offset + width as usize)
        .ok_or_else(|| Error::Type(format!("field '{}' lies outside its record", field.name)))?;
    let mut unit = scalar_from_bytes(slice, order);
    unit &= !(bits.mask() << bits.bit_offset);
    unit |= raw_field << bits.bit_offset;
    slice.copy_from_slice(&scalar_to_bytes(unit, width as usize, order));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_ty() -> TypeDesc {
        TypeDesc::scalar(ScalarKind::Float, 4)
    }

    fn i16_ty() -> TypeDesc {
        TypeDesc::scalar(ScalarKind::SignedInt, 2)
    }

    #[test]
    fn scalar_decode_respects_byte_order() {
        let bytes = 1.5f32.to_le_bytes();
        assert_eq!(
            decode_value(&bytes, &f32_ty(), ByteOrder::Little).unwrap(),
            Value::Float(1.5)
        );
        let bytes = (-7i16).to_be_bytes();
        assert_eq!(
            decode_value(&bytes, &i16_ty(), ByteOrder::Big).unwrap(),
            Value::Signed(-7)
        );
    }

    #[test]
    fn scalar_encode_decode_round_trip() {
        for order in [ByteOrder::Little, ByteOrder::Big] {
            for v in [-32768i64, -1, 0, 1, 32767] {
                let bytes = encode_value(&Value::Signed(v), &i16_ty(), order).unwrap();
                assert_eq!(
                    decode_value(&bytes, &i16_ty(), order).unwrap(),
                    Value::Signed(v)
                );
            }
        }
    }

    #[test]
    fn out_of_range_writes_are_rejected() {
        let err = encode_value(&Value::Signed(40000), &i16_ty(), ByteOrder::Little).unwrap_err();
        assert!(matches!(err, Error::Type(_)));
        let u8_ty = TypeDesc::scalar(ScalarKind::UnsignedInt, 1);
        assert!(encode_value(&Value::Unsigned(256), &u8_ty, ByteOrder::Little).is_err());
        assert!(encode_value(&Value::Unsigned(255), &u8_ty, ByteOrder::Little).is_ok());
    }

    #[test]
    fn record_with_bit_fields_round_trips() {
        let ty = TypeDesc::Record {
            fields: vec![
                Field {
                    name: "mode".to_string(),
                    offset: 0,
                    ty: TypeDesc::scalar(ScalarKind::UnsignedInt, 2),
                    bits: Some(BitField {
                        bit_offset: 0,
                        bit_width: 3,
                    }),
                },
                Field {
                    name: "level".to_string(),
                    offset: 0,
                    ty: TypeDesc::scalar(ScalarKind::SignedInt, 2),
                    bits: Some(BitField {
                        bit_offset: 3,
                        bit_width: 5,
                    }),
                },
                Field {
                    name: "gain".to_string(),
                    offset: 4,
                    ty: f32_ty(),
                    bits: None,
                },
            ],
            size: 8,
        };
        let mut map = IndexMap::new();
        map.insert("mode".to_string(), Value::Unsigned(5));
        map.insert("level".to_string(), Value::Signed(-9));
        map.insert("gain".to_string(), Value::Float(0.25));
        let value = Value::Record(map);

        for order in [ByteOrder::Little, ByteOrder::Big] {
            let bytes = encode_value(&value, &ty, order).unwrap();
            assert_eq!(bytes.len(), 8);
            assert_eq!(decode_value(&bytes, &ty, order).unwrap(), value);
        }
    }

    #[test]
    fn bit_field_sign_extension() {
        // 5-bit signed field holding -1 (0b11111) at offset 3.
        let storage = TypeDesc::scalar(ScalarKind::SignedInt, 2);
        let bits = BitField {
            bit_offset: 3,
            bit_width: 5,
        };
        let raw: u16 = 0b1111_1000;
        let value =
            decode_bit_field(&raw.to_le_bytes(), &storage, bits, ByteOrder::Little).unwrap();
        assert_eq!(value, Value::Signed(-1));
    }

    #[test]
    fn arrays_decode_in_order() {
        let ty = TypeDesc::Array {
            element: Box::new(TypeDesc::scalar(ScalarKind::UnsignedInt, 2)),
            len: 3,
        };
        let mut bytes = Vec::new();
        for v in [10u16, 20, 30] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        assert_eq!(
            decode_value(&bytes, &ty, ByteOrder::Little).unwrap(),
            Value::Array(vec![
                Value::Unsigned(10),
                Value::Unsigned(20),
                Value::Unsigned(30)
            ])
        );
    }

    fn table_with_struct() -> SymbolTable {
        let mut table = SymbolTable::new();
        table.insert(Symbol {
            path: "ctrl".to_string(),
            address: 0x2000_0000,
            ty: TypeDesc::Record {
                fields: vec![
                    Field {
                        name: "setpoint".to_string(),
                        offset: 0,
                        ty: TypeDesc::scalar(ScalarKind::Float, 4),
                        bits: None,
                    },
                    Field {
                        name: "gains".to_string(),
                        offset: 4,
                        ty: TypeDesc::Array {
                            element: Box::new(TypeDesc::scalar(ScalarKind::Float, 4)),
                            len: 3,
                        },
                        bits: None,
                    },
                ],
                size: 16,
            },
            storage: Storage::Direct,
            bits: None,
        });
        table
    }

    #[test]
    fn resolves_nested_members_and_elements() {
        let table = table_with_struct();
        let symbol = table.resolve("ctrl.gains[2]").unwrap();
        assert_eq!(symbol.address, 0x2000_0000 + 4 + 8);
        assert_eq!(symbol.ty, TypeDesc::scalar(ScalarKind::Float, 4));
        assert_eq!(symbol.storage, Storage::Direct);
    }

    #[test]
    fn unknown_paths_fail_with_symbol_errors() {
        let table = table_with_struct();
        let err = table.resolve("ctrl.missing").unwrap_err();
        assert!(matches!(err, Error::Symbol { .. }));
        let err = table.resolve("nope").unwrap_err();
        assert!(matches!(err, Error::Symbol { .. }));
        let err = table.resolve("ctrl.gains[3]").unwrap_err();
        assert!(matches!(err, Error::Symbol { .. }));
    }

    #[test]
    fn pointer_navigation_switches_to_indirect_storage() {
        let mut table = SymbolTable::new();
        table.insert(Symbol {
            path: "io".to_string(),
            address: 0x2000_0100,
            ty: TypeDesc::Pointer {
                pointee: TypeDesc::Record {
                    fields: vec![Field {
                        name: "raw".to_string(),
                        offset: 8,
                        ty: TypeDesc::scalar(ScalarKind::UnsignedInt, 4),
                        bits: None,
                    }],
                    size: 12,
                }
                .into(),
                width: 4,
            },
            storage: Storage::Direct,
            bits: None,
        });
        let symbol = table.resolve("io.raw").unwrap();
        assert_eq!(
            symbol.storage,
            Storage::Indirect {
                pointer_address: 0x2000_0100,
                pointer_width: 4
            }
        );
        assert_eq!(symbol.address, 8);
    }
}
