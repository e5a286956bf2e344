//! # Debug-Info Reader
//!
//! Builds a [`SymbolTable`](super::SymbolTable) from the DWARF sections of
//! a linked target image. The reader is a pure function of the image file:
//! it never touches the target, and the produced table is deterministic for
//! a given input.
//!
//! What it extracts:
//!
//! - global `DW_TAG_variable` entries whose location is a plain
//!   `DW_OP_addr` expression (everything else — locals, externs without a
//!   definition, register-allocated values — is ignored)
//! - the full type chain behind each variable: typedefs and cv-qualifiers
//!   are skipped, base types map to scalars, arrays pick up their subrange
//!   counts, pointers keep their pointee, structures and unions become
//!   records with member offsets
//! - bit-fields, exposed with an LSB-first bit offset and width so the
//!   variable layer can read the enclosing storage unit and mask
//!   client-side; DWARF3 `DW_AT_bit_offset` (MSB-relative) is converted
//!   here, which is also the place to revisit against a big-endian target
//! - anonymous structs and unions, flattened into the enclosing record

use std::borrow::Cow;
use std::path::Path;

use gimli::{AttributeValue, Reader as _, RunTimeEndian, UnitOffset};
use object::{Object, ObjectSection};
use tracing::{debug, trace, warn};

use super::{BitField, Field, ScalarKind, Storage, Symbol, SymbolTable, TypeDesc};
use crate::error::{Error, Result};

type Slice<'a> = gimli::EndianSlice<'a, RunTimeEndian>;
type Dwarf<'a> = gimli::Dwarf<Slice<'a>>;
type Unit<'a> = gimli::Unit<Slice<'a>>;
type Die<'a, 'u> = gimli::DebuggingInformationEntry<'u, 'u, Slice<'a>>;

/// Pointer chains (`struct node { struct node *next; }`) would otherwise
/// recurse without bound; past this depth a pointee degrades to an opaque
/// byte.
const MAX_TYPE_DEPTH: usize = 32;

fn ie(e: gimli::Error) -> Error {
    Error::Image(e.to_string())
}

/// Read the DWARF sections of `path` into a symbol table.
pub fn load_image(path: &Path) -> Result<SymbolTable> {
    let file = std::fs::File::open(path)?;
    let mmap = unsafe { memmap2::Mmap::map(&file)? };
    let image = object::File::parse(&*mmap)
        .map_err(|e| Error::Image(format!("{}: {}", path.display(), e)))?;
    let endian = if image.is_little_endian() {
        RunTimeEndian::Little
    } else {
        RunTimeEndian::Big
    };

    let loader = |id: gimli::SectionId| -> std::result::Result<Cow<[u8]>, gimli::Error> {
        Ok(image
            .section_by_name(id.name())
            .and_then(|section| section.uncompressed_data().ok())
            .unwrap_or(Cow::Borrowed(&[][..])))
    };
    let sections = gimli::DwarfSections::load(loader).map_err(ie)?;
    let dwarf = sections.borrow(|section| gimli::EndianSlice::new(section, endian));
    let table = build_table(&dwarf)?;
    debug!(
        "loaded {} global symbols from {}",
        table.len(),
        path.display()
    );
    Ok(table)
}

/// Build a table from raw DWARF section bytes, bypassing the ELF container.
/// The loader is queried once per section by id.
pub fn from_sections<F>(loader: F, little_endian: bool) -> Result<SymbolTable>
where
    F: Fn(gimli::SectionId) -> Vec<u8>,
{
    let endian = if little_endian {
        RunTimeEndian::Little
    } else {
        RunTimeEndian::Big
    };
    let sections =
        gimli::DwarfSections::load(|id| Ok::<_, gimli::Error>(loader(id))).map_err(ie)?;
    let dwarf = sections.borrow(|section| gimli::EndianSlice::new(section, endian));
    build_table(&dwarf)
}

fn build_table(dwarf: &Dwarf) -> Result<SymbolTable> {
    let mut table = SymbolTable::new();
    let mut units = dwarf.units();
    while let Some(header) = units.next().map_err(ie)? {
        let unit = dwarf.unit(header).map_err(ie)?;
        collect_unit(dwarf, &unit, &mut table)?;
    }
    Ok(table)
}

/// Walk the direct children of the compilation-unit root. Variables nested
/// deeper are function-locals and out of scope here.
fn collect_unit(dwarf: &Dwarf, unit: &Unit, table: &mut SymbolTable) -> Result<()> {
    let mut tree = unit.entries_tree(None).map_err(ie)?;
    let root = tree.root().map_err(ie)?;
    let mut children = root.children();
    while let Some(node) = children.next().map_err(ie)? {
        let entry = node.entry();
        if entry.tag() != gimli::DW_TAG_variable {
            continue;
        }
        let Some(name) = attr_string(dwarf, unit, entry)? else {
            continue;
        };
        let Some(address) = static_address(unit, entry)? else {
            trace!("skipping '{}': no static address", name);
            continue;
        };
        let Some(type_offset) = type_ref(entry)? else {
            trace!("skipping '{}': no type", name);
            continue;
        };
        match parse_type(dwarf, unit, type_offset, 0) {
            Ok(ty) => {
                table.insert(Symbol {
                    path: name,
                    address,
                    ty,
                    storage: Storage::Direct,
                    bits: None,
                });
            }
            Err(e) => warn!("skipping '{}': {}", name, e),
        }
    }
    Ok(())
}

fn attr_string(dwarf: &Dwarf, unit: &Unit, entry: &Die) -> Result<Option<String>> {
    match entry.attr_value(gimli::DW_AT_name).map_err(ie)? {
        Some(value) => {
            let s = dwarf.attr_string(unit, value).map_err(ie)?;
            Ok(Some(s.to_string_lossy().into_owned()))
        }
        None => Ok(None),
    }
}

/// The address of a variable whose location is a single `DW_OP_addr`.
fn static_address(unit: &Unit, entry: &Die) -> Result<Option<u64>> {
    let Some(AttributeValue::Exprloc(expression)) =
        entry.attr_value(gimli::DW_AT_location).map_err(ie)?
    else {
        return Ok(None);
    };
    let mut reader = expression.0;
    let Ok(opcode) = reader.read_u8() else {
        return Ok(None);
    };
    if opcode != gimli::DW_OP_addr.0 {
        return Ok(None);
    }
    match reader.read_address(unit.header.address_size()) {
        Ok(address) => Ok(Some(address)),
        Err(_) => Ok(None),
    }
}

fn type_ref(entry: &Die) -> Result<Option<UnitOffset>> {
    match entry.attr_value(gimli::DW_AT_type).map_err(ie)? {
        Some(AttributeValue::UnitRef(offset)) => Ok(Some(offset)),
        Some(_) => {
            // Cross-unit references are rare in the firmware images this
            // reader targets.
            Ok(None)
        }
        None => Ok(None),
    }
}

fn udata_attr(entry: &Die, attr: gimli::DwAt) -> Result<Option<u64>> {
    Ok(entry
        .attr_value(attr)
        .map_err(ie)?
        .and_then(|value| value.udata_value()))
}

fn parse_type(dwarf: &Dwarf, unit: &Unit, offset: UnitOffset, depth: usize) -> Result<TypeDesc> {
    if depth > MAX_TYPE_DEPTH {
        return Ok(TypeDesc::scalar(ScalarKind::UnsignedInt, 1));
    }
    let entry = unit.entry(offset).map_err(ie)?;
    match entry.tag() {
        gimli::DW_TAG_base_type => parse_base_type(&entry),
        gimli::DW_TAG_enumeration_type => {
            let width = udata_attr(&entry, gimli::DW_AT_byte_size)?.unwrap_or(4) as u8;
            Ok(TypeDesc::scalar(ScalarKind::UnsignedInt, width))
        }
        gimli::DW_TAG_typedef
        | gimli::DW_TAG_const_type
        | gimli::DW_TAG_volatile_type
        | gimli::DW_TAG_restrict_type => match type_ref(&entry)? {
            Some(inner) => parse_type(dwarf, unit, inner, depth + 1),
            // `const void` and friends
            None => Ok(TypeDesc::scalar(ScalarKind::UnsignedInt, 1)),
        },
        gimli::DW_TAG_pointer_type => {
            let width = udata_attr(&entry, gimli::DW_AT_byte_size)?
                .unwrap_or(unit.header.address_size() as u64) as u8;
            let pointee = match type_ref(&entry)? {
                Some(inner) => parse_type(dwarf, unit, inner, depth + 1)?,
                None => TypeDesc::scalar(ScalarKind::UnsignedInt, 1),
            };
            Ok(TypeDesc::Pointer {
                pointee: Box::new(pointee),
                width,
            })
        }
        gimli::DW_TAG_array_type => parse_array_type(dwarf, unit, &entry, offset, depth),
        gimli::DW_TAG_structure_type | gimli::DW_TAG_union_type => {
            parse_record_type(dwarf, unit, &entry, offset, depth)
        }
        tag => Err(Error::Image(format!("unsupported type DIE {}", tag))),
    }
}

fn parse_base_type(entry: &Die) -> Result<TypeDesc> {
    let width = udata_attr(entry, gimli::DW_AT_byte_size)?
        .ok_or_else(|| Error::Image("base type without a size".to_string()))? as u8;
    let encoding = match entry.attr_value(gimli::DW_AT_encoding).map_err(ie)? {
        Some(AttributeValue::Encoding(ate)) => ate,
        Some(value) => gimli::DwAte(value.udata_value().unwrap_or(0) as u8),
        None => gimli::DwAte(0),
    };
    let kind = match encoding {
        gimli::DW_ATE_signed | gimli::DW_ATE_signed_char => ScalarKind::SignedInt,
        gimli::DW_ATE_unsigned | gimli::DW_ATE_unsigned_char | gimli::DW_ATE_boolean => {
            ScalarKind::UnsignedInt
        }
        gimli::DW_ATE_float => ScalarKind::Float,
        other => {
            return Err(Error::Image(format!("unsupported base-type encoding {}", other)));
        }
    };
    match width {
        1 | 2 | 4 | 8 => Ok(TypeDesc::scalar(kind, width)),
        w => Err(Error::Image(format!("unsupported scalar width {}", w))),
    }
}

fn parse_array_type(
    dwarf: &Dwarf,
    unit: &Unit,
    entry: &Die,
    offset: UnitOffset,
    depth: usize,
) -> Result<TypeDesc> {
    let element_offset = type_ref(entry)?
        .ok_or_else(|| Error::Image("array without an element type".to_string()))?;
    let element = parse_type(dwarf, unit, element_offset, depth + 1)?;

    // One subrange child per dimension.
    let mut dims = Vec::new();
    let mut tree = unit.entries_tree(Some(offset)).map_err(ie)?;
    let root = tree.root().map_err(ie)?;
    let mut children = root.children();
    while let Some(node) = children.next().map_err(ie)? {
        let child = node.entry();
        if child.tag() != gimli::DW_TAG_subrange_type {
            continue;
        }
        let len = match udata_attr(child, gimli::DW_AT_count)? {
            Some(count) => count as usize,
            None => match udata_attr(child, gimli::DW_AT_upper_bound)? {
                Some(upper) => upper as usize + 1,
                None => {
                    return Err(Error::Image("array dimension without a bound".to_string()));
                }
            },
        };
        dims.push(len);
    }
    if dims.is_empty() {
        return Err(Error::Image("array without dimensions".to_string()));
    }

    // Innermost dimension varies fastest.
    let mut ty = element;
    for len in dims.into_iter().rev() {
        ty = TypeDesc::Array {
            element: Box::new(ty),
            len,
        };
    }
    Ok(ty)
}

fn parse_record_type(
    dwarf: &Dwarf,
    unit: &Unit,
    entry: &Die,
    offset: UnitOffset,
    depth: usize,
) -> Result<TypeDesc> {
    let declared_size = udata_attr(entry, gimli::DW_AT_byte_size)?;
    let mut fields = Vec::new();

    let mut tree = unit.entries_tree(Some(offset)).map_err(ie)?;
    let root = tree.root().map_err(ie)?;
    let mut children = root.children();
    while let Some(node) = children.next().map_err(ie)? {
        let member = node.entry();
        if member.tag() != gimli::DW_TAG_member {
            continue;
        }
        let member_offset =
            udata_attr(member, gimli::DW_AT_data_member_location)?.unwrap_or(0) as usize;
        let Some(type_offset) = type_ref(member)? else {
            continue;
        };
        let ty = parse_type(dwarf, unit, type_offset, depth + 1)?;

        match attr_string(dwarf, unit, member)? {
            Some(name) => {
                let (byte_offset, bits) = member_bit_placement(member, member_offset, &ty)?;
                fields.push(Field {
                    name,
                    offset: byte_offset,
                    ty,
                    bits,
                });
            }
            None => {
                // Anonymous struct or union: flatten its fields into the
                // parent, shifted by the member offset.
                let TypeDesc::Record {
                    fields: inner_fields,
                    ..
                } = ty
                else {
                    continue;
                };
                for mut field in inner_fields {
                    field.offset += member_offset;
                    fields.push(field);
                }
            }
        }
    }

    let computed_size = fields
        .iter()
        .map(|f| f.offset + f.ty.size())
        .max()
        .unwrap_or(0);
    Ok(TypeDesc::Record {
        fields,
        size: declared_size.map(|s| s as usize).unwrap_or(computed_size),
    })
}

/// Bit-field placement in LSB-first terms.
///
/// DWARF4 `DW_AT_data_bit_offset` counts from the start of the record;
/// DWARF3 `DW_AT_bit_offset` counts from the MSB of the storage unit and is
/// converted using the unit size.
fn member_bit_placement(
    member: &Die,
    byte_offset: usize,
    ty: &TypeDesc,
) -> Result<(usize, Option<BitField>)> {
    let Some(bit_size) = udata_attr(member, gimli::DW_AT_bit_size)? else {
        return Ok((byte_offset, None));
    };
    let storage_bytes = match ty {
        TypeDesc::Scalar { width, .. } => *width as usize,
        _ => {
            return Err(Error::Image("bit-field with a non-scalar type".to_string()));
        }
    };
    let storage_bits = storage_bytes as u64 * 8;

    if let Some(data_bit_offset) = udata_attr(member, gimli::DW_AT_data_bit_offset)? {
        let unit_index = data_bit_offset / storage_bits;
        let lsb_offset = data_bit_offset % storage_bits;
        return Ok((
            (unit_index * storage_bytes as u64) as usize,
            Some(BitField {
                bit_offset: lsb_offset as u8,
                bit_width: bit_size as u8,
            }),
        ));
    }
    if let Some(msb_offset) = udata_attr(member, gimli::DW_AT_bit_offset)? {
        let unit_bits = udata_attr(member, gimli::DW_AT_byte_size)?
            .map(|b| b * 8)
            .unwrap_or(storage_bits);
        let lsb_offset = unit_bits
            .checked_sub(msb_offset + bit_size)
            .ok_or_else(|| Error::Image("bit-field exceeds its storage unit".to_string()))?;
        return Ok((
            byte_offset,
            Some(BitField {
                bit_offset: lsb_offset as u8,
                bit_width: bit_size as u8,
            }),
        ));
    }
    Err(Error::Image("bit-field without a bit offset".to_string()))
}
