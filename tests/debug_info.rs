//! Debug-info reader tests against a DWARF fixture assembled in memory.

use std::collections::HashMap;

use anyhow::Result;
use gimli::write::{Address, AttributeValue, DwarfUnit, EndianVec, Expression, Sections};
use telepathy::symtab::{dwarf, ScalarKind, Storage, TypeDesc, Value};
use telepathy::ByteOrder;

/// A compilation unit with:
/// - `counter`: unsigned 32-bit at 0x2000_0010
/// - `ctrl`: struct { float setpoint; u16 flags:3; i16 level:5; } at
///   0x2000_0020 (the bit-fields share the storage unit at offset 4)
/// - `samples`: i16[4] at 0x2000_0030
fn fixture_sections() -> HashMap<gimli::SectionId, Vec<u8>> {
    let encoding = gimli::Encoding {
        format: gimli::Format::Dwarf32,
        version: 4,
        address_size: 4,
    };
    let mut dwarf = DwarfUnit::new(encoding);
    let root = dwarf.unit.root();

    let u32_ty = dwarf.unit.add(root, gimli::DW_TAG_base_type);
    let die = dwarf.unit.get_mut(u32_ty);
    die.set(
        gimli::DW_AT_name,
        AttributeValue::String(b"unsigned int".to_vec()),
    );
    die.set(gimli::DW_AT_byte_size, AttributeValue::Udata(4));
    die.set(
        gimli::DW_AT_encoding,
        AttributeValue::Encoding(gimli::DW_ATE_unsigned),
    );

    let f32_ty = dwarf.unit.add(root, gimli::DW_TAG_base_type);
    let die = dwarf.unit.get_mut(f32_ty);
    die.set(gimli::DW_AT_name, AttributeValue::String(b"float".to_vec()));
    die.set(gimli::DW_AT_byte_size, AttributeValue::Udata(4));
    die.set(
        gimli::DW_AT_encoding,
        AttributeValue::Encoding(gimli::DW_ATE_float),
    );

    let u16_ty = dwarf.unit.add(root, gimli::DW_TAG_base_type);
    let die = dwarf.unit.get_mut(u16_ty);
    die.set(
        gimli::DW_AT_name,
        AttributeValue::String(b"unsigned short".to_vec()),
    );
    die.set(gimli::DW_AT_byte_size, AttributeValue::Udata(2));
    die.set(
        gimli::DW_AT_encoding,
        AttributeValue::Encoding(gimli::DW_ATE_unsigned),
    );

    let i16_ty = dwarf.unit.add(root, gimli::DW_TAG_base_type);
    let die = dwarf.unit.get_mut(i16_ty);
    die.set(gimli::DW_AT_name, AttributeValue::String(b"short".to_vec()));
    die.set(gimli::DW_AT_byte_size, AttributeValue::Udata(2));
    die.set(
        gimli::DW_AT_encoding,
        AttributeValue::Encoding(gimli::DW_ATE_signed),
    );

    // struct ctrl_t
    let ctrl_ty = dwarf.unit.add(root, gimli::DW_TAG_structure_type);
    let die = dwarf.unit.get_mut(ctrl_ty);
    die.set(gimli::DW_AT_name, AttributeValue::String(b"ctrl_t".to_vec()));
    die.set(gimli::DW_AT_byte_size, AttributeValue::Udata(8));

    let member = dwarf.unit.add(ctrl_ty, gimli::DW_TAG_member);
    let die = dwarf.unit.get_mut(member);
    die.set(
        gimli::DW_AT_name,
        AttributeValue::String(b"setpoint".to_vec()),
    );
    die.set(gimli::DW_AT_data_member_location, AttributeValue::Udata(0));
    die.set(gimli::DW_AT_type, AttributeValue::UnitRef(f32_ty));

    // DWARF4 bit-fields: data_bit_offset counts from the struct start.
    let member = dwarf.unit.add(ctrl_ty, gimli::DW_TAG_member);
    let die = dwarf.unit.get_mut(member);
    die.set(gimli::DW_AT_name, AttributeValue::String(b"flags".to_vec()));
    die.set(gimli::DW_AT_type, AttributeValue::UnitRef(u16_ty));
    die.set(gimli::DW_AT_bit_size, AttributeValue::Udata(3));
    die.set(gimli::DW_AT_data_bit_offset, AttributeValue::Udata(32));

    let member = dwarf.unit.add(ctrl_ty, gimli::DW_TAG_member);
    let die = dwarf.unit.get_mut(member);
    die.set(gimli::DW_AT_name, AttributeValue::String(b"level".to_vec()));
    die.set(gimli::DW_AT_type, AttributeValue::UnitRef(i16_ty));
    die.set(gimli::DW_AT_bit_size, AttributeValue::Udata(5));
    die.set(gimli::DW_AT_data_bit_offset, AttributeValue::Udata(35));

    // short[4]
    let array_ty = dwarf.unit.add(root, gimli::DW_TAG_array_type);
    let die = dwarf.unit.get_mut(array_ty);
    die.set(gimli::DW_AT_type, AttributeValue::UnitRef(i16_ty));
    let subrange = dwarf.unit.add(array_ty, gimli::DW_TAG_subrange_type);
    let die = dwarf.unit.get_mut(subrange);
    die.set(gimli::DW_AT_count, AttributeValue::Udata(4));

    for (name, address, ty) in [
        ("counter", 0x2000_0010u64, u32_ty),
        ("ctrl", 0x2000_0020, ctrl_ty),
        ("samples", 0x2000_0030, array_ty),
    ] {
        let var = dwarf.unit.add(root, gimli::DW_TAG_variable);
        let mut location = Expression::new();
        location.op_addr(Address::Constant(address));
        let die = dwarf.unit.get_mut(var);
        die.set(
            gimli::DW_AT_name,
            AttributeValue::String(name.as_bytes().to_vec()),
        );
        die.set(gimli::DW_AT_type, AttributeValue::UnitRef(ty));
        die.set(gimli::DW_AT_location, AttributeValue::Exprloc(location));
    }

    let mut sections = Sections::new(EndianVec::new(gimli::LittleEndian));
    dwarf.write(&mut sections).unwrap();

    let mut out = HashMap::new();
    sections
        .for_each(|id, data| {
            out.insert(id, data.slice().to_vec());
            Ok::<(), gimli::Error>(())
        })
        .unwrap();
    out
}

fn load_fixture() -> telepathy::SymbolTable {
    let sections = fixture_sections();
    dwarf::from_sections(|id| sections.get(&id).cloned().unwrap_or_default(), true).unwrap()
}

#[test]
fn globals_get_addresses_and_types() -> Result<()> {
    let table = load_fixture();
    assert_eq!(table.len(), 3);

    let counter = table.resolve("counter")?;
    assert_eq!(counter.address, 0x2000_0010);
    assert_eq!(counter.ty, TypeDesc::scalar(ScalarKind::UnsignedInt, 4));
    assert_eq!(counter.storage, Storage::Direct);

    let samples = table.resolve("samples")?;
    assert_eq!(samples.ty.size(), 8);
    let third = table.resolve("samples[2]")?;
    assert_eq!(third.address, 0x2000_0030 + 4);
    assert_eq!(third.ty, TypeDesc::scalar(ScalarKind::SignedInt, 2));
    Ok(())
}

#[test]
fn struct_members_and_bit_fields_resolve() -> Result<()> {
    let table = load_fixture();

    let setpoint = table.resolve("ctrl.setpoint")?;
    assert_eq!(setpoint.address, 0x2000_0020);
    assert_eq!(setpoint.ty, TypeDesc::scalar(ScalarKind::Float, 4));
    assert!(setpoint.bits.is_none());

    // Both bit-fields live in the storage unit at offset 4.
    let flags = table.resolve("ctrl.flags")?;
    assert_eq!(flags.address, 0x2000_0024);
    let bits = flags.bits.expect("flags is a bit-field");
    assert_eq!((bits.bit_offset, bits.bit_width), (0, 3));

    let level = table.resolve("ctrl.level")?;
    assert_eq!(level.address, 0x2000_0024);
    let bits = level.bits.expect("level is a bit-field");
    assert_eq!((bits.bit_offset, bits.bit_width), (3, 5));

    // Mask and sign-extend: storage unit 0b11111_101 → flags 5, level -1.
    let unit: u16 = 0b1111_1101;
    let decoded = telepathy::symtab::decode_bit_field(
        &unit.to_le_bytes(),
        &level.ty,
        bits,
        ByteOrder::Little,
    )?;
    assert_eq!(decoded, Value::Signed(-1));
    Ok(())
}

#[test]
fn a_file_without_debug_info_is_rejected() {
    use std::io::Write;
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"this is not a linked image").unwrap();
    let err = dwarf::load_image(file.path()).unwrap_err();
    assert!(matches!(err, telepathy::Error::Image(_)), "got {err:?}");
}

#[test]
fn tables_are_deterministic_across_runs() {
    let first = load_fixture();
    let second = load_fixture();
    assert_eq!(first.len(), second.len());
    for ((path_a, sym_a), (path_b, sym_b)) in first.iter().zip(second.iter()) {
        assert_eq!(path_a, path_b);
        assert_eq!(sym_a.address, sym_b.address);
        assert_eq!(sym_a.ty, sym_b.ty);
    }
}
