//! # Variable Layer
//!
//! Typed read/write on resolved symbols. A [`VariableHandle`] pairs a
//! symbol with nothing else — the symbol table hands them out, the
//! protocol client moves the bytes, and the codec in [`crate::symtab`]
//! does the interpretation.
//!
//! Composite handles (records, arrays) move their whole region in one
//! chunked memory transaction. Symbols behind a target-side pointer cost
//! one extra round-trip group to fetch the pointer first. Encode-side
//! range checks run before any wire traffic, so a rejected write leaves
//! the target untouched.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::protocol::XcpClient;
use crate::symtab::{
    decode_bit_field, decode_value, encode_value, BitField, Field, Storage, Symbol, TypeDesc,
    Value,
};

/// A caller-held reference to a resolved symbol.
#[derive(Debug, Clone)]
pub struct VariableHandle {
    symbol: Arc<Symbol>,
}

impl VariableHandle {
    /// Wrap a resolved symbol, typically from
    /// [`SymbolTable::resolve`](crate::symtab::SymbolTable::resolve).
    pub fn new(symbol: Arc<Symbol>) -> Self {
        Self { symbol }
    }

    pub fn path(&self) -> &str {
        &self.symbol.path
    }

    pub fn type_desc(&self) -> &TypeDesc {
        &self.symbol.ty
    }

    pub fn symbol(&self) -> &Arc<Symbol> {
        &self.symbol
    }
}

/// The target address the handle's bytes live at right now. Direct symbols
/// know it statically; indirect ones read the pointer first.
pub(crate) async fn effective_address(client: &XcpClient, symbol: &Symbol) -> Result<u64> {
    match symbol.storage {
        Storage::Direct => Ok(symbol.address),
        Storage::Indirect {
            pointer_address,
            pointer_width,
        } => {
            let bytes = client
                .read_memory(pointer_address, pointer_width as usize)
                .await?;
            let order = client.connect_info().byte_order;
            let pointer = match pointer_width {
                4 => order.u32_from([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64,
                8 => order.u64_from([
                    bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
                ]),
                w => {
                    return Err(Error::Type(format!("pointer of width {}", w)));
                }
            };
            if pointer == 0 {
                return Err(Error::Type(format!(
                    "'{}' reached through a null pointer",
                    symbol.path
                )));
            }
            Ok(pointer + symbol.address)
        }
    }
}

/// Read and decode the handle's current value.
pub async fn read_variable(client: &XcpClient, handle: &VariableHandle) -> Result<Value> {
    let symbol = handle.symbol();
    let address = effective_address(client, symbol).await?;
    let order = client.connect_info().byte_order;
    let bytes = client.read_memory(address, symbol.ty.size()).await?;
    match symbol.bits {
        Some(bits) => decode_bit_field(&bytes, &symbol.ty, bits, order),
        None => decode_value(&bytes, &symbol.ty, order),
    }
}

/// Encode and write a value through the handle.
///
/// Bit-field handles read-modify-write their storage unit; everything else
/// is encoded up front and sent in one chunked transaction.
pub async fn write_variable(
    client: &XcpClient,
    handle: &VariableHandle,
    value: &Value,
) -> Result<()> {
    let symbol = handle.symbol();
    let order = client.connect_info().byte_order;
    match symbol.bits {
        Some(bits) => {
            let address = effective_address(client, symbol).await?;
            let mut unit = client.read_memory(address, symbol.ty.size()).await?;
            merge_bit_field(&mut unit, &symbol.ty, bits, value, order)?;
            client.write_memory(address, &unit).await
        }
        None => {
            // Encode first: an out-of-range value never reaches the wire.
            let bytes = encode_value(value, &symbol.ty, order)?;
            let address = effective_address(client, symbol).await?;
            client.write_memory(address, &bytes).await
        }
    }
}

fn merge_bit_field(
    unit: &mut [u8],
    storage_ty: &TypeDesc,
    bits: BitField,
    value: &Value,
    order: crate::protocol::ByteOrder,
) -> Result<()> {
    let field = Field {
        name: String::new(),
        offset: 0,
        ty: storage_ty.clone(),
        bits: Some(bits),
    };
    crate::symtab::encode_bit_field_into(unit, &field, bits, value, order)
}
