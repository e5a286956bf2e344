//! # Model-Map Reader
//!
//! For model-based firmware the target publishes a self-describing mapping
//! structure at a known symbol (by default `rtwCAPI_ModelMappingInfo`).
//! This reader walks that structure through the protocol client and
//! produces a [`SymbolTable`](super::SymbolTable) whose paths follow the
//! model's block hierarchy (`root/subsystem/block/signal`).
//!
//! The root address is the only thing taken from the debug-info table; all
//! further reads go to target memory. Sub-tables reference each other
//! strictly by index, so the reader loads every table flat first and links
//! them in a second pass — no back-pointers are needed. The map is read
//! once at session start; variable reads never re-fetch it.
//!
//! On-target layout: seven table base pointers followed by seven `u32`
//! element counts, all in the target's byte order, pointers sized by
//! [`ModelMapConfig::pointer_width`]. Entry layouts are in the `Layout`
//! helper below. Absolute addresses are `base + byte_offset`, where `base`
//! comes from the address map — a table of pointers the target fills at
//! startup, read indirectly here.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::{ScalarKind, Storage, Symbol, SymbolTable, TypeDesc};
use crate::error::{Error, Result};
use crate::protocol::{ByteOrder, XcpClient};

/// Upper bound on any single table's element count; a count beyond this is
/// taken as a corrupt map rather than a real model.
const MAX_TABLE_LEN: u32 = 10_000;

/// Bytes fetched per round-trip while scanning a NUL-terminated string.
const STRING_CHUNK: usize = 32;

/// Configuration for the model-map traversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMapConfig {
    /// Symbol naming the root mapping structure.
    pub root_symbol: String,
    /// Target pointer width in bytes (4 or 8).
    pub pointer_width: u8,
    /// Longest accepted block path or signal name.
    pub max_string_len: usize,
}

impl Default for ModelMapConfig {
    fn default() -> Self {
        Self {
            root_symbol: crate::defaults::MODEL_MAP_ROOT.to_string(),
            pointer_width: 4,
            max_string_len: 256,
        }
    }
}

/// Field layout of the on-target structures for a given pointer width.
struct Layout {
    p: usize,
}

impl Layout {
    fn new(pointer_width: u8) -> Result<Self> {
        match pointer_width {
            4 | 8 => Ok(Self {
                p: pointer_width as usize,
            }),
            w => Err(Error::Image(format!("unsupported pointer width {}", w))),
        }
    }

    /// Seven table pointers, then seven u32 counts.
    fn root_size(&self) -> usize {
        7 * self.p + 7 * 4
    }

    /// `{ block_path*, name*, addr_map_index u32, byte_offset u32,
    /// data_type_index u16, dim_index u16 }`
    fn entry_size(&self) -> usize {
        2 * self.p + 12
    }

    fn read_ptr(&self, bytes: &[u8], offset: usize, order: ByteOrder) -> u64 {
        match self.p {
            4 => order.u32_from([
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
            ]) as u64,
            _ => order.u64_from([
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
                bytes[offset + 4],
                bytes[offset + 5],
                bytes[offset + 6],
                bytes[offset + 7],
            ]),
        }
    }
}

fn read_u16(bytes: &[u8], offset: usize, order: ByteOrder) -> u16 {
    order.u16_from([bytes[offset], bytes[offset + 1]])
}

fn read_u32(bytes: &[u8], offset: usize, order: ByteOrder) -> u32 {
    order.u32_from([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// One of the three object tables (signals, parameters, states), parsed
/// flat with its cross-table indices still unresolved.
struct RawEntry {
    block_path_ptr: u64,
    name_ptr: u64,
    addr_map_index: u32,
    byte_offset: u32,
    data_type_index: u16,
    dim_index: u16,
}

struct RawMap {
    signals: Vec<RawEntry>,
    params: Vec<RawEntry>,
    states: Vec<RawEntry>,
    data_types: Vec<TypeDesc>,
    dims: Vec<(u8, u16)>,
    dim_array: Vec<u32>,
    addr_map: Vec<u64>,
}

/// Read the mapping structure rooted at `config.root_symbol` and produce a
/// symbol table. `image_table` supplies the root's address; everything else
/// is read from the target.
pub async fn load_model_map(
    client: &XcpClient,
    image_table: &SymbolTable,
    config: &ModelMapConfig,
) -> Result<SymbolTable> {
    let layout = Layout::new(config.pointer_width)?;
    let root = image_table.resolve(&config.root_symbol)?;
    debug!(
        "reading model map '{}' at {:#010x}",
        config.root_symbol, root.address
    );

    let order = client.connect_info().byte_order;
    let raw = read_raw_map(client, &layout, root.address, order).await?;
    link_map(client, config, &raw, order).await
}

async fn read_raw_map(
    client: &XcpClient,
    layout: &Layout,
    root_address: u64,
    order: ByteOrder,
) -> Result<RawMap> {
    let root = client.read_memory(root_address, layout.root_size()).await?;
    let p = layout.p;
    let ptr_at = |i: usize| layout.read_ptr(&root, i * p, order);
    let count_at = |i: usize| -> Result<u32> {
        let count = read_u32(&root, 7 * p + i * 4, order);
        if count > MAX_TABLE_LEN {
            return Err(Error::Image(format!(
                "model map table {} reports {} elements",
                i, count
            )));
        }
        Ok(count)
    };

    let signals = read_entry_table(client, layout, ptr_at(0), count_at(0)?, order).await?;
    let params = read_entry_table(client, layout, ptr_at(1), count_at(1)?, order).await?;
    let states = read_entry_table(client, layout, ptr_at(2), count_at(2)?, order).await?;

    // Data-type table: { size u16, is_signed u8, is_float u8 }
    let data_type_count = count_at(3)?;
    let bytes = read_table(client, ptr_at(3), data_type_count as usize * 4).await?;
    let mut data_types = Vec::with_capacity(data_type_count as usize);
    for chunk in bytes.chunks_exact(4) {
        let size = order.u16_from([chunk[0], chunk[1]]);
        let is_signed = chunk[2] != 0;
        let is_float = chunk[3] != 0;
        let kind = if is_float {
            ScalarKind::Float
        } else if is_signed {
            ScalarKind::SignedInt
        } else {
            ScalarKind::UnsignedInt
        };
        match size {
            1 | 2 | 4 | 8 => data_types.push(TypeDesc::scalar(kind, size as u8)),
            s => {
                return Err(Error::Image(format!(
                    "model map data type with width {}",
                    s
                )))
            }
        }
    }

    // Dimension map: { num_dims u8, pad, dim_array_index u16 }
    let dim_count = count_at(4)?;
    let bytes = read_table(client, ptr_at(4), dim_count as usize * 4).await?;
    let dims = bytes
        .chunks_exact(4)
        .map(|chunk| (chunk[0], read_u16(chunk, 2, order)))
        .collect();

    // Dimension array: flat u32 extents.
    let dim_array_len = count_at(5)?;
    let bytes = read_table(client, ptr_at(5), dim_array_len as usize * 4).await?;
    let dim_array = bytes
        .chunks_exact(4)
        .map(|chunk| read_u32(chunk, 0, order))
        .collect();

    // Address map: pointers the target fills in at startup.
    let addr_map_len = count_at(6)?;
    let bytes = read_table(client, ptr_at(6), addr_map_len as usize * p).await?;
    let addr_map = bytes
        .chunks_exact(p)
        .map(|chunk| layout.read_ptr(chunk, 0, order))
        .collect();

    Ok(RawMap {
        signals,
        params,
        states,
        data_types,
        dims,
        dim_array,
        addr_map,
    })
}

async fn read_table(client: &XcpClient, base: u64, len: usize) -> Result<Vec<u8>> {
    if len == 0 {
        return Ok(Vec::new());
    }
    if base == 0 {
        return Err(Error::Image(
            "model map table with elements but a null base".to_string(),
        ));
    }
    client.read_memory(base, len).await
}

async fn read_entry_table(
    client: &XcpClient,
    layout: &Layout,
    base: u64,
    count: u32,
    order: ByteOrder,
) -> Result<Vec<RawEntry>> {
    let entry_size = layout.entry_size();
    let bytes = read_table(client, base, count as usize * entry_size).await?;
    let p = layout.p;
    Ok(bytes
        .chunks_exact(entry_size)
        .map(|chunk| RawEntry {
            block_path_ptr: layout.read_ptr(chunk, 0, order),
            name_ptr: layout.read_ptr(chunk, p, order),
            addr_map_index: read_u32(chunk, 2 * p, order),
            byte_offset: read_u32(chunk, 2 * p + 4, order),
            data_type_index: read_u16(chunk, 2 * p + 8, order),
            dim_index: read_u16(chunk, 2 * p + 10, order),
        })
        .collect())
}

/// Second pass: resolve every index, read the path strings, and emit
/// symbols.
async fn link_map(
    client: &XcpClient,
    config: &ModelMapConfig,
    raw: &RawMap,
    _order: ByteOrder,
) -> Result<SymbolTable> {
    let mut table = SymbolTable::new();
    for (kind, entries) in [
        ("signal", &raw.signals),
        ("parameter", &raw.params),
        ("state", &raw.states),
    ] {
        for entry in entries.iter() {
            let symbol = link_entry(client, config, raw, entry).await?;
            trace!("model {} '{}' at {:#010x}", kind, symbol.path, symbol.address);
            table.insert(symbol);
        }
    }
    debug!("model map resolved {} symbols", table.len());
    Ok(table)
}

async fn link_entry(
    client: &XcpClient,
    config: &ModelMapConfig,
    raw: &RawMap,
    entry: &RawEntry,
) -> Result<Symbol> {
    let name = read_cstring(client, entry.name_ptr, config.max_string_len).await?;
    if name.is_empty() {
        return Err(Error::Image("model map entry without a name".to_string()));
    }
    let block_path = if entry.block_path_ptr != 0 {
        read_cstring(client, entry.block_path_ptr, config.max_string_len).await?
    } else {
        String::new()
    };
    let path = if block_path.is_empty() {
        name
    } else {
        format!("{}/{}", block_path, name)
    };

    let base = *raw
        .addr_map
        .get(entry.addr_map_index as usize)
        .ok_or_else(|| {
            Error::Image(format!(
                "'{}': address map index {} out of range",
                path, entry.addr_map_index
            ))
        })?;
    let scalar = raw
        .data_types
        .get(entry.data_type_index as usize)
        .ok_or_else(|| {
            Error::Image(format!(
                "'{}': data type index {} out of range",
                path, entry.data_type_index
            ))
        })?
        .clone();
    let ty = apply_dimensions(raw, entry.dim_index, scalar, &path)?;

    Ok(Symbol {
        path,
        address: base + entry.byte_offset as u64,
        ty,
        storage: Storage::Direct,
        bits: None,
    })
}

/// Scalar entries have extents of all ones; anything else becomes a
/// fixed-size array over the scalar, row-major.
fn apply_dimensions(raw: &RawMap, dim_index: u16, scalar: TypeDesc, path: &str) -> Result<TypeDesc> {
    let (num_dims, dim_array_index) = *raw.dims.get(dim_index as usize).ok_or_else(|| {
        Error::Image(format!("'{}': dimension index {} out of range", path, dim_index))
    })?;
    let start = dim_array_index as usize;
    let end = start + num_dims as usize;
    let extents = raw.dim_array.get(start..end).ok_or_else(|| {
        Error::Image(format!(
            "'{}': dimension array range {}..{} out of range",
            path, start, end
        ))
    })?;
    let len: u64 = extents.iter().map(|&e| e.max(1) as u64).product();
    if len <= 1 {
        return Ok(scalar);
    }
    Ok(TypeDesc::Array {
        element: Box::new(scalar),
        len: len as usize,
    })
}

/// Read a NUL-terminated string with a bounded chunked scan.
async fn read_cstring(client: &XcpClient, address: u64, max_len: usize) -> Result<String> {
    if address == 0 {
        return Ok(String::new());
    }
    let mut collected = Vec::new();
    while collected.len() < max_len {
        let chunk_len = STRING_CHUNK.min(max_len - collected.len());
        let chunk = client
            .read_memory(address + collected.len() as u64, chunk_len)
            .await?;
        match chunk.iter().position(|&b| b == 0) {
            Some(nul) => {
                collected.extend_from_slice(&chunk[..nul]);
                return Ok(String::from_utf8_lossy(&collected).into_owned());
            }
            None => collected.extend_from_slice(&chunk),
        }
    }
    Err(Error::Image(format!(
        "string at {:#010x} exceeds {} bytes",
        address, max_len
    )))
}
