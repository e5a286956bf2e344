//! Model-map resolution: a mock target publishes a mapping structure with
//! one signal; resolving and reading it touches the right address once.

mod common;

use std::sync::Arc;

use anyhow::Result;
use common::{StubConfig, StubTarget};
use telepathy::protocol::cmd;
use telepathy::symtab::modelmap::{self, ModelMapConfig};
use telepathy::symtab::{ScalarKind, Storage, Symbol, SymbolTable, TypeDesc};
use telepathy::variables::{read_variable, VariableHandle};
use telepathy::{TransportFactory, TransportKind, Value, XcpClient};

const ROOT: u64 = 0x1000;
const SIGNALS: u64 = 0x2000;
const DATA_TYPES: u64 = 0x2100;
const DIMS: u64 = 0x2200;
const DIM_ARRAY: u64 = 0x2300;
const ADDR_MAP: u64 = 0x2400;
const BLOCK_PATH: u64 = 0x3000;
const NAME: u64 = 0x3020;
const SIGNAL_BASE: u32 = 0x2000_0400;

/// Lay out a minimal mapping structure: one float32 signal
/// `ctrl/inner/err` at offset 12 from a base read through the address map.
fn publish_model_map(target: &StubTarget) {
    let mut st = target.state.lock().unwrap();

    // Root: seven table pointers, then seven u32 counts.
    let mut root = Vec::new();
    for ptr in [SIGNALS, 0, 0, DATA_TYPES, DIMS, DIM_ARRAY, ADDR_MAP] {
        root.extend_from_slice(&(ptr as u32).to_le_bytes());
    }
    for count in [1u32, 0, 0, 1, 1, 1, 1] {
        root.extend_from_slice(&count.to_le_bytes());
    }
    st.set_memory(ROOT, &root);

    // Signal entry.
    let mut signal = Vec::new();
    signal.extend_from_slice(&(BLOCK_PATH as u32).to_le_bytes());
    signal.extend_from_slice(&(NAME as u32).to_le_bytes());
    signal.extend_from_slice(&0u32.to_le_bytes()); // addr_map_index
    signal.extend_from_slice(&12u32.to_le_bytes()); // byte_offset
    signal.extend_from_slice(&0u16.to_le_bytes()); // data_type_index
    signal.extend_from_slice(&0u16.to_le_bytes()); // dim_index
    st.set_memory(SIGNALS, &signal);

    // float32 data type, scalar dimensions, one-entry address map.
    st.set_memory(DATA_TYPES, &[4, 0, 0, 1]);
    st.set_memory(DIMS, &[1, 0, 0, 0]);
    st.set_memory(DIM_ARRAY, &1u32.to_le_bytes());
    st.set_memory(ADDR_MAP, &SIGNAL_BASE.to_le_bytes());

    st.set_memory(BLOCK_PATH, b"ctrl/inner\0");
    st.set_memory(NAME, b"err\0");

    // The signal's live value.
    st.set_memory(SIGNAL_BASE as u64 + 12, &2.75f32.to_le_bytes());
}

fn image_table() -> SymbolTable {
    // Only the root address is taken from the debug info.
    let mut table = SymbolTable::new();
    table.insert(Symbol {
        path: "rtwCAPI_ModelMappingInfo".to_string(),
        address: ROOT,
        ty: TypeDesc::scalar(ScalarKind::UnsignedInt, 1),
        storage: Storage::Direct,
        bits: None,
    });
    table
}

#[tokio::test]
async fn resolves_and_reads_a_mapped_signal() -> Result<()> {
    let target = StubTarget::spawn(StubConfig::default()).await;
    publish_model_map(&target);

    let transport = TransportFactory::create(TransportKind::TcpSocket);
    let client = Arc::new(
        XcpClient::connect(
            transport,
            &target.transport_config(),
            std::time::Duration::from_secs(2),
        )
        .await?,
    );

    let table = modelmap::load_model_map(&client, &image_table(), &ModelMapConfig::default())
        .await?;
    assert_eq!(table.len(), 1);

    let symbol = table.resolve("ctrl/inner/err")?;
    assert_eq!(symbol.address, SIGNAL_BASE as u64 + 12);
    assert_eq!(symbol.ty, TypeDesc::scalar(ScalarKind::Float, 4));

    // The read itself is a single 4-byte SHORT_UPLOAD at base + offset.
    let before = target.commands().len();
    let handle = VariableHandle::new(symbol);
    let value = read_variable(&client, &handle).await?;
    assert_eq!(value, Value::Float(2.75));
    let log = target.commands();
    assert_eq!(&log[before..], &[cmd::SHORT_UPLOAD]);
    assert_eq!(target.state.lock().unwrap().mta, SIGNAL_BASE as u64 + 16);

    client.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn a_corrupt_count_is_rejected() -> Result<()> {
    let target = StubTarget::spawn(StubConfig::default()).await;
    {
        let mut st = target.state.lock().unwrap();
        let mut root = Vec::new();
        for ptr in [SIGNALS, 0, 0, 0, 0, 0, 0] {
            root.extend_from_slice(&(ptr as u32).to_le_bytes());
        }
        // An absurd signal count reads as corruption, not a real model.
        for count in [0xFFFF_FFFFu32, 0, 0, 0, 0, 0, 0] {
            root.extend_from_slice(&count.to_le_bytes());
        }
        st.set_memory(ROOT, &root);
    }

    let transport = TransportFactory::create(TransportKind::TcpSocket);
    let client = Arc::new(
        XcpClient::connect(
            transport,
            &target.transport_config(),
            std::time::Duration::from_secs(2),
        )
        .await?,
    );

    let err = modelmap::load_model_map(&client, &image_table(), &ModelMapConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, telepathy::Error::Image(_)), "got {err:?}");

    client.disconnect().await?;
    Ok(())
}
