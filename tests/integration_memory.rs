//! Memory-access scenarios: chunking against MAX_CTO, negative responses,
//! and the scalar write-read invariant.

mod common;

use anyhow::Result;
use common::{StubConfig, StubTarget};
use telepathy::protocol::cmd;
use telepathy::{Error, TransportFactory, TransportKind, XcpClient};

async fn connect(target: &StubTarget) -> Result<XcpClient> {
    let transport = TransportFactory::create(TransportKind::TcpSocket);
    Ok(XcpClient::connect(
        transport,
        &target.transport_config(),
        std::time::Duration::from_secs(2),
    )
    .await?)
}

/// Commands issued after the CONNECT handshake.
fn after_handshake(log: &[u8]) -> &[u8] {
    let end_of_handshake = log
        .iter()
        .position(|&c| c == cmd::GET_COMM_MODE_INFO)
        .expect("handshake probes comm mode");
    &log[end_of_handshake + 1..]
}

#[tokio::test]
async fn a_20_byte_read_with_cto_8_takes_one_mta_and_three_uploads() -> Result<()> {
    let target = StubTarget::spawn(StubConfig::default()).await;
    let pattern: Vec<u8> = (0u8..20).map(|i| i.wrapping_mul(7)).collect();
    target
        .state
        .lock()
        .unwrap()
        .set_memory(0x2000_0000, &pattern);

    let client = connect(&target).await?;
    let bytes = client.read_memory(0x2000_0000, 20).await?;
    assert_eq!(bytes, pattern);

    let log = target.commands();
    assert_eq!(
        after_handshake(&log),
        &[cmd::SET_MTA, cmd::UPLOAD, cmd::UPLOAD, cmd::UPLOAD]
    );

    client.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn a_small_read_is_a_single_short_upload() -> Result<()> {
    let target = StubTarget::spawn(StubConfig::default()).await;
    target
        .state
        .lock()
        .unwrap()
        .set_memory(0x2000_0100, &3.25f32.to_le_bytes());

    let client = connect(&target).await?;
    let bytes = client.read_memory(0x2000_0100, 4).await?;
    assert_eq!(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]), 3.25);

    let log = target.commands();
    assert_eq!(after_handshake(&log), &[cmd::SHORT_UPLOAD]);

    client.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn sequential_reads_elide_redundant_set_mta() -> Result<()> {
    let target = StubTarget::spawn(StubConfig::default()).await;
    let client = connect(&target).await?;

    // Two adjacent long reads: the second starts where the first left the
    // transfer address, so no second SET_MTA goes out.
    client.read_memory(0x2000_0000, 14).await?;
    client.read_memory(0x2000_000E, 14).await?;

    let log = target.commands();
    let mta_count = after_handshake(&log)
        .iter()
        .filter(|&&c| c == cmd::SET_MTA)
        .count();
    assert_eq!(mta_count, 1);

    client.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn a_write_protected_region_reports_the_verbatim_code() -> Result<()> {
    let target = StubTarget::spawn(StubConfig::default()).await;
    target
        .state
        .lock()
        .unwrap()
        .write_protected
        .push((0x4000_0000, 0x4000_0100));

    let client = connect(&target).await?;
    let err = client
        .write_memory(0x4000_0000, &[1, 2, 3, 4])
        .await
        .unwrap_err();
    match err {
        Error::Protocol { code, command, .. } => {
            assert_eq!(code, 0x22);
            assert_eq!(command, cmd::DOWNLOAD);
        }
        other => panic!("expected a protocol error, got {other:?}"),
    }

    // The negative response is local to the call; the connection survives.
    assert_eq!(
        client.connection_state(),
        telepathy::ConnectionState::Connected
    );
    let readback = client.read_memory(0x2000_0000, 4).await?;
    assert_eq!(readback.len(), 4);

    client.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn scalar_write_then_read_returns_the_same_bytes() -> Result<()> {
    let target = StubTarget::spawn(StubConfig::default()).await;
    let client = connect(&target).await?;

    let written = 0xCAFE_F00D_u32.to_le_bytes();
    client.write_memory(0x2000_0200, &written).await?;
    let read = client.read_memory(0x2000_0200, 4).await?;
    assert_eq!(read, written);

    // And a write spanning several DOWNLOAD chunks.
    let long: Vec<u8> = (0u8..32).collect();
    client.write_memory(0x2000_0300, &long).await?;
    assert_eq!(client.read_memory(0x2000_0300, 32).await?, long);

    client.disconnect().await?;
    Ok(())
}
