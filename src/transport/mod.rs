//! # Transport Abstraction Module
//!
//! Framed byte I/O between the host and the target. Two concrete bindings
//! are provided, both using the same frame layout:
//!
//! - **TCP sockets**: stream socket to an XCP-on-Ethernet target
//! - **Serial links**: byte-oriented link via `tokio-serial`
//!
//! ## Transport Architecture
//!
//! ```text
//! ┌──────────────────┐    ┌──────────────────┐    ┌─────────────────┐
//! │ Protocol Client  │───▶│    Transport     │───▶│    Specific     │
//! │ (commands, DAQ)  │    │      Trait       │    │ Implementation  │
//! │                  │◀───│  (abstraction)   │◀───│  (TCP/Serial)   │
//! └──────────────────┘    └──────────────────┘    └─────────────────┘
//! ```
//!
//! `Transport::open` splits the underlying stream and spawns a reader and a
//! writer task that own the two halves. The caller gets a [`TransportLink`]:
//! a channel pair carrying de-framed packet payloads in and raw payloads
//! out. Framing, resynchronisation, and counter tracking live in
//! [`frame`]; a reader task that cannot recover framing closes the inbound
//! channel, which every consumer treats as a disconnect.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::Result;

pub mod frame;
pub mod serial;
pub mod tcp;

pub use serial::SerialTransport;
pub use tcp::TcpTransport;

/// Largest frame payload the decoder accepts. Headers announcing more than
/// this are treated as framing corruption and resynchronised over.
pub const MAX_FRAME_PAYLOAD: usize = 4096;

/// Transport selection for [`TransportFactory::create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    /// Stream socket to an XCP-on-Ethernet target.
    TcpSocket,
    /// Byte-oriented serial link.
    Serial,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::TcpSocket => write!(f, "TCP Socket"),
            TransportKind::Serial => write!(f, "Serial"),
        }
    }
}

/// Configuration shared by the transport bindings.
///
/// Not all parameters apply to every binding: `host`/`port` only apply to
/// TCP, `serial_device`/`baud_rate` only to serial. `buffer_size` sizes the
/// socket send/receive buffers; `channel_depth` bounds the packet channels
/// between the I/O tasks and the protocol client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Host address of the target for TCP.
    pub host: String,
    /// Port number of the target for TCP.
    pub port: u16,
    /// Serial device path, e.g. `/dev/ttyUSB0`.
    pub serial_device: String,
    /// Serial baud rate.
    pub baud_rate: u32,
    /// Socket send/receive buffer size in bytes.
    pub buffer_size: usize,
    /// Depth of the inbound and outbound packet channels.
    pub channel_depth: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: crate::defaults::TCP_PORT,
            serial_device: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            buffer_size: 8192,
            channel_depth: 256,
        }
    }
}

/// Transport connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Transport has been created but not opened.
    Uninitialized,
    /// Open in progress.
    Initializing,
    /// Link established, I/O tasks running.
    Connected,
    /// Cleanly closed.
    Disconnected,
}

/// Channel handles to an open transport.
///
/// `tx` accepts packet payloads to be framed and written in order; `rx`
/// yields de-framed payloads in reception order. When the reader task dies
/// (EOF, I/O error, unrecoverable framing) `rx` closes; when the link is
/// dropped the writer task ends.
pub struct TransportLink {
    /// Outbound payloads; the writer task frames and sends them.
    pub tx: mpsc::Sender<Vec<u8>>,
    /// Inbound de-framed payloads.
    pub rx: mpsc::Receiver<Vec<u8>>,
    /// Running count of gaps observed in the received frame counter.
    /// Feeds the DAQ engine's data-loss accounting.
    pub counter_gaps: Arc<AtomicU64>,
}

/// Generic framed transport interface.
///
/// All methods are async; `open` may resolve addresses and establish
/// connections. A transport is single-connection: `open` after `open`
/// without `close` is an error of the caller and has unspecified results.
#[async_trait]
pub trait Transport: Send {
    /// Establish the link and spawn the I/O tasks.
    async fn open(&mut self, config: &TransportConfig) -> Result<TransportLink>;

    /// Tear down the I/O tasks and release the link.
    async fn close(&mut self) -> Result<()>;

    /// Human-readable name for logs and errors.
    fn name(&self) -> &'static str;

    /// Current lifecycle state.
    fn state(&self) -> TransportState;
}

/// Factory for transport instances.
pub struct TransportFactory;

impl TransportFactory {
    /// Create a transport for the requested binding.
    pub fn create(kind: TransportKind) -> Box<dyn Transport> {
        match kind {
            TransportKind::TcpSocket => Box::new(TcpTransport::new()),
            TransportKind::Serial => Box::new(SerialTransport::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_config_default() {
        let config = TransportConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 5555);
        assert_eq!(config.buffer_size, 8192);
        assert_eq!(config.channel_depth, 256);
    }

    #[test]
    fn factory_creates_requested_kind() {
        let tcp = TransportFactory::create(TransportKind::TcpSocket);
        assert_eq!(tcp.name(), "TCP Socket");
        let serial = TransportFactory::create(TransportKind::Serial);
        assert_eq!(serial.name(), "Serial");
    }
}
