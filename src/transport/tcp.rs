//! TCP socket transport binding.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::frame::{run_reader, run_writer};
use super::{Transport, TransportConfig, TransportLink, TransportState};
use crate::error::Result;

/// Stream-socket transport to an XCP-on-Ethernet target.
pub struct TcpTransport {
    state: TransportState,
    address: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            state: TransportState::Uninitialized,
            address: None,
            tasks: Vec::new(),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&mut self, config: &TransportConfig) -> Result<TransportLink> {
        let addr = format!("{}:{}", config.host, config.port);
        debug!("TCP transport connecting to: {}", addr);

        self.state = TransportState::Initializing;

        let stream = TcpStream::connect(&addr).await?;
        self.address = Some(stream.peer_addr()?);

        // Configure socket options for low latency
        let std_stream = stream.into_std()?;
        let socket = socket2::Socket::from(std_stream.try_clone()?);
        socket.set_nodelay(true)?;
        socket.set_recv_buffer_size(config.buffer_size)?;
        socket.set_send_buffer_size(config.buffer_size)?;
        let stream = TcpStream::from_std(std_stream)?;

        let (read_half, write_half) = stream.into_split();
        let counter_gaps = Arc::new(AtomicU64::new(0));
        let (in_tx, in_rx) = mpsc::channel(config.channel_depth);
        let (out_tx, out_rx) = mpsc::channel(config.channel_depth);

        self.tasks
            .push(tokio::spawn(run_reader(read_half, in_tx, Arc::clone(&counter_gaps))));
        self.tasks.push(tokio::spawn(run_writer(write_half, out_rx)));

        self.state = TransportState::Connected;
        debug!("TCP transport connected to: {}", addr);

        Ok(TransportLink {
            tx: out_tx,
            rx: in_rx,
            counter_gaps,
        })
    }

    async fn close(&mut self) -> Result<()> {
        debug!("closing TCP transport");
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.address = None;
        self.state = TransportState::Disconnected;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "TCP Socket"
    }

    fn state(&self) -> TransportState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::frame::{encode_frame, HEADER_LEN};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn round_trips_frames_over_a_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Peer echoes one frame back with its own counter.
        let peer = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut header = [0u8; HEADER_LEN];
            stream.read_exact(&mut header).await.unwrap();
            let len = u16::from_le_bytes([header[0], header[1]]) as usize;
            let mut payload = vec![0u8; len];
            stream.read_exact(&mut payload).await.unwrap();
            stream
                .write_all(&encode_frame(0, &payload))
                .await
                .unwrap();
        });

        let config = TransportConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            ..Default::default()
        };
        let mut transport = TcpTransport::new();
        let mut link = transport.open(&config).await.unwrap();

        link.tx.send(vec![0xFF, 0x00]).await.unwrap();
        let echoed = link.rx.recv().await.unwrap();
        assert_eq!(echoed, vec![0xFF, 0x00]);

        peer.await.unwrap();
        transport.close().await.unwrap();
        assert_eq!(transport.state(), TransportState::Disconnected);
    }

    #[tokio::test]
    async fn peer_close_ends_the_inbound_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let config = TransportConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            ..Default::default()
        };
        let mut transport = TcpTransport::new();
        let mut link = transport.open(&config).await.unwrap();

        assert!(link.rx.recv().await.is_none());
        peer.await.unwrap();
        transport.close().await.unwrap();
    }
}
