//! Serial link transport binding.
//!
//! Uses the same frame layout as TCP; on a raw byte link the length-only
//! framing is what makes resynchronisation after dropped bytes possible.

use async_trait::async_trait;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_serial::SerialPortBuilderExt;
use tracing::debug;

use super::frame::{run_reader, run_writer};
use super::{Transport, TransportConfig, TransportLink, TransportState};
use crate::error::Result;

/// Serial-port transport to a target behind a UART or USB-serial bridge.
pub struct SerialTransport {
    state: TransportState,
    tasks: Vec<JoinHandle<()>>,
}

impl Default for SerialTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialTransport {
    pub fn new() -> Self {
        Self {
            state: TransportState::Uninitialized,
            tasks: Vec::new(),
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self, config: &TransportConfig) -> Result<TransportLink> {
        debug!(
            "serial transport opening {} at {} baud",
            config.serial_device, config.baud_rate
        );

        self.state = TransportState::Initializing;

        let stream = tokio_serial::new(&config.serial_device, config.baud_rate)
            .open_native_async()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

        let (read_half, write_half) = tokio::io::split(stream);
        let counter_gaps = Arc::new(AtomicU64::new(0));
        let (in_tx, in_rx) = mpsc::channel(config.channel_depth);
        let (out_tx, out_rx) = mpsc::channel(config.channel_depth);

        self.tasks
            .push(tokio::spawn(run_reader(read_half, in_tx, Arc::clone(&counter_gaps))));
        self.tasks.push(tokio::spawn(run_writer(write_half, out_rx)));

        self.state = TransportState::Connected;
        debug!("serial transport open on {}", config.serial_device);

        Ok(TransportLink {
            tx: out_tx,
            rx: in_rx,
            counter_gaps,
        })
    }

    async fn close(&mut self) -> Result<()> {
        debug!("closing serial transport");
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.state = TransportState::Disconnected;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Serial"
    }

    fn state(&self) -> TransportState {
        self.state
    }
}
