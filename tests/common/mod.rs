//! In-process stub target for integration tests.
//!
//! Speaks the mandatory command subset over the TCP framing (u16 LE length,
//! u16 LE counter, payload) against a sparse byte memory. Tests inspect the
//! command log to assert on the exact wire traffic and inject raw packets
//! to simulate DAQ traffic and events.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use telepathy::protocol::cmd;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Knobs for the identity the stub reports at CONNECT.
#[derive(Debug, Clone)]
pub struct StubConfig {
    pub max_cto: u8,
    pub max_dto: u16,
    /// RESOURCE mask; default CAL + DAQ.
    pub resources: u8,
    pub timestamps: bool,
}

impl Default for StubConfig {
    fn default() -> Self {
        Self {
            max_cto: 8,
            max_dto: 8,
            resources: 0x05,
            timestamps: true,
        }
    }
}

/// Mutable target state shared with the test body.
pub struct StubState {
    pub config: StubConfig,
    pub memory: HashMap<u64, u8>,
    pub write_protected: Vec<(u64, u64)>,
    pub mta: u64,
    /// Command codes in arrival order.
    pub command_log: Vec<u8>,
}

impl StubState {
    fn new(config: StubConfig) -> Self {
        Self {
            config,
            memory: HashMap::new(),
            write_protected: Vec::new(),
            mta: 0,
            command_log: Vec::new(),
        }
    }

    pub fn set_memory(&mut self, address: u64, bytes: &[u8]) {
        for (i, &b) in bytes.iter().enumerate() {
            self.memory.insert(address + i as u64, b);
        }
    }

    pub fn read_memory(&self, address: u64, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| *self.memory.get(&(address + i as u64)).unwrap_or(&0))
            .collect()
    }

    fn protected(&self, address: u64, len: usize) -> bool {
        self.write_protected
            .iter()
            .any(|&(start, end)| address < end && address + len as u64 > start)
    }
}

pub struct StubTarget {
    pub addr: SocketAddr,
    pub state: Arc<Mutex<StubState>>,
    inject_tx: mpsc::Sender<Vec<u8>>,
    task: JoinHandle<()>,
}

impl StubTarget {
    pub async fn spawn(config: StubConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(StubState::new(config)));
        let (inject_tx, inject_rx) = mpsc::channel(64);
        let task = tokio::spawn(run_target(listener, Arc::clone(&state), inject_rx));
        Self {
            addr,
            state,
            inject_tx,
            task,
        }
    }

    /// Send a raw packet (DAQ, EV, SERV) to the host, framed like any
    /// other target transmission.
    pub async fn inject(&self, payload: Vec<u8>) {
        self.inject_tx.send(payload).await.unwrap();
    }

    /// Snapshot of the command codes received so far.
    pub fn commands(&self) -> Vec<u8> {
        self.state.lock().unwrap().command_log.clone()
    }

    pub fn transport_config(&self) -> telepathy::TransportConfig {
        telepathy::TransportConfig {
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
            ..Default::default()
        }
    }
}

impl Drop for StubTarget {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct FramedWriter {
    half: OwnedWriteHalf,
    counter: u16,
}

impl FramedWriter {
    async fn send(&mut self, payload: &[u8]) {
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        frame.extend_from_slice(&self.counter.to_le_bytes());
        self.counter = self.counter.wrapping_add(1);
        frame.extend_from_slice(payload);
        let _ = self.half.write_all(&frame).await;
        let _ = self.half.flush().await;
    }
}

async fn run_target(
    listener: TcpListener,
    state: Arc<Mutex<StubState>>,
    mut inject_rx: mpsc::Receiver<Vec<u8>>,
) {
    let Ok((stream, _)) = listener.accept().await else {
        return;
    };
    let (mut read_half, write_half) = stream.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(FramedWriter {
        half: write_half,
        counter: 0,
    }));

    // Injected packets go out interleaved with responses.
    let inject_writer = Arc::clone(&writer);
    tokio::spawn(async move {
        while let Some(payload) = inject_rx.recv().await {
            inject_writer.lock().await.send(&payload).await;
        }
    });

    loop {
        let mut header = [0u8; 4];
        if read_half.read_exact(&mut header).await.is_err() {
            return;
        }
        let len = u16::from_le_bytes([header[0], header[1]]) as usize;
        let mut payload = vec![0u8; len];
        if read_half.read_exact(&mut payload).await.is_err() {
            return;
        }
        let response = {
            let mut st = state.lock().unwrap();
            handle_command(&mut st, &payload)
        };
        writer.lock().await.send(&response).await;
    }
}

fn u32_le(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// The stub is a little-endian target; multi-byte command parameters are
/// taken as little-endian throughout.
fn handle_command(state: &mut StubState, payload: &[u8]) -> Vec<u8> {
    let code = payload[0];
    state.command_log.push(code);
    match code {
        cmd::CONNECT => {
            let c = &state.config;
            vec![
                0xFF,
                c.resources,
                0x00, // little-endian, basic comm mode
                c.max_cto,
                (c.max_dto & 0xFF) as u8,
                (c.max_dto >> 8) as u8,
                0x01,
                0x01,
            ]
        }
        cmd::DISCONNECT => vec![0xFF],
        cmd::GET_STATUS => vec![0xFF, 0x00, 0x00, 0x00, 0x00, 0x00],
        cmd::SYNCH => vec![0xFE, 0x00],
        // The stub does not implement the optional block-mode parameters.
        cmd::GET_COMM_MODE_INFO => vec![0xFE, 0x20],
        cmd::SET_MTA => {
            state.mta = u32_le(&payload[4..8]) as u64;
            vec![0xFF]
        }
        cmd::UPLOAD => {
            let n = payload[1] as usize;
            let mut resp = vec![0xFF];
            resp.extend_from_slice(&state.read_memory(state.mta, n));
            state.mta += n as u64;
            resp
        }
        cmd::SHORT_UPLOAD => {
            let n = payload[1] as usize;
            let address = u32_le(&payload[4..8]) as u64;
            let mut resp = vec![0xFF];
            resp.extend_from_slice(&state.read_memory(address, n));
            state.mta = address + n as u64;
            resp
        }
        cmd::DOWNLOAD => {
            let n = payload[1] as usize;
            if state.protected(state.mta, n) {
                return vec![0xFE, 0x22];
            }
            let mta = state.mta;
            let data = payload[2..2 + n].to_vec();
            state.set_memory(mta, &data);
            state.mta += n as u64;
            vec![0xFF]
        }
        cmd::GET_DAQ_PROCESSOR_INFO => {
            // Dynamic lists, relative-word identification.
            let properties = if state.config.timestamps { 0x11 } else { 0x01 };
            vec![0xFF, properties, 0x08, 0x00, 0x08, 0x00, 0x00, 0x80]
        }
        cmd::GET_DAQ_RESOLUTION_INFO => {
            // 4-byte timestamps, 1 tick = 1 us.
            let mode = if state.config.timestamps { 0x34 } else { 0x00 };
            vec![0xFF, 0x01, 0xF8, 0x01, 0xF8, mode, 0x01, 0x00]
        }
        cmd::GET_DAQ_CLOCK => vec![0xFF, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
        cmd::FREE_DAQ
        | cmd::ALLOC_DAQ
        | cmd::ALLOC_ODT
        | cmd::ALLOC_ODT_ENTRY
        | cmd::SET_DAQ_PTR
        | cmd::WRITE_DAQ
        | cmd::WRITE_DAQ_MULTIPLE
        | cmd::SET_DAQ_LIST_MODE
        | cmd::START_STOP_SYNCH => vec![0xFF],
        cmd::START_STOP_DAQ_LIST => vec![0xFF, 0x00],
        _ => vec![0xFE, 0x20],
    }
}
