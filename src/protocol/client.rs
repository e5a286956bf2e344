//! # Protocol Client
//!
//! Request/response state machine for one XCP connection. Two activities
//! share the connection:
//!
//! - the **requester** (caller-driven): issues commands through
//!   [`XcpClient::command`] and awaits the matching response
//! - the **receiver** (protocol-driven): a spawned task that classifies
//!   every inbound packet as RES/ERR (completing the pending command), EV
//!   (logged), SERV (logged, text decoded), or DAQ (forwarded to the
//!   engine's reassembly channel)
//!
//! The one-in-flight invariant is a command gate (`tokio::sync::Mutex`
//! around the outbound channel) held from send until response or timeout.
//! The rendezvous is a single `oneshot` slot shared with the receiver task.
//! A command timeout marks the connection dead — the target may be
//! mid-write, so a blind retransmission is not safe. Multi-command memory
//! sequences additionally hold a sequence lock so concurrent callers cannot
//! interleave their MTA updates.

use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use super::{
    cmd, daq_synch_mode, error_name, pid, serv, ByteOrder, CommModeInfo, ConnectInfo,
    ConnectionState, DaqProcessorInfo, DaqResolutionInfo, DaqKeyByte, ResourceFlags, StatusInfo,
};
use crate::error::{Error, Result};
use crate::transport::{Transport, TransportConfig};
use crate::utils::current_timestamp_ns;

/// A data-acquisition packet as routed to the DAQ engine, stamped with the
/// host reception time for targets without their own timestamps.
#[derive(Debug, Clone)]
pub struct DtoPacket {
    pub payload: Vec<u8>,
    pub host_ns: u64,
}

/// One ODT entry for `WRITE_DAQ` / `WRITE_DAQ_MULTIPLE`.
#[derive(Debug, Clone, Copy)]
pub struct DaqEntryWrite {
    /// Bit offset within the storage unit, `0xFF` for whole-element entries.
    pub bit_offset: u8,
    pub size: u8,
    pub address_extension: u8,
    pub address: u32,
}

/// Counters describing the health of the link and the DAQ routing.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkStats {
    /// Gaps in the transport frame counter (missed frames).
    pub counter_gaps: u64,
    /// DAQ packets that arrived while no engine was attached.
    pub orphan_dtos: u64,
    /// DAQ packets dropped because the reassembly channel was full.
    pub dto_overflow: u64,
}

struct PendingCommand {
    command: u8,
    reply: oneshot::Sender<Vec<u8>>,
}

#[derive(Default)]
struct Shared {
    connection: Option<ConnectionState>,
    pending: Option<PendingCommand>,
    /// Host-side mirror of the target's memory transfer address, used to
    /// elide SET_MTA when the previous command's auto-increment already
    /// placed the cursor correctly.
    mta: Option<u64>,
    daq_tx: Option<mpsc::Sender<DtoPacket>>,
    orphan_dtos: u64,
    dto_overflow: u64,
}

impl Shared {
    fn connection(&self) -> ConnectionState {
        self.connection.unwrap_or(ConnectionState::Disconnected)
    }
}

struct ClientShared {
    state: Mutex<Shared>,
}

impl ClientShared {
    fn new() -> Self {
        Self {
            state: Mutex::new(Shared::default()),
        }
    }

    /// Drop into the dead state: pending waits fail, DAQ routing detaches.
    fn mark_dead(&self) {
        let mut st = self.state.lock();
        st.connection = Some(ConnectionState::Disconnected);
        st.pending = None;
        st.daq_tx = None;
        st.mta = None;
    }
}

/// Host side of one XCP connection.
pub struct XcpClient {
    shared: Arc<ClientShared>,
    /// Outbound payload channel, guarded to enforce one command in flight.
    cmd_gate: AsyncMutex<mpsc::Sender<Vec<u8>>>,
    /// Serialises multi-command sequences (chunked reads/writes, DAQ
    /// configuration) against each other.
    sequence: AsyncMutex<()>,
    transport: AsyncMutex<Box<dyn Transport>>,
    receiver: JoinHandle<()>,
    command_timeout: Duration,
    counter_gaps: Arc<std::sync::atomic::AtomicU64>,
    info: ConnectInfo,
    comm_mode: Option<CommModeInfo>,
}

impl XcpClient {
    /// Open the transport and perform the CONNECT handshake.
    ///
    /// On success the connection is in the `Connected` state with the
    /// target's byte order, packet sizes, and resource mask captured in
    /// [`XcpClient::connect_info`]. A target whose `MAX_CTO` is below 8
    /// cannot carry the DAQ allocation commands and is rejected here rather
    /// than failing mid-configuration.
    pub async fn connect(
        mut transport: Box<dyn Transport>,
        config: &TransportConfig,
        command_timeout: Duration,
    ) -> Result<Self> {
        let link = transport.open(config).await?;
        let shared = Arc::new(ClientShared::new());
        let receiver = tokio::spawn(run_receiver(link.rx, Arc::clone(&shared)));

        let mut client = Self {
            shared,
            cmd_gate: AsyncMutex::new(link.tx),
            sequence: AsyncMutex::new(()),
            transport: AsyncMutex::new(transport),
            receiver,
            command_timeout,
            counter_gaps: link.counter_gaps,
            info: ConnectInfo {
                byte_order: ByteOrder::Little,
                max_cto: 0,
                max_dto: 0,
                resources: ResourceFlags(0),
                protocol_version: 0,
                transport_version: 0,
            },
            comm_mode: None,
        };

        match client.handshake().await {
            Ok(()) => Ok(client),
            Err(e) => {
                client.shared.mark_dead();
                client.receiver.abort();
                let _ = client.transport.lock().await.close().await;
                Err(e)
            }
        }
    }

    async fn handshake(&mut self) -> Result<()> {
        let response = self.command(vec![cmd::CONNECT, 0x00]).await?;
        if response.len() < 8 {
            return Err(Error::UnexpectedPacket(format!(
                "CONNECT response of {} bytes",
                response.len()
            )));
        }
        let resources = ResourceFlags(response[1]);
        let byte_order = if response[2] & 0x01 == 0 {
            ByteOrder::Little
        } else {
            ByteOrder::Big
        };
        let max_cto = response[3];
        let max_dto = byte_order.u16_from([response[4], response[5]]);
        self.info = ConnectInfo {
            byte_order,
            max_cto,
            max_dto,
            resources,
            protocol_version: response[6],
            transport_version: response[7],
        };
        if max_cto < 8 {
            return Err(Error::Resource(format!(
                "target reports MAX_CTO {} but the DAQ allocation commands need 8",
                max_cto
            )));
        }
        self.shared.state.lock().connection = Some(ConnectionState::Connected);
        info!(
            "connected: byte order {:?}, MAX_CTO {}, MAX_DTO {}, DAQ {}",
            byte_order,
            max_cto,
            max_dto,
            if resources.supports_daq() { "yes" } else { "no" }
        );

        // GET_COMM_MODE_INFO is optional on the target side; tolerate
        // ERR_CMD_UNKNOWN.
        self.comm_mode = match self.command(vec![cmd::GET_COMM_MODE_INFO]).await {
            Ok(resp) if resp.len() >= 8 => Some(CommModeInfo {
                comm_mode_optional: resp[2],
                max_bs: resp[4],
                min_st: resp[5],
                queue_size: resp[6],
                driver_version: resp[7],
            }),
            Ok(_) => None,
            Err(Error::Protocol { code: 0x20, .. }) => None,
            Err(e) => return Err(e),
        };
        Ok(())
    }

    /// Target identity negotiated by CONNECT.
    pub fn connect_info(&self) -> ConnectInfo {
        self.info
    }

    /// Optional communication parameters, when the target reports them.
    pub fn comm_mode_info(&self) -> Option<CommModeInfo> {
        self.comm_mode
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.shared.state.lock().connection()
    }

    /// Link health counters.
    pub fn link_stats(&self) -> LinkStats {
        let st = self.shared.state.lock();
        LinkStats {
            counter_gaps: self.counter_gaps.load(Ordering::Relaxed),
            orphan_dtos: st.orphan_dtos,
            dto_overflow: st.dto_overflow,
        }
    }

    /// Issue one command and await its response.
    ///
    /// The response is the raw RES payload (leading `0xFF` included).
    /// Negative responses map to [`Error::Protocol`] with the code
    /// preserved; a missed deadline marks the connection dead.
    pub async fn command(&self, payload: Vec<u8>) -> Result<Vec<u8>> {
        let code = payload[0];
        let gate = self.cmd_gate.lock().await;

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut st = self.shared.state.lock();
            if st.connection() == ConnectionState::Disconnected && code != cmd::CONNECT {
                return Err(Error::Disconnected);
            }
            st.pending = Some(PendingCommand {
                command: code,
                reply: reply_tx,
            });
        }

        trace!("sending command {:#04x}, {} bytes", code, payload.len());
        if gate.send(payload).await.is_err() {
            self.shared.mark_dead();
            return Err(Error::Disconnected);
        }

        match timeout(self.command_timeout, reply_rx).await {
            Ok(Ok(response)) => match response.first() {
                Some(&pid::ERR) => {
                    let err_code = match response.get(1) {
                        Some(&c) => c,
                        None => {
                            return Err(Error::UnexpectedPacket(
                                "negative response without a code".to_string(),
                            ))
                        }
                    };
                    debug!(
                        "command {:#04x} rejected: {} ({:#04x})",
                        code,
                        error_name(err_code),
                        err_code
                    );
                    Err(Error::Protocol {
                        command: code,
                        code: err_code,
                        name: error_name(err_code),
                    })
                }
                Some(&pid::RES) => Ok(response),
                _ => Err(Error::UnexpectedPacket(format!(
                    "response with identifier {:#04x}",
                    response.first().copied().unwrap_or(0)
                ))),
            },
            Ok(Err(_)) => Err(Error::Disconnected),
            Err(_) => {
                warn!(
                    "command {:#04x} timed out after {:?}, marking connection dead",
                    code, self.command_timeout
                );
                self.shared.mark_dead();
                Err(Error::Timeout {
                    command: code,
                    timeout: self.command_timeout,
                })
            }
        }
    }

    /// Resynchronise after a protocol-level desync. The expected reply is
    /// ERR_CMD_SYNCH, which counts as success.
    pub async fn synch(&self) -> Result<()> {
        match self.command(vec![cmd::SYNCH]).await {
            Err(Error::Protocol { code: 0x00, .. }) => Ok(()),
            Ok(_) => Err(Error::UnexpectedPacket(
                "positive response to SYNCH".to_string(),
            )),
            Err(e) => Err(e),
        }
    }

    /// Session status and resource protection from GET_STATUS.
    pub async fn get_status(&self) -> Result<StatusInfo> {
        self.require_active("GET_STATUS")?;
        let resp = self.command(vec![cmd::GET_STATUS]).await?;
        if resp.len() < 3 {
            return Err(Error::UnexpectedPacket("short GET_STATUS response".to_string()));
        }
        Ok(StatusInfo {
            session_status: resp[1],
            resource_protection: resp[2],
        })
    }

    /// Send DISCONNECT (best effort), stop the receiver, close the
    /// transport. Safe from any state.
    pub async fn disconnect(&self) -> Result<()> {
        if self.connection_state() != ConnectionState::Disconnected {
            if let Err(e) = self.command(vec![cmd::DISCONNECT]).await {
                debug!("DISCONNECT command failed: {}", e);
            }
        }
        self.shared.mark_dead();
        self.receiver.abort();
        self.transport.lock().await.close().await
    }

    // ---- memory access -------------------------------------------------

    /// Read `len` bytes at `address`, splitting into as few commands as the
    /// negotiated `MAX_CTO` allows.
    pub async fn read_memory(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        self.require_active("memory read")?;
        let address32 = check_address(address)?;
        if len == 0 {
            return Ok(Vec::new());
        }
        let _seq = self.sequence.lock().await;
        let max_chunk = (self.info.max_cto as usize - 1).min(255);
        if len <= max_chunk {
            return self.short_upload(address32, len as u8).await;
        }
        self.ensure_mta(address).await?;
        let mut out = Vec::with_capacity(len);
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(max_chunk);
            out.extend_from_slice(&self.upload(n as u8).await?);
            remaining -= n;
        }
        Ok(out)
    }

    /// Write `data` at `address` with DOWNLOAD chunks. The caller observes
    /// all-or-nothing, but a chunk already accepted by the target before a
    /// failure is not undone.
    pub async fn write_memory(&self, address: u64, data: &[u8]) -> Result<()> {
        self.require_active("memory write")?;
        check_address(address)?;
        if data.is_empty() {
            return Ok(());
        }
        let _seq = self.sequence.lock().await;
        self.ensure_mta(address).await?;
        let max_chunk = (self.info.max_cto as usize - 2).min(255);
        for chunk in data.chunks(max_chunk) {
            self.download(chunk).await?;
        }
        Ok(())
    }

    async fn short_upload(&self, address: u32, len: u8) -> Result<Vec<u8>> {
        let mut payload = vec![cmd::SHORT_UPLOAD, len, 0x00, 0x00];
        payload.extend_from_slice(&self.info.byte_order.u32_to(address));
        let resp = self.command(payload).await?;
        if resp.len() < 1 + len as usize {
            return Err(Error::UnexpectedPacket(format!(
                "SHORT_UPLOAD returned {} of {} bytes",
                resp.len().saturating_sub(1),
                len
            )));
        }
        // SHORT_UPLOAD leaves the target cursor behind the read element.
        self.shared.state.lock().mta = Some(address as u64 + len as u64);
        Ok(resp[1..1 + len as usize].to_vec())
    }

    async fn set_mta(&self, address: u64) -> Result<()> {
        let address32 = check_address(address)?;
        let mut payload = vec![cmd::SET_MTA, 0x00, 0x00, 0x00];
        payload.extend_from_slice(&self.info.byte_order.u32_to(address32));
        self.command(payload).await?;
        self.shared.state.lock().mta = Some(address);
        Ok(())
    }

    /// SET_MTA unless the mirrored cursor already points at `address`.
    async fn ensure_mta(&self, address: u64) -> Result<()> {
        if self.shared.state.lock().mta == Some(address) {
            trace!("MTA already at {:#010x}", address);
            return Ok(());
        }
        self.set_mta(address).await
    }

    async fn upload(&self, len: u8) -> Result<Vec<u8>> {
        let resp = self.command(vec![cmd::UPLOAD, len]).await?;
        if resp.len() < 1 + len as usize {
            return Err(Error::UnexpectedPacket(format!(
                "UPLOAD returned {} of {} bytes",
                resp.len().saturating_sub(1),
                len
            )));
        }
        let mut st = self.shared.state.lock();
        if let Some(mta) = st.mta {
            st.mta = Some(mta + len as u64);
        }
        Ok(resp[1..1 + len as usize].to_vec())
    }

    async fn download(&self, data: &[u8]) -> Result<()> {
        let mut payload = vec![cmd::DOWNLOAD, data.len() as u8];
        payload.extend_from_slice(data);
        self.command(payload).await?;
        let mut st = self.shared.state.lock();
        if let Some(mta) = st.mta {
            st.mta = Some(mta + data.len() as u64);
        }
        Ok(())
    }

    // ---- data acquisition ----------------------------------------------

    pub async fn get_daq_processor_info(&self) -> Result<DaqProcessorInfo> {
        self.require_active("GET_DAQ_PROCESSOR_INFO")?;
        let resp = self.command(vec![cmd::GET_DAQ_PROCESSOR_INFO]).await?;
        if resp.len() < 8 {
            return Err(Error::UnexpectedPacket(
                "short GET_DAQ_PROCESSOR_INFO response".to_string(),
            ));
        }
        let order = self.info.byte_order;
        Ok(DaqProcessorInfo {
            properties: resp[1],
            max_daq: order.u16_from([resp[2], resp[3]]),
            max_event_channel: order.u16_from([resp[4], resp[5]]),
            min_daq: resp[6],
            key_byte: DaqKeyByte(resp[7]),
        })
    }

    pub async fn get_daq_resolution_info(&self) -> Result<DaqResolutionInfo> {
        self.require_active("GET_DAQ_RESOLUTION_INFO")?;
        let resp = self.command(vec![cmd::GET_DAQ_RESOLUTION_INFO]).await?;
        if resp.len() < 8 {
            return Err(Error::UnexpectedPacket(
                "short GET_DAQ_RESOLUTION_INFO response".to_string(),
            ));
        }
        Ok(DaqResolutionInfo {
            granularity_odt_entry: resp[1],
            max_odt_entry_size: resp[2],
            timestamp_mode: resp[5],
            timestamp_ticks: self.info.byte_order.u16_from([resp[6], resp[7]]),
        })
    }

    /// Read the target's free-running DAQ clock.
    pub async fn get_daq_clock(&self) -> Result<u32> {
        self.require_active("GET_DAQ_CLOCK")?;
        let resp = self.command(vec![cmd::GET_DAQ_CLOCK]).await?;
        if resp.len() < 8 {
            return Err(Error::UnexpectedPacket("short GET_DAQ_CLOCK response".to_string()));
        }
        Ok(self
            .info
            .byte_order
            .u32_from([resp[4], resp[5], resp[6], resp[7]]))
    }

    pub async fn free_daq(&self) -> Result<()> {
        self.command(vec![cmd::FREE_DAQ]).await.map(|_| ())
    }

    pub async fn alloc_daq(&self, count: u16) -> Result<()> {
        let mut payload = vec![cmd::ALLOC_DAQ, 0x00];
        payload.extend_from_slice(&self.info.byte_order.u16_to(count));
        self.command(payload).await.map(|_| ())
    }

    pub async fn alloc_odt(&self, daq: u16, count: u8) -> Result<()> {
        let mut payload = vec![cmd::ALLOC_ODT, 0x00];
        payload.extend_from_slice(&self.info.byte_order.u16_to(daq));
        payload.push(count);
        self.command(payload).await.map(|_| ())
    }

    pub async fn alloc_odt_entry(&self, daq: u16, odt: u8, count: u8) -> Result<()> {
        let mut payload = vec![cmd::ALLOC_ODT_ENTRY, 0x00];
        payload.extend_from_slice(&self.info.byte_order.u16_to(daq));
        payload.push(odt);
        payload.push(count);
        self.command(payload).await.map(|_| ())
    }

    pub async fn set_daq_ptr(&self, daq: u16, odt: u8, entry: u8) -> Result<()> {
        let mut payload = vec![cmd::SET_DAQ_PTR, 0x00];
        payload.extend_from_slice(&self.info.byte_order.u16_to(daq));
        payload.push(odt);
        payload.push(entry);
        self.command(payload).await.map(|_| ())
    }

    pub async fn write_daq(&self, entry: DaqEntryWrite) -> Result<()> {
        let mut payload = vec![
            cmd::WRITE_DAQ,
            entry.bit_offset,
            entry.size,
            entry.address_extension,
        ];
        payload.extend_from_slice(&self.info.byte_order.u32_to(entry.address));
        self.command(payload).await.map(|_| ())
    }

    /// Batched entry write at the current DAQ pointer. The caller is
    /// responsible for keeping `2 + 8 × n` within `MAX_CTO`.
    pub async fn write_daq_multiple(&self, entries: &[DaqEntryWrite]) -> Result<()> {
        let mut payload = vec![cmd::WRITE_DAQ_MULTIPLE, entries.len() as u8];
        for entry in entries {
            payload.push(entry.bit_offset);
            payload.push(entry.size);
            payload.extend_from_slice(&self.info.byte_order.u32_to(entry.address));
            payload.push(entry.address_extension);
            payload.push(0x00);
        }
        self.command(payload).await.map(|_| ())
    }

    pub async fn set_daq_list_mode(
        &self,
        mode: u8,
        daq: u16,
        event_channel: u16,
        prescaler: u8,
        priority: u8,
    ) -> Result<()> {
        let mut payload = vec![cmd::SET_DAQ_LIST_MODE, mode];
        payload.extend_from_slice(&self.info.byte_order.u16_to(daq));
        payload.extend_from_slice(&self.info.byte_order.u16_to(event_channel));
        payload.push(prescaler);
        payload.push(priority);
        self.command(payload).await.map(|_| ())
    }

    /// Start, stop, or select one DAQ list. Returns the first PID assigned
    /// to the list, used by absolute ODT identification.
    pub async fn start_stop_daq_list(&self, mode: u8, daq: u16) -> Result<u8> {
        let mut payload = vec![cmd::START_STOP_DAQ_LIST, mode];
        payload.extend_from_slice(&self.info.byte_order.u16_to(daq));
        let resp = self.command(payload).await?;
        Ok(resp.get(1).copied().unwrap_or(0))
    }

    pub async fn start_stop_synch(&self, mode: u8) -> Result<()> {
        self.command(vec![cmd::START_STOP_SYNCH, mode]).await?;
        let new_state = if mode == daq_synch_mode::START_SELECTED {
            ConnectionState::DaqRunning
        } else {
            ConnectionState::DaqConfigured
        };
        self.shared.state.lock().connection = Some(new_state);
        Ok(())
    }

    // ---- engine plumbing -----------------------------------------------

    /// Route incoming DAQ packets to `tx`. One engine at a time.
    pub(crate) fn attach_daq(&self, tx: mpsc::Sender<DtoPacket>) {
        self.shared.state.lock().daq_tx = Some(tx);
    }

    /// Stop routing DAQ packets. After this returns no further packet is
    /// forwarded, which is what makes `daq_stop` quiescent.
    pub(crate) fn detach_daq(&self) {
        self.shared.state.lock().daq_tx = None;
    }

    pub(crate) fn set_connection_state(&self, state: ConnectionState) {
        self.shared.state.lock().connection = Some(state);
    }

    /// Hold to make a multi-command sequence atomic against other callers.
    pub(crate) async fn lock_sequence(&self) -> MutexGuard<'_, ()> {
        self.sequence.lock().await
    }

    fn require_active(&self, operation: &'static str) -> Result<()> {
        match self.connection_state() {
            ConnectionState::Disconnected => Err(Error::State {
                operation,
                state: ConnectionState::Disconnected.as_str(),
            }),
            _ => Ok(()),
        }
    }
}

/// The wire carries 32-bit addresses plus an extension byte; this toolkit
/// uses extension 0 and rejects anything beyond 32 bits.
fn check_address(address: u64) -> Result<u32> {
    u32::try_from(address)
        .map_err(|_| Error::Type(format!("address {:#x} exceeds the 32-bit wire format", address)))
}

/// Receiver task: classify every inbound packet.
async fn run_receiver(mut rx: mpsc::Receiver<Vec<u8>>, shared: Arc<ClientShared>) {
    while let Some(packet) = rx.recv().await {
        let Some(&identifier) = packet.first() else {
            continue;
        };
        match identifier {
            pid::RES | pid::ERR => {
                let pending = shared.state.lock().pending.take();
                match pending {
                    Some(p) => {
                        trace!("response for command {:#04x}", p.command);
                        let _ = p.reply.send(packet);
                    }
                    None => warn!(
                        "response packet {:#04x} with no command outstanding",
                        identifier
                    ),
                }
            }
            pid::EV => {
                info!("target event {:#04x}", packet.get(1).copied().unwrap_or(0));
            }
            pid::SERV => match packet.get(1) {
                Some(&serv::TEXT) => {
                    let text = String::from_utf8_lossy(&packet[2..]);
                    info!("target: {}", text.trim_end_matches(['\0', '\n']));
                }
                other => debug!("service request {:?}", other),
            },
            _ => {
                // DAQ packet; identifiers below SERV.
                let host_ns = current_timestamp_ns();
                let mut st = shared.state.lock();
                match st.daq_tx.clone() {
                    Some(tx) => {
                        if tx
                            .try_send(DtoPacket {
                                payload: packet,
                                host_ns,
                            })
                            .is_err()
                        {
                            st.dto_overflow += 1;
                        }
                    }
                    None => st.orphan_dtos += 1,
                }
            }
        }
    }
    debug!("transport link closed, failing pending waits");
    shared.mark_dead();
}
