//! # Data-Acquisition Engine
//!
//! Configures the target's periodic sampling subprotocol, reassembles the
//! resulting packet stream into time-aligned typed samples, and hands them
//! to one consumer through a bounded queue.
//!
//! ## Lifecycle
//!
//! 1. [`DaqEngine::configure`] groups the requested signals by event
//!    channel into DAQ lists, allocates them on the target (`FREE_DAQ`,
//!    `ALLOC_DAQ`, `ALLOC_ODT`, `ALLOC_ODT_ENTRY`), and writes every entry.
//!    Packing into Object Descriptor Tables respects `MAX_DTO`: a new ODT
//!    starts when the next entry would overflow. Capacity violations
//!    reject before any command is issued.
//! 2. [`DaqEngine::start`] attaches the reassembler to the protocol
//!    client's DAQ routing, then issues `START_STOP_SYNCH`.
//! 3. The reassembler turns the per-ODT packet stream back into complete
//!    samples. ODT 0 of a cycle carries the target timestamp; later ODTs
//!    are matched to the most recent cycle still missing them. Late ODTs
//!    are dropped and counted.
//! 4. [`DaqEngine::stop`] stops the target, detaches the routing, and
//!    joins the reassembler — after it returns, nothing pushes into the
//!    consumer queue.
//!
//! ## Backpressure
//!
//! The consumer queue is bounded. `DropOldest` (the default) overwrites
//! the oldest sample and counts the drop — the protocol has no way to slow
//! the target down. `Block` parks the reassembler until the consumer
//! catches up, trading loss accounting at this queue for overflow
//! accounting one level up.

use crossbeam::queue::ArrayQueue;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::protocol::client::{DaqEntryWrite, DtoPacket};
use crate::protocol::{
    daq_list_mode, daq_synch_mode, ByteOrder, ConnectionState, IdentificationType, XcpClient,
};
use crate::symtab::{decode_bit_field, decode_value, BitField, Storage, SymbolTable, TypeDesc, Value};

/// Depth of the channel between the protocol receiver and the reassembler.
const REASSEMBLY_CHANNEL_DEPTH: usize = 512;

/// Cycles kept open per list while waiting for their remaining ODTs.
const CYCLE_WINDOW: usize = 4;

/// What happens when the consumer queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverflowPolicy {
    /// Drop the oldest queued sample and count it.
    DropOldest,
    /// Park the reassembler until the consumer drains.
    Block,
}

/// One signal to sample: resolved path plus the target event channel that
/// paces it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaqSignal {
    pub path: String,
    pub event_channel: u16,
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaqConfig {
    pub signals: Vec<DaqSignal>,
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    /// Event-channel prescaler written to every list.
    pub prescaler: u8,
    pub priority: u8,
}

impl Default for DaqConfig {
    fn default() -> Self {
        Self {
            signals: Vec::new(),
            queue_capacity: crate::defaults::QUEUE_CAPACITY,
            overflow: OverflowPolicy::DropOldest,
            prescaler: 1,
            priority: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimestampSource {
    /// Target clock, scaled by the resolution info.
    Target,
    /// Host reception time; precision reduced by transport jitter.
    Host,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Timestamp {
    pub ns: u64,
    pub source: TimestampSource,
}

/// One time-aligned sample of a DAQ list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Index of the list this sample belongs to, in configuration order.
    pub list: usize,
    pub timestamp: Timestamp,
    /// One decoded value per entry, in entry order.
    pub values: Vec<Value>,
}

/// Stream metadata the consumer may care about.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DaqMetadata {
    pub timestamp_source: TimestampSource,
    /// Nanoseconds per target timestamp tick (1 when host-stamped).
    pub tick_ns: u64,
    /// Number of configured lists.
    pub lists: usize,
}

/// Loss and throughput counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DaqStats {
    /// Samples delivered to the consumer queue.
    pub samples: u64,
    /// Cycles lost to late ODTs, evictions, or malformed packets.
    pub samples_lost: u64,
    /// Samples displaced from the full consumer queue (DropOldest).
    pub dropped: u64,
    /// Gaps in the transport frame counter.
    pub counter_gaps: u64,
    /// DAQ packets dropped before reassembly (channel full).
    pub dto_overflow: u64,
}

// ---- bounded sample queue ----------------------------------------------

struct SampleQueue {
    q: ArrayQueue<Sample>,
    policy: OverflowPolicy,
    dropped: AtomicU64,
    closed: AtomicBool,
    data: Notify,
    space: Notify,
}

impl SampleQueue {
    fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            q: ArrayQueue::new(capacity.max(1)),
            policy,
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            data: Notify::new(),
            space: Notify::new(),
        }
    }

    async fn push(&self, sample: Sample) {
        match self.policy {
            OverflowPolicy::DropOldest => {
                if self.q.force_push(sample).is_some() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                self.data.notify_one();
            }
            OverflowPolicy::Block => {
                let mut sample = sample;
                loop {
                    match self.q.push(sample) {
                        Ok(()) => {
                            self.data.notify_one();
                            return;
                        }
                        Err(rejected) => {
                            if self.closed.load(Ordering::Acquire) {
                                return;
                            }
                            sample = rejected;
                            self.space.notified().await;
                        }
                    }
                }
            }
        }
    }

    async fn pop(&self) -> Option<Sample> {
        loop {
            if let Some(sample) = self.q.pop() {
                self.space.notify_one();
                return Some(sample);
            }
            if self.closed.load(Ordering::Acquire) {
                return self.q.pop();
            }
            self.data.notified().await;
        }
    }

    fn try_pop(&self) -> Option<Sample> {
        let sample = self.q.pop();
        if sample.is_some() {
            self.space.notify_one();
        }
        sample
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.data.notify_waiters();
        self.space.notify_waiters();
    }
}

/// Consumer end of the sample queue. Single consumer: clones share the
/// same queue, they do not fan samples out.
#[derive(Clone)]
pub struct SampleStream {
    queue: Arc<SampleQueue>,
    metadata: DaqMetadata,
}

impl SampleStream {
    /// Next sample, waiting if none is queued. `None` once the engine has
    /// shut down and the queue is drained.
    pub async fn recv(&self) -> Option<Sample> {
        self.queue.pop().await
    }

    /// Next sample if one is already queued.
    pub fn try_recv(&self) -> Option<Sample> {
        self.queue.try_pop()
    }

    pub fn metadata(&self) -> DaqMetadata {
        self.metadata
    }
}

// ---- list layout --------------------------------------------------------

#[derive(Debug, Clone)]
struct EntrySlot {
    ty: TypeDesc,
    bits: Option<BitField>,
    size: usize,
}

#[derive(Debug, Clone)]
struct ListLayout {
    event_channel: u16,
    /// Entry slots grouped by ODT, in write order.
    odts: Vec<Vec<EntrySlot>>,
}

impl ListLayout {
    fn value_count(&self) -> usize {
        self.odts.iter().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone)]
enum IdScheme {
    /// One identification byte holding an absolute ODT number; each list
    /// owns the contiguous PID range starting at its first PID.
    Absolute { first_pids: Vec<u8> },
    /// Relative ODT number plus a DAQ list number of `list_bytes` bytes,
    /// with an optional alignment fill byte.
    Relative { header_len: usize },
}

// ---- engine -------------------------------------------------------------

/// Shared counters between the reassembler task and the engine handle.
#[derive(Default)]
struct SharedStats {
    samples: AtomicU64,
    samples_lost: AtomicU64,
}

/// The data-acquisition engine for one connection.
pub struct DaqEngine {
    client: Arc<XcpClient>,
    lists: Vec<ListLayout>,
    id_scheme: IdScheme,
    queue: Arc<SampleQueue>,
    metadata: DaqMetadata,
    tick_ns: u64,
    timestamp_size: usize,
    clock_seed: u64,
    stats: Arc<SharedStats>,
    reassembler: Option<JoinHandle<()>>,
    running: bool,
}

impl std::fmt::Debug for DaqEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaqEngine")
            .field("lists", &self.lists)
            .field("id_scheme", &self.id_scheme)
            .field("metadata", &self.metadata)
            .field("tick_ns", &self.tick_ns)
            .field("timestamp_size", &self.timestamp_size)
            .field("clock_seed", &self.clock_seed)
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}

impl DaqEngine {
    /// Resolve, pack, and allocate the requested signals on the target.
    ///
    /// Fails with a resource error before any command is issued when the
    /// configuration cannot fit the target's announced capacity, and with
    /// a type error for signals that cannot be sampled (pointer-indirect
    /// storage, zero-size types).
    pub async fn configure(
        client: Arc<XcpClient>,
        table: &SymbolTable,
        config: DaqConfig,
    ) -> Result<DaqEngine> {
        if config.signals.is_empty() {
            return Err(Error::Resource("no signals to acquire".to_string()));
        }
        let info = client.connect_info();
        if !info.resources.supports_daq() {
            return Err(Error::Resource(
                "target does not support data acquisition".to_string(),
            ));
        }

        let _seq = client.lock_sequence().await;

        let processor = client.get_daq_processor_info().await?;
        let resolution = client.get_daq_resolution_info().await?;
        if !processor.dynamic_config() {
            return Err(Error::Resource(
                "target only supports static DAQ lists".to_string(),
            ));
        }

        let timestamps = processor.timestamp_supported() && resolution.timestamp_size() > 0;
        let timestamp_size = if timestamps { resolution.timestamp_size() } else { 0 };
        let header_len = processor.key_byte.header_len();

        // Group signals by event channel, preserving first-seen order.
        let mut grouped: IndexMap<u16, Vec<(Arc<crate::symtab::Symbol>, DaqEntryWrite)>> =
            IndexMap::new();
        for signal in &config.signals {
            let symbol = table.resolve(&signal.path)?;
            if !matches!(symbol.storage, Storage::Direct) {
                return Err(Error::Type(format!(
                    "'{}' is reached through a pointer and cannot be sampled",
                    signal.path
                )));
            }
            let size = symbol.ty.size();
            if size == 0 {
                return Err(Error::Type(format!("'{}' has no size", signal.path)));
            }
            if size > resolution.max_odt_entry_size as usize {
                return Err(Error::Resource(format!(
                    "'{}' is {} bytes, the target caps ODT entries at {}",
                    signal.path, size, resolution.max_odt_entry_size
                )));
            }
            let address = u32::try_from(symbol.address).map_err(|_| {
                Error::Type(format!(
                    "'{}' at {:#x} exceeds the 32-bit wire format",
                    signal.path, symbol.address
                ))
            })?;
            let entry = DaqEntryWrite {
                bit_offset: 0xFF,
                size: size as u8,
                address_extension: 0,
                address,
            };
            grouped
                .entry(signal.event_channel)
                .or_default()
                .push((symbol, entry));
        }

        if grouped.len() > processor.max_daq as usize {
            return Err(Error::Resource(format!(
                "{} DAQ lists needed, target allows {}",
                grouped.len(),
                processor.max_daq
            )));
        }

        // Pack each list into ODTs. ODT 0 additionally carries the
        // timestamp, so it has less room for entries.
        let max_dto = info.max_dto as usize;
        let mut lists = Vec::new();
        let mut writes: Vec<Vec<Vec<DaqEntryWrite>>> = Vec::new();
        for (&event_channel, entries) in grouped.iter() {
            if event_channel >= processor.max_event_channel {
                return Err(Error::Resource(format!(
                    "event channel {} out of range (target has {})",
                    event_channel, processor.max_event_channel
                )));
            }
            let mut odts: Vec<Vec<EntrySlot>> = Vec::new();
            let mut odt_writes: Vec<Vec<DaqEntryWrite>> = Vec::new();
            let mut room = 0usize;
            for (symbol, entry) in entries {
                let size = entry.size as usize;
                if size > room {
                    let overhead = header_len + if odts.is_empty() { timestamp_size } else { 0 };
                    room = max_dto
                        .checked_sub(overhead)
                        .filter(|r| *r >= size)
                        .ok_or_else(|| {
                            Error::Resource(format!(
                                "'{}' needs {} bytes, an ODT carries at most {}",
                                symbol.path,
                                size,
                                max_dto.saturating_sub(overhead)
                            ))
                        })?;
                    odts.push(Vec::new());
                    odt_writes.push(Vec::new());
                }
                let odt = odts.last_mut().expect("room implies an open odt");
                odt.push(EntrySlot {
                    ty: symbol.ty.clone(),
                    bits: symbol.bits,
                    size,
                });
                odt_writes.last_mut().expect("open odt").push(*entry);
                room -= size;
            }
            if odts.len() > 0xFC {
                return Err(Error::Resource(format!(
                    "event channel {} needs {} ODTs, the identifier space allows 252",
                    event_channel,
                    odts.len()
                )));
            }
            lists.push(ListLayout {
                event_channel,
                odts,
            });
            writes.push(odt_writes);
        }

        // Allocation sequence. From here on capacity errors are the
        // target's verdict, not ours.
        client.free_daq().await?;
        client.alloc_daq(lists.len() as u16).await?;
        for (i, list_writes) in writes.iter().enumerate() {
            let daq = i as u16;
            client.alloc_odt(daq, list_writes.len() as u8).await?;
            for (j, odt_writes) in list_writes.iter().enumerate() {
                client
                    .alloc_odt_entry(daq, j as u8, odt_writes.len() as u8)
                    .await?;
            }
        }

        // Entry writes. WRITE_DAQ_MULTIPLE batches when the target
        // advertises the optimisation; the batch size is bounded by what
        // fits a command packet.
        let batched = processor.key_byte.optimisation_type() > 0;
        let batch_cap = ((info.max_cto as usize).saturating_sub(2) / 8).max(1);
        for (i, list_writes) in writes.iter().enumerate() {
            let daq = i as u16;
            for (j, odt_writes) in list_writes.iter().enumerate() {
                client.set_daq_ptr(daq, j as u8, 0).await?;
                if batched && odt_writes.len() > 1 {
                    for chunk in odt_writes.chunks(batch_cap) {
                        client.write_daq_multiple(chunk).await?;
                    }
                } else {
                    for entry in odt_writes {
                        client.write_daq(*entry).await?;
                    }
                }
            }
        }

        // List modes and selection.
        let mode = if timestamps { 0x10 } else { 0x00 };
        let mut first_pids = Vec::with_capacity(lists.len());
        for (i, list) in lists.iter().enumerate() {
            let daq = i as u16;
            client
                .set_daq_list_mode(
                    mode,
                    daq,
                    list.event_channel,
                    config.prescaler.max(1),
                    config.priority,
                )
                .await?;
            let first_pid = client
                .start_stop_daq_list(daq_list_mode::SELECT, daq)
                .await?;
            first_pids.push(first_pid);
        }

        let id_scheme = match processor.key_byte.identification_type() {
            IdentificationType::Absolute => IdScheme::Absolute { first_pids },
            other => IdScheme::Relative {
                header_len: match other {
                    IdentificationType::RelativeByte => 2,
                    IdentificationType::RelativeWord => 3,
                    _ => 4,
                },
            },
        };

        let tick_ns = if timestamps { resolution.tick_ns().max(1) } else { 1 };
        let clock_seed = if timestamps {
            client.get_daq_clock().await? as u64
        } else {
            0
        };

        client.set_connection_state(ConnectionState::DaqConfigured);
        info!(
            "DAQ configured: {} lists, timestamps {}",
            lists.len(),
            if timestamps { "target" } else { "host" }
        );

        let metadata = DaqMetadata {
            timestamp_source: if timestamps {
                TimestampSource::Target
            } else {
                TimestampSource::Host
            },
            tick_ns,
            lists: lists.len(),
        };
        drop(_seq);
        Ok(DaqEngine {
            client,
            queue: Arc::new(SampleQueue::new(config.queue_capacity, config.overflow)),
            lists,
            id_scheme,
            metadata,
            tick_ns,
            timestamp_size,
            clock_seed,
            stats: Arc::new(SharedStats::default()),
            reassembler: None,
            running: false,
        })
    }

    /// Begin acquisition and return the consumer stream.
    pub async fn start(&mut self) -> Result<SampleStream> {
        if self.running {
            return Err(Error::State {
                operation: "daq_start",
                state: ConnectionState::DaqRunning.as_str(),
            });
        }
        let (tx, rx) = mpsc::channel(REASSEMBLY_CHANNEL_DEPTH);
        self.client.attach_daq(tx);

        let reassembler = Reassembler::new(
            self.lists.clone(),
            self.id_scheme.clone(),
            self.timestamp_size,
            self.tick_ns,
            self.clock_seed,
            self.client.connect_info().byte_order,
        );
        let queue = Arc::clone(&self.queue);
        let stats = Arc::clone(&self.stats);
        self.reassembler = Some(tokio::spawn(run_reassembler(rx, reassembler, queue, stats)));

        self.client
            .start_stop_synch(daq_synch_mode::START_SELECTED)
            .await?;
        self.running = true;
        debug!("DAQ running");
        Ok(self.stream())
    }

    /// The consumer stream. Single consumer; see [`SampleStream`].
    pub fn stream(&self) -> SampleStream {
        SampleStream {
            queue: Arc::clone(&self.queue),
            metadata: self.metadata,
        }
    }

    /// Stop acquisition. When this returns, the reassembler has exited and
    /// no further sample reaches the consumer queue.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        self.running = false;
        let result = self
            .client
            .start_stop_synch(daq_synch_mode::STOP_ALL)
            .await;
        self.client.detach_daq();
        if let Some(handle) = self.reassembler.take() {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!("reassembler task failed: {}", e);
                }
            }
        }
        debug!("DAQ stopped");
        result
    }

    /// Shut the stream down for good; pending `recv` calls observe the
    /// end of the stream once the queue drains.
    pub async fn shutdown(&mut self) -> Result<()> {
        let result = self.stop().await;
        self.queue.close();
        result
    }

    pub fn metadata(&self) -> DaqMetadata {
        self.metadata
    }

    pub fn stats(&self) -> DaqStats {
        let link = self.client.link_stats();
        DaqStats {
            samples: self.stats.samples.load(Ordering::Relaxed),
            samples_lost: self.stats.samples_lost.load(Ordering::Relaxed),
            dropped: self.queue.dropped.load(Ordering::Relaxed),
            counter_gaps: link.counter_gaps,
            dto_overflow: link.dto_overflow,
        }
    }
}

async fn run_reassembler(
    mut rx: mpsc::Receiver<DtoPacket>,
    mut reassembler: Reassembler,
    queue: Arc<SampleQueue>,
    stats: Arc<SharedStats>,
) {
    while let Some(packet) = rx.recv().await {
        for sample in reassembler.handle_packet(&packet) {
            stats.samples.fetch_add(1, Ordering::Relaxed);
            queue.push(sample).await;
        }
        stats
            .samples_lost
            .store(reassembler.lost, Ordering::Relaxed);
    }
    stats
        .samples_lost
        .store(reassembler.lost, Ordering::Relaxed);
    trace!("reassembler detached");
}

// ---- reassembly ---------------------------------------------------------

struct PartialCycle {
    timestamp: Timestamp,
    parts: Vec<Option<Vec<u8>>>,
    received: usize,
}

impl PartialCycle {
    fn complete(&self) -> bool {
        self.received == self.parts.len()
    }
}

struct ListState {
    layout: ListLayout,
    window: VecDeque<PartialCycle>,
    /// Extended 64-bit tick counter for timestamp wrap tracking.
    last_ticks: u64,
}

/// Streaming state machine from DTO packets to finalised samples.
struct Reassembler {
    lists: Vec<ListState>,
    id_scheme: IdScheme,
    timestamp_size: usize,
    tick_ns: u64,
    order: ByteOrder,
    lost: u64,
}

impl Reassembler {
    fn new(
        lists: Vec<ListLayout>,
        id_scheme: IdScheme,
        timestamp_size: usize,
        tick_ns: u64,
        clock_seed: u64,
        order: ByteOrder,
    ) -> Self {
        Self {
            lists: lists
                .into_iter()
                .map(|layout| ListState {
                    layout,
                    window: VecDeque::new(),
                    last_ticks: clock_seed,
                })
                .collect(),
            id_scheme,
            timestamp_size,
            tick_ns,
            order,
            lost: 0,
        }
    }

    /// Feed one packet; returns the samples it completed, oldest first.
    fn handle_packet(&mut self, packet: &DtoPacket) -> Vec<Sample> {
        let Some((list_index, odt, header_len)) = self.identify(&packet.payload) else {
            self.lost += 1;
            warn!("unroutable DAQ packet ({} bytes)", packet.payload.len());
            return Vec::new();
        };
        let timestamp_size = self.timestamp_size;
        let tick_ns = self.tick_ns;
        let order = self.order;
        let state = &mut self.lists[list_index];
        let odt_count = state.layout.odts.len();
        if odt >= odt_count {
            self.lost += 1;
            return Vec::new();
        }

        if odt == 0 {
            // A new cycle. Its timestamp comes from the target when
            // enabled, from the packet's reception time otherwise.
            let timestamp = if timestamp_size > 0 {
                let Some(raw) =
                    read_raw_timestamp(&packet.payload, header_len, timestamp_size, order)
                else {
                    self.lost += 1;
                    return Vec::new();
                };
                let ticks = extend_timestamp(state.last_ticks, raw, timestamp_size as u32 * 8);
                if ticks < state.last_ticks {
                    warn!("timestamp of list {} declining", list_index);
                }
                state.last_ticks = ticks;
                Timestamp {
                    ns: ticks.saturating_mul(tick_ns),
                    source: TimestampSource::Target,
                }
            } else {
                Timestamp {
                    ns: packet.host_ns,
                    source: TimestampSource::Host,
                }
            };

            if state.window.len() == CYCLE_WINDOW {
                // Window closed for the oldest cycle; whatever it was
                // still missing is lost.
                let evicted = state.window.pop_front().expect("window non-empty");
                if !evicted.complete() {
                    self.lost += 1;
                }
            }
            let mut cycle = PartialCycle {
                timestamp,
                parts: vec![None; odt_count],
                received: 0,
            };
            let data_offset = header_len + timestamp_size;
            cycle.parts[0] = Some(packet.payload[data_offset..].to_vec());
            cycle.received = 1;
            state.window.push_back(cycle);
        } else {
            // Attach to the oldest cycle still missing this ODT, so a
            // reordered packet lands in the cycle that was waiting for it.
            let slot = state
                .window
                .iter_mut()
                .find(|cycle| cycle.parts[odt].is_none());
            match slot {
                Some(cycle) => {
                    cycle.parts[odt] = Some(packet.payload[header_len..].to_vec());
                    cycle.received += 1;
                }
                None => {
                    self.lost += 1;
                    trace!("late ODT {} for list {}", odt, list_index);
                }
            }
        }

        // Deliver in first-ODT order: only finalise from the front.
        let mut finished = Vec::new();
        while state.window.front().is_some_and(PartialCycle::complete) {
            let cycle = state.window.pop_front().expect("front checked");
            match decode_cycle(&state.layout, &cycle, order) {
                Ok(values) => finished.push(Sample {
                    list: list_index,
                    timestamp: cycle.timestamp,
                    values,
                }),
                Err(e) => {
                    self.lost += 1;
                    warn!("undecodable cycle on list {}: {}", list_index, e);
                }
            }
        }
        finished
    }

    /// Map a packet to (list, odt, header length).
    fn identify(&self, payload: &[u8]) -> Option<(usize, usize, usize)> {
        match &self.id_scheme {
            IdScheme::Absolute { first_pids } => {
                let pid = *payload.first()?;
                for (list_index, state) in self.lists.iter().enumerate() {
                    let first = first_pids[list_index];
                    let count = state.layout.odts.len() as u8;
                    if pid >= first && pid < first.saturating_add(count) {
                        return Some((list_index, (pid - first) as usize, 1));
                    }
                }
                None
            }
            IdScheme::Relative { header_len } => {
                if payload.len() < *header_len {
                    return None;
                }
                let odt = payload[0] as usize;
                let daq = match header_len {
                    2 => payload[1] as usize,
                    3 => self.order.u16_from([payload[1], payload[2]]) as usize,
                    _ => self.order.u16_from([payload[2], payload[3]]) as usize,
                };
                if daq >= self.lists.len() {
                    return None;
                }
                Some((daq, odt, *header_len))
            }
        }
    }
}

fn read_raw_timestamp(
    payload: &[u8],
    header_len: usize,
    size: usize,
    order: ByteOrder,
) -> Option<u32> {
    let bytes = payload.get(header_len..header_len + size)?;
    Some(match size {
        1 => bytes[0] as u32,
        2 => order.u16_from([bytes[0], bytes[1]]) as u32,
        _ => order.u32_from([bytes[0], bytes[1], bytes[2], bytes[3]]),
    })
}

/// Extend a wrapped raw timestamp to 64 bits against the previous value.
fn extend_timestamp(last: u64, raw: u32, bits: u32) -> u64 {
    let mask = if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 };
    let low = last & mask;
    let mut high = last >> bits;
    if (raw as u64) < low {
        high += 1;
    }
    (raw as u64) | (high << bits)
}

fn decode_cycle(layout: &ListLayout, cycle: &PartialCycle, order: ByteOrder) -> Result<Vec<Value>> {
    let mut values = Vec::with_capacity(layout.value_count());
    for (odt, slots) in layout.odts.iter().enumerate() {
        let data = cycle.parts[odt]
            .as_deref()
            .ok_or_else(|| Error::Type("incomplete cycle finalised".to_string()))?;
        let mut offset = 0usize;
        for slot in slots {
            let bytes = data.get(offset..offset + slot.size).ok_or_else(|| {
                Error::Type(format!(
                    "ODT {} payload of {} bytes, entry needs {}..{}",
                    odt,
                    data.len(),
                    offset,
                    offset + slot.size
                ))
            })?;
            let value = match slot.bits {
                Some(bits) => decode_bit_field(bytes, &slot.ty, bits, order)?,
                None => decode_value(bytes, &slot.ty, order)?,
            };
            values.push(value);
            offset += slot.size;
        }
    }
    Ok(values)
}
