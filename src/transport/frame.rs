//! Frame codec shared by the transport bindings.
//!
//! Both bindings use the same layout on the wire: a little-endian 16-bit
//! payload length, a 16-bit frame counter, then the payload. There is no
//! inter-frame delimiter; framing is by length only. The host assigns
//! counters on transmitted frames and tracks the counters the target echoes
//! on its own frames; gaps are logged and counted for the data-acquisition
//! loss accounting.
//!
//! Resynchronisation: a header whose length field is zero or larger than
//! [`MAX_FRAME_PAYLOAD`] is implausible and drops the decoder out of sync.
//! While out of sync it scans byte by byte, and a plausible length alone is
//! not enough to lock back on — garbage can combine with a real length byte
//! into a plausible phantom frame that would swallow the next real frame.
//! A candidate header must also be validated: its counter has to continue
//! the observed sequence or, before any frame has been decoded, the
//! candidate's end has to land on a confirmed frame boundary. Rejected
//! candidates keep the scan advancing. A scan that burns through a whole
//! frame's worth of bytes without locking on counts as one failure; three
//! failures in a single outage escalate to a framing error, which the
//! reader task turns into a disconnect.

use bytes::{Buf, BytesMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::MAX_FRAME_PAYLOAD;
use crate::error::{Error, Result};

/// Frame header size: u16 length + u16 counter.
pub const HEADER_LEN: usize = 4;

/// Consecutive exhausted resync scans tolerated before giving up.
const MAX_RESYNC_STRIKES: u8 = 3;

/// Bytes one resync scan may discard before it counts as a failure: deeper
/// than this, a real frame boundary would already have been visible.
const MAX_RESYNC_DISCARD: usize = MAX_FRAME_PAYLOAD + HEADER_LEN;

/// How far ahead of the expected counter a resync candidate may be and
/// still count as continuing the sequence. Frames mangled inside the
/// garbage burst advance the target's counter past the expected value.
const RESYNC_COUNTER_WINDOW: u16 = 16;

/// Encode one frame: header plus payload.
pub fn encode_frame(counter: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(&counter.to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Incremental frame decoder with resynchronisation.
pub struct FrameDecoder {
    buf: BytesMut,
    /// False while scanning for a frame boundary after corruption.
    synced: bool,
    /// Bytes discarded by the current resync scan.
    discarded: usize,
    /// Consecutive resync scans that exhausted their discard budget.
    strikes: u8,
    expected_counter: Option<u16>,
    counter_gaps: Arc<AtomicU64>,
}

impl FrameDecoder {
    pub fn new(counter_gaps: Arc<AtomicU64>) -> Self {
        Self {
            buf: BytesMut::with_capacity(2 * MAX_FRAME_PAYLOAD),
            synced: true,
            discarded: 0,
            strikes: 0,
            expected_counter: None,
            counter_gaps,
        }
    }

    /// Append raw bytes received from the wire.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Extract the next complete payload, if any.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Returns a framing
    /// error once [`MAX_RESYNC_STRIKES`] consecutive resync scans have each
    /// discarded a full frame's worth of bytes without locking back on.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if self.buf.len() < HEADER_LEN {
                return Ok(None);
            }
            if self.synced {
                let len = self.length_at(0);
                if !plausible(len) {
                    warn!("implausible frame length {}, resynchronising", len);
                    self.synced = false;
                    self.discarded = 0;
                    continue;
                }
                if self.buf.len() < HEADER_LEN + len {
                    return Ok(None);
                }
                return Ok(Some(self.accept_frame(len)));
            }
            match self.scan_candidate()? {
                Scan::Locked(payload) => return Ok(Some(payload)),
                Scan::NeedMore => return Ok(None),
                Scan::Rejected => continue,
            }
        }
    }

    /// Judge the candidate header at the front of the buffer while out of
    /// sync. A plausible length alone is not trusted: the candidate must
    /// continue the counter sequence, or — before any frame has been
    /// decoded — end exactly on a confirmed boundary.
    fn scan_candidate(&mut self) -> Result<Scan> {
        let len = self.length_at(0);
        if !plausible(len) {
            return self.discard_one();
        }
        let counter = u16::from_le_bytes([self.buf[2], self.buf[3]]);
        match self.expected_counter {
            Some(expected) => {
                if counter.wrapping_sub(expected) >= RESYNC_COUNTER_WINDOW {
                    return self.discard_one();
                }
                if self.buf.len() < HEADER_LEN + len {
                    // Counter continues the sequence; wait for the rest.
                    return Ok(Scan::NeedMore);
                }
                Ok(Scan::Locked(self.accept_frame(len)))
            }
            None => {
                // No sequence observed yet: only a fully buffered candidate
                // whose end lands on the buffer end or on another plausible
                // header counts as a boundary.
                let total = HEADER_LEN + len;
                if self.buf.len() < total {
                    return self.discard_one();
                }
                if self.buf.len() == total {
                    return Ok(Scan::Locked(self.accept_frame(len)));
                }
                match self.plausible_header_at(total) {
                    Some(true) => Ok(Scan::Locked(self.accept_frame(len))),
                    Some(false) => self.discard_one(),
                    // One more byte decides; don't walk past a real frame
                    // for it.
                    None => Ok(Scan::NeedMore),
                }
            }
        }
    }

    fn discard_one(&mut self) -> Result<Scan> {
        self.buf.advance(1);
        self.discarded += 1;
        if self.discarded >= MAX_RESYNC_DISCARD {
            self.strikes += 1;
            warn!(
                "resync scan discarded {} bytes without locking on ({} of {})",
                self.discarded, self.strikes, MAX_RESYNC_STRIKES
            );
            if self.strikes >= MAX_RESYNC_STRIKES {
                return Err(Error::Framing(format!(
                    "lost frame synchronisation after {} scans",
                    self.strikes
                )));
            }
            self.discarded = 0;
        }
        Ok(Scan::Rejected)
    }

    /// Whether the bytes at `offset` read as a plausible header; `None`
    /// when the length field there is not fully buffered yet.
    fn plausible_header_at(&self, offset: usize) -> Option<bool> {
        if self.buf.len() < offset + 2 {
            return None;
        }
        Some(plausible(self.length_at(offset)))
    }

    fn length_at(&self, offset: usize) -> usize {
        u16::from_le_bytes([self.buf[offset], self.buf[offset + 1]]) as usize
    }

    fn accept_frame(&mut self, len: usize) -> Vec<u8> {
        let counter = u16::from_le_bytes([self.buf[2], self.buf[3]]);
        self.track_counter(counter);
        self.buf.advance(HEADER_LEN);
        let payload = self.buf.split_to(len).to_vec();
        if !self.synced {
            debug!("frame synchronisation regained");
        }
        self.synced = true;
        self.discarded = 0;
        self.strikes = 0;
        payload
    }

    fn track_counter(&mut self, counter: u16) {
        if let Some(expected) = self.expected_counter {
            if counter != expected {
                let gap = counter.wrapping_sub(expected) as u64;
                self.counter_gaps.fetch_add(gap, Ordering::Relaxed);
                debug!(
                    "frame counter gap: expected {}, got {} ({} missed)",
                    expected, counter, gap
                );
            }
        }
        self.expected_counter = Some(counter.wrapping_add(1));
    }
}

enum Scan {
    /// A validated frame; the decoder is synced again.
    Locked(Vec<u8>),
    /// The candidate is promising but not fully buffered.
    NeedMore,
    /// The candidate was rejected and one byte was discarded.
    Rejected,
}

fn plausible(len: usize) -> bool {
    len >= 1 && len <= MAX_FRAME_PAYLOAD
}

/// Reader task body: de-frame the stream into the inbound channel.
///
/// Ends when the peer closes the stream, on an I/O error, when framing is
/// unrecoverable, or when the consumer drops the channel. Dropping the
/// sender closes the channel, which the protocol client observes as a
/// disconnect.
pub(crate) async fn run_reader<R>(
    mut stream: R,
    tx: mpsc::Sender<Vec<u8>>,
    counter_gaps: Arc<AtomicU64>,
) where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::new(counter_gaps);
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => {
                debug!("transport reader: peer closed the stream");
                return;
            }
            Ok(n) => {
                decoder.push(&chunk[..n]);
                loop {
                    match decoder.next_frame() {
                        Ok(Some(payload)) => {
                            trace!("received frame, {} payload bytes", payload.len());
                            if tx.send(payload).await.is_err() {
                                debug!("transport reader: consumer dropped the link");
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("transport reader: {}", e);
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                debug!("transport reader: I/O error: {}", e);
                return;
            }
        }
    }
}

/// Writer task body: frame outbound payloads in order with an incrementing
/// counter. Ends when the link is dropped or on an I/O error.
pub(crate) async fn run_writer<W>(mut stream: W, mut rx: mpsc::Receiver<Vec<u8>>)
where
    W: AsyncWrite + Unpin,
{
    let mut counter: u16 = 0;
    while let Some(payload) = rx.recv().await {
        let frame = encode_frame(counter, &payload);
        counter = counter.wrapping_add(1);
        if let Err(e) = stream.write_all(&frame).await {
            debug!("transport writer: I/O error: {}", e);
            return;
        }
        if let Err(e) = stream.flush().await {
            debug!("transport writer: flush error: {}", e);
            return;
        }
        trace!("sent frame, {} payload bytes", payload.len());
    }
    debug!("transport writer: link dropped");
}
