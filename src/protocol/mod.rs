//! # Protocol Module
//!
//! Host-side half of the XCP calibration/measurement protocol: packet
//! identifiers, the mandatory command subset, negative-response codes, and
//! the typed views of the identification responses (`CONNECT`,
//! `GET_DAQ_PROCESSOR_INFO`, `GET_DAQ_RESOLUTION_INFO`).
//!
//! The request/response state machine lives in [`client`]. Everything here
//! is plain data: byte-order aware integer codecs, flag accessors, and the
//! wire constants the client and the DAQ engine share.

use serde::{Deserialize, Serialize};

pub mod client;

pub use client::XcpClient;

/// Command codes, host to target.
pub mod cmd {
    pub const CONNECT: u8 = 0xFF;
    pub const DISCONNECT: u8 = 0xFE;
    pub const GET_STATUS: u8 = 0xFD;
    pub const SYNCH: u8 = 0xFC;
    pub const GET_COMM_MODE_INFO: u8 = 0xFB;
    pub const SET_MTA: u8 = 0xF6;
    pub const UPLOAD: u8 = 0xF5;
    pub const SHORT_UPLOAD: u8 = 0xF4;
    pub const DOWNLOAD: u8 = 0xF0;
    pub const GET_DAQ_CLOCK: u8 = 0xDC;
    pub const GET_DAQ_PROCESSOR_INFO: u8 = 0xDA;
    pub const GET_DAQ_RESOLUTION_INFO: u8 = 0xD9;
    pub const FREE_DAQ: u8 = 0xD6;
    pub const ALLOC_DAQ: u8 = 0xD5;
    pub const ALLOC_ODT: u8 = 0xD4;
    pub const ALLOC_ODT_ENTRY: u8 = 0xD3;
    pub const SET_DAQ_PTR: u8 = 0xE2;
    pub const WRITE_DAQ: u8 = 0xE1;
    pub const SET_DAQ_LIST_MODE: u8 = 0xE0;
    pub const START_STOP_DAQ_LIST: u8 = 0xDE;
    pub const START_STOP_SYNCH: u8 = 0xDD;
    pub const WRITE_DAQ_MULTIPLE: u8 = 0xC7;
}

/// Packet identifiers, target to host. Identifiers below [`pid::SERV`] are
/// data-acquisition packets; the exact range in use is announced by the
/// target through the DAQ allocation responses.
pub mod pid {
    pub const RES: u8 = 0xFF;
    pub const ERR: u8 = 0xFE;
    pub const EV: u8 = 0xFD;
    pub const SERV: u8 = 0xFC;
}

/// Service request codes carried in the second byte of a SERV packet.
pub mod serv {
    /// Target requests a reset.
    pub const RESET: u8 = 0x00;
    /// Plain text for the host log.
    pub const TEXT: u8 = 0x01;
}

/// Modes for `START_STOP_DAQ_LIST`.
pub mod daq_list_mode {
    pub const STOP: u8 = 0x00;
    pub const START: u8 = 0x01;
    pub const SELECT: u8 = 0x02;
}

/// Modes for `START_STOP_SYNCH`.
pub mod daq_synch_mode {
    pub const STOP_ALL: u8 = 0x00;
    pub const START_SELECTED: u8 = 0x01;
    pub const STOP_SELECTED: u8 = 0x02;
}

/// Name for a negative-response code, per the standard code table.
pub fn error_name(code: u8) -> &'static str {
    match code {
        0x00 => "ERR_CMD_SYNCH",
        0x10 => "ERR_CMD_BUSY",
        0x11 => "ERR_DAQ_ACTIVE",
        0x12 => "ERR_PGM_ACTIVE",
        0x20 => "ERR_CMD_UNKNOWN",
        0x21 => "ERR_CMD_SYNTAX",
        0x22 => "ERR_OUT_OF_RANGE",
        0x23 => "ERR_WRITE_PROTECTED",
        0x24 => "ERR_ACCESS_DENIED",
        0x25 => "ERR_ACCESS_LOCKED",
        0x26 => "ERR_PAGE_NOT_VALID",
        0x27 => "ERR_MODE_NOT_VALID",
        0x28 => "ERR_SEGMENT_NOT_VALID",
        0x29 => "ERR_SEQUENCE",
        0x2A => "ERR_DAQ_CONFIG",
        0x30 => "ERR_MEMORY_OVERFLOW",
        0x31 => "ERR_GENERIC",
        0x32 => "ERR_VERIFY",
        _ => "ERR_UNDEFINED",
    }
}

/// Connection lifecycle of a protocol session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    DaqConfigured,
    DaqRunning,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connected => "connected",
            ConnectionState::DaqConfigured => "daq-configured",
            ConnectionState::DaqRunning => "daq-running",
        }
    }
}

/// Target byte order, discovered from the CONNECT response and applied to
/// every multi-byte field in commands, responses, and DAQ payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub fn u16_from(self, b: [u8; 2]) -> u16 {
        match self {
            ByteOrder::Little => u16::from_le_bytes(b),
            ByteOrder::Big => u16::from_be_bytes(b),
        }
    }

    pub fn u32_from(self, b: [u8; 4]) -> u32 {
        match self {
            ByteOrder::Little => u32::from_le_bytes(b),
            ByteOrder::Big => u32::from_be_bytes(b),
        }
    }

    pub fn u64_from(self, b: [u8; 8]) -> u64 {
        match self {
            ByteOrder::Little => u64::from_le_bytes(b),
            ByteOrder::Big => u64::from_be_bytes(b),
        }
    }

    pub fn u16_to(self, v: u16) -> [u8; 2] {
        match self {
            ByteOrder::Little => v.to_le_bytes(),
            ByteOrder::Big => v.to_be_bytes(),
        }
    }

    pub fn u32_to(self, v: u32) -> [u8; 4] {
        match self {
            ByteOrder::Little => v.to_le_bytes(),
            ByteOrder::Big => v.to_be_bytes(),
        }
    }

    pub fn u64_to(self, v: u64) -> [u8; 8] {
        match self {
            ByteOrder::Little => v.to_le_bytes(),
            ByteOrder::Big => v.to_be_bytes(),
        }
    }
}

/// Resource availability mask from the CONNECT response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFlags(pub u8);

impl ResourceFlags {
    pub fn supports_calibration(self) -> bool {
        self.0 & 0x01 != 0
    }

    pub fn supports_daq(self) -> bool {
        self.0 & 0x04 != 0
    }

    pub fn supports_stim(self) -> bool {
        self.0 & 0x08 != 0
    }

    pub fn supports_programming(self) -> bool {
        self.0 & 0x10 != 0
    }
}

/// Target identity negotiated by CONNECT.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConnectInfo {
    pub byte_order: ByteOrder,
    /// Maximum command-packet size in bytes.
    pub max_cto: u8,
    /// Maximum DAQ-packet size in bytes.
    pub max_dto: u16,
    pub resources: ResourceFlags,
    pub protocol_version: u8,
    pub transport_version: u8,
}

/// Session status from GET_STATUS.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StatusInfo {
    pub session_status: u8,
    pub resource_protection: u8,
}

/// Optional communication parameters from GET_COMM_MODE_INFO.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CommModeInfo {
    pub comm_mode_optional: u8,
    pub max_bs: u8,
    pub min_st: u8,
    pub queue_size: u8,
    pub driver_version: u8,
}

/// How DAQ packets identify their ODT on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentificationType {
    /// Single byte holding an absolute ODT number.
    Absolute,
    /// Relative ODT number plus a one-byte DAQ list number.
    RelativeByte,
    /// Relative ODT number plus a two-byte DAQ list number.
    RelativeWord,
    /// As `RelativeWord` with an alignment fill byte after the ODT number.
    RelativeWordAligned,
}

/// DAQ_KEY_BYTE from GET_DAQ_PROCESSOR_INFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaqKeyByte(pub u8);

impl DaqKeyByte {
    pub fn identification_type(self) -> IdentificationType {
        match (self.0 >> 6) & 0x03 {
            0 => IdentificationType::Absolute,
            1 => IdentificationType::RelativeByte,
            2 => IdentificationType::RelativeWord,
            _ => IdentificationType::RelativeWordAligned,
        }
    }

    /// Optimisation type field; a non-zero value advertises support for the
    /// batched `WRITE_DAQ_MULTIPLE` form.
    pub fn optimisation_type(self) -> u8 {
        self.0 & 0x0F
    }

    /// Header size in bytes of the identification field.
    pub fn header_len(self) -> usize {
        match self.identification_type() {
            IdentificationType::Absolute => 1,
            IdentificationType::RelativeByte => 2,
            IdentificationType::RelativeWord => 3,
            IdentificationType::RelativeWordAligned => 4,
        }
    }
}

/// DAQ processor capabilities from GET_DAQ_PROCESSOR_INFO.
#[derive(Debug, Clone, Copy)]
pub struct DaqProcessorInfo {
    pub properties: u8,
    pub max_daq: u16,
    pub max_event_channel: u16,
    pub min_daq: u8,
    pub key_byte: DaqKeyByte,
}

impl DaqProcessorInfo {
    /// Dynamic DAQ list configuration (the ALLOC command family).
    pub fn dynamic_config(self) -> bool {
        self.properties & 0x01 != 0
    }

    pub fn timestamp_supported(self) -> bool {
        self.properties & 0x10 != 0
    }
}

/// Timing granularity from GET_DAQ_RESOLUTION_INFO.
#[derive(Debug, Clone, Copy)]
pub struct DaqResolutionInfo {
    pub granularity_odt_entry: u8,
    pub max_odt_entry_size: u8,
    pub timestamp_mode: u8,
    pub timestamp_ticks: u16,
}

impl DaqResolutionInfo {
    /// Size in bytes of the timestamp field in ODT 0 packets (0, 1, 2, 4).
    pub fn timestamp_size(self) -> usize {
        (self.timestamp_mode & 0x07) as usize
    }

    /// Nanoseconds per timestamp tick: `ticks × 10^unit`.
    pub fn tick_ns(self) -> u64 {
        let unit = (self.timestamp_mode >> 4) & 0x0F;
        let scale = 10u64.saturating_pow(unit as u32);
        self.timestamp_ticks as u64 * scale
    }
}
