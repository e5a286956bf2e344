//! # Error Types
//!
//! This module defines `Error`, the single error type used across the crate,
//! and the `Result` alias exported at the crate root. The variants follow the
//! propagation rules of the protocol stack:
//!
//! - **Transport errors** (`Transport`, `Framing`, `Disconnected`, `Timeout`)
//!   terminate the connection. Every wait pending on the connection fails and
//!   all further operations return `Disconnected` until the session is
//!   reopened.
//! - **Protocol errors** (`Protocol`, `UnexpectedPacket`) are local to the
//!   issuing call; the connection stays usable. The target's negative
//!   response code is preserved verbatim in `Protocol::code`.
//! - **Symbol and type errors** (`Symbol`, `Type`) are produced before any
//!   wire traffic.
//! - **State and resource errors** (`State`, `Resource`) reject operations
//!   that are illegal in the current connection state or exceed a
//!   target-reported capacity.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], matching the propagation policy
/// groups above. Useful for callers that only branch on the family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Protocol,
    State,
    Symbol,
    Type,
    Resource,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Protocol => "protocol",
            ErrorKind::State => "state",
            ErrorKind::Symbol => "symbol",
            ErrorKind::Type => "type",
            ErrorKind::Resource => "resource",
        };
        write!(f, "{}", label)
    }
}

/// Primary error type for the toolkit.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O failure on the underlying byte transport or an input file.
    #[error("I/O error: {0}")]
    Transport(#[from] std::io::Error),

    /// Packet framing could not be recovered from the byte stream.
    #[error("framing error: {0}")]
    Framing(String),

    /// The connection is gone; reopen the session before retrying.
    #[error("connection closed")]
    Disconnected,

    /// No response to a command within the configured deadline. The
    /// connection is marked dead: the target may be mid-write and a blind
    /// retransmission would not be safe.
    #[error("command {command:#04x} timed out after {timeout:?}")]
    Timeout { command: u8, timeout: Duration },

    /// Negative response from the target. `code` is the wire value.
    #[error("command {command:#04x} rejected: {name} ({code:#04x})")]
    Protocol {
        command: u8,
        code: u8,
        name: &'static str,
    },

    /// A response packet that does not match the protocol grammar.
    #[error("unexpected packet: {0}")]
    UnexpectedPacket(String),

    /// Operation not legal in the current connection state.
    #[error("{operation} is not allowed while {state}")]
    State {
        operation: &'static str,
        state: &'static str,
    },

    /// Path lookup failed.
    #[error("unknown symbol '{path}'")]
    Symbol { path: String },

    /// The debug image or mapping structure could not be interpreted.
    #[error("debug image: {0}")]
    Image(String),

    /// Decode failure, encode range check, or size mismatch.
    #[error("type error: {0}")]
    Type(String),

    /// Target-reported capacity exceeded or queue overflow with a failing
    /// policy.
    #[error("resource limit: {0}")]
    Resource(String),
}

impl Error {
    /// The taxonomic family of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport(_) | Error::Framing(_) | Error::Disconnected => ErrorKind::Transport,
            Error::Timeout { .. } | Error::Protocol { .. } | Error::UnexpectedPacket(_) => {
                ErrorKind::Protocol
            }
            Error::State { .. } => ErrorKind::State,
            Error::Symbol { .. } | Error::Image(_) => ErrorKind::Symbol,
            Error::Type(_) => ErrorKind::Type,
            Error::Resource(_) => ErrorKind::Resource,
        }
    }

    /// True for errors that terminate the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::Framing(_) | Error::Disconnected | Error::Timeout { .. }
        )
    }
}
