//! # Telepathy
//!
//! Host-side toolkit for observing and manipulating the live state of an
//! embedded target over XCP: typed read/write of the target's global
//! variables, symbolic access reconstructed from DWARF debug info or from
//! a self-describing model map in target memory, and periodic sample
//! streaming with backpressure.

pub mod daq;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod session;
pub mod symtab;
pub mod transport;
pub mod utils;
pub mod variables;

pub use daq::{DaqConfig, DaqSignal, OverflowPolicy, Sample, SampleStream};
pub use error::{Error, ErrorKind, Result};
pub use protocol::{ByteOrder, ConnectInfo, ConnectionState, XcpClient};
pub use session::{Session, SessionConfig};
pub use symtab::modelmap::ModelMapConfig;
pub use symtab::{SymbolTable, TypeDesc, Value};
pub use transport::{Transport, TransportConfig, TransportFactory, TransportKind};
pub use variables::VariableHandle;

/// The current version of the toolkit.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Default response deadline for a single command.
    pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

    /// Default consumer queue length for the DAQ engine.
    pub const QUEUE_CAPACITY: usize = 1024;

    /// Default root symbol of the model mapping structure.
    pub const MODEL_MAP_ROOT: &str = "rtwCAPI_ModelMappingInfo";

    /// Default TCP port of an XCP-on-Ethernet target.
    pub const TCP_PORT: u16 = 5555;
}
