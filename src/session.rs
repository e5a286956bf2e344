//! # Session
//!
//! The caller-facing surface: one struct owning the protocol client, the
//! merged symbol table, and the optional DAQ engine, with the lifecycle
//! `connect → load symbols → resolve/read/write → daq → disconnect`.
//! External tools (IDE, plotting, log writers) build on exactly this
//! surface.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::daq::{DaqConfig, DaqEngine, DaqMetadata, DaqStats, SampleStream};
use crate::error::{Error, Result};
use crate::protocol::{ConnectInfo, ConnectionState, StatusInfo, XcpClient};
use crate::symtab::modelmap::{self, ModelMapConfig};
use crate::symtab::{dwarf, SymbolTable, Value};
use crate::transport::{TransportConfig, TransportFactory, TransportKind};
use crate::variables::{read_variable, write_variable, VariableHandle};

/// Session-level knobs; everything transport-specific lives in
/// [`TransportConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Fixed deadline for every command's response.
    pub command_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command_timeout: crate::defaults::COMMAND_TIMEOUT,
        }
    }
}

/// One connection to one target.
pub struct Session {
    client: Arc<XcpClient>,
    symbols: SymbolTable,
    daq: Option<DaqEngine>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("symbols", &self.symbols)
            .field("daq", &self.daq)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Open the transport and connect to the target.
    pub async fn connect(
        kind: TransportKind,
        transport_config: &TransportConfig,
        session_config: &SessionConfig,
    ) -> Result<Self> {
        let transport = TransportFactory::create(kind);
        let client =
            XcpClient::connect(transport, transport_config, session_config.command_timeout)
                .await?;
        Ok(Self {
            client: Arc::new(client),
            symbols: SymbolTable::new(),
            daq: None,
        })
    }

    /// Identity negotiated at connect time.
    pub fn connect_info(&self) -> ConnectInfo {
        self.client.connect_info()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.client.connection_state()
    }

    /// GET_STATUS round trip.
    pub async fn status(&self) -> Result<StatusInfo> {
        self.client.get_status().await
    }

    /// Load globals from a linked image with DWARF debug info. Returns the
    /// number of symbols added; repeated loads merge.
    pub fn load_symbols(&mut self, image: &Path) -> Result<usize> {
        let table = dwarf::load_image(image)?;
        let count = table.len();
        self.symbols.merge(table);
        info!("symbol table now holds {} roots", self.symbols.len());
        Ok(count)
    }

    /// Read the model's self-describing map out of target memory and merge
    /// the resulting symbols. The map root is resolved through the
    /// already-loaded debug info, read once, and cached in the table.
    pub async fn load_model_map(&mut self, config: &ModelMapConfig) -> Result<usize> {
        let table = modelmap::load_model_map(&self.client, &self.symbols, config).await?;
        let count = table.len();
        self.symbols.merge(table);
        info!("symbol table now holds {} roots", self.symbols.len());
        Ok(count)
    }

    /// Merge a table built elsewhere — programmatic symbol sources, or
    /// description formats parsed by external tooling.
    pub fn add_symbols(&mut self, table: SymbolTable) {
        self.symbols.merge(table);
    }

    /// All currently known symbols.
    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// Resolve a path into a handle for [`read`](Self::read) and
    /// [`write`](Self::write).
    pub fn resolve(&self, path: &str) -> Result<VariableHandle> {
        Ok(VariableHandle::new(self.symbols.resolve(path)?))
    }

    pub async fn read(&self, handle: &VariableHandle) -> Result<Value> {
        read_variable(&self.client, handle).await
    }

    pub async fn write(&self, handle: &VariableHandle, value: &Value) -> Result<()> {
        write_variable(&self.client, handle, value).await
    }

    /// Set up DAQ lists for the given signals. Legal while connected and
    /// not acquiring; replaces any previous configuration.
    pub async fn daq_configure(&mut self, config: DaqConfig) -> Result<()> {
        if self.connection_state() == ConnectionState::DaqRunning {
            return Err(Error::State {
                operation: "daq_configure",
                state: ConnectionState::DaqRunning.as_str(),
            });
        }
        let engine =
            DaqEngine::configure(Arc::clone(&self.client), &self.symbols, config).await?;
        self.daq = Some(engine);
        Ok(())
    }

    /// Start acquisition and hand back the sample stream.
    pub async fn daq_start(&mut self) -> Result<SampleStream> {
        self.daq_engine_mut()?.start().await
    }

    /// The sample stream of the configured engine. Single consumer.
    pub fn daq_samples(&self) -> Result<SampleStream> {
        Ok(self.daq_engine()?.stream())
    }

    pub fn daq_metadata(&self) -> Result<DaqMetadata> {
        Ok(self.daq_engine()?.metadata())
    }

    pub fn daq_stats(&self) -> Result<DaqStats> {
        Ok(self.daq_engine()?.stats())
    }

    /// Stop acquisition. The configuration stays; `daq_start` resumes it.
    pub async fn daq_stop(&mut self) -> Result<()> {
        self.daq_engine_mut()?.stop().await
    }

    /// Stop DAQ if running, send DISCONNECT, close the transport.
    pub async fn disconnect(mut self) -> Result<()> {
        if let Some(mut engine) = self.daq.take() {
            let _ = engine.shutdown().await;
        }
        self.client.disconnect().await
    }

    fn daq_engine(&self) -> Result<&DaqEngine> {
        self.daq.as_ref().ok_or(Error::State {
            operation: "daq access",
            state: self.client.connection_state().as_str(),
        })
    }

    fn daq_engine_mut(&mut self) -> Result<&mut DaqEngine> {
        self.daq.as_mut().ok_or(Error::State {
            operation: "daq access",
            state: ConnectionState::Connected.as_str(),
        })
    }
}
