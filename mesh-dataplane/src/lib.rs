pub mod agent;
pub mod bpf;
pub mod clock;
pub mod config;
pub mod desired;
pub mod http;
pub mod iface;
pub mod markbits;
pub mod metrics;

use aya::EbpfError;
use aya::pin::PinError;
use aya::programs::ProgramError;
use mesh_dataplane_common::Id;
use thiserror::Error;

use crate::bpf::service::ServiceKey;

#[derive(Error, Debug)]
pub enum Error {
    /// The table refused a new entry because it is at its size limit.
    #[error("table {table} is full ({max_entries} entries)")]
    Capacity {
        table: &'static str,
        max_entries: u32,
    },

    #[error("inconsistent update: {0}")]
    InconsistentUpdate(String),

    #[error("backend group {0} does not exist")]
    UnknownBackendGroup(Id),

    #[error("no service for {0}")]
    NoService(ServiceKey),

    #[error("service {0} has no backends")]
    NoBackends(ServiceKey),

    /// Configuration that would corrupt packet classification if the agent
    /// kept running. Never retried.
    #[error("fatal configuration error: {0}")]
    FatalConfig(String),

    #[error("{0}")]
    EbpfError(String),

    #[error("{0}")]
    EbpfProgramError(String),

    #[error("hook error: {0}")]
    Hook(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("errno: {0}")]
    Errno(#[from] nix::errno::Errno),

    #[error("conversion error: {0}")]
    ConversionError(String),

    #[error("addr parse error: {0}")]
    AddrParseError(#[from] std::net::AddrParseError),

    #[error("invalid network: {0}")]
    Network(#[from] ipnetwork::IpNetworkError),

    #[error("map error: {0}")]
    MapError(#[from] aya::maps::MapError),

    #[error(transparent)]
    JsonConversion(#[from] serde_json::Error),

    #[error("failed to pin: {0}")]
    PinError(#[from] PinError),

    #[error("map {name} not found")]
    MapNotFound { name: String },

    #[error("task failed: {0}")]
    Task(String),

    #[error("{0}")]
    Other(String),
}

impl From<EbpfError> for Error {
    fn from(value: EbpfError) -> Self {
        Self::EbpfError(value.to_string())
    }
}

impl From<ProgramError> for Error {
    fn from(value: ProgramError) -> Self {
        Self::EbpfProgramError(value.to_string())
    }
}

impl Error {
    pub fn is_capacity(&self) -> bool {
        matches!(self, Error::Capacity { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::MapError(aya::maps::MapError::KeyNotFound) | Error::MapNotFound { .. }
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
