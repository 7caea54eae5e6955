use std::{fmt, io};

/// Step of [`crate::VirtualInterface::configure`] that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigStep {
    Socket,
    FlagsGet,
    FlagsSet,
    AddressSet,
    NetmaskSet,
}

impl fmt::Display for ConfigStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConfigStep::Socket => "create control socket",
            ConfigStep::FlagsGet => "get interface flags",
            ConfigStep::FlagsSet => "set interface up",
            ConfigStep::AddressSet => "set interface address",
            ConfigStep::NetmaskSet => "set interface netmask",
        })
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to create device {name:?}: {source}")]
    DeviceCreation {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("device {0} is already initialized")]
    AlreadyInitialized(String),

    #[error("device is not initialized")]
    NotInitialized,

    #[error("failed to {step}: {source}")]
    Configuration {
        step: ConfigStep,
        #[source]
        source: io::Error,
    },

    #[error("capture already running on {0}")]
    AlreadyRunning(String),

    #[error("capture is not running")]
    NotRunning,

    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("failed to write packet: {0}")]
    Write(#[source] io::Error),

    #[error("short write: {written} of {expected} bytes")]
    PartialWrite { written: usize, expected: usize },
}

impl Error {
    pub(crate) fn configuration(step: ConfigStep, source: impl Into<io::Error>) -> Self {
        Self::Configuration {
            step,
            source: source.into(),
        }
    }

    /// The device had no room for the packet; the caller may retry or drop it.
    pub fn is_would_block(&self) -> bool {
        matches!(self, Error::Write(e) if e.kind() == io::ErrorKind::WouldBlock)
    }

    pub fn is_permission_denied(&self) -> bool {
        match self {
            Error::DeviceCreation { source, .. } | Error::Configuration { source, .. } => {
                source.kind() == io::ErrorKind::PermissionDenied
            }
            _ => false,
        }
    }
}

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T, E = Error> = ::std::result::Result<T, E>;
