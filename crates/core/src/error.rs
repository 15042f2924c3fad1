//! Error taxonomy shared by the registry, driver gateway and fleet executor.

use serde::{Deserialize, Serialize};

use crate::ResourceKind;

/// Failure raised by the driver gateway, regardless of which transport was used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum DriverError {
    /// Connection, timeout or I/O failure before a response was read.
    #[error("transport: {0}")]
    Transport(String),
    /// REST response outside the success range; the body is kept verbatim.
    #[error("driver returned status {status}: {body}")]
    Status { status: u16, body: String },
    /// RPC call completed but the remote side reported an error.
    #[error("remote: {0}")]
    Remote(String),
    #[error("decode: {0}")]
    Decode(String),
    /// Operation has no mapping on the selected transport.
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("config: {0}")]
    Config(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("already exists: {namespace}/{kind}/{id}")]
    AlreadyExists { namespace: String, kind: ResourceKind, id: String },
    #[error("not found: {namespace}/{kind}/{id}")]
    NotFound { namespace: String, kind: ResourceKind, id: String },
    #[error(transparent)]
    Driver(#[from] DriverError),
    /// Canonical store or mirror failure.
    #[error("persistence: {0}")]
    Persistence(String),
    #[error("timed out acquiring lock {key}")]
    LockTimeout { key: String },
    /// A task ended without producing a result (it panicked).
    #[error("aborted: {0}")]
    Aborted(String),
}

pub type NimbusResult<T> = Result<T, Error>;

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn not_found(namespace: &str, kind: ResourceKind, id: &str) -> Self {
        Error::NotFound { namespace: namespace.to_string(), kind, id: id.to_string() }
    }

    pub fn already_exists(namespace: &str, kind: ResourceKind, id: &str) -> Self {
        Error::AlreadyExists { namespace: namespace.to_string(), kind, id: id.to_string() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidArgument(format!("json: {}", e))
    }
}
