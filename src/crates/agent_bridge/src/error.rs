use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result alias for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors that can occur while binding the agent channel or running an exchange.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to bind agent channel on {address}: {source}")]
    BindFailure {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to communicate with agent: send did not complete within {0:?}")]
    SendTimeout(Duration),
    #[error("failed to communicate with agent: no response within {0:?}")]
    ReceiveTimeout(Duration),
    #[error("failed to reach agent bridge within {0:?}")]
    ConnectTimeout(Duration),
    #[error("ZMTP handshake with peer failed: {0}")]
    Handshake(String),
    #[error("malformed agent response: {0}")]
    MalformedResponse(String),
    #[error("value for {field} is not a finite number")]
    NonFiniteValue { field: String },
    #[error("state {0} is not available from the host")]
    MissingState(String),
    #[error("failed to write state {name}: {reason}")]
    StateWrite { name: String, reason: String },
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
    #[error("request/reply sequence violated: {0}")]
    OutOfSequence(&'static str),
    #[error("agent disconnected")]
    PeerDisconnected,
    #[error("agent channel is closed")]
    ChannelClosed,
    #[error("a simulation run is already active on this connection")]
    RunAlreadyActive,
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl BridgeError {
    pub(crate) fn invalid_config(message: impl Into<String>) -> Self {
        BridgeError::InvalidConfig(message.into())
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        BridgeError::MalformedResponse(message.into())
    }

    pub(crate) fn non_finite(field: impl Into<String>) -> Self {
        BridgeError::NonFiniteValue {
            field: field.into(),
        }
    }

    /// Build a state write failure; intended for [`HostContext`](crate::HostContext)
    /// implementations.
    pub fn state_write(name: impl Into<String>, reason: impl Into<String>) -> Self {
        BridgeError::StateWrite {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error prevents the simulation run from proceeding at all.
    ///
    /// Everything raised during a single exchange is recoverable by the host.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::BindFailure { .. } | BridgeError::InvalidConfig(_)
        )
    }

    /// Whether the error is a transport timeout on either side of the exchange.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            BridgeError::SendTimeout(_)
                | BridgeError::ReceiveTimeout(_)
                | BridgeError::ConnectTimeout(_)
        )
    }
}
