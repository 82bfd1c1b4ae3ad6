use std::time::Duration;

use thiserror::Error;

use crate::client::ClientError;

/// Failures while establishing or authenticating a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Connection to {address} timed out after {}s", timeout.as_secs())]
    Timeout { address: String, timeout: Duration },

    #[error("Unable to connect to {address}: {source}")]
    Connection {
        address: String,
        source: ClientError,
    },

    #[error("Authentication failed: {0}")]
    Authentication(#[source] ClientError),

    #[error("Session is not connected")]
    NotConnected,
}
