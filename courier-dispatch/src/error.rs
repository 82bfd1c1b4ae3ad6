use core::fmt::Display;

use courier_common::ConfigErrors;
use courier_smtp::SessionError;
use thiserror::Error;

/// Failures talking to the message bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Subscription closed by the bus")]
    Closed,

    #[error("Bus unavailable")]
    Unavailable,
}

/// A payload a converter could not turn into an email.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ConvertError(String);

impl ConvertError {
    pub fn new(reason: impl Display) -> Self {
        Self(reason.to_string())
    }
}

/// Problems that stop a worker before it reaches its dispatch loop.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Invalid configuration: {0}")]
    Configuration(#[from] ConfigErrors),

    #[error("{0}")]
    Authentication(#[source] SessionError),

    #[error("{0}")]
    Connection(#[source] SessionError),

    #[error("{0}")]
    Timeout(#[source] SessionError),

    #[error("Unable to subscribe: {0}")]
    Bus(#[source] BusError),
}

impl From<SessionError> for StartupError {
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::Timeout { .. } => Self::Timeout(error),
            SessionError::Authentication(_) => Self::Authentication(error),
            SessionError::Connection { .. } | SessionError::NotConnected => {
                Self::Connection(error)
            }
        }
    }
}

impl StartupError {
    /// What went wrong, for the operator.
    #[must_use]
    pub const fn summary(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "Missing or invalid SMTP environment variables",
            Self::Authentication(_) => "SMTP Authentication failed, please check SMTP credentials",
            Self::Connection(_) => {
                "Unable to connect to SMTP server, please check SMTP server details and network connection"
            }
            Self::Timeout(_) => {
                "SMTP server connection timed out, please check SMTP server details and network connection"
            }
            Self::Bus(_) => {
                "Unable to subscribe to the message bus, please check the bus URL and that it is reachable"
            }
        }
    }

    /// What the operator has to fix before restarting.
    #[must_use]
    pub const fn remedy(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "the environment variables",
            Self::Authentication(_) => "the SMTP credentials",
            Self::Connection(_) => "the SMTP server details",
            Self::Timeout(_) => "the SMTP server details (or) network",
            Self::Bus(_) => "the message bus details",
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Startup(#[from] StartupError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("Worker task failed: {0}")]
    Panicked(String),
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("No email workers registered")]
    NoWorkers,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use courier_smtp::client::ClientError;

    use super::*;

    #[test]
    fn session_errors_map_to_startup_categories() {
        let timeout = StartupError::from(SessionError::Timeout {
            address: "smtp:25".to_string(),
            timeout: Duration::from_secs(30),
        });
        assert!(matches!(timeout, StartupError::Timeout(_)));

        let auth = StartupError::from(SessionError::Authentication(ClientError::SmtpError {
            code: 535,
            message: "bad credentials".to_string(),
        }));
        assert!(matches!(auth, StartupError::Authentication(_)));
        assert_eq!(auth.remedy(), "the SMTP credentials");

        let connect = StartupError::from(SessionError::Connection {
            address: "smtp:25".to_string(),
            source: ClientError::ConnectionClosed,
        });
        assert!(matches!(connect, StartupError::Connection(_)));
    }
}
