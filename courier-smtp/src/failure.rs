//! Classification of failed sends.
//!
//! | Condition | Failure |
//! |---|---|
//! | `MAIL FROM` refused with a 5xx code | [`SendFailure::AuthRequired`] |
//! | `MAIL FROM` refused with any other code | [`SendFailure::SenderRefusedOther`] |
//! | every recipient refused, or the content rejected | [`SendFailure::PermanentRejection`] |
//! | the peer closed the connection | [`SendFailure::Disconnected`] |
//! | anything else | [`SendFailure::Unknown`] |

use thiserror::Error;

use crate::client::ClientError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendFailure {
    /// The server refused the sender with a permanent code. Usually the
    /// session lost its authentication.
    #[error("Sender refused ({code}): {message}")]
    AuthRequired { code: u16, message: String },

    #[error("Sender refused ({code}): {message}")]
    SenderRefusedOther { code: u16, message: String },

    /// The message itself is unacceptable and will never be delivered.
    #[error("Recipients refused or data rejected: {0}")]
    PermanentRejection(String),

    #[error("Server disconnected: {0}")]
    Disconnected(String),

    #[error("{0}")]
    Unknown(String),
}

impl SendFailure {
    /// Classify a failed `MAIL FROM`.
    #[must_use]
    pub fn sender_refused(error: ClientError) -> Self {
        match error {
            ClientError::SmtpError { code, message } if (500..600).contains(&code) => {
                Self::AuthRequired { code, message }
            }
            ClientError::SmtpError { code, message } => Self::SenderRefusedOther { code, message },
            other => other.into(),
        }
    }

    /// Classify a failed `DATA` command or message content.
    #[must_use]
    pub fn data_rejected(error: ClientError) -> Self {
        match error {
            ClientError::SmtpError { code, message } => {
                Self::PermanentRejection(format!("{code} {message}"))
            }
            other => other.into(),
        }
    }

    #[must_use]
    pub const fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected(_))
    }
}

impl From<ClientError> for SendFailure {
    fn from(error: ClientError) -> Self {
        if error.is_disconnect() {
            Self::Disconnected(error.to_string())
        } else {
            Self::Unknown(error.to_string())
        }
    }
}
