//! SMTP side of the courier dispatcher: a small async client and the
//! persistent [`SmtpSession`] built on it.

pub mod client;
pub mod error;
pub mod failure;
pub mod message;
pub mod session;
pub mod testing;

pub use error::SessionError;
pub use failure::SendFailure;
pub use session::{SessionOptions, SessionState, SmtpSession};
