//! Low-level SMTP client.
//!
//! Supports plain TCP with an optional STARTTLS upgrade, `AUTH PLAIN` and
//! `AUTH LOGIN`, and an optional protocol transcript logged through the
//! `outgoing!`/`incoming!` spans.

mod error;
mod response;
mod smtp_client;

pub use error::{ClientError, Result};
pub use response::Response;
pub use smtp_client::{Extensions, SmtpClient};
