//! Shared helpers for the dispatch integration tests.

#![allow(dead_code)]

pub mod logs;

use std::sync::Arc;

use courier_common::{EmailMessage, SmtpConfig};
use courier_dispatch::{ConvertError, MemoryBus};

pub use logs::LogCapture;

pub const WELCOME: &str = "email.notify.welcome";

/// Converter producing a message whose subject is the payload and whose
/// recipient is fixed.
pub fn echo(payload: &[u8]) -> Result<EmailMessage, ConvertError> {
    let subject = std::str::from_utf8(payload).map_err(ConvertError::new)?;
    Ok(EmailMessage::new(subject, "body").recipient("user@example.com"))
}

pub fn config() -> SmtpConfig {
    SmtpConfig::new(
        "smtp.example.com",
        "noreply@example.com",
        "courier",
        "secret",
    )
}

/// Yield until `bus` has `count` live subscribers.
pub async fn subscribed(bus: &MemoryBus, count: usize) {
    while bus.subscriber_count().await != count {
        tokio::task::yield_now().await;
    }
}

pub fn shared<T>(value: T) -> Arc<tokio::sync::Mutex<T>> {
    Arc::new(tokio::sync::Mutex::new(value))
}
