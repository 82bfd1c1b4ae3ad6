pub mod config;
pub mod logging;
pub mod message;

pub use tracing;

pub use config::{ConfigError, ConfigErrors, SmtpConfig};
pub use message::EmailMessage;
