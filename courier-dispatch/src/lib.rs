//! Bus-driven email dispatch.
//!
//! A [`Supervisor`] runs [`Worker`]s. Each worker opens one SMTP session,
//! subscribes to every channel it has a converter for, and hands each event to
//! its [`Dispatcher`](dispatcher::Dispatcher), which sends it and applies the
//! [`RetryPolicy`] when a send fails.

pub mod bus;
pub mod dispatcher;
pub mod error;
pub mod keepalive;
pub mod mailer;
pub mod policy;
pub mod registry;
pub mod supervisor;
pub mod testing;
pub mod worker;

pub use bus::{Bus, BusEvent, MemoryBus, RedisBus, Subscription};
pub use error::{BusError, ConvertError, StartupError, SupervisorError, WorkerError};
pub use mailer::{Connector, Mailer, SmtpConnector};
pub use policy::{RetryDecision, RetryPolicy};
pub use registry::ChannelRegistry;
pub use supervisor::{Supervisor, WorkerReport};
pub use worker::{Runtime, Worker, WorkerSettings};
