pub mod notifications;
pub mod settings;
pub mod shutdown;
