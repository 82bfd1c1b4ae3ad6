use core::fmt;
use std::sync::Arc;

use ahash::AHashMap;
use courier_common::EmailMessage;

use crate::error::ConvertError;

/// Turns a raw bus payload into a ready-to-send email.
pub type Converter = Arc<dyn Fn(&[u8]) -> Result<EmailMessage, ConvertError> + Send + Sync>;

/// Channel name to converter.
///
/// Filled in before a worker starts; the worker takes ownership when it runs,
/// so the mapping cannot change underneath the dispatch loop.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    converters: AHashMap<String, Converter>,
}

impl ChannelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `convert` to `channel`, replacing any earlier converter.
    pub fn register<F>(&mut self, channel: impl Into<String>, convert: F)
    where
        F: Fn(&[u8]) -> Result<EmailMessage, ConvertError> + Send + Sync + 'static,
    {
        self.converters.insert(channel.into(), Arc::new(convert));
    }

    #[must_use]
    pub fn lookup(&self, channel: &str) -> Option<&Converter> {
        self.converters.get(channel)
    }

    /// Registered channel names, sorted.
    #[must_use]
    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<_> = self.converters.keys().cloned().collect();
        channels.sort_unstable();
        channels
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.converters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.converters.is_empty()
    }
}

impl fmt::Debug for ChannelRegistry {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_set().entries(self.channels()).finish()
    }
}
