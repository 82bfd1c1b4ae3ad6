//! What to do with a message after a failed send.
//!
//! Retries are re-publications of the original event on the bus; nothing is
//! buffered in memory. [`RetryLedger`] only counts attempts so a persistently
//! failing message eventually stops circulating.

use std::time::Duration;

use ahash::AHashMap;
use courier_smtp::SendFailure;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::bus::BusEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-publish with no delay.
    RetryNow,
    /// Re-publish after this many seconds.
    RetryAfterDelay(u64),
    /// The message can never be delivered as it is.
    DropPermanent,
    /// Unclassified failure.
    DropUnknown,
}

impl RetryDecision {
    /// How long to wait before re-publishing, or `None` to drop.
    #[must_use]
    pub const fn delay(self) -> Option<Duration> {
        match self {
            Self::RetryNow => Some(Duration::ZERO),
            Self::RetryAfterDelay(secs) => Some(Duration::from_secs(secs)),
            Self::DropPermanent | Self::DropUnknown => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Re-publications allowed per message before it is dead-lettered.
    /// `0` never gives up.
    ///
    /// Default: 25
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,

    /// Re-publication delays after a disconnect are drawn uniformly from
    /// `step, 2 * step, ..., steps * step` seconds.
    ///
    /// Default: 5 seconds
    #[serde(default = "defaults::delay_step_secs")]
    pub delay_step_secs: u64,

    /// Default: 5
    #[serde(default = "defaults::delay_steps")]
    pub delay_steps: u64,

    /// Where messages go once their retries are exhausted. `None` just drops
    /// them.
    ///
    /// Default: `courier.dead_letter`
    #[serde(default = "defaults::dead_letter_channel")]
    pub dead_letter_channel: Option<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::max_attempts(),
            delay_step_secs: defaults::delay_step_secs(),
            delay_steps: defaults::delay_steps(),
            dead_letter_channel: defaults::dead_letter_channel(),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn decide(&self, failure: &SendFailure) -> RetryDecision {
        self.decide_with(failure, &mut rand::rng())
    }

    pub fn decide_with<R: Rng>(&self, failure: &SendFailure, rng: &mut R) -> RetryDecision {
        match failure {
            SendFailure::AuthRequired { .. } => RetryDecision::RetryNow,
            SendFailure::Disconnected(_) => RetryDecision::RetryAfterDelay(self.jitter(rng)),
            SendFailure::SenderRefusedOther { .. } | SendFailure::PermanentRejection(_) => {
                RetryDecision::DropPermanent
            }
            SendFailure::Unknown(_) => RetryDecision::DropUnknown,
        }
    }

    fn jitter<R: Rng>(&self, rng: &mut R) -> u64 {
        rng.random_range(1..=self.delay_steps.max(1)) * self.delay_step_secs
    }

    /// Whether a message that has already been re-published `attempts` times
    /// may go round again.
    #[must_use]
    pub const fn allows_retry(&self, attempts: u32) -> bool {
        self.max_attempts == 0 || attempts < self.max_attempts
    }
}

mod defaults {
    pub const fn max_attempts() -> u32 {
        25
    }

    pub const fn delay_step_secs() -> u64 {
        5
    }

    pub const fn delay_steps() -> u64 {
        5
    }

    #[allow(clippy::unnecessary_wraps)]
    pub fn dead_letter_channel() -> Option<String> {
        Some("courier.dead_letter".to_string())
    }
}

/// Re-publication counts per `(channel, payload)`.
///
/// Lives only as long as the worker; a restart starts every count from zero.
#[derive(Debug, Default)]
pub struct RetryLedger {
    attempts: AHashMap<BusEvent, u32>,
}

impl RetryLedger {
    #[must_use]
    pub fn attempts(&self, event: &BusEvent) -> u32 {
        self.attempts.get(event).copied().unwrap_or_default()
    }

    /// Count one more re-publication and return the new total.
    pub fn record(&mut self, event: &BusEvent) -> u32 {
        let count = self.attempts.entry(event.clone()).or_default();
        *count += 1;
        *count
    }

    /// Forget `event`, once it is delivered or dropped.
    pub fn clear(&mut self, event: &BusEvent) {
        self.attempts.remove(event);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }
}
