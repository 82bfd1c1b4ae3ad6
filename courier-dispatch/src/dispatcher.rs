//! Per-message handling.
//!
//! ```text
//! event ──> lookup ──> convert ──> send ──> delivered
//!             │           │          │
//!          unroutable  malformed   failure ──> RetryPolicy
//!                                     ├─ AuthRequired       re-authenticate, re-publish now
//!                                     ├─ Disconnected       reconnect, re-publish after 5..25s
//!                                     ├─ SenderRefusedOther drop (warn)
//!                                     ├─ PermanentRejection drop (error)
//!                                     └─ Unknown            drop (error)
//! ```

use std::{sync::Arc, time::Duration};

use courier_common::internal;
use courier_smtp::SendFailure;
use tokio::{sync::Mutex, task::JoinSet};
use tokio_util::sync::CancellationToken;

use crate::{
    bus::{Bus, BusEvent, Subscription},
    error::BusError,
    mailer::Mailer,
    policy::{RetryDecision, RetryLedger, RetryPolicy},
    registry::ChannelRegistry,
};

/// Why a message was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    SenderRefused,
    PermanentRejection,
    Unknown,
    /// Re-publication limit reached.
    RetriesExhausted,
    /// The bus refused the re-publication.
    RepublishFailed,
}

/// What happened to one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Delivered,
    /// No converter for the channel.
    Unroutable,
    /// The converter rejected the payload.
    Malformed,
    /// Sent back onto the bus, now or after `delay`.
    Republished { delay: Duration },
    Dropped(DropReason),
}

pub struct Dispatcher<M> {
    worker: String,
    registry: Arc<ChannelRegistry>,
    mailer: Arc<Mutex<M>>,
    bus: Arc<dyn Bus>,
    policy: RetryPolicy,
    ledger: RetryLedger,
    republishing: JoinSet<Option<BusEvent>>,
    flush: CancellationToken,
}

impl<M: Mailer> Dispatcher<M> {
    pub fn new(
        worker: impl Into<String>,
        registry: Arc<ChannelRegistry>,
        mailer: Arc<Mutex<M>>,
        bus: Arc<dyn Bus>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            worker: worker.into(),
            registry,
            mailer,
            bus,
            policy,
            ledger: RetryLedger::default(),
            republishing: JoinSet::new(),
            flush: CancellationToken::new(),
        }
    }

    /// Handle events until `token` is cancelled or the bus closes the
    /// subscription.
    ///
    /// Cancellation is only observed while waiting for the next event; an
    /// event already being handled is finished first.
    pub async fn run(
        &mut self,
        subscription: &mut dyn Subscription,
        token: &CancellationToken,
    ) -> Result<(), BusError> {
        loop {
            let event = tokio::select! {
                biased;
                () = token.cancelled() => {
                    internal!(level = DEBUG, worker = %self.worker, "closing subscription");
                    return Ok(());
                }
                event = subscription.next_event() => event,
            };

            let Some(event) = event else {
                return Err(BusError::Closed);
            };

            let channel = event.channel.clone();
            let outcome = self.handle(event).await;
            internal!(worker = %self.worker, %channel, ?outcome, "Handled event");

            self.reap();
        }
    }

    /// Handle a single event.
    pub async fn handle(&mut self, event: BusEvent) -> Outcome {
        let Some(convert) = self.registry.lookup(&event.channel) else {
            internal!(
                level = WARN,
                worker = %self.worker,
                channel = %event.channel,
                "No eMail handler found for channel: {}",
                event.channel
            );
            return Outcome::Unroutable;
        };

        let message = match convert(&event.payload) {
            Ok(message) => message,
            Err(err) => {
                internal!(
                    level = ERROR,
                    worker = %self.worker,
                    channel = %event.channel,
                    "Malformed payload, this email will not be retried: {err}"
                );
                self.ledger.clear(&event);
                return Outcome::Malformed;
            }
        };

        let mut mailer = self.mailer.lock().await;

        let failure = match mailer.send(&message).await {
            Ok(()) => {
                self.ledger.clear(&event);
                return Outcome::Delivered;
            }
            Err(failure) => failure,
        };

        let decision = self.policy.decide(&failure);
        match &failure {
            SendFailure::AuthRequired { code, message: reply } => {
                internal!(
                    level = WARN,
                    worker = %self.worker,
                    code,
                    "Sender refused ({code}) {reply}, re-authenticating"
                );
                if let Err(err) = mailer.reauthenticate().await {
                    internal!(level = WARN, worker = %self.worker, "Re-authentication failed: {err}");
                }
            }
            SendFailure::Disconnected(_) => {
                internal!(level = WARN, worker = %self.worker, "SMTPServerDisconnected, reconnecting");
                mailer.reconnect().await;
            }
            SendFailure::SenderRefusedOther { code, message: reply } => {
                internal!(
                    level = WARN,
                    worker = %self.worker,
                    code,
                    "SMTP Server Refused with ({code}) {reply} by {}",
                    message.from.as_deref().unwrap_or("the configured sender")
                );
            }
            SendFailure::PermanentRejection(reason) => {
                internal!(
                    level = ERROR,
                    worker = %self.worker,
                    subject = %message.subject,
                    to = %message.recipients(),
                    "SMTP rejected due to invalid recipient(s) or data error, this email will not be retried. Subject: {}, To: {} ({reason})",
                    message.subject,
                    message.recipients()
                );
            }
            SendFailure::Unknown(error) => {
                internal!(
                    level = ERROR,
                    worker = %self.worker,
                    channel = %event.channel,
                    "Dropping email after unclassified failure: {error}"
                );
            }
        }
        drop(mailer);

        match decision {
            RetryDecision::RetryNow | RetryDecision::RetryAfterDelay(_) => {
                let delay = decision.delay().unwrap_or_default();
                self.republish(event, delay).await
            }
            RetryDecision::DropPermanent => {
                self.ledger.clear(&event);
                Outcome::Dropped(match failure {
                    SendFailure::SenderRefusedOther { .. } => DropReason::SenderRefused,
                    _ => DropReason::PermanentRejection,
                })
            }
            RetryDecision::DropUnknown => {
                self.ledger.clear(&event);
                Outcome::Dropped(DropReason::Unknown)
            }
        }
    }

    async fn republish(&mut self, event: BusEvent, delay: Duration) -> Outcome {
        let attempts = self.ledger.attempts(&event);
        if !self.policy.allows_retry(attempts) {
            self.ledger.clear(&event);
            return self.dead_letter(event, attempts).await;
        }
        self.ledger.record(&event);

        if delay.is_zero() {
            return match self.bus.publish(&event.channel, &event.payload).await {
                Ok(()) => Outcome::Republished { delay },
                Err(err) => {
                    internal!(
                        level = ERROR,
                        worker = %self.worker,
                        channel = %event.channel,
                        "Unable to re-publish email: {err}"
                    );
                    self.ledger.clear(&event);
                    Outcome::Dropped(DropReason::RepublishFailed)
                }
            };
        }

        internal!(
            level = DEBUG,
            worker = %self.worker,
            channel = %event.channel,
            delay_secs = delay.as_secs(),
            "Re-publishing in {}s",
            delay.as_secs()
        );

        let bus = Arc::clone(&self.bus);
        let flush = self.flush.clone();
        let worker = self.worker.clone();
        self.republishing.spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = flush.cancelled() => {}
            }

            match bus.publish(&event.channel, &event.payload).await {
                Ok(()) => None,
                Err(err) => {
                    internal!(
                        level = ERROR,
                        worker = %worker,
                        channel = %event.channel,
                        "Unable to re-publish email: {err}"
                    );
                    Some(event)
                }
            }
        });

        Outcome::Republished { delay }
    }

    async fn dead_letter(&self, event: BusEvent, attempts: u32) -> Outcome {
        internal!(
            level = ERROR,
            worker = %self.worker,
            channel = %event.channel,
            attempts,
            "Giving up on email after {attempts} re-publications"
        );

        if let Some(dead_letter) = &self.policy.dead_letter_channel
            && let Err(err) = self.bus.publish(dead_letter, &event.payload).await
        {
            internal!(
                level = ERROR,
                worker = %self.worker,
                channel = %dead_letter,
                "Unable to dead-letter email: {err}"
            );
        }

        Outcome::Dropped(DropReason::RetriesExhausted)
    }

    /// Publish every pending delayed re-publication now and wait for them.
    pub async fn flush(&mut self) {
        self.flush.cancel();
        while let Some(result) = self.republishing.join_next().await {
            if let Ok(Some(event)) = result {
                self.ledger.clear(&event);
            }
        }
    }

    /// Forget the attempt count of every delayed re-publication that could
    /// not be published.
    fn reap(&mut self) {
        while let Some(result) = self.republishing.try_join_next() {
            if let Ok(Some(event)) = result {
                self.ledger.clear(&event);
            }
        }
    }

    /// Delayed re-publications not yet sent.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.republishing.len()
    }

    /// Events with a re-publication count.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.ledger.len()
    }
}
