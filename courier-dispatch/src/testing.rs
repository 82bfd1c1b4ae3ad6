//! Scriptable stand-ins for the SMTP side, for driving workers in tests.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use async_trait::async_trait;
use courier_common::{EmailMessage, SmtpConfig};
use courier_smtp::{SendFailure, SessionError, SessionOptions};
use tokio::{sync::Mutex, time::Instant};

use crate::{
    error::StartupError,
    mailer::{Connector, Mailer},
};

/// One call made on a [`ScriptedMailer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailerCall {
    Send(EmailMessage),
    Probe,
    Reconnect,
    Reauthenticate,
    Close,
}

#[derive(Default)]
struct State {
    calls: Vec<(MailerCall, Instant)>,
    sends: VecDeque<Result<(), SendFailure>>,
    probes: VecDeque<Result<(), SendFailure>>,
    send_latency: Duration,
}

/// A mailer that records every call and answers from a script.
///
/// Unscripted sends and probes succeed. Clones share the same script and
/// record.
#[derive(Clone, Default)]
pub struct ScriptedMailer {
    state: Arc<Mutex<State>>,
}

impl ScriptedMailer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer the next unscripted send with `result`.
    pub async fn script_send(&self, result: Result<(), SendFailure>) {
        self.state.lock().await.sends.push_back(result);
    }

    /// Make every send take `latency` before it answers.
    pub async fn slow_sends(&self, latency: Duration) {
        self.state.lock().await.send_latency = latency;
    }

    pub async fn script_probe(&self, result: Result<(), SendFailure>) {
        self.state.lock().await.probes.push_back(result);
    }

    pub async fn calls(&self) -> Vec<MailerCall> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .map(|(call, _)| call.clone())
            .collect()
    }

    /// Calls with the instant each one was made.
    pub async fn timed_calls(&self) -> Vec<(MailerCall, Instant)> {
        self.state.lock().await.calls.clone()
    }

    pub async fn count(&self, matches: impl Fn(&MailerCall) -> bool) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|(call, _)| matches(call))
            .count()
    }

    /// Messages handed to `send`, whatever the outcome.
    pub async fn sent(&self) -> Vec<EmailMessage> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter_map(|(call, _)| match call {
                MailerCall::Send(message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    async fn record(&self, call: MailerCall) {
        self.state.lock().await.calls.push((call, Instant::now()));
    }
}

#[async_trait]
impl Mailer for ScriptedMailer {
    async fn send(&mut self, message: &EmailMessage) -> Result<(), SendFailure> {
        self.record(MailerCall::Send(message.clone())).await;
        let latency = self.state.lock().await.send_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.state.lock().await.sends.pop_front().unwrap_or(Ok(()))
    }

    async fn probe(&mut self) -> Result<(), SendFailure> {
        self.record(MailerCall::Probe).await;
        self.state.lock().await.probes.pop_front().unwrap_or(Ok(()))
    }

    async fn reconnect(&mut self) {
        self.record(MailerCall::Reconnect).await;
    }

    async fn reauthenticate(&mut self) -> Result<(), SessionError> {
        self.record(MailerCall::Reauthenticate).await;
        Ok(())
    }

    async fn close(&mut self) {
        self.record(MailerCall::Close).await;
    }
}

/// Hands out clones of one [`ScriptedMailer`], or fails with a scripted
/// startup error.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    mailer: ScriptedMailer,
    failure: Arc<Mutex<Option<StartupError>>>,
}

impl ScriptedConnector {
    #[must_use]
    pub fn new(mailer: ScriptedMailer) -> Self {
        Self {
            mailer,
            failure: Arc::default(),
        }
    }

    /// Make the next `open` fail with `error`.
    pub async fn fail_with(&self, error: StartupError) {
        *self.failure.lock().await = Some(error);
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    type Mailer = ScriptedMailer;

    async fn open(
        &self,
        _config: SmtpConfig,
        _options: SessionOptions,
    ) -> Result<ScriptedMailer, StartupError> {
        match self.failure.lock().await.take() {
            Some(error) => Err(error),
            None => Ok(self.mailer.clone()),
        }
    }
}
