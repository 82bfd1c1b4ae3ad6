//! The seam between the dispatcher and an SMTP session.

use async_trait::async_trait;
use courier_common::{EmailMessage, SmtpConfig, internal};
use courier_smtp::{SendFailure, SessionError, SessionOptions, SmtpSession};

use crate::error::StartupError;

/// Operations the dispatcher and keep-alive monitor need from a session.
///
/// Callers share one mailer behind a lock, so implementations never see two
/// operations at once.
#[async_trait]
pub trait Mailer: Send {
    async fn send(&mut self, message: &EmailMessage) -> Result<(), SendFailure>;

    async fn probe(&mut self) -> Result<(), SendFailure>;

    /// Connect and log in again. Failures are logged, not returned.
    async fn reconnect(&mut self);

    async fn reauthenticate(&mut self) -> Result<(), SessionError>;

    /// Quit. A peer that already went away is not an error.
    async fn close(&mut self);
}

#[async_trait]
impl Mailer for SmtpSession {
    async fn send(&mut self, message: &EmailMessage) -> Result<(), SendFailure> {
        Self::send(self, message).await
    }

    async fn probe(&mut self) -> Result<(), SendFailure> {
        Self::probe(self).await
    }

    async fn reconnect(&mut self) {
        Self::reconnect(self).await;
    }

    async fn reauthenticate(&mut self) -> Result<(), SessionError> {
        Self::reauthenticate(self).await.map(|_| ())
    }

    async fn close(&mut self) {
        if let Err(err) = Self::close(self).await {
            internal!(level = WARN, "Error while closing SMTP session: {err}");
        }
    }
}

/// Opens a connected, authenticated mailer at worker startup.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Mailer: Mailer + 'static;

    async fn open(
        &self,
        config: SmtpConfig,
        options: SessionOptions,
    ) -> Result<Self::Mailer, StartupError>;
}

/// Opens real [`SmtpSession`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmtpConnector;

#[async_trait]
impl Connector for SmtpConnector {
    type Mailer = SmtpSession;

    async fn open(
        &self,
        config: SmtpConfig,
        options: SessionOptions,
    ) -> Result<SmtpSession, StartupError> {
        let mut session = SmtpSession::new(config, options);

        let opened = async {
            session.connect().await?;
            session.authenticate().await
        }
        .await;

        match opened {
            Ok(response) => {
                internal!(level = INFO, "login: {response}");
                Ok(session)
            }
            Err(err) => {
                Mailer::close(&mut session).await;
                Err(err.into())
            }
        }
    }
}
