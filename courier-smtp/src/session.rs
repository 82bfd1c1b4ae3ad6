//! A single persistent SMTP session.

use std::time::Duration;

use courier_common::{EmailMessage, SmtpConfig, internal};

use crate::{
    client::{ClientError, Response, SmtpClient},
    error::SessionError,
    failure::SendFailure,
    message::{envelope_address, is_international, render},
};

/// Connection and authentication status of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionState {
    pub connected: bool,
    pub authenticated: bool,
}

/// Tunables that do not come from the `SMTP_` environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Bound on TCP connect, greeting and EHLO.
    pub connect_timeout: Duration,
    /// Name announced in EHLO/HELO.
    pub helo_name: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            helo_name: "localhost".to_string(),
        }
    }
}

/// Owns at most one live SMTP connection.
///
/// Every operation takes `&mut self`, so callers sharing a session between
/// tasks must hold a lock for the whole exchange.
pub struct SmtpSession {
    config: SmtpConfig,
    options: SessionOptions,
    client: Option<SmtpClient>,
    state: SessionState,
}

impl SmtpSession {
    #[must_use]
    pub fn new(config: SmtpConfig, options: SessionOptions) -> Self {
        Self {
            config,
            options,
            client: None,
            state: SessionState::default(),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &SmtpConfig {
        &self.config
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    fn disconnect(&mut self) {
        self.client = None;
        self.state = SessionState::default();
    }

    /// Open a new connection, replacing any existing one.
    ///
    /// Connecting, the greeting and EHLO together are bounded by the connect
    /// timeout.
    pub async fn connect(&mut self) -> Result<Response, SessionError> {
        self.disconnect();

        let address = self.config.address();
        let timeout = self.options.connect_timeout;
        let attempt = open(&address, &self.config, &self.options.helo_name);

        match tokio::time::timeout(timeout, attempt).await {
            Err(_) => Err(SessionError::Timeout { address, timeout }),
            Ok(Err(source)) => Err(SessionError::Connection { address, source }),
            Ok(Ok((client, greeting))) => {
                internal!(level = DEBUG, %address, "connect: {greeting}");
                self.client = Some(client);
                self.state.connected = true;
                Ok(greeting)
            }
        }
    }

    /// Upgrade with STARTTLS when configured, then log in.
    pub async fn authenticate(&mut self) -> Result<Response, SessionError> {
        let config = &self.config;
        let helo_name = &self.options.helo_name;
        let client = self.client.as_mut().ok_or(SessionError::NotConnected)?;
        self.state.authenticated = false;

        match login(client, config, helo_name).await {
            Ok(response) => {
                self.state.authenticated = true;
                Ok(response)
            }
            Err(source) if source.is_disconnect() => {
                let address = config.address();
                self.disconnect();
                Err(SessionError::Connection { address, source })
            }
            Err(source) => Err(SessionError::Authentication(source)),
        }
    }

    /// Deliver `message`, requesting SMTPUTF8 when the server offers it.
    ///
    /// A failed transaction is reset so the connection stays usable; a
    /// disconnect drops it.
    pub async fn send(&mut self, message: &EmailMessage) -> Result<(), SendFailure> {
        let result = self.transaction(message).await;

        if let Err(failure) = &result {
            if failure.is_disconnect() {
                self.disconnect();
            } else if let Some(client) = self.client.as_mut()
                && let Err(err) = client.rset().await
                && err.is_disconnect()
            {
                self.disconnect();
            }
        }

        result
    }

    async fn transaction(&mut self, message: &EmailMessage) -> Result<(), SendFailure> {
        let from = message
            .from
            .as_deref()
            .unwrap_or(self.config.from_email.as_str());
        let rendered = render(message, from)
            .map_err(|err| SendFailure::PermanentRejection(err.to_string()))?;
        let client = self
            .client
            .as_mut()
            .ok_or_else(|| SendFailure::Disconnected("Not connected".to_string()))?;

        let mut params = Vec::with_capacity(2);
        if client.extensions().supports("SMTPUTF8") {
            params.push("SMTPUTF8");
            if client.extensions().supports("8BITMIME") {
                params.push("BODY=8BITMIME");
            }
        } else if is_international(message, from) {
            return Err(SendFailure::Unknown(
                "Server does not support SMTPUTF8".to_string(),
            ));
        }

        client
            .mail_from(&envelope_address(from), &params)
            .await
            .map_err(SendFailure::sender_refused)?;

        let mut refused = Vec::new();
        for recipient in &message.to {
            match client.rcpt_to(&envelope_address(recipient)).await {
                Ok(_) => {}
                Err(ClientError::SmtpError { code, message }) => {
                    refused.push(format!("{recipient} ({code} {message})"));
                }
                Err(err) => return Err(err.into()),
            }
        }

        if refused.len() == message.to.len() {
            return Err(SendFailure::PermanentRejection(if refused.is_empty() {
                "No recipients".to_string()
            } else {
                format!("All recipients refused: {}", refused.join(", "))
            }));
        }

        if !refused.is_empty() {
            internal!(
                level = WARN,
                subject = %message.subject,
                refused = %refused.join(", "),
                "Some recipients were refused, delivering to the rest"
            );
        }

        client.data().await.map_err(SendFailure::data_rejected)?;
        client
            .send_data(&rendered)
            .await
            .map_err(SendFailure::data_rejected)?;

        Ok(())
    }

    /// NOOP liveness check.
    pub async fn probe(&mut self) -> Result<(), SendFailure> {
        let client = self
            .client
            .as_mut()
            .ok_or_else(|| SendFailure::Disconnected("Not connected".to_string()))?;

        match client.noop().await {
            Ok(_) => Ok(()),
            Err(err) => {
                let failure = SendFailure::from(err);
                if failure.is_disconnect() {
                    self.disconnect();
                }
                Err(failure)
            }
        }
    }

    /// Connect and authenticate again.
    ///
    /// Never fails: problems are logged and the session is left in whatever
    /// state it reached, for the next probe to retry.
    pub async fn reconnect(&mut self) -> SessionState {
        match self.connect().await {
            Ok(_) => match self.authenticate().await {
                Ok(response) => internal!(level = DEBUG, "authentication: {response}"),
                Err(err) => internal!(level = WARN, "Reconnect failed to authenticate: {err}"),
            },
            Err(err) => internal!(level = WARN, "Reconnect failed: {err}"),
        }

        self.state
    }

    /// Log in again on the current connection.
    pub async fn reauthenticate(&mut self) -> Result<Response, SessionError> {
        let response = self.authenticate().await?;
        internal!(level = DEBUG, "Re-trying authentication: {response}");
        Ok(response)
    }

    /// Send QUIT and drop the connection. A peer that already left is fine.
    pub async fn close(&mut self) -> Result<(), ClientError> {
        let Some(mut client) = self.client.take() else {
            return Ok(());
        };
        self.state = SessionState::default();

        match client.quit().await {
            Ok(_) => Ok(()),
            Err(err) if err.is_disconnect() => Ok(()),
            Err(err) => Err(err),
        }
    }
}

async fn open(
    address: &str,
    config: &SmtpConfig,
    helo_name: &str,
) -> Result<(SmtpClient, Response), ClientError> {
    let mut client = SmtpClient::connect(address, config.host.clone())
        .await?
        .with_transcript(config.debug);
    let greeting = client.read_greeting().await?;
    client.ehlo(helo_name).await?;
    Ok((client, greeting))
}

async fn login(
    client: &mut SmtpClient,
    config: &SmtpConfig,
    helo_name: &str,
) -> Result<Response, ClientError> {
    if config.starttls && !client.is_tls() {
        client.starttls().await?;
        client.ehlo(helo_name).await?;
    }

    client.login(&config.username, &config.password).await
}
