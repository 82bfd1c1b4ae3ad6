//! Async SMTP client with STARTTLS and AUTH support.

use std::sync::Arc;

use ahash::AHashMap;
use base64::{Engine, engine::general_purpose::STANDARD};
use courier_common::{incoming, internal, outgoing};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::{
    TlsConnector,
    client::TlsStream,
    rustls::{ClientConfig, RootCertStore, pki_types::ServerName},
};

use super::{
    error::{ClientError, Result},
    response::Response,
};

const BUFFER_SIZE: usize = 8192;

/// Replies larger than this are treated as a protocol violation.
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

enum ClientConnection {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl ClientConnection {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(stream) => stream.write_all(data).await?,
            Self::Tls(stream) => stream.write_all(data).await?,
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = match self {
            Self::Plain(stream) => stream.read(buf).await?,
            Self::Tls(stream) => stream.read(buf).await?,
        };
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(n)
    }

    async fn upgrade_to_tls(self, domain: &str) -> Result<Self> {
        let Self::Plain(stream) = self else {
            return Err(ClientError::TlsError(
                "Connection is already TLS".to_string(),
            ));
        };

        let mut root_store = RootCertStore::empty();
        let certs = rustls_native_certs::load_native_certs();
        for cert in certs.certs {
            root_store
                .add(cert)
                .map_err(|e| ClientError::TlsError(format!("Failed to add certificate: {e}")))?;
        }
        if !certs.errors.is_empty() {
            internal!(level = WARN, errors = ?certs.errors, "Some certificates could not be loaded");
        }

        let config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let server_name = ServerName::try_from(domain.to_string())
            .map_err(|e| ClientError::TlsError(format!("Invalid domain: {e}")))?;

        let tls_stream = TlsConnector::from(Arc::new(config))
            .connect(server_name, stream)
            .await
            .map_err(|e| ClientError::TlsError(e.to_string()))?;

        Ok(Self::Tls(Box::new(tls_stream)))
    }

    const fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

/// Service extensions advertised in an EHLO reply, keyed by upper-cased name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extensions(AHashMap<String, String>);

impl Extensions {
    fn from_ehlo(response: &Response) -> Self {
        Self(
            response
                .lines
                .iter()
                .skip(1)
                .map(|line| {
                    let (name, params) = line.split_once(' ').unwrap_or((line, ""));
                    (name.to_ascii_uppercase(), params.to_string())
                })
                .collect(),
        )
    }

    #[must_use]
    pub fn supports(&self, extension: &str) -> bool {
        self.0.contains_key(&extension.to_ascii_uppercase())
    }

    #[must_use]
    pub fn params(&self, extension: &str) -> Option<&str> {
        self.0
            .get(&extension.to_ascii_uppercase())
            .map(String::as_str)
    }

    /// Whether the server offers the given SASL mechanism.
    #[must_use]
    pub fn supports_auth(&self, mechanism: &str) -> bool {
        self.params("AUTH").is_some_and(|mechanisms| {
            mechanisms
                .split_ascii_whitespace()
                .any(|m| m.eq_ignore_ascii_case(mechanism))
        })
    }
}

/// One SMTP connection, command by command.
pub struct SmtpClient {
    connection: Option<ClientConnection>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    server_domain: String,
    extensions: Extensions,
    transcript: bool,
}

impl SmtpClient {
    /// Open a plain TCP connection to `addr`.
    ///
    /// `server_domain` is the name the TLS certificate is checked against.
    pub async fn connect(addr: &str, server_domain: impl Into<String>) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;

        Ok(Self {
            connection: Some(ClientConnection::Plain(stream)),
            buffer: vec![0u8; BUFFER_SIZE],
            buffer_pos: 0,
            server_domain: server_domain.into(),
            extensions: Extensions::default(),
            transcript: false,
        })
    }

    /// Log every command and reply at debug level.
    #[must_use]
    pub const fn with_transcript(mut self, transcript: bool) -> Self {
        self.transcript = transcript;
        self
    }

    #[must_use]
    pub const fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.connection.as_ref().is_some_and(ClientConnection::is_tls)
    }

    /// Read the server's `220` greeting.
    pub async fn read_greeting(&mut self) -> Result<Response> {
        let response = self.read_response().await?;
        if response.code == 220 {
            Ok(response)
        } else {
            Err(ClientError::SmtpError {
                code: response.code,
                message: response.message(),
            })
        }
    }

    async fn write_line(&mut self, line: &str, logged: &str) -> Result<()> {
        if self.transcript {
            outgoing!(level = DEBUG, "{logged}");
        }

        self.connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?
            .send(format!("{line}\r\n").as_bytes())
            .await
    }

    /// Send a raw command and read the reply, whatever its code.
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        self.write_line(command, command).await?;
        self.read_response().await
    }

    async fn secret_command(&mut self, command: &str, logged: &str) -> Result<Response> {
        self.write_line(command, logged).await?;
        self.read_response().await
    }

    /// EHLO, falling back to HELO for servers that reject it.
    pub async fn ehlo(&mut self, domain: &str) -> Result<Response> {
        let response = self.command(&format!("EHLO {domain}")).await?;

        if response.is_success() {
            self.extensions = Extensions::from_ehlo(&response);
            return Ok(response);
        }

        if response.code >= 500 {
            self.extensions = Extensions::default();
            return self.command(&format!("HELO {domain}")).await?.checked();
        }

        response.checked()
    }

    /// Upgrade to TLS. Extensions are forgotten and EHLO must be sent again.
    pub async fn starttls(&mut self) -> Result<Response> {
        if !self.extensions.supports("STARTTLS") {
            return Err(ClientError::NotSupported("STARTTLS".to_string()));
        }

        let response = self.command("STARTTLS").await?.checked()?;

        let connection = self
            .connection
            .take()
            .ok_or(ClientError::ConnectionClosed)?;
        self.buffer_pos = 0;
        self.connection = Some(connection.upgrade_to_tls(&self.server_domain).await?);
        self.extensions = Extensions::default();

        Ok(response)
    }

    /// Log in, preferring `AUTH PLAIN` and falling back to `AUTH LOGIN`.
    pub async fn login(&mut self, username: &str, password: &str) -> Result<Response> {
        if self.extensions.supports_auth("PLAIN") {
            self.auth_plain(username, password).await
        } else if self.extensions.supports_auth("LOGIN") {
            self.auth_login(username, password).await
        } else {
            Err(ClientError::NotSupported("AUTH PLAIN or AUTH LOGIN".to_string()))
        }
    }

    async fn auth_plain(&mut self, username: &str, password: &str) -> Result<Response> {
        let token = STANDARD.encode(format!("\0{username}\0{password}"));
        self.secret_command(&format!("AUTH PLAIN {token}"), "AUTH PLAIN ********")
            .await?
            .checked()
    }

    async fn auth_login(&mut self, username: &str, password: &str) -> Result<Response> {
        let response = self.command("AUTH LOGIN").await?.checked()?;
        if !response.is_intermediate() {
            return Ok(response);
        }

        let response = self
            .secret_command(&STANDARD.encode(username), "********")
            .await?
            .checked()?;
        if !response.is_intermediate() {
            return Ok(response);
        }

        self.secret_command(&STANDARD.encode(password), "********")
            .await?
            .checked()
    }

    /// `MAIL FROM` with optional ESMTP parameters.
    pub async fn mail_from(&mut self, from: &str, params: &[&str]) -> Result<Response> {
        let command = if params.is_empty() {
            format!("MAIL FROM:<{from}>")
        } else {
            format!("MAIL FROM:<{from}> {}", params.join(" "))
        };
        self.command(&command).await?.checked()
    }

    pub async fn rcpt_to(&mut self, to: &str) -> Result<Response> {
        self.command(&format!("RCPT TO:<{to}>")).await?.checked()
    }

    pub async fn data(&mut self) -> Result<Response> {
        let response = self.command("DATA").await?.checked()?;
        if response.code == 354 {
            Ok(response)
        } else {
            Err(ClientError::SmtpError {
                code: response.code,
                message: response.message(),
            })
        }
    }

    /// Send the message content, dot-stuffed and terminated with `<CRLF>.<CRLF>`.
    pub async fn send_data(&mut self, data: &str) -> Result<Response> {
        let mut payload = String::with_capacity(data.len() + 8);
        for line in data.split_inclusive('\n') {
            if line.starts_with('.') {
                payload.push('.');
            }
            payload.push_str(line);
        }

        if !payload.ends_with("\r\n") {
            if payload.ends_with('\n') {
                payload.pop();
            }
            payload.push_str("\r\n");
        }
        payload.push_str(".\r\n");

        if self.transcript {
            outgoing!(level = DEBUG, bytes = payload.len(), "<message content>");
        }

        self.connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?
            .send(payload.as_bytes())
            .await?;

        self.read_response().await?.checked()
    }

    pub async fn noop(&mut self) -> Result<Response> {
        self.command("NOOP").await?.checked()
    }

    pub async fn rset(&mut self) -> Result<Response> {
        self.command("RSET").await?.checked()
    }

    pub async fn quit(&mut self) -> Result<Response> {
        let response = self.command("QUIT").await;
        self.connection = None;
        response
    }

    async fn read_response(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) = Response::parse(&self.buffer[..self.buffer_pos])? {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;

                if self.transcript {
                    incoming!(level = DEBUG, "{response}");
                }

                return Ok(response);
            }

            if self.buffer_pos >= self.buffer.len() {
                let new_size = self.buffer.len() * 2;
                if new_size > MAX_BUFFER_SIZE {
                    return Err(ClientError::ParseError(format!(
                        "Response too large (exceeds {MAX_BUFFER_SIZE} bytes)"
                    )));
                }
                self.buffer.resize(new_size, 0);
            }

            let connection = self
                .connection
                .as_mut()
                .ok_or(ClientError::ConnectionClosed)?;
            let n = connection.read(&mut self.buffer[self.buffer_pos..]).await?;
            self.buffer_pos += n;
        }
    }
}
