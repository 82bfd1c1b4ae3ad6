//! A scriptable in-process SMTP server for tests.
//!
//! ```rust,no_run
//! use courier_smtp::testing::MockSmtpServer;
//!
//! # async fn example() -> std::io::Result<()> {
//! let server = MockSmtpServer::builder()
//!     .with_scripted_response("MAIL", 530, "Authentication required")
//!     .with_scripted_drop("NOOP")
//!     .build()
//!     .await?;
//!
//! // First MAIL FROM is refused, the next is accepted.
//! // First NOOP closes the connection.
//! # Ok(())
//! # }
//! ```

use std::{
    collections::VecDeque,
    fmt::Write,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use ahash::AHashMap;
use courier_common::internal;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::{Mutex, RwLock},
    task::JoinHandle,
};

/// A command as the mock server saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    Ehlo(String),
    Helo(String),
    Auth(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    /// Message content received after `DATA`, without the terminating dot.
    MessageContent(String),
    Noop,
    Rset,
    Quit,
    StartTls,
    Other(String),
}

#[derive(Debug, Clone)]
struct SmtpResponse {
    code: u16,
    message: String,
}

impl SmtpResponse {
    fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        format!("{} {}\r\n", self.code, self.message).into_bytes()
    }
}

#[derive(Debug, Clone)]
enum Reply {
    Respond(SmtpResponse),
    Drop,
}

#[derive(Clone)]
struct MockServerConfig {
    greeting: SmtpResponse,
    capabilities: Vec<String>,
    defaults: AHashMap<&'static str, SmtpResponse>,
    connection_delay: Option<Duration>,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        let defaults = [
            ("HELO", SmtpResponse::new(250, "Hello")),
            ("AUTH", SmtpResponse::new(235, "Authentication successful")),
            ("MAIL", SmtpResponse::new(250, "OK")),
            ("RCPT", SmtpResponse::new(250, "OK")),
            (
                "DATA",
                SmtpResponse::new(354, "Start mail input; end with <CRLF>.<CRLF>"),
            ),
            ("CONTENT", SmtpResponse::new(250, "OK: Message accepted")),
            ("NOOP", SmtpResponse::new(250, "OK")),
            ("RSET", SmtpResponse::new(250, "OK")),
            ("QUIT", SmtpResponse::new(221, "Bye")),
            ("STARTTLS", SmtpResponse::new(502, "Command not implemented")),
        ]
        .into_iter()
        .collect();

        Self {
            greeting: SmtpResponse::new(220, "Mock SMTP Server"),
            capabilities: vec![
                "mock.example.com".to_string(),
                "AUTH PLAIN LOGIN".to_string(),
                "SMTPUTF8".to_string(),
                "8BITMIME".to_string(),
            ],
            defaults,
            connection_delay: None,
        }
    }
}

struct Shared {
    config: MockServerConfig,
    script: Mutex<AHashMap<String, VecDeque<Reply>>>,
    commands: RwLock<Vec<SmtpCommand>>,
    connections: AtomicUsize,
}

impl Shared {
    async fn scripted(&self, verb: &str) -> Option<Reply> {
        self.script
            .lock()
            .await
            .get_mut(verb)
            .and_then(VecDeque::pop_front)
    }

    async fn reply_for(&self, verb: &str) -> Reply {
        if let Some(reply) = self.scripted(verb).await {
            return reply;
        }

        Reply::Respond(
            self.config
                .defaults
                .get(verb)
                .cloned()
                .unwrap_or_else(|| SmtpResponse::new(500, "Unknown command")),
        )
    }
}

pub struct MockSmtpServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    accept_loop: JoinHandle<()>,
}

impl MockSmtpServer {
    #[must_use]
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder {
            config: MockServerConfig::default(),
            script: AHashMap::new(),
        }
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.addr.port()
    }

    pub async fn commands(&self) -> Vec<SmtpCommand> {
        self.shared.commands.read().await.clone()
    }

    /// Every message body accepted after `DATA`.
    pub async fn messages(&self) -> Vec<String> {
        self.shared
            .commands
            .read()
            .await
            .iter()
            .filter_map(|command| match command {
                SmtpCommand::MessageContent(content) => Some(content.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of recorded commands accepted by `matches`.
    pub async fn count(&self, matches: impl Fn(&SmtpCommand) -> bool) -> usize {
        self.shared
            .commands
            .read()
            .await
            .iter()
            .filter(|command| matches(command))
            .count()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Stop accepting new connections.
    pub fn shutdown(&self) {
        self.accept_loop.abort();
    }

    async fn handle_client(stream: TcpStream, shared: Arc<Shared>) -> std::io::Result<()> {
        if let Some(delay) = shared.config.connection_delay {
            tokio::time::sleep(delay).await;
        }

        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        writer.write_all(&shared.config.greeting.to_bytes()).await?;

        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(());
            }

            let command_line = line.trim_end().to_string();
            let (verb, argument) = command_line
                .split_once(' ')
                .map_or((command_line.as_str(), ""), |(verb, rest)| (verb, rest));
            let verb = verb.to_ascii_uppercase();

            let command = match verb.as_str() {
                "EHLO" => SmtpCommand::Ehlo(argument.to_string()),
                "HELO" => SmtpCommand::Helo(argument.to_string()),
                "AUTH" => SmtpCommand::Auth(argument.to_string()),
                "MAIL" => SmtpCommand::MailFrom(argument.to_string()),
                "RCPT" => SmtpCommand::RcptTo(argument.to_string()),
                "DATA" => SmtpCommand::Data,
                "NOOP" => SmtpCommand::Noop,
                "RSET" => SmtpCommand::Rset,
                "QUIT" => SmtpCommand::Quit,
                "STARTTLS" => SmtpCommand::StartTls,
                _ => SmtpCommand::Other(command_line.clone()),
            };
            internal!(level = DEBUG, "Mock server received: {command_line}");
            shared.commands.write().await.push(command);

            let reply = if verb == "EHLO" {
                let mut reply = String::new();
                let last = shared.config.capabilities.len().saturating_sub(1);
                for (i, capability) in shared.config.capabilities.iter().enumerate() {
                    let separator = if i == last { ' ' } else { '-' };
                    let _ = write!(reply, "250{separator}{capability}\r\n");
                }
                match shared.scripted("EHLO").await {
                    Some(Reply::Drop) => return Ok(()),
                    Some(Reply::Respond(response)) => response.to_bytes(),
                    None => reply.into_bytes(),
                }
            } else if verb == "AUTH" && argument.eq_ignore_ascii_case("LOGIN") {
                match shared.scripted("AUTH").await {
                    Some(Reply::Drop) => return Ok(()),
                    Some(Reply::Respond(response)) => response.to_bytes(),
                    None => SmtpResponse::new(334, "VXNlcm5hbWU6").to_bytes(),
                }
            } else {
                match shared.reply_for(&verb).await {
                    Reply::Drop => return Ok(()),
                    Reply::Respond(response) => response.to_bytes(),
                }
            };

            writer.write_all(&reply).await?;

            match verb.as_str() {
                "QUIT" => return Ok(()),
                "AUTH" if argument.eq_ignore_ascii_case("LOGIN") && reply.starts_with(b"334") => {
                    // Username and password, one line each.
                    for prompt in ["UGFzc3dvcmQ6", ""] {
                        line.clear();
                        if reader.read_line(&mut line).await? == 0 {
                            return Ok(());
                        }
                        let response = if prompt.is_empty() {
                            SmtpResponse::new(235, "Authentication successful")
                        } else {
                            SmtpResponse::new(334, prompt)
                        };
                        writer.write_all(&response.to_bytes()).await?;
                    }
                }
                "DATA" if reply.starts_with(b"354") => {
                    let mut content = String::new();
                    loop {
                        line.clear();
                        if reader.read_line(&mut line).await? == 0 {
                            return Ok(());
                        }
                        if line == ".\r\n" || line == ".\n" {
                            break;
                        }
                        content.push_str(line.strip_prefix('.').unwrap_or(&line));
                    }
                    shared
                        .commands
                        .write()
                        .await
                        .push(SmtpCommand::MessageContent(content));

                    match shared.reply_for("CONTENT").await {
                        Reply::Drop => return Ok(()),
                        Reply::Respond(response) => writer.write_all(&response.to_bytes()).await?,
                    }
                }
                _ => {}
            }
        }
    }
}

impl Drop for MockSmtpServer {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

pub struct MockSmtpServerBuilder {
    config: MockServerConfig,
    script: AHashMap<String, VecDeque<Reply>>,
}

impl MockSmtpServerBuilder {
    #[must_use]
    pub fn with_greeting(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.greeting = SmtpResponse::new(code, message);
        self
    }

    /// Capabilities listed in the EHLO reply; the first entry is the domain.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.config.capabilities = capabilities.iter().map(ToString::to_string).collect();
        self
    }

    /// Default reply for `verb`. `CONTENT` is the reply after the message body.
    #[must_use]
    pub fn with_response(mut self, verb: &'static str, code: u16, message: impl Into<String>) -> Self {
        self.config
            .defaults
            .insert(verb, SmtpResponse::new(code, message));
        self
    }

    /// Reply once to the next `verb` with this, before falling back to the default.
    #[must_use]
    pub fn with_scripted_response(mut self, verb: &str, code: u16, message: impl Into<String>) -> Self {
        self.script
            .entry(verb.to_ascii_uppercase())
            .or_default()
            .push_back(Reply::Respond(SmtpResponse::new(code, message)));
        self
    }

    /// Close the connection without replying the next time `verb` arrives.
    #[must_use]
    pub fn with_scripted_drop(mut self, verb: &str) -> Self {
        self.script
            .entry(verb.to_ascii_uppercase())
            .or_default()
            .push_back(Reply::Drop);
        self
    }

    /// Wait this long after accepting before sending the greeting.
    #[must_use]
    pub const fn with_connection_delay(mut self, delay: Duration) -> Self {
        self.config.connection_delay = Some(delay);
        self
    }

    pub async fn build(self) -> std::io::Result<MockSmtpServer> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            config: self.config,
            script: Mutex::new(self.script),
            commands: RwLock::new(Vec::new()),
            connections: AtomicUsize::new(0),
        });

        let accepted = Arc::clone(&shared);
        let accept_loop = tokio::spawn(async move {
            while let Ok((stream, _peer)) = listener.accept().await {
                accepted.connections.fetch_add(1, Ordering::SeqCst);
                let shared = Arc::clone(&accepted);
                tokio::spawn(async move {
                    if let Err(err) = MockSmtpServer::handle_client(stream, shared).await {
                        internal!(level = DEBUG, "Mock server client error: {err}");
                    }
                });
            }
        });

        Ok(MockSmtpServer {
            addr,
            shared,
            accept_loop,
        })
    }
}
