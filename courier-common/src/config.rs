//! SMTP configuration sourced from `SMTP_`-prefixed environment variables.
//!
//! | Key | Type | Default |
//! |---|---|---|
//! | `SMTP_HOST` | string | required |
//! | `SMTP_PORT` | int | 25 |
//! | `SMTP_STARTTLS` | bool | false |
//! | `SMTP_FROM_EMAIL` | string | required |
//! | `SMTP_USERNAME` | string | required |
//! | `SMTP_PASSWORD` | string | required |
//! | `SMTP_KEEP_ALIVE_INTERVAL` | int (seconds) | 120 |
//! | `SMTP_DEBUG` | bool | false |
//!
//! Loading never stops at the first problem: every missing or invalid key is
//! collected so an operator can fix them all in one go.

use core::fmt::{self, Display};
use std::time::Duration;

use thiserror::Error;

/// Prefix shared by every SMTP environment variable.
pub const ENV_PREFIX: &str = "SMTP_";

mod defaults {
    pub const fn port() -> u16 {
        25
    }

    pub const fn keep_alive_interval_secs() -> u64 {
        120
    }
}

/// A single problem with one configuration key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{key} environment variable not found.")]
    Missing { key: String },

    #[error("you have set {key}=\"{value}\" but {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    /// The fully prefixed name of the offending key.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Missing { key } | Self::Invalid { key, .. } => key,
        }
    }
}

/// Every problem found while loading the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct ConfigErrors(Vec<ConfigError>);

impl ConfigErrors {
    #[must_use]
    pub fn errors(&self) -> &[ConfigError] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for ConfigErrors {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for error in &self.0 {
            if !first {
                fmt.write_str("; ")?;
            }
            first = false;
            Display::fmt(error, fmt)?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a ConfigErrors {
    type Item = &'a ConfigError;
    type IntoIter = std::slice::Iter<'a, ConfigError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Connection, credential and behaviour settings for one SMTP session.
#[derive(Clone, PartialEq, Eq)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub starttls: bool,
    /// Envelope and header sender used when a message does not name one.
    pub from_email: String,
    pub username: String,
    pub password: String,
    pub keep_alive_interval_secs: u64,
    /// Log the SMTP protocol transcript.
    pub debug: bool,
}

impl fmt::Debug for SmtpConfig {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("starttls", &self.starttls)
            .field("from_email", &self.from_email)
            .field("username", &self.username)
            .field("password", &"********")
            .field("keep_alive_interval_secs", &self.keep_alive_interval_secs)
            .field("debug", &self.debug)
            .finish()
    }
}

impl SmtpConfig {
    /// Build a configuration with every optional key at its default.
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        from_email: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: defaults::port(),
            starttls: false,
            from_email: from_email.into(),
            username: username.into(),
            password: password.into(),
            keep_alive_interval_secs: defaults::keep_alive_interval_secs(),
            debug: false,
        }
    }

    /// Load from the process environment.
    ///
    /// # Errors
    ///
    /// Returns every missing or invalid key.
    pub fn from_env() -> Result<Self, ConfigErrors> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` to resolve fully prefixed key names.
    ///
    /// # Errors
    ///
    /// Returns every missing or invalid key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigErrors>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut reader = Reader {
            lookup,
            errors: Vec::new(),
        };

        let host = reader.required("HOST");
        let port = reader.parsed("PORT", defaults::port(), parse_port);
        let starttls = reader.parsed("STARTTLS", false, parse_bool);
        let from_email = reader.required("FROM_EMAIL");
        let username = reader.required("USERNAME");
        let password = reader.required("PASSWORD");
        let keep_alive_interval_secs = reader.parsed(
            "KEEP_ALIVE_INTERVAL",
            defaults::keep_alive_interval_secs(),
            parse_interval,
        );
        let debug = reader.parsed("DEBUG", false, parse_bool);

        if !reader.errors.is_empty() {
            return Err(ConfigErrors(reader.errors));
        }

        Ok(Self {
            host: host.unwrap_or_default(),
            port,
            starttls,
            from_email: from_email.unwrap_or_default(),
            username: username.unwrap_or_default(),
            password: password.unwrap_or_default(),
            keep_alive_interval_secs,
            debug,
        })
    }

    /// `host:port`, ready for a socket connect.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[must_use]
    pub const fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs)
    }
}

struct Reader<F> {
    lookup: F,
    errors: Vec<ConfigError>,
}

impl<F> Reader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn fetch(&self, name: &str) -> (String, Option<String>) {
        let key = format!("{ENV_PREFIX}{name}");
        let value = (self.lookup)(&key);
        (key, value)
    }

    fn required(&mut self, name: &str) -> Option<String> {
        match self.fetch(name) {
            (_, Some(value)) if !value.trim().is_empty() => Some(value),
            (key, _) => {
                self.errors.push(ConfigError::Missing { key });
                None
            }
        }
    }

    fn parsed<T>(&mut self, name: &str, default: T, parse: fn(&str) -> Result<T, String>) -> T {
        let (key, value) = self.fetch(name);
        let Some(value) = value else {
            return default;
        };

        match parse(value.trim()) {
            Ok(parsed) => parsed,
            Err(reason) => {
                self.errors.push(ConfigError::Invalid { key, value, reason });
                default
            }
        }
    }
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err("input should be a valid boolean".to_string()),
    }
}

fn parse_port(value: &str) -> Result<u16, String> {
    match value.parse::<u16>() {
        Ok(0) => Err("input should be greater than 0".to_string()),
        Ok(port) => Ok(port),
        Err(_) => Err("input should be a valid port number (1-65535)".to_string()),
    }
}

fn parse_interval(value: &str) -> Result<u64, String> {
    match value.parse::<u64>() {
        Ok(0) => Err("input should be greater than 0".to_string()),
        Ok(secs) => Ok(secs),
        Err(_) => Err("input should be a valid integer".to_string()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const REQUIRED: [(&str, &str); 4] = [
        ("SMTP_HOST", "smtp.example.com"),
        ("SMTP_FROM_EMAIL", "hello@example.com"),
        ("SMTP_USERNAME", "mailer"),
        ("SMTP_PASSWORD", "hunter2"),
    ];

    #[test]
    fn defaults_apply_to_optional_keys() {
        let config = SmtpConfig::from_lookup(lookup(&REQUIRED)).unwrap();

        assert_eq!(config.host, "smtp.example.com");
        assert_eq!(config.port, 25);
        assert!(!config.starttls);
        assert_eq!(config.keep_alive_interval(), Duration::from_secs(120));
        assert!(!config.debug);
        assert_eq!(config.address(), "smtp.example.com:25");
    }

    #[test]
    fn optional_keys_are_parsed() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([
            ("SMTP_PORT", "587"),
            ("SMTP_STARTTLS", "True"),
            ("SMTP_KEEP_ALIVE_INTERVAL", "30"),
            ("SMTP_DEBUG", "1"),
        ]);

        let config = SmtpConfig::from_lookup(lookup(&pairs)).unwrap();

        assert_eq!(config.port, 587);
        assert!(config.starttls);
        assert_eq!(config.keep_alive_interval_secs, 30);
        assert!(config.debug);
    }

    #[test]
    fn every_missing_key_is_reported() {
        let errors = SmtpConfig::from_lookup(lookup(&[("SMTP_HOST", "smtp")])).unwrap_err();

        let keys: Vec<_> = errors.errors().iter().map(ConfigError::key).collect();
        assert_eq!(
            keys,
            vec!["SMTP_FROM_EMAIL", "SMTP_USERNAME", "SMTP_PASSWORD"]
        );
        assert_eq!(
            errors.errors()[0].to_string(),
            "SMTP_FROM_EMAIL environment variable not found."
        );
    }

    #[test]
    fn blank_required_values_count_as_missing() {
        let mut pairs = REQUIRED.to_vec();
        pairs[0] = ("SMTP_HOST", "   ");

        let errors = SmtpConfig::from_lookup(lookup(&pairs)).unwrap_err();
        assert_eq!(
            errors.errors(),
            &[ConfigError::Missing {
                key: "SMTP_HOST".to_string()
            }]
        );
    }

    #[test]
    fn invalid_values_carry_the_offending_input() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([("SMTP_PORT", "smtp"), ("SMTP_STARTTLS", "maybe")]);

        let errors = SmtpConfig::from_lookup(lookup(&pairs)).unwrap_err();

        assert_eq!(errors.len(), 2);
        assert_eq!(
            errors.errors()[0].to_string(),
            "you have set SMTP_PORT=\"smtp\" but input should be a valid port number (1-65535)"
        );
        assert_eq!(
            errors.errors()[1],
            ConfigError::Invalid {
                key: "SMTP_STARTTLS".to_string(),
                value: "maybe".to_string(),
                reason: "input should be a valid boolean".to_string(),
            }
        );
    }

    #[test]
    fn missing_and_invalid_are_reported_together() {
        let errors = SmtpConfig::from_lookup(lookup(&[
            ("SMTP_KEEP_ALIVE_INTERVAL", "0"),
            ("SMTP_USERNAME", "mailer"),
        ]))
        .unwrap_err();

        let keys: Vec<_> = errors.into_iter().map(ConfigError::key).collect();
        assert_eq!(
            keys,
            vec![
                "SMTP_HOST",
                "SMTP_FROM_EMAIL",
                "SMTP_PASSWORD",
                "SMTP_KEEP_ALIVE_INTERVAL"
            ]
        );
    }

    #[test]
    fn debug_output_redacts_the_password() {
        let config = SmtpConfig::from_lookup(lookup(&REQUIRED)).unwrap();
        let rendered = format!("{config:?}");

        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("********"));
    }
}
