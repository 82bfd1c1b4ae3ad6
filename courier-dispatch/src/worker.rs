//! A worker owns one SMTP session and one bus subscription covering every
//! channel it has a converter for.

use core::fmt;
use std::{sync::Arc, time::Duration};

use courier_common::{ConfigErrors, EmailMessage, SmtpConfig, critical, internal};
use courier_smtp::SessionOptions;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    bus::Bus,
    dispatcher::Dispatcher,
    error::{ConvertError, StartupError, WorkerError},
    keepalive::KeepAliveMonitor,
    mailer::{Connector, Mailer},
    policy::RetryPolicy,
    registry::ChannelRegistry,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Bound on connecting to the SMTP server, including its greeting.
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Default: `localhost`
    #[serde(default = "defaults::helo_name")]
    pub helo_name: String,

    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: defaults::connect_timeout_secs(),
            helo_name: defaults::helo_name(),
            retry: RetryPolicy::default(),
        }
    }
}

impl WorkerSettings {
    #[must_use]
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            helo_name: self.helo_name.clone(),
        }
    }
}

mod defaults {
    pub const fn connect_timeout_secs() -> u64 {
        30
    }

    pub fn helo_name() -> String {
        "localhost".to_string()
    }
}

/// Where a worker reads its SMTP configuration from when it starts.
pub type ConfigSource = Arc<dyn Fn() -> Result<SmtpConfig, ConfigErrors> + Send + Sync>;

/// What every worker of a supervisor shares.
pub struct Runtime<C> {
    pub bus: Arc<dyn Bus>,
    pub connector: C,
    pub config: ConfigSource,
}

impl<C: Connector> Runtime<C> {
    /// A runtime reading `SMTP_*` from the process environment.
    pub fn new(bus: Arc<dyn Bus>, connector: C) -> Self {
        Self {
            bus,
            connector,
            config: Arc::new(SmtpConfig::from_env),
        }
    }

    #[must_use]
    pub fn with_config<F>(mut self, config: F) -> Self
    where
        F: Fn() -> Result<SmtpConfig, ConfigErrors> + Send + Sync + 'static,
    {
        self.config = Arc::new(config);
        self
    }
}

pub struct Worker {
    name: String,
    registry: ChannelRegistry,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            registry: ChannelRegistry::new(),
            settings: WorkerSettings::default(),
        }
    }

    #[must_use]
    pub fn with_settings(mut self, settings: WorkerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Bind `convert` to `channel`. A later registration for the same channel
    /// replaces this one.
    pub fn register_channel<F>(&mut self, channel: impl Into<String>, convert: F) -> &mut Self
    where
        F: Fn(&[u8]) -> Result<EmailMessage, ConvertError> + Send + Sync + 'static,
    {
        self.registry.register(channel, convert);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn channels(&self) -> Vec<String> {
        self.registry.channels()
    }

    #[must_use]
    pub const fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Connect, subscribe and dispatch until `token` is cancelled.
    ///
    /// Startup failures are logged as critical and returned; the worker is
    /// not restarted. Once running, only the bus going away ends the worker
    /// with an error.
    pub async fn run<C: Connector>(
        self,
        runtime: Arc<Runtime<C>>,
        token: CancellationToken,
    ) -> Result<(), WorkerError> {
        let name = self.name.clone();

        let config = match (runtime.config)() {
            Ok(config) => config,
            Err(errors) => {
                let err = StartupError::from(errors);
                report_startup(&name, &err);
                return Err(err.into());
            }
        };

        internal!(level = DEBUG, worker = %name, "Starting {} with {config:?}", self);

        let keep_alive = config.keep_alive_interval();
        let mut mailer = match runtime
            .connector
            .open(config, self.settings.session_options())
            .await
        {
            Ok(mailer) => mailer,
            Err(err) => {
                report_startup(&name, &err);
                return Err(err.into());
            }
        };

        let channels = self.registry.channels();
        let mut subscription = match runtime.bus.subscribe(&channels).await {
            Ok(subscription) => subscription,
            Err(err) => {
                mailer.close().await;
                let err = StartupError::Bus(err);
                report_startup(&name, &err);
                return Err(err.into());
            }
        };
        internal!(level = INFO, worker = %name, "Subscribed to {}", channels.join(", "));

        let mailer = Arc::new(Mutex::new(mailer));
        let monitor = KeepAliveMonitor::spawn(&name, Arc::clone(&mailer), keep_alive, &token);

        let mut dispatcher = Dispatcher::new(
            &name,
            Arc::new(self.registry),
            Arc::clone(&mailer),
            Arc::clone(&runtime.bus),
            self.settings.retry,
        );
        let result = dispatcher.run(subscription.as_mut(), &token).await;

        monitor.stop().await;
        subscription.close().await;
        dispatcher.flush().await;

        internal!(level = INFO, worker = %name, "Closing SMTP session");
        mailer.lock().await.close().await;

        if let Err(err) = &result {
            internal!(level = ERROR, worker = %name, "Worker stopped: {err}");
        }

        result.map_err(WorkerError::from)
    }
}

impl fmt::Display for Worker {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{} [{}]", self.name, self.registry.channels().join(", "))
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Worker")
            .field("name", &self.name)
            .field("channels", &self.registry)
            .field("settings", &self.settings)
            .finish()
    }
}

fn report_startup(worker: &str, err: &StartupError) {
    if let StartupError::Configuration(errors) = err {
        for error in errors {
            critical!(worker = %worker, key = error.key(), "{error}");
        }
    } else {
        internal!(level = INFO, worker = %worker, "SMTP Error Details: {err:?}");
        critical!(worker = %worker, "{}", err.summary());
    }

    critical!(
        worker = %worker,
        "eMail service is not available! fix {} and restart the service.",
        err.remedy()
    );
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn settings_default_and_read_from_ron() {
        let settings: WorkerSettings =
            ron::from_str("(helo_name: \"mail.example.com\", retry: (max_attempts: 3))").unwrap();

        assert_eq!(settings.connect_timeout_secs, 30);
        assert_eq!(settings.helo_name, "mail.example.com");
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(
            settings.session_options().connect_timeout,
            Duration::from_secs(30)
        );
    }

    #[test]
    fn summary_lists_channels() {
        let mut worker = Worker::new("notifications");
        worker
            .register_channel("email.notify.welcome", |_: &[u8]| {
                Ok(EmailMessage::new("hi", ""))
            })
            .register_channel("email.notify.login", |_: &[u8]| {
                Ok(EmailMessage::new("login", ""))
            });

        assert_eq!(
            worker.to_string(),
            "notifications [email.notify.login, email.notify.welcome]"
        );
        assert_eq!(worker.channels().len(), 2);
    }
}
