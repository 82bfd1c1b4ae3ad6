use std::{path::PathBuf, sync::Arc};

use courier_dispatch::{Worker, WorkerSettings};
use serde::{Deserialize, Serialize};

use crate::notifications::{Branding, Notification};

/// Environment variable pointing at a RON settings file.
pub const CONFIG_ENV: &str = "COURIER_CONFIG";

/// Environment variable overriding [`Settings::redis_url`].
pub const REDIS_URL_ENV: &str = "REDIS_URL";

/// One worker and the notifications it handles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerGroup {
    pub name: String,
    pub notifications: Vec<Notification>,
    #[serde(default)]
    pub settings: WorkerSettings,
}

impl WorkerGroup {
    #[must_use]
    pub fn build(&self, branding: &Arc<Branding>) -> Worker {
        let mut worker = Worker::new(&self.name).with_settings(self.settings.clone());
        for notification in &self.notifications {
            notification.register(&mut worker, branding);
        }
        worker
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Default: `redis://127.0.0.1/`
    #[serde(default = "defaults::redis_url")]
    pub redis_url: String,

    /// Each group gets its own SMTP session and subscription.
    ///
    /// Default: welcome and login access on one worker, account removal on
    /// another.
    #[serde(default = "defaults::workers")]
    pub workers: Vec<WorkerGroup>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            redis_url: defaults::redis_url(),
            workers: defaults::workers(),
        }
    }
}

mod defaults {
    use courier_dispatch::WorkerSettings;

    use super::WorkerGroup;
    use crate::notifications::Notification;

    pub fn redis_url() -> String {
        "redis://127.0.0.1/".to_string()
    }

    pub fn workers() -> Vec<WorkerGroup> {
        vec![
            WorkerGroup {
                name: "notifications".to_string(),
                notifications: vec![Notification::Welcome, Notification::LoginAccess],
                settings: WorkerSettings::default(),
            },
            WorkerGroup {
                name: "accounts".to_string(),
                notifications: vec![Notification::AccountRemoval],
                settings: WorkerSettings::default(),
            },
        ]
    }
}

impl Settings {
    /// Load settings using the following precedence:
    /// 1. the file named by `COURIER_CONFIG`
    /// 2. `./courier.config.ron`
    /// 3. `/etc/courier/courier.config.ron`
    /// 4. built-in defaults
    ///
    /// `REDIS_URL`, when set, replaces whatever the file says.
    pub fn load() -> anyhow::Result<Self> {
        let mut settings = match find_config_file()? {
            Some(path) => {
                let content = std::fs::read_to_string(&path).map_err(|e| {
                    anyhow::anyhow!("Failed to read config from {}: {}", path.display(), e)
                })?;
                Self::parse(&content)?
            }
            None => Self::default(),
        };

        if let Ok(url) = std::env::var(REDIS_URL_ENV)
            && !url.trim().is_empty()
        {
            settings.redis_url = url;
        }

        Ok(settings)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let settings: Self = ron::from_str(content)?;
        if settings.workers.iter().all(|group| group.notifications.is_empty()) {
            anyhow::bail!("No notifications are configured for any worker");
        }
        Ok(settings)
    }
}

fn find_config_file() -> anyhow::Result<Option<PathBuf>> {
    if let Ok(env_path) = std::env::var(CONFIG_ENV) {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(Some(path));
        }
        anyhow::bail!("{CONFIG_ENV} points to non-existent file: {}", path.display());
    }

    Ok([
        PathBuf::from("./courier.config.ron"),
        PathBuf::from("/etc/courier/courier.config.ron"),
    ]
    .into_iter()
    .find(|path| path.exists()))
}
