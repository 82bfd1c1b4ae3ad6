//! The notification emails this service knows how to write.
//!
//! Each kind listens on its own channel and expects a JSON payload:
//!
//! | Channel | Payload |
//! |---|---|
//! | `email.notify.welcome` | `{"to", "full_name", "password"}` |
//! | `email.notify.login_access` | `{"to", "full_name", "ip_address", "is_access_granted"}` |
//! | `email.notify.account_removal` | `{"to", "full_name"}` |

use std::sync::Arc;

use chrono::Utc;
use courier_common::EmailMessage;
use courier_dispatch::{ConvertError, Worker};
use serde::{Deserialize, Serialize};

/// Environment variable naming the service in subjects and footers.
pub const SERVICE_NAME_ENV: &str = "SERVICE_NAME";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Notification {
    Welcome,
    LoginAccess,
    AccountRemoval,
}

impl Notification {
    #[must_use]
    pub const fn channel(self) -> &'static str {
        match self {
            Self::Welcome => "email.notify.welcome",
            Self::LoginAccess => "email.notify.login_access",
            Self::AccountRemoval => "email.notify.account_removal",
        }
    }

    /// Build the email for `payload`.
    pub fn convert(self, branding: &Branding, payload: &[u8]) -> Result<EmailMessage, ConvertError> {
        match self {
            Self::Welcome => {
                let welcome: Welcome = parse(payload)?;
                Ok(branding.message(
                    welcome.to,
                    format!("Welcome to {}! [do not reply]", branding.service),
                    &format!(
                        "Hi {},\n\nWelcome to {service}!\n\nWe are pleased to have you as a member of \
                         {service}.\n\nYour initial login password is set as below, please change it \
                         after logging in:\n\n{}",
                        welcome.full_name,
                        welcome.password,
                        service = branding.service,
                    ),
                ))
            }
            Self::LoginAccess => {
                let access: LoginAccess = parse(payload)?;
                let result = if access.is_access_granted {
                    "was successful"
                } else {
                    "failed"
                };
                Ok(branding.message(
                    access.to,
                    format!("{} Login Access Notification [do not reply]", branding.service),
                    &format!(
                        "Hi {},\n\nIP Address: {}\n\nYour recent login attempt {result}.",
                        access.full_name, access.ip_address
                    ),
                ))
            }
            Self::AccountRemoval => {
                let removal: AccountRemoval = parse(payload)?;
                Ok(branding.message(
                    removal.to,
                    format!("{} Account Removal Notification [do not reply]", branding.service),
                    &format!(
                        "Hi {},\n\nYour account has been removed from {} by Admin, for further \
                         details please contact Administrator.",
                        removal.full_name, branding.service
                    ),
                ))
            }
        }
    }

    /// Bind this notification's channel on `worker`.
    pub fn register(self, worker: &mut Worker, branding: &Arc<Branding>) {
        let branding = Arc::clone(branding);
        worker.register_channel(self.channel(), move |payload: &[u8]| {
            self.convert(&branding, payload)
        });
    }
}

fn parse<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T, ConvertError> {
    serde_json::from_slice(payload).map_err(ConvertError::new)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    pub to: String,
    pub full_name: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginAccess {
    pub to: String,
    pub full_name: String,
    pub ip_address: String,
    pub is_access_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRemoval {
    pub to: String,
    pub full_name: String,
}

/// Service name and sender stamped onto every notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branding {
    pub service: String,
    /// `None` leaves the sender to the session's `SMTP_FROM_EMAIL`.
    pub from: Option<String>,
}

impl Default for Branding {
    fn default() -> Self {
        Self {
            service: "FileServer".to_string(),
            from: None,
        }
    }
}

impl Branding {
    /// Service name from `SERVICE_NAME`, or `FileServer`.
    #[must_use]
    pub fn from_env() -> Self {
        std::env::var(SERVICE_NAME_ENV)
            .ok()
            .filter(|name| !name.trim().is_empty())
            .map_or_else(Self::default, |service| Self {
                service,
                from: None,
            })
    }

    fn footer(&self) -> String {
        format!(
            "\n\n~~ {} Admin ~~\nAn auto-generated email @ {}\nplease do not reply.",
            self.service,
            Utc::now().format("%Y-%m-%d %H:%M:%S %Z")
        )
    }

    fn message(&self, to: String, subject: String, body: &str) -> EmailMessage {
        let message = EmailMessage::new(subject, format!("{body}{}", self.footer())).recipient(to);
        match &self.from {
            Some(from) => message.sender(from),
            None => message,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn welcome_uses_the_payload() {
        let branding = Branding::default();
        let message = Notification::Welcome
            .convert(
                &branding,
                br#"{"to": "someone@test.co", "full_name": "Crazy Doe", "password": "olQHWVrH$8"}"#,
            )
            .unwrap();

        assert_eq!(message.subject, "Welcome to FileServer! [do not reply]");
        assert_eq!(message.to, vec!["someone@test.co"]);
        assert_eq!(message.from, None);
        assert!(message.body_text.starts_with("Hi Crazy Doe,"));
        assert!(message.body_text.contains("olQHWVrH$8"));
        assert!(message.body_text.contains("~~ FileServer Admin ~~"));
        assert!(message.body_text.ends_with("please do not reply."));
    }

    #[test]
    fn login_access_reports_the_outcome() {
        let branding = Branding {
            service: "Vault".to_string(),
            from: Some("noreply@vault.example".to_string()),
        };
        let payload = serde_json::to_vec(&LoginAccess {
            to: "a@example.com".to_string(),
            full_name: "A".to_string(),
            ip_address: "10.0.0.7".to_string(),
            is_access_granted: false,
        })
        .unwrap();

        let message = Notification::LoginAccess.convert(&branding, &payload).unwrap();

        assert_eq!(message.subject, "Vault Login Access Notification [do not reply]");
        assert_eq!(message.from.as_deref(), Some("noreply@vault.example"));
        assert!(message.body_text.contains("IP Address: 10.0.0.7"));
        assert!(message.body_text.contains("Your recent login attempt failed."));
    }

    #[test]
    fn account_removal_names_the_service() {
        let message = Notification::AccountRemoval
            .convert(
                &Branding::default(),
                br#"{"to": "b@example.com", "full_name": "B"}"#,
            )
            .unwrap();

        assert_eq!(
            message.subject,
            "FileServer Account Removal Notification [do not reply]"
        );
        assert!(message.body_text.contains("removed from FileServer by Admin"));
    }

    #[test]
    fn malformed_payloads_are_conversion_errors() {
        let branding = Branding::default();

        assert!(Notification::Welcome.convert(&branding, b"not json").is_err());
        let missing = Notification::Welcome
            .convert(&branding, br#"{"to": "a@example.com"}"#)
            .unwrap_err();
        assert!(missing.to_string().contains("full_name"));
    }

    #[test]
    fn registers_on_its_channel() {
        let mut worker = Worker::new("w");
        let branding = Arc::new(Branding::default());
        Notification::Welcome.register(&mut worker, &branding);
        Notification::AccountRemoval.register(&mut worker, &branding);

        assert_eq!(
            worker.channels(),
            vec!["email.notify.account_removal", "email.notify.welcome"]
        );
    }
}
