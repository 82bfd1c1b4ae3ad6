use core::fmt::{self, Display};

/// A ready-to-send email produced by a channel converter.
///
/// The dispatcher never looks inside one of these beyond logging its subject
/// and recipients.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmailMessage {
    pub subject: String,
    /// Sender address. The session falls back to its configured
    /// `SMTP_FROM_EMAIL` when this is `None`.
    pub from: Option<String>,
    pub to: Vec<String>,
    pub body_text: String,
}

impl EmailMessage {
    #[must_use]
    pub fn new(subject: impl Into<String>, body_text: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            from: None,
            to: Vec::new(),
            body_text: body_text.into(),
        }
    }

    #[must_use]
    pub fn sender(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    #[must_use]
    pub fn recipient(mut self, recipient: impl Into<String>) -> Self {
        self.to.push(recipient.into());
        self
    }

    /// Recipients as a single comma separated list, for logging.
    #[must_use]
    pub fn recipients(&self) -> Recipients<'_> {
        Recipients(&self.to)
    }
}

pub struct Recipients<'a>(&'a [String]);

impl Display for Recipients<'_> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str(&self.0.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::EmailMessage;

    #[test]
    fn builder_collects_recipients_in_order() {
        let message = EmailMessage::new("Hello", "Body")
            .sender("noreply@example.com")
            .recipient("a@example.com")
            .recipient("b@example.com");

        assert_eq!(message.from.as_deref(), Some("noreply@example.com"));
        assert_eq!(message.recipients().to_string(), "a@example.com, b@example.com");
    }
}
