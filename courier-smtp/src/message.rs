//! RFC 5322 rendering of an [`EmailMessage`].

use core::fmt::Write;

use base64::{Engine, engine::general_purpose::STANDARD};
use courier_common::EmailMessage;
use thiserror::Error;

/// A sender, recipient or subject that would break out of its header line or
/// SMTP command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field} contains a control character: {value:?}")]
pub struct InvalidHeader {
    pub field: &'static str,
    pub value: String,
}

fn checked<'a>(field: &'static str, value: &'a str) -> Result<&'a str, InvalidHeader> {
    if value.chars().any(char::is_control) {
        Err(InvalidHeader {
            field,
            value: value.to_string(),
        })
    } else {
        Ok(value)
    }
}

/// Refuse header values that carry CR, LF or any other control character.
pub fn validate(message: &EmailMessage, from: &str) -> Result<(), InvalidHeader> {
    checked("From", from)?;
    for recipient in &message.to {
        checked("To", recipient)?;
    }
    checked("Subject", &message.subject)?;
    Ok(())
}

/// Bare `local@domain` for use in the SMTP envelope.
///
/// Accepts `Display Name <local@domain>` as well as a plain address.
#[must_use]
pub fn envelope_address(address: &str) -> String {
    mailparse::addrparse(address)
        .ok()
        .and_then(|list| list.extract_single_info())
        .map_or_else(|| address.trim().to_string(), |info| info.addr)
}

fn needs_utf8(value: &str) -> bool {
    !value.is_ascii()
}

/// RFC 2047 encoded-word for non-ASCII header values.
fn encode_header(value: &str) -> String {
    if needs_utf8(value) {
        format!("=?utf-8?B?{}?=", STANDARD.encode(value))
    } else {
        value.to_string()
    }
}

/// Whether any part of the message needs the SMTPUTF8 / 8BITMIME extensions.
#[must_use]
pub fn is_international(message: &EmailMessage, from: &str) -> bool {
    needs_utf8(from) || message.to.iter().any(|to| needs_utf8(to))
}

/// Render headers and body, with CRLF line endings throughout.
pub fn render(message: &EmailMessage, from: &str) -> Result<String, InvalidHeader> {
    validate(message, from)?;

    let domain = envelope_address(from)
        .rsplit_once('@')
        .map_or_else(|| "localhost".to_string(), |(_, domain)| domain.to_string());

    let mut rendered = String::with_capacity(message.body_text.len() + 512);
    let _ = write!(rendered, "From: {from}\r\n");
    let _ = write!(rendered, "To: {}\r\n", message.to.join(", "));
    let _ = write!(rendered, "Subject: {}\r\n", encode_header(&message.subject));
    let _ = write!(rendered, "Date: {}\r\n", chrono::Utc::now().to_rfc2822());
    let _ = write!(rendered, "Message-ID: <{}@{domain}>\r\n", ulid::Ulid::new());
    rendered.push_str("MIME-Version: 1.0\r\n");
    rendered.push_str("Content-Type: text/plain; charset=utf-8\r\n");
    let _ = write!(
        rendered,
        "Content-Transfer-Encoding: {}\r\n",
        if needs_utf8(&message.body_text) {
            "8bit"
        } else {
            "7bit"
        }
    );
    rendered.push_str("\r\n");

    for line in message.body_text.lines() {
        rendered.push_str(line);
        rendered.push_str("\r\n");
    }

    Ok(rendered)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use mailparse::MailHeaderMap;
    use pretty_assertions::assert_eq;

    use super::*;

    fn welcome() -> EmailMessage {
        EmailMessage::new("Welcome to FileServer! [do not reply]", "Hello Ada,\nwelcome aboard.")
            .recipient("ada@example.com")
    }

    #[test]
    fn envelope_strips_display_names() {
        assert_eq!(
            envelope_address("FileServer <noreply@example.com>"),
            "noreply@example.com"
        );
        assert_eq!(envelope_address(" ada@example.com "), "ada@example.com");
    }

    #[test]
    fn rendered_message_parses_back() {
        let rendered = render(&welcome(), "FileServer <noreply@example.com>").unwrap();
        let parsed = mailparse::parse_mail(rendered.as_bytes()).unwrap();

        assert_eq!(
            parsed.headers.get_first_value("Subject").unwrap(),
            "Welcome to FileServer! [do not reply]"
        );
        assert_eq!(
            parsed.headers.get_first_value("To").unwrap(),
            "ada@example.com"
        );
        assert!(
            parsed
                .headers
                .get_first_value("Message-ID")
                .unwrap()
                .ends_with("@example.com>")
        );
        assert!(
            parsed
                .get_body()
                .unwrap()
                .starts_with("Hello Ada,\r\nwelcome aboard.")
        );
    }

    #[test]
    fn non_ascii_subjects_are_encoded() {
        let mut message = welcome();
        message.subject = "Bienvenue à FileServer".to_string();
        message.body_text = "Voilà".to_string();

        let rendered = render(&message, "noreply@example.com").unwrap();
        assert!(rendered.contains("Content-Transfer-Encoding: 8bit"));
        assert!(rendered.contains("Subject: =?utf-8?B?"));

        let parsed = mailparse::parse_mail(rendered.as_bytes()).unwrap();
        assert_eq!(
            parsed.headers.get_first_value("Subject").unwrap(),
            "Bienvenue à FileServer"
        );
    }

    #[test]
    fn line_breaks_in_headers_are_refused() {
        let injected = EmailMessage::new("Hello", "Body")
            .recipient("ada@example.com>\r\nRCPT TO:<evil@attacker.test");
        assert_eq!(
            render(&injected, "noreply@example.com").unwrap_err().field,
            "To"
        );

        let mut subject = welcome();
        subject.subject = "Hello\nBcc: evil@attacker.test".to_string();
        assert_eq!(
            render(&subject, "noreply@example.com").unwrap_err().field,
            "Subject"
        );

        assert_eq!(
            validate(&welcome(), "noreply@example.com\u{0}").unwrap_err().field,
            "From"
        );
        assert!(validate(&welcome(), "FileServer <noreply@example.com>").is_ok());
    }

    #[test]
    fn international_addresses_are_detected() {
        let message = welcome().recipient("josé@example.com");

        assert!(is_international(&message, "noreply@example.com"));
        assert!(!is_international(&welcome(), "noreply@example.com"));
    }
}
