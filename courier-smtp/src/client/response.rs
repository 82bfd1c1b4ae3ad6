//! SMTP reply parsing.

use core::fmt::{self, Display};

use super::error::{ClientError, Result};

/// A complete, possibly multi-line, SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Response {
    #[must_use]
    pub const fn new(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join("\n")
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    /// `3xx`: the server wants more input (DATA, AUTH challenges).
    #[must_use]
    pub const fn is_intermediate(&self) -> bool {
        self.code >= 300 && self.code < 400
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.code >= 400 && self.code < 600
    }

    /// Parse one reply line into `(code, is_last, text)`.
    fn parse_line(line: &str) -> Result<(u16, bool, &str)> {
        let code = line
            .get(..3)
            .ok_or_else(|| ClientError::ParseError(format!("Response line too short: '{line}'")))?;
        let code = code
            .parse::<u16>()
            .map_err(|_| ClientError::ParseError(format!("Invalid status code: '{code}'")))?;

        let rest = &line[3..];
        match rest.chars().next() {
            None => Ok((code, true, "")),
            Some(' ') => Ok((code, true, &rest[1..])),
            Some('-') => Ok((code, false, &rest[1..])),
            Some(c) => Err(ClientError::ParseError(format!(
                "Invalid separator character: '{c}'"
            ))),
        }
    }

    /// Parse a complete reply from the front of `buffer`.
    ///
    /// Returns the reply and the number of bytes it occupied, or `None` when
    /// more data is needed.
    pub fn parse(buffer: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut consumed = 0;
        let mut code = None;
        let mut lines = Vec::new();

        while let Some(end) = buffer[consumed..].iter().position(|&b| b == b'\n') {
            let raw = &buffer[consumed..consumed + end];
            consumed += end + 1;

            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            if raw.is_empty() {
                continue;
            }

            let (line_code, is_last, text) = Self::parse_line(std::str::from_utf8(raw)?)?;
            match code {
                Some(first) if first != line_code => {
                    return Err(ClientError::ParseError(format!(
                        "Status code mismatch in multi-line response: expected {first}, got {line_code}"
                    )));
                }
                Some(_) => {}
                None => code = Some(line_code),
            }

            lines.push(text.to_string());

            if is_last {
                return Ok(Some((Self::new(line_code, lines), consumed)));
            }
        }

        Ok(None)
    }

    /// Turn an error reply into a [`ClientError::SmtpError`].
    pub fn checked(self) -> Result<Self> {
        if self.is_error() {
            Err(ClientError::SmtpError {
                code: self.code,
                message: self.message(),
            })
        } else {
            Ok(self)
        }
    }
}

impl Display for Response {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{} {}", self.code, self.lines.join(" "))
    }
}
