//! SMTP reply parsing and representation.

use super::error::{ClientError, Result};

/// A single line of an SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseLine {
    pub code: u16,
    /// `false` for continuation lines (`250-...`).
    pub is_last: bool,
    pub message: String,
}

/// A complete SMTP reply, possibly spanning several lines.
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

    /// The message lines joined with newlines.
    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join("\n")
    }

    /// The reply as it appeared on the wire, one `String` per line, without
    /// line terminators.
    #[must_use]
    pub fn wire_lines(&self) -> Vec<String> {
        let last = self.lines.len().saturating_sub(1);
        self.lines
            .iter()
            .enumerate()
            .map(|(i, line)| {
                let separator = if i == last { ' ' } else { '-' };
                if line.is_empty() && i == last {
                    self.code.to_string()
                } else {
                    format!("{}{separator}{line}", self.code)
                }
            })
            .collect()
    }

    /// The reply on one line, as used in error messages and logs.
    #[must_use]
    pub fn summary(&self) -> String {
        format!("{} {}", self.code, self.lines.join(" / "))
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    #[must_use]
    pub const fn is_intermediate(&self) -> bool {
        self.code >= 300 && self.code < 400
    }

    #[must_use]
    pub const fn is_temporary_error(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    #[must_use]
    pub const fn is_permanent_error(&self) -> bool {
        self.code >= 500 && self.code < 600
    }

    /// Whether any line of an EHLO reply advertises `keyword`.
    #[must_use]
    pub fn advertises(&self, keyword: &str) -> bool {
        self.lines.iter().any(|line| {
            line.split_whitespace()
                .next()
                .is_some_and(|first| first.eq_ignore_ascii_case(keyword))
        })
    }

    /// Parses a single reply line.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Parse` if the line doesn't match SMTP format.
    pub fn parse_line(line: &str) -> Result<ResponseLine> {
        let code_str = line.get(..3).ok_or_else(|| {
            ClientError::Parse(format!("Response line too short: '{line}'"))
        })?;

        if !code_str.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ClientError::Parse(format!(
                "Invalid status code: '{code_str}'"
            )));
        }
        let code = code_str
            .parse::<u16>()
            .map_err(|_| ClientError::Parse(format!("Invalid status code: '{code_str}'")))?;

        let is_last = match line[3..].chars().next() {
            None | Some(' ') => true,
            Some('-') => false,
            Some(c) => {
                return Err(ClientError::Parse(format!(
                    "Invalid separator character: '{c}'"
                )));
            }
        };

        let message = line.get(4..).unwrap_or_default().to_string();

        Ok(ResponseLine {
            code,
            is_last,
            message,
        })
    }

    /// Parses a complete, possibly multi-line reply from the front of `buffer`.
    ///
    /// Returns the reply and the number of bytes consumed, or `None` when the
    /// final line has not arrived yet.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Parse` if the reply is malformed.
    pub fn parse_response(buffer: &[u8]) -> Result<Option<(Self, usize)>> {
        let text = match std::str::from_utf8(buffer) {
            Ok(text) => text,
            // A multi-byte character split across reads; parse what is complete.
            Err(e) if e.error_len().is_none() => std::str::from_utf8(&buffer[..e.valid_up_to()])?,
            Err(e) => return Err(e.into()),
        };

        let mut lines = Vec::new();
        let mut first_code = None;
        let mut consumed = 0;

        while let Some(newline) = text[consumed..].find('\n') {
            let raw = &text[consumed..consumed + newline];
            consumed += newline + 1;

            let line = raw.strip_suffix('\r').unwrap_or(raw);
            if line.is_empty() {
                continue;
            }

            let parsed = Self::parse_line(line)?;

            match first_code {
                Some(code) if code != parsed.code => {
                    return Err(ClientError::Parse(format!(
                        "Status code mismatch in multi-line response: expected {code}, got {}",
                        parsed.code
                    )));
                }
                Some(_) => {}
                None => first_code = Some(parsed.code),
            }

            lines.push(parsed.message);

            if parsed.is_last {
                return Ok(Some((Self::new(parsed.code, lines), consumed)));
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_parse_single_line() {
        let line = ResponseLine {
            code: 220,
            is_last: true,
            message: "mail.example.com ESMTP".to_string(),
        };
        assert_eq!(
            Response::parse_line("220 mail.example.com ESMTP").unwrap(),
            line
        );
    }

    #[test]
    fn test_parse_bare_code() {
        let line = Response::parse_line("250").unwrap();
        assert!(line.is_last);
        assert_eq!(line.message, "");
    }

    #[test]
    fn test_parse_multi_line_indicator() {
        let line = Response::parse_line("250-mail.example.com").unwrap();
        assert!(!line.is_last);
        assert_eq!(line.message, "mail.example.com");
    }

    #[test]
    fn test_parse_invalid_code() {
        assert!(Response::parse_line("2x0 nope").is_err());
        assert!(Response::parse_line("25").is_err());
        assert!(Response::parse_line("250+odd").is_err());
    }

    #[test]
    fn test_parse_complete_response() {
        let (response, consumed) = Response::parse_response(b"250 OK\r\n").unwrap().unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(response.lines, vec!["OK"]);
        assert_eq!(consumed, 8);
    }

    #[test]
    fn test_parse_multi_line_response() {
        let data = b"250-mail.example.com\r\n250-STARTTLS\r\n250 HELP\r\n";
        let (response, consumed) = Response::parse_response(data).unwrap().unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(response.lines, vec!["mail.example.com", "STARTTLS", "HELP"]);
        assert_eq!(consumed, data.len());
        assert!(response.advertises("starttls"));
        assert!(!response.advertises("AUTH"));
    }

    #[test]
    fn test_parse_incomplete_response() {
        assert!(
            Response::parse_response(b"250-mail.example.com\r\n250-SIZE")
                .unwrap()
                .is_none()
        );
        assert!(Response::parse_response(b"220 ready").unwrap().is_none());
    }

    #[test]
    fn test_parse_leaves_following_reply_in_buffer() {
        let data = b"334 VXNlcm5hbWU6\r\n235 ok\r\n";
        let (response, consumed) = Response::parse_response(data).unwrap().unwrap();
        assert_eq!(response.code, 334);
        assert_eq!(&data[consumed..], b"235 ok\r\n");
    }

    #[test]
    fn test_parse_code_mismatch() {
        assert!(Response::parse_response(b"250-first\r\n251 second\r\n").is_err());
    }

    #[test]
    fn test_wire_lines_round_trip_shape() {
        let response = Response::new(250, vec!["a".into(), "b".into()]);
        assert_eq!(response.wire_lines(), vec!["250-a", "250 b"]);
        assert_eq!(response.summary(), "250 a / b");
    }

    #[test]
    fn test_classification() {
        assert!(Response::new(250, vec![]).is_success());
        assert!(Response::new(354, vec![]).is_intermediate());
        assert!(Response::new(451, vec![]).is_temporary_error());
        assert!(Response::new(550, vec![]).is_permanent_error());
    }
}
