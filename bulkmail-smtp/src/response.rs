//! SMTP response parsing: multi-line status codes and continuation lines.

use bulkmail_common::error::Error;

/// A single status line within a (possibly multi-line) SMTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ResponseLine {
    code: u16,
    is_last: bool,
    message: String,
}

/// A complete SMTP response, potentially spanning multiple lines sharing one code.
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

    #[must_use]
    pub const fn is_temporary_error(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    #[must_use]
    pub const fn is_permanent_error(&self) -> bool {
        self.code >= 500 && self.code < 600
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.is_temporary_error() || self.is_permanent_error()
    }

    fn parse_line(line: &str) -> Result<ResponseLine, Error> {
        if line.len() < 3 {
            return Err(Error::Internal(format!("response line too short: {line:?}")));
        }

        let code_str = &line[..3];
        let code = code_str
            .parse::<u16>()
            .map_err(|_| Error::Internal(format!("invalid status code: {code_str:?}")))?;

        let is_last = match line.len() > 3 {
            true => match line.chars().nth(3) {
                Some(' ') => true,
                Some('-') => false,
                Some(c) => {
                    return Err(Error::Internal(format!("invalid separator character: {c:?}")));
                }
                None => true,
            },
            false => true,
        };

        let message = if line.len() > 4 {
            line[4..].to_string()
        } else {
            String::new()
        };

        Ok(ResponseLine {
            code,
            is_last,
            message,
        })
    }

    /// Parses a complete response from `buffer`, returning the response and
    /// the number of bytes consumed, or `None` if more data is needed.
    pub fn parse(buffer: &[u8]) -> Result<Option<(Self, usize)>, Error> {
        let text =
            std::str::from_utf8(buffer).map_err(|e| Error::Internal(format!("non-utf8 response: {e}")))?;

        let mut lines = Vec::new();
        let mut consumed = 0;
        let mut first_code = None;
        let mut complete = false;

        for line in text.lines() {
            if !text[consumed..].starts_with(line) {
                break;
            }
            consumed += line.len();
            if text[consumed..].starts_with("\r\n") {
                consumed += 2;
            } else if text[consumed..].starts_with('\n') {
                consumed += 1;
            } else {
                break;
            }

            if line.is_empty() {
                continue;
            }

            let parsed = Self::parse_line(line)?;
            if let Some(code) = first_code {
                if parsed.code != code {
                    return Err(Error::Internal(format!(
                        "status code mismatch in multi-line response: expected {code}, got {}",
                        parsed.code
                    )));
                }
            } else {
                first_code = Some(parsed.code);
            }

            lines.push(parsed.message);

            if parsed.is_last {
                complete = true;
                break;
            }
        }

        if complete {
            Ok(first_code.map(|code| (Self::new(code, lines), consumed)))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_line_response() {
        let (resp, consumed) = Response::parse(b"250 OK\r\n").unwrap().unwrap();
        assert_eq!(resp.code, 250);
        assert_eq!(resp.lines, vec!["OK"]);
        assert_eq!(consumed, 8);
    }

    #[test]
    fn parses_multi_line_response() {
        let data = b"250-mail.example.com\r\n250-SIZE 10000000\r\n250 HELP\r\n";
        let (resp, _) = Response::parse(data).unwrap().unwrap();
        assert_eq!(resp.code, 250);
        assert_eq!(resp.lines, vec!["mail.example.com", "SIZE 10000000", "HELP"]);
    }

    #[test]
    fn incomplete_response_needs_more_data() {
        let data = b"250-mail.example.com\r\n250-SIZE";
        assert!(Response::parse(data).unwrap().is_none());
    }

    #[test]
    fn classifies_status_ranges() {
        assert!(Response::new(250, vec!["OK".into()]).is_success());
        assert!(Response::new(450, vec!["busy".into()]).is_temporary_error());
        assert!(Response::new(550, vec!["no such user".into()]).is_permanent_error());
        assert!(Response::new(550, vec![]).is_error());
    }

    #[test]
    fn rejects_mismatched_multiline_codes() {
        let data = b"250-first\r\n251 second\r\n";
        assert!(Response::parse(data).is_err());
    }
}
