// Response lines of the client protocol

use std::fmt;
use std::io::{self, Write};

/// Status codes sent at the start of every response line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    /// One record of a tether stats list
    TetheringStatsListResult = 114,
    CommandOkay = 200,
    /// The single record of a tether stats lookup
    TetheringStatsResult = 221,
    OperationFailed = 400,
    CommandSyntaxError = 500,
    CommandParameterError = 501,
}

impl ResponseCode {
    pub fn code(self) -> u16 {
        self as u16
    }
}

/// One newline-terminated status line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseLine {
    pub code: ResponseCode,
    pub body: String,
}

impl ResponseLine {
    pub fn new(code: ResponseCode, body: impl Into<String>) -> Self {
        Self {
            code,
            body: body.into(),
        }
    }

    /// Reply to a line command
    ///
    /// Command replies carry the command sequence number, which is always
    /// 0 since clients here do not number their commands.
    pub fn reply(code: ResponseCode, message: impl fmt::Display) -> Self {
        Self::new(code, format!("0 {}", message))
    }

    pub fn stats_completed() -> Self {
        Self::new(ResponseCode::CommandOkay, "Tethering stats list completed")
    }
}

impl fmt::Display for ResponseLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code.code(), self.body)
    }
}

/// Format every line into one buffer, then write it out in a single call
pub fn format_response(lines: &[ResponseLine]) -> String {
    lines.iter().map(|line| format!("{}\n", line)).collect()
}

pub fn write_response<W: Write + ?Sized>(out: &mut W, lines: &[ResponseLine]) -> io::Result<()> {
    out.write_all(format_response(lines).as_bytes())?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_lines() {
        let lines = vec![
            ResponseLine::new(
                ResponseCode::TetheringStatsListResult,
                "wlan0 rmnet0 1 2 3 4",
            ),
            ResponseLine::stats_completed(),
        ];
        assert_eq!(
            format_response(&lines),
            "114 wlan0 rmnet0 1 2 3 4\n200 Tethering stats list completed\n"
        );
    }

    #[test]
    fn test_reply() {
        let line = ResponseLine::reply(ResponseCode::CommandOkay, "Bandwidth command succeeded");
        assert_eq!(line.to_string(), "200 0 Bandwidth command succeeded");
        assert_eq!(ResponseCode::CommandParameterError.code(), 501);
    }

    #[test]
    fn test_write_response() {
        let mut out = Vec::new();
        write_response(&mut out, &[ResponseLine::stats_completed()]).unwrap();
        assert_eq!(out, b"200 Tethering stats list completed\n");

        let mut out = Vec::new();
        write_response(&mut out, &[]).unwrap();
        assert!(out.is_empty());
    }
}
