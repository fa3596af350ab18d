/// STOMP 1.2 wire codec, the subset the room broker speaks
///
/// One frame per WebSocket text message: command line, header lines,
/// blank line, body, NUL terminator. A bare LF is a heart-beat.
use crate::error::{ChatError, Result};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCommand {
    Connect,
    Connected,
    Subscribe,
    Unsubscribe,
    Send,
    Message,
    Receipt,
    Error,
    Disconnect,
}

impl FrameCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameCommand::Connect => "CONNECT",
            FrameCommand::Connected => "CONNECTED",
            FrameCommand::Subscribe => "SUBSCRIBE",
            FrameCommand::Unsubscribe => "UNSUBSCRIBE",
            FrameCommand::Send => "SEND",
            FrameCommand::Message => "MESSAGE",
            FrameCommand::Receipt => "RECEIPT",
            FrameCommand::Error => "ERROR",
            FrameCommand::Disconnect => "DISCONNECT",
        }
    }

    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "CONNECT" => Ok(FrameCommand::Connect),
            "CONNECTED" => Ok(FrameCommand::Connected),
            "SUBSCRIBE" => Ok(FrameCommand::Subscribe),
            "UNSUBSCRIBE" => Ok(FrameCommand::Unsubscribe),
            "SEND" => Ok(FrameCommand::Send),
            "MESSAGE" => Ok(FrameCommand::Message),
            "RECEIPT" => Ok(FrameCommand::Receipt),
            "ERROR" => Ok(FrameCommand::Error),
            "DISCONNECT" => Ok(FrameCommand::Disconnect),
            other => Err(ChatError::Protocol(format!(
                "Unknown frame command: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for FrameCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: FrameCommand,
    headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: FrameCommand) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First header with the given name, unescaped
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Serialize for the wire
    pub fn to_wire(&self) -> String {
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            out.push_str(&escape_header(name));
            out.push(':');
            out.push_str(&escape_header(value));
            out.push('\n');
        }
        if !self.body.is_empty() {
            out.push_str("content-length:");
            out.push_str(&self.body.len().to_string());
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Parse one frame from a WebSocket text payload.
    ///
    /// Returns `Ok(None)` for heart-beats (empty payload or bare LF).
    pub fn parse(raw: &str) -> Result<Option<Frame>> {
        let raw = raw.strip_suffix('\0').unwrap_or(raw);
        if raw.trim_matches(|c| c == '\n' || c == '\r').is_empty() {
            return Ok(None);
        }

        let (head, body) = if let Some((head, body)) = raw.split_once("\r\n\r\n") {
            (head, body)
        } else if let Some((head, body)) = raw.split_once("\n\n") {
            (head, body)
        } else {
            (raw, "")
        };

        let mut lines = head.lines().map(|l| l.strip_suffix('\r').unwrap_or(l));
        let command_line = lines
            .next()
            .ok_or_else(|| ChatError::Protocol("Empty frame".to_string()))?;
        let command = FrameCommand::from_str(command_line.trim())?;

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line.split_once(':').ok_or_else(|| {
                ChatError::Protocol(format!("Malformed header line: {}", line))
            })?;
            headers.push((unescape_header(name)?, unescape_header(value)?));
        }

        Ok(Some(Frame {
            command,
            headers,
            body: body.to_string(),
        }))
    }
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            other => {
                return Err(ChatError::Protocol(format!(
                    "Bad header escape: \\{}",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}
