//! Framed I/O for the IMAP protocol.
//!
//! IMAP responses are CRLF-terminated lines that may embed literals
//! (`{n}\r\n` followed by exactly `n` bytes). Reads go through an internal
//! buffer so a read timeout never loses a partial line.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use rustls::{ClientConnection, StreamOwned};

use crate::error::TransportError;

/// Bytes requested from the socket per read.
const READ_CHUNK: usize = 8192;

/// Maximum line length to prevent memory exhaustion.
const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Maximum literal size to prevent memory exhaustion.
const MAX_LITERAL_SIZE: usize = 100 * 1024 * 1024;

/// A byte stream an IMAP session can run over.
pub trait ImapStream: Read + Write + Send {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;
}

impl ImapStream for TcpStream {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }
}

impl ImapStream for StreamOwned<ClientConnection, TcpStream> {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.sock.set_read_timeout(timeout)
    }
}

/// Server completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    No,
    Bad,
    Bye,
    PreAuth,
}

impl Status {
    fn parse(word: &str) -> Option<Self> {
        match word.to_ascii_uppercase().as_str() {
            "OK" => Some(Self::Ok),
            "NO" => Some(Self::No),
            "BAD" => Some(Self::Bad),
            "BYE" => Some(Self::Bye),
            "PREAUTH" => Some(Self::PreAuth),
            _ => None,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ok => "OK",
            Self::No => "NO",
            Self::Bad => "BAD",
            Self::Bye => "BYE",
            Self::PreAuth => "PREAUTH",
        };
        write!(f, "{s}")
    }
}

/// One complete server response: the line text (literal bodies removed,
/// `{n}` markers kept) and the literal bodies in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub line: String,
    pub literals: Vec<Vec<u8>>,
}

/// What kind of response a line is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseKind<'a> {
    /// `* ...`
    Untagged(&'a str),
    /// `+ ...`
    Continuation(&'a str),
    /// `<tag> <status> <text>`
    Tagged {
        tag: &'a str,
        status: Status,
        text: &'a str,
    },
}

impl Response {
    pub fn kind(&self) -> Result<ResponseKind<'_>, TransportError> {
        let line = self.line.trim_end_matches(['\r', '\n']);
        if let Some(rest) = line.strip_prefix("* ") {
            return Ok(ResponseKind::Untagged(rest));
        }
        if line == "*" {
            return Ok(ResponseKind::Untagged(""));
        }
        if let Some(rest) = line.strip_prefix('+') {
            return Ok(ResponseKind::Continuation(rest.trim_start()));
        }
        let mut words = line.splitn(3, ' ');
        let tag = words.next().unwrap_or_default();
        let status = words
            .next()
            .and_then(Status::parse)
            .ok_or_else(|| TransportError::Protocol(format!("malformed response: {line}")))?;
        Ok(ResponseKind::Tagged {
            tag,
            status,
            text: words.next().unwrap_or_default(),
        })
    }

    /// Untagged `BYE`, if this is one.
    pub fn bye_text(&self) -> Option<&str> {
        match self.kind() {
            Ok(ResponseKind::Untagged(rest)) => {
                let (word, text) = rest.split_once(' ').unwrap_or((rest, ""));
                word.eq_ignore_ascii_case("BYE").then_some(text)
            }
            _ => None,
        }
    }
}

/// Buffered IMAP connection.
pub struct FramedStream<S> {
    stream: S,
    buffer: Vec<u8>,
}

impl<S: ImapStream> FramedStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: Vec::with_capacity(READ_CHUNK),
        }
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Unwrap the stream. Fails if unread server data is buffered, which
    /// would be lost (e.g. injected after a STARTTLS response).
    pub fn into_inner(self) -> Result<S, TransportError> {
        if !self.buffer.is_empty() {
            return Err(TransportError::Protocol(
                "unexpected data buffered before TLS upgrade".to_string(),
            ));
        }
        Ok(self.stream)
    }

    /// Read one complete response including any literals.
    pub fn read_response(&mut self) -> Result<Response, TransportError> {
        let mut line = String::new();
        let mut literals = Vec::new();

        loop {
            let chunk = self.read_line()?;
            let text = String::from_utf8_lossy(&chunk);
            line.push_str(&text);

            match parse_literal_length(&chunk) {
                Some(len) => {
                    if len > MAX_LITERAL_SIZE {
                        return Err(TransportError::Protocol(format!(
                            "literal too large: {len} bytes (max {MAX_LITERAL_SIZE})"
                        )));
                    }
                    literals.push(self.read_exact(len)?);
                }
                None => break,
            }
        }

        Ok(Response { line, literals })
    }

    /// Write a line, appending CRLF.
    pub fn write_line(&mut self, data: &str) -> Result<(), TransportError> {
        self.stream.write_all(data.as_bytes())?;
        self.stream.write_all(b"\r\n")?;
        self.stream.flush()?;
        Ok(())
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<(), TransportError> {
        self.stream.set_read_timeout(timeout)?;
        Ok(())
    }

    fn read_line(&mut self) -> Result<Vec<u8>, TransportError> {
        loop {
            if let Some(pos) = find_crlf(&self.buffer) {
                let line: Vec<u8> = self.buffer.drain(..pos + 2).collect();
                return Ok(line);
            }
            if self.buffer.len() > MAX_LINE_LENGTH {
                return Err(TransportError::Protocol("line too long".to_string()));
            }
            self.fill()?;
        }
    }

    fn read_exact(&mut self, len: usize) -> Result<Vec<u8>, TransportError> {
        while self.buffer.len() < len {
            self.fill()?;
        }
        Ok(self.buffer.drain(..len).collect())
    }

    fn fill(&mut self) -> Result<(), TransportError> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.stream.read(&mut chunk)?;
        if n == 0 {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed",
            )));
        }
        self.buffer.extend_from_slice(&chunk[..n]);
        Ok(())
    }
}

/// Whether an error is a read timeout rather than a failure.
pub fn is_timeout(error: &TransportError) -> bool {
    matches!(
        error,
        TransportError::Io(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
    )
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// `{123}\r\n` or `{123+}\r\n` at the end of a line → 123.
fn parse_literal_length(line: &[u8]) -> Option<usize> {
    let line = line.strip_suffix(b"\r\n")?;
    let line = line.strip_suffix(b"}")?;
    let open = line.iter().rposition(|&b| b == b'{')?;
    let digits = &line[open + 1..];
    let digits = digits.strip_suffix(b"+").unwrap_or(digits);
    if digits.is_empty() {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// Quote a string for use as an IMAP quoted string.
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}
