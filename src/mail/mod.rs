//! Inbound mail model: a fetched message reduced to what the engine and
//! jobs need (sender, subject, threading id, auth results and body parts).

pub mod mime;
pub mod outgoing;

use mail_parser::{Message, MessageParser, MimeHeaders, PartType};

pub use outgoing::{Attachment, AttachmentSource, OutgoingMail, Recipient};

/// One leaf part of an inbound message (multipart containers are skipped).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailPart {
    /// `type/subtype`, lowercased. Defaults to `text/plain`.
    pub content_type: String,
    /// Filename from Content-Disposition / Content-Type, if any.
    pub filename: Option<String>,
    /// Decoded body.
    pub body: Vec<u8>,
}

impl MailPart {
    /// Top-level media type (`text` for `text/plain`).
    pub fn main_type(&self) -> &str {
        self.content_type
            .split_once('/')
            .map_or(self.content_type.as_str(), |(main, _)| main)
    }

    /// Filename to use when the part has none: derived from its content type,
    /// `unknown.bin` when the type is unknown.
    pub fn effective_filename(&self) -> String {
        if let Some(name) = &self.filename {
            return name.clone();
        }
        match mime::extension_for(&self.content_type) {
            Some(ext) => format!(".{ext}"),
            None => "unknown.bin".to_string(),
        }
    }

    /// Body as UTF-8 text, if it decodes.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

/// A parsed inbound message.
#[derive(Debug, Clone)]
pub struct IncomingMail {
    /// Server-assigned IMAP UID.
    pub uid: u32,
    /// Bare sender address from the From header.
    pub sender: Option<String>,
    /// Subject line (empty when absent).
    pub subject: String,
    /// Message-Id header including angle brackets.
    pub message_id: Option<String>,
    /// Raw value of the topmost Authentication-Results header.
    pub authentication_results: Option<String>,
    /// Leaf body parts in document order.
    pub parts: Vec<MailPart>,
}

/// Raw value of the topmost header named `name`, the one the receiving MTA
/// prepended. `Message::header_raw` returns the last occurrence instead.
fn first_header_raw(parsed: &Message<'_>, raw: &[u8], name: &str) -> Option<String> {
    let header = parsed
        .headers()
        .iter()
        .find(|h| h.name().eq_ignore_ascii_case(name))?;
    let value = raw.get(header.offset_start as usize..header.offset_end as usize)?;
    Some(String::from_utf8_lossy(value).trim().to_string())
}

impl IncomingMail {
    /// Parse a raw RFC 5322 message. Returns `None` if the bytes are not a
    /// message at all.
    pub fn parse(uid: u32, raw: &[u8]) -> Option<Self> {
        let parsed = MessageParser::default().parse(raw)?;

        let sender = parsed
            .from()
            .and_then(|addr| addr.first())
            .and_then(|a| a.address())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let parts = parsed
            .parts
            .iter()
            .filter(|part| !matches!(part.body, PartType::Multipart(_)))
            .map(|part| MailPart {
                content_type: MimeHeaders::content_type(part)
                    .map(|ct| match ct.subtype() {
                        Some(sub) => format!("{}/{}", ct.ctype(), sub),
                        None => ct.ctype().to_string(),
                    })
                    .unwrap_or_else(|| "text/plain".to_string())
                    .to_ascii_lowercase(),
                filename: MimeHeaders::attachment_name(part).map(|s| s.to_string()),
                body: part.contents().to_vec(),
            })
            .collect();

        Some(Self {
            uid,
            sender,
            subject: parsed.subject().unwrap_or_default().to_string(),
            message_id: parsed.message_id().map(|id| format!("<{id}>")),
            authentication_results: first_header_raw(&parsed, raw, "Authentication-Results"),
            parts,
        })
    }

    /// Sender address, or the empty string when none parsed.
    pub fn sender_or_empty(&self) -> &str {
        self.sender.as_deref().unwrap_or_default()
    }
}
