//! Outgoing mail: what jobs and the dispatcher queue for sending.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// A recipient of an outgoing mail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    /// A concrete address (`user@example.com` or `Name <user@example.com>`).
    Address(String),
    /// The configured administrator; resolved by the transport at send time.
    Admin,
}

impl Recipient {
    pub fn address(addr: impl Into<String>) -> Self {
        Self::Address(addr.into())
    }
}

/// Where the bytes of an attachment come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentSource {
    /// Already in memory.
    Data(Vec<u8>),
    /// Read from disk when the mail is composed.
    Path(PathBuf),
}

/// A file attached to an outgoing mail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub source: AttachmentSource,
}

impl Attachment {
    pub fn from_data(filename: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            source: AttachmentSource::Data(data),
        }
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            filename: path.to_string_lossy().into_owned(),
            source: AttachmentSource::Path(path),
        }
    }

    /// Filename without any directory components.
    pub fn basename(&self) -> String {
        Path::new(&self.filename)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.filename.clone())
    }
}

/// A mail to be handed to the transport.
///
/// `from` and `date` may be left empty; the transport fills them in. An empty
/// `to` list means "send to the administrator".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    pub from: Option<String>,
    pub to: Vec<Recipient>,
    pub cc: Vec<Recipient>,
    pub bcc: Vec<Recipient>,
    pub date: Option<SystemTime>,
    /// Message-Id of the mail this one threads under.
    pub references: Option<String>,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<Attachment>,
    /// Build as multipart/mixed with an inline text part even without attachments.
    pub multipart: bool,
}

impl OutgoingMail {
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            from: None,
            to: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            date: None,
            references: None,
            subject: subject.into(),
            body: body.into(),
            attachments: Vec::new(),
            multipart: false,
        }
    }

    pub fn to(mut self, recipient: Recipient) -> Self {
        self.to.push(recipient);
        self
    }

    pub fn bcc(mut self, recipient: Recipient) -> Self {
        self.bcc.push(recipient);
        self
    }

    pub fn references(mut self, message_id: Option<String>) -> Self {
        self.references = message_id;
        self
    }

    pub fn attach(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self.multipart = true;
        self
    }

    pub fn multipart(mut self) -> Self {
        self.multipart = true;
        self
    }

    /// Whether the administrator receives a blind copy.
    pub fn is_bcc_admin(&self) -> bool {
        self.bcc.contains(&Recipient::Admin)
    }

    /// Whether the mail goes to `address` as a To recipient.
    pub fn is_addressed_to(&self, address: &str) -> bool {
        self.to
            .iter()
            .any(|r| matches!(r, Recipient::Address(a) if a.eq_ignore_ascii_case(address)))
    }

    /// Whether the administrator is the (implicit or explicit) To recipient.
    pub fn is_admin_only(&self) -> bool {
        self.to.iter().all(|r| *r == Recipient::Admin) && self.cc.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_basename_strips_directories() {
        let att = Attachment::from_path("/var/spool/out/report.pdf");
        assert_eq!(att.basename(), "report.pdf");
        assert_eq!(
            att.source,
            AttachmentSource::Path(PathBuf::from("/var/spool/out/report.pdf"))
        );
    }

    #[test]
    fn attaching_forces_multipart() {
        let mail = OutgoingMail::new("s", "b").attach(Attachment::from_data("a.txt", vec![1]));
        assert!(mail.multipart);
        assert_eq!(mail.attachments.len(), 1);
    }

    #[test]
    fn empty_to_is_admin_only() {
        let notice = OutgoingMail::new("s", "b");
        assert!(notice.is_admin_only());
        let reply = OutgoingMail::new("s", "b").to(Recipient::address("alice@example.com"));
        assert!(!reply.is_admin_only());
        assert!(reply.is_addressed_to("Alice@Example.com"));
    }

    #[test]
    fn bcc_admin_marker() {
        let mail = OutgoingMail::new("s", "b").bcc(Recipient::Admin);
        assert!(mail.is_bcc_admin());
        assert!(!OutgoingMail::new("s", "b").is_bcc_admin());
    }
}
