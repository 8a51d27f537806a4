//! Reply composer: builds outgoing mails for jobs and the dispatcher, and
//! turns them into wire-ready MIME messages for the transport.

use std::time::SystemTime;

use lettre::Message;
use lettre::message::header::{self, ContentDisposition, ContentTransferEncoding, ContentType};
use lettre::message::{Mailbox, MultiPart, SinglePart};
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::ComposeError;
use crate::mail::mime;
use crate::mail::{Attachment, AttachmentSource, IncomingMail, OutgoingMail, Recipient};

/// Sent to a sender whose job failed. Details go to the administrator only.
pub const GENERIC_FAILURE_TEXT: &str = "Unfortunately an error occurred while processing your request.\n\
Please contact your administrator.\n";

/// Who the bot is and who administers it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// The bot's own address.
    pub address: String,
    /// Display name for From.
    pub name: Option<String>,
    /// Administrator address.
    pub admin: String,
}

impl Identity {
    pub fn new(address: impl Into<String>, name: Option<String>, admin: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name,
            admin: admin.into(),
        }
    }

    /// `Name <address>` or the bare address.
    pub fn from_header(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => format!("{name} <{}>", self.address),
            _ => self.address.clone(),
        }
    }

    /// Whether `sender` is (or contains) the bot's own address.
    pub fn is_own_address(&self, sender: &str) -> bool {
        sender
            .to_ascii_lowercase()
            .contains(&self.address.to_ascii_lowercase())
    }

    /// Domain part of the bot address, for Message-Id generation.
    pub fn domain(&self) -> &str {
        self.address
            .rsplit_once('@')
            .map_or("localhost", |(_, domain)| domain)
    }

    /// Resolve the admin marker into the real address.
    pub fn resolve<'a>(&'a self, recipient: &'a Recipient) -> &'a str {
        match recipient {
            Recipient::Address(addr) => addr,
            Recipient::Admin => &self.admin,
        }
    }
}

/// `Re: <subject>`.
pub fn reply_subject(subject: &str) -> String {
    format!("Re: {subject}")
}

/// A reply to the sender of a job, threaded under the original message.
pub fn response(
    sender: &str,
    subject: &str,
    message_id: Option<&str>,
    text: &str,
    attachments: Vec<Attachment>,
    bcc_admin: bool,
) -> OutgoingMail {
    let mut mail = OutgoingMail::new(reply_subject(subject), text)
        .to(Recipient::address(sender))
        .references(message_id.map(str::to_string))
        .multipart();
    if bcc_admin {
        mail = mail.bcc(Recipient::Admin);
    }
    for attachment in attachments {
        mail = mail.attach(attachment);
    }
    mail
}

/// A notice for the administrator only, subject tagged with the job prefix.
pub fn admin_notice(prefix: &str, subject: &str, message_id: Option<&str>, text: &str) -> OutgoingMail {
    OutgoingMail::new(format!("{prefix}{subject}"), text)
        .to(Recipient::Admin)
        .references(message_id.map(str::to_string))
}

/// Tell the administrator a sender without permission tried to submit a job.
pub fn unauthorized_notice(prefix: &str, mail: &IncomingMail) -> OutgoingMail {
    admin_notice(
        prefix,
        &format!("Unauthorized attempt from {}", mail.sender_or_empty()),
        mail.message_id.as_deref(),
        "",
    )
}

/// Generic "something went wrong" reply to the sender of a failed job.
pub fn failure_notice(mail: &IncomingMail) -> OutgoingMail {
    OutgoingMail::new(reply_subject(&mail.subject), GENERIC_FAILURE_TEXT)
        .to(Recipient::address(mail.sender_or_empty()))
        .references(mail.message_id.clone())
}

/// Build the MIME message: fill From/Date, resolve the admin marker, thread
/// via References, and lay out text + attachments.
pub fn compose(mail: &OutgoingMail, identity: &Identity) -> Result<Message, ComposeError> {
    let from = mail.from.clone().unwrap_or_else(|| identity.from_header());

    let mut builder = Message::builder()
        .from(parse_mailbox(&from)?)
        .subject(mail.subject.as_str())
        .date(mail.date.unwrap_or_else(SystemTime::now))
        .message_id(Some(format!("<{}@{}>", Uuid::new_v4(), identity.domain())));

    if mail.to.is_empty() {
        builder = builder.to(parse_mailbox(&identity.admin)?);
    }
    for recipient in &mail.to {
        builder = builder.to(parse_mailbox(identity.resolve(recipient))?);
    }
    for recipient in &mail.cc {
        builder = builder.cc(parse_mailbox(identity.resolve(recipient))?);
    }
    for recipient in &mail.bcc {
        builder = builder.bcc(parse_mailbox(identity.resolve(recipient))?);
    }
    if let Some(refs) = &mail.references {
        builder = builder.header(header::References::from(refs.clone()));
    }

    let message = if mail.multipart || !mail.attachments.is_empty() {
        let text = SinglePart::builder()
            .header(ContentType::TEXT_PLAIN)
            .header(ContentDisposition::inline())
            .body(mail.body.clone());
        let mut multipart = MultiPart::mixed().singlepart(text);
        for attachment in &mail.attachments {
            if let Some(part) = attachment_part(attachment)? {
                multipart = multipart.singlepart(part);
            }
        }
        builder.multipart(multipart)
    } else {
        builder.body(mail.body.clone())
    };

    message.map_err(|e| ComposeError::Build(e.to_string()))
}

/// One base64 attachment part, or `None` if its data can't be found.
fn attachment_part(attachment: &Attachment) -> Result<Option<SinglePart>, ComposeError> {
    debug!(filename = %attachment.filename, "Attaching file");
    let data = match &attachment.source {
        AttachmentSource::Data(data) => data.clone(),
        AttachmentSource::Path(path) => match std::fs::read(path) {
            Ok(data) => data,
            Err(e) => {
                error!(path = %path.display(), error = %e, "No data for file, skipping attachment");
                return Ok(None);
            }
        },
    };

    let filename = attachment.basename();
    let ctype = mime::content_type_for(&filename);
    let content_type =
        ContentType::parse(ctype).map_err(|_| ComposeError::InvalidContentType(ctype.to_string()))?;

    Ok(Some(
        SinglePart::builder()
            .header(content_type)
            .header(ContentDisposition::attachment(&filename))
            .header(ContentTransferEncoding::Base64)
            .body(data),
    ))
}

fn parse_mailbox(address: &str) -> Result<Mailbox, ComposeError> {
    address
        .trim()
        .parse()
        .map_err(|e: lettre::address::AddressError| ComposeError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })
}
