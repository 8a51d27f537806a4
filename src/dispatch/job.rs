//! Job capability: the pluggable unit of work behind the dispatcher.

use tracing::warn;

use crate::mail::{Attachment, IncomingMail, OutgoingMail};
use crate::reply;

/// Work done for one inbound message.
///
/// A job reports through its [`JobContext`]: queued replies, and the success
/// flag that decides whether the message is marked done. Returning an error
/// (or panicking) sends the failure notices instead.
pub trait Job: Send {
    fn handle(&mut self, ctx: &mut JobContext) -> anyhow::Result<()>;
}

/// Builds jobs from inbound mail.
pub trait JobKind: Send + Sync {
    /// Subject prefix for admin notices, e.g. `[PRINT] `.
    fn prefix(&self) -> &str;

    fn create(&self, mail: &IncomingMail) -> anyhow::Result<Box<dyn Job>>;
}

/// Per-dispatch state handed to a running job.
#[derive(Debug, Clone)]
pub struct JobContext {
    sender: String,
    subject: String,
    message_id: Option<String>,
    prefix: String,
    success: bool,
    replies: Vec<OutgoingMail>,
}

impl JobContext {
    pub fn new(mail: &IncomingMail, prefix: &str) -> Self {
        Self {
            sender: mail.sender_or_empty().to_string(),
            subject: mail.subject.clone(),
            message_id: mail.message_id.clone(),
            prefix: prefix.to_string(),
            success: false,
            replies: Vec::new(),
        }
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn set_success(&mut self, success: bool) {
        self.success = success;
    }

    pub fn replies(&self) -> &[OutgoingMail] {
        &self.replies
    }

    pub fn take_replies(&mut self) -> Vec<OutgoingMail> {
        std::mem::take(&mut self.replies)
    }

    /// Queue a notice for the administrator. `{sender}` and `{subject}` in
    /// the subject are replaced with the originating mail's values.
    pub fn admin_mail(&mut self, subject: &str, text: &str) {
        let subject = subject
            .replace("{sender}", &self.sender)
            .replace("{subject}", &self.subject);
        warn!("Error: {}", text.chars().take(80).collect::<String>());
        self.replies.push(reply::admin_notice(
            &self.prefix,
            &subject,
            self.message_id.as_deref(),
            text,
        ));
    }

    /// Queue a reply to the sender.
    pub fn respond(&mut self, text: &str, attachments: Vec<Attachment>, bcc_admin: bool) {
        self.replies.push(reply::response(
            &self.sender,
            &self.subject,
            self.message_id.as_deref(),
            text,
            attachments,
            bcc_admin,
        ));
    }
}
