//! Mail transport: the I/O boundary.
//!
//! Inbound: a [`MailStore`] session on one folder, opened by a
//! [`StoreConnector`]. Outbound: a [`MailSender`] that submits one message per
//! call. No policy and no retries live here.

pub mod framed;
pub mod imap;
pub mod smtp;

use std::time::Duration;

use crate::daemon::Shutdown;
use crate::error::TransportError;
use crate::mail::OutgoingMail;

pub use imap::{ImapConnector, ImapSession};
pub use smtp::SmtpSender;

/// Message flags the engine reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    Seen,
    Flagged,
}

impl Flag {
    /// IMAP system flag name.
    pub fn as_imap(&self) -> &'static str {
        match self {
            Self::Seen => "\\Seen",
            Self::Flagged => "\\Flagged",
        }
    }
}

/// Why an idle wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleOutcome {
    /// The server reported a mailbox change.
    Activity,
    /// The maximum wait elapsed.
    Timeout,
    /// Shutdown was requested while waiting.
    Shutdown,
}

/// An authenticated session on the monitored folder.
pub trait MailStore: Send {
    /// UIDs of messages that are neither deleted nor seen.
    fn search_unseen(&mut self) -> Result<Vec<u32>, TransportError>;

    /// UIDs of messages left seen and flagged, i.e. claimed but never
    /// completed.
    fn search_claimed(&mut self) -> Result<Vec<u32>, TransportError>;

    /// UIDVALIDITY of the selected folder, when the server reported one.
    /// UIDs from sessions with different values do not name the same
    /// messages.
    fn uid_validity(&self) -> Option<u32> {
        None
    }

    /// Full raw message. Must not set `\Seen` implicitly.
    fn fetch(&mut self, uid: u32) -> Result<Vec<u8>, TransportError>;

    fn add_flags(&mut self, uid: u32, flags: &[Flag]) -> Result<(), TransportError>;

    fn remove_flags(&mut self, uid: u32, flags: &[Flag]) -> Result<(), TransportError>;

    /// Block until the server pushes a change, `timeout` elapses, or shutdown
    /// is requested.
    fn idle(&mut self, timeout: Duration, shutdown: &Shutdown) -> Result<IdleOutcome, TransportError>;

    /// Log out. Safe to call more than once.
    fn disconnect(&mut self) -> Result<(), TransportError>;
}

/// Opens [`MailStore`] sessions.
pub trait StoreConnector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn MailStore>, TransportError>;
}

/// Submits outgoing mail.
pub trait MailSender: Send + Sync {
    fn send(&self, mail: OutgoingMail) -> Result<(), TransportError>;
}
