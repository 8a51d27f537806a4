//! Job dispatcher: runs one job per authorized message inside a
//! failure-capturing envelope and sends what it produced.

pub mod capture;
pub mod job;

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Once};

use tracing::{error, info, warn};

use crate::auth::AuthPolicy;
use crate::mail::{IncomingMail, OutgoingMail};
use crate::reply::{self, Identity};
use crate::transport::MailSender;

pub use capture::{CaptureGuard, CaptureLayer, LogCapture};
pub use job::{Job, JobContext, JobKind};

/// What happened to one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Mail from the bot itself; not processed.
    Ignored,
    /// Sender not allowed; the administrator was notified.
    Unauthorized,
    /// The job ran and its replies were sent.
    Completed { success: bool },
    /// The job failed; failure notices were sent.
    Failed,
}

/// A job failure rendered for the administrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    /// One-line description.
    pub summary: String,
    /// Cause chain and stack trace.
    pub detail: String,
}

impl JobFailure {
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self {
            summary: format!("{err:#}"),
            detail: format!("{err:?}"),
        }
    }

    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        let backtrace = LAST_PANIC
            .with(|slot| slot.borrow_mut().take())
            .unwrap_or_else(|| "<no backtrace captured>".to_string());
        Self {
            summary: format!("job panicked: {message}"),
            detail: format!("panicked: {message}\n\nStack backtrace:\n{backtrace}"),
        }
    }
}

thread_local! {
    static LAST_PANIC: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chain a hook that records the panicking thread's backtrace.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let backtrace = Backtrace::force_capture().to_string();
            LAST_PANIC.with(|slot| *slot.borrow_mut() = Some(backtrace));
            previous(info);
        }));
    });
}

/// Turns authorized messages into jobs and their replies into mail.
pub struct Dispatcher {
    identity: Identity,
    policy: AuthPolicy,
    kind: Box<dyn JobKind>,
    sender: Arc<dyn MailSender>,
    capture: LogCapture,
}

impl Dispatcher {
    /// `capture` must be the handle whose [`LogCapture::layer`] is installed
    /// in the subscriber; admin reports carry whatever it records.
    pub fn new(
        identity: Identity,
        policy: AuthPolicy,
        kind: Box<dyn JobKind>,
        sender: Arc<dyn MailSender>,
        capture: LogCapture,
    ) -> Self {
        install_panic_hook();
        Self {
            identity,
            policy,
            kind,
            sender,
            capture,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Process one message. Never fails: job errors become notices.
    pub fn handle(&self, mail: &IncomingMail) -> DispatchOutcome {
        let sender = mail.sender_or_empty();
        if !sender.is_empty() && self.identity.is_own_address(sender) {
            info!(uid = mail.uid, "Ignoring mail from own address");
            return DispatchOutcome::Ignored;
        }

        if !self.policy.authorize(mail) {
            warn!(sender = %sender, "Unauthorized attempt");
            self.send_notice(reply::unauthorized_notice(self.kind.prefix(), mail));
            return DispatchOutcome::Unauthorized;
        }

        let guard = self.capture.begin();
        let result = self.run(mail);
        let log = guard.contents();
        drop(guard);

        match result {
            Ok(success) => DispatchOutcome::Completed { success },
            Err(failure) => {
                error!(sender = %sender, error = %failure.summary, "Job failed");
                self.send_notice(reply::failure_notice(mail));
                self.send_notice(reply::admin_notice(
                    self.kind.prefix(),
                    &format!("Error while processing a request from {sender}"),
                    mail.message_id.as_deref(),
                    &format!("{}\n\n{}\n\n{}", failure.summary, failure.detail, log),
                ));
                DispatchOutcome::Failed
            }
        }
    }

    /// Build and run the job, then send its replies in order.
    fn run(&self, mail: &IncomingMail) -> Result<bool, JobFailure> {
        let mut ctx = JobContext::new(mail, self.kind.prefix());
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut job = self.kind.create(mail)?;
            job.handle(&mut ctx)
        }));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(JobFailure::from_error(&err)),
            Err(payload) => return Err(JobFailure::from_panic(payload)),
        }
        info!("Job completed.");

        for reply in ctx.take_replies() {
            self.sender
                .send(reply)
                .map_err(|e| JobFailure::from_error(&anyhow::Error::new(e).context("sending reply")))?;
        }
        Ok(ctx.success())
    }

    fn send_notice(&self, notice: OutgoingMail) {
        if let Err(e) = self.sender.send(notice) {
            error!(error = %e, "Failed to send notice");
        }
    }
}
