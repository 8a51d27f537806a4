//! End-to-end intake → authorization → dispatch → reply tests against an
//! in-memory mailbox and a recording sender.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use printd::auth::{AuthPolicy, PolicyValue};
use printd::config::TimingConfig;
use printd::daemon::{Daemon, Shutdown};
use printd::dispatch::{Dispatcher, Job, JobContext, JobKind, LogCapture};
use printd::error::TransportError;
use printd::intake::{Intake, IntakeState, MessageFlags};
use printd::jobs::print::{HELP_TEXT, PrintConfig, PrintJobKind};
use printd::mail::{IncomingMail, OutgoingMail, Recipient};
use printd::reply::{GENERIC_FAILURE_TEXT, Identity};
use printd::transport::{Flag, IdleOutcome, MailSender, MailStore, StoreConnector};

const BOT: &str = "print@example.com";
const ADMIN: &str = "postmaster@example.com";

// ── Fakes ───────────────────────────────────────────────────────────

#[derive(Default)]
struct Mailbox {
    messages: BTreeMap<u32, (Vec<u8>, MessageFlags)>,
    /// Simulates a server that accepts flag changes but keeps reporting the
    /// message as unseen.
    ignore_seen: bool,
    /// This many flag additions fail with a connection reset.
    failing_claims: usize,
    uid_validity: Option<u32>,
    fetches: usize,
}

impl Mailbox {
    fn state(&self, uid: u32) -> IntakeState {
        IntakeState::from_flags(self.messages[&uid].1)
    }
}

#[derive(Clone, Default)]
struct MemoryStore {
    mailbox: Arc<Mutex<Mailbox>>,
    /// Idle requests shutdown on this handle.
    shutdown: Option<Shutdown>,
}

impl MemoryStore {
    fn deliver(&self, uid: u32, raw: &str) {
        self.deliver_with_flags(uid, raw, MessageFlags::default());
    }

    fn deliver_with_flags(&self, uid: u32, raw: &str, flags: MessageFlags) {
        self.mailbox
            .lock()
            .unwrap()
            .messages
            .insert(uid, (raw.as_bytes().to_vec(), flags));
    }

    fn state(&self, uid: u32) -> IntakeState {
        self.mailbox.lock().unwrap().state(uid)
    }

    fn set_flags(&mut self, uid: u32, flags: &[Flag], value: bool) -> Result<(), TransportError> {
        let mut mailbox = self.mailbox.lock().unwrap();
        let entry = mailbox
            .messages
            .get_mut(&uid)
            .ok_or_else(|| TransportError::Protocol(format!("no UID {uid}")))?;
        for flag in flags {
            match flag {
                Flag::Seen => entry.1.seen = value,
                Flag::Flagged => entry.1.flagged = value,
            }
        }
        assert!(entry.1.is_consistent(), "flagged without seen on UID {uid}");
        Ok(())
    }
}

impl MailStore for MemoryStore {
    fn search_unseen(&mut self) -> Result<Vec<u32>, TransportError> {
        let mailbox = self.mailbox.lock().unwrap();
        Ok(mailbox
            .messages
            .iter()
            .filter(|(_, (_, flags))| mailbox.ignore_seen || !flags.seen)
            .map(|(uid, _)| *uid)
            .collect())
    }

    fn search_claimed(&mut self) -> Result<Vec<u32>, TransportError> {
        let mailbox = self.mailbox.lock().unwrap();
        Ok(mailbox
            .messages
            .iter()
            .filter(|(_, (_, flags))| flags.seen && flags.flagged)
            .map(|(uid, _)| *uid)
            .collect())
    }

    fn uid_validity(&self) -> Option<u32> {
        self.mailbox.lock().unwrap().uid_validity
    }

    fn fetch(&mut self, uid: u32) -> Result<Vec<u8>, TransportError> {
        let mut mailbox = self.mailbox.lock().unwrap();
        mailbox.fetches += 1;
        let (raw, flags) = &mailbox.messages[&uid];
        assert!(flags.seen && flags.flagged, "UID {uid} fetched before it was claimed");
        Ok(raw.clone())
    }

    fn add_flags(&mut self, uid: u32, flags: &[Flag]) -> Result<(), TransportError> {
        {
            let mut mailbox = self.mailbox.lock().unwrap();
            if mailbox.failing_claims > 0 {
                mailbox.failing_claims -= 1;
                return Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into());
            }
        }
        self.set_flags(uid, flags, true)
    }

    fn remove_flags(&mut self, uid: u32, flags: &[Flag]) -> Result<(), TransportError> {
        self.set_flags(uid, flags, false)
    }

    fn idle(&mut self, _timeout: Duration, _shutdown: &Shutdown) -> Result<IdleOutcome, TransportError> {
        if let Some(shutdown) = &self.shutdown {
            shutdown.request();
        }
        Ok(IdleOutcome::Shutdown)
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

#[derive(Default)]
struct RecordingSender {
    sent: Mutex<Vec<OutgoingMail>>,
}

impl RecordingSender {
    fn sent(&self) -> Vec<OutgoingMail> {
        self.sent.lock().unwrap().clone()
    }

    fn sent_to(&self, address: &str) -> Vec<OutgoingMail> {
        self.sent()
            .into_iter()
            .filter(|m| m.is_addressed_to(address))
            .collect()
    }
}

impl MailSender for RecordingSender {
    fn send(&self, mail: OutgoingMail) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(mail);
        Ok(())
    }
}

/// Replies twice and succeeds, or fails, depending on the subject.
struct EchoKind;

struct EchoJob {
    fail: bool,
}

impl Job for EchoJob {
    fn handle(&mut self, ctx: &mut JobContext) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("echo backend unavailable");
        }
        ctx.respond("first", Vec::new(), true);
        ctx.respond("second", Vec::new(), false);
        ctx.set_success(true);
        Ok(())
    }
}

impl JobKind for EchoKind {
    fn prefix(&self) -> &str {
        "[ECHO] "
    }

    fn create(&self, mail: &IncomingMail) -> anyhow::Result<Box<dyn Job>> {
        Ok(Box::new(EchoJob {
            fail: mail.subject.contains("fail"),
        }))
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn policy(entries: &[(&str, PolicyValue)]) -> AuthPolicy {
    AuthPolicy::new(
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect::<HashMap<_, _>>(),
    )
}

fn allow(sender: &str) -> AuthPolicy {
    policy(&[(sender, PolicyValue::Flag(true))])
}

fn dispatcher(policy: AuthPolicy, kind: Box<dyn JobKind>, sender: Arc<RecordingSender>) -> Dispatcher {
    Dispatcher::new(
        Identity::new(BOT, Some("Print".into()), ADMIN),
        policy,
        kind,
        sender,
        LogCapture::new(),
    )
}

fn raw_mail(from: &str, subject: &str, extra_headers: &str, body: &str) -> String {
    let id: String = subject.chars().filter(|c| c.is_ascii_alphanumeric() || *c == '-').collect();
    format!(
        "From: {from}\r\nTo: {BOT}\r\nSubject: {subject}\r\nMessage-ID: <{id}-1@example.com>\r\n{extra_headers}\r\n{body}\r\n"
    )
}

fn pass(store: &mut MemoryStore, dispatcher: &Dispatcher) -> usize {
    Intake::new()
        .process_unseen(store, dispatcher, &Shutdown::new())
        .unwrap()
}

// ── Canonical scenarios ─────────────────────────────────────────────

#[test]
fn alice_asks_for_help() {
    let sender = Arc::new(RecordingSender::default());
    let d = dispatcher(
        allow("alice@example.com"),
        Box::new(PrintJobKind::new(&PrintConfig::default())),
        sender.clone(),
    );
    let mut store = MemoryStore::default();
    store.deliver(1, &raw_mail("alice@example.com", "Help", "", ""));

    assert_eq!(pass(&mut store, &d), 1);

    let sent = sender.sent();
    assert_eq!(sent.len(), 1);
    let reply = &sent[0];
    assert_eq!(reply.body, HELP_TEXT);
    assert!(reply.is_addressed_to("alice@example.com"));
    assert!(!reply.is_bcc_admin());
    assert!(reply.attachments.is_empty());
    assert_eq!(reply.subject, "Re: Help");
    assert_eq!(reply.references.as_deref(), Some("<Help-1@example.com>"));
    assert_eq!(store.state(1), IntakeState::Done);
}

#[test]
fn mallory_is_not_authorized() {
    let sender = Arc::new(RecordingSender::default());
    let d = dispatcher(allow("alice@example.com"), Box::new(EchoKind), sender.clone());
    let mut store = MemoryStore::default();
    store.deliver(1, &raw_mail("mallory@example.com", "Help", "", ""));

    pass(&mut store, &d);

    assert!(sender.sent_to("mallory@example.com").is_empty());
    let sent = sender.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].is_admin_only());
    assert_eq!(sent[0].to, vec![Recipient::Admin]);
    assert_eq!(store.state(1), IntakeState::Claimed);
}

#[test]
fn wildcard_deny_blocks_everyone_without_entry() {
    let sender = Arc::new(RecordingSender::default());
    let d = dispatcher(
        policy(&[("ALL", PolicyValue::Flag(false))]),
        Box::new(EchoKind),
        sender.clone(),
    );
    let mut store = MemoryStore::default();
    store.deliver(1, &raw_mail("bob@example.com", "hello", "", ""));

    pass(&mut store, &d);

    assert!(sender.sent_to("bob@example.com").is_empty());
    assert_eq!(store.state(1), IntakeState::Claimed);
}

#[test]
fn own_mail_creates_no_reply() {
    let sender = Arc::new(RecordingSender::default());
    let d = dispatcher(
        policy(&[("ALL", PolicyValue::Flag(true))]),
        Box::new(EchoKind),
        sender.clone(),
    );
    let mut store = MemoryStore::default();
    store.deliver(1, &raw_mail("Print <print@example.com>", "Re: Help", "", ""));

    pass(&mut store, &d);

    assert!(sender.sent().is_empty());
    assert_eq!(store.state(1), IntakeState::Done);
}

// ── Job outcomes ────────────────────────────────────────────────────

#[test]
fn failed_job_notifies_both_and_stays_claimed() {
    let sender = Arc::new(RecordingSender::default());
    let d = dispatcher(allow("alice@example.com"), Box::new(EchoKind), sender.clone());
    let mut store = MemoryStore::default();
    store.deliver(4, &raw_mail("alice@example.com", "please-fail", "", ""));

    pass(&mut store, &d);

    let to_alice = sender.sent_to("alice@example.com");
    assert_eq!(to_alice.len(), 1);
    assert_eq!(to_alice[0].body, GENERIC_FAILURE_TEXT);
    assert_eq!(to_alice[0].references.as_deref(), Some("<please-fail-1@example.com>"));

    let to_admin: Vec<_> = sender.sent().into_iter().filter(|m| m.is_admin_only()).collect();
    assert_eq!(to_admin.len(), 1);
    assert!(to_admin[0].body.contains("echo backend unavailable"));
    assert_eq!(to_admin[0].references.as_deref(), Some("<please-fail-1@example.com>"));

    assert_eq!(store.state(4), IntakeState::Claimed);

    // never rediscovered
    assert_eq!(pass(&mut store, &d), 0);
    assert_eq!(sender.sent().len(), 2);
    assert_eq!(store.state(4), IntakeState::Claimed);
}

#[test]
fn successful_job_replies_once_and_completes() {
    let sender = Arc::new(RecordingSender::default());
    let d = dispatcher(allow("alice@example.com"), Box::new(EchoKind), sender.clone());
    let mut store = MemoryStore::default();
    store.deliver(2, &raw_mail("alice@example.com", "echo", "", ""));

    pass(&mut store, &d);
    pass(&mut store, &d);

    let bodies: Vec<_> = sender.sent().into_iter().map(|m| m.body).collect();
    assert_eq!(bodies, ["first", "second"]);
    assert!(sender.sent()[0].is_bcc_admin());
    assert_eq!(store.state(2), IntakeState::Done);
}

#[test]
fn message_reported_unseen_again_is_processed_once_per_run() {
    let sender = Arc::new(RecordingSender::default());
    let d = dispatcher(allow("alice@example.com"), Box::new(EchoKind), sender.clone());
    let mut store = MemoryStore::default();
    store.mailbox.lock().unwrap().ignore_seen = true;
    store.deliver(3, &raw_mail("alice@example.com", "echo", "", ""));

    let mut intake = Intake::new();
    let shutdown = Shutdown::new();
    assert_eq!(intake.process_unseen(&mut store, &d, &shutdown).unwrap(), 1);
    assert_eq!(intake.process_unseen(&mut store, &d, &shutdown).unwrap(), 0);

    assert_eq!(sender.sent().len(), 2);
    assert_eq!(store.mailbox.lock().unwrap().fetches, 1);
}

#[test]
fn failed_claim_is_retried_on_next_pass() {
    let sender = Arc::new(RecordingSender::default());
    let d = dispatcher(allow("alice@example.com"), Box::new(EchoKind), sender.clone());
    let mut store = MemoryStore::default();
    store.mailbox.lock().unwrap().failing_claims = 1;
    store.deliver(4, &raw_mail("alice@example.com", "echo", "", ""));

    let mut intake = Intake::new();
    let shutdown = Shutdown::new();
    assert!(matches!(
        intake.process_unseen(&mut store, &d, &shutdown),
        Err(TransportError::Io(_))
    ));
    assert_eq!(store.state(4), IntakeState::Unclaimed);

    assert_eq!(intake.process_unseen(&mut store, &d, &shutdown).unwrap(), 1);
    assert_eq!(store.state(4), IntakeState::Done);
    assert_eq!(sender.sent().len(), 2);
}

#[test]
fn message_unseen_again_after_being_dropped_is_reprocessed() {
    let sender = Arc::new(RecordingSender::default());
    let d = dispatcher(allow("alice@example.com"), Box::new(EchoKind), sender.clone());
    let mut store = MemoryStore::default();
    store.mailbox.lock().unwrap().ignore_seen = true;
    store.deliver(5, &raw_mail("alice@example.com", "echo", "", ""));

    let mut intake = Intake::new();
    let shutdown = Shutdown::new();
    assert_eq!(intake.process_unseen(&mut store, &d, &shutdown).unwrap(), 1);

    // server catches up and stops reporting it
    store.mailbox.lock().unwrap().ignore_seen = false;
    assert_eq!(intake.process_unseen(&mut store, &d, &shutdown).unwrap(), 0);

    // operator clears \Seen to request another run
    store.remove_flags(5, &[Flag::Seen, Flag::Flagged]).unwrap();
    assert_eq!(intake.process_unseen(&mut store, &d, &shutdown).unwrap(), 1);
    assert_eq!(sender.sent().len(), 4);
}

#[test]
fn uid_validity_change_forgets_claimed_uids() {
    let sender = Arc::new(RecordingSender::default());
    let d = dispatcher(allow("alice@example.com"), Box::new(EchoKind), sender.clone());
    let mut store = MemoryStore::default();
    {
        let mut mailbox = store.mailbox.lock().unwrap();
        mailbox.ignore_seen = true;
        mailbox.uid_validity = Some(1);
    }
    store.deliver(1, &raw_mail("alice@example.com", "echo", "", ""));

    let mut intake = Intake::new();
    let shutdown = Shutdown::new();
    assert_eq!(intake.process_unseen(&mut store, &d, &shutdown).unwrap(), 1);
    assert_eq!(intake.process_unseen(&mut store, &d, &shutdown).unwrap(), 0);

    // folder recreated: UID 1 now names a different message
    store.mailbox.lock().unwrap().uid_validity = Some(2);
    store.deliver(1, &raw_mail("alice@example.com", "echo again", "", ""));
    assert_eq!(intake.process_unseen(&mut store, &d, &shutdown).unwrap(), 1);
    assert_eq!(sender.sent().len(), 4);
}

#[test]
fn message_claimed_by_crashed_run_is_left_alone() {
    let sender = Arc::new(RecordingSender::default());
    let d = dispatcher(allow("alice@example.com"), Box::new(EchoKind), sender.clone());
    let mut store = MemoryStore::default();
    store.deliver_with_flags(
        9,
        &raw_mail("alice@example.com", "echo", "", ""),
        MessageFlags {
            seen: true,
            flagged: true,
        },
    );

    assert_eq!(pass(&mut store, &d), 0);
    assert!(sender.sent().is_empty());
    assert_eq!(store.search_claimed().unwrap(), vec![9]);
}

// ── DKIM ────────────────────────────────────────────────────────────

#[test]
fn dkim_pass_authorizes_and_fail_denies() {
    let sender = Arc::new(RecordingSender::default());
    let d = dispatcher(
        policy(&[("alice@example.com", PolicyValue::Mode("dkim".into()))]),
        Box::new(PrintJobKind::new(&PrintConfig::default())),
        sender.clone(),
    );
    let mut store = MemoryStore::default();
    store.deliver(
        1,
        &raw_mail(
            "alice@example.com",
            "help",
            "Authentication-Results: mx.example.com; dkim=pass header.d=example.com\r\n",
            "",
        ),
    );
    store.deliver(
        2,
        &raw_mail(
            "alice@example.com",
            "help",
            "Authentication-Results: mx.example.com; dkim=fail header.d=example.com\r\n",
            "",
        ),
    );
    store.deliver(3, &raw_mail("alice@example.com", "help", "", ""));

    pass(&mut store, &d);

    assert_eq!(sender.sent_to("alice@example.com").len(), 1);
    assert_eq!(store.state(1), IntakeState::Done);
    assert_eq!(store.state(2), IntakeState::Claimed);
    assert_eq!(store.state(3), IntakeState::Claimed);
}

// ── Printing ────────────────────────────────────────────────────────

#[cfg(unix)]
#[test]
fn pdf_attachment_is_printed_with_options() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("job");
    let config = PrintConfig {
        command: vec![
            "sh".into(),
            "-c".into(),
            r#"printf '%s\n' "$@" > "$0.args"; cat > "$0""#.into(),
            out.to_string_lossy().into_owned(),
        ],
    };
    let sender = Arc::new(RecordingSender::default());
    let d = dispatcher(
        allow("alice@example.com"),
        Box::new(PrintJobKind::new(&config)),
        sender.clone(),
    );

    let body = "--XX\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
-o fit-to-page\r\n\
--XX\r\n\
Content-Type: application/pdf\r\n\
Content-Disposition: attachment; filename=\"flyer.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
JVBERi0xLjQK\r\n\
--XX--";
    let mut store = MemoryStore::default();
    store.deliver(
        1,
        &raw_mail(
            "alice@example.com",
            "flyer",
            "MIME-Version: 1.0\r\nContent-Type: multipart/mixed; boundary=\"XX\"\r\n",
            body,
        ),
    );

    pass(&mut store, &d);

    assert!(sender.sent().is_empty());
    assert_eq!(store.state(1), IntakeState::Done);
    assert_eq!(std::fs::read(&out).unwrap(), b"%PDF-1.4\n");
    let args = std::fs::read_to_string(dir.path().join("job.args")).unwrap();
    assert_eq!(args, "-t\nflyer.pdf\n-o\nfit-to-page\n--\n-\n");
}

// ── Daemon ──────────────────────────────────────────────────────────

struct MemoryConnector(MemoryStore);

impl StoreConnector for MemoryConnector {
    fn connect(&self) -> Result<Box<dyn MailStore>, TransportError> {
        Ok(Box::new(self.0.clone()))
    }
}

#[test]
fn daemon_processes_mail_then_stops_on_shutdown() {
    let shutdown = Shutdown::new();
    let store = MemoryStore {
        shutdown: Some(shutdown.clone()),
        ..MemoryStore::default()
    };
    store.deliver(1, &raw_mail("alice@example.com", "Help", "", ""));
    store.deliver(2, &raw_mail("mallory@example.com", "Help", "", ""));

    let sender = Arc::new(RecordingSender::default());
    let d = dispatcher(
        allow("alice@example.com"),
        Box::new(PrintJobKind::new(&PrintConfig::default())),
        sender.clone(),
    );
    Daemon::new(
        Box::new(MemoryConnector(store.clone())),
        d,
        TimingConfig::default(),
        shutdown,
    )
    .run();

    assert_eq!(store.state(1), IntakeState::Done);
    assert_eq!(store.state(2), IntakeState::Claimed);
    assert_eq!(sender.sent_to("alice@example.com").len(), 1);
    assert!(sender.sent_to("mallory@example.com").is_empty());
}
