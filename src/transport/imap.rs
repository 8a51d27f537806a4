//! Blocking IMAP client session over rustls.
//!
//! Only the handful of commands the mailbot needs: LOGIN, SELECT,
//! UID SEARCH/FETCH/STORE, IDLE and LOGOUT.

use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls_pki_types::ServerName;
use rustls::{ClientConnection, StreamOwned};
use secrecy::ExposeSecret;
use tracing::{debug, info, warn};

use super::framed::{self, FramedStream, ImapStream, Response, ResponseKind, Status};
use super::{Flag, IdleOutcome, MailStore, StoreConnector};
use crate::config::{ImapConfig, TlsMode};
use crate::daemon::Shutdown;
use crate::error::TransportError;

/// Per-read timeout while a command is outstanding.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Read timeout while idling; bounds how long a shutdown request waits.
const IDLE_TICK: Duration = Duration::from_secs(1);

impl ImapStream for Box<dyn ImapStream> {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()> {
        (**self).set_read_timeout(timeout)
    }
}

/// Wrap a connected socket in a TLS client stream verified against the
/// webpki root store.
fn tls_wrap(host: &str, tcp: TcpStream) -> Result<StreamOwned<ClientConnection, TcpStream>, TransportError> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| TransportError::Tls(format!("invalid server name {host:?}: {e}")))?;
    let conn = ClientConnection::new(tls_config, server_name)
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    Ok(StreamOwned::new(conn, tcp))
}

/// Send one tagged command and collect untagged responses up to its
/// completion. Non-OK completion is an error.
fn run_command<S: ImapStream>(
    stream: &mut FramedStream<S>,
    tag: &str,
    command: &str,
    expect_bye: bool,
) -> Result<Vec<Response>, TransportError> {
    stream.write_line(&format!("{tag} {command}"))?;
    let verb = command.split(' ').take(2).collect::<Vec<_>>().join(" ");

    let mut untagged = Vec::new();
    loop {
        let response = stream.read_response()?;
        if let Some(text) = response.bye_text()
            && !expect_bye
        {
            return Err(TransportError::Bye(text.trim().to_string()));
        }
        match response.kind()? {
            ResponseKind::Tagged { tag: t, status, text } if t == tag => {
                if status != Status::Ok {
                    return Err(TransportError::Rejected {
                        command: verb,
                        status: status.to_string(),
                        text: text.trim().to_string(),
                    });
                }
                return Ok(untagged);
            }
            ResponseKind::Tagged { tag: other, .. } => {
                warn!(tag = %other, "Ignoring response with unknown tag");
            }
            _ => untagged.push(response),
        }
    }
}

/// Read the server greeting.
fn read_greeting<S: ImapStream>(stream: &mut FramedStream<S>) -> Result<(), TransportError> {
    let greeting = stream.read_response()?;
    if let Some(text) = greeting.bye_text() {
        return Err(TransportError::Bye(text.trim().to_string()));
    }
    match greeting.kind()? {
        ResponseKind::Untagged(_) => Ok(()),
        _ => Err(TransportError::Protocol(format!(
            "unexpected greeting: {}",
            greeting.line.trim_end()
        ))),
    }
}

/// An authenticated IMAP session with one folder selected.
pub struct ImapSession<S: ImapStream> {
    stream: FramedStream<S>,
    next_tag: u32,
    connected: bool,
    idle_supported: bool,
    uid_validity: Option<u32>,
}

impl ImapSession<Box<dyn ImapStream>> {
    /// Connect, secure, log in and select the configured folder.
    pub fn open(config: &ImapConfig) -> Result<Self, TransportError> {
        let port = config.port();
        let tcp = TcpStream::connect((config.host.as_str(), port)).map_err(|source| {
            TransportError::Connect {
                host: config.host.clone(),
                port,
                source,
            }
        })?;
        tcp.set_read_timeout(Some(COMMAND_TIMEOUT))?;

        let stream: Box<dyn ImapStream> = match config.tls {
            TlsMode::Tls => {
                let mut framed = FramedStream::new(tls_wrap(&config.host, tcp)?);
                read_greeting(&mut framed)?;
                Box::new(framed.into_inner()?)
            }
            TlsMode::Starttls => {
                let mut framed = FramedStream::new(tcp);
                read_greeting(&mut framed)?;
                run_command(&mut framed, "S0", "STARTTLS", false)?;
                let tcp = framed.into_inner()?;
                Box::new(tls_wrap(&config.host, tcp)?)
            }
        };

        let mut session = ImapSession::new(stream);
        session.login(&config.username, config.password.expose_secret())?;
        session.select(&config.folder)?;
        info!(host = %config.host, folder = %config.folder, "IMAP session established");
        Ok(session)
    }
}

impl<S: ImapStream> ImapSession<S> {
    /// Wrap a stream whose greeting has already been consumed.
    pub fn new(stream: S) -> Self {
        Self {
            stream: FramedStream::new(stream),
            next_tag: 0,
            connected: true,
            idle_supported: true,
            uid_validity: None,
        }
    }

    fn tag(&mut self) -> String {
        self.next_tag += 1;
        format!("A{}", self.next_tag)
    }

    fn command(&mut self, command: &str) -> Result<Vec<Response>, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        let tag = self.tag();
        let result = run_command(&mut self.stream, &tag, command, false);
        if matches!(result, Err(TransportError::Bye(_) | TransportError::Io(_))) {
            self.connected = false;
        }
        result
    }

    pub fn login(&mut self, username: &str, password: &str) -> Result<(), TransportError> {
        debug!(username = %username, "LOGIN");
        let command = format!("LOGIN {} {}", framed::quote(username), framed::quote(password));
        match self.command(&command) {
            Ok(_) => Ok(()),
            Err(TransportError::Rejected { text, .. }) => Err(TransportError::AuthFailed {
                username: username.to_string(),
                reason: text,
            }),
            Err(e) => Err(e),
        }
    }

    pub fn select(&mut self, folder: &str) -> Result<(), TransportError> {
        let responses = self.command(&format!("SELECT {}", framed::quote(folder)))?;
        self.uid_validity = parse_uid_validity(&responses);
        debug!(folder = %folder, uid_validity = ?self.uid_validity, "Folder selected");
        Ok(())
    }

    fn store(&mut self, uid: u32, op: char, flags: &[Flag]) -> Result<(), TransportError> {
        let list = flags.iter().map(Flag::as_imap).collect::<Vec<_>>().join(" ");
        self.command(&format!("UID STORE {uid} {op}FLAGS.SILENT ({list})"))?;
        Ok(())
    }

    fn wait_for_push(&mut self, deadline: Instant, shutdown: &Shutdown) -> Result<IdleOutcome, TransportError> {
        loop {
            if shutdown.is_requested() {
                return Ok(IdleOutcome::Shutdown);
            }
            if Instant::now() >= deadline {
                return Ok(IdleOutcome::Timeout);
            }
            match self.stream.read_response() {
                Ok(response) => {
                    if let Some(text) = response.bye_text() {
                        self.connected = false;
                        return Err(TransportError::Bye(text.trim().to_string()));
                    }
                    if let ResponseKind::Untagged(rest) = response.kind()?
                        && is_mailbox_change(rest)
                    {
                        debug!(update = %rest.trim(), "Mailbox changed");
                        return Ok(IdleOutcome::Activity);
                    }
                }
                Err(e) if framed::is_timeout(&e) => continue,
                Err(e) => {
                    self.connected = false;
                    return Err(e);
                }
            }
        }
    }
}

/// `3 EXISTS` or `1 RECENT`.
fn is_mailbox_change(untagged: &str) -> bool {
    let mut words = untagged.split_whitespace();
    let numeric = words.next().is_some_and(|w| w.parse::<u32>().is_ok());
    numeric
        && words
            .next()
            .is_some_and(|w| w.eq_ignore_ascii_case("EXISTS") || w.eq_ignore_ascii_case("RECENT"))
}

/// `* OK [UIDVALIDITY 3857529045] UIDs valid`
fn parse_uid_validity(responses: &[Response]) -> Option<u32> {
    responses.iter().find_map(|r| {
        let ResponseKind::Untagged(rest) = r.kind().ok()? else {
            return None;
        };
        let (status, code) = rest.split_once(' ')?;
        if !status.eq_ignore_ascii_case("OK") {
            return None;
        }
        let code = code.trim_start().strip_prefix('[')?;
        let (name, value) = code.split_once(' ')?;
        if !name.eq_ignore_ascii_case("UIDVALIDITY") {
            return None;
        }
        value.split(']').next()?.trim().parse().ok()
    })
}

fn parse_search(responses: &[Response]) -> Vec<u32> {
    responses
        .iter()
        .filter_map(|r| match r.kind() {
            Ok(ResponseKind::Untagged(rest)) => Some(rest.trim().to_string()),
            _ => None,
        })
        .filter_map(|rest| {
            let mut words = rest.split_whitespace();
            let first = words.next()?;
            first
                .eq_ignore_ascii_case("SEARCH")
                .then(|| words.filter_map(|w| w.parse().ok()).collect::<Vec<u32>>())
        })
        .flatten()
        .collect()
}

impl<S: ImapStream> MailStore for ImapSession<S> {
    fn search_unseen(&mut self) -> Result<Vec<u32>, TransportError> {
        let responses = self.command("UID SEARCH UNDELETED UNSEEN")?;
        Ok(parse_search(&responses))
    }

    fn search_claimed(&mut self) -> Result<Vec<u32>, TransportError> {
        let responses = self.command("UID SEARCH UNDELETED SEEN FLAGGED")?;
        Ok(parse_search(&responses))
    }

    fn uid_validity(&self) -> Option<u32> {
        self.uid_validity
    }

    fn fetch(&mut self, uid: u32) -> Result<Vec<u8>, TransportError> {
        let responses = self.command(&format!("UID FETCH {uid} (BODY.PEEK[])"))?;
        responses
            .into_iter()
            .find_map(|r| r.literals.into_iter().next())
            .ok_or_else(|| TransportError::Protocol(format!("no body returned for UID {uid}")))
    }

    fn add_flags(&mut self, uid: u32, flags: &[Flag]) -> Result<(), TransportError> {
        self.store(uid, '+', flags)
    }

    fn remove_flags(&mut self, uid: u32, flags: &[Flag]) -> Result<(), TransportError> {
        self.store(uid, '-', flags)
    }

    fn idle(&mut self, timeout: Duration, shutdown: &Shutdown) -> Result<IdleOutcome, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if !self.idle_supported {
            return Ok(if shutdown.sleep(timeout) {
                IdleOutcome::Timeout
            } else {
                IdleOutcome::Shutdown
            });
        }

        let deadline = Instant::now() + timeout;
        let tag = self.tag();
        self.stream.write_line(&format!("{tag} IDLE"))?;

        // Updates queued before the continuation still count as activity.
        let mut pending_change = false;
        loop {
            let response = self.stream.read_response()?;
            match response.kind()? {
                ResponseKind::Continuation(_) => break,
                ResponseKind::Untagged(rest) if is_mailbox_change(rest) => {
                    debug!(update = %rest.trim(), "Mailbox changed before idling");
                    pending_change = true;
                }
                ResponseKind::Tagged { tag: t, status, text } if t == tag => {
                    warn!(status = %status, text = %text.trim(), "Server refused IDLE, falling back to polling");
                    self.idle_supported = false;
                    return Ok(if shutdown.sleep(timeout) {
                        IdleOutcome::Timeout
                    } else {
                        IdleOutcome::Shutdown
                    });
                }
                _ => {}
            }
        }

        let outcome = if pending_change {
            IdleOutcome::Activity
        } else {
            self.stream.set_read_timeout(Some(IDLE_TICK))?;
            let outcome = self.wait_for_push(deadline, shutdown);
            self.stream.set_read_timeout(Some(COMMAND_TIMEOUT))?;
            outcome?
        };

        self.stream.write_line("DONE")?;
        loop {
            let response = self.stream.read_response()?;
            if let ResponseKind::Tagged { tag: t, status, text } = response.kind()?
                && t == tag
            {
                if status != Status::Ok {
                    return Err(TransportError::Rejected {
                        command: "IDLE".to_string(),
                        status: status.to_string(),
                        text: text.trim().to_string(),
                    });
                }
                break;
            }
        }
        Ok(outcome)
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        let tag = self.tag();
        run_command(&mut self.stream, &tag, "LOGOUT", true)?;
        debug!("IMAP logout complete");
        Ok(())
    }
}

impl<S: ImapStream> Drop for ImapSession<S> {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            debug!(error = %e, "Logout on drop failed");
        }
    }
}

/// Opens [`ImapSession`]s from the daemon configuration.
pub struct ImapConnector {
    config: ImapConfig,
}

impl ImapConnector {
    pub fn new(config: ImapConfig) -> Self {
        Self { config }
    }
}

impl StoreConnector for ImapConnector {
    fn connect(&self) -> Result<Box<dyn MailStore>, TransportError> {
        Ok(Box::new(ImapSession::open(&self.config)?))
    }
}
