//! printd: a mailbox-driven job daemon.
//!
//! Watches one IMAP folder, authorizes each new mail's sender, runs a job
//! for it and mails the results back. Message state lives entirely in the
//! `\Seen` and `\Flagged` flags on the server.

pub mod auth;
pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod error;
pub mod intake;
pub mod jobs;
pub mod mail;
pub mod reply;
pub mod transport;
