//! Sender authorization: decides whether a mail's sender may submit jobs.
//!
//! The policy table maps a sender address (or the wildcard `ALL`) to a mode:
//!
//! - `true` / `false`
//! - `"1"`, `"true"`, `"on"`, `"yes"` (any case) → allow
//! - `"dkim"` → allow only if the mail's Authentication-Results report `dkim=pass`
//! - anything else → deny

use std::collections::HashMap;

use serde::Deserialize;
use serde::de::IgnoredAny;
use tracing::{debug, info};

use crate::mail::IncomingMail;

/// Policy key matching every sender without an entry of its own.
pub const WILDCARD: &str = "ALL";

const TRUTHY: &[&str] = &["1", "true", "on", "yes"];

/// Authorization mode for one sender.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PolicyValue {
    Flag(bool),
    Mode(String),
    /// Any other TOML value; always denies.
    Unsupported(IgnoredAny),
}

/// Static sender → mode table.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct AuthPolicy {
    entries: HashMap<String, PolicyValue>,
}

impl AuthPolicy {
    pub fn new(entries: HashMap<String, PolicyValue>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Policy for a sender: exact entry, then a case-insensitive one, then
    /// `ALL`. Among keys differing only in case the smallest wins.
    pub fn lookup(&self, sender: &str) -> Option<&PolicyValue> {
        if sender == WILDCARD {
            return self.entries.get(WILDCARD);
        }
        self.entries
            .get(sender)
            .or_else(|| {
                self.entries
                    .iter()
                    .filter(|(key, _)| key.as_str() != WILDCARD && key.eq_ignore_ascii_case(sender))
                    .min_by(|(a, _), (b, _)| a.cmp(b))
                    .map(|(_, value)| value)
            })
            .or_else(|| self.entries.get(WILDCARD))
    }

    /// Check if the sender of `mail` may use this service.
    pub fn authorize(&self, mail: &IncomingMail) -> bool {
        let Some(sender) = mail.sender.as_deref() else {
            info!("No sender address");
            return false;
        };

        let Some(policy) = self.lookup(sender) else {
            info!(sender = %sender, "Sender not authorized");
            return false;
        };

        match policy {
            PolicyValue::Flag(allowed) => {
                if !allowed {
                    info!(sender = %sender, "Sender not authorized");
                }
                *allowed
            }
            PolicyValue::Mode(mode) => {
                let mode = mode.trim();
                if TRUTHY.iter().any(|t| t.eq_ignore_ascii_case(mode)) {
                    true
                } else if mode.eq_ignore_ascii_case("dkim") {
                    let observed = mail
                        .authentication_results
                        .as_deref()
                        .and_then(dkim_result);
                    if observed.as_deref() == Some("pass") {
                        true
                    } else {
                        debug!(
                            sender = %sender,
                            result = observed.as_deref().unwrap_or("<none>"),
                            "Could not verify sender via DKIM"
                        );
                        false
                    }
                } else {
                    info!(sender = %sender, mode = %mode, "Sender not authorized");
                    false
                }
            }
            PolicyValue::Unsupported(_) => {
                info!(sender = %sender, "Unsupported policy value, denying");
                false
            }
        }
    }
}

/// Extract the `dkim=` result from an Authentication-Results header value.
///
/// `mx.example.com; dkim=pass header.d=example.com; spf=fail` → `pass`.
/// The result is lowercased; properties and comments after it are dropped.
pub fn dkim_result(header: &str) -> Option<String> {
    header.split(';').find_map(|segment| {
        let (key, value) = segment.trim().split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("dkim") {
            return None;
        }
        let token = value
            .trim()
            .trim_matches('"')
            .split(|c: char| c.is_whitespace() || c == '(')
            .next()
            .unwrap_or_default()
            .trim_matches('"');
        Some(token.to_ascii_lowercase())
    })
}
