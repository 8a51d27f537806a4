//! Intake state machine.
//!
//! The only durable state is two flags per message on the server:
//!
//! | state       | seen | flagged |
//! |-------------|------|---------|
//! | `Unclaimed` | no   | no      |
//! | `Claimed`   | yes  | yes     |
//! | `Done`      | yes  | no      |
//!
//! A message is claimed before anything else happens to it, and only a
//! successful dispatch clears `flagged`. A message whose processing died
//! stays claimed; it is already seen, so discovery never returns it again.

use std::collections::HashSet;

use tracing::{debug, error, info, warn};

use crate::daemon::Shutdown;
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::error::TransportError;
use crate::mail::IncomingMail;
use crate::transport::{Flag, MailStore};

/// The two persisted flags of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageFlags {
    pub seen: bool,
    pub flagged: bool,
}

impl MessageFlags {
    /// `flagged` implies `seen`.
    pub fn is_consistent(&self) -> bool {
        !self.flagged || self.seen
    }
}

/// Processing state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntakeState {
    /// Not yet picked up.
    Unclaimed,
    /// Picked up, not confirmed complete.
    Claimed,
    /// Processed successfully.
    Done,
}

impl IntakeState {
    /// State encoded by a flag pair. An unseen message is unclaimed whatever
    /// its `flagged` flag says.
    pub fn from_flags(flags: MessageFlags) -> Self {
        match (flags.seen, flags.flagged) {
            (false, _) => Self::Unclaimed,
            (true, true) => Self::Claimed,
            (true, false) => Self::Done,
        }
    }

    pub fn flags(&self) -> MessageFlags {
        match self {
            Self::Unclaimed => MessageFlags::default(),
            Self::Claimed => MessageFlags {
                seen: true,
                flagged: true,
            },
            Self::Done => MessageFlags {
                seen: true,
                flagged: false,
            },
        }
    }

    pub fn can_transition_to(&self, target: IntakeState) -> bool {
        use IntakeState::*;

        matches!(
            (self, target),
            (Unclaimed, Claimed) | (Claimed, Done) | (Claimed, Claimed)
        )
    }

    /// Where a claimed message goes after dispatch.
    pub fn after(outcome: DispatchOutcome) -> Self {
        match outcome {
            DispatchOutcome::Ignored | DispatchOutcome::Completed { success: true } => Self::Done,
            DispatchOutcome::Unauthorized
            | DispatchOutcome::Completed { success: false }
            | DispatchOutcome::Failed => Self::Claimed,
        }
    }
}

impl std::fmt::Display for IntakeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unclaimed => "unclaimed",
            Self::Claimed => "claimed",
            Self::Done => "done",
        };
        write!(f, "{s}")
    }
}

/// Mark a message seen and flagged.
pub fn claim(store: &mut dyn MailStore, uid: u32) -> Result<(), TransportError> {
    store.add_flags(uid, &[Flag::Seen, Flag::Flagged])
}

/// Clear `flagged` on a claimed message.
pub fn complete(store: &mut dyn MailStore, uid: u32) -> Result<(), TransportError> {
    store.remove_flags(uid, &[Flag::Flagged])
}

/// Discovers unseen messages, claims them and hands them to the dispatcher.
///
/// Remembers which UIDs it claimed so a message the server reports again in
/// the same run is not processed twice. A UID is forgotten once the server
/// stops reporting it unseen, and all are forgotten when the folder's
/// UIDVALIDITY changes.
#[derive(Debug, Default)]
pub struct Intake {
    dispatched: HashSet<u32>,
    uid_validity: Option<u32>,
}

impl Intake {
    pub fn new() -> Self {
        Self::default()
    }

    /// One discovery pass. Returns how many messages were dispatched.
    ///
    /// Transport errors abort the pass; the caller reconnects. Job failures
    /// never do.
    pub fn process_unseen(
        &mut self,
        store: &mut dyn MailStore,
        dispatcher: &Dispatcher,
        shutdown: &Shutdown,
    ) -> Result<usize, TransportError> {
        let validity = store.uid_validity();
        if validity != self.uid_validity {
            if !self.dispatched.is_empty() {
                info!(
                    old = ?self.uid_validity,
                    new = ?validity,
                    "UIDVALIDITY changed, forgetting claimed UIDs"
                );
            }
            self.dispatched.clear();
            self.uid_validity = validity;
        }

        let uids = store.search_unseen()?;
        if !uids.is_empty() {
            debug!(count = uids.len(), "Unseen messages");
        }
        let reported: HashSet<u32> = uids.iter().copied().collect();
        self.dispatched.retain(|uid| reported.contains(uid));

        let mut dispatched = 0;
        for uid in uids {
            if shutdown.is_requested() {
                info!("Shutdown requested, stopping intake");
                break;
            }
            if self.dispatched.contains(&uid) {
                warn!(uid, "Message reported unseen again, skipping");
                continue;
            }

            claim(store, uid)?;
            self.dispatched.insert(uid);
            let raw = store.fetch(uid)?;
            let Some(mail) = IncomingMail::parse(uid, &raw) else {
                error!(uid, "Could not parse message, leaving it claimed");
                continue;
            };

            let outcome = dispatcher.handle(&mail);
            dispatched += 1;
            let next = IntakeState::after(outcome);
            debug_assert!(IntakeState::Claimed.can_transition_to(next));
            match next {
                IntakeState::Done => complete(store, uid)?,
                _ => info!(uid, state = %next, "Message stays claimed"),
            }
        }
        Ok(dispatched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Flags ───────────────────────────────────────────────────────

    #[test]
    fn states_round_trip_through_flags() {
        for state in [IntakeState::Unclaimed, IntakeState::Claimed, IntakeState::Done] {
            assert!(state.flags().is_consistent());
            assert_eq!(IntakeState::from_flags(state.flags()), state);
        }
    }

    #[test]
    fn flagged_without_seen_is_inconsistent_and_unclaimed() {
        let odd = MessageFlags {
            seen: false,
            flagged: true,
        };
        assert!(!odd.is_consistent());
        assert_eq!(IntakeState::from_flags(odd), IntakeState::Unclaimed);
    }

    // ── Transitions ─────────────────────────────────────────────────

    #[test]
    fn valid_transitions() {
        use IntakeState::*;
        assert!(Unclaimed.can_transition_to(Claimed));
        assert!(Claimed.can_transition_to(Done));
        assert!(Claimed.can_transition_to(Claimed));
        assert!(!Unclaimed.can_transition_to(Done));
        assert!(!Done.can_transition_to(Claimed));
        assert!(!Done.can_transition_to(Unclaimed));
    }

    #[test]
    fn outcome_mapping() {
        assert_eq!(
            IntakeState::after(DispatchOutcome::Completed { success: true }),
            IntakeState::Done
        );
        assert_eq!(IntakeState::after(DispatchOutcome::Ignored), IntakeState::Done);
        assert_eq!(
            IntakeState::after(DispatchOutcome::Completed { success: false }),
            IntakeState::Claimed
        );
        assert_eq!(IntakeState::after(DispatchOutcome::Failed), IntakeState::Claimed);
        assert_eq!(IntakeState::after(DispatchOutcome::Unauthorized), IntakeState::Claimed);
    }

    #[test]
    fn display() {
        assert_eq!(IntakeState::Claimed.to_string(), "claimed");
        assert_eq!(IntakeState::Done.to_string(), "done");
    }
}
