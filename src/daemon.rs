//! Poll/idle loop: the long-lived driver.
//!
//! An explicit state machine:
//!
//! ```text
//! Disconnected ──connect ok──▶ Polling ──▶ Idle ──activity/timeout──▶ Polling …
//!      ▲   └──connect failed──▶ Backoff ──sleep──┐
//!      └─────────────────────────────────────────┘
//! ```
//!
//! Every step runs behind one failure boundary: an error or panic anywhere
//! is logged and routes back to `Disconnected`.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::config::TimingConfig;
use crate::dispatch::Dispatcher;
use crate::error::TransportError;
use crate::intake::Intake;
use crate::transport::{IdleOutcome, MailStore, StoreConnector};

/// Granularity of interruptible sleeps.
const SLEEP_SLICE: Duration = Duration::from_secs(1);

/// Shared stop flag. Cheap to clone; all clones see the same flag.
#[derive(Debug, Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Sleep for `duration` in short slices. Returns `false` if shutdown was
    /// requested before the time was up.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_requested() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}

enum Phase {
    Disconnected,
    Backoff,
    Polling(Box<dyn MailStore>),
    Idle(Box<dyn MailStore>),
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Backoff => "backoff",
            Self::Polling(_) => "polling",
            Self::Idle(_) => "idle",
        }
    }
}

/// The mailbot daemon.
pub struct Daemon {
    connector: Box<dyn StoreConnector>,
    dispatcher: Dispatcher,
    intake: Intake,
    timing: TimingConfig,
    shutdown: Shutdown,
}

impl Daemon {
    pub fn new(
        connector: Box<dyn StoreConnector>,
        dispatcher: Dispatcher,
        timing: TimingConfig,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            connector,
            dispatcher,
            intake: Intake::new(),
            timing,
            shutdown,
        }
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Run until shutdown is requested. Nothing else ends the loop.
    pub fn run(mut self) {
        info!("Mailbot started");
        let mut phase = Phase::Disconnected;
        loop {
            if self.shutdown.is_requested() {
                if let Phase::Polling(mut store) | Phase::Idle(mut store) = phase
                    && let Err(e) = store.disconnect()
                {
                    warn!(error = %e, "Logout failed");
                }
                info!("Mailbot stopped");
                return;
            }

            let from = phase.name();
            phase = match panic::catch_unwind(AssertUnwindSafe(|| self.step(phase))) {
                Ok(Ok(next)) => next,
                Ok(Err(e)) => {
                    error!(phase = from, error = %e, "Mail loop failure, reconnecting");
                    Phase::Disconnected
                }
                Err(payload) => {
                    let message = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_default();
                    error!(phase = from, panic = %message, "Mail loop panicked, reconnecting");
                    Phase::Disconnected
                }
            };
        }
    }

    fn step(&mut self, phase: Phase) -> Result<Phase, TransportError> {
        match phase {
            Phase::Disconnected => match self.connector.connect() {
                Ok(mut store) => {
                    info!("Connected...");
                    self.report_stuck(store.as_mut())?;
                    Ok(Phase::Polling(store))
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        "Connection failure. Retrying in {}s",
                        self.timing.reconnect_backoff().as_secs()
                    );
                    Ok(Phase::Backoff)
                }
            },
            Phase::Backoff => {
                self.shutdown.sleep(self.timing.reconnect_backoff());
                Ok(Phase::Disconnected)
            }
            Phase::Polling(mut store) => {
                match self
                    .intake
                    .process_unseen(store.as_mut(), &self.dispatcher, &self.shutdown)
                {
                    Ok(count) => {
                        if count > 0 {
                            debug!(count, "Dispatched messages");
                        }
                        Ok(Phase::Idle(store))
                    }
                    Err(e) => abandon(store, e),
                }
            }
            Phase::Idle(mut store) => {
                match store.idle(self.timing.idle_timeout(), &self.shutdown) {
                    Ok(IdleOutcome::Activity) | Ok(IdleOutcome::Timeout) => Ok(Phase::Polling(store)),
                    Ok(IdleOutcome::Shutdown) => Ok(Phase::Idle(store)),
                    Err(e) => abandon(store, e),
                }
            }
        }
    }

    /// Messages an earlier run claimed but never completed are not retried;
    /// make them visible.
    fn report_stuck(&self, store: &mut dyn MailStore) -> Result<(), TransportError> {
        let stuck = store.search_claimed()?;
        if !stuck.is_empty() {
            warn!(
                count = stuck.len(),
                uids = ?stuck,
                "Messages left claimed by an interrupted or failed job; they will not be retried"
            );
        }
        Ok(())
    }
}

/// Best-effort logout, then surface the original error.
fn abandon(mut store: Box<dyn MailStore>, e: TransportError) -> Result<Phase, TransportError> {
    if let Err(logout) = store.disconnect() {
        debug!(error = %logout, "Logout after failure failed");
    }
    Err(e)
}

/// Run the daemon on the blocking pool. Request shutdown through the
/// [`Shutdown`] handle it was built with.
pub fn spawn_daemon(daemon: Daemon) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || daemon.run())
}

/// Wait for the daemon task, requesting shutdown when `interrupt` resolves.
/// An interrupt source that fails to register is logged and the daemon keeps
/// running.
pub async fn supervise<F>(
    mut handle: JoinHandle<()>,
    interrupt: F,
    shutdown: &Shutdown,
) -> Result<(), JoinError>
where
    F: std::future::Future<Output = std::io::Result<()>>,
{
    tokio::select! {
        result = interrupt => match result {
            Ok(()) => {
                info!("Interrupted, finishing current step");
                shutdown.request();
            }
            Err(e) => error!(error = %e, "Failed to listen for interrupt, running until the mail loop exits"),
        },
        result = &mut handle => return result,
    }
    handle.await
}
