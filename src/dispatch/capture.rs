//! Scoped log capture.
//!
//! A [`CaptureLayer`] is installed once in the global subscriber. While a
//! [`CaptureGuard`] is alive, every event at debug level or above, from any
//! thread, is appended to that guard's buffer. Dropping the guard detaches it.

use std::fmt::{self, Write as _};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

type Buffer = Arc<Mutex<String>>;

/// Handle shared between the subscriber layer and the dispatcher.
#[derive(Clone, Default)]
pub struct LogCapture {
    active: Arc<Mutex<Option<Buffer>>>,
}

impl LogCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Layer to register with the subscriber.
    pub fn layer(&self) -> CaptureLayer {
        CaptureLayer {
            active: Arc::clone(&self.active),
        }
    }

    /// Start capturing into a fresh buffer until the guard drops.
    pub fn begin(&self) -> CaptureGuard {
        let buffer: Buffer = Arc::default();
        let previous = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Arc::clone(&buffer));
        CaptureGuard {
            active: Arc::clone(&self.active),
            buffer,
            previous,
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// An active capture scope.
pub struct CaptureGuard {
    active: Arc<Mutex<Option<Buffer>>>,
    buffer: Buffer,
    previous: Option<Buffer>,
}

impl CaptureGuard {
    /// Everything captured so far.
    pub fn contents(&self) -> String {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = self.previous.take();
    }
}

/// Subscriber layer feeding the active capture buffer.
pub struct CaptureLayer {
    active: Arc<Mutex<Option<Buffer>>>,
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if *meta.level() > Level::DEBUG {
            return;
        }
        let Some(buffer) = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        else {
            return;
        };

        let mut line = LineVisitor::default();
        event.record(&mut line);
        let mut buffer = buffer.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = writeln!(
            buffer,
            "{} {}: {}{}",
            meta.level(),
            meta.target(),
            line.message,
            line.fields
        );
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}
