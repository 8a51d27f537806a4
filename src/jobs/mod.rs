//! Bundled job kinds.

pub mod print;

pub use print::{PrintConfig, PrintJob, PrintJobKind};
