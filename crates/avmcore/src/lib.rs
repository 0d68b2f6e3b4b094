//! Persistent execution core of a deterministic stack-based virtual
//! machine.
//!
//! [`AvmCore`] owns the live machine and a single background thread that
//! consumes a totally ordered message inbox, appends two output streams
//! (logs and sends), and checkpoints full machine state at sideload gas
//! boundaries. Upstream inbox reorganizations rewind the catalog, the
//! outputs, and the live machine to a consistent prefix and replay.
//! Concurrent readers observe history through [`ExecutionCursor`]s (by gas)
//! and logs cursors (by index), both isolated by consistent storage
//! snapshots.

pub mod config;
mod core;
mod execution_cursor;
mod logs_cursor;

pub use config::CoreConfig;
pub use crate::core::{AvmCore, LoadedExecutable, MessagesStatus};
pub use execution_cursor::ExecutionCursor;
pub use logs_cursor::{LogsCursorLogs, LogsCursorStatus};

pub use avmcore_store::ValueCache;
