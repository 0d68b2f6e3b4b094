//! Logs-cursor slots: tailing subscriptions with client-acknowledged
//! progress and deletion replay.
//!
//! A slot walks EMPTY → REQUESTED → READY → (confirm) → EMPTY. The host
//! services REQUESTED slots between machine steps; the reorg engine calls
//! into a slot *before* deleting logs so the client observes every deletion
//! between two confirms. Each slot has its own mutex; the host, the reorg
//! engine, and the client all synchronize on it and nothing else.

use avmcore_types::{Value, U256};
use parking_lot::Mutex;

/// Client-visible state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogsCursorStatus {
    /// No outstanding request.
    Empty,
    /// A request is waiting for the host to service it.
    Requested,
    /// Logs (or deletions) are buffered for the client.
    Ready,
    /// The slot is parked on an error until `clear_error`.
    Error,
}

/// Everything a `get` hands to the client.
#[derive(Debug, Clone)]
pub struct LogsCursorLogs {
    /// Stream index of `logs[0]`.
    pub first_log_index: U256,
    /// New logs since the confirmed position.
    pub logs: Vec<Value>,
    /// Logs deleted by reorgs since the last confirm, newest first.
    pub deleted_logs: Vec<Value>,
}

pub(crate) struct LogsCursorInner {
    pub status: LogsCursorStatus,
    pub requested_count: U256,
    pub data: Vec<Value>,
    pub deleted_data: Vec<Value>,
    /// The position `confirm` will persist: confirmed total plus everything
    /// handed out via `get`.
    pub pending_total_count: U256,
    pub error_string: String,
}

/// One logs-cursor slot.
pub(crate) struct LogsCursor {
    pub inner: Mutex<LogsCursorInner>,
}

impl LogsCursor {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LogsCursorInner {
                status: LogsCursorStatus::Empty,
                requested_count: U256::zero(),
                data: Vec::new(),
                deleted_data: Vec::new(),
                pending_total_count: U256::zero(),
                error_string: String::new(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_slot_is_empty() {
        let slot = LogsCursor::new();
        let inner = slot.inner.lock();
        assert_eq!(inner.status, LogsCursorStatus::Empty);
        assert!(inner.data.is_empty());
        assert!(inner.deleted_data.is_empty());
    }
}
