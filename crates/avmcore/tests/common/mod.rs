//! Shared setup for integration tests: a core wired to the scripted
//! interpreter with test-friendly sleeps, plus polling helpers.
#![allow(dead_code)] // each test binary uses a different subset

use std::sync::Arc;
use std::time::{Duration, Instant};

use avmcore::{AvmCore, CoreConfig, LoadedExecutable, MessagesStatus};
use avmcore_harness::{test_ops, test_static, ScriptedInterp};
use avmcore_kv::KvStore;

pub fn test_config() -> CoreConfig {
    CoreConfig {
        idle_sleep: Duration::from_millis(1),
        reorg_retry_sleep: Duration::from_millis(5),
        ..CoreConfig::default()
    }
}

/// A fresh, initialized core (no background thread yet).
pub fn new_core() -> Arc<AvmCore> {
    let kv = Arc::new(KvStore::new());
    let core = AvmCore::new(kv, Arc::new(ScriptedInterp), test_config()).unwrap();
    core.initialize(&LoadedExecutable {
        code: test_ops(),
        static_val: test_static(),
    })
    .unwrap();
    core
}

/// Poll until `cond` holds, panicking with `what` after ten seconds.
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    panic!("timed out waiting for {what}");
}

/// Poll the delivery status until it leaves `Ready`.
pub fn wait_delivery(core: &AvmCore) -> MessagesStatus {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        match core.messages_status() {
            MessagesStatus::Empty | MessagesStatus::Ready => {
                std::thread::sleep(Duration::from_millis(2));
            }
            outcome => return outcome,
        }
    }
    panic!("timed out waiting for delivery outcome");
}

/// Poll a logs-cursor slot until the host has a batch READY, consuming it.
pub fn wait_cursor_batch(core: &AvmCore, slot: usize) -> avmcore::LogsCursorLogs {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if let Some(batch) = core.logs_cursor_get_logs(slot).unwrap() {
            return batch;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    panic!("timed out waiting for logs cursor batch");
}
