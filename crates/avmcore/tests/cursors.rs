//! Execution-cursor and sideload-machine scenarios.

mod common;

use std::sync::Arc;
use std::thread;

use avmcore::{MessagesStatus, ValueCache};
use avmcore_harness::{InboxTracker, Payload, GAS_PER_MESSAGE};
use avmcore_types::U256;
use common::{new_core, wait_delivery, wait_until};

/// Feed `n` sideload-terminated messages so checkpoints land at gas
/// 100, 200, …, n*100.
fn seed_checkpoints(core: &Arc<avmcore::AvmCore>, n: u64) {
    core.start_thread().unwrap();
    let mut tracker = InboxTracker::new();
    let prev_acc = tracker.acc();
    let delivery: Vec<_> = (0..n)
        .map(|i| tracker.add_sequencer(&Payload::new().logs(1).sideload(i + 1).build()))
        .collect();
    assert!(core.deliver_messages(delivery, prev_acc, true, None));
    assert_eq!(wait_delivery(core), MessagesStatus::Success);
    wait_until("all checkpoints written", || {
        core.max_checkpoint_gas() == U256::from(n * GAS_PER_MESSAGE)
    });
}

#[test]
fn cursor_advances_between_checkpoints() {
    let core = new_core();
    seed_checkpoints(&core, 3);
    core.abort_thread();
    let mut cache = ValueCache::new(2);

    // Target 150: stops before the op that would pass it.
    let mut cursor = core
        .get_execution_cursor(U256::from(150u64), &mut cache)
        .unwrap();
    assert_eq!(cursor.output().arb_gas_used, U256::from(100u64));
    assert_eq!(
        cursor.output().fully_processed_inbox.count,
        U256::one()
    );

    // Close to the target: the cursor is kept and run forward rather than
    // reloaded from the catalog.
    core.advance_execution_cursor(&mut cursor, U256::from(100u64), false, &mut cache)
        .unwrap();
    assert_eq!(cursor.output().arb_gas_used, U256::from(200u64));

    // go_over_gas runs through the target.
    core.advance_execution_cursor(&mut cursor, U256::from(50u64), true, &mut cache)
        .unwrap();
    assert_eq!(cursor.output().arb_gas_used, U256::from(300u64));

    let machine = core
        .take_execution_cursor_machine(&mut cursor, &mut cache)
        .unwrap();
    assert_eq!(machine.state().output.arb_gas_used, U256::from(300u64));
    assert_eq!(machine.state().output.log_count, U256::from(3u64));
    // The cursor stays usable after the machine is taken out.
    assert!(!cursor.is_materialized());
    assert_eq!(cursor.output().arb_gas_used, U256::from(300u64));
}

#[test]
fn cursor_rebuild_equals_live_history() {
    let core = new_core();
    seed_checkpoints(&core, 2);
    core.abort_thread();
    let mut cache = ValueCache::new(2);

    // Two independent cursors to the same gas agree on machine hash.
    let mut a = core
        .get_execution_cursor(U256::from(200u64), &mut cache)
        .unwrap();
    let mut b = core
        .get_execution_cursor(U256::from(200u64), &mut cache)
        .unwrap();
    let ma = core.take_execution_cursor_machine(&mut a, &mut cache).unwrap();
    let mb = core.take_execution_cursor_machine(&mut b, &mut cache).unwrap();
    assert_eq!(ma.hash(), mb.hash());
}

#[test]
fn concurrent_cursors_advance_independently() {
    let core = new_core();
    seed_checkpoints(&core, 3);
    core.abort_thread();

    let core_a = Arc::clone(&core);
    let handle_a = thread::spawn(move || {
        let mut cache = ValueCache::new(2);
        let cursor = core_a
            .get_execution_cursor(U256::from(150u64), &mut cache)
            .unwrap();
        cursor.output().arb_gas_used
    });
    let core_b = Arc::clone(&core);
    let handle_b = thread::spawn(move || {
        let mut cache = ValueCache::new(2);
        let cursor = core_b
            .get_execution_cursor(U256::from(250u64), &mut cache)
            .unwrap();
        cursor.output().arb_gas_used
    });

    assert_eq!(handle_a.join().unwrap(), U256::from(100u64));
    assert_eq!(handle_b.join().unwrap(), U256::from(200u64));
}

#[test]
fn sideload_machine_from_cache_and_rebuilt() {
    let core = new_core();
    core.start_thread().unwrap();
    let mut tracker = InboxTracker::new();
    let mut cache = ValueCache::new(2);

    let prev_acc = tracker.acc();
    let envelope = tracker.add_sequencer(&Payload::new().logs(1).sideload(42).build());
    assert!(core.deliver_messages(vec![envelope], prev_acc, true, None));
    assert_eq!(wait_delivery(&core), MessagesStatus::Success);
    wait_until("checkpoint written", || {
        core.max_checkpoint_gas() == U256::from(GAS_PER_MESSAGE)
    });
    core.abort_thread();

    // Served from the in-memory cache.
    let cached = core
        .get_machine_for_sideload(&U256::from(42u64), &mut cache)
        .unwrap();
    assert_eq!(cached.state().output.arb_gas_used, U256::from(100u64));
    let cached_hash = cached.hash();

    // A later block with no own sideload maps to the same machine.
    let later = core
        .get_machine_for_sideload(&U256::from(50u64), &mut cache)
        .unwrap();
    assert_eq!(later.hash(), cached_hash);

    // After purging the cache the machine is rebuilt from the catalog and
    // hashes identically.
    core.purge_sideload_cache(&U256::zero());
    let rebuilt = core
        .get_machine_for_sideload(&U256::from(42u64), &mut cache)
        .unwrap();
    assert_eq!(rebuilt.hash(), cached_hash);
    assert_eq!(rebuilt.state().output.arb_gas_used, U256::from(100u64));
}

#[test]
fn sideload_before_any_marker_is_not_found() {
    let core = new_core();
    let mut cache = ValueCache::new(2);
    let err = core
        .get_machine_for_sideload(&U256::from(5u64), &mut cache)
        .unwrap_err();
    assert!(err.is_not_found());
}
