//! The `AvmCore` host: one long-lived object, one background worker.
//!
//! Exactly one thread, the core thread, mutates machine state, the inbox,
//! the outputs, and the checkpoint catalog. Every other caller is a reader
//! over consistent snapshots, with three narrow write exceptions: message
//! delivery (an atomic status handoff), the per-slot logs-cursor calls, and
//! the checkpoint trigger flag. The loop itself is an explicit state
//! machine: poll machine status, service cursors, sleep briefly when idle.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use avmcore_error::{CoreError, Result};
use avmcore_kv::{Column, KvStore, ReadView, WriteTx};
use avmcore_machine::{
    ExecutionConfig, Interpreter, Machine, MachineMessage, MachineState, MachineStateKeys,
    MachineThread, MachineThreadState, Output,
};
use avmcore_store::inbox::{self, DelayedMessage, SequencerBatchItem};
use avmcore_store::{checkpoint, outputs, CodeStore, ValueCache};
use avmcore_types::codec::{put_u256, take_u256, u256_be, u256_to_usize};
use avmcore_types::{CodePointRef, Operation, Value, H256, U256};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::CoreConfig;
use crate::execution_cursor::{ExecutionCursor, MachineOrKeys};
use crate::logs_cursor::{LogsCursor, LogsCursorLogs, LogsCursorStatus};

/// Status of the message-delivery handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessagesStatus {
    /// Ready to receive a delivery.
    Empty = 0,
    /// A delivery is waiting for the core thread.
    Ready = 1,
    /// The last delivery was applied.
    Success = 2,
    /// The last delivery's predecessor accumulator did not match; the
    /// client must resend older messages.
    NeedOlder = 3,
    /// The last delivery failed; see `messages_clear_error`.
    Error = 4,
}

impl MessagesStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Ready,
            2 => Self::Success,
            3 => Self::NeedOlder,
            4 => Self::Error,
            _ => Self::Empty,
        }
    }
}

/// One pending delivery from the client.
#[derive(Debug, Clone, Default)]
struct MessageData {
    messages: Vec<Vec<u8>>,
    previous_inbox_acc: H256,
    last_block_complete: bool,
    reorg_message_count: Option<U256>,
}

/// The program the core boots from on an empty database.
#[derive(Debug, Clone)]
pub struct LoadedExecutable {
    pub code: Vec<Operation>,
    pub static_val: Value,
}

/// The persistent execution core.
pub struct AvmCore {
    /// Self-handle for spawning the core thread.
    me: Weak<AvmCore>,

    kv: Arc<KvStore>,
    code: Arc<CodeStore>,
    interp: Arc<dyn Interpreter>,
    config: CoreConfig,

    core_thread: Mutex<Option<JoinHandle<()>>>,
    core_abort: Arc<AtomicBool>,

    /// Held while a reorg selects its survivor checkpoint, so concurrent
    /// readers never observe a partially deleted catalog.
    core_reorg_mutex: Mutex<()>,

    /// The live machine; present after `initialize`.
    machine: Mutex<Option<MachineThread>>,

    message_status: AtomicU8,
    message_data: Mutex<MessageData>,
    core_error_string: Mutex<String>,

    machine_idle: AtomicBool,
    machine_error: AtomicBool,
    machine_error_string: Mutex<String>,

    save_checkpoint_flag: AtomicBool,
    save_checkpoint_error: Mutex<Option<String>>,

    logs_cursors: Vec<LogsCursor>,

    sideload_cache: RwLock<BTreeMap<U256, Machine>>,
    last_machine_output: RwLock<Output>,
}

impl AvmCore {
    pub fn new(
        kv: Arc<KvStore>,
        interp: Arc<dyn Interpreter>,
        config: CoreConfig,
    ) -> Result<Arc<Self>> {
        if config.logs_cursor_count == 0 || config.logs_cursor_count > 255 {
            return Err(CoreError::InvalidArgument(format!(
                "logs cursor count {} not in [1, 255]",
                config.logs_cursor_count
            )));
        }
        let logs_cursors = (0..config.logs_cursor_count)
            .map(|_| LogsCursor::new())
            .collect();
        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            kv,
            code: Arc::new(CodeStore::new()),
            interp,
            config,
            core_thread: Mutex::new(None),
            core_abort: Arc::new(AtomicBool::new(false)),
            core_reorg_mutex: Mutex::new(()),
            machine: Mutex::new(None),
            message_status: AtomicU8::new(MessagesStatus::Empty as u8),
            message_data: Mutex::new(MessageData::default()),
            core_error_string: Mutex::new(String::new()),
            machine_idle: AtomicBool::new(false),
            machine_error: AtomicBool::new(false),
            machine_error_string: Mutex::new(String::new()),
            save_checkpoint_flag: AtomicBool::new(false),
            save_checkpoint_error: Mutex::new(None),
            logs_cursors,
            sideload_cache: RwLock::new(BTreeMap::new()),
            last_machine_output: RwLock::new(Output::default()),
        }))
    }

    /// Whether the catalog holds its genesis checkpoint.
    #[must_use]
    pub fn initialized(&self) -> bool {
        self.kv
            .snapshot()
            .get(Column::Checkpoint, &u256_be(&U256::zero()))
            .is_some()
    }

    /// Boot the core: reuse the newest stored checkpoint when the catalog
    /// has one, otherwise publish `executable` and write the gas-0
    /// checkpoint plus zeroed counters in one transaction.
    pub fn initialize(&self, executable: &LoadedExecutable) -> Result<()> {
        let mut cache = ValueCache::new(self.config.value_cache_generations);
        match self.reorg_to_message_or_before(&U256::zero(), true, &mut cache) {
            Ok(()) => {
                info!("initialized from latest existing checkpoint");
                return Ok(());
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                error!(error = %err, "initial reorg failed");
                return Err(err);
            }
        }

        let mut tx = self.kv.begin();
        let segment = self.code.add_segment(&mut tx, executable.code.clone())?;
        let mut state = MachineState::fresh(executable.static_val.clone());
        state.pc = CodePointRef::new(segment, 0);

        checkpoint::save_checkpoint(&mut tx, &state)?;
        outputs::update_log_inserted_count(&mut tx, &U256::zero());
        outputs::update_log_processed_count(&mut tx, &U256::zero());
        outputs::update_send_inserted_count(&mut tx, &U256::zero());
        outputs::update_send_processed_count(&mut tx, &U256::zero());
        outputs::update_message_entry_inserted_count(&mut tx, &U256::zero());
        for slot in 0..self.logs_cursors.len() {
            outputs::update_logs_cursor_current_total(&mut tx, slot as u8, &U256::zero());
        }

        *self.last_machine_output.write() = state.output.clone();
        *self.machine.lock() = Some(MachineThread::new(Machine::new(
            state,
            Arc::clone(&self.interp),
        )));
        tx.commit();
        info!("initialized fresh database");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Thread control
    // -----------------------------------------------------------------------

    /// Start the core thread. Any previous thread is aborted first.
    pub fn start_thread(&self) -> Result<()> {
        self.abort_thread();
        let core = self
            .me
            .upgrade()
            .ok_or_else(|| CoreError::InvalidArgument("core is being torn down".into()))?;
        let handle = std::thread::Builder::new()
            .name("avmcore".into())
            .spawn(move || core.core_loop())
            .map_err(|err| CoreError::Storage(format!("failed to spawn core thread: {err}")))?;
        *self.core_thread.lock() = Some(handle);
        Ok(())
    }

    /// Stop the core thread and wait for it to exit.
    pub fn abort_thread(&self) {
        let handle = self.core_thread.lock().take();
        if let Some(handle) = handle {
            self.core_abort.store(true, Ordering::Release);
            if handle.join().is_err() {
                error!("core thread panicked");
            }
        }
        self.core_abort.store(false, Ordering::Release);
    }

    fn core_loop(&self) {
        let mut cache = ValueCache::new(self.config.value_cache_generations);
        info!("core thread running");

        while !self.core_abort.load(Ordering::Acquire) {
            // 1. The machine must still agree with the stored inbox chain.
            let machine_valid = {
                let guard = self.machine.lock();
                match guard.as_ref().and_then(MachineThread::machine) {
                    Some(machine) => inbox::is_valid(
                        &self.kv.snapshot(),
                        &machine.state().output.fully_processed_inbox,
                    ),
                    // While a run is in flight the inbox cannot change under
                    // it: reorgs happen on this thread and abort runs first.
                    None => true,
                }
            };
            if !machine_valid {
                error!("core thread operating on invalid machine, rolling back");
                if let Err(err) = self.reorg_to_message_or_before(&U256::zero(), true, &mut cache) {
                    error!(error = %err, "rollback reorg failed");
                }
            }

            // 2. Apply a pending delivery.
            if self.message_status_raw() == MessagesStatus::Ready {
                let data = self.message_data.lock().clone();
                match self.add_messages(&data, &mut cache) {
                    Ok(Some(())) => {
                        self.machine_idle.store(false, Ordering::Release);
                        self.set_message_status(MessagesStatus::Success);
                    }
                    Ok(None) => self.set_message_status(MessagesStatus::NeedOlder),
                    Err(err) => {
                        *self.core_error_string.lock() = err.to_string();
                        self.set_message_status(MessagesStatus::Error);
                        error!(error = %err, "inbox processing stopped with error");
                        break;
                    }
                }
            }

            // 3. Drain machine status.
            let status = {
                let guard = self.machine.lock();
                guard.as_ref().map(MachineThread::status)
            };
            match status {
                None => {
                    *self.core_error_string.lock() = "core has no machine".into();
                    self.machine_error.store(true, Ordering::Release);
                    error!("core thread started without an initialized machine");
                    break;
                }
                Some(MachineThreadState::Error) => {
                    let mut guard = self.machine.lock();
                    if let Some(thread) = guard.as_mut() {
                        let message = thread.clear_error().unwrap_or_default();
                        *self.machine_error_string.lock() = message.clone();
                        *self.core_error_string.lock() = message.clone();
                        self.machine_error.store(true, Ordering::Release);
                        error!(error = %message, "machine stopped with error");
                    }
                    break;
                }
                Some(MachineThreadState::Success) => {
                    if let Err(err) = self.handle_assertion(&mut cache) {
                        *self.core_error_string.lock() = err.to_string();
                        self.machine_error.store(true, Ordering::Release);
                        error!(error = %err, "assertion handling failed");
                        break;
                    }
                }
                Some(MachineThreadState::Aborted) => {
                    let mut guard = self.machine.lock();
                    if let Some(thread) = guard.as_mut() {
                        thread.clear_error();
                    }
                }
                Some(MachineThreadState::None) => {
                    // Service a pending checkpoint trigger before starting
                    // another run, or the flag starves under steady load.
                    if !self.save_checkpoint_flag.load(Ordering::Acquire) {
                        if let Err(err) = self.start_machine_if_messages() {
                            *self.core_error_string.lock() = err.to_string();
                            self.machine_error.store(true, Ordering::Release);
                            error!(error = %err, "failed to start machine run");
                            break;
                        }
                    }
                }
                Some(MachineThreadState::Running) => {}
            }

            // 4. Service logs cursors.
            for slot in 0..self.logs_cursors.len() {
                let requested =
                    self.logs_cursors[slot].inner.lock().status == LogsCursorStatus::Requested;
                if requested {
                    self.handle_logs_cursor_requested(slot, &mut cache);
                }
            }

            // 5. Service a checkpoint trigger.
            if self.save_checkpoint_flag.load(Ordering::Acquire) {
                let outcome = self.save_checkpoint_now();
                *self.save_checkpoint_error.lock() = outcome.err().map(|err| err.to_string());
                self.save_checkpoint_flag.store(false, Ordering::Release);
            }

            // 6. Sleep unless a delivery is waiting on an idle machine.
            if !self.machine_idle() || self.message_status_raw() != MessagesStatus::Ready {
                std::thread::sleep(self.config.idle_sleep);
            }
        }

        // Stop cleanly: whatever happened above, release machine resources.
        if let Some(thread) = self.machine.lock().as_mut() {
            thread.abort();
        }
        info!("core thread stopped");
    }

    fn save_checkpoint_now(&self) -> Result<()> {
        let guard = self.machine.lock();
        let machine = guard
            .as_ref()
            .and_then(MachineThread::machine)
            .ok_or_else(|| CoreError::InvalidArgument("machine is running".into()))?;
        let mut tx = self.kv.begin();
        checkpoint::save_checkpoint(&mut tx, machine.state())?;
        tx.commit();
        Ok(())
    }

    fn start_machine_if_messages(&self) -> Result<()> {
        let mut guard = self.machine.lock();
        let thread = guard
            .as_mut()
            .ok_or_else(|| CoreError::InvalidArgument("core has no machine".into()))?;
        let Some(machine) = thread.machine() else {
            return Ok(());
        };
        let inbox_state = machine.state().output.fully_processed_inbox;

        let snap = self.kv.snapshot();
        let raw = inbox::read_messages(
            &snap,
            &inbox_state.count,
            self.config.max_message_batch_size,
            Some(inbox_state.accumulator),
        )?;
        if raw.is_empty() {
            self.machine_idle.store(true, Ordering::Release);
            return Ok(());
        }

        let messages = raw
            .into_iter()
            .map(|m| MachineMessage::new(m.message, m.accumulator))
            .collect();
        thread.start(ExecutionConfig {
            max_gas: None,
            go_over_gas: false,
            stop_on_sideload: true,
            messages,
        })
    }

    /// Persist one successful assertion atomically: logs, sends, sideload
    /// marker, and, at a sideload boundary, a checkpoint, the sideload
    /// machine cache entry, and a resumed run.
    fn handle_assertion(&self, cache: &mut ValueCache) -> Result<()> {
        let mut guard = self.machine.lock();
        let thread = guard
            .as_mut()
            .ok_or_else(|| CoreError::InvalidArgument("core has no machine".into()))?;
        let assertion = thread.take_assertion()?;
        let machine = thread
            .machine()
            .ok_or_else(|| CoreError::corruption("machine missing after successful run"))?;
        let machine_output = machine.state().output.clone();
        *self.last_machine_output.write() = machine_output.clone();

        let mut tx = self.kv.begin();
        outputs::save_logs(&mut tx, &assertion.logs)?;
        outputs::save_sends(&mut tx, &assertion.sends)?;

        if let Some(block) = assertion.sideload_block_number {
            save_sideload_position(&mut tx, &block, &machine_output.arb_gas_used);
            debug!(block = %block, gas = %machine_output.arb_gas_used, "sideload boundary");

            {
                let mut sideloads = self.sideload_cache.write();
                sideloads.insert(block, machine.clone());
                // Trim entries that have aged out, plus any in the future.
                // In-future entries can only exist when a reorg raced this
                // assertion; the rule covers both directions regardless.
                let cache_span = U256::from(self.config.sideload_cache_size);
                sideloads.retain(|entry_block, _| {
                    !((block > cache_span && *entry_block < block - cache_span)
                        || *entry_block > block)
                });
            }

            checkpoint::save_checkpoint(&mut tx, machine.state())?;
            cache.next_generation();
            thread.continue_running()?;
        }

        tx.commit();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Message delivery and status
    // -----------------------------------------------------------------------

    /// Hand a batch of messages to the core thread. Returns `false` when a
    /// prior delivery has not been consumed yet.
    pub fn deliver_messages(
        &self,
        messages: Vec<Vec<u8>>,
        previous_inbox_acc: H256,
        last_block_complete: bool,
        reorg_message_count: Option<U256>,
    ) -> bool {
        if self.message_status_raw() != MessagesStatus::Empty {
            return false;
        }
        *self.message_data.lock() = MessageData {
            messages,
            previous_inbox_acc,
            last_block_complete,
            reorg_message_count,
        };
        self.set_message_status(MessagesStatus::Ready);
        true
    }

    /// Current delivery status. `Success` and `NeedOlder` are one-shot:
    /// observing them resets the slot to `Empty`.
    pub fn messages_status(&self) -> MessagesStatus {
        let current = self.message_status_raw();
        if current != MessagesStatus::Error && current != MessagesStatus::Ready {
            self.set_message_status(MessagesStatus::Empty);
        }
        current
    }

    /// Clear a delivery error (or `NeedOlder`) and return the error text.
    pub fn messages_clear_error(&self) -> String {
        let current = self.message_status_raw();
        if current != MessagesStatus::Error && current != MessagesStatus::NeedOlder {
            return String::new();
        }
        self.set_message_status(MessagesStatus::Empty);
        std::mem::take(&mut *self.core_error_string.lock())
    }

    #[must_use]
    pub fn machine_idle(&self) -> bool {
        self.machine_idle.load(Ordering::Acquire)
    }

    /// Clear a machine error and return its message.
    pub fn machine_clear_error(&self) -> Option<String> {
        if !self.machine_error.swap(false, Ordering::AcqRel) {
            return None;
        }
        Some(std::mem::take(&mut *self.machine_error_string.lock()))
    }

    /// Ask the core thread to write a checkpoint now and wait until it has.
    pub fn trigger_save_checkpoint(&self) -> Result<()> {
        if self.core_thread.lock().is_none() {
            return Err(CoreError::InvalidArgument(
                "core thread is not running".into(),
            ));
        }
        self.save_checkpoint_flag.store(true, Ordering::Release);
        while self.save_checkpoint_flag.load(Ordering::Acquire) {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        match self.save_checkpoint_error.lock().take() {
            None => Ok(()),
            Some(message) => Err(CoreError::Storage(message)),
        }
    }

    fn message_status_raw(&self) -> MessagesStatus {
        MessagesStatus::from_u8(self.message_status.load(Ordering::Acquire))
    }

    fn set_message_status(&self, status: MessagesStatus) {
        self.message_status.store(status as u8, Ordering::Release);
    }

    // -----------------------------------------------------------------------
    // Inbox mutation
    // -----------------------------------------------------------------------

    /// Append a delivery to the batch-item stream.
    ///
    /// Returns `Ok(None)` when the client's `previous_inbox_acc` does not
    /// match the chain (the `NeedOlder` outcome). With `reorg_message_count`
    /// the stream is first trimmed back to that many messages; when the new
    /// insertion point predates what the machine already consumed, the
    /// machine is reorged back to it.
    fn add_messages(&self, data: &MessageData, cache: &mut ValueCache) -> Result<Option<()>> {
        let machine_count = self
            .last_machine_output
            .read()
            .fully_processed_inbox
            .count;

        let mut tx = self.kv.begin();
        let insertion_count;
        let prev_item: Option<SequencerBatchItem>;

        match &data.reorg_message_count {
            Some(reorg_count) => {
                insertion_count = *reorg_count;
                if reorg_count.is_zero() {
                    if data.previous_inbox_acc != H256::zero() {
                        return Ok(None);
                    }
                    prev_item = None;
                } else {
                    let item = match inbox::next_batch_item(&tx, &(*reorg_count - U256::one())) {
                        Ok(item) => item,
                        Err(err) if err.is_not_found() => return Ok(None),
                        Err(err) => return Err(err),
                    };
                    if item.last_sequence_number != *reorg_count - U256::one() {
                        return Err(CoreError::corruption(format!(
                            "reorg to message {reorg_count} splits a batch item"
                        )));
                    }
                    if item.accumulator != data.previous_inbox_acc {
                        return Ok(None);
                    }
                    prev_item = Some(item);
                }
                inbox::delete_batch_items_from(&mut tx, reorg_count)?;
                info!(count = %reorg_count, "trimmed inbox for delivery retry");
            }
            None => {
                let tip = inbox::message_count(&tx)?;
                insertion_count = tip;
                if tip.is_zero() {
                    if data.previous_inbox_acc != H256::zero() {
                        return Ok(None);
                    }
                    prev_item = None;
                } else {
                    let item = inbox::next_batch_item(&tx, &(tip - U256::one()))?;
                    if item.accumulator != data.previous_inbox_acc {
                        return Ok(None);
                    }
                    prev_item = Some(item);
                }
            }
        }

        let (mut prev_acc, mut delayed_count) = match &prev_item {
            Some(item) => (item.accumulator, item.total_delayed_count),
            None => (H256::zero(), U256::zero()),
        };
        let mut delayed_acc = if delayed_count.is_zero() {
            H256::zero()
        } else {
            inbox::delayed_message(&tx, &(delayed_count - U256::one()))?.delayed_acc
        };

        let mut next_seq = insertion_count;
        let mut pending_delayed = U256::zero();

        for raw in &data.messages {
            let (kind, payload) = inbox::parse_envelope(raw)?;
            if kind == inbox::MSG_KIND_DELAYED {
                delayed_acc = inbox::next_delayed_acc(delayed_acc, payload);
                inbox::put_delayed_message(
                    &mut tx,
                    &DelayedMessage {
                        index: delayed_count,
                        delayed_acc,
                        message: payload.to_vec(),
                    },
                );
                delayed_count += U256::one();
                pending_delayed += U256::one();
                continue;
            }

            if !pending_delayed.is_zero() {
                prev_acc = flush_delayed_run(
                    &mut tx,
                    prev_acc,
                    &mut next_seq,
                    &mut pending_delayed,
                    &delayed_count,
                    delayed_acc,
                );
            }
            prev_acc = inbox::sequencer_item_acc(prev_acc, payload);
            inbox::put_batch_item(
                &mut tx,
                &SequencerBatchItem {
                    last_sequence_number: next_seq,
                    accumulator: prev_acc,
                    total_delayed_count: delayed_count,
                    sequencer_message: Some(payload.to_vec()),
                },
            );
            next_seq += U256::one();
        }
        if !pending_delayed.is_zero() {
            flush_delayed_run(
                &mut tx,
                prev_acc,
                &mut next_seq,
                &mut pending_delayed,
                &delayed_count,
                delayed_acc,
            );
        }

        outputs::update_message_entry_inserted_count(&mut tx, &next_seq);
        tx.commit();
        debug!(
            first = %insertion_count,
            count = data.messages.len(),
            last_block_complete = data.last_block_complete,
            "appended inbox messages"
        );

        if insertion_count < machine_count {
            let target = if insertion_count.is_zero() {
                U256::zero()
            } else {
                insertion_count - U256::one()
            };
            self.reorg_to_message_or_before(&target, false, cache)?;
        }
        Ok(Some(()))
    }

    // -----------------------------------------------------------------------
    // Reorg engine
    // -----------------------------------------------------------------------

    /// Rewind to the newest checkpoint whose inbox state is both consistent
    /// with the stored chain and at or before `message_sequence_number`
    /// (ignored with `use_latest`). Deletes obsolete checkpoints, replays
    /// doomed logs into the logs cursors, rewinds outputs and sideloads,
    /// and rebuilds the live machine from the survivor.
    pub fn reorg_to_message_or_before(
        &self,
        message_sequence_number: &U256,
        use_latest: bool,
        cache: &mut ValueCache,
    ) -> Result<()> {
        if use_latest {
            info!("reloading latest checkpoint");
        } else {
            info!(seq = %message_sequence_number, "reorganizing inbox");
        }

        // Phase 1: select the survivor under the reorg mutex, deleting every
        // checkpoint that is newer or no longer consistent with the inbox.
        let survivor: MachineStateKeys = {
            let _guard = self.core_reorg_mutex.lock();
            let mut tx = self.kv.begin();
            let entries: Vec<(Vec<u8>, Vec<u8>)> = tx.iter_rev(Column::Checkpoint, None).collect();
            if entries.is_empty() {
                return Err(CoreError::NotFound);
            }
            let mut found = None;
            for (_, body) in entries {
                let keys = MachineStateKeys::unmarshal(&mut body.as_slice())?;
                let total_read = keys.total_messages_read();
                if total_read.is_zero()
                    || use_latest
                    || *message_sequence_number >= total_read - U256::one()
                {
                    if inbox::is_valid(&tx, &keys.output.fully_processed_inbox) {
                        found = Some(keys);
                        break;
                    }
                    error!(gas = %keys.output.arb_gas_used, "invalid checkpoint found during reorg");
                }
                checkpoint::delete_checkpoint(&mut tx, &keys)?;
            }
            let Some(survivor) = found else {
                return Err(CoreError::NotFound);
            };
            tx.commit();
            survivor
        };

        // Phase 2: let every logs cursor snapshot the logs that are about to
        // be deleted. Must happen before the deletion itself.
        let log_inserted = outputs::log_inserted_count(&self.kv.snapshot())?;
        if survivor.output.log_count < log_inserted {
            for slot in 0..self.logs_cursors.len() {
                self.handle_logs_cursor_reorg(slot, &survivor.output.log_count, cache)?;
            }
        }

        // Phase 3–6: rewind sideloads and outputs, rebuild the machine.
        let mut tx = self.kv.begin();
        let next_sideload = survivor
            .output
            .last_sideload
            .map_or_else(U256::zero, |block| block + U256::one());
        self.delete_sideloads_starting_at(&mut tx, &next_sideload);

        outputs::delete_logs_from(&mut tx, &survivor.output.log_count)?;
        outputs::update_log_inserted_count(&mut tx, &survivor.output.log_count);
        outputs::update_send_inserted_count(&mut tx, &survivor.output.send_count);

        {
            let mut guard = self.machine.lock();
            if let Some(thread) = guard.as_mut() {
                thread.abort();
                thread.clear_error();
            }
            let state = checkpoint::restore_machine_state(&tx, &survivor, &self.code, cache)?;
            *self.last_machine_output.write() = state.output.clone();
            *guard = Some(MachineThread::new(Machine::new(
                state,
                Arc::clone(&self.interp),
            )));
        }
        tx.commit();
        info!(
            gas = %survivor.output.arb_gas_used,
            log_count = %survivor.output.log_count,
            "reorg complete"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Read APIs
    // -----------------------------------------------------------------------

    pub fn log_inserted_count(&self) -> Result<U256> {
        outputs::log_inserted_count(&self.kv.snapshot())
    }

    pub fn log_processed_count(&self) -> Result<U256> {
        outputs::log_processed_count(&self.kv.snapshot())
    }

    pub fn update_log_processed_count(&self, count: &U256) -> Result<()> {
        let mut tx = self.kv.begin();
        outputs::update_log_processed_count(&mut tx, count);
        tx.commit();
        Ok(())
    }

    pub fn send_inserted_count(&self) -> Result<U256> {
        outputs::send_inserted_count(&self.kv.snapshot())
    }

    pub fn send_processed_count(&self) -> Result<U256> {
        outputs::send_processed_count(&self.kv.snapshot())
    }

    pub fn update_send_processed_count(&self, count: &U256) -> Result<()> {
        let mut tx = self.kv.begin();
        outputs::update_send_processed_count(&mut tx, count);
        tx.commit();
        Ok(())
    }

    pub fn message_entry_inserted_count(&self) -> Result<U256> {
        outputs::message_entry_inserted_count(&self.kv.snapshot())
    }

    /// Messages the live machine has fully processed.
    #[must_use]
    pub fn machine_messages_read(&self) -> U256 {
        self.last_machine_output.read().fully_processed_inbox.count
    }

    /// The last published machine output.
    #[must_use]
    pub fn last_machine_output(&self) -> Output {
        self.last_machine_output.read().clone()
    }

    /// Log values for `[index, index + count)`, truncated at the tip.
    pub fn get_logs(&self, index: &U256, count: &U256, cache: &mut ValueCache) -> Result<Vec<Value>> {
        outputs::get_logs(&self.kv.snapshot(), index, count, &self.code, cache)
    }

    /// Send payloads for `[index, index + count)`, truncated at the tip.
    pub fn get_sends(&self, index: &U256, count: &U256) -> Result<Vec<Vec<u8>>> {
        outputs::get_sends(&self.kv.snapshot(), index, count)
    }

    /// Message payloads for `[index, index + count)`, truncated at the tip.
    pub fn get_messages(&self, index: &U256, count: &U256) -> Result<Vec<Vec<u8>>> {
        let snap = self.kv.snapshot();
        let total = inbox::message_count(&snap)?;
        if *index >= total || count.is_zero() {
            return Ok(Vec::new());
        }
        let available = total - *index;
        let take = u256_to_usize(&available.min(*count))?;
        let raw = inbox::read_messages(&snap, index, take, None)?;
        Ok(raw.into_iter().map(|m| m.message).collect())
    }

    /// Accumulator of the batch item covering message `index`.
    pub fn get_inbox_acc(&self, index: &U256) -> Result<H256> {
        Ok(inbox::next_batch_item(&self.kv.snapshot(), index)?.accumulator)
    }

    /// Two accumulators under one consistent snapshot.
    pub fn get_inbox_acc_pair(&self, index1: &U256, index2: &U256) -> Result<(H256, H256)> {
        let snap = self.kv.snapshot();
        let first = inbox::next_batch_item(&snap, index1)?.accumulator;
        let second = inbox::next_batch_item(&snap, index2)?.accumulator;
        Ok((first, second))
    }

    /// Fold the log-range commitment starting from `start_acc`.
    pub fn get_log_acc(&self, start_acc: H256, start_index: &U256, count: &U256) -> Result<H256> {
        outputs::log_acc(&self.kv.snapshot(), start_acc, start_index, count)
    }

    /// Fold the send-range commitment starting from `start_acc`.
    pub fn get_send_acc(&self, start_acc: H256, start_index: &U256, count: &U256) -> Result<H256> {
        outputs::send_acc(&self.kv.snapshot(), start_acc, start_index, count)
    }

    /// Gas of the newest checkpoint, zero for an empty catalog.
    #[must_use]
    pub fn max_checkpoint_gas(&self) -> U256 {
        checkpoint::max_checkpoint_gas(&self.kv.snapshot())
    }

    #[must_use]
    pub fn is_checkpoints_empty(&self) -> bool {
        checkpoint::is_checkpoints_empty(&self.kv.snapshot())
    }

    // -----------------------------------------------------------------------
    // Execution cursors
    // -----------------------------------------------------------------------

    /// A cursor advanced to `total_gas_used`.
    pub fn get_execution_cursor(
        &self,
        total_gas_used: U256,
        cache: &mut ValueCache,
    ) -> Result<ExecutionCursor> {
        let keys = self.closest_checkpoint(&self.kv.snapshot(), &total_gas_used)?;
        let mut cursor = ExecutionCursor::from_keys(keys);
        self.advance_execution_cursor_impl(&mut cursor, total_gas_used, false, cache)?;
        Ok(cursor)
    }

    /// Advance `cursor` by `max_gas` more gas.
    ///
    /// When the cursor is close enough to the target that re-running it is
    /// cheaper than a checkpoint load, and it is still consistent with the
    /// inbox, the cursor is kept; otherwise it restarts from the closest
    /// checkpoint at or before the target.
    pub fn advance_execution_cursor(
        &self,
        cursor: &mut ExecutionCursor,
        max_gas: U256,
        go_over_gas: bool,
        cache: &mut ValueCache,
    ) -> Result<()> {
        let gas_target = cursor.output().arb_gas_used + max_gas;
        {
            let snap = self.kv.snapshot();
            let closest = self.closest_checkpoint(&snap, &gas_target)?;
            let load_cost = U256::from(self.config.checkpoint_load_gas_cost);
            let mut already_newer = false;
            if cursor.output().arb_gas_used + load_cost > closest.output.arb_gas_used {
                already_newer = inbox::is_valid(&snap, &cursor.output().fully_processed_inbox);
            }
            if !already_newer {
                cursor.machine = MachineOrKeys::Keys(closest);
            }
        }
        self.advance_execution_cursor_impl(cursor, gas_target, go_over_gas, cache)
    }

    /// Take the materialized machine out of a cursor, leaving the cursor
    /// positioned at the same state as lazy keys.
    pub fn take_execution_cursor_machine(
        &self,
        cursor: &mut ExecutionCursor,
        cache: &mut ValueCache,
    ) -> Result<Machine> {
        let snap = self.kv.snapshot();
        self.resolve_cursor_machine(&snap, cursor, cache)?;
        let keys = match &cursor.machine {
            MachineOrKeys::Machine(machine) => MachineStateKeys::from_state(machine.state()),
            MachineOrKeys::Keys(keys) => keys.clone(),
        };
        match std::mem::replace(&mut cursor.machine, MachineOrKeys::Keys(keys)) {
            MachineOrKeys::Machine(machine) => Ok(*machine),
            MachineOrKeys::Keys(_) => Err(CoreError::corruption("cursor lost its machine")),
        }
    }

    fn advance_execution_cursor_impl(
        &self,
        cursor: &mut ExecutionCursor,
        total_gas_used: U256,
        go_over_gas: bool,
        cache: &mut ValueCache,
    ) -> Result<()> {
        let no_abort = AtomicBool::new(false);
        let mut reorg_attempts = 0usize;
        loop {
            if reorg_attempts > 0 {
                if reorg_attempts % 4 == 0 {
                    warn!(
                        attempts = reorg_attempts,
                        "execution cursor repeatedly caught mid-reorg"
                    );
                }
                if reorg_attempts >= self.config.reorg_retry_attempts {
                    return Err(CoreError::Busy);
                }
                std::thread::sleep(self.config.reorg_retry_sleep);
            }
            reorg_attempts += 1;

            let mut handle_reorg = false;
            loop {
                let messages = {
                    let snap = self.kv.snapshot();
                    self.resolve_cursor_machine(&snap, cursor, cache)?;
                    let MachineOrKeys::Machine(machine) = &cursor.machine else {
                        return Err(CoreError::corruption("cursor lost its machine"));
                    };

                    let gas_used = machine.state().output.arb_gas_used;
                    if gas_used == total_gas_used {
                        break;
                    }
                    if go_over_gas && gas_used > total_gas_used {
                        break;
                    }
                    if !go_over_gas && gas_used + machine.next_gas_cost() > total_gas_used {
                        break;
                    }

                    let inbox_state = machine.state().output.fully_processed_inbox;
                    match inbox::read_messages(
                        &snap,
                        &inbox_state.count,
                        self.config.cursor_message_batch_size,
                        Some(inbox_state.accumulator),
                    ) {
                        Ok(messages) => messages,
                        Err(err) if err.is_not_found() => {
                            // The snapshot no longer contains the prefix the
                            // cursor consumed: a reorg happened underneath.
                            handle_reorg = true;
                            break;
                        }
                        Err(err) => return Err(err),
                    }
                };

                let MachineOrKeys::Machine(machine) = &mut cursor.machine else {
                    return Err(CoreError::corruption("cursor lost its machine"));
                };
                let assertion = machine.run(
                    &ExecutionConfig {
                        max_gas: Some(total_gas_used),
                        go_over_gas,
                        stop_on_sideload: false,
                        messages: messages
                            .into_iter()
                            .map(|m| MachineMessage::new(m.message, m.accumulator))
                            .collect(),
                    },
                    &no_abort,
                )?;
                if assertion.is_empty() {
                    break;
                }
            }

            if !handle_reorg {
                return Ok(());
            }
            let snap = self.kv.snapshot();
            let closest = self.closest_checkpoint(&snap, &total_gas_used)?;
            cursor.machine = MachineOrKeys::Keys(closest);
        }
    }

    fn resolve_cursor_machine(
        &self,
        view: &impl ReadView,
        cursor: &mut ExecutionCursor,
        cache: &mut ValueCache,
    ) -> Result<()> {
        if let MachineOrKeys::Keys(keys) = &cursor.machine {
            let state = checkpoint::restore_machine_state(view, keys, &self.code, cache)?;
            cursor.machine = MachineOrKeys::Machine(Box::new(Machine::new(
                state,
                Arc::clone(&self.interp),
            )));
        }
        Ok(())
    }

    /// Catalog lookup serialized against reorgs, so a reader never observes
    /// a partially deleted catalog.
    fn closest_checkpoint(&self, view: &impl ReadView, gas: &U256) -> Result<MachineStateKeys> {
        let _guard = self.core_reorg_mutex.lock();
        checkpoint::checkpoint_at_or_before(view, gas, false)
    }

    // -----------------------------------------------------------------------
    // Sideloads
    // -----------------------------------------------------------------------

    /// A machine positioned just before `block_number`'s sideload.
    ///
    /// Served from the in-memory cache when possible; otherwise rebuilt by
    /// advancing a cursor from the nearest checkpoint to the recorded
    /// sideload gas position.
    pub fn get_machine_for_sideload(
        &self,
        block_number: &U256,
        cache: &mut ValueCache,
    ) -> Result<Machine> {
        {
            let sideloads = self.sideload_cache.read();
            if let Some((_, machine)) = sideloads.range(..=*block_number).next_back() {
                return Ok(machine.clone());
            }
        }

        let gas_target = {
            let snap = self.kv.snapshot();
            sideload_position(&snap, block_number)?
        };
        let mut cursor = {
            let snap = self.kv.snapshot();
            ExecutionCursor::from_keys(self.closest_checkpoint(&snap, &gas_target)?)
        };
        self.advance_execution_cursor_impl(&mut cursor, gas_target, false, cache)?;
        self.take_execution_cursor_machine(&mut cursor, cache)
    }

    /// Drop cached sideload machines at `block_number` and later. Test
    /// helper for exercising the rebuild path.
    pub fn purge_sideload_cache(&self, block_number: &U256) {
        let mut sideloads = self.sideload_cache.write();
        sideloads.split_off(block_number);
    }

    fn delete_sideloads_starting_at(&self, tx: &mut WriteTx<'_>, block_number: &U256) {
        {
            let mut sideloads = self.sideload_cache.write();
            sideloads.split_off(block_number);
        }
        let doomed: Vec<Vec<u8>> = tx
            .iter_from(Column::Sideload, &u256_be(block_number))
            .map(|(key, _)| key)
            .collect();
        for key in doomed {
            tx.delete(Column::Sideload, key);
        }
    }

    // -----------------------------------------------------------------------
    // Logs cursors
    // -----------------------------------------------------------------------

    fn cursor_slot(&self, slot: usize) -> Result<&LogsCursor> {
        self.logs_cursors.get(slot).ok_or_else(|| {
            CoreError::InvalidArgument(format!("logs cursor slot {slot} out of range"))
        })
    }

    /// Request `count` logs. Only legal from `EMPTY`; returns `false` when
    /// the slot is busy.
    pub fn logs_cursor_request(&self, slot: usize, count: U256) -> Result<bool> {
        let cursor = self.cursor_slot(slot)?;
        let mut inner = cursor.inner.lock();
        if inner.status != LogsCursorStatus::Empty {
            return Ok(false);
        }
        inner.requested_count = count;
        inner.status = LogsCursorStatus::Requested;
        Ok(true)
    }

    /// Collect buffered logs and deletions. `None` until the host has
    /// serviced the request.
    pub fn logs_cursor_get_logs(&self, slot: usize) -> Result<Option<LogsCursorLogs>> {
        let cursor = self.cursor_slot(slot)?;
        let mut inner = cursor.inner.lock();
        if inner.status != LogsCursorStatus::Ready {
            return Ok(None);
        }
        let current = outputs::logs_cursor_current_total(&self.kv.snapshot(), slot as u8)?;
        inner.pending_total_count = current + U256::from(inner.data.len() as u64);
        Ok(Some(LogsCursorLogs {
            first_log_index: current,
            logs: std::mem::take(&mut inner.data),
            deleted_logs: std::mem::take(&mut inner.deleted_data),
        }))
    }

    /// Acknowledge everything collected so far, persisting the new confirmed
    /// position. Only legal from `READY` with both buffers drained.
    pub fn logs_cursor_confirm_received(&self, slot: usize) -> Result<bool> {
        let cursor = self.cursor_slot(slot)?;
        let mut inner = cursor.inner.lock();
        if inner.status != LogsCursorStatus::Ready {
            inner.error_string = "confirm called at wrong state".into();
            inner.status = LogsCursorStatus::Error;
            return Ok(false);
        }
        if !inner.data.is_empty() || !inner.deleted_data.is_empty() {
            // Not fully drained yet.
            return Ok(false);
        }
        let mut tx = self.kv.begin();
        outputs::update_logs_cursor_current_total(&mut tx, slot as u8, &inner.pending_total_count);
        tx.commit();
        inner.status = LogsCursorStatus::Empty;
        Ok(true)
    }

    pub fn logs_cursor_check_error(&self, slot: usize) -> Result<bool> {
        let cursor = self.cursor_slot(slot)?;
        Ok(cursor.inner.lock().status == LogsCursorStatus::Error)
    }

    /// Clear an errored slot back to `EMPTY`, returning the error text.
    pub fn logs_cursor_clear_error(&self, slot: usize) -> Result<String> {
        let cursor = self.cursor_slot(slot)?;
        let mut inner = cursor.inner.lock();
        if inner.status != LogsCursorStatus::Error {
            return Err(CoreError::InvalidArgument(
                "logs cursor is not in the error state".into(),
            ));
        }
        inner.data.clear();
        inner.deleted_data.clear();
        inner.status = LogsCursorStatus::Empty;
        Ok(std::mem::take(&mut inner.error_string))
    }

    /// The persisted confirmed position of a slot.
    pub fn logs_cursor_position(&self, slot: usize) -> Result<U256> {
        self.cursor_slot(slot)?;
        outputs::logs_cursor_current_total(&self.kv.snapshot(), slot as u8)
    }

    /// Host-side servicing of a `REQUESTED` slot.
    fn handle_logs_cursor_requested(&self, slot: usize, cache: &mut ValueCache) {
        let snap = self.kv.snapshot();
        let cursor = &self.logs_cursors[slot];
        let mut inner = cursor.inner.lock();
        if inner.status != LogsCursorStatus::Requested {
            return;
        }
        inner.data.clear();

        let inserted = match outputs::log_inserted_count(&snap) {
            Ok(count) => count,
            Err(err) => {
                warn!(slot, error = %err, "logs cursor failed reading inserted count");
                inner.error_string = err.to_string();
                inner.status = LogsCursorStatus::Error;
                return;
            }
        };
        let current = match outputs::logs_cursor_current_total(&snap, slot as u8) {
            Ok(count) => count,
            Err(err) => {
                warn!(slot, error = %err, "logs cursor failed reading confirmed total");
                inner.error_string = err.to_string();
                inner.status = LogsCursorStatus::Error;
                return;
            }
        };

        if current == inserted {
            // Nothing new; leave the request pending.
            return;
        }
        if current > inserted {
            inner.error_string = format!(
                "logs cursor confirmed total {current} exceeds inserted count {inserted}"
            );
            inner.status = LogsCursorStatus::Error;
            return;
        }
        if current + inner.requested_count > inserted {
            inner.requested_count = inserted - current;
        }
        if inner.requested_count.is_zero() {
            inner.status = LogsCursorStatus::Ready;
            return;
        }
        match outputs::get_logs(&snap, &current, &inner.requested_count, &self.code, cache) {
            Ok(logs) => {
                inner.data = logs;
                inner.status = LogsCursorStatus::Ready;
            }
            Err(err) => {
                warn!(slot, error = %err, "logs cursor failed reading logs");
                inner.error_string = err.to_string();
                inner.status = LogsCursorStatus::Error;
            }
        }
    }

    /// Reorg-side handling: called *before* logs are deleted so the slot can
    /// buffer the doomed logs for its client, newest first.
    fn handle_logs_cursor_reorg(
        &self,
        slot: usize,
        log_count: &U256,
        cache: &mut ValueCache,
    ) -> Result<()> {
        let cursor = &self.logs_cursors[slot];
        let mut tx = self.kv.begin();
        let mut inner = cursor.inner.lock();

        let current = outputs::logs_cursor_current_total(&tx, slot as u8)?;
        if current > inner.pending_total_count {
            inner.pending_total_count = current;
        }

        if *log_count < inner.pending_total_count {
            let doomed = inner.pending_total_count - *log_count;
            let logs = outputs::get_logs(&tx, log_count, &doomed, &self.code, cache)?;
            inner.deleted_data.extend(logs.into_iter().rev());
            inner.pending_total_count = *log_count;
            if current > *log_count {
                outputs::update_logs_cursor_current_total(&mut tx, slot as u8, log_count);
            }
        }

        if !inner.data.is_empty() {
            if current >= *log_count {
                inner.data.clear();
            } else {
                let keep = u256_to_usize(&(*log_count - current))?;
                if inner.data.len() > keep {
                    inner.data.truncate(keep);
                }
            }
        }

        if inner.status == LogsCursorStatus::Ready
            && inner.data.is_empty()
            && inner.deleted_data.is_empty()
        {
            // Everything the client was about to see has been unwound; ask
            // the host to service the request again.
            inner.status = LogsCursorStatus::Requested;
        }

        tx.commit();
        Ok(())
    }
}

/// Fold a run of freshly appended delayed messages into one batch item.
fn flush_delayed_run(
    tx: &mut WriteTx<'_>,
    prev_acc: H256,
    next_seq: &mut U256,
    pending_delayed: &mut U256,
    delayed_count: &U256,
    delayed_acc: H256,
) -> H256 {
    let last_seq = *next_seq + *pending_delayed - U256::one();
    let acc = inbox::delayed_item_acc(prev_acc, delayed_count, delayed_acc);
    inbox::put_batch_item(
        tx,
        &SequencerBatchItem {
            last_sequence_number: last_seq,
            accumulator: acc,
            total_delayed_count: *delayed_count,
            sequencer_message: None,
        },
    );
    *next_seq = last_seq + U256::one();
    *pending_delayed = U256::zero();
    acc
}

fn save_sideload_position(tx: &mut WriteTx<'_>, block_number: &U256, arb_gas_used: &U256) {
    let mut value = Vec::with_capacity(32);
    put_u256(&mut value, arb_gas_used);
    tx.put(Column::Sideload, u256_be(block_number).to_vec(), value);
}

/// Last recorded sideload gas at or before `block_number`.
fn sideload_position(view: &impl ReadView, block_number: &U256) -> Result<U256> {
    let (_, value) = view
        .seek_for_prev(Column::Sideload, &u256_be(block_number))
        .ok_or(CoreError::NotFound)?;
    take_u256(&mut value.as_slice())
}
