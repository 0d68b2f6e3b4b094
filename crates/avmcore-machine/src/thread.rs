//! Background execution of the live machine.
//!
//! The host thread never runs the interpreter itself: it starts a run,
//! polls [`MachineThread::status`], and collects the assertion once the
//! worker reports success. Exactly one worker exists at a time and the
//! machine travels into it by value, so there is no shared mutable state;
//! only the status byte and the abort flag cross the thread boundary.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use avmcore_error::{CoreError, Result};
use tracing::{debug, warn};

use crate::assertion::{Assertion, ExecutionConfig, MachineMessage};
use crate::machine::Machine;

/// Observable state of the machine thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MachineThreadState {
    /// No run in flight and no result pending.
    None = 0,
    /// A worker is executing.
    Running = 1,
    /// A run finished; the assertion is ready to collect.
    Success = 2,
    /// A run was aborted; state must be cleared before restarting.
    Aborted = 3,
    /// A run failed; the error string is ready to collect.
    Error = 4,
}

impl MachineThreadState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Running,
            2 => Self::Success,
            3 => Self::Aborted,
            4 => Self::Error,
            _ => Self::None,
        }
    }
}

enum Slot {
    Idle(Machine),
    Running(JoinHandle<(Machine, Result<Assertion>)>),
    /// Transient state while swapping; never observable between calls.
    Vacant,
}

/// Owner of the live machine plus its single background worker.
pub struct MachineThread {
    slot: Slot,
    status: Arc<AtomicU8>,
    abort: Arc<AtomicBool>,
    /// Messages given to the active (or last) run.
    run_messages: Vec<MachineMessage>,
    /// Messages the last run did not consume; used by `continue_running`.
    remaining: Vec<MachineMessage>,
    /// Flags of the last run, re-applied by `continue_running`.
    stop_on_sideload: bool,
    error_string: Option<String>,
}

impl MachineThread {
    #[must_use]
    pub fn new(machine: Machine) -> Self {
        Self {
            slot: Slot::Idle(machine),
            status: Arc::new(AtomicU8::new(MachineThreadState::None as u8)),
            abort: Arc::new(AtomicBool::new(false)),
            run_messages: Vec::new(),
            remaining: Vec::new(),
            stop_on_sideload: false,
            error_string: None,
        }
    }

    #[must_use]
    pub fn status(&self) -> MachineThreadState {
        MachineThreadState::from_u8(self.status.load(Ordering::Acquire))
    }

    /// The machine, when no run is in flight.
    #[must_use]
    pub fn machine(&self) -> Option<&Machine> {
        match &self.slot {
            Slot::Idle(machine) => Some(machine),
            _ => None,
        }
    }

    /// Start a run with the given config. Fails unless the thread is idle
    /// with no uncollected result.
    pub fn start(&mut self, config: ExecutionConfig) -> Result<()> {
        if self.status() != MachineThreadState::None {
            return Err(CoreError::InvalidArgument(format!(
                "machine thread started in state {:?}",
                self.status()
            )));
        }
        let mut machine = match std::mem::replace(&mut self.slot, Slot::Vacant) {
            Slot::Idle(machine) => machine,
            other => {
                self.slot = other;
                return Err(CoreError::InvalidArgument(
                    "machine thread has no idle machine".into(),
                ));
            }
        };

        self.run_messages = config.messages.clone();
        self.remaining.clear();
        self.stop_on_sideload = config.stop_on_sideload;
        self.error_string = None;
        self.abort.store(false, Ordering::Release);
        self.status
            .store(MachineThreadState::Running as u8, Ordering::Release);

        let status = Arc::clone(&self.status);
        let abort = Arc::clone(&self.abort);
        let handle = std::thread::spawn(move || {
            let result = machine.run(&config, &abort);
            let final_state = if abort.load(Ordering::Acquire) {
                MachineThreadState::Aborted
            } else {
                match &result {
                    Ok(_) => MachineThreadState::Success,
                    Err(_) => MachineThreadState::Error,
                }
            };
            status.store(final_state as u8, Ordering::Release);
            (machine, result)
        });
        self.slot = Slot::Running(handle);
        Ok(())
    }

    /// Collect the assertion of a successful run and return the machine to
    /// the idle slot. Only legal in `Success` state.
    pub fn take_assertion(&mut self) -> Result<Assertion> {
        if self.status() != MachineThreadState::Success {
            return Err(CoreError::InvalidArgument(format!(
                "assertion collected in state {:?}",
                self.status()
            )));
        }
        let assertion = match self.join_worker()? {
            Ok(assertion) => assertion,
            Err(err) => return Err(err),
        };
        self.remaining = self
            .run_messages
            .split_off(assertion.messages_consumed.min(self.run_messages.len()));
        self.run_messages.clear();
        self.status
            .store(MachineThreadState::None as u8, Ordering::Release);
        Ok(assertion)
    }

    /// Resume after a sideload stop, feeding the unconsumed remainder of the
    /// last message batch back to the machine.
    pub fn continue_running(&mut self) -> Result<()> {
        let messages = std::mem::take(&mut self.remaining);
        debug!(remaining = messages.len(), "resuming machine after sideload");
        self.start(ExecutionConfig {
            max_gas: None,
            go_over_gas: false,
            stop_on_sideload: self.stop_on_sideload,
            messages,
        })
    }

    /// Abort any in-flight run and discard its partial state. The machine in
    /// the idle slot afterwards is the one that went in: aborted runs leave
    /// no observable effect because the host rebuilds from a checkpoint.
    pub fn abort(&mut self) {
        self.abort.store(true, Ordering::Release);
        if matches!(self.slot, Slot::Running(_)) {
            if let Err(err) = self.join_worker() {
                warn!(error = %err, "machine worker failed during abort");
            }
            self.status
                .store(MachineThreadState::Aborted as u8, Ordering::Release);
        }
        self.abort.store(false, Ordering::Release);
    }

    /// Clear an `Aborted` or `Error` state back to `None`, returning the
    /// error string when one exists.
    pub fn clear_error(&mut self) -> Option<String> {
        match self.status() {
            MachineThreadState::Aborted | MachineThreadState::Error => {
                if matches!(self.slot, Slot::Running(_)) {
                    if let Err(err) = self.join_worker() {
                        self.error_string = Some(err.to_string());
                    }
                }
                self.status
                    .store(MachineThreadState::None as u8, Ordering::Release);
                self.error_string.take()
            }
            _ => None,
        }
    }

    fn join_worker(&mut self) -> Result<Result<Assertion>> {
        match std::mem::replace(&mut self.slot, Slot::Vacant) {
            Slot::Running(handle) => match handle.join() {
                Ok((machine, result)) => {
                    if let Err(err) = &result {
                        self.error_string = Some(err.to_string());
                    }
                    self.slot = Slot::Idle(machine);
                    Ok(result)
                }
                Err(_) => {
                    self.error_string = Some("machine worker panicked".into());
                    self.status
                        .store(MachineThreadState::Error as u8, Ordering::Release);
                    Err(CoreError::corruption("machine worker panicked"))
                }
            },
            other => {
                self.slot = other;
                Err(CoreError::InvalidArgument(
                    "no machine worker to join".into(),
                ))
            }
        }
    }
}
