//! Signals
//!
//! Each task carries a fixed table of 32 signal slots: a pending bitmask
//! plus one handler binding per slot. Raising a signal sets a bit; delivery
//! drains the bits in numeric order, clearing each one *before* running its
//! handler so a handler that re-raises its own signal is deferred to the
//! next delivery pass instead of re-entered.
//!
//! Slots 0, 6, 13, and 14 ship pre-bound to the fatal handler - they stand
//! in for the CPU exception class (divide error, invalid opcode, protection
//! fault, page fault) that a kernel cannot sensibly continue past. The
//! table allows rebinding them, but the default configuration halts.

use super::task::TaskId;

/// Number of signal slots per task
pub const NSIG: usize = 32;

/// Signals pre-bound to the fatal handler in the default configuration
pub const FATAL_SIGNALS: [u8; 4] = [0, 6, 13, 14];

/// Handle to a callback registered with the kernel's handler registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerToken(pub usize);

/// What a delivered signal does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalSlot {
    /// Log the delivery and continue
    #[default]
    Default,
    /// Halt the whole kernel
    Fatal,
    /// Force the target task's exit
    Kill,
    /// Run a registered callback
    Handler(HandlerToken),
}

/// Signal errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalError {
    /// Signal number outside the table
    InvalidSignal(u8),
    /// Target task does not exist
    NoSuchTask(TaskId),
}

impl std::fmt::Display for SignalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalError::InvalidSignal(n) => write!(f, "invalid signal {}", n),
            SignalError::NoSuchTask(id) => write!(f, "no such task: {}", id),
        }
    }
}

impl std::error::Error for SignalError {}

/// Short description of the exception-class signals, if known.
pub fn describe(signal: u8) -> Option<&'static str> {
    match signal {
        0 => Some("divide error"),
        6 => Some("invalid opcode"),
        13 => Some("general protection fault"),
        14 => Some("page fault"),
        _ => None,
    }
}

/// Per-task signal state: pending bitmask plus handler bindings
#[derive(Debug, Clone)]
pub struct SignalTable {
    pending: u32,
    slots: [SignalSlot; NSIG],
}

impl SignalTable {
    /// Create a table with default bindings and the fatal pre-binds.
    pub fn new() -> Self {
        let mut slots = [SignalSlot::Default; NSIG];
        for &n in &FATAL_SIGNALS {
            slots[n as usize] = SignalSlot::Fatal;
        }
        Self { pending: 0, slots }
    }

    /// Mark `signal` pending.
    pub fn raise(&mut self, signal: u8) -> Result<(), SignalError> {
        if signal as usize >= NSIG {
            return Err(SignalError::InvalidSignal(signal));
        }
        self.pending |= 1 << signal;
        Ok(())
    }

    /// Whether any signal is pending.
    pub fn any_pending(&self) -> bool {
        self.pending != 0
    }

    /// Whether `signal` is pending.
    pub fn is_pending(&self, signal: u8) -> bool {
        (signal as usize) < NSIG && self.pending & (1 << signal) != 0
    }

    /// Take the lowest-numbered pending signal, clearing its bit.
    pub fn take_next(&mut self) -> Option<u8> {
        if self.pending == 0 {
            return None;
        }
        let signal = self.pending.trailing_zeros() as u8;
        self.pending &= !(1 << signal);
        Some(signal)
    }

    /// The raw pending bitmask. Delivery snapshots this at the start of a
    /// pass so bits raised by handlers wait for the next pass.
    pub fn pending_mask(&self) -> u32 {
        self.pending
    }

    /// Clear `signal`'s bit, reporting whether it was set.
    pub fn take(&mut self, signal: u8) -> bool {
        if signal as usize >= NSIG {
            return false;
        }
        let was_set = self.pending & (1 << signal) != 0;
        self.pending &= !(1 << signal);
        was_set
    }

    /// Rebind `signal`, returning the previous binding.
    pub fn bind(&mut self, signal: u8, slot: SignalSlot) -> Result<SignalSlot, SignalError> {
        if signal as usize >= NSIG {
            return Err(SignalError::InvalidSignal(signal));
        }
        let previous = self.slots[signal as usize];
        self.slots[signal as usize] = slot;
        Ok(previous)
    }

    /// Current binding of `signal`.
    pub fn slot(&self, signal: u8) -> Result<SignalSlot, SignalError> {
        if signal as usize >= NSIG {
            return Err(SignalError::InvalidSignal(signal));
        }
        Ok(self.slots[signal as usize])
    }
}

impl Default for SignalTable {
    fn default() -> Self {
        Self::new()
    }
}
