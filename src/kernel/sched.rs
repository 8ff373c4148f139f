//! Round-robin scheduler
//!
//! Selection walks the creation-order ring starting just after the current
//! task, skipping zombies, and skipping the idle task whenever any other
//! task is runnable. The scheduler owns the live register file: the
//! context-switch primitive stores it into the outgoing task's saved-state
//! record and loads the incoming task's record, and the kernel run loop is
//! the only place that then resumes the incoming task.
//!
//! Reaping is two-phase: exit marks the task zombie and queues it for
//! reclaim, and the scheduler frees at most one queued task per selection
//! pass - a task cannot free the stack it is still executing on.

use super::queue::{BoundedQueue, QueueFull};
use super::task::{CpuState, TaskId, TaskState, TaskTable, Tcb};
use serde::Serialize;

/// Sentinel the scheduler pushes onto a task's kernel stack when it
/// re-selects an already-running task: the next resume runs a signal
/// delivery check before the task's own code continues.
pub const SIGNAL_CHECK: usize = usize::MAX - 0x30;

/// Counters for the diagnostic surface
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SchedStats {
    /// Selection passes performed
    pub selections: u64,
    /// Explicit yield points recorded (syscall brackets included)
    pub yields: u64,
    /// Control blocks reclaimed
    pub reclaims: u64,
    /// Signal-check sentinels consumed on resume
    pub signal_checks: u64,
}

/// Scheduler state: current task, live registers, reclaim queue, tick count
pub struct Scheduler {
    current: TaskId,
    /// The live register file of whichever task holds the CPU
    pub regs: CpuState,
    /// Ring index of the most recent selection, used to keep rotation
    /// stable when the current task has been unlinked by exit
    cursor: usize,
    reclaim: BoundedQueue<TaskId>,
    ticks: u64,
    pub stats: SchedStats,
}

impl Scheduler {
    pub fn new(reclaim_capacity: usize) -> Self {
        Self {
            current: TaskId::IDLE,
            regs: CpuState::default(),
            cursor: 0,
            reclaim: BoundedQueue::new(reclaim_capacity),
            ticks: 0,
            stats: SchedStats::default(),
        }
    }

    /// The task currently holding the CPU.
    pub fn current(&self) -> TaskId {
        self.current
    }

    pub fn set_current(&mut self, id: TaskId) {
        self.current = id;
    }

    /// Timer ticks seen so far.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Advance the tick counter. Does not itself switch tasks.
    pub fn advance_tick(&mut self) {
        self.ticks += 1;
    }

    /// Record an explicit suspension point.
    pub fn note_yield(&mut self) {
        self.stats.yields += 1;
    }

    /// Queue an exited task for the reclaim pass.
    pub fn push_reclaim(&mut self, id: TaskId) -> Result<(), QueueFull<TaskId>> {
        self.reclaim.push(id)
    }

    /// Next task awaiting reclaim, if any.
    pub fn pop_reclaim(&mut self) -> Option<TaskId> {
        self.reclaim.pop()
    }

    /// Pick the next task to run.
    ///
    /// Starts just after the current task (or at the ring slot its
    /// successor shifted into, when the current task exited and left the
    /// ring), takes the first non-zombie, and passes over idle while any
    /// other task is runnable. Falls back to idle - and thereby may
    /// re-select a task that is still `Running`.
    pub fn select(&mut self, table: &TaskTable) -> TaskId {
        self.stats.selections += 1;
        let ring = table.ring();
        let n = ring.len();
        if n == 0 {
            return self.current;
        }

        let other_runnable = ring.iter().any(|&id| {
            id != TaskId::IDLE
                && table
                    .lookup(id)
                    .is_some_and(|t| t.state != TaskState::Zombie)
        });

        // When the current task is still linked, start one past it; when it
        // exited, its successor now occupies the remembered slot.
        let (base, first_offset) = match ring.iter().position(|&id| id == self.current) {
            Some(pos) => (pos, 1),
            None => (self.cursor.min(n - 1), 0),
        };

        for step in 0..n {
            let pos = (base + first_offset + step) % n;
            let id = ring[pos];
            let Some(tcb) = table.lookup(id) else {
                continue;
            };
            if tcb.state == TaskState::Zombie {
                continue;
            }
            if id == TaskId::IDLE && other_runnable {
                continue;
            }
            self.cursor = pos;
            return id;
        }

        TaskId::IDLE
    }
}

/// The control-transfer primitive.
///
/// Stores the live register file into the outgoing task's saved-state
/// record and loads the incoming task's record. The hardware save/restore
/// and stack switch this stands in for is machine-dependent; here the move
/// is the whole transfer, and the run loop resumes the incoming task at its
/// entry callback.
pub fn context_switch(regs: &mut CpuState, outgoing: Option<&mut Tcb>, incoming: &mut Tcb) {
    if let Some(out) = outgoing {
        out.cpu = *regs;
    }
    *regs = incoming.cpu;
}
