//! System calls and the kernel context
//!
//! This is the boundary between task code and the kernel. The [`Kernel`]
//! struct is the single explicit context value: every subsystem - task
//! table, scheduler, zombie queue, sockets, rendezvous channels, console -
//! lives inside it, and every operation takes it by `&mut`. Whoever holds
//! the context holds the machine; there is no global instance.
//!
//! Syscalls follow the Linux shape without the ABI baggage:
//! - each request has a stable number read from a trap frame
//! - the dispatch table carries each handler's declared arity and how its
//!   result is written back into the return slot
//! - unknown numbers are rejected with a diagnostic, never a crash
//! - every dispatch is bracketed by two yield points, and the syscall
//!   return is a signal delivery point

use super::config::KernelConfig;
use super::fork;
use super::queue::BoundedQueue;
use super::rendezvous::{RendezvousError, RendezvousTable};
use super::sched::{context_switch, SchedStats, Scheduler, SIGNAL_CHECK};
use super::signal::{self, HandlerToken, SignalError, SignalSlot};
use super::socket::{SocketError, SocketId, SocketTable};
use super::stack::{StackError, WORD};
use super::task::{
    CpuState, Descriptor, ExitHook, Fd, TaskEntry, TaskError, TaskId, TaskState, TaskStep,
    TaskTable, Tcb,
};
use crate::klog;
use serde::Serialize;
use slab::Slab;
use std::collections::VecDeque;
use std::rc::Rc;

// ========== SYSCALL NUMBERS ==========

/// Syscall numbers
///
/// Stable numeric identifiers for the builtin requests, read out of the
/// trap frame by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum SyscallNr {
    Exit = 0,
    Write = 1,
    Read = 2,
    Open = 3,
    Close = 4,
    Getpid = 5,
    Sleep = 6,
    Kill = 7,
    Signal = 8,
}

impl SyscallNr {
    pub fn num(self) -> usize {
        self as usize
    }
}

/// How a handler's result is interpreted when written into the trap
/// frame's return slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetKind {
    /// Plain integer: truncated to 32 bits and sign-extended
    Int,
    /// Pointer-sized value, passed through
    Ptr,
    /// Size-sized value, passed through
    Size,
}

impl RetKind {
    fn apply(self, value: isize) -> isize {
        match self {
            RetKind::Int => value as i32 as isize,
            RetKind::Ptr | RetKind::Size => value,
        }
    }
}

/// A handler with its declared arity baked into the variant. The
/// dispatcher can only invoke an `N2` handler with exactly two arguments -
/// an arity mismatch is unrepresentable after construction.
#[derive(Clone, Copy)]
pub enum SyscallHandler {
    N0(fn(&mut Kernel) -> Result<isize, SyscallError>),
    N1(fn(&mut Kernel, usize) -> Result<isize, SyscallError>),
    N2(fn(&mut Kernel, usize, usize) -> Result<isize, SyscallError>),
    N3(fn(&mut Kernel, usize, usize, usize) -> Result<isize, SyscallError>),
    N4(fn(&mut Kernel, usize, usize, usize, usize) -> Result<isize, SyscallError>),
    N5(fn(&mut Kernel, usize, usize, usize, usize, usize) -> Result<isize, SyscallError>),
    N6(fn(&mut Kernel, usize, usize, usize, usize, usize, usize) -> Result<isize, SyscallError>),
}

impl SyscallHandler {
    /// Declared argument count.
    pub fn arity(&self) -> usize {
        match self {
            SyscallHandler::N0(_) => 0,
            SyscallHandler::N1(_) => 1,
            SyscallHandler::N2(_) => 2,
            SyscallHandler::N3(_) => 3,
            SyscallHandler::N4(_) => 4,
            SyscallHandler::N5(_) => 5,
            SyscallHandler::N6(_) => 6,
        }
    }
}

/// One dispatch-table entry
pub struct SyscallEntry {
    pub name: &'static str,
    pub ret: RetKind,
    pub handler: SyscallHandler,
}

/// Trap frame: request number, six argument slots, one return slot
#[derive(Debug, Clone, Copy, Default)]
pub struct TrapFrame {
    pub nr: usize,
    pub args: [usize; 6],
    pub ret: isize,
}

impl TrapFrame {
    /// Build a frame from up to six arguments.
    pub fn new(nr: usize, args: &[usize]) -> Self {
        let mut slots = [0usize; 6];
        for (slot, &arg) in slots.iter_mut().zip(args.iter()) {
            *slot = arg;
        }
        Self {
            nr,
            args: slots,
            ret: 0,
        }
    }
}

// ========== ERRORS ==========

/// Errors visible at the syscall boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyscallError {
    /// Request number outside the dispatch table
    UnknownSyscall(usize),
    /// Operation names a task that does not exist
    NoSuchTask(TaskId),
    /// Descriptor not present in the calling task's table
    BadFd(Fd),
    /// Operation cannot complete now; yield and retry
    WouldBlock,
    /// Task table or stack allocation failure
    Task(TaskError),
    /// Signal subsystem error
    Signal(SignalError),
    /// Socket subsystem error
    Socket(SocketError),
    /// Rendezvous channel error
    Rendezvous(RendezvousError),
    /// Address outside the calling task's stack region (fatal class)
    Fault(usize),
    /// The kernel has halted
    Halted,
}

impl std::fmt::Display for SyscallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyscallError::UnknownSyscall(nr) => write!(f, "unknown syscall {}", nr),
            SyscallError::NoSuchTask(id) => write!(f, "no such task: {}", id),
            SyscallError::BadFd(fd) => write!(f, "bad descriptor {}", fd),
            SyscallError::WouldBlock => write!(f, "operation would block"),
            SyscallError::Task(e) => write!(f, "{}", e),
            SyscallError::Signal(e) => write!(f, "{}", e),
            SyscallError::Socket(e) => write!(f, "{}", e),
            SyscallError::Rendezvous(e) => write!(f, "{}", e),
            SyscallError::Fault(addr) => write!(f, "invalid memory access at {:#x}", addr),
            SyscallError::Halted => write!(f, "kernel halted"),
        }
    }
}

impl std::error::Error for SyscallError {}

impl From<TaskError> for SyscallError {
    fn from(e: TaskError) -> Self {
        SyscallError::Task(e)
    }
}

impl From<StackError> for SyscallError {
    fn from(e: StackError) -> Self {
        SyscallError::Task(TaskError::Stack(e))
    }
}

impl From<SignalError> for SyscallError {
    fn from(e: SignalError) -> Self {
        SyscallError::Signal(e)
    }
}

impl From<SocketError> for SyscallError {
    fn from(e: SocketError) -> Self {
        SyscallError::Socket(e)
    }
}

impl From<RendezvousError> for SyscallError {
    fn from(e: RendezvousError) -> Self {
        SyscallError::Rendezvous(e)
    }
}

impl SyscallError {
    /// Negative sentinel written into the return slot (errno-like).
    pub fn errno(&self) -> isize {
        match self {
            SyscallError::UnknownSyscall(_) => -38,
            SyscallError::NoSuchTask(_) => -3,
            SyscallError::BadFd(_) => -9,
            SyscallError::WouldBlock => -11,
            SyscallError::Task(_) => -12,
            SyscallError::Signal(_) => -22,
            SyscallError::Socket(SocketError::NotConnected) => -107,
            SyscallError::Socket(SocketError::BufferFull) => -105,
            SyscallError::Socket(SocketError::AddressInUse) => -98,
            SyscallError::Socket(SocketError::ConnectionRefused) => -111,
            SyscallError::Socket(_) => -22,
            SyscallError::Rendezvous(RendezvousError::Busy(_)) => -11,
            SyscallError::Rendezvous(_) => -22,
            SyscallError::Fault(_) => -14,
            SyscallError::Halted => -125,
        }
    }
}

// ========== CONSOLE ==========

/// The console device backing fds 0-2: an output capture buffer plus an
/// input queue the embedder feeds.
#[derive(Debug, Default)]
pub struct Console {
    output: Vec<u8>,
    input: VecDeque<u8>,
}

impl Console {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes to the output capture. Never blocks.
    pub fn write(&mut self, data: &[u8]) -> usize {
        self.output.extend_from_slice(data);
        data.len()
    }

    /// Drain up to `out.len()` queued input bytes.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.input.len());
        for slot in out.iter_mut().take(n) {
            if let Some(byte) = self.input.pop_front() {
                *slot = byte;
            }
        }
        n
    }

    /// Queue bytes for tasks to read.
    pub fn push_input(&mut self, data: &[u8]) {
        self.input.extend(data.iter().copied());
    }

    /// Everything written so far.
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    /// Take and clear the output capture.
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }
}

// ========== DIAGNOSTICS ==========

/// Snapshot of one task for the inspection surface
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub name: String,
    pub state: TaskState,
    pub sp: usize,
    pub entry: usize,
    pub uid: u32,
    pub parent: Option<TaskId>,
}

/// Why the run loop stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Only the idle task remains runnable
    Idle,
    /// A fatal condition halted the kernel
    Halted(String),
    /// The step budget ran out with work remaining
    BudgetExhausted,
}

/// A signal handler callback registered with the kernel
pub type SignalHook = Rc<dyn Fn(&mut Kernel, TaskId, u8)>;

// ========== THE KERNEL ==========

/// The kernel context: all state, one owner
pub struct Kernel {
    config: KernelConfig,
    tasks: TaskTable,
    sched: Scheduler,
    /// Exit notifications awaiting a `wait` caller
    zombies: BoundedQueue<(TaskId, i32)>,
    sockets: SocketTable,
    rendezvous: RendezvousTable,
    console: Console,
    /// Registered signal handler callbacks, addressed by token
    hooks: Slab<SignalHook>,
    table: Vec<Option<SyscallEntry>>,
    halted: Option<String>,
}

impl Kernel {
    pub fn new() -> Self {
        Self::with_config(KernelConfig::default())
    }

    /// Build a kernel with the given sizing. Invalid sizes are replaced by
    /// defaults with a logged warning rather than rejected.
    pub fn with_config(config: KernelConfig) -> Self {
        let config = sanitize(config);
        let mut tasks = TaskTable::new(config.max_tasks);
        let idle: TaskEntry = Rc::new(|_, _| TaskStep::Yield);
        let idle_id = tasks
            .create(&config, idle, "idle", None)
            .expect("idle task always fits a sanitized config");
        debug_assert_eq!(idle_id, TaskId::IDLE);

        let mut sched = Scheduler::new(config.reclaim_queue_capacity);
        // The idle task starts as the one running task
        if let Some(tcb) = tasks.lookup_mut(idle_id) {
            tcb.state = TaskState::Running;
            sched.regs = tcb.cpu;
        }
        sched.set_current(idle_id);

        Self {
            zombies: BoundedQueue::new(config.zombie_queue_capacity),
            sockets: SocketTable::new(config.socket_buffer_size),
            rendezvous: RendezvousTable::new(),
            console: Console::new(),
            hooks: Slab::new(),
            table: builtin_table(),
            halted: None,
            tasks,
            sched,
            config,
        }
    }

    // ========== ACCESSORS ==========

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// The task currently holding the CPU.
    pub fn current(&self) -> TaskId {
        self.sched.current()
    }

    /// The live register file.
    pub fn regs(&self) -> CpuState {
        self.sched.regs
    }

    pub fn task(&self, id: TaskId) -> Option<&Tcb> {
        self.tasks.lookup(id)
    }

    pub fn task_mut(&mut self, id: TaskId) -> Option<&mut Tcb> {
        self.tasks.lookup_mut(id)
    }

    /// Number of tasks occupying the table.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn sockets(&self) -> &SocketTable {
        &self.sockets
    }

    pub fn sockets_mut(&mut self) -> &mut SocketTable {
        &mut self.sockets
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    pub fn console_mut(&mut self) -> &mut Console {
        &mut self.console
    }

    pub fn stats(&self) -> SchedStats {
        self.sched.stats
    }

    /// Ticks seen so far.
    pub fn ticks(&self) -> u64 {
        self.sched.ticks()
    }

    /// The halt reason, once a fatal condition has been reported.
    pub fn halted(&self) -> Option<&str> {
        self.halted.as_deref()
    }

    /// Inspection listing: id, name, state, stack pointer, entry cookie.
    /// Purely observational; serializable for external tooling.
    pub fn tasks(&self) -> Vec<TaskSnapshot> {
        // The arena, not the ring: zombies have left the ring but still
        // occupy the table until reclaimed
        let mut all: Vec<TaskSnapshot> = self.tasks.iter().map(|t| self.snapshot(t)).collect();
        all.sort_by_key(|s| s.id.0);
        all
    }

    fn snapshot(&self, tcb: &Tcb) -> TaskSnapshot {
        let sp = if tcb.id == self.sched.current() {
            self.sched.regs.sp
        } else {
            tcb.cpu.sp
        };
        TaskSnapshot {
            id: tcb.id,
            name: tcb.name.clone(),
            state: tcb.state,
            sp,
            entry: tcb.entry_cookie(),
            uid: tcb.uid,
            parent: tcb.parent,
        }
    }

    // ========== TASK LIFECYCLE ==========

    /// Create a task. Fails - with a log line, not a crash - when the
    /// live-task count already equals the configured maximum.
    pub fn create(
        &mut self,
        entry: TaskEntry,
        name: &str,
        on_exit: Option<ExitHook>,
    ) -> Result<TaskId, SyscallError> {
        match self.tasks.create(&self.config, entry, name, on_exit) {
            Ok(id) => Ok(id),
            Err(e) => {
                klog!("create '{}' failed: {}", name, e);
                Err(e.into())
            }
        }
    }

    /// Fork the current task from the live register snapshot. The parent
    /// sees the child id in its return register; the child's first dispatch
    /// runs the trampoline and sees zero.
    pub fn fork(&mut self) -> Result<TaskId, SyscallError> {
        self.fork_with(self.sched.regs)
    }

    /// Fork the current task from an explicit register snapshot.
    ///
    /// On any failure - table full, stack allocation, bad snapshot - no
    /// partial child is left registered.
    pub fn fork_with(&mut self, snapshot: CpuState) -> Result<TaskId, SyscallError> {
        let parent_id = self.sched.current();
        if !self.tasks.has_room() {
            let e = TaskError::TableFull {
                limit: self.config.max_tasks,
            };
            klog!("fork from {} failed: {}", parent_id, e);
            return Err(e.into());
        }
        let parent = self
            .tasks
            .lookup(parent_id)
            .ok_or(SyscallError::NoSuchTask(parent_id))?;
        let image = fork::child_image(&self.config, parent, snapshot)?;

        let id = self.tasks.next_id();
        let ksp = image.kernel_stack.top();
        self.tasks.register(Tcb {
            id,
            name: image.name,
            state: TaskState::Ready,
            cpu: image.cpu,
            user_stack: image.user_stack,
            kernel_stack: image.kernel_stack,
            ksp,
            entry: image.entry,
            on_exit: image.on_exit,
            uid: image.uid,
            euid: image.euid,
            gid: image.gid,
            parent: None,
            children: Vec::new(),
            signals: signal::SignalTable::new(),
            files: super::task::DescTable::new(),
            wake_tick: None,
        });
        self.tasks.add_child(parent_id, id);
        self.sched.regs.ret = id.0 as isize;
        Ok(id)
    }

    /// Exit processing: run the exit callback, detach from the graph,
    /// unlink from the ring, mark zombie, post the exit notification, and
    /// queue the block for reclaim. The caller's next action must be to
    /// relinquish the CPU.
    pub fn exit_task(&mut self, id: TaskId, status: i32) {
        let Some(tcb) = self.tasks.lookup(id) else {
            return;
        };
        if tcb.state == TaskState::Zombie {
            return;
        }
        let hook = tcb.on_exit.clone();
        if let Some(hook) = hook {
            hook(self, id, status);
        }

        // Release the task's IPC resources
        let _ = self.rendezvous.unbind(id);
        let sockets: Vec<SocketId> = self
            .tasks
            .lookup(id)
            .map(|t| {
                t.files
                    .iter()
                    .filter_map(|(_, d)| match d {
                        Descriptor::Socket(sid) => Some(sid),
                        Descriptor::Console => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        for sid in sockets {
            let _ = self.sockets.close(sid);
        }

        self.tasks.detach_from_parent(id);
        self.tasks.detach_children(id);
        self.tasks.unlink_ring(id);
        if let Some(tcb) = self.tasks.lookup_mut(id) {
            tcb.state = TaskState::Zombie;
        }

        if self.zombies.push((id, status)).is_err() {
            klog!("zombie queue full: exit of {} (status {}) dropped", id, status);
        }
        if self.sched.push_reclaim(id).is_err() {
            klog!("reclaim queue full: {} leaks until the table drains", id);
        }
        self.sched.note_yield();
    }

    /// Exit the current task.
    pub fn exit_current(&mut self, status: i32) {
        self.exit_task(self.sched.current(), status);
    }

    /// Consume the next exit notification.
    ///
    /// This is a reap-any contract: the zombie queue is global, so the
    /// returned (id, status) pair may belong to any exited task, not
    /// specifically a child of the caller. Each entry is delivered exactly
    /// once. An empty queue reports `WouldBlock`: yield and retry.
    pub fn sys_wait(&mut self) -> Result<(TaskId, i32), SyscallError> {
        match self.zombies.pop() {
            Some(entry) => Ok(entry),
            None => {
                self.sched.note_yield();
                Err(SyscallError::WouldBlock)
            }
        }
    }

    // ========== SCHEDULING ==========

    /// Advance the timer tick. Services pending sleeps on their next
    /// dispatch; does not itself switch tasks.
    pub fn tick(&mut self) {
        self.sched.advance_tick();
    }

    /// One reclaim pass: free at most one previously-exited task's control
    /// block and stacks. The current task is never reclaimed out from
    /// under itself.
    fn reclaim_one(&mut self) {
        if let Some(id) = self.sched.pop_reclaim() {
            if id == self.sched.current() {
                let _ = self.sched.push_reclaim(id);
                return;
            }
            if self.tasks.remove(id).is_some() {
                self.sched.stats.reclaims += 1;
            }
        }
    }

    /// Select and switch to the next task, returning its id.
    ///
    /// Runs one reclaim pass first, then round-robin selection. When the
    /// selection lands on the task that never stopped running (idle as the
    /// only runnable task), its kernel stack is instrumented so a signal
    /// check runs immediately on resume instead of a full transfer.
    pub fn schedule(&mut self) -> TaskId {
        self.reclaim_one();
        let prev = self.sched.current();
        let next = self.sched.select(&self.tasks);

        if next == prev {
            if let Some(tcb) = self.tasks.lookup_mut(next) {
                // One outstanding sentinel is enough for one resume
                if tcb.state == TaskState::Running
                    && tcb.kernel_stack.read_word(tcb.ksp) != Ok(SIGNAL_CHECK)
                {
                    if let Ok(ksp) = tcb.kernel_stack.push_word(tcb.ksp, SIGNAL_CHECK) {
                        tcb.ksp = ksp;
                    }
                }
            }
            return next;
        }

        let (outgoing, incoming) = self.tasks.pair_mut(prev, next);
        let Some(incoming) = incoming else {
            return prev;
        };
        // A zombie's saved state is dead; only a still-running outgoing
        // task has live registers worth storing back
        let mut outgoing = outgoing.filter(|t| t.state == TaskState::Running);
        if let Some(out) = outgoing.as_mut() {
            out.state = TaskState::Ready;
        }
        context_switch(&mut self.sched.regs, outgoing, incoming);
        incoming.state = TaskState::Running;
        fork::consume_trampoline(&incoming.user_stack, &mut self.sched.regs);
        self.sched.set_current(next);
        next
    }

    /// Dispatch the current task's entry once.
    ///
    /// Consumes any signal-check sentinels the scheduler left on the
    /// incoming kernel stack, runs the entry, and applies its reported
    /// step. Returns the task that ran, or `None` once the kernel halts.
    pub fn step(&mut self) -> Option<TaskId> {
        if self.halted.is_some() {
            return None;
        }
        let id = self.schedule();

        // Resume-time signal checks injected by the scheduler
        loop {
            let Some(tcb) = self.tasks.lookup_mut(id) else {
                return Some(id);
            };
            if tcb.kernel_stack.read_word(tcb.ksp) == Ok(SIGNAL_CHECK) {
                tcb.ksp += WORD;
                self.sched.stats.signal_checks += 1;
                self.deliver_signals(id);
                if self.halted.is_some() {
                    return None;
                }
            } else {
                break;
            }
        }

        // Every resume is an interrupt-return-style delivery point
        self.deliver_signals(id);
        if self.halted.is_some() {
            return None;
        }

        let Some(tcb) = self.tasks.lookup(id) else {
            return Some(id);
        };
        if tcb.state != TaskState::Running {
            // Killed during a resume-time delivery
            return Some(id);
        }
        let entry = tcb.entry.clone();
        let step = entry(self, id);
        if self.halted.is_some() {
            return None;
        }
        if self
            .tasks
            .lookup(id)
            .is_some_and(|t| t.state != TaskState::Zombie)
        {
            match step {
                TaskStep::Yield => self.sched.note_yield(),
                TaskStep::Exit(status) => self.exit_task(id, status),
            }
        }
        Some(id)
    }

    /// Run until only the idle task remains, a fatal condition halts the
    /// kernel, or the step budget runs out.
    pub fn run(&mut self, max_steps: u64) -> RunOutcome {
        for _ in 0..max_steps {
            if let Some(reason) = &self.halted {
                return RunOutcome::Halted(reason.clone());
            }
            if !self.has_runnable_work() {
                return RunOutcome::Idle;
            }
            self.step();
        }
        if let Some(reason) = &self.halted {
            RunOutcome::Halted(reason.clone())
        } else if self.has_runnable_work() {
            RunOutcome::BudgetExhausted
        } else {
            RunOutcome::Idle
        }
    }

    fn has_runnable_work(&self) -> bool {
        self.tasks.ring().iter().any(|&id| {
            id != TaskId::IDLE
                && self
                    .tasks
                    .lookup(id)
                    .is_some_and(|t| t.state != TaskState::Zombie)
        })
    }

    /// Report a fatal condition and halt: log the reason and a task-table
    /// dump, then refuse further dispatch. There is no underlying OS to
    /// isolate the fault, so nothing is recovered.
    pub fn fatal(&mut self, reason: String) {
        if self.halted.is_some() {
            return;
        }
        klog!("kernel halted: {}", reason);
        for snap in self.tasks() {
            klog!(
                "  {} '{}' {:?} sp={:#x} entry={:#x}",
                snap.id,
                snap.name,
                snap.state,
                snap.sp,
                snap.entry
            );
        }
        self.halted = Some(reason);
    }

    // ========== SIGNALS ==========

    /// Register a signal handler callback, returning its token for use
    /// with the `signal` syscall.
    pub fn register_handler(&mut self, hook: SignalHook) -> HandlerToken {
        HandlerToken(self.hooks.insert(hook))
    }

    /// Raise `sig` on `target`. A task signalling itself gets immediate
    /// delivery; anyone else is marked pending and delivered at the
    /// target's next delivery point.
    pub fn sys_kill(&mut self, target: TaskId, sig: u8) -> Result<(), SyscallError> {
        let Some(tcb) = self.tasks.lookup_mut(target) else {
            return Err(SyscallError::NoSuchTask(target));
        };
        tcb.signals.raise(sig)?;
        if target == self.sched.current() {
            self.deliver_signals(target);
        }
        Ok(())
    }

    /// Bind `sig` of the current task to a registered handler. Returns the
    /// previously bound token, or zero.
    pub fn sys_signal(&mut self, sig: u8, token: HandlerToken) -> Result<isize, SyscallError> {
        if !self.hooks.contains(token.0) {
            return Err(SyscallError::Signal(SignalError::InvalidSignal(sig)));
        }
        let current = self.sched.current();
        let tcb = self
            .tasks
            .lookup_mut(current)
            .ok_or(SyscallError::NoSuchTask(current))?;
        let previous = tcb.signals.bind(sig, SignalSlot::Handler(token))?;
        Ok(match previous {
            SignalSlot::Handler(t) => t.0 as isize,
            _ => 0,
        })
    }

    /// Drain `id`'s pending signals in numeric order. The pending set is
    /// snapshotted at entry and each bit cleared before its handler runs,
    /// so a handler re-raising its own signal is deferred to the next
    /// delivery pass instead of re-entered.
    pub fn deliver_signals(&mut self, id: TaskId) {
        let mask = match self.tasks.lookup(id) {
            Some(tcb) => tcb.signals.pending_mask(),
            None => return,
        };
        for sig in 0..signal::NSIG as u8 {
            if mask & (1u32 << sig) == 0 {
                continue;
            }
            if self.halted.is_some() {
                return;
            }
            let taken = self
                .tasks
                .lookup_mut(id)
                .map(|t| t.signals.take(sig))
                .unwrap_or(false);
            if !taken {
                continue;
            }
            let slot = self
                .tasks
                .lookup(id)
                .and_then(|t| t.signals.slot(sig).ok())
                .unwrap_or(SignalSlot::Default);
            match slot {
                SignalSlot::Default => match signal::describe(sig) {
                    Some(what) => klog!("{}: unhandled signal {} ({})", id, sig, what),
                    None => klog!("{}: unhandled signal {}", id, sig),
                },
                SignalSlot::Fatal => {
                    let what = signal::describe(sig).unwrap_or("fatal signal");
                    self.fatal(format!("{} in {} (signal {})", what, id, sig));
                    return;
                }
                SignalSlot::Kill => {
                    self.exit_task(id, 128 + sig as i32);
                    return;
                }
                SignalSlot::Handler(token) => {
                    let hook = self.hooks.get(token.0).cloned();
                    match hook {
                        Some(hook) => hook(self, id, sig),
                        None => klog!("{}: signal {} bound to a stale handler", id, sig),
                    }
                }
            }
        }
    }

    // ========== SOCKETS ==========

    /// Create a socket and a descriptor for it in the current task.
    pub fn sys_socket(
        &mut self,
        domain: i32,
        stype: i32,
        protocol: i32,
    ) -> Result<Fd, SyscallError> {
        let sid = self.sockets.create(domain, stype, protocol)?;
        let current = self.sched.current();
        let tcb = self
            .tasks
            .lookup_mut(current)
            .ok_or(SyscallError::NoSuchTask(current))?;
        Ok(tcb.files.alloc(Descriptor::Socket(sid)))
    }

    /// Bind the socket behind `fd` to a registry address.
    pub fn sys_bind(&mut self, fd: Fd, address: &str) -> Result<(), SyscallError> {
        let sid = self.resolve_socket(fd)?;
        Ok(self.sockets.bind(sid, address)?)
    }

    /// Connect the socket behind `fd` to whatever is bound at `address`.
    pub fn sys_connect(&mut self, fd: Fd, address: &str) -> Result<(), SyscallError> {
        let sid = self.resolve_socket(fd)?;
        self.sockets.connect_by_name(sid, address)?;
        Ok(())
    }

    /// Send on the socket behind `fd`. Partial writes are success.
    pub fn sys_send(&mut self, fd: Fd, data: &[u8]) -> Result<usize, SyscallError> {
        let sid = self.resolve_socket(fd)?;
        Ok(self.sockets.send(sid, data)?)
    }

    /// Receive from the socket behind `fd`. Partial reads are success.
    pub fn sys_recv(&mut self, fd: Fd, out: &mut [u8]) -> Result<usize, SyscallError> {
        let sid = self.resolve_socket(fd)?;
        Ok(self.sockets.recv(sid, out)?)
    }

    /// Close a descriptor; a socket descriptor disconnects and releases
    /// the socket.
    pub fn sys_close(&mut self, fd: Fd) -> Result<(), SyscallError> {
        let current = self.sched.current();
        let tcb = self
            .tasks
            .lookup_mut(current)
            .ok_or(SyscallError::NoSuchTask(current))?;
        match tcb.files.remove(fd) {
            Some(Descriptor::Socket(sid)) => Ok(self.sockets.close(sid)?),
            Some(Descriptor::Console) => Ok(()),
            None => Err(SyscallError::BadFd(fd)),
        }
    }

    fn resolve_socket(&self, fd: Fd) -> Result<SocketId, SyscallError> {
        let current = self.sched.current();
        let tcb = self
            .tasks
            .lookup(current)
            .ok_or(SyscallError::NoSuchTask(current))?;
        match tcb.files.get(fd) {
            Some(Descriptor::Socket(sid)) => Ok(sid),
            _ => Err(SyscallError::BadFd(fd)),
        }
    }

    // ========== RENDEZVOUS IPC ==========

    /// Bind a rendezvous channel to the current task.
    pub fn ipc_bind(&mut self) -> Result<(), SyscallError> {
        Ok(self.rendezvous.bind(self.sched.current())?)
    }

    /// Deposit a message in `to`'s channel and wake it.
    pub fn ipc_send(&mut self, to: TaskId, data: &[u8]) -> Result<usize, SyscallError> {
        if !self.tasks.contains(to) {
            return Err(SyscallError::NoSuchTask(to));
        }
        self.rendezvous.deposit(to, data.to_vec())?;
        // Wake the receiver; it spins in Ready, so this only matters when
        // the embedder parked it
        if to != self.sched.current() {
            if let Some(tcb) = self.tasks.lookup_mut(to) {
                if tcb.state != TaskState::Zombie {
                    tcb.state = TaskState::Ready;
                }
            }
        }
        Ok(data.len())
    }

    /// Take the message from the current task's channel. An empty slot
    /// reports `WouldBlock`: yield and retry on the next dispatch.
    pub fn ipc_recv(&mut self) -> Result<Vec<u8>, SyscallError> {
        match self.rendezvous.take(self.sched.current())? {
            Some(data) => Ok(data),
            None => {
                self.sched.note_yield();
                Err(SyscallError::WouldBlock)
            }
        }
    }

    // ========== SYSCALL DISPATCH ==========

    /// Dispatch a trap frame.
    ///
    /// Rejects out-of-range numbers, brackets the handler with two yield
    /// points, delivers pending signals at syscall return, and writes the
    /// result - or a negative sentinel - into the frame's return slot.
    pub fn dispatch(&mut self, frame: &mut TrapFrame) {
        self.syscall_yield();
        let result = self.invoke(frame);
        self.syscall_yield();
        let current = self.sched.current();
        self.deliver_signals(current);

        frame.ret = match result {
            Ok(value) => {
                let kind = self
                    .table
                    .get(frame.nr)
                    .and_then(|e| e.as_ref())
                    .map(|e| e.ret)
                    .unwrap_or(RetKind::Int);
                kind.apply(value)
            }
            Err(e) => {
                let name = self
                    .table
                    .get(frame.nr)
                    .and_then(|e| e.as_ref())
                    .map(|e| e.name);
                match name {
                    Some(name) => klog!("syscall {} failed: {}", name, e),
                    None => klog!("syscall {} rejected: {}", frame.nr, e),
                }
                e.errno()
            }
        };
        self.sched.regs.ret = frame.ret;
    }

    fn invoke(&mut self, frame: &TrapFrame) -> Result<isize, SyscallError> {
        if self.halted.is_some() {
            return Err(SyscallError::Halted);
        }
        let handler = self
            .table
            .get(frame.nr)
            .and_then(|e| e.as_ref())
            .map(|e| e.handler)
            .ok_or(SyscallError::UnknownSyscall(frame.nr))?;
        let a = frame.args;
        match handler {
            SyscallHandler::N0(f) => f(self),
            SyscallHandler::N1(f) => f(self, a[0]),
            SyscallHandler::N2(f) => f(self, a[0], a[1]),
            SyscallHandler::N3(f) => f(self, a[0], a[1], a[2]),
            SyscallHandler::N4(f) => f(self, a[0], a[1], a[2], a[3]),
            SyscallHandler::N5(f) => f(self, a[0], a[1], a[2], a[3], a[4]),
            SyscallHandler::N6(f) => f(self, a[0], a[1], a[2], a[3], a[4], a[5]),
        }
    }

    /// One bracketing yield: the suspension point is recorded and a
    /// reclaim pass runs. The run loop, not the dispatcher, performs the
    /// actual control transfer.
    fn syscall_yield(&mut self) {
        self.sched.note_yield();
        self.reclaim_one();
    }

    // ========== BUILTIN HANDLER BODIES ==========

    /// Copy `len` bytes at `addr` out of the current task's user stack.
    /// An address outside the region is the fatal invalid-access class.
    fn user_read(&mut self, addr: usize, len: usize) -> Result<Vec<u8>, SyscallError> {
        let current = self.sched.current();
        let data = self
            .tasks
            .lookup(current)
            .and_then(|t| t.user_stack.read_bytes(addr, len).ok().map(|b| b.to_vec()));
        match data {
            Some(data) => Ok(data),
            None => {
                self.fatal(format!("invalid memory access at {:#x} by {}", addr, current));
                Err(SyscallError::Fault(addr))
            }
        }
    }

    /// Copy `data` into the current task's user stack at `addr`.
    fn user_write(&mut self, addr: usize, data: &[u8]) -> Result<(), SyscallError> {
        let current = self.sched.current();
        let ok = self
            .tasks
            .lookup_mut(current)
            .map(|t| t.user_stack.write_bytes(addr, data).is_ok())
            .unwrap_or(false);
        if ok {
            Ok(())
        } else {
            self.fatal(format!("invalid memory access at {:#x} by {}", addr, current));
            Err(SyscallError::Fault(addr))
        }
    }

    fn sys_write(&mut self, fd: Fd, addr: usize, len: usize) -> Result<isize, SyscallError> {
        let current = self.sched.current();
        let desc = self
            .tasks
            .lookup(current)
            .and_then(|t| t.files.get(fd))
            .ok_or(SyscallError::BadFd(fd))?;
        let data = self.user_read(addr, len)?;
        match desc {
            Descriptor::Console => Ok(self.console.write(&data) as isize),
            Descriptor::Socket(sid) => Ok(self.sockets.send(sid, &data)? as isize),
        }
    }

    fn sys_read(&mut self, fd: Fd, addr: usize, len: usize) -> Result<isize, SyscallError> {
        let current = self.sched.current();
        let desc = self
            .tasks
            .lookup(current)
            .and_then(|t| t.files.get(fd))
            .ok_or(SyscallError::BadFd(fd))?;
        // A transfer longer than the whole stack region cannot be valid;
        // reject it before staging the buffer
        if len > self.config.user_stack_size {
            self.fatal(format!("invalid memory access at {:#x} by {}", addr, current));
            return Err(SyscallError::Fault(addr));
        }
        let mut buf = vec![0u8; len];
        let n = match desc {
            Descriptor::Console => self.console.read(&mut buf),
            Descriptor::Socket(sid) => self.sockets.recv(sid, &mut buf)?,
        };
        self.user_write(addr, &buf[..n])?;
        Ok(n as isize)
    }

    /// `open(addr, len)`: the bytes name a registry address; a fresh
    /// socket is created, spliced to whatever is bound there, and handed
    /// back as a descriptor.
    fn sys_open(&mut self, addr: usize, len: usize) -> Result<isize, SyscallError> {
        let name_bytes = self.user_read(addr, len)?;
        let name = String::from_utf8_lossy(&name_bytes).into_owned();
        let sid = self.sockets.create(super::socket::AF_LOCAL, super::socket::SOCK_STREAM, 0)?;
        if let Err(e) = self.sockets.connect_by_name(sid, &name) {
            let _ = self.sockets.close(sid);
            return Err(e.into());
        }
        let current = self.sched.current();
        let tcb = self
            .tasks
            .lookup_mut(current)
            .ok_or(SyscallError::NoSuchTask(current))?;
        Ok(tcb.files.alloc(Descriptor::Socket(sid)).0 as isize)
    }

    fn sys_sleep(&mut self, ticks: u64) -> Result<isize, SyscallError> {
        let now = self.sched.ticks();
        let current = self.sched.current();
        let tcb = self
            .tasks
            .lookup_mut(current)
            .ok_or(SyscallError::NoSuchTask(current))?;
        match tcb.wake_tick {
            None => {
                tcb.wake_tick = Some(now + ticks);
                self.sched.note_yield();
                Err(SyscallError::WouldBlock)
            }
            Some(target) if now < target => {
                self.sched.note_yield();
                Err(SyscallError::WouldBlock)
            }
            Some(_) => {
                tcb.wake_tick = None;
                Ok(0)
            }
        }
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

/// Replace unusable config values with defaults, loudly.
fn sanitize(mut config: KernelConfig) -> KernelConfig {
    let defaults = KernelConfig::default();
    if config.max_tasks == 0 {
        klog!("config: max_tasks 0 is unusable, using {}", defaults.max_tasks);
        config.max_tasks = defaults.max_tasks;
    }
    if config.user_stack_size == 0 || config.user_stack_size % WORD != 0 {
        klog!(
            "config: bad user_stack_size {}, using {}",
            config.user_stack_size,
            defaults.user_stack_size
        );
        config.user_stack_size = defaults.user_stack_size;
    }
    if config.kernel_stack_size == 0 || config.kernel_stack_size % WORD != 0 {
        klog!(
            "config: bad kernel_stack_size {}, using {}",
            config.kernel_stack_size,
            defaults.kernel_stack_size
        );
        config.kernel_stack_size = defaults.kernel_stack_size;
    }
    config
}

/// The builtin dispatch table. Each entry carries the handler, its arity
/// (in the variant), and the return interpretation.
fn builtin_table() -> Vec<Option<SyscallEntry>> {
    let mut table: Vec<Option<SyscallEntry>> = Vec::new();
    let mut install = |table: &mut Vec<Option<SyscallEntry>>,
                       nr: SyscallNr,
                       name: &'static str,
                       ret: RetKind,
                       handler: SyscallHandler| {
        let idx = nr.num();
        if table.len() <= idx {
            table.resize_with(idx + 1, || None);
        }
        table[idx] = Some(SyscallEntry { name, ret, handler });
    };

    install(
        &mut table,
        SyscallNr::Exit,
        "exit",
        RetKind::Int,
        SyscallHandler::N1(|k, status| {
            k.exit_current(status as isize as i32);
            Ok(0)
        }),
    );
    install(
        &mut table,
        SyscallNr::Write,
        "write",
        RetKind::Size,
        SyscallHandler::N3(|k, fd, addr, len| k.sys_write(Fd(fd as u32), addr, len)),
    );
    install(
        &mut table,
        SyscallNr::Read,
        "read",
        RetKind::Size,
        SyscallHandler::N3(|k, fd, addr, len| k.sys_read(Fd(fd as u32), addr, len)),
    );
    install(
        &mut table,
        SyscallNr::Open,
        "open",
        RetKind::Int,
        SyscallHandler::N2(|k, addr, len| k.sys_open(addr, len)),
    );
    install(
        &mut table,
        SyscallNr::Close,
        "close",
        RetKind::Int,
        SyscallHandler::N1(|k, fd| k.sys_close(Fd(fd as u32)).map(|_| 0)),
    );
    install(
        &mut table,
        SyscallNr::Getpid,
        "getpid",
        RetKind::Int,
        SyscallHandler::N0(|k| Ok(k.current().0 as isize)),
    );
    install(
        &mut table,
        SyscallNr::Sleep,
        "sleep",
        RetKind::Int,
        SyscallHandler::N1(|k, ticks| k.sys_sleep(ticks as u64)),
    );
    install(
        &mut table,
        SyscallNr::Kill,
        "kill",
        RetKind::Int,
        SyscallHandler::N2(|k, id, sig| {
            k.sys_kill(TaskId(id as u32), sig as u8).map(|_| 0)
        }),
    );
    install(
        &mut table,
        SyscallNr::Signal,
        "signal",
        RetKind::Int,
        SyscallHandler::N2(|k, sig, token| k.sys_signal(sig as u8, HandlerToken(token))),
    );

    table
}
