//! Task control blocks and the task table
//!
//! A task is one cooperatively-scheduled execution context: an entry
//! callback, a saved register snapshot, and two owned stack regions. Tasks
//! live in a dense arena indexed by a stable numeric id; scheduling order is
//! a separate creation-order ring, so a zombie can leave the ring while its
//! control block (and stacks) survive until the reclaim pass.

use super::config::KernelConfig;
use super::signal::SignalTable;
use super::socket::SocketId;
use super::stack::{StackError, StackRegion};
use super::syscall::Kernel;
use serde::Serialize;
use slab::Slab;
use std::collections::HashMap;
use std::rc::Rc;

/// Task identifier. Ids are handed out in strictly increasing order and
/// never reused while the table holds live tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TaskId(pub u32);

impl TaskId {
    /// The distinguished idle task created at kernel init
    pub const IDLE: TaskId = TaskId(0);
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task:{}", self.0)
    }
}

/// Task lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskState {
    /// Eligible for dispatch
    Ready,
    /// Currently holding the CPU
    Running,
    /// Exited; control block retained until the reclaim pass
    Zombie,
}

/// What a task's entry reports back to the run loop after one dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStep {
    /// Relinquish the CPU; run again on a later dispatch
    Yield,
    /// Finished with this exit status
    Exit(i32),
}

/// The saved register file of a suspended task
///
/// `sp`/`bp` are addresses into the task's user stack region; `ret` is the
/// scalar return-value register (fork results and syscall returns land
/// here).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuState {
    pub sp: usize,
    pub bp: usize,
    pub ret: isize,
}

/// Sentinel return address primed at the top of every new user stack. A
/// task entry that returns normally "lands" here, which the run loop turns
/// into the exit path.
pub const EXIT_TRAMPOLINE: usize = usize::MAX - 0x10;

/// A task's entry callback. Shared behind `Rc` so fork can hand the child
/// an identical copy.
pub type TaskEntry = Rc<dyn Fn(&mut Kernel, TaskId) -> TaskStep>;

/// Optional callback run at the start of exit processing.
pub type ExitHook = Rc<dyn Fn(&mut Kernel, TaskId, i32)>;

/// File descriptor - an index into a task's descriptor table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Fd(pub u32);

impl Fd {
    pub const STDIN: Fd = Fd(0);
    pub const STDOUT: Fd = Fd(1);
    pub const STDERR: Fd = Fd(2);
}

impl std::fmt::Display for Fd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fd:{}", self.0)
    }
}

/// What a descriptor refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Descriptor {
    /// The shared kernel console
    Console,
    /// A ring-buffer socket endpoint
    Socket(SocketId),
}

/// A task's descriptor table
#[derive(Debug)]
pub struct DescTable {
    next_fd: u32,
    table: HashMap<Fd, Descriptor>,
}

impl DescTable {
    /// New table with fds 0-2 wired to the console.
    pub fn new() -> Self {
        let mut table = HashMap::new();
        table.insert(Fd::STDIN, Descriptor::Console);
        table.insert(Fd::STDOUT, Descriptor::Console);
        table.insert(Fd::STDERR, Descriptor::Console);
        Self { next_fd: 3, table }
    }

    /// Allocate a descriptor for `target`.
    pub fn alloc(&mut self, target: Descriptor) -> Fd {
        let fd = Fd(self.next_fd);
        self.next_fd += 1;
        self.table.insert(fd, target);
        fd
    }

    pub fn get(&self, fd: Fd) -> Option<Descriptor> {
        self.table.get(&fd).copied()
    }

    pub fn remove(&mut self, fd: Fd) -> Option<Descriptor> {
        self.table.remove(&fd)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// All descriptors and their targets.
    pub fn iter(&self) -> impl Iterator<Item = (Fd, Descriptor)> + '_ {
        self.table.iter().map(|(fd, d)| (*fd, *d))
    }
}

impl Default for DescTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Task-table errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    /// Live-task count already equals the configured maximum
    TableFull { limit: usize },
    /// Stack allocation or priming failed
    Stack(StackError),
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskError::TableFull { limit } => write!(f, "task table full ({} tasks)", limit),
            TaskError::Stack(e) => write!(f, "stack error: {}", e),
        }
    }
}

impl std::error::Error for TaskError {}

impl From<StackError> for TaskError {
    fn from(e: StackError) -> Self {
        TaskError::Stack(e)
    }
}

/// One task control block
pub struct Tcb {
    pub id: TaskId,
    pub name: String,
    pub state: TaskState,
    /// Saved register file; live registers sit in the scheduler while the
    /// task holds the CPU
    pub cpu: CpuState,
    pub user_stack: StackRegion,
    pub kernel_stack: StackRegion,
    /// Kernel-stack pointer; the scheduler pushes resume-time sentinels here
    pub ksp: usize,
    pub entry: TaskEntry,
    pub on_exit: Option<ExitHook>,
    pub uid: u32,
    pub euid: u32,
    pub gid: u32,
    /// Back-reference to the parent; cleared if the parent exits first
    pub parent: Option<TaskId>,
    pub children: Vec<TaskId>,
    pub signals: SignalTable,
    pub files: DescTable,
    /// Tick at which a pending sleep completes
    pub wake_tick: Option<u64>,
}

impl Tcb {
    pub fn is_alive(&self) -> bool {
        self.state != TaskState::Zombie
    }

    /// Opaque identity of the entry callback, for diagnostics.
    pub fn entry_cookie(&self) -> usize {
        Rc::as_ptr(&self.entry) as *const () as usize
    }
}

/// The set of live tasks: dense arena plus creation-order scheduling ring
pub struct TaskTable {
    slots: Slab<Tcb>,
    by_id: HashMap<TaskId, usize>,
    ring: Vec<TaskId>,
    next_id: u32,
    max_tasks: usize,
}

impl TaskTable {
    pub fn new(max_tasks: usize) -> Self {
        Self {
            slots: Slab::with_capacity(max_tasks),
            by_id: HashMap::new(),
            ring: Vec::new(),
            next_id: 0,
            max_tasks,
        }
    }

    /// Number of tasks occupying the table (zombies included until
    /// reclaimed - their stacks are still held).
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The scheduling ring, in creation order. Zombies are unlinked at
    /// exit, so every member is dispatchable.
    pub fn ring(&self) -> &[TaskId] {
        &self.ring
    }

    /// Create a task: allocate both stacks, prime the saved state so the
    /// first dispatch enters `entry` and a normal return lands in the exit
    /// trampoline, and append to the ring.
    pub fn create(
        &mut self,
        cfg: &KernelConfig,
        entry: TaskEntry,
        name: &str,
        on_exit: Option<ExitHook>,
    ) -> Result<TaskId, TaskError> {
        if self.slots.len() >= self.max_tasks {
            return Err(TaskError::TableFull {
                limit: self.max_tasks,
            });
        }

        let mut user_stack = StackRegion::new(cfg.user_stack_size)?;
        let kernel_stack = StackRegion::new(cfg.kernel_stack_size)?;
        let sp = user_stack.push_word(user_stack.top(), EXIT_TRAMPOLINE)?;
        let ksp = kernel_stack.top();

        let mut name = name.to_string();
        if name.len() > cfg.task_name_max {
            let mut cut = cfg.task_name_max;
            while !name.is_char_boundary(cut) {
                cut -= 1;
            }
            name.truncate(cut);
        }

        let id = self.next_id();
        let tcb = Tcb {
            id,
            name,
            state: TaskState::Ready,
            cpu: CpuState { sp, bp: 0, ret: 0 },
            user_stack,
            kernel_stack,
            ksp,
            entry,
            on_exit,
            uid: 0,
            euid: 0,
            gid: 0,
            parent: None,
            children: Vec::new(),
            signals: SignalTable::new(),
            files: DescTable::new(),
            wake_tick: None,
        };
        self.register(tcb);
        Ok(id)
    }

    /// Hand out the next task id. Strictly increasing; gaps are fine.
    pub(crate) fn next_id(&mut self) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Whether one more task fits.
    pub fn has_room(&self) -> bool {
        self.slots.len() < self.max_tasks
    }

    /// Insert a fully-built control block and link it into the ring.
    pub(crate) fn register(&mut self, tcb: Tcb) {
        let id = tcb.id;
        let slot = self.slots.insert(tcb);
        self.by_id.insert(id, slot);
        self.ring.push(id);
    }

    pub fn lookup(&self, id: TaskId) -> Option<&Tcb> {
        self.by_id.get(&id).map(|&slot| &self.slots[slot])
    }

    pub fn lookup_mut(&mut self, id: TaskId) -> Option<&mut Tcb> {
        match self.by_id.get(&id) {
            Some(&slot) => self.slots.get_mut(slot),
            None => None,
        }
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Every control block in the arena, zombies included.
    pub fn iter(&self) -> impl Iterator<Item = &Tcb> {
        self.slots.iter().map(|(_, tcb)| tcb)
    }

    /// Mutable access to two distinct tasks at once, for the context
    /// switch. Either side may be absent; `a == b` yields neither.
    pub fn pair_mut(&mut self, a: TaskId, b: TaskId) -> (Option<&mut Tcb>, Option<&mut Tcb>) {
        if a == b {
            return (None, None);
        }
        let slot_a = self.by_id.get(&a).copied();
        let slot_b = self.by_id.get(&b).copied();
        match (slot_a, slot_b) {
            (Some(ka), Some(kb)) => match self.slots.get2_mut(ka, kb) {
                Some((ta, tb)) => (Some(ta), Some(tb)),
                None => (None, None),
            },
            (Some(ka), None) => (self.slots.get_mut(ka), None),
            (None, Some(kb)) => (None, self.slots.get_mut(kb)),
            (None, None) => (None, None),
        }
    }

    /// Unlink `id` from the scheduling ring, leaving the control block in
    /// the arena (exit processing; reclaim removes it later).
    pub fn unlink_ring(&mut self, id: TaskId) {
        self.ring.retain(|&t| t != id);
    }

    /// Remove `id` entirely, releasing its control block and both stacks.
    pub fn remove(&mut self, id: TaskId) -> Option<Tcb> {
        let slot = self.by_id.remove(&id)?;
        self.unlink_ring(id);
        Some(self.slots.remove(slot))
    }

    /// Record `child` under `parent`.
    pub fn add_child(&mut self, parent: TaskId, child: TaskId) {
        if let Some(tcb) = self.lookup_mut(parent) {
            tcb.children.push(child);
        }
        if let Some(tcb) = self.lookup_mut(child) {
            tcb.parent = Some(parent);
        }
    }

    /// Remove `id` from its parent's children list.
    pub fn detach_from_parent(&mut self, id: TaskId) {
        let parent = match self.lookup(id) {
            Some(tcb) => tcb.parent,
            None => return,
        };
        if let Some(parent) = parent {
            if let Some(tcb) = self.lookup_mut(parent) {
                tcb.children.retain(|&c| c != id);
            }
        }
        if let Some(tcb) = self.lookup_mut(id) {
            tcb.parent = None;
        }
    }

    /// Null the parent back-reference of every child of `id`. Children are
    /// never destroyed by a parent's exit.
    pub fn detach_children(&mut self, id: TaskId) {
        let children = match self.lookup(id) {
            Some(tcb) => tcb.children.clone(),
            None => return,
        };
        for child in children {
            if let Some(tcb) = self.lookup_mut(child) {
                tcb.parent = None;
            }
        }
        if let Some(tcb) = self.lookup_mut(id) {
            tcb.children.clear();
        }
    }
}
