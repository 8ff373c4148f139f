//! Fork engine
//!
//! Fork duplicates the calling task: the live span of its user stack is
//! copied verbatim into a fresh region, frame-pointer links into the old
//! span are relocated, and a one-word trampoline is pushed so the child's
//! first dispatch observes a fork return value of zero without re-executing
//! the parent's call path. The kernel stack is never copied - the child
//! gets a fresh one.
//!
//! Everything here builds a free-standing child image; registration happens
//! in the kernel afterwards, so a failure at any point leaves no partial
//! child behind.

use super::config::KernelConfig;
use super::stack::{self, StackRegion, WORD};
use super::task::{CpuState, ExitHook, TaskEntry, TaskError, Tcb};

/// Sentinel return address pushed onto the child's stack. Consumed on the
/// child's first dispatch: the word is popped and the return register
/// zeroed, reproducing "child sees 0, parent sees the child id".
pub const FORK_TRAMPOLINE: usize = usize::MAX - 0x20;

/// A fully-built, not-yet-registered child task
pub struct ChildImage {
    pub name: String,
    pub entry: TaskEntry,
    pub on_exit: Option<ExitHook>,
    pub uid: u32,
    pub euid: u32,
    pub gid: u32,
    pub user_stack: StackRegion,
    pub kernel_stack: StackRegion,
    pub cpu: CpuState,
}

/// Build the child image for `parent` from its live register snapshot.
///
/// The child's user stack reproduces the parent's live span with the
/// frame-pointer chain relocated; `cpu` points one trampoline word below
/// the translated stack pointer. Dropping the returned image releases
/// everything - nothing is registered yet.
pub fn child_image(
    cfg: &KernelConfig,
    parent: &Tcb,
    snapshot: CpuState,
) -> Result<ChildImage, TaskError> {
    let mut user_stack = StackRegion::new(parent.user_stack.len())?;
    let (sp, bp) = stack::duplicate_into(&parent.user_stack, snapshot.sp, snapshot.bp, &mut user_stack)?;
    let sp = user_stack.push_word(sp, FORK_TRAMPOLINE)?;
    let kernel_stack = StackRegion::new(cfg.kernel_stack_size)?;

    Ok(ChildImage {
        name: parent.name.clone(),
        entry: parent.entry.clone(),
        on_exit: parent.on_exit.clone(),
        uid: parent.uid,
        euid: parent.euid,
        gid: parent.gid,
        user_stack,
        kernel_stack,
        cpu: CpuState { sp, bp, ret: 0 },
    })
}

/// Consume the fork trampoline at resume time.
///
/// If the word at the incoming stack pointer is the trampoline sentinel it
/// is popped and the return register zeroed. Returns whether a trampoline
/// was consumed.
pub fn consume_trampoline(user_stack: &StackRegion, regs: &mut CpuState) -> bool {
    if user_stack.read_word(regs.sp) == Ok(FORK_TRAMPOLINE) {
        regs.sp += WORD;
        regs.ret = 0;
        true
    } else {
        false
    }
}
