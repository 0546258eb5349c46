//! Kernel tasks and the round-robin scheduler.
//!
//! Descriptors live in a fixed arena; the circular doubly linked ready
//! ring is expressed as prev/next slot indices, which keeps `kill` from
//! having to reason about dangling node pointers. Stacks come from the
//! heap. Switching is cooperative: the timer IRQ only raises a request
//! flag, and tasks hand over the CPU at their next `task_yield` call.
//!
//! Two locks guard the subsystem, always taken ring before current, and
//! both are released before any `switch_to`.

use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use spin::Mutex;

use crate::heap;
use crate::pit;

pub type Pid = i32;

pub const MAX_TASKS: usize = 32;
pub const TASK_STACK_SIZE: u64 = 8192;

const NO_SLOT: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Blocked,
    Zombie,
}

/// Saved scheduling context. Only the stack pointer is stored here; the
/// callee-saved registers sit on the task's own stack where `switch_to`
/// pushed them.
#[repr(C)]
pub struct Context {
    rsp: u64,
}

pub struct Task {
    pub pid: Pid,
    pub state: TaskState,
    context: Context,
    stack: *mut u8,
    entry: extern "C" fn(),
    pub name: [u8; 16],
    pub parent: Pid,
    pub exit_code: i64,
    next: usize,
    prev: usize,
}

struct ReadyRing {
    slots: [Option<Task>; MAX_TASKS],
    head: Option<usize>,
}

// Safety: the arena (and the raw stack pointers inside it) is only
// touched under the ring mutex.
unsafe impl Send for ReadyRing {}

impl ReadyRing {
    const fn new() -> Self {
        const EMPTY: Option<Task> = None;
        Self {
            slots: [EMPTY; MAX_TASKS],
            head: None,
        }
    }

    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_none())
    }

    fn task(&self, idx: usize) -> &Task {
        self.slots[idx].as_ref().expect("corrupt ready ring")
    }

    fn task_mut(&mut self, idx: usize) -> &mut Task {
        self.slots[idx].as_mut().expect("corrupt ready ring")
    }

    /// Links an occupied slot in as the new head.
    fn insert_at_head(&mut self, idx: usize) {
        match self.head {
            None => {
                let t = self.task_mut(idx);
                t.next = idx;
                t.prev = idx;
            }
            Some(head) => {
                let tail = self.task(head).prev;
                {
                    let t = self.task_mut(idx);
                    t.next = head;
                    t.prev = tail;
                }
                self.task_mut(tail).next = idx;
                self.task_mut(head).prev = idx;
            }
        }
        self.head = Some(idx);
    }

    /// Detaches a slot from the ring; the slot itself stays occupied.
    fn unlink(&mut self, idx: usize) {
        let (next, prev) = {
            let t = self.task(idx);
            (t.next, t.prev)
        };
        if next == idx {
            self.head = None;
        } else {
            self.task_mut(prev).next = next;
            self.task_mut(next).prev = prev;
            if self.head == Some(idx) {
                self.head = Some(next);
            }
        }
        let t = self.task_mut(idx);
        t.next = idx;
        t.prev = idx;
    }

    fn find_by_pid(&self, pid: Pid) -> Option<usize> {
        let head = self.head?;
        let mut idx = head;
        loop {
            if self.task(idx).pid == pid {
                return Some(idx);
            }
            idx = self.task(idx).next;
            if idx == head {
                return None;
            }
        }
    }

    fn runnable(&self, idx: usize) -> bool {
        matches!(self.task(idx).state, TaskState::Ready | TaskState::Running)
    }

    /// Next runnable slot strictly after `from` in ring order, wrapping
    /// back to `from` itself if nothing else can run.
    fn next_runnable_after(&self, from: usize) -> Option<usize> {
        let mut idx = self.task(from).next;
        loop {
            if idx == from {
                return if self.runnable(from) { Some(from) } else { None };
            }
            if self.runnable(idx) {
                return Some(idx);
            }
            idx = self.task(idx).next;
        }
    }

    /// First runnable slot starting at the head.
    fn first_runnable(&self) -> Option<usize> {
        let head = self.head?;
        if self.runnable(head) {
            return Some(head);
        }
        match self.next_runnable_after(head) {
            Some(idx) if idx != head => Some(idx),
            _ => None,
        }
    }
}

static READY: Mutex<ReadyRing> = Mutex::new(ReadyRing::new());
static CURRENT: Mutex<Option<usize>> = Mutex::new(None);
static NEXT_PID: AtomicI32 = AtomicI32::new(1);

/// Slot of a task that exited but whose stack is still live until the next
/// context passes a reap point.
static PENDING_REAP: AtomicUsize = AtomicUsize::new(NO_SLOT);

/// Saved context of the boot thread. The first `schedule` switches away
/// from it; the last exiting task switches back.
struct BootContext(UnsafeCell<Context>);

// Safety: single CPU; only the schedule/exit paths touch this, and never
// concurrently.
unsafe impl Sync for BootContext {}

static BOOT_CONTEXT: BootContext = BootContext(UnsafeCell::new(Context { rsp: 0 }));

/// Switch from the context in `*prev` to the one in `*next`.
///
/// Pushes the six callee-saved registers, parks the stack pointer in
/// `*prev`, adopts the one from `*next` and pops the same six registers.
/// A freshly created task therefore "returns" straight into its entry
/// function.
///
/// # Safety
/// Both pointers must reference valid contexts; `*next` must have been
/// produced by this function or by `prepare_stack`. No spinlock may be
/// held across the call.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_to(prev: *mut Context, next: *const Context) {
    core::arch::naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, [rsi]",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    )
}

/// Entry functions that return land here instead of in undefined stack
/// contents.
extern "C" fn task_return_trampoline() -> ! {
    exit(0)
}

/// Builds the initial stack image: exit trampoline, entry address, then
/// six zeroed callee-saved register slots, exactly as `switch_to` expects
/// to pop them.
fn prepare_stack(stack: *mut u8, entry: extern "C" fn()) -> u64 {
    unsafe {
        let mut sp = (stack as u64 + TASK_STACK_SIZE) & !0xF;
        sp -= 8;
        ptr::write(sp as *mut u64, task_return_trampoline as usize as u64);
        sp -= 8;
        ptr::write(sp as *mut u64, entry as usize as u64);
        for _ in 0..6 {
            sp -= 8;
            ptr::write(sp as *mut u64, 0);
        }
        sp
    }
}

/// Creates a task in Ready state at the head of the ring. Returns None
/// when the heap cannot supply a stack or the arena is full; partial
/// state is rolled back.
pub fn spawn(entry: extern "C" fn(), name: &str) -> Option<Pid> {
    let stack = heap::alloc(TASK_STACK_SIZE);
    if stack.is_null() {
        return None;
    }
    let rsp = prepare_stack(stack, entry);

    let parent = current_pid().unwrap_or(0);
    let mut name_buf = [0u8; 16];
    let take = name.len().min(name_buf.len() - 1);
    name_buf[..take].copy_from_slice(&name.as_bytes()[..take]);

    let mut ring = READY.lock();
    let slot = match ring.free_slot() {
        Some(s) => s,
        None => {
            drop(ring);
            heap::free(stack);
            return None;
        }
    };

    let pid = NEXT_PID.fetch_add(1, Ordering::SeqCst);
    ring.slots[slot] = Some(Task {
        pid,
        state: TaskState::Ready,
        context: Context { rsp },
        stack,
        entry,
        name: name_buf,
        parent,
        exit_code: 0,
        next: slot,
        prev: slot,
    });
    ring.insert_at_head(slot);
    drop(ring);

    log::debug!("spawned task {} ({})", pid, name);
    Some(pid)
}

pub fn current_pid() -> Option<Pid> {
    let ring = READY.lock();
    let current = CURRENT.lock();
    current.map(|idx| ring.task(idx).pid)
}

/// Frees the stack and slot of the most recently exited task. Runs in
/// whatever context executes after the zombie, so its stack is no longer
/// in use; the actual free happens outside the ring lock.
fn reap_pending() {
    let slot = PENDING_REAP.swap(NO_SLOT, Ordering::SeqCst);
    if slot == NO_SLOT {
        return;
    }
    let task = {
        let mut ring = READY.lock();
        ring.slots[slot].take()
    };
    if let Some(task) = task {
        log::debug!("reaped task {} (exit code {})", task.pid, task.exit_code);
        heap::free(task.stack);
    }
}

/// Round-robin step: pick the next runnable task after the current one
/// and switch to it. With no current task (the boot thread), switches
/// away from the boot context into the first runnable task.
pub fn schedule() {
    reap_pending();

    let mut ring = READY.lock();
    let mut current = CURRENT.lock();

    if ring.head.is_none() {
        return;
    }

    let (prev_ctx, next_idx) = match *current {
        Some(cur) => {
            let next = match ring.next_runnable_after(cur) {
                Some(n) => n,
                None => return,
            };
            if next == cur {
                return;
            }
            if ring.task(cur).state == TaskState::Running {
                ring.task_mut(cur).state = TaskState::Ready;
            }
            (&mut ring.task_mut(cur).context as *mut Context, next)
        }
        None => {
            let next = match ring.first_runnable() {
                Some(n) => n,
                None => return,
            };
            (BOOT_CONTEXT.0.get(), next)
        }
    };

    ring.task_mut(next_idx).state = TaskState::Running;
    *current = Some(next_idx);
    let next_ctx = &ring.task(next_idx).context as *const Context;

    drop(current);
    drop(ring);

    unsafe {
        switch_to(prev_ctx, next_ctx);
    }

    // Resumed: collect whoever exited while we were off the CPU.
    reap_pending();
}

/// Cooperative yield point: clears the timer's reschedule request and
/// rotates the ring.
pub fn task_yield() {
    pit::NEED_RESCHED.store(false, Ordering::SeqCst);
    schedule();
}

/// Terminates the calling task. Its slot is detached from the ring and
/// queued for reaping; the CPU goes to the next runnable task, or back to
/// the boot thread when the ring drained.
pub fn exit(code: i64) -> ! {
    reap_pending();

    let slot = {
        let current = CURRENT.lock();
        match *current {
            Some(s) => s,
            None => {
                // Exit outside any task: nothing to unwind, park the CPU.
                loop {
                    x86_64::instructions::hlt();
                }
            }
        }
    };

    {
        let mut ring = READY.lock();
        {
            let t = ring.task_mut(slot);
            t.state = TaskState::Zombie;
            t.exit_code = code;
        }
        ring.unlink(slot);
    }

    let mut ring = READY.lock();
    let mut current = CURRENT.lock();
    PENDING_REAP.store(slot, Ordering::SeqCst);
    let prev_ctx = &mut ring.task_mut(slot).context as *mut Context;

    match ring.first_runnable() {
        Some(next) => {
            ring.task_mut(next).state = TaskState::Running;
            *current = Some(next);
            let next_ctx = &ring.task(next).context as *const Context;
            drop(current);
            drop(ring);
            unsafe {
                switch_to(prev_ctx, next_ctx);
            }
        }
        None => {
            *current = None;
            drop(current);
            drop(ring);
            unsafe {
                switch_to(prev_ctx, BOOT_CONTEXT.0.get());
            }
        }
    }

    // A zombie context is never resumed.
    unreachable!("dead task rescheduled");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillError {
    /// No task with that pid is on the ready ring.
    NotFound,
    /// A task cannot kill itself; it should call `exit`.
    IsCurrent,
}

/// Removes a task by pid and frees its resources. The current task is
/// refused; it must go through [`exit`].
pub fn kill(pid: Pid) -> Result<(), KillError> {
    if pid <= 0 {
        return Err(KillError::NotFound);
    }

    let task = {
        let mut ring = READY.lock();
        let current = CURRENT.lock();
        let slot = match ring.find_by_pid(pid) {
            Some(s) => s,
            None => return Err(KillError::NotFound),
        };
        if *current == Some(slot) {
            return Err(KillError::IsCurrent);
        }
        ring.task_mut(slot).state = TaskState::Zombie;
        ring.unlink(slot);
        ring.slots[slot].take()
    };

    if let Some(task) = task {
        heap::free(task.stack);
        log::debug!("killed task {}", task.pid);
    }
    Ok(())
}

/// A row of the `tasks` listing.
pub struct TaskInfo {
    pub pid: Pid,
    pub state: TaskState,
    pub name: [u8; 16],
    pub entry: usize,
}

/// Snapshot of the ready ring in scheduling order, head first.
pub fn snapshot() -> Vec<TaskInfo> {
    // Reserve before taking the ring lock so the heap is not entered
    // while holding it.
    let mut out = Vec::with_capacity(MAX_TASKS);

    let ring = READY.lock();
    if let Some(head) = ring.head {
        let mut idx = head;
        loop {
            let t = ring.task(idx);
            out.push(TaskInfo {
                pid: t.pid,
                state: t.state,
                name: t.name,
                entry: t.entry as usize,
            });
            idx = t.next;
            if idx == head {
                break;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn nop_entry() {}

    fn dummy(pid: Pid) -> Task {
        Task {
            pid,
            state: TaskState::Ready,
            context: Context { rsp: 0 },
            stack: ptr::null_mut(),
            entry: nop_entry,
            name: [0; 16],
            parent: 0,
            exit_code: 0,
            next: 0,
            prev: 0,
        }
    }

    fn ring_with(pids: &[Pid]) -> ReadyRing {
        let mut ring = ReadyRing::new();
        for &pid in pids {
            let slot = ring.free_slot().unwrap();
            ring.slots[slot] = Some(dummy(pid));
            ring.insert_at_head(slot);
        }
        ring
    }

    fn ring_order(ring: &ReadyRing) -> Vec<Pid> {
        let mut out = Vec::new();
        if let Some(head) = ring.head {
            let mut idx = head;
            loop {
                out.push(ring.task(idx).pid);
                idx = ring.task(idx).next;
                if idx == head {
                    break;
                }
            }
        }
        out
    }

    #[test_case]
    fn head_insert_builds_a_cycle() {
        let ring = ring_with(&[1, 2, 3]);
        // Last insert becomes head; the ring wraps around.
        assert_eq!(ring_order(&ring), [3, 2, 1]);
        let head = ring.head.unwrap();
        assert_eq!(ring.task(ring.task(head).prev).pid, 1);
    }

    #[test_case]
    fn unlink_middle_preserves_cycle() {
        let mut ring = ring_with(&[1, 2, 3]);
        let slot2 = ring.find_by_pid(2).unwrap();
        ring.unlink(slot2);
        assert_eq!(ring_order(&ring), [3, 1]);
        assert_eq!(ring.find_by_pid(2), None);
    }

    #[test_case]
    fn unlink_head_moves_head() {
        let mut ring = ring_with(&[1, 2]);
        let head = ring.head.unwrap();
        ring.unlink(head);
        assert_eq!(ring_order(&ring), [1]);
        let last = ring.head.unwrap();
        ring.unlink(last);
        assert!(ring.head.is_none());
    }

    #[test_case]
    fn round_robin_rotation_is_cyclic() {
        let ring = ring_with(&[1, 2, 3]); // order 3, 2, 1
        let s3 = ring.find_by_pid(3).unwrap();
        let s2 = ring.find_by_pid(2).unwrap();
        let s1 = ring.find_by_pid(1).unwrap();
        assert_eq!(ring.next_runnable_after(s3), Some(s2));
        assert_eq!(ring.next_runnable_after(s2), Some(s1));
        assert_eq!(ring.next_runnable_after(s1), Some(s3));
    }

    #[test_case]
    fn blocked_tasks_are_skipped() {
        let mut ring = ring_with(&[1, 2, 3]);
        let s2 = ring.find_by_pid(2).unwrap();
        ring.task_mut(s2).state = TaskState::Blocked;
        let s3 = ring.find_by_pid(3).unwrap();
        let s1 = ring.find_by_pid(1).unwrap();
        assert_eq!(ring.next_runnable_after(s3), Some(s1));
    }

    #[test_case]
    fn lone_runnable_task_selects_itself() {
        let ring = ring_with(&[7]);
        let s = ring.find_by_pid(7).unwrap();
        assert_eq!(ring.next_runnable_after(s), Some(s));
    }

    #[test_case]
    fn prepared_stack_matches_switch_layout() {
        let stack = heap::alloc(TASK_STACK_SIZE);
        assert!(!stack.is_null());
        let sp = prepare_stack(stack, nop_entry);

        // Six zeroed callee-saved slots, the entry address, then the
        // return trampoline above it.
        assert_eq!(sp % 16, 0);
        for i in 0..6 {
            assert_eq!(unsafe { ptr::read((sp + i * 8) as *const u64) }, 0);
        }
        assert_eq!(
            unsafe { ptr::read((sp + 48) as *const u64) },
            nop_entry as usize as u64
        );
        assert_eq!(
            unsafe { ptr::read((sp + 56) as *const u64) },
            task_return_trampoline as usize as u64
        );
        heap::free(stack);
    }
}
