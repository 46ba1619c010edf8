//! The thread scheduler: a FIFO ready queue with optional round-robin
//! preemption.
//!
//! The ready queue is a singly-linked list threaded through the TCBs and
//! never contains the running thread. Every queue mutation happens with
//! interrupts masked; the mask is lifted again only on the return path of
//! the thread that took the guard, so the timer interrupt can never observe
//! a half-updated queue.
//!
//! A thread cannot destroy itself while executing on its own stack, so
//! self-termination hands the dying TCB to a dedicated termination thread
//! that lives outside the ready queue and is only ever reached by an
//! explicit dispatch.

use core::cell::Cell;
use core::ptr;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

use alloc::boxed::Box;

use i386::interrupts::IrqGuard;
use kmem::paging::PageTable;
use kmem::vm::VmPool;

use crate::globals;
use crate::interrupts;
use crate::thread::Thread;

mod timer;

pub use self::timer::QuantumTimer;

/// Stack size of the termination trampoline thread.
const TERMINATION_STACK_SIZE: usize = 1024;

/// Set on the first dispatch; until then the quantum timer stays idle.
static RUNNING: AtomicBool = AtomicBool::new(false);

pub(crate) fn mark_running() {
    RUNNING.store(true, Ordering::SeqCst);
}

/// Whether any thread has been dispatched yet.
pub fn started() -> bool {
    RUNNING.load(Ordering::SeqCst)
}

/// FIFO queue threaded through the TCB link fields. The running thread is
/// never a member.
struct ReadyQueue {
    head: Cell<*mut Thread>,
    tail: Cell<*mut Thread>,
}

impl ReadyQueue {
    const fn new() -> ReadyQueue {
        ReadyQueue {
            head: Cell::new(ptr::null_mut()),
            tail: Cell::new(ptr::null_mut()),
        }
    }

    unsafe fn enqueue(&self, thread: *mut Thread) {
        (*thread).set_next_in_queue(ptr::null_mut());
        let tail = self.tail.get();
        if tail.is_null() {
            self.head.set(thread);
        } else {
            (*tail).set_next_in_queue(thread);
        }
        self.tail.set(thread);
    }

    unsafe fn dequeue(&self) -> Option<NonNull<Thread>> {
        let head = NonNull::new(self.head.get())?;
        let next = head.as_ref().next_in_queue();
        self.head.set(next);
        if next.is_null() {
            self.tail.set(ptr::null_mut());
        }
        Some(head)
    }

    /// Remove `thread` wherever it sits in the queue. Returns whether it was
    /// found.
    unsafe fn unlink(&self, thread: *mut Thread) -> bool {
        if self.head.get() == thread {
            self.dequeue();
            return true;
        }
        let mut prev = self.head.get();
        while !prev.is_null() {
            if (*prev).next_in_queue() == thread {
                (*prev).set_next_in_queue((*thread).next_in_queue());
                if self.tail.get() == thread {
                    self.tail.set(prev);
                }
                return true;
            }
            prev = (*prev).next_in_queue();
        }
        false
    }
}

/// The system scheduler. Constructed plain for pure FIFO behavior, or with
/// [`Scheduler::round_robin`] for preemption after a fixed tick quantum.
pub struct Scheduler {
    queue: ReadyQueue,
    timer: Option<QuantumTimer>,
    termination_thread: *mut Thread,
}

// Only touched from kernel context; the interrupt guard in every mutating
// method serializes against the timer path.
unsafe impl Send for Scheduler {}
unsafe impl Sync for Scheduler {}

impl Scheduler {
    /// Build a cooperative FIFO scheduler.
    ///
    /// Constructs the termination trampoline thread in the kernel address
    /// space, so the kernel page table and pool must be current.
    pub unsafe fn new(kernel_table: &PageTable, kernel_pool: &VmPool) -> Scheduler {
        let termination =
            Thread::in_kernel_space(termination_entry, TERMINATION_STACK_SIZE, kernel_table, kernel_pool);
        info!("[sched] scheduler ready");
        Scheduler {
            queue: ReadyQueue::new(),
            timer: None,
            termination_thread: Box::into_raw(termination),
        }
    }

    /// Build a preemptive scheduler: like [`Scheduler::new`], plus a quantum
    /// of `quantum_ticks` timer interrupts after which the running thread is
    /// sent to the back of the queue.
    pub unsafe fn round_robin(
        quantum_ticks: u32,
        kernel_table: &PageTable,
        kernel_pool: &VmPool,
    ) -> Scheduler {
        let mut scheduler = Self::new(kernel_table, kernel_pool);
        scheduler.timer = Some(QuantumTimer::new(quantum_ticks));
        interrupts::register_handler(interrupts::TIMER_VECTOR, timer::quantum_tick);
        info!("[sched] round robin, {} ticks per quantum", quantum_ticks);
        scheduler
    }

    pub(crate) fn quantum_timer(&self) -> Option<&QuantumTimer> {
        self.timer.as_ref()
    }

    /// Hand a thread to the scheduler. It will run no earlier than
    /// everything already queued.
    pub fn add(&self, thread: Box<Thread>) {
        self.resume(NonNull::new(Box::into_raw(thread)).unwrap());
    }

    /// Append a thread to the ready queue.
    pub fn resume(&self, thread: NonNull<Thread>) {
        let _guard = IrqGuard::new();
        unsafe {
            self.queue.enqueue(thread.as_ptr());
        }
    }

    /// Give up the CPU to the next ready thread.
    ///
    /// With an empty queue the caller simply keeps running. A voluntary
    /// yield restarts the quantum, so a cooperative thread is not punished
    /// with an immediate preemption after resuming.
    pub fn yield_now(&self) {
        let guard = IrqGuard::new();
        let next = unsafe { self.queue.dequeue() };
        if let Some(next) = next {
            if let Some(timer) = &self.timer {
                timer.reset();
            }
            Thread::dispatch_to(next);
        }
        // Runs when control comes back to this thread (immediately on an
        // empty queue); a terminated thread never gets here and never
        // unmasks on its dead stack.
        drop(guard);
    }

    /// Destroy a thread.
    ///
    /// A queued thread is unlinked and destroyed on the spot. The running
    /// thread cannot be: its own stack is still in use, so it is stashed in
    /// the termination thread's mailbox and the CPU is handed over; this
    /// call then never returns.
    pub fn terminate(&self, thread: NonNull<Thread>) {
        let _guard = IrqGuard::new();

        if Thread::current() == Some(thread) {
            let termination = NonNull::new(self.termination_thread)
                .expect("scheduler has no termination thread");
            unsafe {
                termination.as_ref().set_cargo(Some(thread));
            }
            Thread::dispatch_to(termination);
            unreachable!("terminated thread was scheduled again");
        }

        unsafe {
            if self.queue.unlink(thread.as_ptr()) {
                drop(Box::from_raw(thread.as_ptr()));
            }
        }
    }
}

/// Body of the termination trampoline: reap whatever the mailbox holds,
/// then queue up behind the ready threads again.
///
/// The mailbox can legitimately be empty: a quantum expiry while the
/// trampoline runs re-enqueues it like any other thread.
extern "C" fn termination_entry() {
    loop {
        let current = Thread::current().expect("trampoline is not running");
        let victim = unsafe { current.as_ref().take_cargo() };
        if let Some(victim) = victim {
            debug!("[sched] reaping thread {}", unsafe {
                victim.as_ref().id()
            });
            unsafe {
                drop(Box::from_raw(victim.as_ptr()));
            }
        }
        if let Some(scheduler) = globals::scheduler() {
            scheduler.yield_now();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn raw_thread() -> *mut Thread {
        Box::into_raw(Box::new(Thread::bare_for_test()))
    }

    unsafe fn drain(queue: &ReadyQueue) -> Vec<u32> {
        let mut ids = Vec::new();
        while let Some(t) = queue.dequeue() {
            ids.push(t.as_ref().id());
            drop(Box::from_raw(t.as_ptr()));
        }
        ids
    }

    #[test]
    fn fifo_order() {
        let queue = ReadyQueue::new();
        let (a, b, c) = (raw_thread(), raw_thread(), raw_thread());
        let expected: Vec<u32> = unsafe { vec![(*a).id(), (*b).id(), (*c).id()] };
        unsafe {
            queue.enqueue(a);
            queue.enqueue(b);
            queue.enqueue(c);
            assert_eq!(drain(&queue), expected);
            assert!(queue.dequeue().is_none());
        }
    }

    #[test]
    fn queue_refills_after_drain() {
        let queue = ReadyQueue::new();
        unsafe {
            queue.enqueue(raw_thread());
            drain(&queue);
            // head and tail were both reset
            let t = raw_thread();
            queue.enqueue(t);
            assert_eq!(queue.dequeue().unwrap().as_ptr(), t);
            drop(Box::from_raw(t));
        }
    }

    #[test]
    fn unlink_head_middle_tail() {
        unsafe {
            // head
            let queue = ReadyQueue::new();
            let (a, b, c) = (raw_thread(), raw_thread(), raw_thread());
            queue.enqueue(a);
            queue.enqueue(b);
            queue.enqueue(c);
            assert!(queue.unlink(a));
            drop(Box::from_raw(a));
            assert_eq!(drain(&queue).len(), 2);

            // middle
            let (a, b, c) = (raw_thread(), raw_thread(), raw_thread());
            queue.enqueue(a);
            queue.enqueue(b);
            queue.enqueue(c);
            assert!(queue.unlink(b));
            drop(Box::from_raw(b));
            let rest = drain(&queue);
            assert_eq!(rest.len(), 2);

            // tail, and the tail pointer must follow
            let (a, b) = (raw_thread(), raw_thread());
            queue.enqueue(a);
            queue.enqueue(b);
            assert!(queue.unlink(b));
            drop(Box::from_raw(b));
            let c = raw_thread();
            queue.enqueue(c);
            assert_eq!(drain(&queue).len(), 2);
        }
    }

    #[test]
    fn unlink_missing_thread() {
        let queue = ReadyQueue::new();
        let outsider = raw_thread();
        unsafe {
            queue.enqueue(raw_thread());
            assert!(!queue.unlink(outsider));
            drop(Box::from_raw(outsider));
            drain(&queue);
        }
    }
}
