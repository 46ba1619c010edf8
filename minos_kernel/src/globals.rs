//! Process-wide kernel state with boot-ordered initialization.
//!
//! The pointers published here tie the subsystems together: the allocator
//! routes through the current VM pool, the termination path needs the
//! scheduler, and thread switches republish the pool belonging to the
//! address space that just became current.

use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use i386::serial::{SerialPort, COM1_ADDR};
use kmem::vm::VmPool;

use crate::sched::Scheduler;

/// The one serial port the kernel logs to.
pub static COM1: spin::Mutex<SerialPort> = spin::Mutex::new(unsafe { SerialPort::new(COM1_ADDR) });

static CURRENT_VM_POOL: AtomicPtr<VmPool> = AtomicPtr::new(ptr::null_mut());
static KERNEL_VM_POOL: AtomicPtr<VmPool> = AtomicPtr::new(ptr::null_mut());
static SCHEDULER: AtomicPtr<Scheduler> = AtomicPtr::new(ptr::null_mut());

/// The pool that serves allocations right now. Follows the current address
/// space: thread switches and thread construction keep the two in sync.
pub fn current_vm_pool() -> *const VmPool {
    CURRENT_VM_POOL.load(Ordering::SeqCst)
}

/// Publish `pool` as the allocation target. The pool must stay alive until
/// it is replaced.
pub unsafe fn set_current_vm_pool(pool: *const VmPool) {
    CURRENT_VM_POOL.store(pool as *mut VmPool, Ordering::SeqCst);
}

/// The kernel's own pool, the fallback every thread restores on teardown.
pub fn kernel_vm_pool() -> *const VmPool {
    KERNEL_VM_POOL.load(Ordering::SeqCst)
}

pub unsafe fn set_kernel_vm_pool(pool: *const VmPool) {
    KERNEL_VM_POOL.store(pool as *mut VmPool, Ordering::SeqCst);
}

/// The system scheduler, once the boot path has constructed it.
pub fn scheduler() -> Option<&'static Scheduler> {
    let ptr = SCHEDULER.load(Ordering::SeqCst);
    if ptr.is_null() {
        None
    } else {
        Some(unsafe { &*ptr })
    }
}

/// Publish the scheduler. It must never be dropped afterwards.
pub unsafe fn set_scheduler(scheduler: &'static Scheduler) {
    SCHEDULER.store(scheduler as *const Scheduler as *mut Scheduler, Ordering::SeqCst);
}
