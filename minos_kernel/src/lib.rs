#![cfg_attr(not(test), no_std)]

//! minos: a small teaching kernel for 32-bit x86 protected mode.
//!
//! The kernel owns two physical frame pools, builds per-address-space page
//! tables with demand paging, carves virtual memory out of per-space pools,
//! and runs kernel threads under a FIFO scheduler with optional round-robin
//! preemption. [`kernel_main`] wires everything together in the one order
//! that works.

// built-in crates
extern crate alloc;
#[macro_use]
extern crate log;
#[macro_use]
extern crate static_assertions;

// crates from crates.io
extern crate spin;

// other crates from this workspace
extern crate i386;
extern crate kmem;

use core::ptr::NonNull;

use alloc::boxed::Box;

use i386::paging::FaultCode;
use i386::segments::Gdt;
use i386::VirtAddr;
use kmem::paging::PageTable;
use kmem::physical::{FramePool, PageFrame};
use kmem::vm::VmPool;
use kmem::PAGE_SIZE;

pub mod allocator;
mod boot;
pub mod diagnostics;
pub mod globals;
pub mod interrupts;
mod panic;
pub mod sched;
pub mod thread;
pub mod vga;

use crate::interrupts::Regs;
use crate::sched::Scheduler;
use crate::thread::Thread;

/// Kernel frame pool: physical 2..4 MiB.
const KERNEL_POOL_START_FRAME: usize = (2 << 20) / PAGE_SIZE;
const KERNEL_POOL_FRAMES: usize = (2 << 20) / PAGE_SIZE;

/// Process frame pool: physical 4..32 MiB.
const PROCESS_POOL_START_FRAME: usize = (4 << 20) / PAGE_SIZE;
const PROCESS_POOL_FRAMES: usize = (28 << 20) / PAGE_SIZE;

/// A hole in physical memory at 15..16 MiB that must never be handed out.
const MEM_HOLE_START_FRAME: usize = (15 << 20) / PAGE_SIZE;
const MEM_HOLE_FRAMES: usize = (1 << 20) / PAGE_SIZE;

/// The low region every address space shares, identity-mapped.
const SHARED_REGION_SIZE: usize = 4 << 20;

/// The kernel's own virtual-memory window.
const KERNEL_VM_BASE: VirtAddr = VirtAddr(512 << 20);
const KERNEL_VM_SIZE: usize = 256 << 20;

/// Timer interrupt rate and the quantum in ticks.
const TIMER_HZ: u32 = 100;
const QUANTUM_TICKS: u32 = 10;

/// Stack size of the demo threads.
const THREAD_STACK_SIZE: usize = 1024;

static GDT: Gdt = Gdt::new();

/// Entry point, called by the boot stub with interrupts disabled.
#[no_mangle]
pub extern "C" fn kernel_main() -> ! {
    unsafe {
        i386::segments::load_gdt(&GDT);
    }

    vga::init(VirtAddr(vga::VGA_PHYS_ADDR.0));
    globals::COM1.lock().init();
    diagnostics::init();
    info!("[kmain] console up");

    unsafe {
        interrupts::init();
    }
    interrupts::register_handler(0, divide_error);
    interrupts::register_handler(14, page_fault);

    // Physical memory. The kernel pool keeps its bitmap in its own first
    // frame; the process pool's bitmap is too big for that hole-riddled
    // region and borrows kernel frames instead.
    let kernel_pool = unsafe { FramePool::new(KERNEL_POOL_START_FRAME, KERNEL_POOL_FRAMES, 0) };
    unsafe {
        kernel_pool.register();
    }
    let info_frame = kernel_pool
        .get_frames(FramePool::needed_info_frames(PROCESS_POOL_FRAMES))
        .expect("no frames for the process pool bitmap");
    let process_pool =
        unsafe { FramePool::new(PROCESS_POOL_START_FRAME, PROCESS_POOL_FRAMES, info_frame.0) };
    unsafe {
        process_pool.register();
    }
    process_pool.mark_inaccessible(PageFrame(MEM_HOLE_START_FRAME), MEM_HOLE_FRAMES);

    // Virtual memory.
    unsafe {
        kmem::paging::init_paging(&kernel_pool, &process_pool, SHARED_REGION_SIZE);
    }
    let kernel_table = unsafe { PageTable::new() }.expect("kernel page table");
    unsafe {
        kernel_table.load();
        kmem::paging::enable_paging();
    }

    let kernel_vm_pool =
        unsafe { VmPool::new(KERNEL_VM_BASE, KERNEL_VM_SIZE, &process_pool, &kernel_table) };
    unsafe {
        kernel_vm_pool.activate();
        globals::set_kernel_vm_pool(&kernel_vm_pool);
        globals::set_current_vm_pool(&kernel_vm_pool);
    }
    info!("[kmain] heap routed through the kernel pool");

    // Scheduling. The scheduler is leaked into a static lifetime; the boot
    // frame it borrows from never unwinds.
    let scheduler: &'static Scheduler = Box::leak(Box::new(unsafe {
        Scheduler::round_robin(QUANTUM_TICKS, &kernel_table, &kernel_vm_pool)
    }));
    unsafe {
        globals::set_scheduler(scheduler);
        i386::pit::start_periodic(TIMER_HZ);
    }

    // Worker threads, each in its own address space.
    info!("[kmain] creating threads");
    let thread1 = unsafe { Thread::with_address_space(fun1, THREAD_STACK_SIZE, &process_pool) }
        .expect("thread 1");
    let thread2 = unsafe { Thread::with_address_space(fun2, THREAD_STACK_SIZE, &process_pool) }
        .expect("thread 2");
    let thread3 = unsafe { Thread::with_address_space(fun3, THREAD_STACK_SIZE, &process_pool) }
        .expect("thread 3");
    let thread4 = unsafe { Thread::with_address_space(fun4, THREAD_STACK_SIZE, &process_pool) }
        .expect("thread 4");

    scheduler.add(thread2);
    scheduler.add(thread3);
    scheduler.add(thread4);

    unsafe {
        i386::interrupts::enable();
    }

    info!("[kmain] dispatching the first thread");
    Thread::dispatch_to(NonNull::new(Box::into_raw(thread1)).unwrap());

    unreachable!("the boot context was rescheduled");
}

fn divide_error(regs: &mut Regs) {
    panic!("division by zero at {:#010x}", regs.eip);
}

fn page_fault(regs: &mut Regs) {
    unsafe {
        PageTable::handle_fault(FaultCode::from_bits_truncate(regs.err_code));
    }
}

/// Put the calling thread at the back of the queue and run the next one.
fn pass_on_cpu() {
    let scheduler = match globals::scheduler() {
        Some(scheduler) => scheduler,
        None => return,
    };
    if let Some(current) = Thread::current() {
        scheduler.resume(current);
    }
    scheduler.yield_now();
}

fn announce(name: u32) {
    let id = Thread::current().map(|t| unsafe { t.as_ref().id() });
    info!("[demo] worker {} running as thread {:?}", name, id);
}

fn burst(name: u32, number: u32) {
    for tick in 0..10 {
        info!("[demo] worker {}: burst {} tick {}", name, number, tick);
    }
    pass_on_cpu();
}

/// Runs ten bursts, then returns, which terminates the thread.
fn worker(name: u32) {
    announce(name);
    for number in 0..10 {
        burst(name, number);
    }
}

/// Bursts until something terminates the thread from outside.
fn tireless_worker(name: u32) -> ! {
    announce(name);
    let mut number = 0u32;
    loop {
        burst(name, number);
        number = number.wrapping_add(1);
    }
}

extern "C" fn fun1() {
    worker(1);
}

extern "C" fn fun2() {
    worker(2);
}

extern "C" fn fun3() {
    tireless_worker(3);
}

extern "C" fn fun4() {
    tireless_worker(4);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn memory_map_is_consistent() {
        // pools touch exactly at 4 MiB
        assert_eq!(
            KERNEL_POOL_START_FRAME + KERNEL_POOL_FRAMES,
            PROCESS_POOL_START_FRAME
        );
        assert_eq!(KERNEL_POOL_START_FRAME, 512);
        assert_eq!(PROCESS_POOL_START_FRAME, 1024);
        assert_eq!(PROCESS_POOL_FRAMES, 7168);
        // the hole lies strictly inside the process pool
        assert!(MEM_HOLE_START_FRAME >= PROCESS_POOL_START_FRAME);
        assert!(
            MEM_HOLE_START_FRAME + MEM_HOLE_FRAMES
                <= PROCESS_POOL_START_FRAME + PROCESS_POOL_FRAMES
        );
    }

    #[test]
    fn windows_do_not_overlap_the_shared_region() {
        // the kernel pool window lives in the shared gigabyte
        assert!(KERNEL_VM_BASE.0 >= SHARED_REGION_SIZE);
        assert!(KERNEL_VM_BASE.0 + KERNEL_VM_SIZE <= 1 << 30);
        // thread windows start right above it
        assert_eq!(thread::THREAD_POOL_BASE.0, 1 << 30);
    }

    #[test]
    fn process_pool_bitmap_needs_one_frame() {
        assert_eq!(FramePool::needed_info_frames(PROCESS_POOL_FRAMES), 1);
    }
}
