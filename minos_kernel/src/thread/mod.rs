//! Kernel-level threads.
//!
//! A thread control block owns a stack and an address space, and its saved
//! stack pointer sits at offset 0 where the low-level switch routine expects
//! it. A freshly created thread's stack is fabricated to look exactly like
//! the frame an interrupt would have produced, so the switch routine restores
//! every thread the same way, whether it was preempted or has never run.
//!
//! The stack layout approach follows David H. Hovemeyer's kthread code.

use core::cell::Cell;
use core::mem;
use core::ptr;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use alloc::boxed::Box;

use i386::segments::Selector;
use i386::VirtAddr;
use kmem::paging::PageTable;
use kmem::physical::{FramePool, PoolError};
use kmem::vm::VmPool;

use crate::globals;
use crate::sched;

/// Start of the private virtual window each thread's pool manages.
pub const THREAD_POOL_BASE: VirtAddr = VirtAddr(1 << 30);

/// Size of the private window: 64 MiB above the shared kernel range.
pub const THREAD_POOL_SIZE: usize = 64 << 20;

/// The function a thread starts executing. Returning from it terminates the
/// thread.
pub type ThreadFunction = extern "C" fn();

/// The currently running thread. Written by the switch routine when control
/// is transferred, read from Rust through [`Thread::current`].
#[no_mangle]
static CURRENT_THREAD: AtomicPtr<Thread> = AtomicPtr::new(ptr::null_mut());

static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(0);

/// The address space and pool a thread runs in.
enum Space {
    /// The thread brought its own page table and pool.
    Owned {
        page_table: Option<Box<PageTable>>,
        pool: Option<Box<VmPool>>,
        /// The pool that was current when the thread was created, restored
        /// around every teardown step that leaves the thread's space.
        kernel_pool: *const VmPool,
    },
    /// The thread lives in the kernel address space with a borrowed pool.
    Kernel {
        page_table: *const PageTable,
        pool: *const VmPool,
    },
}

/// A thread control block.
#[repr(C)]
pub struct Thread {
    /// Saved stack pointer. The switch routine addresses this field through
    /// the TCB pointer, so it must stay at offset 0.
    esp: usize,
    /// Physical address of the thread's page directory, loaded by the switch
    /// routine right before it adopts the thread's stack. Must stay at the
    /// word after `esp`. Zero means "keep the current address space".
    cr3: usize,
    id: u32,
    stack: *mut u8,
    stack_size: usize,
    /// Single-slot mailbox, used to hand a dying thread to the termination
    /// trampoline.
    cargo: Cell<Option<NonNull<Thread>>>,
    /// Ready-queue link.
    next: Cell<*mut Thread>,
    space: Space,
}

const _: () = assert!(mem::offset_of!(Thread, esp) == 0);
const _: () = assert!(mem::offset_of!(Thread, cr3) == mem::size_of::<usize>());

impl Thread {
    /// A TCB shell without stack or address space. Everything else is
    /// filled in by the constructors.
    fn bare(stack_size: usize) -> Thread {
        Thread {
            esp: 0,
            cr3: 0,
            id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
            stack: ptr::null_mut(),
            stack_size,
            cargo: Cell::new(None),
            next: Cell::new(ptr::null_mut()),
            space: Space::Kernel {
                page_table: ptr::null(),
                pool: ptr::null(),
            },
        }
    }

    /// Create a thread with its own address space.
    ///
    /// A fresh page table is constructed and loaded, a pool over the
    /// thread's private window is created in it, and the stack is allocated
    /// from that pool, so the stack pages materialize in the new address
    /// space on first touch. The previously current pool is restored before
    /// returning.
    pub unsafe fn with_address_space(
        entry: ThreadFunction,
        stack_size: usize,
        frame_pool: &FramePool,
    ) -> Result<Box<Thread>, PoolError> {
        let kernel_pool = globals::current_vm_pool();

        // TCB and address-space objects live in the creating (kernel) pool.
        let mut thread = Box::new(Thread::bare(stack_size));
        let page_table = Box::new(PageTable::new()?);
        page_table.load();
        thread.cr3 = page_table.directory_address().0;
        let pool = Box::new(VmPool::new(
            THREAD_POOL_BASE,
            THREAD_POOL_SIZE,
            frame_pool,
            &page_table,
        ));
        pool.activate();

        // The stack comes out of the thread's own window.
        globals::set_current_vm_pool(&*pool);
        thread.allocate_stack();
        thread.setup_context(entry);
        thread.space = Space::Owned {
            page_table: Some(page_table),
            pool: Some(pool),
            kernel_pool,
        };
        globals::set_current_vm_pool(kernel_pool);

        info!("[sched] thread {} created in its own space", thread.id);
        Ok(thread)
    }

    /// Create a thread that runs in the kernel address space, allocating its
    /// stack from the given pool.
    pub unsafe fn in_kernel_space(
        entry: ThreadFunction,
        stack_size: usize,
        page_table: &PageTable,
        pool: &VmPool,
    ) -> Box<Thread> {
        page_table.load();
        globals::set_current_vm_pool(pool);

        let mut thread = Box::new(Thread::bare(stack_size));
        thread.cr3 = page_table.directory_address().0;
        thread.allocate_stack();
        thread.setup_context(entry);
        thread.space = Space::Kernel { page_table, pool };

        info!("[sched] thread {} created in kernel space", thread.id);
        thread
    }

    unsafe fn allocate_stack(&mut self) {
        let layout = core::alloc::Layout::from_size_align_unchecked(self.stack_size, 16);
        let stack = alloc::alloc::alloc(layout);
        assert!(!stack.is_null(), "thread stack allocation failed");
        self.stack = stack;
        // stacks grow down from just past the buffer
        self.esp = stack as usize + self.stack_size;
    }

    /// Push one 32-bit word onto the thread's (not yet running) stack.
    fn push(&mut self, value: u32) {
        self.esp -= mem::size_of::<u32>();
        unsafe {
            (self.esp as *mut u32).write(value);
        }
    }

    /// Fabricate the initial stack image.
    ///
    /// From the bottom up: the (unused) argument word, the shutdown routine
    /// a returning thread function falls into, the thread function itself,
    /// and then a full interrupt-style frame around the start shim, so the
    /// switch routine can restore this thread exactly like a preempted one.
    /// EFLAGS starts with interrupts masked; the start shim re-enables them.
    fn setup_context(&mut self, entry: ThreadFunction) {
        self.push(0); // argument
        self.push(thread_shutdown as usize as u32);
        self.push(entry as usize as u32);

        self.push(0); // eflags, IF clear
        self.push(Selector::KERNEL_CODE.0 as u32);
        self.push(thread_start as usize as u32);

        self.push(0); // fake error code
        self.push(0); // fake interrupt number

        for _ in 0..8 {
            self.push(0); // eax, ecx, edx, ebx, esp, ebp, esi, edi
        }

        self.push(Selector::KERNEL_DATA.0 as u32); // ds
        self.push(Selector::KERNEL_DATA.0 as u32); // es
        self.push(0); // fs
        self.push(0); // gs
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// A TCB without stack or address space, enough to exercise queue and
    /// mailbox handling.
    #[cfg(test)]
    pub(crate) fn bare_for_test() -> Thread {
        Thread::bare(0)
    }

    /// Load this thread into the cargo mailbox of `self`.
    pub fn set_cargo(&self, cargo: Option<NonNull<Thread>>) {
        self.cargo.set(cargo);
    }

    /// Empty the mailbox, returning its previous content.
    pub fn take_cargo(&self) -> Option<NonNull<Thread>> {
        self.cargo.take()
    }

    pub(crate) fn next_in_queue(&self) -> *mut Thread {
        self.next.get()
    }

    pub(crate) fn set_next_in_queue(&self, next: *mut Thread) {
        self.next.set(next);
    }

    /// The currently running thread, if any thread has been dispatched yet.
    pub fn current() -> Option<NonNull<Thread>> {
        NonNull::new(CURRENT_THREAD.load(Ordering::SeqCst))
    }

    /// Make this thread's address space and pool current.
    unsafe fn load_address_space(&self) {
        match &self.space {
            Space::Owned {
                page_table, pool, ..
            } => {
                if let Some(page_table) = page_table {
                    page_table.load();
                }
                if let Some(pool) = pool {
                    globals::set_current_vm_pool(&**pool);
                }
            }
            Space::Kernel { page_table, pool } => {
                if !page_table.is_null() {
                    (**page_table).load();
                }
                if !pool.is_null() {
                    globals::set_current_vm_pool(*pool);
                }
            }
        }
    }

    /// Transfer the CPU to `thread`.
    ///
    /// Does not return until some later switch hands the CPU back to the
    /// calling thread; on that return the caller's page table and pool are
    /// made current again. The first dispatch abandons the boot stack and
    /// never returns.
    pub fn dispatch_to(thread: NonNull<Thread>) {
        sched::mark_running();
        unsafe {
            thread_switch_to(thread.as_ptr());
            // Back on this thread's stack after a future switch: the switch
            // routine has already republished CURRENT_THREAD.
            if let Some(current) = Thread::current() {
                current.as_ref().load_address_space();
            }
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        debug!("[sched] dropping thread {}", self.id);
        let space = mem::replace(
            &mut self.space,
            Space::Kernel {
                page_table: ptr::null(),
                pool: ptr::null(),
            },
        );
        unsafe {
            match space {
                Space::Owned {
                    page_table,
                    pool,
                    kernel_pool,
                } => {
                    // The stack lives in the thread's own space; make it
                    // reachable, then give it back to the thread's pool.
                    if let Some(page_table) = &page_table {
                        page_table.load();
                    }
                    if let Some(pool) = &pool {
                        globals::set_current_vm_pool(&**pool);
                    }
                    self.free_stack();

                    // Everything below was allocated from the creating pool.
                    globals::set_current_vm_pool(kernel_pool);
                    // Unmaps its regions under the thread's page table,
                    // which is still loaded.
                    drop(pool);
                    kmem::paging::load_kernel();
                    drop(page_table);
                }
                Space::Kernel { page_table, pool } => {
                    if !page_table.is_null() {
                        (*page_table).load();
                    }
                    if !pool.is_null() {
                        globals::set_current_vm_pool(pool);
                    }
                    self.free_stack();
                    kmem::paging::load_kernel();
                }
            }
        }
    }
}

impl Thread {
    unsafe fn free_stack(&mut self) {
        if self.stack.is_null() {
            return;
        }
        let layout = core::alloc::Layout::from_size_align_unchecked(self.stack_size, 16);
        alloc::alloc::dealloc(self.stack, layout);
        self.stack = ptr::null_mut();
    }
}

/// First code a new thread executes: the fabricated frame `iret`s here with
/// interrupts still masked, the shim unmasks them and falls through into the
/// thread function waiting on the stack.
#[cfg(target_arch = "x86")]
extern "C" {
    fn thread_start();
    fn thread_switch_to(next: *mut Thread);
}

#[cfg(not(target_arch = "x86"))]
unsafe extern "C" fn thread_start() {}

#[cfg(not(target_arch = "x86"))]
unsafe extern "C" fn thread_switch_to(_next: *mut Thread) {
    unimplemented!("context switching requires the x86 target");
}

/// A thread function returned; tear the thread down. Runs on the dying
/// thread's stack, so the actual destruction is delegated to the scheduler's
/// termination trampoline and this never returns.
extern "C" fn thread_shutdown() -> ! {
    unsafe {
        i386::interrupts::disable();
    }
    let current = Thread::current().expect("shutdown without a running thread");
    debug!("[sched] thread {} finished", unsafe {
        current.as_ref().id()
    });
    let scheduler = globals::scheduler().expect("shutdown without a scheduler");
    scheduler.terminate(current);
    unreachable!("terminated thread kept running");
}

#[cfg(target_arch = "x86")]
core::arch::global_asm!(
    r#"
    .section .text

    .global thread_start
    thread_start:
        sti
        ret

    // thread_switch_to(next: *mut Thread)
    //
    // Builds an interrupt-style frame on the current stack, parks the stack
    // pointer at offset 0 of the current TCB, then adopts the target
    // thread's saved stack and unwinds it the same way the interrupt path
    // would. The function "returns" when somebody switches back to us.
    .global thread_switch_to
    thread_switch_to:
        mov eax, [esp + 4]
        pushfd
        push cs
        push offset .Lswitch_return
        push 0
        push 0
        pusha
        push ds
        push es
        push fs
        push gs
        mov ecx, [CURRENT_THREAD]
        test ecx, ecx
        jz .Lswitch_no_save
        mov [ecx], esp
    .Lswitch_no_save:
        mov [CURRENT_THREAD], eax
        // switch to the target's address space before touching its stack
        mov ecx, [eax + 4]
        test ecx, ecx
        jz .Lswitch_same_space
        mov edx, cr3
        cmp edx, ecx
        je .Lswitch_same_space
        mov cr3, ecx
    .Lswitch_same_space:
        mov esp, [eax]
        pop gs
        pop fs
        pop es
        pop ds
        popa
        add esp, 8
        iretd
    .Lswitch_return:
        ret
    "#
);

#[cfg(test)]
mod test {
    use super::*;

    /// Fabricate a context into a plain buffer and return the pushed words,
    /// bottom of the stack first.
    fn fabricated_words(entry: ThreadFunction) -> Vec<u32> {
        let mut stack = vec![0u32; 128];
        let mut thread = Thread::bare(stack.len() * 4);
        thread.esp = unsafe { stack.as_mut_ptr().add(stack.len()) } as usize;
        let top = thread.esp;
        thread.setup_context(entry);

        let pushed = (top - thread.esp) / 4;
        let mut words = Vec::new();
        for i in (0..pushed).rev() {
            let addr = thread.esp + i * 4;
            words.push(unsafe { (addr as *const u32).read() });
        }
        words
    }

    extern "C" fn noop_thread() {}

    #[test]
    fn initial_context_layout() {
        let words = fabricated_words(noop_thread);
        // 3 words of call chain plus an interrupt-style frame of 17
        assert_eq!(words.len(), 20);

        // bottom of stack first
        assert_eq!(words[0], 0, "argument");
        assert_eq!(words[1], thread_shutdown as usize as u32, "shutdown");
        assert_eq!(words[2], noop_thread as usize as u32, "thread function");
        assert_eq!(words[3], 0, "eflags with IF clear");
        assert_eq!(words[4], Selector::KERNEL_CODE.0 as u32, "cs");
        assert_eq!(words[5], thread_start as usize as u32, "start shim");
        assert_eq!(words[6], 0, "fake error code");
        assert_eq!(words[7], 0, "fake interrupt number");
        for (i, word) in words[8..16].iter().enumerate() {
            assert_eq!(*word, 0, "gpr {}", i);
        }
        // top of stack: segment registers, popped first on restore
        assert_eq!(words[16], Selector::KERNEL_DATA.0 as u32, "ds");
        assert_eq!(words[17], Selector::KERNEL_DATA.0 as u32, "es");
        assert_eq!(words[18], 0, "fs");
        assert_eq!(words[19], 0, "gs");
    }

    #[test]
    fn switch_routine_fields_sit_first() {
        assert_eq!(mem::offset_of!(Thread, esp), 0);
        assert_eq!(mem::offset_of!(Thread, cr3), mem::size_of::<usize>());
    }

    #[test]
    fn thread_ids_are_monotone() {
        let a = Thread::bare(0);
        let b = Thread::bare(0);
        assert!(b.id() > a.id());
    }

    #[test]
    fn cargo_mailbox() {
        let t = Thread::bare(0);
        let mut other = Thread::bare(0);
        assert_eq!(t.take_cargo(), None);
        t.set_cargo(Some(NonNull::from(&mut other)));
        let taken = t.take_cargo().expect("cargo was stored");
        assert_eq!(taken.as_ptr(), &mut other as *mut Thread);
        assert_eq!(t.take_cargo(), None, "mailbox holds a single item");
    }
}
