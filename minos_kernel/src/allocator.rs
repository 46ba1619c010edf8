//! The kernel heap: `alloc` routed through the current VM pool.
//!
//! Whichever pool is published in [`globals`] serves every allocation, so a
//! thread constructing its address space can point the heap at its own pool
//! for the duration. Allocations are page granular (the pool knows no finer
//! unit) and materialize lazily through the page-fault handler.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use i386::VirtAddr;
use kmem::PAGE_SIZE;

use crate::globals;

pub struct PoolAllocator;

unsafe impl GlobalAlloc for PoolAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let pool = globals::current_vm_pool();
        if pool.is_null() || layout.align() > PAGE_SIZE {
            return ptr::null_mut();
        }
        match (*pool).allocate(layout.size()) {
            Ok(addr) => addr.0 as *mut u8,
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let pool = globals::current_vm_pool();
        if pool.is_null() {
            return;
        }
        // the pool logs unknown addresses itself
        let _ = (*pool).release(VirtAddr(ptr as usize));
    }
}

#[cfg(not(test))]
#[global_allocator]
static ALLOCATOR: PoolAllocator = PoolAllocator;
