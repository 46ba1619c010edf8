//! Virtual-memory pools: per-address-space region allocators.
//!
//! A pool carves allocations out of a contiguous virtual window. The page
//! fault handler asks the pools registered with the current page table
//! whether a faulting address is legitimate, so memory handed out here is
//! backed lazily, one frame per touched page.

use core::cell::Cell;
use core::ptr;
use core::sync::atomic::{AtomicU32, Ordering};

use i386::VirtAddr;

use crate::paging::PageTable;
use crate::physical::FramePool;
use crate::PAGE_SIZE;

mod regions;

pub use self::regions::{Region, RegionTable, VmError, MAX_REGIONS};

static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(0);

/// A region allocator over the virtual window `[base, base + size)`.
///
/// The first two pages of the window hold the pool's own bookkeeping; they
/// are demand-faulted in like any other page of the pool.
pub struct VmPool {
    regions: RegionTable,
    frame_pool: *const FramePool,
    page_table: *const PageTable,
    next: Cell<*const VmPool>,
    id: u32,
}

impl VmPool {
    /// Describe a pool over `[base, base + size)`, backed by `frame_pool`
    /// and living in the address space of `page_table`.
    ///
    /// The pool is inert until [`VmPool::activate`]; both referents must
    /// outlive it.
    pub unsafe fn new(
        base: VirtAddr,
        size: usize,
        frame_pool: &FramePool,
        page_table: &PageTable,
    ) -> VmPool {
        assert!(size > 2 * PAGE_SIZE, "window too small for its bookkeeping");
        let alloc = base.as_mut_ptr::<Region>();
        let free = (base + PAGE_SIZE).as_mut_ptr::<Region>();
        VmPool {
            regions: RegionTable::from_raw_parts(base, size, alloc, free),
            frame_pool,
            page_table,
            next: Cell::new(ptr::null()),
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Register with the owning page table and seed the management pages.
    ///
    /// Must be called once the pool has reached its final address, with the
    /// owning address space loaded: zeroing the management pages raises the
    /// pool's first two demand faults, and the handler only recognizes them
    /// once the pool is registered.
    pub unsafe fn activate(&self) {
        (*self.page_table).register_pool(self);
        self.regions.initialize();
        info!(
            "[vmm] pool {} over [{:p}, {:p})",
            self.id,
            self.regions.base(),
            self.regions.base() + self.regions.size()
        );
    }

    /// Reserve `size` bytes (rounded up to whole pages) of the window.
    /// The backing frames materialize on first touch.
    pub fn allocate(&self, size: usize) -> Result<VirtAddr, VmError> {
        self.regions.allocate(size).map_err(|err| {
            error!("[vmm] pool {}: allocate error {}", self.id, err as u32);
            err
        })
    }

    /// Return the region starting at `start` and unmap every page it
    /// covered, so stale translations cannot resurrect freed frames.
    pub fn release(&self, start: VirtAddr) -> Result<(), VmError> {
        let freed = self.regions.release(start).map_err(|err| {
            error!("[vmm] pool {}: release error {}", self.id, err as u32);
            err
        })?;
        unsafe {
            self.unmap_region(freed);
        }
        Ok(())
    }

    /// Whether `addr` lies in the management pages or a live allocation.
    pub fn is_legitimate(&self, addr: VirtAddr) -> bool {
        self.regions.is_legitimate(addr)
    }

    /// The pool providing physical backing for this window.
    pub fn backing_pool(&self) -> *const FramePool {
        self.frame_pool
    }

    /// Start of the window.
    pub fn base(&self) -> VirtAddr {
        self.regions.base()
    }

    /// Size of the window in bytes.
    pub fn size(&self) -> usize {
        self.regions.size()
    }

    pub(crate) fn next_pool(&self) -> *const VmPool {
        self.next.get()
    }

    pub(crate) fn set_next(&self, next: *const VmPool) {
        self.next.set(next);
    }

    unsafe fn unmap_region(&self, region: Region) {
        let table = &*self.page_table;
        let mut addr = region.base as usize;
        let end = (region.base + region.size) as usize;
        while addr < end {
            table.free_page(VirtAddr(addr));
            addr += PAGE_SIZE;
        }
    }
}

impl Drop for VmPool {
    fn drop(&mut self) {
        unsafe {
            (*self.page_table).unregister_pool(self);

            // Slot 0 is the management pages themselves; keep them mapped
            // while the other regions are torn down.
            for idx in 1..MAX_REGIONS {
                if let Some(region) = self.regions.allocated(idx) {
                    self.unmap_region(region);
                }
            }
            let base = self.regions.base();
            (*self.page_table).free_page(base + PAGE_SIZE);
            (*self.page_table).free_page(base);
        }
        debug!("[vmm] pool {} dropped", self.id);
    }
}
