//! Per-address-space two-level page tables.
//!
//! The first table constructed becomes the kernel table: it eagerly
//! provisions secondary tables for the shared low gigabyte, identity-maps the
//! first 4 MiB, and installs a recursive self-map in directory slot 255.
//! Every later table copies the shared directory entries and installs its own
//! recursive entry, so in any address space a page table entry is reachable
//! at a fixed virtual window without walking unmapped memory.
//!
//! Page directories (and the pool bitmaps) live in the identity-mapped low
//! region, so they stay accessible from every address space once paging is
//! on. Secondary tables of the kernel range are written through the physical
//! window before paging is enabled; everything later goes through the
//! recursive map.

use core::cell::Cell;
use core::ptr;

use i386::cr;
use i386::paging::{FaultCode, Flags, PageTableEntry, ENTRIES_PER_TABLE, PDE_SPAN};
use i386::{PhysAddr, VirtAddr};

use crate::physical::{FramePool, PageFrame, PoolError};
use crate::vm::VmPool;
use crate::{PAGE_ALIGN_BITS, PAGE_SIZE};

/// Directory slots shared between all address spaces: the low gigabyte.
pub const KERNEL_PDE_COUNT: usize = 256;

/// Directory slot holding the recursive self-map.
pub const RECURSIVE_PDE_INDEX: usize = 255;

/// Start of the virtual window through which the recursive map exposes every
/// page table entry of the current address space.
pub const RECURSIVE_BASE: usize = RECURSIVE_PDE_INDEX << 22;

/// Fault-handler outcomes that are reported rather than resolved. The
/// numeric values are the codes that appear in the log.
#[derive(Eq, PartialEq, Debug, Copy, Clone)]
pub enum FaultError {
    /// The page was present; the access violated its protection.
    Protection = 1,
    /// No registered pool claims the faulting address.
    Invalid = 2,
}

/// Directory slot responsible for a virtual address.
pub fn pde_index(addr: VirtAddr) -> usize {
    (addr.0 >> 22) & 0x3FF
}

/// Virtual address at which the recursive map exposes the page table entry
/// translating `addr`.
pub fn pte_window_address(addr: VirtAddr) -> VirtAddr {
    VirtAddr((RECURSIVE_BASE | (addr.0 >> 10)) & !0x3)
}

struct PagingState {
    kernel_pool: *const FramePool,
    process_pool: *const FramePool,
    shared_size: usize,
    kernel_directory: *mut PageTableEntry,
    kernel_table: *const PageTable,
    current_table: *const PageTable,
    kernel_pools: *const VmPool,
}

// Only written from kernel context with interrupts masked where it matters.
unsafe impl Send for PagingState {}

static PAGING: spin::Mutex<PagingState> = spin::Mutex::new(PagingState {
    kernel_pool: ptr::null(),
    process_pool: ptr::null(),
    shared_size: 0,
    kernel_directory: ptr::null_mut(),
    kernel_table: ptr::null(),
    current_table: ptr::null(),
    kernel_pools: ptr::null(),
});

/// Hand the paging subsystem its frame pools and the size of the
/// eagerly-mapped shared region. Must be called once, before the first
/// [`PageTable`] is constructed.
///
/// The pools must stay at their addresses for the lifetime of the kernel.
pub unsafe fn init_paging(
    kernel_pool: &FramePool,
    process_pool: &FramePool,
    shared_size: usize,
) {
    let mut st = PAGING.lock();
    st.kernel_pool = kernel_pool;
    st.process_pool = process_pool;
    st.shared_size = shared_size;
    info!(
        "[vmm] paging initialized, {} MiB shared",
        shared_size >> 20
    );
}

/// Load the kernel page table, making the kernel address space current.
pub unsafe fn load_kernel() {
    let kernel_table = PAGING.lock().kernel_table;
    if !kernel_table.is_null() {
        (*kernel_table).load();
    }
}

/// Turn on address translation. The current page table must be loaded.
pub unsafe fn enable_paging() {
    cr::enable_paging();
    info!("[vmm] paging enabled");
}

/// A two-level page table: a directory frame plus on-demand secondary
/// tables, forming one address space.
pub struct PageTable {
    /// Location of the 4 KiB directory. The frame comes from the kernel
    /// pool, so its virtual and physical addresses coincide.
    directory: *mut PageTableEntry,
    /// Pools registered against this address space, walked by the fault
    /// handler.
    pools: Cell<*const VmPool>,
}

impl PageTable {
    /// Construct an address space.
    ///
    /// The first call builds the kernel table and must happen before paging
    /// is enabled, while physical memory is still directly addressable.
    /// Later calls clone the shared kernel range into a fresh directory.
    pub unsafe fn new() -> Result<PageTable, PoolError> {
        let (kernel_pool, process_pool, shared_size, kernel_directory) = {
            let st = PAGING.lock();
            (
                st.kernel_pool,
                st.process_pool,
                st.shared_size,
                st.kernel_directory,
            )
        };
        assert!(
            !kernel_pool.is_null() && !process_pool.is_null(),
            "paging used before init_paging"
        );

        let directory_frame = (*kernel_pool).get_frames(1)?;
        let directory: *mut PageTableEntry =
            directory_frame.identity_address().as_mut_ptr();

        if kernel_directory.is_null() {
            Self::build_kernel_directory(directory, &*process_pool, shared_size)?;
            PAGING.lock().kernel_directory = directory;
            debug!("[vmm] kernel directory at {:p}", directory);
        } else {
            // Clone the shared range, then claim the recursive slot for the
            // new directory.
            for i in 0..KERNEL_PDE_COUNT {
                directory.add(i).write(kernel_directory.add(i).read());
            }
            for i in KERNEL_PDE_COUNT..ENTRIES_PER_TABLE {
                directory.add(i).write(PageTableEntry::vacant());
            }
            directory.add(RECURSIVE_PDE_INDEX).write(PageTableEntry::new(
                PhysAddr(directory as usize),
                Flags::PRESENT | Flags::WRITABLE,
            ));
            debug!("[vmm] directory at {:p} clones kernel range", directory);
        }

        Ok(PageTable {
            directory,
            pools: Cell::new(ptr::null()),
        })
    }

    /// Populate the very first directory: eager secondary tables for the
    /// shared range, identity mapping of the first 4 MiB, recursive entry.
    unsafe fn build_kernel_directory(
        directory: *mut PageTableEntry,
        process_pool: &FramePool,
        shared_size: usize,
    ) -> Result<(), PoolError> {
        for i in 0..KERNEL_PDE_COUNT {
            let table_frame = process_pool.get_frames(1)?;
            let table: *mut PageTableEntry = table_frame.identity_address().as_mut_ptr();
            for j in 0..ENTRIES_PER_TABLE {
                table.add(j).write(PageTableEntry::vacant());
            }
            directory.add(i).write(PageTableEntry::new(
                table_frame.start_address(),
                Flags::PRESENT | Flags::WRITABLE,
            ));
        }

        // Identity-map the directly addressed low region through the first
        // secondary table.
        let low_table: *mut PageTableEntry = {
            let first = directory.read();
            VirtAddr(first.base().0).as_mut_ptr()
        };
        let low_pages = shared_size / PAGE_SIZE;
        debug_assert!(low_pages <= ENTRIES_PER_TABLE);
        for j in 0..low_pages.min(ENTRIES_PER_TABLE) {
            low_table.add(j).write(PageTableEntry::new(
                PhysAddr(j * PAGE_SIZE),
                Flags::PRESENT | Flags::WRITABLE,
            ));
        }

        for i in KERNEL_PDE_COUNT..ENTRIES_PER_TABLE {
            directory.add(i).write(PageTableEntry::vacant());
        }

        // Slot 255 traded its eager table for the directory itself; the
        // table frame provisioned above stays allocated.
        directory.add(RECURSIVE_PDE_INDEX).write(PageTableEntry::new(
            PhysAddr(directory as usize),
            Flags::PRESENT | Flags::WRITABLE,
        ));
        Ok(())
    }

    /// Physical address of this table's directory.
    pub fn directory_address(&self) -> PhysAddr {
        PhysAddr(self.directory as usize)
    }

    /// Make this the current address space.
    ///
    /// The table must not move after it has been loaded: the paging
    /// subsystem keeps a pointer to it until another table is loaded.
    pub unsafe fn load(&self) {
        {
            let mut st = PAGING.lock();
            st.current_table = self;
            if st.kernel_directory == self.directory {
                st.kernel_table = self;
            }
        }
        if cr::active_directory() != self.directory_address() {
            cr::load_directory(self.directory_address());
        }
    }

    /// Attach a pool to the address spaces its addresses are valid in:
    /// pools of the kernel table are visible everywhere, pools of other
    /// tables only in their own address space.
    ///
    /// The pool must not move while it stays registered.
    pub unsafe fn register_pool(&self, pool: &VmPool) {
        let mut st = PAGING.lock();
        if st.kernel_table == self as *const PageTable {
            pool.set_next(st.kernel_pools);
            st.kernel_pools = pool;
        } else {
            pool.set_next(self.pools.get());
            self.pools.set(pool);
        }
        debug!("[vmm] pool registered");
    }

    /// Detach a pool registered with [`PageTable::register_pool`].
    pub(crate) unsafe fn unregister_pool(&self, pool: *const VmPool) {
        let mut st = PAGING.lock();
        if unlink_pool(&mut st.kernel_pools, pool) {
            return;
        }
        let mut head = self.pools.get();
        if unlink_pool(&mut head, pool) {
            self.pools.set(head);
        }
    }

    /// Resolve a page fault.
    ///
    /// Protection violations and addresses outside every registered pool are
    /// reported and left alone. A legitimate miss is backed by a fresh
    /// process-pool frame, allocating an intermediate secondary table on the
    /// way if the directory slot is still vacant.
    pub unsafe fn handle_fault(code: FaultCode) {
        let addr = cr::fault_address();

        if code.contains(FaultCode::PROTECTION) {
            error!(
                "[vmm] error {}: protection violation at {:p}",
                FaultError::Protection as u32,
                addr
            );
            return;
        }

        let (kernel_pools, current, process_pool) = {
            let st = PAGING.lock();
            (st.kernel_pools, st.current_table, st.process_pool)
        };

        let legitimate = claimed_by_any(kernel_pools, addr)
            || (!current.is_null() && claimed_by_any((*current).pools.get(), addr));
        if !legitimate {
            error!(
                "[vmm] error {}: no pool claims faulting address {:p}",
                FaultError::Invalid as u32,
                addr
            );
            return;
        }

        let process_pool = &*process_pool;
        let pde = Self::pde_address(addr);
        if !(*pde).is_present() {
            debug!("[vmm] directory fault for {:p}", addr);
            let table_frame = match process_pool.get_frames(1) {
                Ok(frame) => frame,
                Err(_) => return,
            };
            *pde = PageTableEntry::new(
                table_frame.start_address(),
                Flags::PRESENT | Flags::WRITABLE,
            );
            // The new table becomes visible through the recursive window;
            // wipe it before anything dereferences its entries.
            let table: *mut PageTableEntry =
                pte_window_address(VirtAddr(addr.0 & !(PDE_SPAN - 1))).as_mut_ptr();
            for j in 0..ENTRIES_PER_TABLE {
                table.add(j).write(PageTableEntry::vacant());
            }
        }

        let pte: *mut PageTableEntry = pte_window_address(addr).as_mut_ptr();
        if !(*pte).is_present() {
            let frame = match process_pool.get_frames(1) {
                Ok(frame) => frame,
                Err(_) => return,
            };
            *pte = PageTableEntry::new(
                frame.start_address(),
                Flags::PRESENT | Flags::WRITABLE,
            );
            debug!("[vmm] backed {:p} with frame {}", addr, frame.0);
        }
    }

    /// Drop the mapping of a single page, returning its frame to the owning
    /// pool. A page that was never backed is left alone.
    ///
    /// This address space must be the current one: the page table entry is
    /// reached through the recursive window.
    pub unsafe fn free_page(&self, addr: VirtAddr) {
        let pte: *mut PageTableEntry = pte_window_address(addr).as_mut_ptr();
        if !(*pte).is_present() {
            return;
        }
        let frame = PageFrame((*pte).base().0 >> PAGE_ALIGN_BITS);
        if let Err(err) = FramePool::release_frames(frame) {
            warn!("[vmm] freeing page {:p}: {:?}", addr, err);
        }
        *pte = PageTableEntry::vacant();
        trace!("[vmm] unmapped {:p} (frame {})", addr, frame.0);
        // Flush the TLB.
        cr::load_directory(self.directory_address());
    }

    /// Directory entry responsible for `addr` in the current address space.
    /// The directory itself is identity-mapped, so plain indexing suffices.
    unsafe fn pde_address(addr: VirtAddr) -> *mut PageTableEntry {
        let current = PAGING.lock().current_table;
        debug_assert!(!current.is_null());
        (*current).directory.add(pde_index(addr))
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        unsafe {
            // Secondary tables above the shared range belong to this address
            // space alone.
            for i in KERNEL_PDE_COUNT..ENTRIES_PER_TABLE {
                let entry = self.directory.add(i).read();
                if entry.is_present() {
                    let frame = PageFrame(entry.base().0 >> PAGE_ALIGN_BITS);
                    if let Err(err) = FramePool::release_frames(frame) {
                        warn!("[vmm] dropping table: {:?}", err);
                    }
                }
            }

            let directory_frame = PageFrame(self.directory as usize >> PAGE_ALIGN_BITS);
            if let Err(err) = FramePool::release_frames(directory_frame) {
                warn!("[vmm] dropping directory: {:?}", err);
            }
            // Retire the identity-window mapping of the freed directory
            // frame in the current address space.
            let pte: *mut PageTableEntry =
                pte_window_address(VirtAddr(self.directory as usize)).as_mut_ptr();
            *pte = PageTableEntry::vacant();

            // Reload whatever is current to flush the TLB.
            let current = PAGING.lock().current_table;
            if !current.is_null() && current != self as *const PageTable {
                cr::load_directory((*current).directory_address());
            }
        }
    }
}

/// Walk a pool list checking whether any pool claims `addr`.
unsafe fn claimed_by_any(head: *const VmPool, addr: VirtAddr) -> bool {
    let mut cursor = head;
    while !cursor.is_null() {
        if (*cursor).is_legitimate(addr) {
            return true;
        }
        cursor = (*cursor).next_pool();
    }
    false
}

/// Remove `pool` from the list rooted at `head`. Returns whether it was
/// found.
unsafe fn unlink_pool(head: &mut *const VmPool, pool: *const VmPool) -> bool {
    if *head == pool {
        *head = (*pool).next_pool();
        return true;
    }
    let mut cursor = *head;
    while !cursor.is_null() {
        if (*cursor).next_pool() == pool {
            (*cursor).set_next((*pool).next_pool());
            return true;
        }
        cursor = (*cursor).next_pool();
    }
    false
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn recursive_window_location() {
        assert_eq!(RECURSIVE_BASE, 0x3FC0_0000);
        // the window is the last shared directory slot
        assert_eq!(pde_index(VirtAddr(RECURSIVE_BASE)), RECURSIVE_PDE_INDEX);
    }

    #[test]
    fn directory_indexing() {
        assert_eq!(pde_index(VirtAddr(0)), 0);
        assert_eq!(pde_index(VirtAddr(0x003F_FFFF)), 0);
        assert_eq!(pde_index(VirtAddr(0x0040_0000)), 1);
        assert_eq!(pde_index(VirtAddr(0x2000_2000)), 128);
        assert_eq!(pde_index(VirtAddr(0x4000_0000)), 256);
        assert_eq!(pde_index(VirtAddr(0xFFFF_FFFF)), 1023);
    }

    #[test]
    fn pte_window_formula() {
        // each 4 KiB page of the window images one whole page table
        assert_eq!(
            pte_window_address(VirtAddr(0)),
            VirtAddr(RECURSIVE_BASE)
        );
        assert_eq!(
            pte_window_address(VirtAddr(0x1000)),
            VirtAddr(RECURSIVE_BASE | 0x4)
        );
        // 0x2000_2000: directory slot 128, table slot 2
        assert_eq!(
            pte_window_address(VirtAddr(0x2000_2000)),
            VirtAddr(RECURSIVE_BASE | (128 << 12) | (2 << 2))
        );
        // entries are word aligned even for unaligned fault addresses
        assert_eq!(
            pte_window_address(VirtAddr(0x2000_2ABD)),
            VirtAddr((RECURSIVE_BASE | (0x2000_2ABD >> 10)) & !0x3)
        );
    }

    #[test]
    fn window_of_window_is_the_directory() {
        // following the recursive entry twice lands on the directory itself
        let dir_entry = pte_window_address(VirtAddr(RECURSIVE_BASE));
        assert_eq!(
            dir_entry,
            VirtAddr(RECURSIVE_BASE | (RECURSIVE_PDE_INDEX << 12))
        );
    }
}
