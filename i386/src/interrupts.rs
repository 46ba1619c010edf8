//! Control over the CPU's maskable-interrupt flag.

bitflags! {
    /// The EFLAGS register. Only the bits the kernel inspects are named.
    pub struct Eflags: u32 {
        /// Interrupt enable flag.
        const INTERRUPT = 1 << 9;
    }
}

#[cfg(target_arch = "x86")]
mod imp {
    use super::Eflags;
    use core::arch::asm;

    #[inline]
    pub unsafe fn enable() {
        asm!("sti", options(nomem, nostack));
    }

    #[inline]
    pub unsafe fn disable() {
        asm!("cli", options(nomem, nostack));
    }

    #[inline]
    pub fn enabled() -> bool {
        let eflags: u32;
        unsafe {
            asm!("pushfd", "pop {}", out(reg) eflags, options(nomem));
        }
        Eflags::from_bits_truncate(eflags).contains(Eflags::INTERRUPT)
    }
}

// Hosted builds track the interrupt flag in a plain atomic.
#[cfg(not(target_arch = "x86"))]
mod imp {
    use core::sync::atomic::{AtomicBool, Ordering};

    static INTERRUPT_FLAG: AtomicBool = AtomicBool::new(false);

    pub unsafe fn enable() {
        INTERRUPT_FLAG.store(true, Ordering::SeqCst);
    }

    pub unsafe fn disable() {
        INTERRUPT_FLAG.store(false, Ordering::SeqCst);
    }

    pub fn enabled() -> bool {
        INTERRUPT_FLAG.load(Ordering::SeqCst)
    }
}

pub use self::imp::*;

/// Masks interrupts for the current scope.
///
/// Dropping the guard restores the interrupt flag only if it was set when the
/// guard was created, so nested critical sections compose. Code that context
/// switches away while holding a guard relies on the destination to unmask on
/// its own side; a guard on a stack that is never resumed simply never runs
/// its destructor.
pub struct IrqGuard {
    was_enabled: bool,
}

impl IrqGuard {
    pub fn new() -> IrqGuard {
        let was_enabled = enabled();
        if was_enabled {
            unsafe { disable() };
        }
        IrqGuard { was_enabled }
    }
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.was_enabled {
            unsafe { enable() };
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // The emulated interrupt flag is shared process state, so the tests that
    // poke it must not run concurrently.
    static FLAG_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn guard_restores_when_enabled_at_entry() {
        let _serial = FLAG_LOCK.lock().unwrap();
        unsafe { enable() };
        {
            let _guard = IrqGuard::new();
            assert!(!enabled(), "guard must mask interrupts");
            {
                let _nested = IrqGuard::new();
                assert!(!enabled());
            }
            // the nested guard saw interrupts already masked
            assert!(!enabled());
        }
        assert!(enabled(), "outer guard must restore the flag");
    }

    #[test]
    fn guard_keeps_masked_when_disabled_at_entry() {
        let _serial = FLAG_LOCK.lock().unwrap();
        unsafe { disable() };
        {
            let _guard = IrqGuard::new();
            assert!(!enabled());
        }
        assert!(!enabled());
    }
}
