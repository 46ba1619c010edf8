//! Segmentation: selectors, descriptors and the flat GDT the kernel runs on.

use core::mem;

/// A segment selector.
#[derive(Eq, PartialEq, Ord, PartialOrd, Copy, Clone, Debug)]
pub struct Selector(pub u16);

impl Selector {
    pub const NULL: Selector = Selector(0);
    /// Kernel code segment, second GDT slot.
    pub const KERNEL_CODE: Selector = Selector(0x08);
    /// Kernel data segment, third GDT slot.
    pub const KERNEL_DATA: Selector = Selector(0x10);
}

/// Privilege level.
#[derive(Eq, PartialEq, Ord, PartialOrd, Copy, Clone, Debug)]
pub struct Ring(u8);

impl Ring {
    pub const RING0: Ring = Ring(0);
    pub const RING3: Ring = Ring(3);

    /// Create a new ring if the number is valid (0 = kernel mode, 3 = user mode).
    pub fn new(ring: u8) -> Option<Ring> {
        if ring <= 3 {
            Some(Ring(ring))
        } else {
            None
        }
    }

    pub fn number(&self) -> u8 {
        self.0
    }
}

/// A GDT segment descriptor in its packed hardware representation.
#[derive(Eq, PartialEq, Copy, Clone, Debug)]
#[repr(transparent)]
pub struct Descriptor(pub u64);

assert_eq_size!(Descriptor, u64);

impl Descriptor {
    pub const NULL: Descriptor = Descriptor(0);

    /// Encode a descriptor from base, limit and the access/flags bytes.
    /// `limit` is in units selected by the granularity bit of `flags`.
    pub const fn new(base: u32, limit: u32, access: u8, flags: u8) -> Descriptor {
        let base = base as u64;
        let limit = limit as u64;
        let encoded = (limit & 0xFFFF)
            | (base & 0xFF_FFFF) << 16
            | (access as u64) << 40
            | (limit & 0xF_0000) << 32
            | ((flags as u64) & 0xF) << 52
            | (base & 0xFF00_0000) << 32;
        Descriptor(encoded)
    }

    /// Flat 4 GiB ring-0 code segment (32-bit, 4 KiB granularity).
    pub const fn kernel_code() -> Descriptor {
        Descriptor::new(0, 0xF_FFFF, 0x9A, 0xC)
    }

    /// Flat 4 GiB ring-0 data segment (32-bit, 4 KiB granularity).
    pub const fn kernel_data() -> Descriptor {
        Descriptor::new(0, 0xF_FFFF, 0x92, 0xC)
    }
}

/// The global descriptor table. The kernel only ever needs the null entry
/// and the two flat ring-0 segments.
#[repr(C, align(8))]
pub struct Gdt {
    entries: [Descriptor; 3],
}

impl Gdt {
    pub const fn new() -> Gdt {
        Gdt {
            entries: [
                Descriptor::NULL,
                Descriptor::kernel_code(),
                Descriptor::kernel_data(),
            ],
        }
    }
}

/// GDT register value.
#[repr(C, packed)]
struct Gdtr {
    limit: u16,
    offset: u32,
}

/// Load the GDT and reload all segment registers with the kernel selectors.
#[cfg(target_arch = "x86")]
pub unsafe fn load_gdt(gdt: &'static Gdt) {
    use core::arch::asm;

    let gdtr = Gdtr {
        limit: mem::size_of::<Gdt>() as u16 - 1,
        offset: gdt as *const Gdt as u32,
    };
    asm!(
        "lgdt [{gdtr}]",
        "mov ds, {sel:x}",
        "mov es, {sel:x}",
        "mov fs, {sel:x}",
        "mov gs, {sel:x}",
        "mov ss, {sel:x}",
        // far return to reload cs
        "push {code}",
        "lea {scratch}, [2f]",
        "push {scratch}",
        "retf",
        "2:",
        gdtr = in(reg) &gdtr,
        sel = in(reg) Selector::KERNEL_DATA.0 as u32,
        code = const Selector::KERNEL_CODE.0 as i32,
        scratch = out(reg) _,
    );
}

#[cfg(not(target_arch = "x86"))]
pub unsafe fn load_gdt(gdt: &'static Gdt) {
    let _ = Gdtr {
        limit: mem::size_of::<Gdt>() as u16 - 1,
        offset: gdt as *const Gdt as u32,
    };
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn descriptor_encoding() {
        // Flat code segment: limit f_ffff, base 0, access 9a, flags c.
        assert_eq!(Descriptor::kernel_code().0, 0x00CF_9A00_0000_FFFF);
        assert_eq!(Descriptor::kernel_data().0, 0x00CF_9200_0000_FFFF);
        assert_eq!(Descriptor::NULL.0, 0);
    }

    #[test]
    fn descriptor_base_placement() {
        let d = Descriptor::new(0x1234_5678, 0, 0, 0);
        // base low 24 bits at 16..40, high byte at 56..64
        assert_eq!(d.0, 0x1200_0034_5678_0000);
    }
}
