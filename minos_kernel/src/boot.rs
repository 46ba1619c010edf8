//! Multiboot entry: a header the loader looks for, a boot stack, and a stub
//! that lands in [`crate::kernel_main`] with interrupts off.

#[cfg(target_arch = "x86")]
core::arch::global_asm!(
    r#"
    .section .multiboot, "a"
    .align 4
    .long 0x1BADB002            // magic
    .long 0x00000003            // align modules + provide memory map
    .long -(0x1BADB002 + 0x00000003)

    .section .bss
    .align 16
    .Lboot_stack_bottom:
    .skip 16384
    .Lboot_stack_top:

    .section .text
    .global _start
    _start:
        cli
        mov esp, offset .Lboot_stack_top
        call kernel_main
    .Lhang:
        hlt
        jmp .Lhang
    "#
);
