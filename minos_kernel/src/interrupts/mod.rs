//! Exception and IRQ dispatch.
//!
//! Every vector enters through a small assembly stub that completes the
//! register frame and funnels into a common dispatcher. Handlers registered
//! here receive the whole frame; for IRQs the PIC is acknowledged *before*
//! the handler runs, so a handler is free to context-switch away and let the
//! next timer tick reach whoever is running by then.

#[cfg(target_arch = "x86")]
use i386::idt::{GateType, Idt, IdtEntry};
use i386::pic;
#[cfg(target_arch = "x86")]
use i386::segments::{Ring, Selector};

/// Vector the first PIC is remapped to; IRQ `n` arrives at `IRQ_BASE + n`.
pub const IRQ_BASE: u8 = 0x20;

/// Vectors with dispatchable handlers: CPU exceptions and the 16 PIC lines.
pub const VECTOR_COUNT: usize = 48;

/// Vector of the timer interrupt (IRQ 0).
pub const TIMER_VECTOR: u8 = IRQ_BASE;

/// The register frame the entry stubs build, in stack order.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Regs {
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub int_no: u32,
    pub err_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
}

// the layout is shared with the entry stubs and the thread bootstrap frames
assert_eq_size!(Regs, [u32; 17]);

/// A registered handler. Runs with interrupts masked.
pub type HandlerFn = fn(&mut Regs);

#[cfg(target_arch = "x86")]
static IDT: spin::Mutex<Idt> = spin::Mutex::new(Idt::new());

static HANDLERS: spin::Mutex<[Option<HandlerFn>; VECTOR_COUNT]> =
    spin::Mutex::new([None; VECTOR_COUNT]);

/// Attach `handler` to `vector`, replacing any previous handler.
pub fn register_handler(vector: u8, handler: HandlerFn) {
    HANDLERS.lock()[vector as usize] = Some(handler);
}

/// Build and load the IDT, remap the PIC away from the exception range and
/// unmask only the timer line.
pub unsafe fn init() {
    #[cfg(target_arch = "x86")]
    {
        let mut idt = IDT.lock();
        let intgate = |handler| {
            IdtEntry::new(
                GateType::INTERRUPT_GATE,
                Selector::KERNEL_CODE,
                handler,
                Ring::RING0,
                true,
            )
        };
        for (vector, stub) in stubs::TABLE.iter().enumerate() {
            idt[vector as u8] = intgate(*stub);
        }
        i386::idt::load_idt(&idt);
    }
    // default mapping of the PIC collides with CPU exceptions
    pic::remap(IRQ_BASE, IRQ_BASE + 8);
    // only the timer may interrupt; everything else stays masked
    pic::set_masks(0xFE, 0xFF);
    debug!("[irq] dispatcher initialized");
}

/// Common dispatcher all stubs funnel into.
#[no_mangle]
extern "C-unwind" fn interrupt_dispatch(regs: &mut Regs) {
    let vector = regs.int_no as u8;
    if vector as usize >= VECTOR_COUNT {
        debug!("[irq] vector {} out of dispatch range", vector);
        return;
    }

    if (IRQ_BASE..IRQ_BASE + 16).contains(&vector) {
        // Acknowledge first: a handler may not return to this frame.
        unsafe { pic::send_eoi(vector - IRQ_BASE) };
    }

    let handler = HANDLERS.lock()[vector as usize];
    match handler {
        Some(handler) => handler(regs),
        None if vector < 32 => {
            panic!(
                "unhandled exception {} (error code {:#x}) at {:#010x}",
                vector, regs.err_code, regs.eip
            );
        }
        None => {
            debug!("[irq] spurious vector {}", vector);
        }
    }
}

#[cfg(target_arch = "x86")]
mod stubs {
    //! One naked entry point per vector. Vectors whose exceptions push a
    //! hardware error code skip the dummy push.

    use core::arch::global_asm;

    global_asm!(
        r#"
        .section .text
        .global interrupt_common
        interrupt_common:
            pusha
            push ds
            push es
            push fs
            push gs
            mov ax, 0x10
            mov ds, ax
            mov es, ax
            push esp
            call interrupt_dispatch
            add esp, 4
            pop gs
            pop fs
            pop es
            pop ds
            popa
            add esp, 8
            iretd
        "#
    );

    macro_rules! isr_no_error_code {
        ($name:ident, $vector:expr) => {
            global_asm!(concat!(
                ".global ",
                stringify!($name),
                "\n",
                stringify!($name),
                ":\n",
                "    push 0\n",
                "    push ",
                stringify!($vector),
                "\n",
                "    jmp interrupt_common\n",
            ));
        };
    }

    macro_rules! isr_error_code {
        ($name:ident, $vector:expr) => {
            global_asm!(concat!(
                ".global ",
                stringify!($name),
                "\n",
                stringify!($name),
                ":\n",
                "    push ",
                stringify!($vector),
                "\n",
                "    jmp interrupt_common\n",
            ));
        };
    }

    isr_no_error_code!(isr0, 0);
    isr_no_error_code!(isr1, 1);
    isr_no_error_code!(isr2, 2);
    isr_no_error_code!(isr3, 3);
    isr_no_error_code!(isr4, 4);
    isr_no_error_code!(isr5, 5);
    isr_no_error_code!(isr6, 6);
    isr_no_error_code!(isr7, 7);
    isr_error_code!(isr8, 8);
    isr_no_error_code!(isr9, 9);
    isr_error_code!(isr10, 10);
    isr_error_code!(isr11, 11);
    isr_error_code!(isr12, 12);
    isr_error_code!(isr13, 13);
    isr_error_code!(isr14, 14);
    isr_no_error_code!(isr15, 15);
    isr_no_error_code!(isr16, 16);
    isr_error_code!(isr17, 17);
    isr_no_error_code!(isr18, 18);
    isr_no_error_code!(isr19, 19);
    isr_no_error_code!(isr20, 20);
    isr_no_error_code!(isr21, 21);
    isr_no_error_code!(isr22, 22);
    isr_no_error_code!(isr23, 23);
    isr_no_error_code!(isr24, 24);
    isr_no_error_code!(isr25, 25);
    isr_no_error_code!(isr26, 26);
    isr_no_error_code!(isr27, 27);
    isr_no_error_code!(isr28, 28);
    isr_no_error_code!(isr29, 29);
    isr_no_error_code!(isr30, 30);
    isr_no_error_code!(isr31, 31);
    isr_no_error_code!(isr32, 32);
    isr_no_error_code!(isr33, 33);
    isr_no_error_code!(isr34, 34);
    isr_no_error_code!(isr35, 35);
    isr_no_error_code!(isr36, 36);
    isr_no_error_code!(isr37, 37);
    isr_no_error_code!(isr38, 38);
    isr_no_error_code!(isr39, 39);
    isr_no_error_code!(isr40, 40);
    isr_no_error_code!(isr41, 41);
    isr_no_error_code!(isr42, 42);
    isr_no_error_code!(isr43, 43);
    isr_no_error_code!(isr44, 44);
    isr_no_error_code!(isr45, 45);
    isr_no_error_code!(isr46, 46);
    isr_no_error_code!(isr47, 47);

    extern "C" {
        fn isr0();
        fn isr1();
        fn isr2();
        fn isr3();
        fn isr4();
        fn isr5();
        fn isr6();
        fn isr7();
        fn isr8();
        fn isr9();
        fn isr10();
        fn isr11();
        fn isr12();
        fn isr13();
        fn isr14();
        fn isr15();
        fn isr16();
        fn isr17();
        fn isr18();
        fn isr19();
        fn isr20();
        fn isr21();
        fn isr22();
        fn isr23();
        fn isr24();
        fn isr25();
        fn isr26();
        fn isr27();
        fn isr28();
        fn isr29();
        fn isr30();
        fn isr31();
        fn isr32();
        fn isr33();
        fn isr34();
        fn isr35();
        fn isr36();
        fn isr37();
        fn isr38();
        fn isr39();
        fn isr40();
        fn isr41();
        fn isr42();
        fn isr43();
        fn isr44();
        fn isr45();
        fn isr46();
        fn isr47();
    }

    pub(super) static TABLE: [i386::idt::Handler; super::VECTOR_COUNT] = [
        isr0, isr1, isr2, isr3, isr4, isr5, isr6, isr7, isr8, isr9, isr10, isr11, isr12, isr13,
        isr14, isr15, isr16, isr17, isr18, isr19, isr20, isr21, isr22, isr23, isr24, isr25, isr26,
        isr27, isr28, isr29, isr30, isr31, isr32, isr33, isr34, isr35, isr36, isr37, isr38, isr39,
        isr40, isr41, isr42, isr43, isr44, isr45, isr46, isr47,
    ];
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_regs(vector: u32) -> Regs {
        Regs {
            gs: 0,
            fs: 0,
            es: 0x10,
            ds: 0x10,
            edi: 0,
            esi: 0,
            ebp: 0,
            esp: 0,
            ebx: 0,
            edx: 0,
            ecx: 0,
            eax: 0,
            int_no: vector,
            err_code: 0,
            eip: 0x0010_1234,
            cs: 0x08,
            eflags: 0x202,
        }
    }

    #[test]
    fn handlers_receive_their_vector() {
        use std::sync::atomic::{AtomicU32, Ordering};
        static SEEN: AtomicU32 = AtomicU32::new(0);

        fn probe(regs: &mut Regs) {
            SEEN.store(regs.int_no, Ordering::SeqCst);
        }

        register_handler(45, probe);
        interrupt_dispatch(&mut sample_regs(45));
        assert_eq!(SEEN.load(Ordering::SeqCst), 45);
    }

    #[test]
    fn unhandled_irqs_are_ignored() {
        // must not panic
        interrupt_dispatch(&mut sample_regs(46));
    }

    #[test]
    #[should_panic(expected = "unhandled exception")]
    fn unhandled_exceptions_panic() {
        interrupt_dispatch(&mut sample_regs(6));
    }
}
