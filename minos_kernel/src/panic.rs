#[cfg(not(test))]
use core::fmt::Write;
#[cfg(not(test))]
use core::panic::PanicInfo;

#[cfg(not(test))]
use i386::serial::{SerialPort, COM1_ADDR};
#[cfg(not(test))]
use i386::VirtAddr;

#[cfg(not(test))]
use crate::vga;

#[panic_handler]
#[cfg(not(test))]
fn panic(panic_info: &PanicInfo) -> ! {
    fn write_panic(writer: &mut vga::Writer, panic_info: &PanicInfo) {
        let _ = writeln!(writer, "{}", panic_info);
    }

    fn extreme_panic(panic_info: &PanicInfo) {
        // Extreme panic is for when the VGA system is currently locked or
        // has never been initialized. The system is beyond saving anyway,
        // just grab a new instance of the VGA buffer and hope we get some
        // info out.
        let vga_addr = VirtAddr(vga::VGA_PHYS_ADDR.0);
        let vgabuf = unsafe { vga::VgaMem::from_addr(vga_addr) };
        let mut temp_console = vga::Writer::with_colors(vgabuf, vga::Color::White, vga::Color::Red);
        write_panic(&mut temp_console, panic_info);
    }

    // Try to grab the global VGA writer first, so that the panic doesn't
    // erase previously logged info. That info could be very valuable for
    // debugging.
    match vga::GLOBAL_WRITER.try_lock() {
        None => extreme_panic(panic_info),
        Some(mut optwriter) => match *optwriter {
            None => extreme_panic(panic_info),
            Some(ref mut writer) => write_panic(writer, panic_info),
        },
    };

    // Also dump the panic to the serial port.
    let mut com1 = unsafe { SerialPort::new(COM1_ADDR) };
    let _ = writeln!(com1, "{}", panic_info);

    unsafe {
        i386::interrupts::disable();
        i386::hang()
    }
}
