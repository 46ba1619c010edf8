//! A simple wrapper around the VGA text buffer.
//!
//! The creation of the wrapper is unsafe, because it would allow concurrent
//! modification of the same memory location, as there is only one VGA
//! buffer.

use core::fmt;

use i386::{PhysAddr, VirtAddr};

mod writer;

pub use self::writer::Writer;

/// Physical address of the VGA text buffer.
pub const VGA_PHYS_ADDR: PhysAddr = PhysAddr(0xB8000);

/// Columns of the text buffer.
pub const WIDTH: usize = 80;

/// Rows of the text buffer.
pub const HEIGHT: usize = 25;

/// Provides a single synchronized access to the console.
pub static GLOBAL_WRITER: spin::Mutex<Option<Writer>> = spin::Mutex::new(None);

/// Initialize the global VGA subsystem.
pub fn init(vga_base: VirtAddr) {
    let mut vga = GLOBAL_WRITER.lock();
    let mem = unsafe { VgaMem::from_addr(vga_base) };
    let mut console = Writer::new(mem);
    console.clear();
    *vga = Some(console);
}

pub fn writer() -> WriterHandle {
    WriterHandle
}

/// Handle to the globally synchronized VGA console.
#[derive(Debug)]
pub struct WriterHandle;

impl fmt::Write for WriterHandle {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut console_guard = GLOBAL_WRITER.lock();
        let console = (*console_guard).as_mut().ok_or(fmt::Error)?;

        for ch in s.bytes() {
            if ch <= 0x7F {
                console.write_char(ch);
            }
        }
        Ok(())
    }
}

/// The 16 VGA colors.
#[derive(Eq, PartialEq, Copy, Clone, Debug)]
#[repr(u8)]
pub enum Color {
    Black = 0,
    Blue = 1,
    Green = 2,
    Cyan = 3,
    Red = 4,
    Magenta = 5,
    Brown = 6,
    LightGray = 7,
    DarkGray = 8,
    LightBlue = 9,
    LightGreen = 10,
    LightCyan = 11,
    LightRed = 12,
    LightMagenta = 13,
    Yellow = 14,
    White = 15,
}

impl Color {
    /// Return the VGA code of the given color.
    pub fn to_vga(self) -> u8 {
        self as u8
    }
}

/// Entry in the VGA buffer consisting of a foreground and background color,
/// and an 8 bit character.
#[derive(Eq, PartialEq, Copy, Clone, Debug)]
pub struct VgaChar(u16);

impl VgaChar {
    /// Create a new VGA character representation from its colors and a
    /// character.
    pub fn new(fg: Color, bg: Color, ch: u8) -> VgaChar {
        VgaChar((ch as u16) | ((fg as u16) << 8) | ((bg as u16) << 12))
    }

    /// Extract the character.
    pub fn ch(self) -> u8 {
        (self.0 & 0xFF) as u8
    }
}

/// The memory of a VGA text buffer, `WIDTH * HEIGHT` 16-bit cells.
pub struct VgaMem {
    buffer: *mut u16,
}

// There is only one VGA buffer and it sits behind the writer mutex.
unsafe impl Send for VgaMem {}

impl VgaMem {
    /// Wrap the buffer at the given location. Unsafe because aliasing the
    /// real VGA memory would interleave output arbitrarily.
    pub unsafe fn from_addr(addr: VirtAddr) -> VgaMem {
        VgaMem {
            buffer: addr.as_mut_ptr(),
        }
    }

    pub fn write(&mut self, index: usize, ch: VgaChar) {
        assert!(index < WIDTH * HEIGHT);
        unsafe {
            self.buffer.add(index).write_volatile(ch.0);
        }
    }

    pub fn read(&self, index: usize) -> VgaChar {
        assert!(index < WIDTH * HEIGHT);
        VgaChar(unsafe { self.buffer.add(index).read_volatile() })
    }
}
