//! Driver for the 8253/8254 programmable interval timer.
//!
//! Channel 0 is wired to IRQ 0 and drives the scheduler quantum.

use crate::io::{outb, PortNumber};

const CHANNEL0_DATA: PortNumber = PortNumber(0x40);
const MODE_COMMAND: PortNumber = PortNumber(0x43);

/// Base frequency of the PIT oscillator in Hz.
pub const BASE_FREQUENCY: u32 = 1_193_182;

/// Channel 0, lobyte/hibyte access, rate generator, binary counting.
const CH0_RATE_GENERATOR: u8 = 0x34;

/// The reload divisor that makes channel 0 fire `hz` times per second.
pub fn divisor_for(hz: u32) -> u16 {
    let d = BASE_FREQUENCY / hz;
    if d > u16::MAX as u32 {
        0 // 0 is interpreted as 65536 by the chip, the slowest rate
    } else {
        d as u16
    }
}

/// Program channel 0 as a rate generator firing `hz` times per second.
pub unsafe fn start_periodic(hz: u32) {
    let divisor = divisor_for(hz);
    outb(MODE_COMMAND, CH0_RATE_GENERATOR);
    outb(CHANNEL0_DATA, (divisor & 0xFF) as u8);
    outb(CHANNEL0_DATA, (divisor >> 8) as u8);
    debug!("[pit] channel 0 at {} Hz (divisor {})", hz, divisor);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn divisor() {
        assert_eq!(divisor_for(100), 11931);
        assert_eq!(divisor_for(BASE_FREQUENCY), 1);
        // slower than the 16-bit reload register can express
        assert_eq!(divisor_for(18), 0);
    }
}
