//! End-of-quantum accounting for the round-robin scheduler.

use core::cell::Cell;

use crate::globals;
use crate::interrupts::Regs;
use crate::thread::Thread;

/// Counts timer ticks towards the end of the running thread's quantum.
pub struct QuantumTimer {
    quantum: u32,
    ticks: Cell<u32>,
}

impl QuantumTimer {
    pub fn new(quantum: u32) -> QuantumTimer {
        QuantumTimer {
            quantum,
            ticks: Cell::new(0),
        }
    }

    /// Account one timer tick. Returns true when the quantum just expired;
    /// the counter restarts in that case.
    ///
    /// Ticks are only counted while `running`: before the first dispatch
    /// there is no thread whose quantum could expire.
    pub fn tick(&self, running: bool) -> bool {
        if !running {
            return false;
        }
        let ticks = self.ticks.get() + 1;
        if ticks >= self.quantum {
            self.ticks.set(0);
            true
        } else {
            self.ticks.set(ticks);
            false
        }
    }

    /// Restart the quantum, e.g. because the thread yielded on its own.
    pub fn reset(&self) {
        self.ticks.set(0);
    }
}

/// Timer interrupt handler: when the running thread's quantum expires, send
/// it to the back of the ready queue and run the next one.
///
/// The dispatcher has already acknowledged the interrupt, so switching away
/// here is fine; the preempted thread finishes this handler whenever it is
/// scheduled again.
pub(crate) fn quantum_tick(_regs: &mut Regs) {
    let scheduler = match globals::scheduler() {
        Some(scheduler) => scheduler,
        None => return,
    };
    let timer = match scheduler.quantum_timer() {
        Some(timer) => timer,
        None => return,
    };

    if timer.tick(super::started()) {
        if let Some(current) = Thread::current() {
            scheduler.resume(current);
        }
        scheduler.yield_now();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn expires_every_quantum() {
        let timer = QuantumTimer::new(10);
        let mut expiries = 0;
        for _ in 0..30 {
            if timer.tick(true) {
                expiries += 1;
            }
        }
        assert_eq!(expiries, 3);
    }

    #[test]
    fn exact_expiry_position() {
        let timer = QuantumTimer::new(10);
        for _ in 0..9 {
            assert!(!timer.tick(true));
        }
        assert!(timer.tick(true), "tenth tick ends the quantum");
        assert!(!timer.tick(true), "counter restarted");
    }

    #[test]
    fn idle_until_first_dispatch() {
        let timer = QuantumTimer::new(1);
        assert!(!timer.tick(false));
        assert!(!timer.tick(false));
        assert!(timer.tick(true));
    }

    #[test]
    fn voluntary_yield_restarts_quantum() {
        let timer = QuantumTimer::new(3);
        assert!(!timer.tick(true));
        assert!(!timer.tick(true));
        timer.reset();
        // the thread yielded; it gets a whole fresh quantum
        assert!(!timer.tick(true));
        assert!(!timer.tick(true));
        assert!(timer.tick(true));
    }
}
