//! State shared between the reactor thread and the emulator thread.
//!
//! The input queues are the only structure both worlds write. The start
//! latch and the present-port mask are reactor-written, emulator-read;
//! everything else the session owns lives on the reactor alone.

use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::queue::InputQueues;

/// One-shot latch for the sticky `started` flag.
///
/// Setting it a second time is a no-op; waiters woken once stay released
/// forever.
#[derive(Debug, Default)]
pub struct StartLatch {
    started: Mutex<bool>,
    cond: Condvar,
}

impl StartLatch {
    /// Returns true if this call performed the transition.
    pub fn set(&self) -> bool {
        let mut started = self.started.lock();
        if *started {
            return false;
        }
        *started = true;
        self.cond.notify_all();
        true
    }

    pub fn is_set(&self) -> bool {
        *self.started.lock()
    }

    pub fn wait(&self) {
        let mut started = self.started.lock();
        while !*started {
            self.cond.wait(&mut started);
        }
    }
}

/// The cross-thread surface of a client.
#[derive(Debug, Default)]
pub struct Shared {
    pub queues: InputQueues,
    pub start: StartLatch,
    /// Bit `p` set when `netplay_controllers[p].present`. Lets `get_input`
    /// answer for absent ports without a trip to the reactor.
    present: AtomicU8,
}

impl Shared {
    pub fn set_present_mask(&self, mask: u8) {
        self.present.store(mask, Ordering::Release);
    }

    pub fn is_present(&self, port: usize) -> bool {
        port < 8 && self.present.load(Ordering::Acquire) & (1 << port) != 0
    }
}
