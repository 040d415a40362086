//! Blocking per-port input queues.
//!
//! Each netplay port gets one FIFO of button states. The reactor thread
//! pushes (local publishes and remote INPUT_DATA both land here); the
//! emulator thread pops. `pop` blocks until an item arrives, which is what
//! paces the frame loop to the slowest peer.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

use padlink_proto::MAX_PLAYERS;

use crate::controller::Buttons;

/// Unbounded blocking FIFO of button states.
///
/// `push` never blocks and never drops. Depth stays bounded in practice by
/// the lag discipline on the push side and the emulator pop on the consume
/// side.
#[derive(Debug, Default)]
pub struct InputQueue {
    items: Mutex<VecDeque<Buttons>>,
    ready: Condvar,
}

impl InputQueue {
    pub fn push(&self, buttons: Buttons) {
        self.items.lock().push_back(buttons);
        self.ready.notify_one();
    }

    /// Blocks until an item is available.
    pub fn pop(&self) -> Buttons {
        let mut items = self.items.lock();
        loop {
            if let Some(buttons) = items.pop_front() {
                return buttons;
            }
            self.ready.wait(&mut items);
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

/// The fixed set of queues, one per netplay port.
#[derive(Debug, Default)]
pub struct InputQueues {
    queues: [InputQueue; MAX_PLAYERS],
}

impl InputQueues {
    pub fn get(&self, port: usize) -> Option<&InputQueue> {
        self.queues.get(port)
    }

    pub fn len(&self, port: usize) -> usize {
        self.queues[port].len()
    }

    pub fn push(&self, port: usize, buttons: Buttons) {
        self.queues[port].push(buttons);
    }

    pub fn pop(&self, port: usize) -> Buttons {
        self.queues[port].pop()
    }

    /// One neutral item per queue so any thread blocked in `pop` returns.
    pub fn push_sentinels(&self) {
        for queue in &self.queues {
            queue.push(Buttons::default());
        }
    }
}
