//! Controller descriptors, button state, and the local↔netplay port map.

use padlink_proto::MAX_PLAYERS;

/// One frame's button state for one controller, as a packed 32-bit value.
///
/// The relay treats the value as opaque except for the Z-trigger bit, which
/// golf mode watches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Buttons(pub u32);

impl Buttons {
    /// Z-trigger bit within the packed value.
    pub const Z_TRIG: u32 = 0x0000_0020;

    pub fn z_trig(self) -> bool {
        self.0 & Self::Z_TRIG != 0
    }
}

/// Descriptor for one controller port as the emulator reports it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Controller {
    pub plugin: u8,
    pub present: bool,
    /// Raw-data pads are not relayed; admission forces this to false.
    pub raw_data: bool,
}

/// Assignment of this peer's physical ports to globally numbered netplay
/// ports. Slot `i` holds the netplay port local port `i` plays on, or -1.
///
/// Non-negative slots are pairwise distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerMap {
    pub local_to_netplay: [i8; MAX_PLAYERS],
}

impl Default for ControllerMap {
    fn default() -> Self {
        Self {
            local_to_netplay: [-1; MAX_PLAYERS],
        }
    }
}

impl ControllerMap {
    pub fn insert(&mut self, local: usize, netplay: usize) {
        self.local_to_netplay[local] = netplay as i8;
    }

    /// The local port assigned to `netplay`, if this peer owns it.
    pub fn to_local(&self, netplay: usize) -> Option<usize> {
        self.local_to_netplay
            .iter()
            .position(|&slot| slot == netplay as i8)
    }
}
