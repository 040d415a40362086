/// Message identifier, the first octet of every non-empty packet.
///
/// Values are locked: they are what travels on the wire.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgId {
    /// Server announces its protocol version right after accept.
    Version = 0,
    /// Server→client: a user entered the room. Client→server: handshake.
    Join = 1,
    Ping = 2,
    Pong = 3,
    /// Variable-count `(user_id, rtt_ms)` table.
    Latency = 4,
    Name = 5,
    Quit = 6,
    /// Chat / status / error text, routed by the sender id.
    Message = 7,
    /// Controller layout; uid -1 carries the authoritative assignment.
    Controllers = 8,
    Start = 9,
    InputData = 10,
    Lag = 11,
    Autolag = 12,
    Frame = 13,
}

impl MsgId {
    pub fn from_repr(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Version,
            1 => Self::Join,
            2 => Self::Ping,
            3 => Self::Pong,
            4 => Self::Latency,
            5 => Self::Name,
            6 => Self::Quit,
            7 => Self::Message,
            8 => Self::Controllers,
            9 => Self::Start,
            10 => Self::InputData,
            11 => Self::Lag,
            12 => Self::Autolag,
            13 => Self::Frame,
            _ => return None,
        })
    }
}
