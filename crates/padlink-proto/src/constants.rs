/// Wire protocol version. Peers with differing versions refuse to talk.
pub const PROTOCOL_VERSION: u32 = 1;

/// Number of controller ports on the console.
pub const MAX_PLAYERS: usize = 4;

/// Input lag (in frames) a fresh session starts with.
pub const DEFAULT_LAG: u8 = 5;

/// Server port used when `/host` or `/join` omit one.
pub const DEFAULT_PORT: u16 = 6400;

/// Length of the frame prefix on the TCP stream, in octets.
///
/// TCP is a byte stream, so each packet travels as
/// `[u32 payload_len big-endian][payload]`.
pub const LEN_PREFIX: usize = 4;

/// Upper bound on a single framed payload, in octets.
///
/// The largest legitimate packet is a chat MESSAGE (`u16` length), so this
/// bound is generous; anything beyond it is a protocol error.
pub const MAX_FRAME_LEN: usize = 128 * 1024;
