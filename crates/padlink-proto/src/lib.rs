//! Wire protocol for the padlink netplay input relay.
//!
//! Every packet is a self-describing octet buffer: a leading message-id
//! octet followed by big-endian typed fields. On a TCP stream each packet
//! is framed by a `u32` big-endian length prefix counting payload octets.

pub mod constants;
pub mod error;
pub mod framing;
pub mod msg_id;
pub mod packet;

pub use constants::{DEFAULT_LAG, DEFAULT_PORT, MAX_FRAME_LEN, MAX_PLAYERS, PROTOCOL_VERSION};
pub use error::ProtoError;
pub use framing::encode_frame;
pub use msg_id::MsgId;
pub use packet::Packet;
