use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    constants::{LEN_PREFIX, MAX_FRAME_LEN},
    error::ProtoError,
    packet::Packet,
};

/// Frame a packet for the TCP stream: `u32` big-endian payload length
/// followed by the payload octets. A zero-length payload is legal and acts
/// as a keep-alive.
pub fn encode_frame(packet: &Packet) -> Result<Bytes, ProtoError> {
    encode_frame_bytes(packet.as_slice())
}

/// Frame an already-encoded payload. Used when relaying a packet verbatim.
pub fn encode_frame_bytes(payload: &[u8]) -> Result<Bytes, ProtoError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtoError::FrameTooLarge(payload.len()));
    }
    let mut out = BytesMut::with_capacity(LEN_PREFIX + payload.len());
    out.put_u32(payload.len() as u32);
    out.put_slice(payload);
    Ok(out.freeze())
}
