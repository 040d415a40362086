use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("packet underflow: needed {needed} more bytes, {remaining} remaining")]
    Underflow { needed: usize, remaining: usize },

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("unknown msg id: {0}")]
    UnknownMsgId(u8),
}
