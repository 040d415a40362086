//! Events the client surfaces to the chat/status dialog.

/// One roster row: a user as the server reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub id: u32,
    pub name: String,
    /// Round-trip latency to the server, in milliseconds.
    pub latency: u32,
}

/// Feed for the dialog layer. The client never renders anything itself;
/// the embedding UI drains this stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Informational line for the status log.
    Status(String),
    /// User-visible failure. The session may still be alive (command
    /// errors) or already closed (network failures).
    Error(String),
    /// Chat text attributed to a user.
    Chat { name: String, message: String },
    /// Roster view changed; replaces the previous list wholesale.
    Roster(Vec<UserInfo>),
    /// `/host` bound its listener; reports the actual port (useful with
    /// `/host 0`).
    HostStarted { port: u16 },
}
