//! Inbound frame classification.

/// Keepalive probe sent by the server.
pub const PING: &[u8; 4] = b"PING";
/// Keepalive answer sent by the agent.
pub const PONG: &str = "PONG";

/// What the reader does with a received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Keepalive,
    Payload,
}

/// Route a frame: exactly the four bytes `PING` is keepalive, anything else is payload.
pub fn classify_frame(frame: &[u8]) -> FrameKind {
    if frame == PING.as_slice() {
        FrameKind::Keepalive
    } else {
        FrameKind::Payload
    }
}
