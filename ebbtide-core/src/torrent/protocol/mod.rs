//! BitTorrent wire protocol: handshake codec and message framing rules

pub mod handshake;
pub mod messages;

pub use handshake::{HANDSHAKE_LENGTH, Handshake, PROTOCOL_NAME, PeerId};
pub use messages::{Frame, MAX_FRAME_LENGTH, MessageId, validate_frame_length};
