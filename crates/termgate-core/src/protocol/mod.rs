//! Protocol module containing the browser-facing JSON message types.

pub mod messages;

pub use messages::{
    decode_client_frame, encode_server_message, ClientMessage, FrameError, ServerMessage,
};
