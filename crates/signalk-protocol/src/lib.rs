//! # signalk-protocol
//!
//! SignalK stream message types and codec.
//!
//! Used by the websocket provider to talk to a remote SignalK server and by
//! the HTTP read-out for discovery.

pub mod codec;
pub mod messages;

pub use codec::{decode_server_message, encode_client_message, CodecError};
pub use messages::*;
