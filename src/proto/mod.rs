//! The control-channel wire protocol: packet types, the incremental packet
//! streamer and the hello packet sent on fresh data connections.

pub mod data_state;
pub mod packet;
pub mod serialize;
pub mod streamer;
