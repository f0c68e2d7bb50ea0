//! Wire codec and protocol shapes shared by server and client.

pub mod codec;
pub mod protocol;
