//! Framed TCP Adapter
//!
//! Adapts the filesystem contract to a framed command/response protocol over
//! TCP: `protocol` defines the message enums and framing, `server` exposes a
//! local [`FileSystem`](crate::fs::contract::FileSystem) to the network and
//! `client` consumes a remote one. A cluster node holds one
//! [`client::RemoteFs`] per partition.

pub mod client;
pub mod protocol;
pub mod server;

#[cfg(test)]
mod tests;
