//! HTTP/REST Adapter
//!
//! The second wire format: the same filesystem contract as the framed TCP
//! protocol, shaped as REST routes with streaming bodies. `handlers` builds
//! the axum router for the server side, `client` is the reqwest-backed
//! [`FileSystem`](crate::fs::contract::FileSystem) for the consumer side.

pub mod client;
pub mod handlers;
pub mod protocol;

#[cfg(test)]
mod tests;
