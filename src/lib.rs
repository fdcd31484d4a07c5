//! Distributed Remote-Filesystem Cluster Library
//!
//! This library crate defines the core modules that make up the distributed
//! filesystem. It serves as the foundation for the binary executable
//! (`main.rs`).
//!
//! ## Architecture Modules
//! The system is composed of three loosely coupled subsystems:
//!
//! - **`fs`**: The filesystem core. Defines the operation contract every layer
//!   implements, the byte-stream primitives with end-of-stream
//!   acknowledgement, the error code table, glob matching, file metadata and
//!   the in-memory single-node store.
//! - **`cluster`**: The composition layer. Tracks partition liveness, selects
//!   partitions per file name via rendezvous hashing, replicates uploads
//!   through a fan-out splitter and merges downloads through a fan-in combiner
//!   with byte-exact failover.
//! - **`tcp` / `http`**: The wire adapters. Expose any filesystem over a
//!   framed TCP command protocol and a REST surface, and provide the matching
//!   client stubs that a cluster node holds as partition handles.

pub mod cluster;
pub mod fs;
pub mod http;
pub mod tcp;
