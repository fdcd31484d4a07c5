//! Filesystem Core
//!
//! The operation contract every layer of the system implements, plus the
//! building blocks it is phrased in.
//!
//! ## Core Concepts
//! - **Contract**: [`contract::FileSystem`] defines upload/append/download,
//!   the bulk and derived operations, listing and liveness. Preconditions and
//!   postconditions hold identically for every implementation.
//! - **Streams**: [`stream`] provides the producer/consumer byte-stream halves
//!   with the end-of-stream acknowledgement the cluster composition relies on.
//! - **Errors**: [`error::FsError`] splits application errors (stable wire
//!   codes) from transport failures (which drive partition liveness).
//! - **Store**: [`memory::MemoryFs`] is the single-node backing store served
//!   by the node binary.

pub mod contract;
pub mod error;
pub mod glob;
pub mod memory;
pub mod metadata;
pub mod stream;
