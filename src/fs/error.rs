//! Filesystem Error Model
//!
//! All operations in the system fail with [`FsError`]. The variants split into two
//! disjoint families:
//!
//! - **Application errors** (wire codes 1-9): carry domain meaning (file missing,
//!   bad range, ...). They are propagated verbatim and never cause a partition to
//!   be evicted from the cluster.
//! - **Transport/unknown errors** (wire code 0): connection failures, timeouts and
//!   everything else. The partition directory treats these as evidence that a
//!   partition is unreachable.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FsError {
    /// Download or info on a name that does not exist.
    #[error("file not found")]
    FileNotFound,

    /// Upload violated the immutability of an already stored file.
    #[error("file already exists")]
    FileExists,

    /// Given file name points outside of the storage root.
    #[error("bad path")]
    BadPath,

    /// Negative offset or limit was requested.
    #[error("given offset or limit doesn't make sense")]
    BadRange,

    /// Operated file is a directory.
    #[error("operated file is a directory")]
    IsDirectory,

    /// Glob pattern was rejected by the compiler.
    #[error("malformed glob pattern")]
    MalformedGlob,

    /// Append offset exceeds the current file size.
    #[error("offset exceeds file size")]
    IllegalOffset,

    /// A sized upload received more bytes than declared.
    #[error("received more data than expected")]
    UnexpectedData,

    /// A sized upload received fewer bytes than declared.
    #[error("received less data than expected")]
    UnexpectedEndOfStream,

    /// Catch-all for errors that have no dedicated wire code.
    #[error("unknown error: {0}")]
    Unknown(String),

    /// Socket or channel level failure.
    #[error("i/o failure: {0}")]
    Io(String),

    /// A stream was closed before it reached end-of-stream.
    #[error("stream was closed before completion")]
    Cancelled,

    /// A partition failed with a transport-level error. Carries the partition id
    /// so callers can tell which node misbehaved.
    #[error("partition '{id}' failed: {cause}")]
    NodeFailed { id: String, cause: Box<FsError> },

    /// More partitions are dead than the cluster tolerates.
    #[error("{dead} partitions are dead, threshold is {threshold}")]
    ClusterDegraded { dead: usize, threshold: usize },

    /// Upload could not be replicated to the required number of partitions.
    #[error("didn't connect to enough partitions to upload")]
    NotEnoughUploadTargets,

    /// Every alive replica failed the request with a transport error.
    #[error("no replicas available")]
    NoReplicasAvailable,

    /// No replica could continue a download without a gap in the byte sequence.
    #[error("stream was truncated, no replica could continue it")]
    TruncatedStream,
}

impl FsError {
    /// Stable integer code shared by the TCP and HTTP wire formats.
    /// Every transport-family error collapses to 0 (unknown) on the wire.
    pub fn code(&self) -> u32 {
        match self {
            FsError::FileNotFound => 1,
            FsError::FileExists => 2,
            FsError::BadPath => 3,
            FsError::BadRange => 4,
            FsError::IsDirectory => 5,
            FsError::MalformedGlob => 6,
            FsError::IllegalOffset => 7,
            FsError::UnexpectedData => 8,
            FsError::UnexpectedEndOfStream => 9,
            _ => 0,
        }
    }

    /// Reconstructs an error from a wire code received from a remote server.
    pub fn from_code(code: u32) -> FsError {
        match code {
            1 => FsError::FileNotFound,
            2 => FsError::FileExists,
            3 => FsError::BadPath,
            4 => FsError::BadRange,
            5 => FsError::IsDirectory,
            6 => FsError::MalformedGlob,
            7 => FsError::IllegalOffset,
            8 => FsError::UnexpectedData,
            9 => FsError::UnexpectedEndOfStream,
            other => FsError::Unknown(format!("server error code {}", other)),
        }
    }

    /// True for the application family (codes 1-9). Application errors never
    /// mark a partition dead.
    pub fn is_application(&self) -> bool {
        self.code() != 0
    }

    pub fn io(e: impl std::fmt::Display) -> FsError {
        FsError::Io(e.to_string())
    }
}

impl From<std::io::Error> for FsError {
    fn from(e: std::io::Error) -> Self {
        FsError::Io(e.to_string())
    }
}
