//! TCP Wire Protocol
//!
//! One request per connection: the client sends a single [`FsCommand`] frame
//! and the server answers with one or more [`FsResponse`] frames. Streaming
//! operations interleave a handshake ack (`UploadAck` / `AppendAck` /
//! `DownloadSize`), then raw byte frames terminated by a zero-length frame,
//! then a `*Finished` response. Any failure is reported as
//! [`FsResponse::ServerError`] carrying the stable error code table.
//!
//! Framing is uniform: a big-endian `u32` length prefix followed by the
//! payload. Message frames carry a bincode-encoded enum, data frames carry
//! raw file bytes.

use crate::fs::error::FsError;
use crate::fs::metadata::FileMetadata;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for a single frame, protects against corrupt length prefixes.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Preferred chunk size for raw data frames.
pub const DATA_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FsCommand {
    Upload {
        name: String,
        size: Option<u64>,
    },
    Append {
        name: String,
        offset: u64,
    },
    /// Offsets are signed on the wire so that a misbehaving client can be
    /// answered with `BAD_RANGE` instead of silently wrapping.
    Download {
        name: String,
        offset: i64,
        limit: i64,
    },
    Copy {
        name: String,
        target: String,
    },
    CopyAll {
        source_to_target: HashMap<String, String>,
    },
    Move {
        name: String,
        target: String,
    },
    MoveAll {
        source_to_target: HashMap<String, String>,
    },
    Delete {
        name: String,
    },
    DeleteAll {
        names: HashSet<String>,
    },
    List {
        glob: String,
    },
    Info {
        name: String,
    },
    InfoAll {
        names: HashSet<String>,
    },
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FsResponse {
    UploadAck,
    UploadFinished,
    AppendAck,
    AppendFinished,
    /// Pre-stream handshake for a download, reports the clamped byte count.
    DownloadSize {
        size: u64,
    },
    CopyFinished,
    CopyAllFinished,
    MoveFinished,
    MoveAllFinished,
    DeleteFinished,
    DeleteAllFinished,
    ListFinished {
        files: HashMap<String, FileMetadata>,
    },
    InfoFinished {
        metadata: Option<FileMetadata>,
    },
    InfoAllFinished {
        files: HashMap<String, FileMetadata>,
    },
    PingFinished,
    ServerError {
        code: u32,
    },
}

/// Writes one length-prefixed bincode message frame.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), FsError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = bincode::serialize(message).map_err(|e| FsError::Unknown(e.to_string()))?;
    if payload.len() as u64 > MAX_FRAME_SIZE as u64 {
        return Err(FsError::Unknown("message frame too large".into()));
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed bincode message frame.
pub async fn read_message<R, T>(reader: &mut R) -> Result<T, FsError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_SIZE {
        return Err(FsError::Io(format!("frame of {} bytes refused", len)));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    bincode::deserialize(&payload).map_err(|e| FsError::Io(e.to_string()))
}

/// Writes one raw data frame. Empty chunks are skipped, the zero length is
/// reserved for the stream terminator.
pub async fn write_chunk<W>(writer: &mut W, chunk: &[u8]) -> Result<(), FsError>
where
    W: AsyncWrite + Unpin,
{
    for part in chunk.chunks(DATA_CHUNK_SIZE) {
        writer.write_u32(part.len() as u32).await?;
        writer.write_all(part).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Terminates a raw byte stream.
pub async fn write_stream_end<W>(writer: &mut W) -> Result<(), FsError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u32(0).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one raw data frame, `None` on the stream terminator.
pub async fn read_chunk<R>(reader: &mut R) -> Result<Option<Bytes>, FsError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await?;
    if len == 0 {
        return Ok(None);
    }
    if len > MAX_FRAME_SIZE {
        return Err(FsError::Io(format!("data frame of {} bytes refused", len)));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Bytes::from(payload)))
}
