//! TCP Client
//!
//! [`RemoteFs`] is the client half of the framed protocol: a [`FileSystem`]
//! whose operations run on a remote server. This is the partition handle the
//! cluster composer holds, one per registered partition, so every contract
//! semantic (handshakes, commit acknowledgement, error codes) must survive the
//! wire intact.

use crate::fs::contract::FileSystem;
use crate::fs::error::FsError;
use crate::fs::metadata::FileMetadata;
use crate::fs::stream::{byte_channel, ByteSink, ByteSource};
use crate::tcp::protocol::{
    read_chunk, read_message, write_chunk, write_message, write_stream_end, FsCommand, FsResponse,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RemoteFs {
    addr: SocketAddr,
    connect_timeout: Duration,
}

impl RemoteFs {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn connect(&self) -> Result<TcpStream, FsError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| FsError::Io(format!("connect to {} timed out", self.addr)))??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// One-shot request for the non-streaming commands.
    async fn request(&self, command: FsCommand) -> Result<FsResponse, FsError> {
        let mut stream = self.connect().await?;
        write_message(&mut stream, &command).await?;
        let response: FsResponse = read_message(&mut stream).await?;
        match response {
            FsResponse::ServerError { code } => Err(FsError::from_code(code)),
            other => Ok(other),
        }
    }

    /// Opens an upload-style stream: sends the command, waits for the
    /// handshake ack, then hands back a sink whose data is relayed over the
    /// socket. The sink's final acknowledgement carries the server's verdict.
    async fn open_upload_stream(
        &self,
        command: FsCommand,
        expect_finish: fn(&FsResponse) -> bool,
    ) -> Result<ByteSink, FsError> {
        let mut stream = self.connect().await?;
        write_message(&mut stream, &command).await?;
        match read_message::<_, FsResponse>(&mut stream).await? {
            FsResponse::UploadAck | FsResponse::AppendAck => {}
            FsResponse::ServerError { code } => return Err(FsError::from_code(code)),
            other => {
                return Err(FsError::Io(format!(
                    "unexpected handshake response: {:?}",
                    other
                )))
            }
        }

        let (sink, mut source) = byte_channel();
        tokio::spawn(async move {
            loop {
                match source.next().await {
                    Ok(Some(chunk)) => {
                        if let Err(e) = write_chunk(&mut stream, &chunk).await {
                            source.complete(Err(e));
                            return;
                        }
                    }
                    Ok(None) => {
                        let result = Self::finish_upload(&mut stream, expect_finish).await;
                        source.complete(result);
                        return;
                    }
                    Err(_) => {
                        // Producer failed: drop the socket so the server
                        // commits nothing.
                        return;
                    }
                }
            }
        });
        Ok(sink)
    }

    async fn finish_upload(
        stream: &mut TcpStream,
        expect_finish: fn(&FsResponse) -> bool,
    ) -> Result<(), FsError> {
        write_stream_end(stream).await?;
        let response: FsResponse = read_message(stream).await?;
        if expect_finish(&response) {
            return Ok(());
        }
        match response {
            FsResponse::ServerError { code } => Err(FsError::from_code(code)),
            other => Err(FsError::Io(format!(
                "unexpected upload completion: {:?}",
                other
            ))),
        }
    }
}

#[async_trait]
impl FileSystem for RemoteFs {
    async fn upload(&self, name: &str) -> Result<ByteSink, FsError> {
        self.open_upload_stream(
            FsCommand::Upload {
                name: name.to_string(),
                size: None,
            },
            |r| matches!(r, FsResponse::UploadFinished),
        )
        .await
    }

    async fn upload_sized(&self, name: &str, size: u64) -> Result<ByteSink, FsError> {
        self.open_upload_stream(
            FsCommand::Upload {
                name: name.to_string(),
                size: Some(size),
            },
            |r| matches!(r, FsResponse::UploadFinished),
        )
        .await
    }

    async fn append(&self, name: &str, offset: u64) -> Result<ByteSink, FsError> {
        self.open_upload_stream(
            FsCommand::Append {
                name: name.to_string(),
                offset,
            },
            |r| matches!(r, FsResponse::AppendFinished),
        )
        .await
    }

    async fn download(&self, name: &str, offset: u64, limit: u64) -> Result<ByteSource, FsError> {
        let mut stream = self.connect().await?;
        write_message(
            &mut stream,
            &FsCommand::Download {
                name: name.to_string(),
                offset: offset.min(i64::MAX as u64) as i64,
                limit: limit.min(i64::MAX as u64) as i64,
            },
        )
        .await?;

        let size = match read_message::<_, FsResponse>(&mut stream).await? {
            FsResponse::DownloadSize { size } => size,
            FsResponse::ServerError { code } => return Err(FsError::from_code(code)),
            other => {
                return Err(FsError::Io(format!(
                    "unexpected download handshake: {:?}",
                    other
                )))
            }
        };
        tracing::trace!("downloading {} bytes of '{}' from {}", size, name, self.addr);

        let (mut sink, output) = byte_channel();
        tokio::spawn(async move {
            loop {
                match read_chunk(&mut stream).await {
                    Ok(Some(chunk)) => {
                        if sink.send(chunk).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {
                        let _ = sink.finish().await;
                        return;
                    }
                    Err(e) => {
                        sink.fail(e).await;
                        return;
                    }
                }
            }
        });
        Ok(output)
    }

    async fn delete(&self, name: &str) -> Result<(), FsError> {
        self.request(FsCommand::Delete {
            name: name.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn delete_all(&self, names: &HashSet<String>) -> Result<(), FsError> {
        self.request(FsCommand::DeleteAll {
            names: names.clone(),
        })
        .await
        .map(|_| ())
    }

    async fn copy(&self, name: &str, target: &str) -> Result<(), FsError> {
        self.request(FsCommand::Copy {
            name: name.to_string(),
            target: target.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn copy_all(&self, source_to_target: &HashMap<String, String>) -> Result<(), FsError> {
        self.request(FsCommand::CopyAll {
            source_to_target: source_to_target.clone(),
        })
        .await
        .map(|_| ())
    }

    async fn move_file(&self, name: &str, target: &str) -> Result<(), FsError> {
        self.request(FsCommand::Move {
            name: name.to_string(),
            target: target.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn move_all(&self, source_to_target: &HashMap<String, String>) -> Result<(), FsError> {
        self.request(FsCommand::MoveAll {
            source_to_target: source_to_target.clone(),
        })
        .await
        .map(|_| ())
    }

    async fn list(&self, glob: &str) -> Result<HashMap<String, FileMetadata>, FsError> {
        match self
            .request(FsCommand::List {
                glob: glob.to_string(),
            })
            .await?
        {
            FsResponse::ListFinished { files } => Ok(files),
            other => Err(FsError::Io(format!("unexpected list response: {:?}", other))),
        }
    }

    async fn info(&self, name: &str) -> Result<Option<FileMetadata>, FsError> {
        match self
            .request(FsCommand::Info {
                name: name.to_string(),
            })
            .await?
        {
            FsResponse::InfoFinished { metadata } => Ok(metadata),
            other => Err(FsError::Io(format!("unexpected info response: {:?}", other))),
        }
    }

    async fn info_all(
        &self,
        names: &HashSet<String>,
    ) -> Result<HashMap<String, FileMetadata>, FsError> {
        match self
            .request(FsCommand::InfoAll {
                names: names.clone(),
            })
            .await?
        {
            FsResponse::InfoAllFinished { files } => Ok(files),
            other => Err(FsError::Io(format!(
                "unexpected infoAll response: {:?}",
                other
            ))),
        }
    }

    async fn ping(&self) -> Result<(), FsError> {
        self.request(FsCommand::Ping).await.map(|_| ())
    }
}
