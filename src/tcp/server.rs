//! TCP Server
//!
//! Exposes any [`FileSystem`] over the framed command/response protocol. Each
//! accepted connection carries exactly one command and is handled on its own
//! task; streaming commands keep the connection for the byte transfer phase.

use crate::fs::contract::FileSystem;
use crate::fs::error::FsError;
use crate::tcp::protocol::{
    read_chunk, read_message, write_chunk, write_message, write_stream_end, FsCommand, FsResponse,
};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

pub struct FsServer {
    fs: Arc<dyn FileSystem>,
}

impl FsServer {
    pub fn new(fs: Arc<dyn FileSystem>) -> Arc<Self> {
        Arc::new(Self { fs })
    }

    /// Accept loop. Runs until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), FsError> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream).await {
                    tracing::debug!("connection from {} ended with: {}", peer, e);
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<(), FsError> {
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();
        let command: FsCommand = read_message(&mut reader).await?;

        let result = self.dispatch(command, &mut reader, &mut writer).await;
        if let Err(e) = result {
            // Best effort: the client may already be gone.
            let _ = write_message(&mut writer, &FsResponse::ServerError { code: e.code() }).await;
            return Err(e);
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        command: FsCommand,
        reader: &mut OwnedReadHalf,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(), FsError> {
        match command {
            FsCommand::Upload { name, size } => {
                let sink = match size {
                    Some(size) => self.fs.upload_sized(&name, size).await?,
                    None => self.fs.upload(&name).await?,
                };
                write_message(writer, &FsResponse::UploadAck).await?;
                Self::receive_stream(reader, sink).await?;
                write_message(writer, &FsResponse::UploadFinished).await
            }
            FsCommand::Append { name, offset } => {
                let sink = self.fs.append(&name, offset).await?;
                write_message(writer, &FsResponse::AppendAck).await?;
                Self::receive_stream(reader, sink).await?;
                write_message(writer, &FsResponse::AppendFinished).await
            }
            FsCommand::Download {
                name,
                offset,
                limit,
            } => {
                if offset < 0 || limit < 0 {
                    return Err(FsError::BadRange);
                }
                let metadata = self
                    .fs
                    .info(&name)
                    .await?
                    .ok_or(FsError::FileNotFound)?;
                let offset = offset as u64;
                let clamped = metadata.size.saturating_sub(offset).min(limit as u64);

                let mut source = self.fs.download(&name, offset, clamped).await?;
                write_message(writer, &FsResponse::DownloadSize { size: clamped }).await?;
                loop {
                    match source.next().await {
                        Ok(Some(chunk)) => write_chunk(writer, &chunk).await?,
                        Ok(None) => break,
                        Err(e) => {
                            // Raw frames already started, a message frame
                            // would corrupt the stream. Cut the connection so
                            // the client sees the truncation.
                            tracing::warn!("download of '{}' broke mid-stream: {}", name, e);
                            let _ = writer.shutdown().await;
                            return Ok(());
                        }
                    }
                }
                write_stream_end(writer).await
            }
            FsCommand::Copy { name, target } => {
                self.fs.copy(&name, &target).await?;
                write_message(writer, &FsResponse::CopyFinished).await
            }
            FsCommand::CopyAll { source_to_target } => {
                self.fs.copy_all(&source_to_target).await?;
                write_message(writer, &FsResponse::CopyAllFinished).await
            }
            FsCommand::Move { name, target } => {
                self.fs.move_file(&name, &target).await?;
                write_message(writer, &FsResponse::MoveFinished).await
            }
            FsCommand::MoveAll { source_to_target } => {
                self.fs.move_all(&source_to_target).await?;
                write_message(writer, &FsResponse::MoveAllFinished).await
            }
            FsCommand::Delete { name } => {
                self.fs.delete(&name).await?;
                write_message(writer, &FsResponse::DeleteFinished).await
            }
            FsCommand::DeleteAll { names } => {
                self.fs.delete_all(&names).await?;
                write_message(writer, &FsResponse::DeleteAllFinished).await
            }
            FsCommand::List { glob } => {
                let files = self.fs.list(&glob).await?;
                write_message(writer, &FsResponse::ListFinished { files }).await
            }
            FsCommand::Info { name } => {
                let metadata = self.fs.info(&name).await?;
                write_message(writer, &FsResponse::InfoFinished { metadata }).await
            }
            FsCommand::InfoAll { names } => {
                let files = self.fs.info_all(&names).await?;
                write_message(writer, &FsResponse::InfoAllFinished { files }).await
            }
            FsCommand::Ping => {
                self.fs.ping().await?;
                write_message(writer, &FsResponse::PingFinished).await
            }
        }
    }

    /// Pulls raw data frames into the sink until the terminator, then waits
    /// for the commit acknowledgement.
    async fn receive_stream(
        reader: &mut OwnedReadHalf,
        mut sink: crate::fs::stream::ByteSink,
    ) -> Result<(), FsError> {
        loop {
            match read_chunk(reader).await {
                Ok(Some(chunk)) => sink.send(chunk).await?,
                Ok(None) => return sink.finish().await,
                Err(e) => {
                    // Connection broke mid-upload: nothing must be committed.
                    drop(sink);
                    return Err(e);
                }
            }
        }
    }
}

/// Binds a listener and serves in a background task. Returns the bound
/// address, letting callers bind port zero.
pub async fn spawn_server(
    fs: Arc<dyn FileSystem>,
    addr: std::net::SocketAddr,
) -> Result<std::net::SocketAddr, FsError> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    let server = FsServer::new(fs);
    tokio::spawn(async move {
        if let Err(e) = server.serve(listener).await {
            tracing::error!("tcp server on {} stopped: {}", local, e);
        }
    });
    tracing::info!("TCP filesystem server listening on {}", local);
    Ok(local)
}
