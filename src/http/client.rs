//! HTTP Client
//!
//! [`HttpFs`] implements the filesystem contract against the REST surface,
//! mirroring what [`RemoteFs`](crate::tcp::client::RemoteFs) does for the
//! framed protocol. Upload bodies are streamed from the contract's byte sink
//! and the commit acknowledgement is resolved from the response status.

use crate::fs::contract::FileSystem;
use crate::fs::error::FsError;
use crate::fs::metadata::FileMetadata;
use crate::fs::stream::{byte_channel, ByteSink, ByteSource};
use crate::http::protocol::{
    ErrorBody, ENDPOINT_APPEND, ENDPOINT_COPY, ENDPOINT_COPY_ALL, ENDPOINT_DELETE,
    ENDPOINT_DELETE_ALL, ENDPOINT_DOWNLOAD, ENDPOINT_INFO, ENDPOINT_INFO_ALL, ENDPOINT_LIST,
    ENDPOINT_MOVE, ENDPOINT_MOVE_ALL, ENDPOINT_PING, ENDPOINT_UPLOAD,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub struct HttpFs {
    base: String,
    client: reqwest::Client,
}

impl HttpFs {
    /// `base` is the server root, e.g. `http://127.0.0.1:8080`.
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    fn url(&self, endpoint: &str, name: Option<&str>) -> String {
        match name {
            Some(name) => format!("{}{}/{}", self.base, endpoint, name),
            None => format!("{}{}", self.base, endpoint),
        }
    }

    async fn to_error(response: reqwest::Response) -> FsError {
        let status = response.status();
        match response.json::<ErrorBody>().await {
            Ok(body) => FsError::from_code(body.error_code),
            Err(_) => FsError::Io(format!("unexpected http status {}", status)),
        }
    }

    async fn expect_ok(response: reqwest::Response) -> Result<reqwest::Response, FsError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(Self::to_error(response).await)
        }
    }

    /// Streams a sink's bytes as a request body; the sink's acknowledgement
    /// resolves once the server's verdict (the response status) is in.
    fn streaming_sink(&self, url: String) -> ByteSink {
        let (sink, source) = byte_channel();
        let (stream, ack) = source.into_stream_deferred();
        let client = self.client.clone();
        let body = reqwest::Body::wrap_stream(stream);
        tokio::spawn(async move {
            match client.post(url).body(body).send().await {
                Ok(response) if response.status().is_success() => ack.complete(Ok(())),
                Ok(response) => ack.complete(Err(Self::to_error(response).await)),
                Err(e) => ack.complete(Err(FsError::io(e))),
            }
        });
        sink
    }
}

#[async_trait]
impl FileSystem for HttpFs {
    async fn upload(&self, name: &str) -> Result<ByteSink, FsError> {
        Ok(self.streaming_sink(self.url(ENDPOINT_UPLOAD, Some(name))))
    }

    async fn upload_sized(&self, name: &str, size: u64) -> Result<ByteSink, FsError> {
        let url = format!("{}?size={}", self.url(ENDPOINT_UPLOAD, Some(name)), size);
        Ok(self.streaming_sink(url))
    }

    async fn append(&self, name: &str, offset: u64) -> Result<ByteSink, FsError> {
        let url = format!("{}?offset={}", self.url(ENDPOINT_APPEND, Some(name)), offset);
        Ok(self.streaming_sink(url))
    }

    async fn download(&self, name: &str, offset: u64, limit: u64) -> Result<ByteSource, FsError> {
        let response = self
            .client
            .get(self.url(ENDPOINT_DOWNLOAD, Some(name)))
            .query(&[
                ("offset", offset.min(i64::MAX as u64).to_string()),
                ("limit", limit.min(i64::MAX as u64).to_string()),
            ])
            .send()
            .await
            .map_err(FsError::io)?;
        let response = Self::expect_ok(response).await?;

        let (mut sink, output) = byte_channel();
        let mut body = response.bytes_stream();
        tokio::spawn(async move {
            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(bytes) => {
                        if sink.send(bytes).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        sink.fail(FsError::io(e)).await;
                        return;
                    }
                }
            }
            let _ = sink.finish().await;
        });
        Ok(output)
    }

    async fn delete(&self, name: &str) -> Result<(), FsError> {
        let response = self
            .client
            .delete(self.url(ENDPOINT_DELETE, Some(name)))
            .send()
            .await
            .map_err(FsError::io)?;
        Self::expect_ok(response).await.map(|_| ())
    }

    async fn delete_all(&self, names: &HashSet<String>) -> Result<(), FsError> {
        let response = self
            .client
            .post(self.url(ENDPOINT_DELETE_ALL, None))
            .json(names)
            .send()
            .await
            .map_err(FsError::io)?;
        Self::expect_ok(response).await.map(|_| ())
    }

    async fn copy(&self, name: &str, target: &str) -> Result<(), FsError> {
        let response = self
            .client
            .post(self.url(ENDPOINT_COPY, None))
            .query(&[("name", name), ("target", target)])
            .send()
            .await
            .map_err(FsError::io)?;
        Self::expect_ok(response).await.map(|_| ())
    }

    async fn copy_all(&self, source_to_target: &HashMap<String, String>) -> Result<(), FsError> {
        let response = self
            .client
            .post(self.url(ENDPOINT_COPY_ALL, None))
            .json(source_to_target)
            .send()
            .await
            .map_err(FsError::io)?;
        Self::expect_ok(response).await.map(|_| ())
    }

    async fn move_file(&self, name: &str, target: &str) -> Result<(), FsError> {
        let response = self
            .client
            .post(self.url(ENDPOINT_MOVE, None))
            .query(&[("name", name), ("target", target)])
            .send()
            .await
            .map_err(FsError::io)?;
        Self::expect_ok(response).await.map(|_| ())
    }

    async fn move_all(&self, source_to_target: &HashMap<String, String>) -> Result<(), FsError> {
        let response = self
            .client
            .post(self.url(ENDPOINT_MOVE_ALL, None))
            .json(source_to_target)
            .send()
            .await
            .map_err(FsError::io)?;
        Self::expect_ok(response).await.map(|_| ())
    }

    async fn list(&self, glob: &str) -> Result<HashMap<String, FileMetadata>, FsError> {
        let response = self
            .client
            .get(self.url(ENDPOINT_LIST, None))
            .query(&[("glob", glob)])
            .send()
            .await
            .map_err(FsError::io)?;
        Self::expect_ok(response)
            .await?
            .json()
            .await
            .map_err(FsError::io)
    }

    async fn info(&self, name: &str) -> Result<Option<FileMetadata>, FsError> {
        let response = self
            .client
            .get(self.url(ENDPOINT_INFO, Some(name)))
            .send()
            .await
            .map_err(FsError::io)?;
        Self::expect_ok(response)
            .await?
            .json()
            .await
            .map_err(FsError::io)
    }

    async fn info_all(
        &self,
        names: &HashSet<String>,
    ) -> Result<HashMap<String, FileMetadata>, FsError> {
        let response = self
            .client
            .post(self.url(ENDPOINT_INFO_ALL, None))
            .json(names)
            .send()
            .await
            .map_err(FsError::io)?;
        Self::expect_ok(response)
            .await?
            .json()
            .await
            .map_err(FsError::io)
    }

    async fn ping(&self) -> Result<(), FsError> {
        let response = self
            .client
            .get(self.url(ENDPOINT_PING, None))
            .send()
            .await
            .map_err(FsError::io)?;
        Self::expect_ok(response).await.map(|_| ())
    }
}

/// Serves the REST surface in a background task, returning the bound address.
pub async fn spawn_http_server(
    fs: Arc<dyn FileSystem>,
    addr: std::net::SocketAddr,
) -> Result<std::net::SocketAddr, FsError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    let app = crate::http::handlers::router(fs);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("http server on {} stopped: {}", local, e);
        }
    });
    tracing::info!("HTTP filesystem server listening on {}", local);
    Ok(local)
}
