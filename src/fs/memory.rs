//! In-Memory Store
//!
//! A single-node [`FileSystem`] keeping whole files in memory. It is the
//! backing partition the node binary serves over the wire and the workhorse of
//! the test suite. Commit semantics follow the contract strictly: a file only
//! becomes visible once its upload stream acknowledged end-of-stream.

use crate::fs::contract::FileSystem;
use crate::fs::error::FsError;
use crate::fs::glob;
use crate::fs::metadata::{self, FileMetadata};
use crate::fs::stream::{self, byte_channel, ByteSink, ByteSource};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

/// Downloads are re-chunked so consumers exercise real streaming.
const DOWNLOAD_CHUNK: usize = 64 * 1024;

#[derive(Clone)]
struct StoredFile {
    data: Bytes,
    timestamp: i64,
}

#[derive(Default)]
pub struct MemoryFs {
    files: Arc<DashMap<String, StoredFile>>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct view of the stored bytes, for assertions in tests and for the
    /// node binary's startup report.
    pub fn raw(&self, name: &str) -> Option<Bytes> {
        self.files.get(name).map(|file| file.data.clone())
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    fn check_name(name: &str) -> Result<(), FsError> {
        if name.is_empty() || name.starts_with('/') {
            return Err(FsError::BadPath);
        }
        if name.split('/').any(|segment| segment == "." || segment == "..") {
            return Err(FsError::BadPath);
        }
        Ok(())
    }

    fn commit_upload(
        files: &DashMap<String, StoredFile>,
        name: &str,
        data: Vec<u8>,
    ) -> Result<(), FsError> {
        if let Some(existing) = files.get(name) {
            // Re-uploading identical bytes is idempotent; anything else
            // violates immutability.
            if existing.data.as_ref() == data.as_slice() {
                return Ok(());
            }
            return Err(FsError::FileExists);
        }
        files.insert(
            name.to_string(),
            StoredFile {
                data: Bytes::from(data),
                timestamp: metadata::now_ms(),
            },
        );
        Ok(())
    }

    fn commit_append(
        files: &DashMap<String, StoredFile>,
        name: &str,
        offset: u64,
        incoming: Vec<u8>,
    ) -> Result<(), FsError> {
        let existing = files
            .get(name)
            .map(|file| file.data.clone())
            .unwrap_or_else(Bytes::new);
        if offset > existing.len() as u64 {
            return Err(FsError::IllegalOffset);
        }
        let offset = offset as usize;

        // Bytes already present must match the incoming overlap.
        let overlap = existing.len() - offset;
        let checked = overlap.min(incoming.len());
        if existing[offset..offset + checked] != incoming[..checked] {
            return Err(FsError::UnexpectedData);
        }
        if incoming.len() <= overlap {
            // Fully idempotent replay, nothing new to store.
            return Ok(());
        }

        let mut merged = Vec::with_capacity(offset + incoming.len());
        merged.extend_from_slice(&existing[..offset]);
        merged.extend_from_slice(&incoming);
        files.insert(
            name.to_string(),
            StoredFile {
                data: Bytes::from(merged),
                timestamp: metadata::now_ms(),
            },
        );
        Ok(())
    }
}

#[async_trait]
impl FileSystem for MemoryFs {
    async fn upload(&self, name: &str) -> Result<ByteSink, FsError> {
        Self::check_name(name)?;
        let (sink, mut source) = byte_channel();
        let files = Arc::clone(&self.files);
        let name = name.to_string();
        tokio::spawn(async move {
            match source.read_to_end().await {
                Ok(data) => source.complete(Self::commit_upload(&files, &name, data)),
                Err(_) => {
                    // Producer failed or cancelled, nothing is committed.
                }
            }
        });
        Ok(sink)
    }

    async fn upload_sized(&self, name: &str, size: u64) -> Result<ByteSink, FsError> {
        let inner = self.upload(name).await?;
        Ok(stream::fixed_size(inner, size))
    }

    async fn append(&self, name: &str, offset: u64) -> Result<ByteSink, FsError> {
        Self::check_name(name)?;
        let current = self
            .files
            .get(name)
            .map(|file| file.data.len() as u64)
            .unwrap_or(0);
        if offset > current {
            return Err(FsError::IllegalOffset);
        }

        let (sink, mut source) = byte_channel();
        let files = Arc::clone(&self.files);
        let name = name.to_string();
        tokio::spawn(async move {
            match source.read_to_end().await {
                Ok(incoming) => {
                    source.complete(Self::commit_append(&files, &name, offset, incoming))
                }
                Err(_) => {}
            }
        });
        Ok(sink)
    }

    async fn download(&self, name: &str, offset: u64, limit: u64) -> Result<ByteSource, FsError> {
        let data = self
            .files
            .get(name)
            .map(|file| file.data.clone())
            .ok_or(FsError::FileNotFound)?;

        let available = (data.len() as u64).saturating_sub(offset);
        let length = available.min(limit) as usize;
        let offset = offset.min(data.len() as u64) as usize;
        let slice = data.slice(offset..offset + length);

        let (mut sink, source) = byte_channel();
        tokio::spawn(async move {
            let mut sent = 0;
            while sent < slice.len() {
                let end = (sent + DOWNLOAD_CHUNK).min(slice.len());
                if sink.send(slice.slice(sent..end)).await.is_err() {
                    return;
                }
                sent = end;
            }
            let _ = sink.finish().await;
        });
        Ok(source)
    }

    async fn delete(&self, name: &str) -> Result<(), FsError> {
        self.files.remove(name);
        Ok(())
    }

    async fn list(&self, pattern: &str) -> Result<HashMap<String, FileMetadata>, FsError> {
        let matcher = glob::compile(pattern)?;
        Ok(self
            .files
            .iter()
            .filter(|entry| matcher.is_match(entry.key()))
            .map(|entry| {
                (
                    entry.key().clone(),
                    FileMetadata::new(entry.value().data.len() as u64, entry.value().timestamp),
                )
            })
            .collect())
    }
}
