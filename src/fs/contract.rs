//! Filesystem Contract
//!
//! The one operation surface every layer of the system implements: the local
//! in-memory store, the TCP and HTTP client stubs, and the cluster composer.
//! Composition layers stay interchangeable because they all honor the same
//! preconditions and postconditions.
//!
//! Several operations have default derivations so implementations only need
//! the primitive set: `copy` streams a download into an upload, `move_file` is
//! copy-then-delete-source, `info` narrows a `list`, and `ping` is the
//! cheapest possible listing.

use crate::fs::error::FsError;
use crate::fs::glob;
use crate::fs::metadata::FileMetadata;
use crate::fs::stream::{self, ByteSink, ByteSource};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};

#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Accepts an immutable file of unknown size. The returned sink may refuse
    /// chunks mid-stream, and its final acknowledgement may still fail if the
    /// commit does.
    async fn upload(&self, name: &str) -> Result<ByteSink, FsError>;

    /// As [`upload`](Self::upload), but the stream must deliver exactly `size`
    /// bytes: more fail with [`FsError::UnexpectedData`], fewer with
    /// [`FsError::UnexpectedEndOfStream`].
    async fn upload_sized(&self, name: &str, size: u64) -> Result<ByteSink, FsError>;

    /// Extends an existing file starting at `offset`. An offset beyond the
    /// current size fails with [`FsError::IllegalOffset`]; an offset before it
    /// is allowed as long as the overlapping bytes match what is stored.
    async fn append(&self, name: &str, offset: u64) -> Result<ByteSink, FsError>;

    /// Reads up to `limit` bytes starting at `offset`. A limit exceeding the
    /// file contents is silently clamped.
    async fn download(&self, name: &str, offset: u64, limit: u64) -> Result<ByteSource, FsError>;

    /// Tries to delete the file. Idempotent: deleting an absent name succeeds.
    async fn delete(&self, name: &str) -> Result<(), FsError>;

    /// Deletes a set of files. Not atomic: an error fails the whole batch but
    /// earlier deletions may persist.
    async fn delete_all(&self, names: &HashSet<String>) -> Result<(), FsError> {
        let results = join_all(names.iter().map(|name| self.delete(name))).await;
        results.into_iter().collect()
    }

    /// Duplicates a file by streaming a full download into an upload.
    async fn copy(&self, name: &str, target: &str) -> Result<(), FsError> {
        let source = self.download(name, 0, u64::MAX).await?;
        let sink = self.upload(target).await?;
        stream::pump(source, sink).await
    }

    /// Copies every source to its target. Not atomic.
    async fn copy_all(&self, source_to_target: &HashMap<String, String>) -> Result<(), FsError> {
        let results = join_all(
            source_to_target
                .iter()
                .map(|(name, target)| self.copy(name, target)),
        )
        .await;
        results.into_iter().collect()
    }

    /// Moves a file: copy, then delete the source, unless source and target
    /// are the same name.
    async fn move_file(&self, name: &str, target: &str) -> Result<(), FsError> {
        self.copy(name, target).await?;
        if name == target {
            return Ok(());
        }
        self.delete(name).await
    }

    /// Moves every source to its target: a bulk copy followed by deleting the
    /// source names. Not atomic.
    async fn move_all(&self, source_to_target: &HashMap<String, String>) -> Result<(), FsError> {
        if source_to_target.is_empty() {
            return Ok(());
        }
        self.copy_all(source_to_target).await?;
        let sources: HashSet<String> = source_to_target
            .iter()
            .filter(|(name, target)| name != target)
            .map(|(name, _)| name.clone())
            .collect();
        self.delete_all(&sources).await
    }

    /// Lists files matching a shell-style glob, see [`crate::fs::glob`].
    async fn list(&self, glob: &str) -> Result<HashMap<String, FileMetadata>, FsError>;

    /// Metadata of a single file, `None` if it does not exist.
    async fn info(&self, name: &str) -> Result<Option<FileMetadata>, FsError> {
        let mut listing = self.list(&glob::escape(name)).await?;
        Ok(listing.remove(name))
    }

    /// Metadata for several files; absent names are simply missing from the
    /// result.
    async fn info_all(
        &self,
        names: &HashSet<String>,
    ) -> Result<HashMap<String, FileMetadata>, FsError> {
        if names.is_empty() {
            return Ok(HashMap::new());
        }
        let results = join_all(names.iter().map(|name| async move {
            self.info(name).await.map(|meta| (name.clone(), meta))
        }))
        .await;

        let mut found = HashMap::new();
        for result in results {
            let (name, meta) = result?;
            if let Some(meta) = meta {
                found.insert(name, meta);
            }
        }
        Ok(found)
    }

    /// Cheap liveness check.
    async fn ping(&self) -> Result<(), FsError> {
        self.list("").await.map(|_| ())
    }
}
