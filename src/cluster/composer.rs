//! Cluster Composer
//!
//! A [`FileSystem`] implementation spread over the partitions of a
//! [`PartitionDirectory`]. Writes are replicated: an upload opens consumers on
//! up to `upload_max` partitions chosen by the server selector and streams
//! through the fan-out splitter, succeeding once `upload_min` replicas commit.
//! Reads fan in: a download is broadcast to every alive partition and the
//! successful replies feed the byte combiner, which fails over between
//! replicas without duplicating or losing bytes. Metadata operations are
//! broadcast and merged.
//!
//! The cluster refuses service outright while more than `dead_threshold`
//! partitions are dead; a ping (or the periodic dead-partition check) can
//! rehabilitate them.

use crate::cluster::combiner::{self, DownloadInput};
use crate::cluster::partitions::{PartitionDirectory, PartitionId};
use crate::cluster::splitter::{self, UploadTarget};
use crate::fs::contract::FileSystem;
use crate::fs::error::FsError;
use crate::fs::metadata::{self, FileMetadata};
use crate::fs::stream::{self, ByteSink, ByteSource};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub struct ClusterFs {
    partitions: Arc<PartitionDirectory>,
    dead_threshold: usize,
    upload_min: usize,
    upload_max: usize,
}

enum UploadKind {
    Plain,
    Sized(u64),
    Append(u64),
}

impl ClusterFs {
    /// Single-replica cluster over the given directory. Tune with
    /// [`with_replication_count`](Self::with_replication_count) or
    /// [`with_persistence_options`](Self::with_persistence_options).
    pub fn new(partitions: Arc<PartitionDirectory>) -> Self {
        Self {
            partitions,
            dead_threshold: 0,
            upload_min: 1,
            upload_max: 1,
        }
    }

    /// Keeps `replication_count` copies of every file: uploads go to exactly
    /// that many partitions and up to `replication_count - 1` dead partitions
    /// are tolerated.
    pub fn with_replication_count(self, replication_count: usize) -> Result<Self, FsError> {
        if replication_count < 1 || replication_count > self.partitions.partition_count() {
            return Err(FsError::Unknown(format!(
                "replication count {} is out of range for {} partitions",
                replication_count,
                self.partitions.partition_count()
            )));
        }
        self.with_persistence_options(replication_count - 1, replication_count, replication_count)
    }

    pub fn with_persistence_options(
        mut self,
        dead_threshold: usize,
        upload_min: usize,
        upload_max: usize,
    ) -> Result<Self, FsError> {
        let total = self.partitions.partition_count();
        if dead_threshold >= total {
            return Err(FsError::Unknown(format!(
                "dead partitions threshold {} must be below the partition count {}",
                dead_threshold, total
            )));
        }
        if upload_min == 0 || upload_min > upload_max || upload_max > total {
            return Err(FsError::Unknown(format!(
                "upload targets {}..{} are out of range for {} partitions",
                upload_min, upload_max, total
            )));
        }
        self.dead_threshold = dead_threshold;
        self.upload_min = upload_min;
        self.upload_max = upload_max;
        Ok(self)
    }

    pub fn partitions(&self) -> &Arc<PartitionDirectory> {
        &self.partitions
    }

    /// Fails fast while the cluster tolerates no more dead partitions.
    fn check_not_dead(&self) -> Result<(), FsError> {
        let dead = self.partitions.dead_count();
        if dead > self.dead_threshold {
            return Err(FsError::ClusterDegraded {
                dead,
                threshold: self.dead_threshold,
            });
        }
        Ok(())
    }

    async fn open_on(
        &self,
        fs: &Arc<dyn FileSystem>,
        name: &str,
        kind: &UploadKind,
    ) -> Result<ByteSink, FsError> {
        match kind {
            UploadKind::Plain => fs.upload(name).await,
            UploadKind::Sized(size) => fs.upload_sized(name, *size).await,
            UploadKind::Append(offset) => fs.append(name, *offset).await,
        }
    }

    /// Opens upload consumers on partitions in selector order, skipping
    /// failing partitions, until `upload_max` are collected or the candidates
    /// run out.
    async fn collect_targets(
        &self,
        name: &str,
        kind: &UploadKind,
    ) -> Result<Vec<UploadTarget>, FsError> {
        let mut targets: Vec<UploadTarget> = Vec::new();
        for id in self.partitions.select(name) {
            if targets.len() == self.upload_max {
                break;
            }
            let Some(fs) = self.partitions.get(&id) else {
                continue;
            };
            let opened = self.open_on(&fs, name, kind).await;
            match self.partitions.wrap_result(&id, opened) {
                Ok(sink) => targets.push(UploadTarget { id, sink }),
                Err(e) => {
                    tracing::warn!("could not open upload for '{}' on '{}': {}", name, id, e);
                }
            }
        }

        if targets.len() < self.upload_min {
            // Dropping the collected sinks closes them on their partitions.
            tracing::warn!(
                "only {} of at least {} upload targets reachable for '{}'",
                targets.len(),
                self.upload_min,
                name
            );
            return Err(FsError::NotEnoughUploadTargets);
        }
        Ok(targets)
    }

    async fn replicated_upload(&self, name: &str, kind: UploadKind) -> Result<ByteSink, FsError> {
        self.check_not_dead()?;
        let targets = self.collect_targets(name, &kind).await?;
        tracing::debug!(
            "uploading '{}' to [{}]",
            name,
            targets
                .iter()
                .map(|t| t.id.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );

        let sink = splitter::split(
            targets,
            self.upload_min,
            self.dead_threshold,
            Arc::clone(&self.partitions),
        );
        Ok(match kind {
            UploadKind::Sized(size) => stream::fixed_size(sink, size),
            _ => sink,
        })
    }

    /// Runs one operation on every alive partition in parallel, routing every
    /// failure through the liveness wrapper, and finishes with the
    /// dead-threshold check. Returns successes and failures separately.
    async fn broadcast<T, F, Fut>(&self, op: F) -> Result<BroadcastOutcome<T>, FsError>
    where
        F: Fn(PartitionId, Arc<dyn FileSystem>) -> Fut,
        Fut: std::future::Future<Output = Result<T, FsError>>,
    {
        let outcome = self.broadcast_unchecked(op).await?;
        self.check_not_dead()?;
        Ok(outcome)
    }

    /// As [`broadcast`](Self::broadcast) but without the completion threshold
    /// check. Downloads classify their failures themselves: a download that
    /// still found a replica should succeed even if the sweep just pushed the
    /// cluster over its threshold.
    async fn broadcast_unchecked<T, F, Fut>(&self, op: F) -> Result<BroadcastOutcome<T>, FsError>
    where
        F: Fn(PartitionId, Arc<dyn FileSystem>) -> Fut,
        Fut: std::future::Future<Output = Result<T, FsError>>,
    {
        self.check_not_dead()?;
        let alive = self.partitions.alive_entries();
        let results = join_all(
            alive
                .into_iter()
                .map(|(id, fs)| {
                    let fut = op(id.clone(), fs);
                    async move { (id, fut.await) }
                }),
        )
        .await;

        let mut successes = Vec::new();
        let mut failures = Vec::new();
        for (id, result) in results {
            match self.partitions.wrap_result(&id, result) {
                Ok(value) => successes.push((id, value)),
                Err(e) => failures.push(e),
            }
        }

        Ok(BroadcastOutcome {
            successes,
            failures,
        })
    }
}

struct BroadcastOutcome<T> {
    successes: Vec<(PartitionId, T)>,
    failures: Vec<FsError>,
}

impl<T> BroadcastOutcome<T> {
    fn values(self) -> impl Iterator<Item = T> {
        self.successes.into_iter().map(|(_, value)| value)
    }

    /// For mutating operations every partition must have succeeded.
    fn require_all(self) -> Result<(), FsError> {
        match self.first_failure() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Application errors take precedence: they carry the domain meaning,
    /// transport wrappers only say "that node was unreachable".
    fn first_failure(&self) -> Option<FsError> {
        self.failures
            .iter()
            .find(|e| e.is_application())
            .or_else(|| self.failures.first())
            .cloned()
    }
}

#[async_trait]
impl FileSystem for ClusterFs {
    async fn upload(&self, name: &str) -> Result<ByteSink, FsError> {
        self.replicated_upload(name, UploadKind::Plain).await
    }

    async fn upload_sized(&self, name: &str, size: u64) -> Result<ByteSink, FsError> {
        self.replicated_upload(name, UploadKind::Sized(size)).await
    }

    async fn append(&self, name: &str, offset: u64) -> Result<ByteSink, FsError> {
        self.replicated_upload(name, UploadKind::Append(offset))
            .await
    }

    async fn download(&self, name: &str, offset: u64, limit: u64) -> Result<ByteSource, FsError> {
        let outcome = self
            .broadcast_unchecked(|id, fs| {
                let name = name.to_string();
                async move {
                    tracing::trace!("downloading '{}' from '{}'", name, id);
                    fs.download(&name, offset, limit).await
                }
            })
            .await?;

        if outcome.successes.is_empty() {
            // Distinguish "the file is not there" from "nobody answered".
            let err = outcome
                .first_failure()
                .unwrap_or(FsError::NoReplicasAvailable);
            return Err(if err.is_application() {
                err
            } else {
                FsError::NoReplicasAvailable
            });
        }

        let inputs: Vec<DownloadInput> = outcome
            .successes
            .into_iter()
            .map(|(id, source)| DownloadInput { id, source })
            .collect();
        Ok(combiner::combine(inputs, Arc::clone(&self.partitions)))
    }

    async fn delete(&self, name: &str) -> Result<(), FsError> {
        self.broadcast(|_, fs| {
            let name = name.to_string();
            async move { fs.delete(&name).await }
        })
        .await?
        .require_all()
    }

    async fn delete_all(&self, names: &HashSet<String>) -> Result<(), FsError> {
        if names.is_empty() {
            return Ok(());
        }
        self.broadcast(|_, fs| async move { fs.delete_all(names).await })
            .await?
            .require_all()
    }

    async fn list(&self, glob: &str) -> Result<HashMap<String, FileMetadata>, FsError> {
        let outcome = self
            .broadcast(|_, fs| {
                let glob = glob.to_string();
                async move { fs.list(&glob).await }
            })
            .await?;
        Ok(metadata::flatten(outcome.values()))
    }

    async fn info(&self, name: &str) -> Result<Option<FileMetadata>, FsError> {
        let outcome = self
            .broadcast(|_, fs| {
                let name = name.to_string();
                async move { fs.info(&name).await }
            })
            .await?;
        Ok(outcome.values().flatten().max())
    }

    async fn info_all(
        &self,
        names: &HashSet<String>,
    ) -> Result<HashMap<String, FileMetadata>, FsError> {
        if names.is_empty() {
            return Ok(HashMap::new());
        }
        let outcome = self
            .broadcast(|_, fs| async move { fs.info_all(names).await })
            .await?;
        Ok(metadata::flatten(outcome.values()))
    }

    /// A cluster ping sweeps every partition and then applies the
    /// dead-threshold check, so it doubles as the health probe that
    /// rehabilitates recovered partitions.
    async fn ping(&self) -> Result<(), FsError> {
        self.partitions.check_all_partitions().await;
        self.check_not_dead()
    }
}
