//! Fan-Out Byte Splitter
//!
//! Duplicates one inbound byte stream to every upload target of a replicated
//! write. Chunks are `Bytes`, so the copy per downstream is a reference count,
//! not a memory copy. The splitter forwards a chunk to every downstream before
//! accepting the next one, so the slowest replica paces the upload.
//!
//! Failure policy: a downstream that rejects a chunk is dropped (and the
//! partition marked per the liveness rules); the stream continues as long as
//! the survivor count stays at or above `required_acks`. End-of-stream is
//! acknowledged to the upstream producer once at least `required_acks`
//! downstreams acknowledged their commit.

use crate::cluster::partitions::{PartitionDirectory, PartitionId};
use crate::fs::error::FsError;
use crate::fs::stream::{byte_channel, ByteSink};
use futures::future::join_all;
use std::sync::Arc;

/// One opened upload consumer on a partition.
pub struct UploadTarget {
    pub id: PartitionId,
    pub sink: ByteSink,
}

/// Wires `targets` behind a single sink. `dead_threshold` aborts the stream
/// early when the cluster as a whole degrades past its tolerance.
pub fn split(
    targets: Vec<UploadTarget>,
    required_acks: usize,
    dead_threshold: usize,
    partitions: Arc<PartitionDirectory>,
) -> ByteSink {
    let (outer, mut rx) = byte_channel();
    tokio::spawn(async move {
        let mut live = targets;
        loop {
            match rx.next().await {
                Ok(Some(chunk)) => {
                    let mut kept = Vec::with_capacity(live.len());
                    for mut target in live {
                        match target.sink.send(chunk.clone()).await {
                            Ok(()) => kept.push(target),
                            Err(e) => {
                                tracing::warn!(
                                    "upload replica on '{}' dropped mid-stream: {}",
                                    target.id,
                                    e
                                );
                                partitions.mark_if_dead(&target.id, &e);
                            }
                        }
                    }
                    live = kept;

                    if live.len() < required_acks {
                        for target in live {
                            target.sink.fail(FsError::NotEnoughUploadTargets).await;
                        }
                        rx.complete(Err(FsError::NotEnoughUploadTargets));
                        return;
                    }
                    if partitions.dead_count() > dead_threshold {
                        let failure = FsError::ClusterDegraded {
                            dead: partitions.dead_count(),
                            threshold: dead_threshold,
                        };
                        for target in live {
                            target.sink.fail(failure.clone()).await;
                        }
                        rx.complete(Err(failure));
                        return;
                    }
                }
                Ok(None) => {
                    let results = join_all(live.into_iter().map(|target| async move {
                        let result = target.sink.finish().await;
                        (target.id, result)
                    }))
                    .await;

                    let mut acked = 0;
                    for (id, result) in results {
                        match result {
                            Ok(()) => acked += 1,
                            Err(e) => {
                                tracing::warn!("replica on '{}' failed to commit: {}", id, e);
                                partitions.mark_if_dead(&id, &e);
                            }
                        }
                    }
                    if acked >= required_acks {
                        rx.complete(Ok(()));
                    } else {
                        rx.complete(Err(FsError::NotEnoughUploadTargets));
                    }
                    return;
                }
                Err(e) => {
                    // Producer failed or went away: propagate downstream so no
                    // partition commits a truncated file.
                    for target in live {
                        target.sink.fail(e.clone()).await;
                    }
                    return;
                }
            }
        }
    });
    outer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::stream::ByteSource;
    use bytes::Bytes;
    use tokio::task::JoinHandle;

    fn target(id: &str) -> (UploadTarget, ByteSource) {
        let (sink, source) = byte_channel();
        (
            UploadTarget {
                id: PartitionId::new(id),
                sink,
            },
            source,
        )
    }

    /// Downstream that accepts everything and acks success.
    fn accepting(mut source: ByteSource) -> JoinHandle<Vec<u8>> {
        tokio::spawn(async move {
            let data = source.read_to_end().await.unwrap_or_default();
            source.complete(Ok(()));
            data
        })
    }

    /// Downstream that dies with a transport error after `after` chunks.
    fn failing_after(mut source: ByteSource, after: usize) -> JoinHandle<()> {
        tokio::spawn(async move {
            for _ in 0..after {
                let _ = source.next().await;
            }
            source.complete(Err(FsError::Io("replica crashed".into())));
        })
    }

    fn empty_directory() -> Arc<PartitionDirectory> {
        Arc::new(PartitionDirectory::new())
    }

    #[tokio::test]
    async fn replicates_to_every_downstream() {
        let (a, src_a) = target("a");
        let (b, src_b) = target("b");
        let got_a = accepting(src_a);
        let got_b = accepting(src_b);

        let mut sink = split(vec![a, b], 2, 10, empty_directory());
        sink.send(Bytes::from_static(b"hel")).await.unwrap();
        sink.send(Bytes::from_static(b"lo")).await.unwrap();
        sink.finish().await.unwrap();

        assert_eq!(got_a.await.unwrap(), b"hello");
        assert_eq!(got_b.await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn survives_one_failure_above_the_minimum() {
        let (a, src_a) = target("a");
        let (b, src_b) = target("b");
        let got_a = accepting(src_a);
        let _died = failing_after(src_b, 1);

        let mut sink = split(vec![a, b], 1, 10, empty_directory());
        let mut sent = Vec::new();
        for chunk in [&b"he"[..], &b"ll"[..], &b"o"[..]] {
            sink.send(Bytes::copy_from_slice(chunk)).await.unwrap();
            sent.extend_from_slice(chunk);
        }
        sink.finish().await.unwrap();

        assert_eq!(got_a.await.unwrap(), sent);
    }

    #[tokio::test]
    async fn fails_once_survivors_drop_below_the_minimum() {
        let (a, src_a) = target("a");
        let (b, src_b) = target("b");
        let _dead_a = failing_after(src_a, 1);
        let _dead_b = failing_after(src_b, 1);

        let mut sink = split(vec![a, b], 1, 10, empty_directory());
        let mut last = Ok(());
        for _ in 0..32 {
            last = sink.send(Bytes::from_static(b"x")).await;
            if last.is_err() {
                break;
            }
        }
        assert_eq!(last.unwrap_err(), FsError::NotEnoughUploadTargets);
    }

    #[tokio::test]
    async fn end_of_stream_needs_enough_commit_acks() {
        let (a, src_a) = target("a");
        let (b, src_b) = target("b");
        let _got_a = accepting(src_a);
        // Accepts all chunks but refuses to commit.
        tokio::spawn(async move {
            let mut src_b = src_b;
            let _ = src_b.read_to_end().await;
            src_b.complete(Err(FsError::FileExists));
        });

        let (c_ok, src_c) = target("c");
        let _got_c = accepting(src_c);

        // required = 2, one of three refuses: still enough.
        let mut sink = split(vec![a, b, c_ok], 2, 10, empty_directory());
        sink.send(Bytes::from_static(b"data")).await.unwrap();
        sink.finish().await.unwrap();
    }

    #[tokio::test]
    async fn end_of_stream_fails_without_enough_acks() {
        let (a, src_a) = target("a");
        let (b, src_b) = target("b");
        let _got_a = accepting(src_a);
        tokio::spawn(async move {
            let mut src_b = src_b;
            let _ = src_b.read_to_end().await;
            src_b.complete(Err(FsError::FileExists));
        });

        let mut sink = split(vec![a, b], 2, 10, empty_directory());
        sink.send(Bytes::from_static(b"data")).await.unwrap();
        assert_eq!(
            sink.finish().await.unwrap_err(),
            FsError::NotEnoughUploadTargets
        );
    }

    #[tokio::test]
    async fn marks_failed_replicas_dead() {
        let directory = Arc::new(PartitionDirectory::new().with_partition(
            PartitionId::new("b"),
            Arc::new(crate::fs::memory::MemoryFs::new()) as Arc<dyn crate::fs::contract::FileSystem>,
        ));
        let (a, src_a) = target("a");
        let (b, src_b) = target("b");
        let got_a = accepting(src_a);
        let _died = failing_after(src_b, 0);

        let mut sink = split(vec![a, b], 1, 10, Arc::clone(&directory));
        for _ in 0..16 {
            if sink.send(Bytes::from_static(b"x")).await.is_err() {
                break;
            }
        }
        let _ = sink.finish().await;
        let _ = got_a.await;

        assert_eq!(directory.dead_count(), 1);
        assert!(directory.get(&PartitionId::new("b")).is_none());
    }
}
