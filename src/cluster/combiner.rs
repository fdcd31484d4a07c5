//! Fan-In Byte Combiner
//!
//! Merges several downloads of the same file into one output stream. All
//! inputs are expected to deliver the exact same byte sequence starting at the
//! requested offset, which is precisely what the replication contract
//! guarantees.
//!
//! The combiner reads from one elected input at a time. When that input fails
//! before end-of-stream, the next input takes over after skipping as many
//! bytes as were already emitted downstream, so the output never duplicates a
//! byte and never leaves a gap. If no remaining input can reach the skip
//! point, the stream fails with [`FsError::TruncatedStream`]. On a clean
//! end-of-stream every unused input is closed.

use crate::cluster::partitions::{PartitionDirectory, PartitionId};
use crate::fs::error::FsError;
use crate::fs::stream::{byte_channel, ByteSource};
use std::collections::VecDeque;
use std::sync::Arc;

/// One successfully opened download on a partition.
pub struct DownloadInput {
    pub id: PartitionId,
    pub source: ByteSource,
}

/// Merges `inputs` into a single output source. Inputs failing mid-stream are
/// reported to the partition directory before the next replica takes over.
pub fn combine(inputs: Vec<DownloadInput>, partitions: Arc<PartitionDirectory>) -> ByteSource {
    let (mut sink, output) = byte_channel();
    tokio::spawn(async move {
        let mut pending: VecDeque<DownloadInput> = inputs.into();
        let mut emitted: u64 = 0;

        'next_input: loop {
            let Some(mut input) = pending.pop_front() else {
                sink.fail(FsError::TruncatedStream).await;
                return;
            };

            // Fast-forward a takeover replica past the bytes the downstream
            // already received.
            let mut to_skip = emitted;
            while to_skip > 0 {
                match input.source.next().await {
                    Ok(Some(chunk)) => {
                        let len = chunk.len() as u64;
                        if len <= to_skip {
                            to_skip -= len;
                        } else {
                            let rest = chunk.slice(to_skip as usize..);
                            to_skip = 0;
                            emitted += rest.len() as u64;
                            if sink.send(rest).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(None) => {
                        // This replica ends before the resume point; it cannot
                        // contribute anything new.
                        input.source.complete(Ok(()));
                        continue 'next_input;
                    }
                    Err(e) => {
                        tracing::warn!("replica '{}' failed while catching up: {}", input.id, e);
                        partitions.mark_if_dead(&input.id, &e);
                        continue 'next_input;
                    }
                }
            }

            loop {
                match input.source.next().await {
                    Ok(Some(chunk)) => {
                        emitted += chunk.len() as u64;
                        if sink.send(chunk).await.is_err() {
                            // Downstream cancelled; dropping the inputs closes
                            // them.
                            return;
                        }
                    }
                    Ok(None) => {
                        input.source.complete(Ok(()));
                        // Unused inputs are closed by dropping `pending`.
                        let _ = sink.finish().await;
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(
                            "replica '{}' failed after {} bytes, failing over: {}",
                            input.id,
                            emitted,
                            e
                        );
                        partitions.mark_if_dead(&input.id, &e);
                        continue 'next_input;
                    }
                }
            }
        }
    });
    output
}
