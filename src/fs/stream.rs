//! Byte Stream Primitives
//!
//! Uploads and downloads move through lazy, cancellable streams of byte chunks
//! with two halves: a [`ByteSink`] the producing side writes into and a
//! [`ByteSource`] the consuming side reads from. The pair is connected by a
//! small bounded channel, so the slowest consumer paces the producer.
//!
//! End-of-stream is a two-phase handshake. The producer signals that the last
//! chunk was sent ([`ByteSink::finish`]) and then waits for the consumer's
//! acknowledgement, which the consumer gives only once it has durably accepted
//! the data. This separation of "last byte delivered" from "commit
//! acknowledged" is what the cluster's fan-out splitter and fan-in combiner
//! are built on.
//!
//! Terminal outcomes:
//! - normal end-of-stream: `finish` on the sink, `Ok(None)` on the source;
//! - failure: `fail` on the sink surfaces as `Err` on the source, and an
//!   error handed to [`ByteSource::complete`] surfaces as the result of
//!   `finish`;
//! - cancellation: dropping either half before end-of-stream; the other half
//!   observes [`FsError::Cancelled`].

use crate::fs::error::FsError;
use bytes::Bytes;
use futures::Stream;
use tokio::sync::{mpsc, oneshot};

/// Chunks buffered in flight between the two halves.
const CHANNEL_CAPACITY: usize = 8;

enum Frame {
    Data(Bytes),
    End,
    Fail(FsError),
}

/// Creates a connected sink/source pair.
pub fn byte_channel() -> (ByteSink, ByteSource) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (ack_tx, ack_rx) = oneshot::channel();
    (
        ByteSink { tx, ack: ack_rx },
        ByteSource {
            rx,
            ack: Some(ack_tx),
            ended: false,
        },
    )
}

/// Producer half of a byte stream.
#[derive(Debug)]
pub struct ByteSink {
    tx: mpsc::Sender<Frame>,
    ack: oneshot::Receiver<Result<(), FsError>>,
}

impl ByteSink {
    /// Sends one chunk, waiting for channel capacity. Fails if the consumer
    /// has already completed or gone away, surfacing the consumer's error.
    pub async fn send(&mut self, chunk: Bytes) -> Result<(), FsError> {
        if self.tx.send(Frame::Data(chunk)).await.is_err() {
            return Err(self.closed_cause());
        }
        Ok(())
    }

    /// Signals end-of-stream and waits for the consumer's commit
    /// acknowledgement.
    pub async fn finish(self) -> Result<(), FsError> {
        let _ = self.tx.send(Frame::End).await;
        match self.ack.await {
            Ok(result) => result,
            Err(_) => Err(FsError::Cancelled),
        }
    }

    /// Aborts the stream, handing the cause to the consumer.
    pub async fn fail(self, cause: FsError) {
        let _ = self.tx.send(Frame::Fail(cause)).await;
    }

    fn closed_cause(&mut self) -> FsError {
        // The consumer acks before dropping its half, so when the data channel
        // is closed the cause is already in the slot.
        match self.ack.try_recv() {
            Ok(Err(e)) => e,
            _ => FsError::Cancelled,
        }
    }
}

/// Consumer half of a byte stream.
#[derive(Debug)]
pub struct ByteSource {
    rx: mpsc::Receiver<Frame>,
    ack: Option<oneshot::Sender<Result<(), FsError>>>,
    ended: bool,
}

impl ByteSource {
    /// Next chunk, `Ok(None)` on a clean end-of-stream, `Err` if the producer
    /// failed or went away.
    pub async fn next(&mut self) -> Result<Option<Bytes>, FsError> {
        if self.ended {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(Frame::Data(chunk)) => Ok(Some(chunk)),
            Some(Frame::End) => {
                self.ended = true;
                Ok(None)
            }
            Some(Frame::Fail(e)) => Err(e),
            None => Err(FsError::Cancelled),
        }
    }

    /// Acknowledges the stream with an explicit commit result. The producer's
    /// `finish` call resolves with exactly this value.
    pub fn complete(mut self, result: Result<(), FsError>) {
        if let Some(ack) = self.ack.take() {
            let _ = ack.send(result);
        }
    }

    /// Drains the stream into memory. Used by stores that commit whole files.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, FsError> {
        let mut data = Vec::new();
        while let Some(chunk) = self.next().await? {
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }

    /// Converts the source into a [`futures::Stream`] of chunks, deferring the
    /// acknowledgement to the returned [`StreamAck`] handle. Used where a body
    /// is streamed out but the commit result only becomes known later (an HTTP
    /// response status, for instance).
    pub fn into_stream_deferred(
        mut self,
    ) -> (
        impl Stream<Item = Result<Bytes, FsError>> + Send + 'static,
        StreamAck,
    ) {
        let ack = StreamAck(self.ack.take());
        let stream = futures::stream::unfold(Some(self), |state| async move {
            let mut source = state?;
            match source.next().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(source))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        });
        (stream, ack)
    }

    /// Converts the source into a [`futures::Stream`], acknowledging success
    /// automatically once the stream is drained or dropped.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, FsError>> + Send + 'static {
        futures::stream::unfold(Some(self), |state| async move {
            let mut source = state?;
            match source.next().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(source))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

impl Drop for ByteSource {
    fn drop(&mut self) {
        if let Some(ack) = self.ack.take() {
            let result = if self.ended {
                Ok(())
            } else {
                Err(FsError::Cancelled)
            };
            let _ = ack.send(result);
        }
    }
}

/// Detached acknowledgement handle, see [`ByteSource::into_stream_deferred`].
pub struct StreamAck(Option<oneshot::Sender<Result<(), FsError>>>);

impl StreamAck {
    pub fn complete(mut self, result: Result<(), FsError>) {
        if let Some(ack) = self.0.take() {
            let _ = ack.send(result);
        }
    }
}

/// Copies a source into a sink, chunk by chunk, propagating failures in both
/// directions. Resolves with the sink's commit acknowledgement.
pub async fn pump(mut source: ByteSource, mut sink: ByteSink) -> Result<(), FsError> {
    loop {
        match source.next().await {
            Ok(Some(chunk)) => {
                if let Err(e) = sink.send(chunk).await {
                    source.complete(Err(e.clone()));
                    return Err(e);
                }
            }
            Ok(None) => {
                let result = sink.finish().await;
                source.complete(result.clone());
                return result;
            }
            Err(e) => {
                sink.fail(e.clone()).await;
                return Err(e);
            }
        }
    }
}

/// Wraps a sink so that exactly `size` bytes must flow through it. Surplus
/// bytes fail the stream with [`FsError::UnexpectedData`], a premature
/// end-of-stream with [`FsError::UnexpectedEndOfStream`].
pub fn fixed_size(mut inner: ByteSink, size: u64) -> ByteSink {
    let (outer, mut rx) = byte_channel();
    tokio::spawn(async move {
        let mut remaining = size;
        loop {
            match rx.next().await {
                Ok(Some(chunk)) => {
                    if chunk.len() as u64 > remaining {
                        inner.fail(FsError::UnexpectedData).await;
                        rx.complete(Err(FsError::UnexpectedData));
                        return;
                    }
                    remaining -= chunk.len() as u64;
                    if let Err(e) = inner.send(chunk).await {
                        rx.complete(Err(e));
                        return;
                    }
                }
                Ok(None) => {
                    if remaining > 0 {
                        inner.fail(FsError::UnexpectedEndOfStream).await;
                        rx.complete(Err(FsError::UnexpectedEndOfStream));
                    } else {
                        let result = inner.finish().await;
                        rx.complete(result);
                    }
                    return;
                }
                Err(e) => {
                    inner.fail(e).await;
                    return;
                }
            }
        }
    });
    outer
}
