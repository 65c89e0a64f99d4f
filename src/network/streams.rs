//! The table of live application streams and their reader loops.
//!
//! Each stream is split in two: the write half sits in the registry behind a
//! per-stream async mutex (so `sendStreamMsg` never holds the table lock
//! across I/O), and the read half is owned by a background task that turns
//! wire bytes into `incomingStreamMsg` upcalls. Entries outlive their
//! readers: a half-closed stream stays in the table until the host resets
//! it, so late `streamLost`/`streamReadComplete` upcalls always have an
//! index to name.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::io::{ReadHalf, WriteHalf};
use futures::{AsyncReadExt, AsyncWriteExt};
use libp2p::Stream;
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::rpc::types::{encode_blob, PeerInfo};
use crate::rpc::{OutboundQueue, Upcall};

/// Fixed reader buffer. Bigger reads are chopped into multiple upcalls; the
/// host reassembles by concatenation.
pub const READ_BUFFER_SIZE: usize = 4096;

/// Pause before the reader of a locally opened stream starts, so the
/// `openStream` response reaches the host before the stream's first
/// `incomingStreamMsg`.
pub const OPEN_STREAM_READER_DELAY: Duration = Duration::from_millis(250);

pub type SharedWriter = Arc<AsyncMutex<WriteHalf<Stream>>>;

pub struct StreamEntry {
    pub peer: PeerInfo,
    pub protocol: String,
    pub writer: SharedWriter,
    pub reader: Option<JoinHandle<()>>,
}

/// stream_idx → entry. The mutex is held only across insert/lookup/remove,
/// never across stream I/O.
#[derive(Default)]
pub struct StreamRegistry {
    inner: Mutex<HashMap<u64, StreamEntry>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, idx: u64, entry: StreamEntry) {
        self.inner.lock().insert(idx, entry);
    }

    /// Attaches the reader handle after the fact; inbound streams register
    /// their entry before the reader task exists.
    pub fn set_reader(&self, idx: u64, reader: JoinHandle<()>) {
        if let Some(entry) = self.inner.lock().get_mut(&idx) {
            entry.reader = Some(reader);
        }
    }

    /// Clones out the writer handle for a stream.
    pub fn writer(&self, idx: u64) -> Option<SharedWriter> {
        self.inner.lock().get(&idx).map(|e| e.writer.clone())
    }

    /// Removes the entry, aborting its reader. Dropping both halves resets
    /// the stream in both directions.
    pub fn remove(&self, idx: u64) -> Option<StreamEntry> {
        let entry = self.inner.lock().remove(&idx)?;
        if let Some(reader) = &entry.reader {
            reader.abort();
        }
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// The per-stream reader loop. Emits `incomingStreamMsg` for every non-empty
/// read in wire order, then exactly one terminal upcall: `streamReadComplete`
/// on EOF or `streamLost` on a read error. Never retries.
pub async fn run_reader(idx: u64, mut read: ReadHalf<Stream>, out: OutboundQueue) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match read.read(&mut buf).await {
            Ok(0) => {
                out.send(Upcall::StreamReadComplete { stream_idx: idx }).await;
                break;
            }
            Ok(n) => {
                out.send(Upcall::IncomingStreamMsg {
                    stream_idx: idx,
                    data: encode_blob(&buf[..n]),
                })
                .await;
            }
            Err(e) => {
                out.send(Upcall::StreamLost {
                    stream_idx: idx,
                    reason: format!("read failure: {e}"),
                })
                .await;
                break;
            }
        }
    }
}

/// Writes all of `data`, reporting how many bytes actually landed when the
/// stream fails partway.
pub async fn write_all_tracking<W>(writer: &mut W, data: &[u8]) -> Result<(), (usize, io::Error)>
where
    W: futures::AsyncWrite + Unpin,
{
    let mut written = 0;
    while written < data.len() {
        match writer.write(&data[written..]).await {
            Ok(0) => return Err((written, io::ErrorKind::WriteZero.into())),
            Ok(n) => written += n,
            Err(e) => return Err((written, e)),
        }
    }
    writer.flush().await.map_err(|e| (written, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_all_tracking_reports_partial_progress() {
        // A sink that accepts a few bytes then fails.
        struct Flaky {
            accepted: usize,
            budget: usize,
        }
        impl futures::AsyncWrite for Flaky {
            fn poll_write(
                mut self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                buf: &[u8],
            ) -> std::task::Poll<io::Result<usize>> {
                if self.accepted >= self.budget {
                    return std::task::Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
                }
                let n = buf.len().min(self.budget - self.accepted).min(3);
                self.accepted += n;
                std::task::Poll::Ready(Ok(n))
            }
            fn poll_flush(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
            ) -> std::task::Poll<io::Result<()>> {
                std::task::Poll::Ready(Ok(()))
            }
            fn poll_close(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
            ) -> std::task::Poll<io::Result<()>> {
                std::task::Poll::Ready(Ok(()))
            }
        }

        let mut ok = Flaky {
            accepted: 0,
            budget: 100,
        };
        write_all_tracking(&mut ok, b"0123456789").await.unwrap();
        assert_eq!(ok.accepted, 10);

        let mut broken = Flaky {
            accepted: 0,
            budget: 7,
        };
        let (written, err) = write_all_tracking(&mut broken, b"0123456789")
            .await
            .unwrap_err();
        assert_eq!(written, 7);
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
