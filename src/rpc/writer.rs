//! The event serializer: a single buffered queue draining every outbound
//! message (responses and upcalls) through one writer. This is the only
//! source of stdout bytes, which makes it the ordering authority for all
//! output.

use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::warn;

use super::upcall::OutboundMessage;

/// Queue depth. The writer drains continuously; the capacity only bounds
/// bursts from parallel stream readers.
pub const QUEUE_CAPACITY: usize = 4096;

/// Cloneable producer half of the outbound queue.
#[derive(Clone)]
pub struct OutboundQueue {
    tx: mpsc::Sender<OutboundMessage>,
}

impl OutboundQueue {
    pub fn new() -> (Self, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        (Self { tx }, rx)
    }

    /// Enqueues a message for the writer. If the writer is gone the process
    /// is already exiting; the message is dropped with a log line.
    pub async fn send(&self, msg: impl Into<OutboundMessage>) {
        if self.tx.send(msg.into()).await.is_err() {
            warn!("outbound writer is gone, dropping message");
        }
    }
}

/// Drains the queue into `out`, one JSON object per line-feed-terminated
/// line, flushing after every message. Returns only when every sender has
/// been dropped; any write error is fatal to the caller.
pub async fn run<W>(mut rx: mpsc::Receiver<OutboundMessage>, mut out: W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = rx.recv().await {
        let mut line = serde_json::to_vec(&msg)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        line.push(b'\n');
        out.write_all(&line).await?;
        out.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::upcall::{Response, Upcall};
    use serde_json::json;

    #[tokio::test]
    async fn test_writer_emits_newline_terminated_json_in_order() {
        let (queue, rx) = OutboundQueue::new();
        queue
            .send(Response::Success {
                seqno: 1,
                success: json!("ok"),
                duration: "1ms".into(),
            })
            .await;
        queue
            .send(Upcall::StreamReadComplete { stream_idx: 2 })
            .await;
        drop(queue);

        let mut buf = Vec::new();
        run(rx, &mut buf).await.unwrap();

        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(text.ends_with('\n'));

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["seqno"], 1);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["upcall"], "streamReadComplete");
    }
}
