//! Dedicated writer task for outgoing messages.
//!
//! The handle's request loop owns the read half of the stream and spends
//! most of its time parked in a read. Writes are therefore handed to a
//! separate task through an mpsc channel, so issuing a send never waits
//! behind a pending receive and the two run pipelined.
//!
//! ```text
//! request loop ─► mpsc::UnboundedSender<Bytes> ─► Writer Task ─► write half
//!      │                                              │
//!      └──────────── HandleEvent (Sent / SendFailed) ◄┘
//! ```

use std::io;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{HandleEvent, HandleId, TransportEvent};

/// Maximum queued messages written before a single flush.
const MAX_BATCH_SIZE: usize = 16;

/// Handle for queueing writes on the writer task.
#[derive(Debug, Clone)]
pub(crate) struct WriterHandle {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl WriterHandle {
    /// Queue bytes for writing.
    ///
    /// Fails only when the writer task has already stopped.
    pub(crate) fn send(&self, data: Bytes) -> io::Result<()> {
        self.tx
            .send(data)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "writer task stopped"))
    }
}

/// Spawn the writer task for one handle.
///
/// Completion of every write is reported on `events` tagged with `id`.
/// The task ends when every [`WriterHandle`] is dropped or a write fails.
pub(crate) fn spawn_writer_task<W>(
    writer: W,
    id: HandleId,
    events: mpsc::UnboundedSender<HandleEvent>,
) -> (WriterHandle, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(writer_loop(rx, writer, id, events));
    (WriterHandle { tx }, task)
}

/// Main writer loop - receives messages and writes them to the stream.
async fn writer_loop<W>(
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    mut writer: W,
    id: HandleId,
    events: mpsc::UnboundedSender<HandleEvent>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(first) = rx.recv().await {
        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(data) => batch.push(data),
                Err(_) => break,
            }
        }

        let (event, failed) = match write_batch(&mut writer, &batch).await {
            Ok(written) => (TransportEvent::Sent(written), false),
            Err(e) => (TransportEvent::SendFailed(e), true),
        };

        if events.send(HandleEvent { id, event }).is_err() || failed {
            return;
        }
    }
}

/// Write a batch and flush once; returns the number of bytes written.
async fn write_batch<W>(writer: &mut W, batch: &[Bytes]) -> io::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    for data in batch {
        writer.write_all(data).await?;
        written += data.len();
    }
    writer.flush().await?;
    Ok(written)
}
