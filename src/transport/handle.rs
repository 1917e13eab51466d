//! Transport handle: one connection attempt and its I/O tasks.
//!
//! Starting a handle spawns a task that connects through the
//! [`Connector`], reports `Ready` (or `Failed` / `Cancelled`), then serves
//! send and receive requests until the handle is closed. Results come back
//! as [`HandleEvent`]s; the task holds no reference to the session, only the
//! handle id and an event sender.
//!
//! Closing (or dropping) the handle aborts its tasks, which closes the
//! stream. Events already queued by then carry a stale id and are ignored
//! by the session.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::writer::spawn_writer_task;
use super::{ConnectProgress, Connector, HandleEvent, HandleId, Received, TransportEvent};

/// Requests from the session to the handle task.
#[derive(Debug)]
enum HandleRequest {
    Send(Bytes),
    Receive(usize),
}

/// Owner of one connection attempt.
#[derive(Debug)]
pub struct TransportHandle {
    id: HandleId,
    requests: mpsc::UnboundedSender<HandleRequest>,
    task: JoinHandle<()>,
}

impl TransportHandle {
    /// Spawn the handle task and begin connecting to `host:port`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<C: Connector>(
        id: HandleId,
        connector: Arc<C>,
        host: String,
        port: u16,
        events: mpsc::UnboundedSender<HandleEvent>,
    ) -> Self {
        let (requests, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(id, connector, host, port, rx, events));
        tracing::debug!("Handle {} started", id);
        Self { id, requests, task }
    }

    #[inline]
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Queue bytes for writing. Completion is reported as `Sent`/`SendFailed`.
    pub fn send(&self, data: Bytes) -> io::Result<()> {
        self.request(HandleRequest::Send(data))
    }

    /// Request up to `max_len` bytes. The result is reported as
    /// `Received`/`ReceiveFailed`.
    pub fn receive(&self, max_len: usize) -> io::Result<()> {
        self.request(HandleRequest::Receive(max_len))
    }

    /// Tear the handle down, closing the stream.
    pub fn close(self) {
        tracing::debug!("Handle {} closed", self.id);
        // Drop aborts the tasks.
    }

    fn request(&self, request: HandleRequest) -> io::Result<()> {
        self.requests.send(request).map_err(|_| {
            io::Error::new(
                io::ErrorKind::NotConnected,
                format!("transport handle {} has stopped", self.id),
            )
        })
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Aborts the writer task when the request loop ends or is aborted.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Connect, then serve requests until the handle goes away.
async fn run<C: Connector>(
    id: HandleId,
    connector: Arc<C>,
    host: String,
    port: u16,
    mut requests: mpsc::UnboundedReceiver<HandleRequest>,
    events: mpsc::UnboundedSender<HandleEvent>,
) {
    let emit = |event: TransportEvent| events.send(HandleEvent { id, event }).is_ok();

    let progress = ConnectProgress::new(id, events.clone());
    let stream = match connector.connect(&host, port, &progress).await {
        Ok(stream) => stream,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => {
            emit(TransportEvent::Cancelled);
            return;
        }
        Err(e) => {
            emit(TransportEvent::Failed(e));
            return;
        }
    };

    if !emit(TransportEvent::Ready) {
        return;
    }

    let (mut reader, write_half) = tokio::io::split(stream);
    let (writer, writer_task) = spawn_writer_task(write_half, id, events.clone());
    let _writer_guard = AbortOnDrop(writer_task);

    let mut buf = Vec::new();
    while let Some(request) = requests.recv().await {
        let event = match request {
            HandleRequest::Send(data) => match writer.send(data) {
                Ok(()) => continue,
                Err(e) => TransportEvent::SendFailed(e),
            },
            HandleRequest::Receive(max_len) => {
                buf.resize(max_len, 0);
                match reader.read(&mut buf).await {
                    Ok(0) => TransportEvent::Received(Received {
                        data: Bytes::new(),
                        is_complete: true,
                    }),
                    Ok(n) => TransportEvent::Received(Received {
                        data: Bytes::copy_from_slice(&buf[..n]),
                        is_complete: false,
                    }),
                    Err(e) => TransportEvent::ReceiveFailed(e),
                }
            }
        };

        if !emit(event) {
            return;
        }
    }

    // Every request sender is gone without an abort.
    emit(TransportEvent::Cancelled);
}
