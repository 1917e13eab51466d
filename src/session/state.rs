//! Session task: the single owner of all mutable session state.
//!
//! Commands from [`Session`](super::Session) clones, events from the current
//! transport handle, and operation deadlines all arrive over channels and
//! are applied one at a time inside [`SessionTask::run`]. Nothing else
//! touches the link state, the pending operation, or the receive buffer.
//!
//! Link state machine:
//!
//! ```text
//! NotConnected ──send──► Connecting ──Ready──► Ready
//!      ▲                     │                   │
//!      │ success             │ Failed/Cancelled  │ Failed/Cancelled/timeout
//!      │                     ▼                   ▼
//!      └──────────────── Terminal(Failed | Cancelled) ◄─┘
//! ```
//!
//! A handle never leaves `Terminal`; the next `send` starts a new one.

use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::accumulator::ReceiveBuffer;
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::transport::{
    Connector, HandleEvent, HandleId, Received, TransportEvent, TransportHandle,
};

use super::{LinkPhase, SessionStatus};

/// Identifies one `send` call within a session.
pub(crate) type OperationId = u64;

/// Deadline used when `now + timeout` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Requests from [`Session`](super::Session) handles.
pub(crate) enum Command {
    Send {
        message: String,
        timeout: Duration,
        reply: oneshot::Sender<Result<Bytes>>,
    },
    Cancel,
    Status {
        reply: oneshot::Sender<SessionStatus>,
    },
}

/// Why a handle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TerminalReason {
    Failed,
    Cancelled,
}

/// Tagged connection state. The handle lives inside the states that have one.
#[derive(Debug)]
enum LinkState {
    NotConnected,
    Connecting(TransportHandle),
    Ready(TransportHandle),
    Terminal(TerminalReason),
}

impl LinkState {
    fn handle(&self) -> Option<&TransportHandle> {
        match self {
            LinkState::Connecting(handle) | LinkState::Ready(handle) => Some(handle),
            LinkState::NotConnected | LinkState::Terminal(_) => None,
        }
    }

    fn phase(&self) -> LinkPhase {
        match self {
            LinkState::NotConnected => LinkPhase::NotConnected,
            LinkState::Connecting(_) => LinkPhase::Connecting,
            LinkState::Ready(_) => LinkPhase::Ready,
            LinkState::Terminal(TerminalReason::Failed) => LinkPhase::Failed,
            LinkState::Terminal(TerminalReason::Cancelled) => LinkPhase::Cancelled,
        }
    }
}

/// The caller waiting on the current `send`.
///
/// The gate is consumed by [`SessionTask::complete`], which takes the whole
/// operation out of its `Option`; any later completion attempt finds `None`.
struct PendingOperation {
    id: OperationId,
    gate: oneshot::Sender<Result<Bytes>>,
    deadline: Instant,
    timer: JoinHandle<()>,
}

pub(crate) struct SessionTask<C: Connector> {
    host: String,
    port: u16,
    config: Arc<SessionConfig>,
    connector: Arc<C>,

    link: LinkState,
    pending: Option<PendingOperation>,
    receive_buffer: Option<ReceiveBuffer>,
    current_message: String,

    next_handle_id: HandleId,
    next_operation_id: OperationId,
    events: mpsc::UnboundedSender<HandleEvent>,
    deadlines: mpsc::UnboundedSender<OperationId>,
}

/// Resolves once the caller waiting on the pending operation has dropped its
/// receiver. Never resolves while nothing is pending.
async fn caller_gone(pending: &mut Option<PendingOperation>) {
    match pending {
        Some(pending) => pending.gate.closed().await,
        None => std::future::pending().await,
    }
}

/// Spawn the task for a new session and return its command sender.
pub(crate) fn spawn<C: Connector>(
    host: String,
    port: u16,
    config: Arc<SessionConfig>,
    connector: Arc<C>,
) -> mpsc::UnboundedSender<Command> {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (deadlines_tx, deadlines_rx) = mpsc::unbounded_channel();

    let task = SessionTask {
        host,
        port,
        config,
        connector,
        link: LinkState::NotConnected,
        pending: None,
        receive_buffer: None,
        current_message: String::new(),
        next_handle_id: 0,
        next_operation_id: 0,
        events: events_tx,
        deadlines: deadlines_tx,
    };

    tokio::spawn(task.run(commands_rx, events_rx, deadlines_rx));
    commands_tx
}

impl<C: Connector> SessionTask<C> {
    /// Apply commands and events until every session handle is dropped.
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<HandleEvent>,
        mut deadlines: mpsc::UnboundedReceiver<OperationId>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                Some(event) = events.recv() => self.on_transport_event(event),
                Some(operation) = deadlines.recv() => self.on_deadline(operation),
                () = caller_gone(&mut self.pending) => self.on_caller_gone(),
            }
        }

        tracing::debug!("Session for {}:{} shutting down", self.host, self.port);
        self.complete(Err(SessionError::Cancelled));
        self.teardown(LinkState::NotConnected);
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Send {
                message,
                timeout,
                reply,
            } => self.begin(message, timeout, reply),
            Command::Cancel => self.cancel(),
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn status(&self) -> SessionStatus {
        SessionStatus {
            link: self.link.phase(),
            in_progress: self.pending.is_some(),
            buffered: self.receive_buffer.as_ref().map_or(0, ReceiveBuffer::len),
        }
    }

    // ------------------------------------------------------------------
    // Send pipeline
    // ------------------------------------------------------------------

    fn begin(
        &mut self,
        message: String,
        timeout: Duration,
        reply: oneshot::Sender<Result<Bytes>>,
    ) {
        if self.pending.as_ref().is_some_and(|p| p.gate.is_closed()) {
            self.on_caller_gone();
        }
        if let Some(pending) = &self.pending {
            let _ = reply.send(Err(SessionError::InvalidState(format!(
                "operation {} is already in progress",
                pending.id
            ))));
            return;
        }

        if self.link.handle().is_none() {
            self.receive_buffer = None;
            self.current_message.clear();
            let handle = self.start_handle();
            self.link = LinkState::Connecting(handle);
        }

        let id = self.next_operation_id;
        self.next_operation_id += 1;

        let now = Instant::now();
        let deadline = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + FAR_FUTURE);
        let deadlines = self.deadlines.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = deadlines.send(id);
        });

        tracing::debug!("Operation {} started ({:?} timeout)", id, timeout);

        self.receive_buffer = Some(ReceiveBuffer::new(
            self.config.termination_patterns(),
            &message,
            self.config.match_bare_pattern(),
        ));
        self.current_message = message;
        self.pending = Some(PendingOperation {
            id,
            gate: reply,
            deadline,
            timer,
        });

        if matches!(self.link, LinkState::Ready(_)) {
            self.transmit();
        }
    }

    fn start_handle(&mut self) -> TransportHandle {
        let id = self.next_handle_id;
        self.next_handle_id += 1;
        TransportHandle::start(
            id,
            self.connector.clone(),
            self.host.clone(),
            self.port,
            self.events.clone(),
        )
    }

    /// Write the current message and start receiving without waiting for
    /// the write to finish.
    fn transmit(&mut self) {
        let Some(handle) = self.link.handle() else {
            return;
        };

        let terminator = self.config.line_terminator();
        let mut payload = BytesMut::with_capacity(self.current_message.len() + terminator.len());
        payload.put_slice(self.current_message.as_bytes());
        payload.put_slice(terminator.as_bytes());

        let issued = handle
            .send(payload.freeze())
            .and_then(|()| handle.receive(self.config.receive_chunk_size()));

        if let Err(e) = issued {
            tracing::error!("Transmit on handle {} failed: {}", handle.id(), e);
            self.fail(e);
        }
    }

    // ------------------------------------------------------------------
    // Transport state machine
    // ------------------------------------------------------------------

    fn on_transport_event(&mut self, HandleEvent { id, event }: HandleEvent) {
        if self.link.handle().map(TransportHandle::id) != Some(id) {
            tracing::debug!("Discarding stale event from handle {}: {:?}", id, event);
            return;
        }

        match event {
            TransportEvent::Waiting(e) => {
                tracing::warn!("Handle {} waiting: {}", id, e);
            }
            TransportEvent::Ready => {
                let link = std::mem::replace(&mut self.link, LinkState::NotConnected);
                self.link = match link {
                    LinkState::Connecting(handle) => LinkState::Ready(handle),
                    other => other,
                };
                tracing::debug!("Handle {} ready", id);
                if self.pending.is_some() {
                    self.transmit();
                }
            }
            TransportEvent::Failed(e) => {
                tracing::error!("Handle {} failed to connect: {}", id, e);
                self.fail(e);
            }
            TransportEvent::Cancelled => {
                tracing::debug!("Handle {} cancelled", id);
                self.complete(Err(SessionError::Cancelled));
                self.teardown(LinkState::Terminal(TerminalReason::Cancelled));
            }
            TransportEvent::Sent(n) => {
                tracing::debug!("Handle {} sent {} bytes", id, n);
            }
            TransportEvent::SendFailed(e) => {
                tracing::error!("Handle {} send failed: {}", id, e);
                self.fail(e);
            }
            TransportEvent::Received(received) => self.on_received(received),
            TransportEvent::ReceiveFailed(e) => {
                tracing::error!("Handle {} receive failed: {}", id, e);
                self.fail(e);
            }
        }
    }

    /// Accumulate a chunk and decide whether the response is finished.
    fn on_received(&mut self, received: Received) {
        let Some(buffer) = self.receive_buffer.as_mut() else {
            return;
        };
        buffer.push(&received.data);

        let end_of_stream = received.is_complete || received.data.is_empty();
        if end_of_stream || buffer.is_terminated() {
            if let Some(buffer) = self.receive_buffer.take() {
                let response = buffer.freeze();
                tracing::debug!(
                    "Response complete ({} bytes, end of stream: {})",
                    response.len(),
                    end_of_stream
                );
                self.complete(Ok(response));
            }
            self.teardown(LinkState::NotConnected);
            return;
        }

        let next_receive = match &self.link {
            LinkState::Ready(handle) => Some(handle.receive(self.config.receive_chunk_size())),
            _ => None,
        };

        match next_receive {
            Some(Ok(())) => {}
            Some(Err(e)) => self.fail(e),
            // Left to the deadline.
            None => tracing::warn!("Link no longer ready; response left pending"),
        }
    }

    // ------------------------------------------------------------------
    // Completion, timeout and cancellation
    // ------------------------------------------------------------------

    fn on_deadline(&mut self, operation: OperationId) {
        if self.pending.as_ref().map(|p| p.id) != Some(operation) {
            return;
        }
        tracing::debug!("Operation {} timed out", operation);
        self.complete(Err(SessionError::Timeout));
        self.teardown(LinkState::Terminal(TerminalReason::Cancelled));
    }

    /// The caller dropped its `send` future; free the session for the next one.
    fn on_caller_gone(&mut self) {
        if let Some(pending) = &self.pending {
            tracing::debug!("Caller of operation {} went away", pending.id);
        }
        self.cancel();
    }

    fn cancel(&mut self) {
        if self.pending.is_some() {
            tracing::debug!("Cancelling in-flight operation");
            self.complete(Err(SessionError::Cancelled));
        }
        let next = if self.link.handle().is_some() {
            LinkState::Terminal(TerminalReason::Cancelled)
        } else {
            std::mem::replace(&mut self.link, LinkState::NotConnected)
        };
        self.teardown(next);
    }

    fn fail(&mut self, error: std::io::Error) {
        self.complete(Err(SessionError::ConnectionFailed(error)));
        self.teardown(LinkState::Terminal(TerminalReason::Failed));
    }

    /// Resolve the pending operation, if any. Later calls are no-ops.
    ///
    /// A result produced after the deadline has passed resolves as
    /// `Timeout`, whichever path produced it.
    fn complete(&mut self, result: Result<Bytes>) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        pending.timer.abort();
        self.receive_buffer = None;

        let result = match result {
            Err(SessionError::Timeout) => Err(SessionError::Timeout),
            _ if Instant::now() >= pending.deadline => Err(SessionError::Timeout),
            other => other,
        };

        match &result {
            Ok(response) => {
                tracing::debug!("Operation {} succeeded ({} bytes)", pending.id, response.len())
            }
            Err(e) => tracing::debug!("Operation {} ended: {}", pending.id, e),
        }

        if pending.gate.send(result).is_err() {
            tracing::debug!("Caller of operation {} is gone", pending.id);
        }
    }

    /// Close the current handle (if any), clear per-operation state and
    /// move the link to `next`.
    fn teardown(&mut self, next: LinkState) {
        let previous = std::mem::replace(&mut self.link, next);
        if let LinkState::Connecting(handle) | LinkState::Ready(handle) = previous {
            handle.close();
        }
        self.receive_buffer = None;
        self.current_message.clear();
    }
}
