//! Integration tests for linewire-client.
//!
//! Sessions run over in-memory `tokio::io::duplex` streams handed out by a
//! scripted connector, so each test plays the server side directly, plus a
//! few runs against real loopback TCP listeners.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use linewire_client::transport::ConnectProgress;
use linewire_client::{Connector, LinkPhase, Session, SessionConfig, SessionError};
use tokio::io::{duplex, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// What the scripted connector does for one connect.
enum Step {
    Accept,
    Fail(io::ErrorKind),
    Interrupt,
    WaitThenAccept,
    Hang,
    /// Connect, but every write fails.
    FailWrites,
    /// Connect, but every read fails.
    FailReads,
    /// Block the connecting thread, then fail. The handle task cannot be
    /// aborted while blocked, so its `Failed` is reported after teardown.
    BlockThenFail(Duration),
}

/// Which side of a scripted stream is broken.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Fault {
    None,
    Write,
    Read,
}

/// Duplex stream with an optional injected I/O failure.
struct ScriptedStream {
    inner: DuplexStream,
    fault: Fault,
}

impl AsyncRead for ScriptedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.fault == Fault::Read {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "scripted")));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for ScriptedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.fault == Fault::Write {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "scripted")));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Connector that follows a script and hands the peer ends to the test.
struct ScriptedConnector {
    script: Mutex<VecDeque<Step>>,
    peers: mpsc::UnboundedSender<DuplexStream>,
    connects: Arc<AtomicUsize>,
}

#[async_trait]
impl Connector for ScriptedConnector {
    type Stream = ScriptedStream;

    async fn connect(
        &self,
        _host: &str,
        _port: u16,
        progress: &ConnectProgress,
    ) -> io::Result<ScriptedStream> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Accept);

        match step {
            Step::Accept => Ok(self.accept(Fault::None)),
            Step::Fail(kind) => Err(io::Error::new(kind, "scripted failure")),
            Step::Interrupt => Err(io::Error::new(io::ErrorKind::Interrupted, "scripted cancel")),
            Step::WaitThenAccept => {
                progress.waiting(io::Error::new(io::ErrorKind::ConnectionRefused, "retrying"));
                Ok(self.accept(Fault::None))
            }
            Step::Hang => std::future::pending().await,
            Step::FailWrites => Ok(self.accept(Fault::Write)),
            Step::FailReads => Ok(self.accept(Fault::Read)),
            Step::BlockThenFail(delay) => {
                std::thread::sleep(delay);
                Err(io::Error::new(io::ErrorKind::TimedOut, "late failure"))
            }
        }
    }
}

impl ScriptedConnector {
    fn accept(&self, fault: Fault) -> ScriptedStream {
        let (client, server) = duplex(64 * 1024);
        let _ = self.peers.send(server);
        ScriptedStream {
            inner: client,
            fault,
        }
    }
}

struct Harness {
    session: Session,
    peers: mpsc::UnboundedReceiver<DuplexStream>,
    connects: Arc<AtomicUsize>,
}

impl Harness {
    fn new(config: SessionConfig, script: Vec<Step>) -> Self {
        let (peers_tx, peers) = mpsc::unbounded_channel();
        let connects = Arc::new(AtomicUsize::new(0));
        let connector = ScriptedConnector {
            script: Mutex::new(script.into()),
            peers: peers_tx,
            connects: connects.clone(),
        };

        Self {
            session: Session::with_connector("scripted", 9, config, connector),
            peers,
            connects,
        }
    }

    async fn next_peer(&mut self) -> DuplexStream {
        tokio::time::timeout(Duration::from_secs(5), self.peers.recv())
            .await
            .expect("no connection within 5s")
            .expect("connector dropped")
    }
}

fn patterns(list: &[&str]) -> SessionConfig {
    SessionConfig::builder()
        .termination_patterns(list.iter().copied())
        .build()
        .unwrap()
}

/// Read one request line (including the terminator) from the peer side.
async fn read_line(peer: &mut DuplexStream) -> String {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        peer.read_exact(&mut byte).await.unwrap();
        line.push(byte[0]);
        if byte[0] == b'\n' {
            return String::from_utf8(line).unwrap();
        }
    }
}

async fn wait_until_in_progress(session: &Session) {
    for _ in 0..500 {
        if session.status().await.unwrap().in_progress {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("operation never became in progress");
}

/// Test that a pattern in the response completes with the bytes so far.
#[tokio::test]
async fn test_termination_pattern_completes() {
    let mut harness = Harness::new(patterns(&["DONE"]), vec![]);
    let session = harness.session.clone();
    let call = tokio::spawn(async move { session.send("PING").await });

    let mut peer = harness.next_peer().await;
    assert_eq!(read_line(&mut peer).await, "PING\n");

    peer.write_all(b"line one\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    peer.write_all(b"all done\n").await.unwrap();

    let response = call.await.unwrap().unwrap();
    assert_eq!(&response[..], b"line one\nall done\n");
}

/// Test that a response without any pattern completes at end of stream.
#[tokio::test]
async fn test_end_of_stream_completes_with_everything() {
    let mut harness = Harness::new(patterns(&["DONE"]), vec![]);
    let session = harness.session.clone();
    let call = tokio::spawn(async move { session.send("PING").await });

    let mut peer = harness.next_peer().await;
    read_line(&mut peer).await;
    peer.write_all(b"no marker here\n").await.unwrap();
    peer.write_all(b"still nothing").await.unwrap();
    drop(peer);

    let response = call.await.unwrap().unwrap();
    assert_eq!(&response[..], b"no marker here\nstill nothing");
}

/// Test that "<pattern> <message>" terminates in strict mode while the bare
/// pattern does not.
#[tokio::test]
async fn test_strict_matching_ignores_bare_pattern() {
    let config = SessionConfig::builder()
        .termination_patterns(["err"])
        .match_bare_pattern(false)
        .build()
        .unwrap();
    let mut harness = Harness::new(config, vec![]);
    let session = harness.session.clone();
    let call = tokio::spawn(async move { session.send("GET").await });

    let mut peer = harness.next_peer().await;
    read_line(&mut peer).await;
    peer.write_all(b"X-Error-Count: 0\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!call.is_finished());

    peer.write_all(b"ERR GET\n").await.unwrap();

    let response = call.await.unwrap().unwrap();
    assert_eq!(&response[..], b"X-Error-Count: 0\nERR GET\n");
}

/// Test that small receive chunks still accumulate the full response.
#[tokio::test]
async fn test_small_chunks_accumulate() {
    let config = SessionConfig::builder()
        .receive_chunk_size(3)
        .termination_patterns(["end"])
        .line_terminator("\r\n")
        .build()
        .unwrap();
    let mut harness = Harness::new(config, vec![]);
    let session = harness.session.clone();
    let call = tokio::spawn(async move { session.send("list").await });

    let mut peer = harness.next_peer().await;
    assert_eq!(read_line(&mut peer).await, "list\r\n");
    peer.write_all(b"alpha beta gamma END").await.unwrap();

    let response = call.await.unwrap().unwrap();
    assert_eq!(&response[..], b"alpha beta gamma END");
}

/// Test that a second send while one is in flight is rejected, not queued.
#[tokio::test]
async fn test_single_flight() {
    let harness = Harness::new(SessionConfig::default(), vec![Step::Hang]);
    let session = harness.session.clone();
    let first = tokio::spawn(async move {
        session
            .send_with_timeout("a", Duration::from_secs(10))
            .await
    });

    wait_until_in_progress(&harness.session).await;

    let second = harness.session.send("b").await;
    assert!(matches!(second, Err(SessionError::InvalidState(_))));

    harness.session.cancel();
    let first = first.await.unwrap();
    assert!(matches!(first, Err(SessionError::Cancelled)));
}

/// Test that cancel resolves a long send promptly.
#[tokio::test]
async fn test_cancellation_latency() {
    let mut harness = Harness::new(SessionConfig::default(), vec![]);
    let session = harness.session.clone();
    let started = Instant::now();
    let call = tokio::spawn(async move {
        session
            .send_with_timeout("slow", Duration::from_secs(10))
            .await
    });

    let mut peer = harness.next_peer().await;
    read_line(&mut peer).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    harness.session.cancel();
    let result = call.await.unwrap();

    assert!(matches!(result, Err(SessionError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(2));

    // The connection is closed as part of cancelling.
    let mut buf = [0u8; 8];
    assert_eq!(peer.read(&mut buf).await.unwrap(), 0);

    let status = harness.session.status().await.unwrap();
    assert_eq!(status.link, LinkPhase::Cancelled);
    assert!(!status.in_progress);
}

/// Test that repeated cancels are harmless.
#[tokio::test]
async fn test_cancel_is_idempotent() {
    let harness = Harness::new(SessionConfig::default(), vec![Step::Hang]);
    let session = harness.session.clone();
    let call = tokio::spawn(async move {
        session
            .send_with_timeout("x", Duration::from_secs(10))
            .await
    });

    wait_until_in_progress(&harness.session).await;
    harness.session.cancel();
    harness.session.cancel();
    harness.session.clone().cancel();

    assert!(matches!(call.await.unwrap(), Err(SessionError::Cancelled)));
    assert!(!harness.session.status().await.unwrap().in_progress);
}

/// Test that a timeout discards partial bytes and closes the connection.
#[tokio::test]
async fn test_timeout_tears_down_connection() {
    let mut harness = Harness::new(patterns(&["DONE"]), vec![]);
    let session = harness.session.clone();
    let call = tokio::spawn(async move {
        session
            .send_with_timeout("PING", Duration::from_millis(200))
            .await
    });

    let mut peer = harness.next_peer().await;
    read_line(&mut peer).await;
    peer.write_all(b"partial").await.unwrap();

    let result = call.await.unwrap();
    assert!(matches!(result, Err(SessionError::Timeout)));

    let mut buf = [0u8; 8];
    assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
}

/// Test that a connection failure does not wedge the session.
#[tokio::test]
async fn test_reuse_after_connection_failure() {
    let mut harness = Harness::new(
        patterns(&["ok"]),
        vec![Step::Fail(io::ErrorKind::ConnectionRefused)],
    );

    let first = harness.session.send("one").await;
    match first {
        Err(SessionError::ConnectionFailed(e)) => {
            assert_eq!(e.kind(), io::ErrorKind::ConnectionRefused)
        }
        other => panic!("expected connection failure, got {:?}", other),
    }
    assert_eq!(
        harness.session.status().await.unwrap().link,
        LinkPhase::Failed
    );

    let session = harness.session.clone();
    let call = tokio::spawn(async move { session.send("two").await });
    let mut peer = harness.next_peer().await;
    assert_eq!(read_line(&mut peer).await, "two\n");
    peer.write_all(b"ok\n").await.unwrap();

    assert_eq!(&call.await.unwrap().unwrap()[..], b"ok\n");
    assert_eq!(harness.connects.load(Ordering::SeqCst), 2);
}

/// Test that a transport-reported cancellation resolves as Cancelled and
/// the next send reconnects.
#[tokio::test]
async fn test_reuse_after_transport_cancel() {
    let mut harness = Harness::new(patterns(&["ok"]), vec![Step::Interrupt]);

    let first = harness.session.send("one").await;
    assert!(matches!(first, Err(SessionError::Cancelled)));

    let session = harness.session.clone();
    let call = tokio::spawn(async move { session.send("two").await });
    let mut peer = harness.next_peer().await;
    read_line(&mut peer).await;
    peer.write_all(b"OK").await.unwrap();

    assert_eq!(&call.await.unwrap().unwrap()[..], b"OK");
    assert_eq!(harness.connects.load(Ordering::SeqCst), 2);
}

/// Test that each send after a cancel gets a fresh connection.
#[tokio::test]
async fn test_reuse_after_cancel() {
    let mut harness = Harness::new(patterns(&["ok"]), vec![Step::Hang]);
    let session = harness.session.clone();
    let first = tokio::spawn(async move {
        session
            .send_with_timeout("one", Duration::from_secs(10))
            .await
    });

    wait_until_in_progress(&harness.session).await;
    harness.session.cancel();
    assert!(matches!(first.await.unwrap(), Err(SessionError::Cancelled)));

    let session = harness.session.clone();
    let call = tokio::spawn(async move { session.send("two").await });
    let mut peer = harness.next_peer().await;
    read_line(&mut peer).await;
    peer.write_all(b"ok").await.unwrap();

    assert_eq!(&call.await.unwrap().unwrap()[..], b"ok");
    assert_eq!(harness.connects.load(Ordering::SeqCst), 2);
}

/// Test that a transient Waiting report does not end the operation.
#[tokio::test]
async fn test_waiting_is_not_fatal() {
    let mut harness = Harness::new(patterns(&["ok"]), vec![Step::WaitThenAccept]);
    let session = harness.session.clone();
    let call = tokio::spawn(async move { session.send("hi").await });

    let mut peer = harness.next_peer().await;
    read_line(&mut peer).await;
    peer.write_all(b"ok").await.unwrap();

    assert_eq!(&call.await.unwrap().unwrap()[..], b"ok");
}

/// Test that a failed write ends the send with ConnectionFailed and closes
/// the connection.
#[tokio::test]
async fn test_write_failure_fails_operation() {
    let mut harness = Harness::new(patterns(&["ok"]), vec![Step::FailWrites]);
    let session = harness.session.clone();
    let call = tokio::spawn(async move { session.send("one").await });

    let mut peer = harness.next_peer().await;
    match call.await.unwrap() {
        Err(SessionError::ConnectionFailed(e)) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
        other => panic!("expected connection failure, got {:?}", other),
    }

    let mut buf = [0u8; 8];
    assert_eq!(peer.read(&mut buf).await.unwrap(), 0);

    let status = harness.session.status().await.unwrap();
    assert_eq!(status.link, LinkPhase::Failed);
    assert!(!status.in_progress);
}

/// Test that a failed read ends the send with ConnectionFailed and the next
/// send reconnects.
#[tokio::test]
async fn test_receive_failure_fails_operation() {
    let mut harness = Harness::new(patterns(&["ok"]), vec![Step::FailReads]);

    match harness.session.send("one").await {
        Err(SessionError::ConnectionFailed(e)) => {
            assert_eq!(e.kind(), io::ErrorKind::ConnectionReset)
        }
        other => panic!("expected connection failure, got {:?}", other),
    }
    let _broken = harness.next_peer().await;
    assert_eq!(
        harness.session.status().await.unwrap().link,
        LinkPhase::Failed
    );

    let session = harness.session.clone();
    let call = tokio::spawn(async move { session.send("two").await });
    let mut peer = harness.next_peer().await;
    assert_eq!(read_line(&mut peer).await, "two\n");
    peer.write_all(b"ok").await.unwrap();

    assert_eq!(&call.await.unwrap().unwrap()[..], b"ok");
    assert_eq!(harness.connects.load(Ordering::SeqCst), 2);
}

/// Test that an event from a torn-down handle does not touch the operation
/// running on its replacement.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stale_handle_event_is_discarded() {
    let mut harness = Harness::new(
        patterns(&["ok"]),
        vec![Step::BlockThenFail(Duration::from_millis(300))],
    );
    let session = harness.session.clone();
    let first = tokio::spawn(async move {
        session
            .send_with_timeout("one", Duration::from_secs(10))
            .await
    });

    while harness.connects.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    harness.session.cancel();
    assert!(matches!(first.await.unwrap(), Err(SessionError::Cancelled)));

    let session = harness.session.clone();
    let second = tokio::spawn(async move {
        session
            .send_with_timeout("two", Duration::from_secs(10))
            .await
    });
    let mut peer = harness.next_peer().await;
    assert_eq!(read_line(&mut peer).await, "two\n");

    // The first handle reports its failure while the second is serving.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let status = harness.session.status().await.unwrap();
    assert_eq!(status.link, LinkPhase::Ready);
    assert!(status.in_progress);

    peer.write_all(b"ok").await.unwrap();
    assert_eq!(&second.await.unwrap().unwrap()[..], b"ok");
}

/// Test that dropping a send future frees the session for the next send.
#[tokio::test]
async fn test_dropped_send_frees_session() {
    let mut harness = Harness::new(patterns(&["ok"]), vec![]);

    let abandoned = tokio::time::timeout(
        Duration::from_millis(100),
        harness
            .session
            .send_with_timeout("one", Duration::from_secs(10)),
    )
    .await;
    assert!(abandoned.is_err());

    // The abandoned operation's connection is closed.
    let mut first_peer = harness.next_peer().await;
    assert_eq!(read_line(&mut first_peer).await, "one\n");
    let mut buf = [0u8; 8];
    let closed = tokio::time::timeout(Duration::from_secs(2), first_peer.read(&mut buf)).await;
    assert_eq!(closed.expect("connection left open").unwrap(), 0);

    let session = harness.session.clone();
    let call = tokio::spawn(async move { session.send("two").await });
    let mut peer = harness.next_peer().await;
    assert_eq!(read_line(&mut peer).await, "two\n");
    peer.write_all(b"ok").await.unwrap();

    assert_eq!(&call.await.unwrap().unwrap()[..], b"ok");
    assert_eq!(harness.connects.load(Ordering::SeqCst), 2);
}

/// Test that a send issued right after dropping one is not rejected.
#[tokio::test]
async fn test_send_right_after_dropped_send() {
    let mut harness = Harness::new(patterns(&["ok"]), vec![Step::Hang]);

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        harness
            .session
            .send_with_timeout("one", Duration::from_secs(10)),
    )
    .await;
    assert!(abandoned.is_err());

    let session = harness.session.clone();
    let call = tokio::spawn(async move { session.send("two").await });
    let mut peer = harness.next_peer().await;
    assert_eq!(read_line(&mut peer).await, "two\n");
    peer.write_all(b"ok").await.unwrap();

    assert_eq!(&call.await.unwrap().unwrap()[..], b"ok");
}

/// Test that racing cancel against a response always resolves exactly once.
#[tokio::test]
async fn test_cancel_response_race_resolves_once() {
    let mut harness = Harness::new(patterns(&["ok"]), vec![]);

    for _ in 0..20 {
        let session = harness.session.clone();
        let call = tokio::spawn(async move {
            session
                .send_with_timeout("x", Duration::from_secs(5))
                .await
        });

        let mut peer = harness.next_peer().await;
        read_line(&mut peer).await;
        let _ = peer.write_all(b"ok").await;
        harness.session.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), call)
            .await
            .expect("send never resolved")
            .unwrap();
        match result {
            Ok(response) => assert_eq!(&response[..], b"ok"),
            Err(SessionError::Cancelled) => {}
            Err(e) => panic!("unexpected error {:?}", e),
        }
    }

    assert!(!harness.session.status().await.unwrap().in_progress);
}

/// Test that a 1ns timeout always wins against a real network target.
#[tokio::test]
async fn test_nanosecond_timeout_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let _ = stream.write_all(b"end\n").await;
        }
    });

    let session = Session::new("127.0.0.1", port);
    for _ in 0..5 {
        let result = session.send_with_timeout("x", Duration::from_nanos(1)).await;
        assert!(matches!(result, Err(SessionError::Timeout)));
    }
}

/// Test a refused TCP connection followed by a successful one.
#[tokio::test]
async fn test_tcp_refused_then_served() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let session = Session::new("127.0.0.1", addr.port());
    let first = session.send("x").await;
    assert!(matches!(first, Err(SessionError::ConnectionFailed(_))));

    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        // Port was taken in between; nothing left to check.
        Err(_) => return,
    };
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        stream.write_all(b"err: nope\n").await.unwrap();
    });

    let response = session.send("x").await.unwrap();
    assert_eq!(&response[..], b"err: nope\n");
}

/// Test configuration defaults through the public API.
#[tokio::test]
async fn test_session_defaults() {
    let session = Session::new("example.invalid", 1);
    let config = session.config();

    assert_eq!(config.connection_timeout(), Duration::from_secs(5));
    assert_eq!(config.receive_chunk_size(), 8192);
    assert_eq!(config.termination_patterns(), &["end", "err"]);
}
