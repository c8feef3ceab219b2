//! Subscription lifecycle against a scripted in-memory transport.
//!
//! Time is paused, so every reconnect delay, keep-alive and connect timeout
//! is observed at its exact virtual instant.
//!
//! Run with: cargo test -p znap --test feed_subscriber

use async_trait::async_trait;
use futures::{Sink, StreamExt};
use pretty_assertions::assert_eq;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Once};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, timeout};
use tracing_subscriber::EnvFilter;
use url::Url;
use znap::{
    ConnectionState, FeedConnection, FeedEvent, FeedSubscriber, FeedTransport, FeedUpdate, Frame,
    FrameSink, PING_FRAME, Result, ZnapConfig, ZnapError,
};

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}

/// What the next connection attempt does.
enum Script {
    Open,
    /// Open, but the outbound half never accepts a frame.
    Stall,
    Refuse,
    Hang,
}

#[derive(Debug, Clone, PartialEq)]
enum Sent {
    Text(String, Instant),
    Close,
}

/// Server half of an open scripted connection.
struct ServerSide {
    inbound: mpsc::UnboundedSender<Result<Frame>>,
    sent: mpsc::UnboundedReceiver<Sent>,
}

impl ServerSide {
    fn push(&self, text: &str) {
        self.inbound.send(Ok(Frame::Text(text.to_string()))).unwrap();
    }

    fn close(&self) {
        self.inbound.send(Ok(Frame::Close)).unwrap();
    }

    fn fail(&self) {
        self.inbound
            .send(Err(ZnapError::WebSocket("connection reset".into())))
            .unwrap();
    }

    fn drain_sent(&mut self) -> Vec<Sent> {
        let mut out = Vec::new();
        while let Ok(sent) = self.sent.try_recv() {
            out.push(sent);
        }
        out
    }
}

struct Attempt {
    at: Instant,
    url: Url,
    api_key: Option<String>,
    server: Option<ServerSide>,
}

struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    attempts: mpsc::UnboundedSender<Attempt>,
}

impl ScriptedTransport {
    /// Runs `scripts` in order, then refuses every further attempt.
    fn new(scripts: impl IntoIterator<Item = Script>) -> (Self, mpsc::UnboundedReceiver<Attempt>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            attempts: tx,
        };
        (transport, rx)
    }
}

#[async_trait]
impl FeedTransport for ScriptedTransport {
    async fn connect(&self, url: &Url, api_key: Option<&str>) -> Result<FeedConnection> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Refuse);
        let mut attempt = Attempt {
            at: Instant::now(),
            url: url.clone(),
            api_key: api_key.map(str::to_string),
            server: None,
        };

        match script {
            Script::Refuse => {
                let _ = self.attempts.send(attempt);
                Err(ZnapError::WebSocket("connection refused".into()))
            }
            Script::Hang => {
                let _ = self.attempts.send(attempt);
                futures::future::pending().await
            }
            Script::Open | Script::Stall => {
                let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
                let (sent_tx, sent_rx) = mpsc::unbounded_channel();
                attempt.server = Some(ServerSide {
                    inbound: inbound_tx,
                    sent: sent_rx,
                });
                let _ = self.attempts.send(attempt);

                let frames = futures::stream::unfold(inbound_rx, |mut rx| async move {
                    rx.recv().await.map(|frame| (frame, rx))
                })
                .boxed();
                let sink: FrameSink = match script {
                    Script::Stall => Box::pin(StalledSink),
                    _ => Box::pin(RecordingSink { tx: sent_tx }),
                };
                Ok(FeedConnection { frames, sink })
            }
        }
    }
}

struct RecordingSink {
    tx: mpsc::UnboundedSender<Sent>,
}

impl Sink<String> for RecordingSink {
    type Error = ZnapError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: String) -> Result<()> {
        let _ = self.tx.send(Sent::Text(item, Instant::now()));
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        let _ = self.tx.send(Sent::Close);
        Poll::Ready(Ok(()))
    }
}

/// Outbound half of a peer that stopped reading.
struct StalledSink;

impl Sink<String> for StalledSink {
    type Error = ZnapError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Pending
    }

    fn start_send(self: Pin<&mut Self>, _item: String) -> Result<()> {
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Pending
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Pending
    }
}

fn config(api_key: Option<&str>) -> Arc<ZnapConfig> {
    Arc::new(ZnapConfig::new("https://api.znap.test", api_key.map(str::to_string)).unwrap())
}

fn post_frame(id: &str) -> String {
    serde_json::json!({
        "type": "new_post",
        "data": { "id": id, "title": "t", "content": "<p>c</p>", "author_username": "alice" }
    })
    .to_string()
}

/// A forced close schedules exactly one reconnect, `reconnect_delay` later.
#[tokio::test(start_paused = true)]
async fn reconnects_once_after_forced_close() {
    init_tracing();
    let (transport, mut attempts) = ScriptedTransport::new([Script::Open, Script::Open]);
    let subscriber = FeedSubscriber::with_transport(config(None), transport).unwrap();
    let (tx, mut updates) = mpsc::unbounded_channel();
    let start = Instant::now();
    let _sub = subscriber.subscribe(tx);

    let first = attempts.recv().await.unwrap();
    assert_eq!(first.at, start);
    let server = first.server.unwrap();
    assert_eq!(updates.recv().await, Some(FeedUpdate::Connected));

    sleep(Duration::from_secs(12)).await;
    server.close();
    assert_eq!(updates.recv().await, Some(FeedUpdate::Disconnected));
    let closed_at = Instant::now();

    let second = attempts.recv().await.unwrap();
    assert_eq!(second.at - closed_at, Duration::from_secs(5));
    assert_eq!(updates.recv().await, Some(FeedUpdate::Connected));

    sleep(Duration::from_secs(120)).await;
    assert!(attempts.try_recv().is_err(), "only one reconnect expected");
    drop(second);
}

/// The keep-alive of a closed connection never fires; the new connection
/// gets its own, `ping_interval` after it opened.
#[tokio::test(start_paused = true)]
async fn keepalive_is_scoped_to_the_connection() {
    init_tracing();
    let (transport, mut attempts) = ScriptedTransport::new([Script::Open, Script::Open]);
    let subscriber = FeedSubscriber::with_transport(config(None), transport).unwrap();
    let (tx, mut updates) = mpsc::unbounded_channel();
    let start = Instant::now();
    let _sub = subscriber.subscribe(tx);

    let mut first = attempts.recv().await.unwrap().server.unwrap();
    assert_eq!(updates.recv().await, Some(FeedUpdate::Connected));
    first.close();
    assert_eq!(updates.recv().await, Some(FeedUpdate::Disconnected));

    let second = attempts.recv().await.unwrap();
    assert_eq!(second.at - start, Duration::from_secs(5));
    let mut second = second.server.unwrap();

    let ping = second.sent.recv().await.unwrap();
    assert_eq!(
        ping,
        Sent::Text(PING_FRAME.to_string(), start + Duration::from_secs(35))
    );

    // Past the instant the first connection's timer would have fired.
    assert_eq!(first.drain_sent(), vec![Sent::Close]);

    let next = second.sent.recv().await.unwrap();
    assert_eq!(
        next,
        Sent::Text(PING_FRAME.to_string(), start + Duration::from_secs(65))
    );
}

/// Unparseable and unknown frames are dropped without a callback and
/// without touching the connection.
#[tokio::test(start_paused = true)]
async fn noise_frames_are_ignored() {
    init_tracing();
    let (transport, mut attempts) = ScriptedTransport::new([Script::Open]);
    let subscriber = FeedSubscriber::with_transport(config(None), transport).unwrap();
    let (tx, mut updates) = mpsc::unbounded_channel();
    let sub = subscriber.subscribe(tx);

    let server = attempts.recv().await.unwrap().server.unwrap();
    assert_eq!(updates.recv().await, Some(FeedUpdate::Connected));

    server.push("definitely not json");
    server.push(r#"{"type":"typing","data":{"who":"bob"}}"#);
    server.push(r#"{"type":"new_post","data":[]}"#);
    server.push(&post_frame("p1"));
    server.push(r#"{"type":"pong"}"#);

    match updates.recv().await {
        Some(FeedUpdate::Event(FeedEvent::NewPost(post))) => assert_eq!(post.id, "p1"),
        other => panic!("expected the post, got {other:?}"),
    }
    assert_eq!(
        updates.recv().await,
        Some(FeedUpdate::Event(FeedEvent::Pong))
    );
    assert_eq!(sub.state(), ConnectionState::Connected);
    assert!(attempts.try_recv().is_err());
}

/// Events reach the handler in arrival order.
#[tokio::test(start_paused = true)]
async fn events_arrive_in_order() {
    init_tracing();
    let (transport, mut attempts) = ScriptedTransport::new([Script::Open]);
    let subscriber = FeedSubscriber::with_transport(config(None), transport).unwrap();
    let (tx, mut updates) = mpsc::unbounded_channel();
    let _sub = subscriber.subscribe(tx);

    let server = attempts.recv().await.unwrap().server.unwrap();
    assert_eq!(updates.recv().await, Some(FeedUpdate::Connected));

    server.push(&post_frame("p1"));
    server.push(
        r#"{"type":"new_comment","data":{"id":"c1","post_id":"p1","content":"<p>hi</p>","author_username":"bob"}}"#,
    );
    server.push(&post_frame("p2"));

    let mut seen = Vec::new();
    for _ in 0..3 {
        match updates.recv().await {
            Some(FeedUpdate::Event(FeedEvent::NewPost(post))) => seen.push(post.id),
            Some(FeedUpdate::Event(FeedEvent::NewComment(c))) => {
                seen.push(format!("{}/{}", c.post_id, c.comment.id))
            }
            other => panic!("unexpected update {other:?}"),
        }
    }
    assert_eq!(seen, vec!["p1", "p1/c1", "p2"]);
}

/// Unsubscribing twice closes the connection once and stops all retries.
#[tokio::test(start_paused = true)]
async fn unsubscribe_is_idempotent() {
    init_tracing();
    let (transport, mut attempts) = ScriptedTransport::new([Script::Open]);
    let subscriber = FeedSubscriber::with_transport(config(None), transport).unwrap();
    let (tx, mut updates) = mpsc::unbounded_channel();
    let sub = subscriber.subscribe(tx);

    let mut server = attempts.recv().await.unwrap().server.unwrap();
    assert_eq!(updates.recv().await, Some(FeedUpdate::Connected));

    sub.unsubscribe();
    sub.unsubscribe();
    assert!(sub.is_cancelled());
    let mut states = sub.state_changes();
    sub.shutdown().await;

    assert_eq!(*states.borrow_and_update(), ConnectionState::Closed);
    assert_eq!(server.drain_sent(), vec![Sent::Close]);
    // The handler went away with the task; no Disconnected after a cancel.
    assert_eq!(updates.recv().await, None);

    sleep(Duration::from_secs(60)).await;
    assert!(attempts.try_recv().is_err());
}

/// Cancelling during the reconnect delay drops the pending attempt.
#[tokio::test(start_paused = true)]
async fn unsubscribe_cancels_pending_reconnect() {
    init_tracing();
    let (transport, mut attempts) = ScriptedTransport::new([Script::Refuse]);
    let subscriber = FeedSubscriber::with_transport(config(None), transport).unwrap();
    let (tx, _updates) = mpsc::unbounded_channel();
    let sub = subscriber.subscribe(tx);

    attempts.recv().await.unwrap();
    let mut states = sub.state_changes();
    states
        .wait_for(|s| *s == ConnectionState::Disconnected)
        .await
        .unwrap();

    sleep(Duration::from_secs(2)).await;
    sub.unsubscribe();
    sleep(Duration::from_secs(30)).await;

    assert!(attempts.try_recv().is_err());
    assert_eq!(*states.borrow(), ConnectionState::Closed);
}

/// A refused endpoint is retried every `reconnect_delay`, forever.
#[tokio::test(start_paused = true)]
async fn refused_connections_retry_at_fixed_delay() {
    init_tracing();
    let (transport, mut attempts) = ScriptedTransport::new([]);
    let subscriber = FeedSubscriber::with_transport(config(None), transport).unwrap();
    let (tx, mut updates) = mpsc::unbounded_channel();
    let start = Instant::now();
    let _sub = subscriber.subscribe(tx);

    let mut offsets = Vec::new();
    for _ in 0..4 {
        let attempt = attempts.recv().await.unwrap();
        offsets.push((attempt.at - start).as_secs());
    }
    assert_eq!(offsets, vec![0, 5, 10, 15]);
    // Never connected, so no callbacks.
    assert!(updates.try_recv().is_err());
}

/// A connection attempt that never completes is abandoned after
/// `connect_timeout` and retried after the usual delay.
#[tokio::test(start_paused = true)]
async fn hung_connect_times_out() {
    init_tracing();
    let (transport, mut attempts) = ScriptedTransport::new([Script::Hang, Script::Open]);
    let subscriber = FeedSubscriber::with_transport(config(None), transport).unwrap();
    let (tx, mut updates) = mpsc::unbounded_channel();
    let start = Instant::now();
    let sub = subscriber.subscribe(tx);

    assert_eq!(attempts.recv().await.unwrap().at, start);
    let second = attempts.recv().await.unwrap();
    assert_eq!(second.at - start, Duration::from_secs(15));
    assert_eq!(updates.recv().await, Some(FeedUpdate::Connected));
    assert_eq!(sub.state(), ConnectionState::Connected);
}

/// A transport error ends the connection like a close does.
#[tokio::test(start_paused = true)]
async fn stream_error_triggers_reconnect() {
    init_tracing();
    let (transport, mut attempts) = ScriptedTransport::new([Script::Open, Script::Open]);
    let subscriber = FeedSubscriber::with_transport(config(None), transport).unwrap();
    let (tx, mut updates) = mpsc::unbounded_channel();
    let _sub = subscriber.subscribe(tx);

    let first = attempts.recv().await.unwrap();
    assert_eq!(updates.recv().await, Some(FeedUpdate::Connected));
    first.server.as_ref().unwrap().fail();
    assert_eq!(updates.recv().await, Some(FeedUpdate::Disconnected));
    let failed_at = Instant::now();

    let second = attempts.recv().await.unwrap();
    assert_eq!(second.at - failed_at, Duration::from_secs(5));
}

/// Dropping the server half ends the inbound stream, which counts as a close.
#[tokio::test(start_paused = true)]
async fn dropped_connection_triggers_reconnect() {
    init_tracing();
    let (transport, mut attempts) = ScriptedTransport::new([Script::Open, Script::Open]);
    let subscriber = FeedSubscriber::with_transport(config(None), transport).unwrap();
    let (tx, mut updates) = mpsc::unbounded_channel();
    let _sub = subscriber.subscribe(tx);

    let first = attempts.recv().await.unwrap();
    assert_eq!(updates.recv().await, Some(FeedUpdate::Connected));
    drop(first);
    assert_eq!(updates.recv().await, Some(FeedUpdate::Disconnected));
    assert!(attempts.recv().await.unwrap().server.is_some());
}

/// State follows Connecting -> Connected -> Disconnected -> Connecting.
#[tokio::test(start_paused = true)]
async fn state_tracks_lifecycle() {
    init_tracing();
    let (transport, mut attempts) = ScriptedTransport::new([Script::Open, Script::Hang]);
    let subscriber = FeedSubscriber::with_transport(config(None), transport).unwrap();
    let (tx, mut updates) = mpsc::unbounded_channel();
    let sub = subscriber.subscribe(tx);

    let first = attempts.recv().await.unwrap();
    assert_eq!(updates.recv().await, Some(FeedUpdate::Connected));
    assert_eq!(sub.state(), ConnectionState::Connected);

    first.server.as_ref().unwrap().close();
    assert_eq!(updates.recv().await, Some(FeedUpdate::Disconnected));
    assert_eq!(sub.state(), ConnectionState::Disconnected);

    attempts.recv().await.unwrap();
    assert_eq!(sub.state(), ConnectionState::Connecting);
}

/// The configured key and the derived streaming URL reach the transport.
#[tokio::test(start_paused = true)]
async fn transport_receives_url_and_key() {
    init_tracing();
    let (transport, mut attempts) = ScriptedTransport::new([Script::Refuse]);
    let subscriber =
        FeedSubscriber::with_transport(config(Some("znap_secret")), transport).unwrap();
    let (tx, _updates) = mpsc::unbounded_channel();
    let _sub = subscriber.subscribe(tx);

    let attempt = attempts.recv().await.unwrap();
    assert_eq!(attempt.url.as_str(), "wss://api.znap.test/");
    assert_eq!(attempt.api_key.as_deref(), Some("znap_secret"));
}

/// Shutdown completes even while a keep-alive is stuck behind a peer that
/// stopped reading.
#[tokio::test(start_paused = true)]
async fn shutdown_is_not_blocked_by_stalled_keepalive() {
    init_tracing();
    let (transport, mut attempts) = ScriptedTransport::new([Script::Stall]);
    let subscriber = FeedSubscriber::with_transport(config(None), transport).unwrap();
    let (tx, mut updates) = mpsc::unbounded_channel();
    let sub = subscriber.subscribe(tx);

    let _server = attempts.recv().await.unwrap().server.unwrap();
    assert_eq!(updates.recv().await, Some(FeedUpdate::Connected));

    // First keep-alive is due at 30s and never gets written.
    sleep(Duration::from_secs(31)).await;
    let mut states = sub.state_changes();
    timeout(Duration::from_secs(10), sub.shutdown())
        .await
        .expect("shutdown waited on a stalled keep-alive");
    assert_eq!(*states.borrow_and_update(), ConnectionState::Closed);
}

/// A keep-alive that cannot be written within one ping interval drops the
/// connection, and the usual reconnect follows.
#[tokio::test(start_paused = true)]
async fn stalled_keepalive_triggers_reconnect() {
    init_tracing();
    let (transport, mut attempts) = ScriptedTransport::new([Script::Stall, Script::Open]);
    let subscriber = FeedSubscriber::with_transport(config(None), transport).unwrap();
    let (tx, mut updates) = mpsc::unbounded_channel();
    let start = Instant::now();
    let _sub = subscriber.subscribe(tx);

    let _stalled = attempts.recv().await.unwrap().server.unwrap();
    assert_eq!(updates.recv().await, Some(FeedUpdate::Connected));
    assert_eq!(updates.recv().await, Some(FeedUpdate::Disconnected));
    // Ping due at 30s, abandoned at 60s, close bounded by 2s, then the delay.
    let second = attempts.recv().await.unwrap();
    assert_eq!(second.at - start, Duration::from_secs(67));
    assert_eq!(updates.recv().await, Some(FeedUpdate::Connected));
}
