//! Live feed subscriber.
//!
//! A [`Subscription`] owns one background task that keeps a streaming
//! connection to the feed endpoint open for as long as the subscription
//! lives:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnected -> (reconnect_delay) -> Connecting ...
//!                                                   \-> Closed (unsubscribe / drop)
//! ```
//!
//! While connected, inbound frames are decoded into [`FeedEvent`]s and handed
//! to the [`FeedHandler`] in arrival order, and a `{"type":"ping"}` frame is
//! sent every `ping_interval`. The keep-alive timer belongs to the connected
//! phase and is dropped whenever that phase ends. A keep-alive that cannot be
//! written within one `ping_interval` ends the connection like an error.
//!
//! Any close, error or failed connection attempt leads to exactly one new
//! attempt after a fixed `reconnect_delay`. There is no backoff growth and no
//! attempt limit: an endpoint that never comes back costs one connection
//! attempt per `reconnect_delay` until the subscription is cancelled.

use crate::client::API_KEY_HEADER;
use crate::config::ZnapConfig;
use crate::error::{Result, ZnapError};
use crate::event::{FeedComment, FeedEvent, PING_FRAME};
use crate::types::Post;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Sink, SinkExt, StreamExt, future};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Floor for `ping_interval`; a zero period is not a valid timer.
pub const MIN_PING_INTERVAL: Duration = Duration::from_millis(10);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Timing knobs for a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedOptions {
    /// Interval between keep-alive frames while connected.
    pub ping_interval: Duration,
    /// Fixed wait before every reconnect attempt.
    pub reconnect_delay: Duration,
    /// Upper bound on a single connection attempt.
    pub connect_timeout: Duration,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Connection state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected; a reconnect is pending unless the subscription is closed.
    Disconnected,
    /// Connection attempt in flight.
    Connecting,
    /// Connected and receiving frames.
    Connected,
    /// Cancelled. Terminal.
    Closed,
}

/// Inbound frame from a [`FeedTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close,
}

pub type FrameStream = BoxStream<'static, Result<Frame>>;
pub type FrameSink = Pin<Box<dyn Sink<String, Error = ZnapError> + Send>>;

/// An open duplex connection: inbound frames and an outbound text sink.
pub struct FeedConnection {
    pub frames: FrameStream,
    pub sink: FrameSink,
}

/// Opens streaming connections for a subscriber.
#[async_trait]
pub trait FeedTransport: Send + Sync + 'static {
    async fn connect(&self, url: &Url, api_key: Option<&str>) -> Result<FeedConnection>;
}

/// WebSocket transport (tokio-tungstenite).
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

#[async_trait]
impl FeedTransport for WsTransport {
    async fn connect(&self, url: &Url, api_key: Option<&str>) -> Result<FeedConnection> {
        let mut request = url.as_str().into_client_request()?;
        if let Some(key) = api_key {
            let value = HeaderValue::from_str(key).map_err(|_| {
                ZnapError::Config("API key contains characters not allowed in a header".to_string())
            })?;
            request.headers_mut().insert(API_KEY_HEADER, value);
        }

        let (ws_stream, _response) = connect_async(request).await?;
        let (write, read) = ws_stream.split();

        let frames = read
            .filter_map(|message| {
                future::ready(match message {
                    Ok(Message::Text(text)) => Some(Ok(Frame::Text(text.as_str().to_owned()))),
                    Ok(Message::Close(_)) => Some(Ok(Frame::Close)),
                    // Ping/Pong are answered by tungstenite; binary is not part of the feed.
                    Ok(_) => None,
                    Err(e) => Some(Err(ZnapError::from(e))),
                })
            })
            .boxed();

        let sink = write
            .sink_map_err(ZnapError::from)
            .with(|text: String| future::ready(Ok::<_, ZnapError>(Message::text(text))));

        Ok(FeedConnection {
            frames,
            sink: Box::pin(sink),
        })
    }
}

/// Receives feed notifications. Calls happen on the subscription task, in
/// frame arrival order.
pub trait FeedHandler: Send + 'static {
    /// The link is live. Informational only.
    fn on_connected(&mut self) {}

    fn on_new_post(&mut self, post: Post);

    fn on_new_comment(&mut self, comment: FeedComment);

    fn on_pong(&mut self) {}

    /// The link dropped; a reconnect is scheduled.
    fn on_disconnected(&mut self) {}
}

/// Channel form of the [`FeedHandler`] callbacks.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedUpdate {
    Connected,
    Event(FeedEvent),
    Disconnected,
}

impl FeedHandler for mpsc::UnboundedSender<FeedUpdate> {
    fn on_connected(&mut self) {
        let _ = self.send(FeedUpdate::Connected);
    }

    fn on_new_post(&mut self, post: Post) {
        let _ = self.send(FeedUpdate::Event(FeedEvent::NewPost(post)));
    }

    fn on_new_comment(&mut self, comment: FeedComment) {
        let _ = self.send(FeedUpdate::Event(FeedEvent::NewComment(comment)));
    }

    fn on_pong(&mut self) {
        let _ = self.send(FeedUpdate::Event(FeedEvent::Pong));
    }

    fn on_disconnected(&mut self) {
        let _ = self.send(FeedUpdate::Disconnected);
    }
}

/// Factory for live feed subscriptions.
pub struct FeedSubscriber<T: FeedTransport = WsTransport> {
    url: Url,
    api_key: Option<String>,
    options: FeedOptions,
    transport: Arc<T>,
}

impl FeedSubscriber<WsTransport> {
    /// Subscriber for the streaming endpoint derived from `config`.
    pub fn new(config: Arc<ZnapConfig>) -> Result<Self> {
        Self::with_transport(config, WsTransport)
    }
}

impl<T: FeedTransport> FeedSubscriber<T> {
    pub fn with_transport(config: Arc<ZnapConfig>, transport: T) -> Result<Self> {
        Ok(Self {
            url: config.feed_url()?,
            api_key: config.api_key().map(str::to_string),
            options: FeedOptions::default(),
            transport: Arc::new(transport),
        })
    }

    /// Replace the timing knobs. `ping_interval` is raised to at least
    /// [`MIN_PING_INTERVAL`].
    pub fn with_options(mut self, mut options: FeedOptions) -> Self {
        options.ping_interval = options.ping_interval.max(MIN_PING_INTERVAL);
        self.options = options;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn options(&self) -> &FeedOptions {
        &self.options
    }

    /// Start a subscription on the current tokio runtime.
    ///
    /// The returned handle cancels the subscription when dropped.
    pub fn subscribe<H: FeedHandler>(&self, handler: H) -> Subscription {
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let session = Session {
            url: self.url.clone(),
            api_key: self.api_key.clone(),
            options: self.options.clone(),
            transport: Arc::clone(&self.transport),
            state: state_tx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(session.run(handler));

        Subscription {
            cancel,
            state: state_rx,
            task: Some(task),
        }
    }
}

/// Handle to a running subscription.
pub struct Subscription {
    cancel: CancellationToken,
    state: watch::Receiver<ConnectionState>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch channel following every state transition.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop the subscription: close the transport and drop any pending
    /// keep-alive or reconnect timer. Calling it again does nothing.
    pub fn unsubscribe(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        info!("Unsubscribing from feed");
        self.cancel.cancel();
    }

    /// Unsubscribe and wait for the background task to finish.
    pub async fn shutdown(mut self) {
        self.unsubscribe();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!("Feed subscription task ended abnormally: {}", e);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum Exit {
    Cancelled,
    Closed,
    Failed(ZnapError),
}

struct Session<T: FeedTransport> {
    url: Url,
    api_key: Option<String>,
    options: FeedOptions,
    transport: Arc<T>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
}

impl<T: FeedTransport> Session<T> {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    async fn run<H: FeedHandler>(self, mut handler: H) {
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;
            self.set_state(ConnectionState::Connecting);
            debug!("Connecting to feed {} (attempt {})", self.url, attempt);

            let connect = timeout(
                self.options.connect_timeout,
                self.transport.connect(&self.url, self.api_key.as_deref()),
            );
            let outcome = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                outcome = connect => outcome,
            };

            match outcome {
                Ok(Ok(connection)) => {
                    self.set_state(ConnectionState::Connected);
                    info!("Connected to feed: {}", self.url);
                    handler.on_connected();

                    match self.drive(connection, &mut handler).await {
                        Exit::Cancelled => break,
                        Exit::Closed => info!("Feed {} closed the connection", self.url),
                        Exit::Failed(e) => warn!("Feed connection to {} failed: {}", self.url, e),
                    }

                    self.set_state(ConnectionState::Disconnected);
                    handler.on_disconnected();
                }
                Ok(Err(e)) => {
                    self.set_state(ConnectionState::Disconnected);
                    warn!("Failed to connect to feed {}: {}", self.url, e);
                }
                Err(_) => {
                    self.set_state(ConnectionState::Disconnected);
                    warn!(
                        "Connection to feed {} timed out after {:?}",
                        self.url, self.options.connect_timeout
                    );
                }
            }

            info!(
                "Reconnecting to feed {} in {:?}",
                self.url, self.options.reconnect_delay
            );
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                () = sleep(self.options.reconnect_delay) => {}
            }
        }

        self.set_state(ConnectionState::Closed);
        info!("Feed subscription to {} closed", self.url);
    }

    /// Connected phase. Returns when the connection ends or the subscription
    /// is cancelled; the keep-alive timer does not outlive this call.
    async fn drive<H: FeedHandler>(&self, connection: FeedConnection, handler: &mut H) -> Exit {
        let FeedConnection {
            mut frames,
            mut sink,
        } = connection;

        let period = self.options.ping_interval;
        let mut keepalive = interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit = loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break Exit::Cancelled,
                frame = frames.next() => match frame {
                    Some(Ok(Frame::Text(text))) => dispatch(&text, handler),
                    Some(Ok(Frame::Close)) | None => break Exit::Closed,
                    Some(Err(e)) => break Exit::Failed(e),
                },
                _ = keepalive.tick() => {
                    debug!("Sending keep-alive to {}", self.url);
                    // A peer that stops reading must not pin the session here.
                    tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => break Exit::Cancelled,
                        sent = timeout(period, sink.send(PING_FRAME.to_string())) => match sent {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => break Exit::Failed(e),
                            Err(_) => {
                                break Exit::Failed(ZnapError::WebSocket(format!(
                                    "keep-alive send stalled for {period:?}"
                                )));
                            }
                        },
                    }
                }
            }
        };
        drop(keepalive);

        match timeout(CLOSE_TIMEOUT, sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Error closing feed connection {}: {}", self.url, e),
            Err(_) => debug!("Timed out closing feed connection {}", self.url),
        }

        exit
    }
}

fn dispatch<H: FeedHandler>(text: &str, handler: &mut H) {
    match FeedEvent::decode(text) {
        Some(FeedEvent::NewPost(post)) => handler.on_new_post(post),
        Some(FeedEvent::NewComment(comment)) => handler.on_new_comment(comment),
        Some(FeedEvent::Pong) => handler.on_pong(),
        None => {}
    }
}
