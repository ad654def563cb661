//! Websocket duplex transport
//!
//! Turns one upgraded websocket into a framed message channel. A receive loop
//! decodes inbound binary messages onto an mpsc channel, a liveness loop pings
//! the server and waits for the pong, and any number of tasks may send
//! concurrently through a write lock around the sink. The first failure (or a
//! local close) terminates the transport exactly once.

use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use dc_core::config::TransportConfig;
use dc_core::Authz;
use dc_protocol::{FrameCodec, ProtoMsg};

use super::TransportError;

/// Path of the device connect endpoint on the management server
pub const CONNECT_PATH: &str = "/api/devices/v1/deviceconnect/connect";

/// Inbound frames buffered between the socket and the consumer
const RECEIVE_CHANNEL_CAPACITY: usize = 32;

type WsSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
type WsSource = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

/// Build the websocket URL for a management server base URL
///
/// Trailing slashes are dropped and an `http`/`https` scheme becomes
/// `ws`/`wss`.
pub fn connect_url(server_url: &str) -> String {
    let base = server_url.trim_end_matches('/');
    let base = match base.strip_prefix("http") {
        Some(rest) => format!("ws{}", rest),
        None => base.to_string(),
    };
    format!("{}{}", base, CONNECT_PATH)
}

/// User agent sent on the upgrade request
pub fn user_agent() -> String {
    format!(
        "dc-agent/{} ({}; {})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// Terminal state, written once
#[derive(Default)]
struct TermState {
    closed: bool,
    err: Option<TransportError>,
}

struct Inner {
    sink: Mutex<WsSink>,
    state: StdMutex<TermState>,
    done: CancellationToken,
    pong: Notify,
    config: TransportConfig,
}

impl Inner {
    /// Terminate the transport. Returns false if it was already terminated.
    fn term(&self, err: Option<TransportError>) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return false;
        }
        state.closed = true;
        state.err = err;
        drop(state);

        self.done.cancel();
        true
    }

    fn is_closed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }

    /// Send a close frame to the peer
    async fn close_socket(&self, code: CloseCode, reason: &'static str) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        let mut sink = self.sink.lock().await;
        match sink.send(Message::Close(Some(frame))).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::Socket(e.to_string())),
        }
    }

    /// Terminate with an error and tell the peer, bounded so a stalled
    /// socket cannot hold the task
    async fn fail(&self, err: TransportError, code: CloseCode) {
        if !self.term(Some(err.clone())) {
            return;
        }
        tracing::warn!("Transport terminated: {}", err);

        let deadline = self.config.pong_timeout;
        if let Ok(Err(e)) = timeout(deadline, self.close_socket(code, "")).await {
            tracing::debug!("Failed to send close frame: {}", e);
        }
    }

    /// Ping the server and wait for its pong
    async fn probe(&self) -> Result<(), TransportError> {
        let deadline = self.config.pong_timeout;

        // Register interest before the ping leaves so a fast pong is not missed
        let pong = self.pong.notified();
        tokio::pin!(pong);
        pong.as_mut().enable();

        {
            let mut sink = self.sink.lock().await;
            match timeout(deadline, sink.send(Message::Ping(Vec::new()))).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(TransportError::Socket(e.to_string())),
                Err(_) => return Err(TransportError::ProbeTimeout),
            }
        }

        timeout(deadline, pong)
            .await
            .map_err(|_| TransportError::ProbeTimeout)
    }
}

/// A framed duplex channel over one websocket connection
///
/// Not reusable: once terminated, reconnecting means building a new
/// transport.
pub struct Transport {
    inner: Arc<Inner>,
    receiver: StdMutex<Option<mpsc::Receiver<ProtoMsg>>>,
}

impl Transport {
    /// Dial the management server and upgrade to a websocket
    pub async fn connect(authz: &Authz, config: &TransportConfig) -> Result<Self, TransportError> {
        let url = connect_url(&authz.server_url);

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::ConnectFailed(format!("invalid url {}: {}", url, e)))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", authz.token)).map_err(|_| {
            TransportError::ConnectFailed("token is not a valid header value".to_string())
        })?;
        request.headers_mut().insert(header::AUTHORIZATION, bearer);
        if let Ok(agent) = HeaderValue::from_str(&user_agent()) {
            request.headers_mut().insert(header::USER_AGENT, agent);
        }

        tracing::debug!("Connecting to {}", url);
        let (ws, response) =
            match timeout(config.connect_timeout, tokio_tungstenite::connect_async(request)).await {
                Ok(Ok(connected)) => connected,
                Ok(Err(e)) => return Err(classify_connect_error(e)),
                Err(_) => {
                    return Err(TransportError::ConnectFailed(format!(
                        "timed out after {:?} connecting to {}",
                        config.connect_timeout, url
                    )))
                }
            };
        tracing::info!("Connected to {} ({})", url, response.status());

        Ok(Self::from_stream(ws, config))
    }

    /// Build a transport over an already upgraded websocket
    ///
    /// Spawns the receive and liveness loops, so it must be called from
    /// within a tokio runtime.
    pub fn from_stream<S>(ws: WebSocketStream<S>, config: &TransportConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, source) = ws.split();
        let sink: WsSink = Box::pin(sink);
        let source: WsSource = Box::pin(source);
        let inner = Arc::new(Inner {
            sink: Mutex::new(sink),
            state: StdMutex::new(TermState::default()),
            done: CancellationToken::new(),
            pong: Notify::new(),
            config: config.clone(),
        });

        let (tx, rx) = mpsc::channel(RECEIVE_CHANNEL_CAPACITY);
        tokio::spawn(receive_loop(Arc::clone(&inner), source, tx));
        tokio::spawn(liveness_loop(Arc::clone(&inner)));

        Self {
            inner,
            receiver: StdMutex::new(Some(rx)),
        }
    }

    /// Encode and write one frame
    pub async fn send(&self, msg: ProtoMsg) -> Result<(), TransportError> {
        if self.inner.is_closed() {
            return Err(TransportError::Closed);
        }
        let buf = dc_protocol::encode(&msg).map_err(|e| TransportError::Encode(e.to_string()))?;

        let mut sink = self.inner.sink.lock().await;
        if self.inner.is_closed() {
            return Err(TransportError::Closed);
        }
        if let Err(e) = sink.send(Message::Binary(buf.to_vec())).await {
            drop(sink);
            let err = TransportError::Socket(e.to_string());
            if self.inner.term(Some(err.clone())) {
                tracing::warn!("Transport terminated on write: {}", err);
            }
            return Err(err);
        }

        tracing::trace!(
            "Sent {} frame ({:?}, {} bytes)",
            msg.msg_type(),
            msg.proto(),
            buf.len()
        );
        Ok(())
    }

    /// Take the channel of inbound frames
    ///
    /// Only the first call gets the receiver. The channel ends when the
    /// transport terminates.
    pub fn receive(&self) -> Option<mpsc::Receiver<ProtoMsg>> {
        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Terminal cause, `None` while open or after a local close
    pub fn err(&self) -> Option<TransportError> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .err
            .clone()
    }

    /// Close the connection with a normal closure. Idempotent.
    pub async fn close(&self) -> Result<(), TransportError> {
        if !self.inner.term(None) {
            return Ok(());
        }
        tracing::info!("Closing transport");
        self.inner
            .close_socket(CloseCode::Normal, "disconnecting")
            .await
    }

    /// Whether the transport has terminated
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Token cancelled when the transport terminates
    pub fn cancellation(&self) -> CancellationToken {
        self.inner.done.child_token()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.inner.term(None);
    }
}

fn classify_connect_error(err: WsError) -> TransportError {
    match err {
        WsError::Http(response) if response.status() == StatusCode::UNAUTHORIZED => {
            TransportError::Unauthorized
        }
        WsError::Http(response) => {
            TransportError::ConnectFailed(format!("server responded {}", response.status()))
        }
        other => TransportError::ConnectFailed(other.to_string()),
    }
}

async fn receive_loop(inner: Arc<Inner>, mut source: WsSource, tx: mpsc::Sender<ProtoMsg>) {
    let mut codec = FrameCodec::new();

    let (err, code) = loop {
        let next = tokio::select! {
            _ = inner.done.cancelled() => return,
            next = source.next() => next,
        };

        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(WsError::ConnectionClosed)) | None => {
                break (
                    TransportError::RemoteClosed("connection ended".to_string()),
                    CloseCode::Normal,
                )
            }
            Some(Err(e)) => break (TransportError::Socket(e.to_string()), CloseCode::Error),
        };

        match message {
            Message::Binary(data) => {
                let msg = match codec.decode(&data) {
                    Ok(msg) => msg,
                    Err(e) => break (TransportError::Decode(e.to_string()), CloseCode::Unsupported),
                };
                tracing::trace!("Received {} frame ({:?})", msg.msg_type(), msg.proto());

                tokio::select! {
                    _ = inner.done.cancelled() => return,
                    sent = tx.send(msg) => {
                        if sent.is_err() {
                            tracing::warn!("Inbound frame dropped: receiver gone");
                        }
                    }
                }
            }
            Message::Pong(_) => inner.pong.notify_waiters(),
            Message::Ping(_) => tracing::trace!("Ping from server"),
            Message::Close(frame) => {
                let reason = frame
                    .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                    .unwrap_or_else(|| "no close frame".to_string());
                break (TransportError::RemoteClosed(reason), CloseCode::Normal);
            }
            Message::Text(_) => {
                break (
                    TransportError::Decode("unexpected text message".to_string()),
                    CloseCode::Unsupported,
                )
            }
            Message::Frame(_) => {}
        }
    };

    tracing::debug!(bytes = codec.bytes_decoded(), "Receive loop ended: {}", err);
    inner.fail(err, code).await;
}

async fn liveness_loop(inner: Arc<Inner>) {
    let interval = inner.config.ping_interval.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);

    loop {
        tokio::select! {
            _ = inner.done.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match inner.probe().await {
            Ok(()) => tracing::trace!("Liveness probe answered"),
            Err(e) => {
                inner.fail(e, CloseCode::Away).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_url() {
        assert_eq!(
            connect_url("https://hosted.example.com/"),
            "wss://hosted.example.com/api/devices/v1/deviceconnect/connect"
        );
        assert_eq!(
            connect_url("http://localhost:8080"),
            "ws://localhost:8080/api/devices/v1/deviceconnect/connect"
        );
        assert_eq!(
            connect_url("wss://hosted.example.com"),
            "wss://hosted.example.com/api/devices/v1/deviceconnect/connect"
        );
    }

    #[test]
    fn test_user_agent() {
        let agent = user_agent();
        assert!(agent.starts_with("dc-agent/"));
        assert!(agent.contains(std::env::consts::OS));
    }

    #[test]
    fn test_error_classification() {
        let response = tokio_tungstenite::tungstenite::http::Response::builder()
            .status(401)
            .body(None)
            .unwrap();
        assert_eq!(
            classify_connect_error(WsError::Http(response)),
            TransportError::Unauthorized
        );

        let response = tokio_tungstenite::tungstenite::http::Response::builder()
            .status(503)
            .body(None)
            .unwrap();
        assert!(matches!(
            classify_connect_error(WsError::Http(response)),
            TransportError::ConnectFailed(_)
        ));
    }
}
