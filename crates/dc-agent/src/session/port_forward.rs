//! Port forwarding
//!
//! Each `new` message dials a local TCP or UDP target and registers a
//! forwarded connection under the caller's `connection_id`. Bytes read from
//! the local socket go out as `forward` frames, at most one unacknowledged at
//! a time; inbound `forward` frames are written to the socket and always
//! answered with `ack`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use dc_core::config::PortForwardConfig;
use dc_protocol::message::port_forward::{
    ACK, FORWARD, NEW, PROPERTY_CONNECTION_ID, PROTOCOL_TCP, PROTOCOL_UDP, STOP,
};
use dc_protocol::message::PortForwardNew;
use dc_protocol::{ProtoMsg, Protocol, SessionId};

use super::{error_frame, send_or_log, spawn_guarded, FrameSender, HandlerError};

type ConnectionTable = DashMap<String, Arc<Forwarder>>;

/// Ack gate of a forwarded connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlowState {
    /// Free to send the next chunk
    Forwarding,
    /// A `forward` frame is waiting for its `ack`
    AwaitingAck,
}

enum LocalReader {
    Tcp(OwnedReadHalf),
    Udp(Arc<UdpSocket>),
}

impl LocalReader {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            LocalReader::Tcp(stream) => stream.read(buf).await,
            LocalReader::Udp(socket) => socket.recv(buf).await,
        }
    }
}

enum LocalWriter {
    Tcp(OwnedWriteHalf),
    Udp(Arc<UdpSocket>),
}

impl LocalWriter {
    async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            LocalWriter::Tcp(stream) => stream.write_all(data).await,
            LocalWriter::Udp(socket) => socket.send(data).await.map(|_| ()),
        }
    }

    async fn shutdown(&mut self) {
        if let LocalWriter::Tcp(stream) = self {
            if let Err(e) = stream.shutdown().await {
                tracing::trace!("Local socket shutdown: {}", e);
            }
        }
    }
}

/// One forwarded connection
struct Forwarder {
    session_id: SessionId,
    connection_id: String,
    writer: Mutex<LocalWriter>,
    flow: watch::Sender<FlowState>,
    activity: Notify,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl Forwarder {
    fn frame(&self, msg_type: &str) -> ProtoMsg {
        ProtoMsg::new(Protocol::PortForward, msg_type, self.session_id.clone())
            .with_property(PROPERTY_CONNECTION_ID, self.connection_id.as_str())
    }

    /// Reset the idle timer
    fn touch(&self) {
        self.activity.notify_one();
    }

    /// Open the ack gate. Returns false when nothing was outstanding.
    fn release(&self) -> bool {
        self.flow.send_if_modified(|state| {
            if *state == FlowState::AwaitingAck {
                *state = FlowState::Forwarding;
                true
            } else {
                false
            }
        })
    }

    /// Tear the connection down. Only the first caller does any work, but
    /// every caller returns with the entry gone from the table.
    async fn close(&self, connections: &ConnectionTable, peer: Option<&dyn FrameSender>) -> bool {
        connections.remove_if(&self.connection_id, |_, entry| {
            std::ptr::eq(Arc::as_ptr(entry), self)
        });
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        tracing::debug!(
            "Closing forwarded connection {}/{}",
            self.session_id,
            self.connection_id
        );

        self.cancel.cancel();
        self.writer.lock().await.shutdown().await;

        if let Some(sender) = peer {
            send_or_log(sender, self.frame(STOP)).await;
        }
        true
    }

    /// Pump local reads to the peer until EOF, error, idle timeout or cancel
    async fn run(
        self: Arc<Self>,
        mut reader: LocalReader,
        sender: Arc<dyn FrameSender>,
        connections: Arc<ConnectionTable>,
        buffer_size: usize,
        idle_timeout: Duration,
    ) {
        let mut buf = vec![0u8; buffer_size];
        let mut flow = self.flow.subscribe();
        let idle = tokio::time::sleep(idle_timeout);
        tokio::pin!(idle);

        loop {
            let n = tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = &mut idle => {
                    tracing::info!(
                        "Forwarded connection {}/{} idle for {:?}",
                        self.session_id,
                        self.connection_id,
                        idle_timeout
                    );
                    break;
                }
                _ = self.activity.notified() => {
                    idle.as_mut().reset(Instant::now() + idle_timeout);
                    continue;
                }
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        tracing::debug!("Local EOF on {}/{}", self.session_id, self.connection_id);
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        tracing::error!(
                            "Local read error on {}/{}: {}",
                            self.session_id,
                            self.connection_id,
                            e
                        );
                        break;
                    }
                },
            };
            idle.as_mut().reset(Instant::now() + idle_timeout);

            // Never more than one forward frame in flight
            let gate_open = tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = &mut idle => false,
                res = flow.wait_for(|state| *state == FlowState::Forwarding) => res.is_ok(),
            };
            if !gate_open {
                tracing::info!(
                    "No ack on {}/{} within {:?}",
                    self.session_id,
                    self.connection_id,
                    idle_timeout
                );
                break;
            }
            self.flow.send_replace(FlowState::AwaitingAck);

            tracing::trace!("Forwarding {} bytes on {}", n, self.connection_id);
            let msg = self.frame(FORWARD).with_body(Bytes::copy_from_slice(&buf[..n]));
            send_or_log(sender.as_ref(), msg).await;
        }

        self.close(&connections, Some(sender.as_ref())).await;
    }
}

/// Handler for the port-forward protocol
pub struct PortForwardHandler {
    connections: Arc<ConnectionTable>,
    config: PortForwardConfig,
}

impl PortForwardHandler {
    /// Create a handler with no connections
    pub fn new(config: PortForwardConfig) -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Number of live forwarded connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Whether a connection id is live
    pub fn has_connection(&self, connection_id: &str) -> bool {
        self.connections.contains_key(connection_id)
    }

    /// Handle one inbound frame. Failures are answered with an error frame.
    pub async fn handle(&self, msg: ProtoMsg, sender: Arc<dyn FrameSender>) {
        let result = match msg.msg_type() {
            NEW => self.handle_new(&msg, &sender).await,
            FORWARD => self.handle_forward(&msg, sender.as_ref()).await,
            ACK => self.handle_ack(&msg),
            STOP => self.handle_stop(&msg).await,
            other => Err(HandlerError::UnknownMessageType(other.to_string())),
        };

        if let Err(e) = result {
            tracing::warn!("Port forward {} failed: {}", msg.msg_type(), e);
            send_or_log(sender.as_ref(), error_frame(&msg, &e)).await;
        }
    }

    /// Close every connection without notifying the peer
    pub async fn close(&self) {
        let live: Vec<Arc<Forwarder>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for forwarder in live {
            forwarder.close(&self.connections, None).await;
        }
    }

    async fn handle_new(
        &self,
        msg: &ProtoMsg,
        sender: &Arc<dyn FrameSender>,
    ) -> Result<(), HandlerError> {
        let request = if msg.body.is_empty() {
            PortForwardNew::default()
        } else {
            PortForwardNew::from_body(&msg.body)?
        };

        let non_empty = |s: Option<String>| s.filter(|s| !s.is_empty());
        let (protocol, host, port, connection_id) = match (
            non_empty(request.protocol),
            non_empty(request.remote_host),
            request.remote_port.filter(|port| *port != 0),
            msg.property_str(PROPERTY_CONNECTION_ID),
        ) {
            (Some(protocol), Some(host), Some(port), Some(id)) => (protocol, host, port, id),
            _ => {
                return Err(HandlerError::InvalidMessage(
                    "missing connection_id, remote_host, remote_port or protocol".to_string(),
                ))
            }
        };

        if self.connections.contains_key(connection_id) {
            return Err(HandlerError::DuplicateConnection(connection_id.to_string()));
        }

        tracing::info!(
            "New forwarded connection {}/{}: {}/{}:{}",
            msg.session_id(),
            connection_id,
            protocol,
            host,
            port
        );
        let (reader, writer) = self.dial(&protocol, &host, port).await?;

        let forwarder = Arc::new(Forwarder {
            session_id: msg.session_id().clone(),
            connection_id: connection_id.to_string(),
            writer: Mutex::new(writer),
            flow: watch::Sender::new(FlowState::Forwarding),
            activity: Notify::new(),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });

        let inserted = match self.connections.entry(connection_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&forwarder));
                true
            }
        };
        if !inserted {
            forwarder.writer.lock().await.shutdown().await;
            return Err(HandlerError::DuplicateConnection(connection_id.to_string()));
        }

        let reply = msg
            .reply(NEW)
            .with_property(PROPERTY_CONNECTION_ID, connection_id);
        send_or_log(sender.as_ref(), reply).await;

        spawn_guarded(
            "port-forward reader",
            forwarder.run(
                reader,
                Arc::clone(sender),
                Arc::clone(&self.connections),
                self.config.buffer_size,
                self.config.idle_timeout,
            ),
        );
        Ok(())
    }

    async fn dial(
        &self,
        protocol: &str,
        host: &str,
        port: u16,
    ) -> Result<(LocalReader, LocalWriter), HandlerError> {
        let target = format!("{}:{}", host, port);
        let connect_error = |reason: String| HandlerError::Connect {
            target: target.clone(),
            reason,
        };
        let deadline = self.config.connect_timeout;

        match protocol {
            PROTOCOL_TCP => {
                let stream = timeout(deadline, TcpStream::connect((host, port)))
                    .await
                    .map_err(|_| connect_error("timed out".to_string()))?
                    .map_err(|e| connect_error(e.to_string()))?;
                let (reader, writer) = stream.into_split();
                Ok((LocalReader::Tcp(reader), LocalWriter::Tcp(writer)))
            }
            PROTOCOL_UDP => {
                let addr = tokio::net::lookup_host((host, port))
                    .await
                    .map_err(|e| connect_error(e.to_string()))?
                    .next()
                    .ok_or_else(|| connect_error("no address found".to_string()))?;
                let local: SocketAddr = if addr.is_ipv4() {
                    ([0, 0, 0, 0], 0).into()
                } else {
                    ([0u16; 8], 0).into()
                };
                let socket = UdpSocket::bind(local)
                    .await
                    .map_err(|e| connect_error(e.to_string()))?;
                socket
                    .connect(addr)
                    .await
                    .map_err(|e| connect_error(e.to_string()))?;
                let socket = Arc::new(socket);
                Ok((
                    LocalReader::Udp(Arc::clone(&socket)),
                    LocalWriter::Udp(socket),
                ))
            }
            other => Err(HandlerError::UnsupportedProtocol(other.to_string())),
        }
    }

    fn lookup(&self, msg: &ProtoMsg) -> Result<Arc<Forwarder>, HandlerError> {
        let connection_id = msg.property_str(PROPERTY_CONNECTION_ID).unwrap_or_default();
        self.connections
            .get(connection_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| HandlerError::UnknownConnection(connection_id.to_string()))
    }

    async fn handle_forward(
        &self,
        msg: &ProtoMsg,
        sender: &dyn FrameSender,
    ) -> Result<(), HandlerError> {
        let forwarder = self.lookup(msg)?;
        forwarder.touch();

        tracing::trace!(
            "Writing {} bytes to {}",
            msg.body.len(),
            forwarder.connection_id
        );
        let written = forwarder.writer.lock().await.write(&msg.body).await;

        send_or_log(sender, forwarder.frame(ACK)).await;
        written.map_err(HandlerError::Io)
    }

    fn handle_ack(&self, msg: &ProtoMsg) -> Result<(), HandlerError> {
        let forwarder = self.lookup(msg)?;
        forwarder.touch();
        if !forwarder.release() {
            tracing::debug!(
                "Ack on {} with nothing outstanding",
                forwarder.connection_id
            );
        }
        Ok(())
    }

    async fn handle_stop(&self, msg: &ProtoMsg) -> Result<(), HandlerError> {
        let forwarder = self.lookup(msg)?;
        tracing::info!(
            "Stopping forwarded connection {}/{}",
            forwarder.session_id,
            forwarder.connection_id
        );
        forwarder.close(&self.connections, None).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::RecordingSender;
    use dc_protocol::codec;
    use dc_protocol::message::MESSAGE_TYPE_ERROR;
    use dc_protocol::ErrorBody;
    use tokio::net::TcpListener;

    fn new_request(connection_id: &str, port: Option<u16>) -> ProtoMsg {
        let body = codec::encode_body(&PortForwardNew {
            protocol: Some("tcp".to_string()),
            remote_host: Some("127.0.0.1".to_string()),
            remote_port: port,
        })
        .unwrap();
        ProtoMsg::new(Protocol::PortForward, NEW, "sess")
            .with_property(PROPERTY_CONNECTION_ID, connection_id)
            .with_body(body)
    }

    fn error_text(msg: &ProtoMsg) -> String {
        assert_eq!(msg.msg_type(), MESSAGE_TYPE_ERROR);
        codec::decode_body::<ErrorBody>(&msg.body).unwrap().error
    }

    #[tokio::test]
    async fn test_new_with_unsupported_protocol() {
        let handler = PortForwardHandler::new(PortForwardConfig::default());
        let (sender, mut frames) = RecordingSender::new();

        let body = codec::encode_body(&PortForwardNew {
            protocol: Some("sctp".to_string()),
            remote_host: Some("127.0.0.1".to_string()),
            remote_port: Some(22),
        })
        .unwrap();
        let msg = ProtoMsg::new(Protocol::PortForward, NEW, "sess")
            .with_property(PROPERTY_CONNECTION_ID, "c1")
            .with_body(body);
        handler.handle(msg, sender).await;

        let reply = frames.recv().await.unwrap();
        assert_eq!(error_text(&reply), "unsupported protocol: sctp");
        assert_eq!(handler.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_connection_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handler = PortForwardHandler::new(PortForwardConfig::default());
        let (sender, mut frames) = RecordingSender::new();

        handler.handle(new_request("c1", Some(port)), sender.clone()).await;
        assert_eq!(frames.recv().await.unwrap().msg_type(), NEW);

        handler.handle(new_request("c1", Some(port)), sender).await;
        let reply = frames.recv().await.unwrap();
        assert_eq!(error_text(&reply), "connection already exists: c1");
        assert_eq!(handler.connection_count(), 1);

        handler.close().await;
        assert_eq!(handler.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_body_is_invalid() {
        let handler = PortForwardHandler::new(PortForwardConfig::default());
        let (sender, mut frames) = RecordingSender::new();

        let msg = ProtoMsg::new(Protocol::PortForward, NEW, "sess")
            .with_property(PROPERTY_CONNECTION_ID, "c1");
        handler.handle(msg, sender).await;

        let reply = frames.recv().await.unwrap();
        assert!(error_text(&reply).starts_with("invalid message"));
        assert_eq!(handler.connection_count(), 0);
    }
}
