//! Remote shell sessions

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use dc_core::config::ShellConfig;
use dc_protocol::message::shell::{
    COMMAND, PING, PONG, PROPERTY_TERMINAL_HEIGHT, PROPERTY_TERMINAL_WIDTH, PROPERTY_USER_ID,
    RESIZE, SPAWN, STOP,
};
use dc_protocol::message::PROPERTY_STATUS;
use dc_protocol::{ProtoMsg, Protocol, SessionId, Status};

use super::{error_frame, send_or_log, spawn_guarded, FrameSender, HandlerError};
use crate::pty::{PtyProcess, TerminalSize};

/// Largest chunk of process output sent per `shell` frame
pub const CHUNK_SIZE: usize = 255;

/// Pumps a process output stream to the peer as `shell` frames
pub struct Shell {
    session_id: SessionId,
    sender: Arc<dyn FrameSender>,
    reader: StdMutex<Option<Box<dyn Read + Send>>>,
    running: Arc<AtomicBool>,
}

impl Shell {
    pub fn new(
        sender: Arc<dyn FrameSender>,
        session_id: SessionId,
        reader: Box<dyn Read + Send>,
    ) -> Self {
        Self {
            session_id,
            sender,
            reader: StdMutex::new(Some(reader)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start pumping on a blocking thread
    ///
    /// Returns `None` if the shell was already started. Must be called from
    /// within a tokio runtime.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;

        self.running.store(true, Ordering::SeqCst);
        let pump = Pump {
            session_id: self.session_id.clone(),
            sender: Arc::clone(&self.sender),
            running: Arc::clone(&self.running),
            runtime: Handle::current(),
        };
        Some(tokio::task::spawn_blocking(move || pump.run(reader)))
    }

    /// Stop forwarding output. The pump exits after its current read.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

struct Pump {
    session_id: SessionId,
    sender: Arc<dyn FrameSender>,
    running: Arc<AtomicBool>,
    runtime: Handle,
}

impl Pump {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn run(self, mut reader: Box<dyn Read + Send>) {
        let mut buf = [0u8; CHUNK_SIZE];

        while self.is_running() {
            let n = match reader.read(&mut buf) {
                Ok(0) => {
                    tracing::debug!("Shell {} output closed", self.session_id);
                    if self.is_running() {
                        self.send_stop(Status::Error, Bytes::from_static(b"EOF"));
                    }
                    break;
                }
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::error!("Error reading shell {} output: {}", self.session_id, e);
                    if self.is_running() {
                        self.send_stop(Status::Error, Bytes::from(e.to_string()));
                    }
                    break;
                }
            };
            if !self.is_running() {
                break;
            }

            let msg = ProtoMsg::new(Protocol::Shell, COMMAND, self.session_id.clone())
                .with_property(PROPERTY_STATUS, Status::Normal)
                .with_body(Bytes::copy_from_slice(&buf[..n]));
            self.runtime
                .block_on(send_or_log(self.sender.as_ref(), msg));
        }

        self.running.store(false, Ordering::SeqCst);
    }

    fn send_stop(&self, status: Status, body: Bytes) {
        let msg = ProtoMsg::new(Protocol::Shell, STOP, self.session_id.clone())
            .with_property(PROPERTY_STATUS, status)
            .with_body(body);
        self.runtime
            .block_on(send_or_log(self.sender.as_ref(), msg));
    }
}

/// A live shell: the PTY process plus its output pump
struct ShellSession {
    shell: Shell,
    process: StdMutex<PtyProcess>,
    user_id: String,
    started: Instant,
    last_input: StdMutex<Instant>,
    cancel: CancellationToken,
}

impl ShellSession {
    fn process(&self) -> std::sync::MutexGuard<'_, PtyProcess> {
        self.process.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record input from the peer
    fn touch(&self) {
        *self.last_input.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn last_input(&self) -> Instant {
        *self.last_input.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn terminate(&self) {
        self.cancel.cancel();
        self.shell.stop();
        if let Some(code) = self.process().terminate() {
            tracing::debug!("Shell exited with code {}", code);
        }
    }
}

/// Handler for the shell protocol, one PTY process per session
pub struct ShellHandler {
    config: ShellConfig,
    sessions: Arc<DashMap<SessionId, Arc<ShellSession>>>,
}

impl ShellHandler {
    pub fn new(config: ShellConfig) -> Self {
        Self {
            config,
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Number of live shell sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Handle one inbound frame. Failures are answered with an error frame.
    pub async fn handle(&self, msg: ProtoMsg, sender: Arc<dyn FrameSender>) {
        let result = match msg.msg_type() {
            SPAWN => self.handle_spawn(&msg, &sender).await,
            COMMAND => self.handle_input(&msg),
            RESIZE => self.handle_resize(&msg),
            STOP => self.handle_stop(&msg, sender.as_ref()).await,
            PING => {
                send_or_log(sender.as_ref(), msg.reply(PONG)).await;
                Ok(())
            }
            other => Err(HandlerError::UnknownMessageType(other.to_string())),
        };

        if let Err(e) = result {
            tracing::warn!("Shell {} failed: {}", msg.msg_type(), e);
            send_or_log(sender.as_ref(), error_frame(&msg, &e)).await;
        }
    }

    /// Kill every shell
    pub async fn close(&self) {
        let live: Vec<Arc<ShellSession>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.sessions.clear();

        for session in live {
            if let Err(e) = tokio::task::spawn_blocking(move || session.terminate()).await {
                tracing::error!("Failed to terminate shell: {}", e);
            }
        }
    }

    fn terminal_size(&self, msg: &ProtoMsg) -> Option<TerminalSize> {
        let dimension = |key: &str| {
            msg.property(key)
                .and_then(|v| v.as_i64())
                .and_then(|v| u16::try_from(v).ok())
                .filter(|v| *v > 0)
        };
        Some(TerminalSize {
            cols: dimension(PROPERTY_TERMINAL_WIDTH)?,
            rows: dimension(PROPERTY_TERMINAL_HEIGHT)?,
        })
    }

    async fn handle_spawn(
        &self,
        msg: &ProtoMsg,
        sender: &Arc<dyn FrameSender>,
    ) -> Result<(), HandlerError> {
        let session_id = msg.session_id().clone();
        if session_id.is_empty() {
            return Err(HandlerError::InvalidMessage("missing session id".to_string()));
        }
        if self.sessions.contains_key(&session_id) {
            return Err(HandlerError::SessionExists(session_id.to_string()));
        }

        let user_id = msg.property_str(PROPERTY_USER_ID).unwrap_or_default().to_string();
        let limit = self.config.sessions.max_per_user as usize;
        if limit > 0 && self.user_session_count(&user_id) >= limit {
            return Err(HandlerError::SessionLimit(user_id));
        }

        let size = self.terminal_size(msg).unwrap_or(TerminalSize {
            cols: self.config.terminal_width,
            rows: self.config.terminal_height,
        });
        let (process, output) = PtyProcess::spawn(&self.config, size)
            .map_err(|e| HandlerError::Spawn(format!("{:#}", e)))?;
        tracing::info!("Shell session {} started (PID {:?})", session_id, process.pid());

        let now = Instant::now();
        let session = Arc::new(ShellSession {
            shell: Shell::new(Arc::clone(sender), session_id.clone(), Box::new(output)),
            process: StdMutex::new(process),
            user_id,
            started: now,
            last_input: StdMutex::new(now),
            cancel: CancellationToken::new(),
        });
        self.sessions.insert(session_id.clone(), Arc::clone(&session));

        let reply = msg
            .reply(SPAWN)
            .with_property(PROPERTY_STATUS, Status::Normal);
        send_or_log(sender.as_ref(), reply).await;

        self.watch_expiry(session_id.clone(), Arc::clone(&session), Arc::clone(sender));

        if let Some(pump) = session.shell.start() {
            let sessions = Arc::clone(&self.sessions);
            spawn_guarded("shell reaper", async move {
                if let Err(e) = pump.await {
                    tracing::error!("Shell {} pump failed: {}", session_id, e);
                }
                let removed = sessions
                    .remove_if(&session_id, |_, live| Arc::ptr_eq(live, &session))
                    .is_some();
                if removed {
                    tracing::info!("Shell session {} ended", session_id);
                    let _ = tokio::task::spawn_blocking(move || session.terminate()).await;
                }
            });
        }
        Ok(())
    }

    fn user_session_count(&self, user_id: &str) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().user_id == user_id)
            .count()
    }

    /// Stop the session with a `stop` frame once it outlives the configured
    /// lifetime or goes without input for too long
    fn watch_expiry(
        &self,
        session_id: SessionId,
        session: Arc<ShellSession>,
        sender: Arc<dyn FrameSender>,
    ) {
        let limits = &self.config.sessions;
        let (lifetime, idle) = (limits.expire_after(), limits.expire_after_idle());
        if lifetime.is_none() && idle.is_none() {
            return;
        }

        let sessions = Arc::clone(&self.sessions);
        spawn_guarded("shell expiry", async move {
            loop {
                let deadline = [
                    lifetime.map(|d| session.started + d),
                    idle.map(|d| session.last_input() + d),
                ]
                .into_iter()
                .flatten()
                .min();
                let Some(deadline) = deadline else { return };
                if Instant::now() >= deadline {
                    break;
                }
                tokio::select! {
                    _ = session.cancel.cancelled() => return,
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }

            let removed = sessions
                .remove_if(&session_id, |_, live| Arc::ptr_eq(live, &session))
                .is_some();
            if !removed {
                return;
            }
            tracing::info!("Shell session {} expired", session_id);
            if let Err(e) = tokio::task::spawn_blocking(move || session.terminate()).await {
                tracing::error!("Failed to terminate shell {}: {}", session_id, e);
            }

            let msg = ProtoMsg::new(Protocol::Shell, STOP, session_id)
                .with_property(PROPERTY_STATUS, Status::Error)
                .with_body(Bytes::from_static(b"session expired"));
            send_or_log(sender.as_ref(), msg).await;
        });
    }

    fn lookup(&self, msg: &ProtoMsg) -> Result<Arc<ShellSession>, HandlerError> {
        self.sessions
            .get(msg.session_id())
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| HandlerError::UnknownSession(msg.session_id().to_string()))
    }

    fn handle_input(&self, msg: &ProtoMsg) -> Result<(), HandlerError> {
        let session = self.lookup(msg)?;
        session.touch();
        session.process().write(&msg.body)?;
        Ok(())
    }

    fn handle_resize(&self, msg: &ProtoMsg) -> Result<(), HandlerError> {
        let session = self.lookup(msg)?;
        let size = self.terminal_size(msg).ok_or_else(|| {
            HandlerError::InvalidMessage("missing terminal_width or terminal_height".to_string())
        })?;
        session.touch();

        session
            .process()
            .resize(size)
            .map_err(|e| HandlerError::Io(std::io::Error::other(format!("{:#}", e))))?;
        Ok(())
    }

    async fn handle_stop(
        &self,
        msg: &ProtoMsg,
        sender: &dyn FrameSender,
    ) -> Result<(), HandlerError> {
        let (session_id, session) = self
            .sessions
            .remove(msg.session_id())
            .ok_or_else(|| HandlerError::UnknownSession(msg.session_id().to_string()))?;
        tracing::info!("Stopping shell session {}", session_id);

        session.shell.stop();
        if let Err(e) = tokio::task::spawn_blocking(move || session.terminate()).await {
            tracing::error!("Failed to terminate shell {}: {}", session_id, e);
        }

        let reply = msg
            .reply(STOP)
            .with_property(PROPERTY_STATUS, Status::Normal);
        send_or_log(sender, reply).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::RecordingSender;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_stream_to_eof() {
        let (sender, mut frames) = RecordingSender::new();
        let output = vec![b'x'; CHUNK_SIZE + 10];
        let shell = Shell::new(sender, SessionId::from("s1"), Box::new(Cursor::new(output)));

        shell.start().unwrap().await.unwrap();
        assert!(!shell.is_running());

        let first = frames.recv().await.unwrap();
        assert_eq!(first.msg_type(), COMMAND);
        assert_eq!(first.body.len(), CHUNK_SIZE);
        let second = frames.recv().await.unwrap();
        assert_eq!(second.body.len(), 10);

        let stop = frames.recv().await.unwrap();
        assert_eq!(stop.msg_type(), STOP);
        assert_eq!(
            stop.property(PROPERTY_STATUS).and_then(|v| v.as_i64()),
            Some(Status::Error as i64)
        );
        assert_eq!(&stop.body[..], b"EOF");
    }

    #[tokio::test]
    async fn test_start_twice() {
        let (sender, _frames) = RecordingSender::new();
        let shell = Shell::new(sender, SessionId::from("s1"), Box::new(Cursor::new(Vec::new())));
        let first = shell.start();
        assert!(first.is_some());
        assert!(shell.start().is_none());
        first.unwrap().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let handler = ShellHandler::new(ShellConfig::default());
        let (sender, mut frames) = RecordingSender::new();

        let msg = ProtoMsg::new(Protocol::Shell, COMMAND, "missing").with_body("ls\n");
        handler.handle(msg, sender).await;

        let reply = frames.recv().await.unwrap();
        assert_eq!(reply.msg_type(), "error");
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let handler = ShellHandler::new(ShellConfig::default());
        let (sender, mut frames) = RecordingSender::new();

        handler
            .handle(ProtoMsg::new(Protocol::Shell, PING, "s1"), sender)
            .await;
        let reply = frames.recv().await.unwrap();
        assert_eq!(reply.msg_type(), PONG);
        assert_eq!(reply.session_id().as_str(), "s1");
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_spawn_echo_and_stop() {
        let config = ShellConfig {
            command: "/bin/sh".to_string(),
            arguments: Vec::new(),
            ..ShellConfig::default()
        };
        let handler = ShellHandler::new(config);
        let (sender, mut frames) = RecordingSender::new();

        handler
            .handle(ProtoMsg::new(Protocol::Shell, SPAWN, "s1"), sender.clone())
            .await;
        let reply = frames.recv().await.unwrap();
        assert_eq!(reply.msg_type(), SPAWN);
        assert_eq!(handler.session_count(), 1);

        handler
            .handle(
                ProtoMsg::new(Protocol::Shell, COMMAND, "s1").with_body("echo marker-$((40+2))\n"),
                sender.clone(),
            )
            .await;

        let mut output = Vec::new();
        let found = tokio::time::timeout(std::time::Duration::from_secs(10), async {
            while let Some(frame) = frames.recv().await {
                if frame.msg_type() == COMMAND {
                    output.extend_from_slice(&frame.body);
                    if String::from_utf8_lossy(&output).contains("marker-42") {
                        return true;
                    }
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        assert!(found);

        handler
            .handle(ProtoMsg::new(Protocol::Shell, STOP, "s1"), sender)
            .await;
        assert_eq!(handler.session_count(), 0);
    }

    #[cfg(unix)]
    fn plain_shell() -> ShellConfig {
        ShellConfig {
            command: "/bin/sh".to_string(),
            arguments: Vec::new(),
            ..ShellConfig::default()
        }
    }

    /// Collect `shell` output until it contains `needle`
    #[cfg(unix)]
    async fn wait_for_output(
        frames: &mut tokio::sync::mpsc::UnboundedReceiver<ProtoMsg>,
        needle: &str,
    ) -> bool {
        let mut output = Vec::new();
        tokio::time::timeout(std::time::Duration::from_secs(10), async {
            while let Some(frame) = frames.recv().await {
                if frame.msg_type() == COMMAND {
                    output.extend_from_slice(&frame.body);
                    if String::from_utf8_lossy(&output).contains(needle) {
                        return true;
                    }
                }
            }
            false
        })
        .await
        .unwrap_or(false)
    }

    /// Next frame that is not terminal output
    #[cfg(unix)]
    async fn next_control(frames: &mut tokio::sync::mpsc::UnboundedReceiver<ProtoMsg>) -> ProtoMsg {
        loop {
            let frame = tokio::time::timeout(std::time::Duration::from_secs(10), frames.recv())
                .await
                .unwrap()
                .unwrap();
            if frame.msg_type() != COMMAND {
                return frame;
            }
        }
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_resize_reaches_terminal() {
        let handler = ShellHandler::new(plain_shell());
        let (sender, mut frames) = RecordingSender::new();

        handler
            .handle(ProtoMsg::new(Protocol::Shell, SPAWN, "s1"), sender.clone())
            .await;
        assert_eq!(frames.recv().await.unwrap().msg_type(), SPAWN);

        let resize = ProtoMsg::new(Protocol::Shell, RESIZE, "s1")
            .with_property(PROPERTY_TERMINAL_WIDTH, 132u16)
            .with_property(PROPERTY_TERMINAL_HEIGHT, 43u16);
        handler.handle(resize, sender.clone()).await;

        handler
            .handle(
                ProtoMsg::new(Protocol::Shell, COMMAND, "s1").with_body("stty size\n"),
                sender.clone(),
            )
            .await;
        assert!(wait_for_output(&mut frames, "43 132").await);

        // Resize without dimensions is rejected
        handler
            .handle(ProtoMsg::new(Protocol::Shell, RESIZE, "s1"), sender.clone())
            .await;
        assert_eq!(next_control(&mut frames).await.msg_type(), "error");

        handler.close().await;
        assert_eq!(handler.session_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_expired_session_is_stopped() {
        let mut config = plain_shell();
        config.sessions.stop_expired = true;
        config.sessions.expire_after = std::time::Duration::from_millis(300);
        let handler = ShellHandler::new(config);
        let (sender, mut frames) = RecordingSender::new();

        handler
            .handle(ProtoMsg::new(Protocol::Shell, SPAWN, "s1"), sender.clone())
            .await;
        assert_eq!(frames.recv().await.unwrap().msg_type(), SPAWN);

        let stop = next_control(&mut frames).await;
        assert_eq!(stop.msg_type(), STOP);
        assert_eq!(
            stop.property(PROPERTY_STATUS).and_then(|v| v.as_i64()),
            Some(Status::Error as i64)
        );
        assert_eq!(&stop.body[..], b"session expired");
        assert_eq!(handler.session_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_session_limit_per_user() {
        let mut config = plain_shell();
        config.sessions.max_per_user = 1;
        let handler = ShellHandler::new(config);
        let (sender, mut frames) = RecordingSender::new();
        let spawn = |session: &str, user: &str| {
            ProtoMsg::new(Protocol::Shell, SPAWN, session).with_property(PROPERTY_USER_ID, user)
        };

        handler.handle(spawn("s1", "alice"), sender.clone()).await;
        assert_eq!(next_control(&mut frames).await.msg_type(), SPAWN);

        handler.handle(spawn("s2", "alice"), sender.clone()).await;
        let reply = next_control(&mut frames).await;
        assert_eq!(reply.msg_type(), "error");
        let body: dc_protocol::ErrorBody = dc_protocol::codec::decode_body(&reply.body).unwrap();
        assert_eq!(body.error, "session limit reached for user 'alice'");

        handler.handle(spawn("s3", "bob"), sender.clone()).await;
        assert_eq!(next_control(&mut frames).await.msg_type(), SPAWN);
        assert_eq!(handler.session_count(), 2);

        handler.close().await;
    }
}
