//! Shell output pump integration tests

use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;

use dc_agent::session::{FrameSender, Shell};
use dc_agent::TransportError;
use dc_protocol::message::shell::{COMMAND, STOP};
use dc_protocol::message::PROPERTY_STATUS;
use dc_protocol::{ProtoMsg, SessionId, Status};

const WAIT: Duration = Duration::from_secs(5);

struct RecordingSender {
    tx: mpsc::UnboundedSender<ProtoMsg>,
}

#[async_trait]
impl FrameSender for RecordingSender {
    async fn send(&self, msg: ProtoMsg) -> Result<(), TransportError> {
        self.tx.send(msg).map_err(|_| TransportError::Closed)
    }
}

fn recorder() -> (Arc<dyn FrameSender>, mpsc::UnboundedReceiver<ProtoMsg>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(RecordingSender { tx }), rx)
}

/// Yields scripted reads, one step per call
struct ScriptedReader {
    steps: VecDeque<io::Result<Vec<u8>>>,
}

impl ScriptedReader {
    fn new(steps: Vec<io::Result<Vec<u8>>>) -> Self {
        Self {
            steps: steps.into(),
        }
    }
}

impl Read for ScriptedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.steps.pop_front() {
            Some(Ok(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            Some(Err(e)) => Err(e),
            None => Ok(0),
        }
    }
}

/// Blocks every read until told to stop
struct StallingReader {
    release: std::sync::mpsc::Receiver<()>,
}

impl Read for StallingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let _ = self.release.recv();
        buf[0] = b'!';
        Ok(1)
    }
}

fn status(msg: &ProtoMsg) -> Option<i64> {
    msg.property(PROPERTY_STATUS).and_then(|v| v.as_i64())
}

#[tokio::test]
async fn test_read_error_is_reported_after_output() {
    let (sender, mut frames) = recorder();
    let reader = ScriptedReader::new(vec![
        Ok(b"total 0\n".to_vec()),
        Ok(b"$ ".to_vec()),
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "pty went away")),
    ]);
    let shell = Shell::new(sender, SessionId::from("s1"), Box::new(reader));

    let pump = shell.start().unwrap();
    timeout(WAIT, pump).await.unwrap().unwrap();
    assert!(!shell.is_running());

    let first = frames.recv().await.unwrap();
    assert_eq!(first.msg_type(), COMMAND);
    assert_eq!(first.session_id().as_str(), "s1");
    assert_eq!(status(&first), Some(Status::Normal as i64));
    assert_eq!(&first.body[..], b"total 0\n");

    let second = frames.recv().await.unwrap();
    assert_eq!(second.msg_type(), COMMAND);
    assert_eq!(&second.body[..], b"$ ");

    let stop = frames.recv().await.unwrap();
    assert_eq!(stop.msg_type(), STOP);
    assert_eq!(status(&stop), Some(Status::Error as i64));
    assert_eq!(String::from_utf8_lossy(&stop.body), "pty went away");

    assert!(frames.try_recv().is_err());
}

#[tokio::test]
async fn test_interrupted_reads_are_retried() {
    let (sender, mut frames) = recorder();
    let reader = ScriptedReader::new(vec![
        Err(io::Error::from(io::ErrorKind::Interrupted)),
        Ok(b"hello".to_vec()),
    ]);
    let shell = Shell::new(sender, SessionId::from("s1"), Box::new(reader));

    timeout(WAIT, shell.start().unwrap()).await.unwrap().unwrap();

    let output = frames.recv().await.unwrap();
    assert_eq!(&output.body[..], b"hello");
    let stop = frames.recv().await.unwrap();
    assert_eq!(stop.msg_type(), STOP);
    assert_eq!(status(&stop), Some(Status::Error as i64));
    assert_eq!(&stop.body[..], b"EOF");
}

#[tokio::test]
async fn test_stopped_shell_sends_nothing_more() {
    let (sender, mut frames) = recorder();
    let (release, stalled) = std::sync::mpsc::channel();
    let shell = Shell::new(
        sender,
        SessionId::from("s1"),
        Box::new(StallingReader { release: stalled }),
    );

    let pump = shell.start().unwrap();
    assert!(shell.is_running());

    shell.stop();
    assert!(!shell.is_running());
    release.send(()).unwrap();

    timeout(WAIT, pump).await.unwrap().unwrap();
    assert!(frames.try_recv().is_err());
}
