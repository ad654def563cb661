//! PTY process spawning
//!
//! Runs a shell on the slave side of a pseudo-terminal using the
//! portable-pty crate and exposes the master side as blocking reader and
//! writer handles.

use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};

use dc_core::config::ShellConfig;

/// Terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl TerminalSize {
    fn as_pty_size(self) -> PtySize {
        PtySize {
            rows: self.rows,
            cols: self.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// Verify the configured shell can be executed
fn validate_shell_path(shell: &str) -> Result<()> {
    if shell.is_empty() {
        anyhow::bail!("No shell configured");
    }

    // Bare names are resolved through PATH by the spawn itself
    if shell.contains('/') && !Path::new(shell).exists() {
        anyhow::bail!("Shell '{}' does not exist", shell);
    }
    Ok(())
}

/// A shell running in a PTY
pub struct PtyProcess {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    writer: Box<dyn Write + Send>,
}

impl PtyProcess {
    /// Spawn the configured shell and return it with its output reader
    pub fn spawn(config: &ShellConfig, size: TerminalSize) -> Result<(Self, PtyOutput)> {
        validate_shell_path(&config.command)
            .with_context(|| format!("Invalid shell: {}", config.command))?;

        let pty_pair = native_pty_system()
            .openpty(size.as_pty_size())
            .with_context(|| "Failed to open PTY")?;

        let mut cmd = CommandBuilder::new(&config.command);
        cmd.args(&config.arguments);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let child = pty_pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("Failed to spawn shell: {}", config.command))?;
        tracing::info!(
            "Spawned {} with PID {:?} ({}x{})",
            config.command,
            child.process_id(),
            size.cols,
            size.rows
        );

        // Only the child keeps the slave open, so its exit ends the reader
        drop(pty_pair.slave);

        let reader = pty_pair
            .master
            .try_clone_reader()
            .with_context(|| "Failed to clone PTY reader")?;
        let writer = pty_pair
            .master
            .take_writer()
            .with_context(|| "Failed to take PTY writer")?;

        let process = Self {
            master: pty_pair.master,
            child,
            writer,
        };
        Ok((process, PtyOutput::new(reader)))
    }

    /// Process id of the shell
    pub fn pid(&self) -> Option<u32> {
        self.child.process_id()
    }

    /// Write input to the shell
    pub fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(data)?;
        self.writer.flush()
    }

    /// Resize the terminal
    pub fn resize(&self, size: TerminalSize) -> Result<()> {
        tracing::debug!("Resizing PTY to {}x{}", size.cols, size.rows);
        self.master
            .resize(size.as_pty_size())
            .with_context(|| "Failed to resize PTY")
    }

    /// Exit code if the shell has exited
    pub fn try_wait(&mut self) -> Option<u32> {
        match self.child.try_wait() {
            Ok(status) => status.map(|s| s.exit_code()),
            Err(e) => {
                tracing::warn!("Failed to check shell status: {}", e);
                None
            }
        }
    }

    /// Kill the shell and reap it
    pub fn terminate(&mut self) -> Option<u32> {
        if let Some(code) = self.try_wait() {
            return Some(code);
        }
        if let Err(e) = self.child.kill() {
            tracing::debug!("Failed to kill shell: {}", e);
        }
        self.child.wait().ok().map(|status| status.exit_code())
    }
}

/// Output side of a PTY
///
/// Reading the master after the shell exits fails with EIO on Linux rather
/// than returning EOF; that case is reported as EOF.
pub struct PtyOutput {
    inner: Box<dyn Read + Send>,
}

impl PtyOutput {
    fn new(inner: Box<dyn Read + Send>) -> Self {
        Self { inner }
    }
}

impl Read for PtyOutput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.inner.read(buf) {
            Err(e) if is_hangup(&e) => Ok(0),
            other => other,
        }
    }
}

#[cfg(unix)]
fn is_hangup(err: &std::io::Error) -> bool {
    const EIO: i32 = 5;
    err.raw_os_error() == Some(EIO)
}

#[cfg(not(unix))]
fn is_hangup(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::BrokenPipe
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct Failing(std::io::ErrorKind);

    impl Read for Failing {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(self.0, "read failed"))
        }
    }

    #[test]
    fn test_validate_shell_path() {
        assert!(validate_shell_path("").is_err());
        assert!(validate_shell_path("/definitely/not/a/shell").is_err());
        assert!(validate_shell_path("sh").is_ok());
    }

    #[test]
    fn test_output_passes_data_through() {
        let mut output = PtyOutput::new(Box::new(Cursor::new(b"hello".to_vec())));
        let mut buf = [0u8; 16];
        assert_eq!(output.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(output.read(&mut buf).unwrap(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_output_maps_eio_to_eof() {
        let mut output = PtyOutput::new(Box::new(EioReader));
        let mut buf = [0u8; 4];
        assert_eq!(output.read(&mut buf).unwrap(), 0);

        let mut output =
            PtyOutput::new(Box::new(Failing(std::io::ErrorKind::PermissionDenied)));
        assert!(output.read(&mut buf).is_err());
    }

    #[cfg(unix)]
    struct EioReader;

    #[cfg(unix)]
    impl Read for EioReader {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::from_raw_os_error(5))
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_spawn_and_exit() {
        let config = ShellConfig {
            command: "/bin/sh".to_string(),
            arguments: vec!["-c".to_string(), "echo ready".to_string()],
            ..ShellConfig::default()
        };
        let (mut process, mut output) =
            PtyProcess::spawn(&config, TerminalSize { cols: 80, rows: 24 }).unwrap();
        assert!(process.pid().is_some());

        let mut collected = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match output.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => collected.extend_from_slice(&buf[..n]),
                Err(_) => break,
            }
        }
        assert!(String::from_utf8_lossy(&collected).contains("ready"));
        assert!(process.terminate().is_some());
    }
}
