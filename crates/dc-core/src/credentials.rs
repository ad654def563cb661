//! Credential supplier contract
//!
//! The agent never stores credentials itself. It asks a [`TokenSupplier`]
//! for the bearer token before each connection attempt, and watches the
//! supplier's change channel so that an out-of-band token refresh forces a
//! reconnect with the new token.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::CredentialError;
use crate::types::Authz;

/// Source of bearer tokens for the transport
#[async_trait]
pub trait TokenSupplier: Send + Sync {
    /// Obtain the current authorization material
    async fn fetch_token(&self) -> Result<Authz, CredentialError>;

    /// Channel that yields updated authorization material whenever the
    /// underlying credential changes
    fn subscribe(&self) -> watch::Receiver<Option<Authz>>;
}

/// Supplier holding the token in memory
///
/// Useful when the token is handed over on the command line, and in tests.
/// [`StaticTokenSupplier::set_token`] publishes a change.
pub struct StaticTokenSupplier {
    tx: watch::Sender<Option<Authz>>,
}

impl StaticTokenSupplier {
    /// Create a supplier with an initial token
    pub fn new(authz: Authz) -> Self {
        let (tx, _) = watch::channel(Some(authz));
        Self { tx }
    }

    /// Create a supplier that has no token yet
    pub fn empty() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Replace the token, notifying subscribers if it changed
    pub fn set_token(&self, authz: Authz) {
        publish(&self.tx, authz);
    }
}

#[async_trait]
impl TokenSupplier for StaticTokenSupplier {
    async fn fetch_token(&self) -> Result<Authz, CredentialError> {
        self.tx.borrow().clone().ok_or(CredentialError::Unavailable)
    }

    fn subscribe(&self) -> watch::Receiver<Option<Authz>> {
        self.tx.subscribe()
    }
}

/// Supplier reading the token from a file maintained by another process
pub struct FileTokenSupplier {
    server_url: String,
    path: PathBuf,
    tx: watch::Sender<Option<Authz>>,
}

impl FileTokenSupplier {
    /// Create a supplier for the token stored at `path`
    pub fn new(server_url: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            server_url: server_url.into(),
            path: path.into(),
            tx,
        }
    }

    async fn read(&self) -> Result<Authz, CredentialError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| CredentialError::Read {
                path: self.path.clone(),
                source,
            })?;

        let token = content.trim();
        if token.is_empty() {
            return Err(CredentialError::Empty(self.path.clone()));
        }

        Ok(Authz::new(self.server_url.clone(), token))
    }

    /// Poll the token file and publish changes until `cancel` fires
    pub fn spawn_watcher(
        self: std::sync::Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.read().await {
                            Ok(authz) => {
                                if publish(&self.tx, authz) {
                                    tracing::info!("Token at {:?} changed", self.path);
                                }
                            }
                            Err(e) => tracing::debug!("Token watcher: {}", e),
                        }
                    }
                    _ = cancel.cancelled() => {
                        tracing::debug!("Token watcher for {:?} shutting down", self.path);
                        break;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl TokenSupplier for FileTokenSupplier {
    async fn fetch_token(&self) -> Result<Authz, CredentialError> {
        let authz = self.read().await?;
        publish(&self.tx, authz.clone());
        Ok(authz)
    }

    fn subscribe(&self) -> watch::Receiver<Option<Authz>> {
        self.tx.subscribe()
    }
}

/// Store `authz` in the channel; returns whether it differed from the
/// previous value.
fn publish(tx: &watch::Sender<Option<Authz>>, authz: Authz) -> bool {
    tx.send_if_modified(|current| {
        if current.as_ref() == Some(&authz) {
            false
        } else {
            *current = Some(authz);
            true
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_static_supplier_notifies_on_change() {
        let supplier = StaticTokenSupplier::new(Authz::new("https://srv", "t1"));
        let mut rx = supplier.subscribe();

        assert_eq!(supplier.fetch_token().await.unwrap().token, "t1");

        // Same token is not a change
        supplier.set_token(Authz::new("https://srv", "t1"));
        assert!(!rx.has_changed().unwrap());

        supplier.set_token(Authz::new("https://srv", "t2"));
        assert!(rx.has_changed().unwrap());
        assert_eq!(
            rx.borrow_and_update().as_ref().map(|a| a.token.as_str()),
            Some("t2")
        );
    }

    #[tokio::test]
    async fn test_static_supplier_empty() {
        let supplier = StaticTokenSupplier::empty();
        assert!(matches!(
            supplier.fetch_token().await,
            Err(CredentialError::Unavailable)
        ));
    }

    #[tokio::test]
    async fn test_file_supplier_reads_trimmed_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "abc.def.ghi\n").unwrap();

        let supplier = FileTokenSupplier::new("https://srv", &path);
        let authz = supplier.fetch_token().await.unwrap();
        assert_eq!(authz.token, "abc.def.ghi");
        assert_eq!(authz.server_url, "https://srv");
    }

    #[tokio::test]
    async fn test_file_supplier_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");

        let supplier = FileTokenSupplier::new("https://srv", &path);
        assert!(matches!(
            supplier.fetch_token().await,
            Err(CredentialError::Read { .. })
        ));

        std::fs::write(&path, "  \n").unwrap();
        assert!(matches!(
            supplier.fetch_token().await,
            Err(CredentialError::Empty(_))
        ));
    }

    #[tokio::test]
    async fn test_file_watcher_publishes_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "first").unwrap();

        let supplier = Arc::new(FileTokenSupplier::new("https://srv", &path));
        supplier.fetch_token().await.unwrap();
        let mut rx = supplier.subscribe();
        rx.borrow_and_update();

        let cancel = CancellationToken::new();
        let handle =
            Arc::clone(&supplier).spawn_watcher(Duration::from_millis(10), cancel.clone());

        std::fs::write(&path, "second").unwrap();
        tokio::time::timeout(Duration::from_secs(5), rx.changed())
            .await
            .expect("watcher did not publish")
            .unwrap();
        assert_eq!(
            rx.borrow().as_ref().map(|a| a.token.as_str()),
            Some("second")
        );

        cancel.cancel();
        handle.await.unwrap();
    }
}
