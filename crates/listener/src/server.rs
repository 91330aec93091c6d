//! Listener lifecycle
//!
//! The network endpoint is process-wide: start it once, hand out run
//! partitions, shut it down at the end.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use feditest_common::{uri, Error, ListenerConfig, Result};

use crate::inbox::{Inbox, RejectedMessage, RunPartition};
use crate::routes;

/// A running embedded listener
pub struct Listener {
    inbox: Arc<Inbox>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: Option<JoinHandle<std::io::Result<()>>>,
}

impl Listener {
    /// Bind and start serving
    pub async fn start(config: &ListenerConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.bind).await?;
        let local_addr = listener.local_addr()?;

        let base_url = match &config.public_base_url {
            Some(url) => uri::http_https_uri(url).ok_or_else(|| {
                Error::InvalidConfig(format!("listener.public_base_url is not an http(s) URL: {}", url))
            })?,
            None => Url::parse(&format!("http://{}", local_addr))
                .map_err(|e| Error::InvalidConfig(e.to_string()))?,
        };

        let inbox = Inbox::new(config, base_url);
        let app = routes::router(inbox.clone());
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();

        info!("Listener starting on {} ({})", local_addr, inbox.base_url());
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.cancelled().await })
                .await
        });

        Ok(Self {
            inbox,
            local_addr,
            shutdown,
            task: Some(task),
        })
    }

    pub fn inbox(&self) -> Arc<Inbox> {
        self.inbox.clone()
    }

    pub fn base_url(&self) -> &Url {
        self.inbox.base_url()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Open the inbox partition for one run
    pub fn partition(&self, run_id: impl Into<String>, cancel: CancellationToken) -> RunPartition {
        self.inbox.partition(run_id, cancel)
    }

    pub fn rejected(&self) -> Vec<RejectedMessage> {
        self.inbox.rejected()
    }

    /// Stop accepting connections and wait for the server task
    pub async fn shutdown(mut self) -> Result<()> {
        self.shutdown.cancel();
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        match task.await {
            Ok(result) => {
                info!("Listener on {} stopped", self.local_addr);
                result.map_err(Error::Io)
            }
            Err(e) => Err(Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e))),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if self.task.is_some() {
            warn!("Listener on {} dropped without shutdown", self.local_addr);
            self.shutdown.cancel();
        }
    }
}
