//! Control channel server.
//!
//! Accepts TCP connections on the control port and runs one session task
//! per connection. Framing is one JSON object per LF-terminated line with
//! a 64 KiB cap; see [`crate::protocol`] for the message set.

mod session;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::chat::ChatEngine;
use crate::error::HubResult;
use crate::journal::EventJournal;
use crate::registry::Registry;
use crate::state::Config;
use crate::transfer::FileBroker;

/// Shared dependencies handed to every session task.
pub(crate) struct SessionDeps {
    pub registry: Arc<Registry>,
    pub chat: Arc<ChatEngine>,
    pub broker: Arc<FileBroker>,
    pub journal: Arc<dyn EventJournal>,
}

/// The control-channel acceptor.
pub struct ControlServer {
    listener: TcpListener,
    deps: Arc<SessionDeps>,
}

impl ControlServer {
    /// Binds the control listener. Bind failure is fatal to startup.
    pub async fn bind(
        config: &Config,
        registry: Arc<Registry>,
        chat: Arc<ChatEngine>,
        broker: Arc<FileBroker>,
        journal: Arc<dyn EventJournal>,
    ) -> HubResult<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.control_port)).await?;
        log::info!("[Control] listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            deps: Arc::new(SessionDeps {
                registry,
                chat,
                broker,
                journal,
            }),
        })
    }

    /// Local address of the control listener.
    pub fn local_addr(&self) -> HubResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop; one session task per connection, until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    log::debug!("[Control] connection from {peer}");
                    let deps = Arc::clone(&self.deps);
                    let session_cancel = cancel.child_token();
                    tokio::spawn(async move {
                        session::run_session(stream, peer, deps, session_cancel).await;
                    });
                }
                Err(e) => {
                    // Transient accept errors (EMFILE, resets) must not
                    // kill the acceptor.
                    log::warn!("[Control] accept error: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        log::info!("[Control] acceptor stopped");
    }
}
