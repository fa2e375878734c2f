//! Application bootstrap and dependency wiring.
//!
//! This is the composition root: subsystems are created and bound in
//! dependency order (registry, control, chat, broker, mixer, fan-out) and
//! their long-lived tasks are spawned by [`BootstrappedServices::start`].
//! Shutdown cancels the root token and drains tasks in reverse start
//! order, giving each subsystem a bounded budget before aborting it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::audio::AudioMixer;
use crate::chat::ChatEngine;
use crate::control::ControlServer;
use crate::error::HubResult;
use crate::journal::{EventJournal, LogJournal};
use crate::protocol_constants::SHUTDOWN_DRAIN_SECS;
use crate::registry::Registry;
use crate::state::Config;
use crate::transfer::FileBroker;
use crate::video::VideoFanout;

/// Container for all bootstrapped subsystems.
pub struct BootstrappedServices {
    pub registry: Arc<Registry>,
    pub chat: Arc<ChatEngine>,
    pub broker: Arc<FileBroker>,
    pub mixer: Arc<AudioMixer>,
    pub fanout: Arc<VideoFanout>,
    /// Held until `start` hands it to its task.
    control: Mutex<Option<ControlServer>>,
    control_addr: SocketAddr,
    cancel: CancellationToken,
    /// Spawned subsystem tasks in start order.
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

/// Bootstraps all subsystems with the default journal.
///
/// All listeners are bound here; a bind failure on any of them is fatal
/// and surfaces as an error before any task is spawned.
pub async fn bootstrap_services(config: Config) -> HubResult<BootstrappedServices> {
    bootstrap_services_with_journal(config, Arc::new(LogJournal)).await
}

/// Bootstraps all subsystems with an explicit event journal.
pub async fn bootstrap_services_with_journal(
    config: Config,
    journal: Arc<dyn EventJournal>,
) -> HubResult<BootstrappedServices> {
    let cancel = CancellationToken::new();

    let registry = Arc::new(Registry::new());
    let chat = Arc::new(ChatEngine::new(Arc::clone(&registry), Arc::clone(&journal)));
    let broker = FileBroker::new(
        config.upload_dir.clone(),
        config.host.clone(),
        config.transfer.clone(),
        Arc::clone(&registry),
        Arc::clone(&chat),
        Arc::clone(&journal),
        cancel.child_token(),
    )
    .await?;
    let control = ControlServer::bind(
        &config,
        Arc::clone(&registry),
        Arc::clone(&chat),
        Arc::clone(&broker),
        Arc::clone(&journal),
    )
    .await?;
    let control_addr = control.local_addr()?;
    let mixer = AudioMixer::bind(&config, Arc::clone(&registry)).await?;
    let fanout = VideoFanout::bind(&config, Arc::clone(&registry)).await?;

    log::info!(
        "[Bootstrap] hub ready: control {}, audio {}, video {}",
        control_addr,
        mixer.local_addr()?,
        fanout.local_addr()?
    );

    Ok(BootstrappedServices {
        registry,
        chat,
        broker,
        mixer,
        fanout,
        control: Mutex::new(Some(control)),
        control_addr,
        cancel,
        tasks: Mutex::new(Vec::new()),
    })
}

impl BootstrappedServices {
    /// Spawns the long-lived subsystem tasks in dependency order.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        let control = self
            .control
            .lock()
            .take()
            .expect("control server already started");

        let cancel = self.cancel.child_token();
        tasks.push(("control", tokio::spawn(control.run(cancel))));

        let mixer = Arc::clone(&self.mixer);
        tasks.push((
            "audio-ingress",
            tokio::spawn(mixer.run_ingress(self.cancel.child_token())),
        ));
        let mixer = Arc::clone(&self.mixer);
        tasks.push((
            "audio-mixer",
            tokio::spawn(mixer.run_mixer(self.cancel.child_token())),
        ));

        let fanout = Arc::clone(&self.fanout);
        tasks.push((
            "video-fanout",
            tokio::spawn(fanout.run(self.cancel.child_token())),
        ));

        log::info!("[Bootstrap] subsystem tasks started");
    }

    /// Address of the control listener (useful when bound to port 0).
    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    /// Cancellation token observed by every subsystem task.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Initiates graceful shutdown: cancel everything, then drain tasks
    /// in reverse start order with a per-subsystem budget.
    pub async fn shutdown(&self) {
        log::info!("[Bootstrap] beginning graceful shutdown...");
        self.cancel.cancel();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for (name, mut handle) in tasks.into_iter().rev() {
            match timeout(Duration::from_secs(SHUTDOWN_DRAIN_SECS), &mut handle).await {
                Ok(_) => log::info!("[Bootstrap] {name} drained"),
                Err(_) => {
                    log::warn!("[Bootstrap] {name} exceeded drain budget, aborting");
                    handle.abort();
                }
            }
        }
        log::info!("[Bootstrap] shutdown complete");
    }
}
