//! Endpoint startup and shutdown
//!
//! [`Endpoint::start`] validates the configuration, spawns one supervised
//! signaling loop per slot plus the shared device listener, and returns the
//! handle used to originate, kill and inspect calls. [`Endpoint::shutdown`]
//! cancels every task, waits a bounded grace period and aborts stragglers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use rvoip_line_transport::LineListener;

use crate::acceptor::{Acceptor, AttachRoutes};
use crate::config::EndpointConfig;
use crate::errors::{EndpointError, OriginateError, RegistryError, Result};
use crate::media::{MediaConnector, UdpMediaConnector};
use crate::originate::Originator;
use crate::registry::{InterfaceRegistry, SlotId, SlotSnapshot};
use crate::runtime::{KillSignal, SessionRuntime, SessionToken};
use crate::signaling::{CallDirectory, LoopCommand, LoopContext, LoopDirectory, LoopExit, LoopState, SignalingLoop};
use crate::stats::{EndpointStats, StatsSnapshot};

const COMMAND_QUEUE_DEPTH: usize = 32;
const ATTACH_QUEUE_DEPTH: usize = 4;

/// How a shutdown went
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Tasks that finished inside the grace period
    pub graceful: usize,
    /// Tasks aborted after the grace period
    pub aborted: usize,
    /// Slots still occupied when the tasks were gone
    pub released: usize,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.aborted == 0
    }
}

struct SupervisedTask {
    name: String,
    handle: JoinHandle<()>,
}

/// A running endpoint
pub struct Endpoint {
    name: String,
    registry: Arc<InterfaceRegistry>,
    runtime: Arc<dyn SessionRuntime>,
    originator: Originator,
    loops: Arc<LoopDirectory>,
    states: HashMap<SlotId, watch::Receiver<LoopState>>,
    directory: Arc<CallDirectory>,
    stats: Arc<EndpointStats>,
    cancel: CancellationToken,
    tasks: Vec<SupervisedTask>,
    listen_addr: Option<SocketAddr>,
    shutdown_grace: Duration,
    rejected: Vec<EndpointError>,
}

impl Endpoint {
    /// Start every configured slot with UDP media paths
    pub async fn start(config: EndpointConfig, runtime: Arc<dyn SessionRuntime>) -> Result<Self> {
        Self::start_with_media(config, runtime, Arc::new(UdpMediaConnector)).await
    }

    pub async fn start_with_media(
        config: EndpointConfig,
        runtime: Arc<dyn SessionRuntime>,
        media: Arc<dyn MediaConnector>,
    ) -> Result<Self> {
        let settings = config.endpoint.clone();
        let validated = config.validate();
        for rejected in &validated.rejected {
            error!("Skipping interface: {}", rejected);
        }
        if validated.slots.is_empty() {
            warn!("Endpoint {} has no usable interfaces", settings.name);
        }

        let registry = Arc::new(InterfaceRegistry::new(validated.slots));
        let directory = Arc::new(CallDirectory::default());
        let stats = Arc::new(EndpointStats::default());
        let cancel = CancellationToken::new();

        let needs_listener = registry
            .slots()
            .any(|slot| slot.config().dialect.uses_shared_listener());
        let listener = match settings.listen.filter(|_| needs_listener) {
            Some(addr) => Some(LineListener::bind(addr).await?),
            None => None,
        };
        let listen_addr = listener.as_ref().map(LineListener::local_addr);

        let ctx = LoopContext {
            registry: Arc::clone(&registry),
            runtime: Arc::clone(&runtime),
            media,
            directory: Arc::clone(&directory),
            stats: Arc::clone(&stats),
            default_codec: settings.default_codec.clone(),
        };

        let mut loops = LoopDirectory::new();
        let mut routes = AttachRoutes::new();
        let mut states = HashMap::new();
        let mut tasks = Vec::new();
        let mut registration_timeout = Duration::ZERO;

        for slot in registry.slots() {
            let id = slot.id();
            let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
            let attach = if slot.config().dialect.uses_shared_listener() {
                let (attach_tx, attach_rx) = mpsc::channel(ATTACH_QUEUE_DEPTH);
                routes.insert(id, attach_tx);
                registration_timeout = registration_timeout.max(slot.config().registration_timeout);
                Some(attach_rx)
            } else {
                None
            };

            let (signaling, state) = SignalingLoop::new(Arc::clone(slot), ctx.clone(), commands_rx, attach, cancel.child_token());
            loops.insert(id, commands_tx);
            states.insert(id, state);

            let span = info_span!("interface", slot = id, name = %slot.name());
            let handle = tokio::spawn(
                supervise(signaling, settings.restart_delay(), settings.max_restarts, cancel.clone()).instrument(span),
            );
            tasks.push(SupervisedTask {
                name: format!("interface {}", slot.name()),
                handle,
            });
        }

        if let Some(listener) = listener {
            let acceptor = Acceptor::new(listener, routes, registration_timeout, cancel.child_token());
            tasks.push(SupervisedTask {
                name: "device listener".to_string(),
                handle: tokio::spawn(acceptor.run()),
            });
        }

        let loops = Arc::new(loops);
        let originator = Originator::new(Arc::clone(&registry), Arc::clone(&loops), Arc::clone(&stats));
        info!(
            "Endpoint {} started with {} interfaces ({} skipped)",
            settings.name,
            registry.len(),
            validated.rejected.len()
        );

        Ok(Self {
            name: settings.name.clone(),
            registry,
            runtime,
            originator,
            loops,
            states,
            directory,
            stats,
            cancel,
            tasks,
            listen_addr,
            shutdown_grace: settings.shutdown_grace(),
            rejected: validated.rejected,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Place an outbound call to `selector/destination`
    pub async fn originate(&self, target: &str, timeout: Duration) -> std::result::Result<SessionToken, OriginateError> {
        self.originator.originate(target, timeout).await
    }

    pub fn originator(&self) -> &Originator {
        &self.originator
    }

    /// Deliver a kill or break to the leg carrying `token`
    pub async fn kill(&self, token: &SessionToken, signal: KillSignal) -> bool {
        let Some(slot) = self.directory.slot_for(token) else {
            debug!("No live call for session {}", token);
            return false;
        };
        let Some(commands) = self.loops.get(&slot) else {
            return false;
        };
        commands
            .send(LoopCommand::Kill {
                token: token.clone(),
                signal,
            })
            .await
            .is_ok()
    }

    pub fn registry(&self) -> &Arc<InterfaceRegistry> {
        &self.registry
    }

    pub fn runtime(&self) -> &Arc<dyn SessionRuntime> {
        &self.runtime
    }

    pub fn lookup(&self, id: SlotId) -> std::result::Result<SlotSnapshot, RegistryError> {
        self.registry.lookup(id)
    }

    /// Address of the shared device listener, when one is running
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Interfaces skipped at startup
    pub fn rejected(&self) -> &[EndpointError] {
        &self.rejected
    }

    pub fn loop_state(&self, id: SlotId) -> Option<LoopState> {
        self.states.get(&id).map(|state| *state.borrow())
    }

    /// Wait until the slot's loop reaches a state matching `pred`
    pub async fn wait_for_state(&self, id: SlotId, timeout: Duration, pred: impl FnMut(&LoopState) -> bool) -> bool {
        let Some(mut state) = self.states.get(&id).cloned() else {
            return false;
        };
        let reached = matches!(tokio::time::timeout(timeout, state.wait_for(pred)).await, Ok(Ok(_)));
        reached
    }

    pub async fn wait_until_registered(&self, id: SlotId, timeout: Duration) -> bool {
        self.wait_for_state(id, timeout, |state| state.is_registered()).await
    }

    /// Stop every task and force all slots idle
    pub async fn shutdown(mut self) -> ShutdownReport {
        info!("Shutting down endpoint {}", self.name);
        self.cancel.cancel();

        let deadline = Instant::now() + self.shutdown_grace;
        let mut report = ShutdownReport::default();
        for mut task in std::mem::take(&mut self.tasks) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, &mut task.handle).await {
                Ok(Ok(())) => report.graceful += 1,
                Ok(Err(e)) => {
                    warn!("Task {} ended abnormally: {}", task.name, e);
                    report.graceful += 1;
                }
                Err(_) => {
                    warn!("Aborting task {} after {:?}", task.name, self.shutdown_grace);
                    task.handle.abort();
                    report.aborted += 1;
                }
            }
        }

        report.released = self.registry.release_all();
        info!(
            "Endpoint {} stopped: {} tasks drained, {} aborted, {} slots released",
            self.name, report.graceful, report.aborted, report.released
        );
        report
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Run a slot's loop, restarting it after faults
async fn supervise(mut signaling: SignalingLoop, restart_delay: Duration, max_restarts: u32, cancel: CancellationToken) {
    let mut restarts = 0u32;
    loop {
        match signaling.run().await {
            LoopExit::Shutdown => return,
            LoopExit::Terminated(e) => {
                if restarts >= max_restarts {
                    error!(
                        "Interface {} stays down after {} restarts: {}",
                        signaling.slot_name(),
                        restarts,
                        e
                    );
                    return;
                }
                restarts += 1;
                warn!(
                    "Restarting interface {} in {:?} ({}/{})",
                    signaling.slot_name(),
                    restart_delay,
                    restarts,
                    max_restarts
                );
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(restart_delay) => {}
                }
            }
        }
    }
}
