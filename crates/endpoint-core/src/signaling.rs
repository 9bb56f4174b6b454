//! Per-device signaling loop
//!
//! One [`SignalingLoop`] runs for every configured slot. It owns the device
//! connection and the slot's call leg outright; other tasks reach it only
//! through [`LoopCommand`]s. The loop goes through
//!
//! ```text
//! Disconnected -> Connecting -> Registered <-> Active(call)
//!                                   |
//!                                   +-> Expired -> Disconnected
//!                                   +-> Terminated
//! ```
//!
//! While registered it waits on the next inbound frame, queued commands, the
//! current leg's runtime events and the keepalive timer, and handles whichever
//! is ready first. Inbound frames are handled strictly in arrival order.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use rvoip_line_codec::{CallAction, CallReference, Capabilities, DtmfDigit, HangupCause, Inbound, LineMessage};
use rvoip_line_transport::LineConnection;

use crate::channel::{CallLeg, ChannelPhase};
use crate::dialect::{dialect_for, Dialect};
use crate::errors::{EndpointError, OriginateError, Result};
use crate::media::{CodecDescriptor, MediaConnector};
use crate::registry::{InterfaceRegistry, InterfaceSlot, LegId, SlotHandle, SlotHealth, SlotId, SlotSelector};
use crate::runtime::{
    CallDirection, CallerProfile, ChannelState, DtmfEvent, KillSignal, RuntimeEvent, SessionRuntime, SessionToken,
};
use crate::stats::EndpointStats;

/// First call reference used for adapter-originated calls
const OUTBOUND_CALL_REF_BASE: u32 = 0x4000_0001;

/// Cap on the exponential registration backoff
const MAX_BACKOFF_SHIFT: u32 = 3;

/// Observable state of a signaling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Disconnected,
    Connecting,
    Registered,
    Active(CallReference),
    Expired,
    Terminated,
}

impl LoopState {
    pub fn is_registered(self) -> bool {
        matches!(self, Self::Registered | Self::Active(_))
    }
}

/// A device connection whose first frame was a registration
#[derive(Debug)]
pub struct PendingConnection {
    pub conn: LineConnection,
    pub device_id: u32,
    pub device_name: String,
    pub capabilities: Capabilities,
}

/// Request to place a call on a reserved slot
#[derive(Debug)]
pub struct OutboundRequest {
    pub handle: SlotHandle,
    pub profile: CallerProfile,
    pub reply: oneshot::Sender<std::result::Result<SessionToken, OriginateError>>,
}

/// Cross-task requests delivered to a signaling loop
#[derive(Debug)]
pub enum LoopCommand {
    Originate(OutboundRequest),
    /// Abandon an outbound call the device has not acknowledged
    CancelOriginate(LegId),
    Kill { token: SessionToken, signal: KillSignal },
}

/// Why [`SignalingLoop::run`] returned
#[derive(Debug)]
pub enum LoopExit {
    Shutdown,
    Terminated(EndpointError),
}

/// Which slot carries each live session
#[derive(Debug, Default)]
pub struct CallDirectory {
    calls: DashMap<SessionToken, SlotId>,
}

impl CallDirectory {
    pub fn insert(&self, token: SessionToken, slot: SlotId) {
        self.calls.insert(token, slot);
    }

    pub fn remove(&self, token: &SessionToken) -> Option<SlotId> {
        self.calls.remove(token).map(|(_, slot)| slot)
    }

    pub fn slot_for(&self, token: &SessionToken) -> Option<SlotId> {
        self.calls.get(token).map(|entry| *entry.value())
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

/// Shared collaborators handed to every loop
#[derive(Clone)]
pub struct LoopContext {
    pub registry: Arc<InterfaceRegistry>,
    pub runtime: Arc<dyn SessionRuntime>,
    pub media: Arc<dyn MediaConnector>,
    pub directory: Arc<CallDirectory>,
    pub stats: Arc<EndpointStats>,
    pub default_codec: CodecDescriptor,
}

/// Command senders of every running loop, by slot
pub type LoopDirectory = HashMap<SlotId, mpsc::Sender<LoopCommand>>;

enum SessionEnd {
    Shutdown,
    Expired(EndpointError),
    Closed,
    Unregistered,
    Replaced(PendingConnection),
    Fault(EndpointError),
}

struct PendingOriginate {
    leg: LegId,
    token: SessionToken,
    reply: oneshot::Sender<std::result::Result<SessionToken, OriginateError>>,
}

pub struct SignalingLoop {
    slot: Arc<InterfaceSlot>,
    dialect: Arc<dyn Dialect>,
    ctx: LoopContext,
    commands: mpsc::Receiver<LoopCommand>,
    attach: Option<mpsc::Receiver<PendingConnection>>,
    cancel: CancellationToken,
    state: watch::Sender<LoopState>,
    leg: Option<CallLeg>,
    pending: Option<PendingOriginate>,
    device_caps: Capabilities,
    next_call_ref: u32,
    last_activity: Instant,
    malformed_run: u32,
}

impl SignalingLoop {
    /// Create the loop for `slot`
    ///
    /// `attach` delivers connections from the shared listener; slots without
    /// it dial their companion address instead.
    pub fn new(
        slot: Arc<InterfaceSlot>,
        ctx: LoopContext,
        commands: mpsc::Receiver<LoopCommand>,
        attach: Option<mpsc::Receiver<PendingConnection>>,
        cancel: CancellationToken,
    ) -> (Self, watch::Receiver<LoopState>) {
        let (state, state_rx) = watch::channel(LoopState::Disconnected);
        let dialect = dialect_for(slot.config().dialect);
        let signaling = Self {
            slot,
            dialect,
            ctx,
            commands,
            attach,
            cancel,
            state,
            leg: None,
            pending: None,
            device_caps: Capabilities::default(),
            next_call_ref: OUTBOUND_CALL_REF_BASE,
            last_activity: Instant::now(),
            malformed_run: 0,
        };
        (signaling, state_rx)
    }

    pub fn slot_id(&self) -> SlotId {
        self.slot.id()
    }

    pub fn slot_name(&self) -> &str {
        self.slot.name()
    }

    /// Drive the device until shutdown or an unrecoverable fault
    ///
    /// Expiry and peer disconnects are recovered here by waiting for the
    /// device again. Can be called again after `Terminated`.
    pub async fn run(&mut self) -> LoopExit {
        let mut failures = 0u32;
        let mut carried: Option<PendingConnection> = None;

        loop {
            if self.cancel.is_cancelled() {
                return self.stop();
            }

            let pending = match carried.take() {
                Some(pending) => pending,
                None => match self.connect().await {
                    Ok(Some(pending)) => pending,
                    Ok(None) => return self.stop(),
                    Err(e) => match self.registration_failed(&mut failures, e).await {
                        Some(exit) => return exit,
                        None => continue,
                    },
                },
            };

            let conn = match self.register(pending).await {
                Ok(conn) => {
                    failures = 0;
                    conn
                }
                Err(e) => match self.registration_failed(&mut failures, e).await {
                    Some(exit) => return exit,
                    None => continue,
                },
            };

            match self.serve(conn).await {
                SessionEnd::Shutdown => return self.stop(),
                SessionEnd::Fault(e) => {
                    error!(slot = self.slot.id(), "Interface {} terminated: {}", self.slot.name(), e);
                    self.set_state(LoopState::Terminated);
                    return LoopExit::Terminated(e);
                }
                SessionEnd::Replaced(pending) => carried = Some(pending),
                SessionEnd::Expired(_) | SessionEnd::Closed | SessionEnd::Unregistered => {
                    let retry = self.slot.config().registration_retry;
                    if !self.dialect_uses_listener() && !self.pause(retry).await {
                        return self.stop();
                    }
                }
            }
        }
    }

    fn dialect_uses_listener(&self) -> bool {
        self.slot.config().dialect.uses_shared_listener()
    }

    fn stop(&mut self) -> LoopExit {
        while let Ok(command) = self.commands.try_recv() {
            refuse(&self.ctx.registry, &self.slot, command);
        }
        self.ctx.registry.set_health(self.slot.id(), SlotHealth::Absent);
        self.set_state(LoopState::Terminated);
        info!(slot = self.slot.id(), "Interface {} stopped", self.slot.name());
        LoopExit::Shutdown
    }

    fn set_state(&self, state: LoopState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(slot = self.slot.id(), "Interface {} {:?} -> {:?}", self.slot.name(), previous, state);
        }
    }

    /// Count a failed registration; `Some` once the attempts are used up
    async fn registration_failed(&mut self, failures: &mut u32, e: EndpointError) -> Option<LoopExit> {
        *failures += 1;
        self.ctx.registry.set_health(self.slot.id(), SlotHealth::Absent);
        self.set_state(LoopState::Disconnected);

        let config = self.slot.config();
        if *failures >= config.max_registration_attempts {
            error!(
                slot = self.slot.id(),
                "Interface {} gave up after {} registration attempts: {}",
                self.slot.name(),
                failures,
                e
            );
            self.set_state(LoopState::Terminated);
            return Some(LoopExit::Terminated(e));
        }

        let delay = config.registration_retry * (1u32 << (*failures - 1).min(MAX_BACKOFF_SHIFT));
        warn!(
            slot = self.slot.id(),
            "Registration attempt {}/{} on {} failed: {}; retrying in {:?}",
            failures,
            config.max_registration_attempts,
            self.slot.name(),
            e,
            delay
        );
        if self.pause(delay).await {
            None
        } else {
            Some(self.stop())
        }
    }

    /// Sleep while refusing commands; `false` if cancelled
    async fn pause(&mut self, delay: Duration) -> bool {
        let deadline = tokio::time::sleep(delay);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = &mut deadline => return true,
                Some(command) = self.commands.recv() => refuse(&self.ctx.registry, &self.slot, command),
            }
        }
    }

    /// Wait for the device's connection and its registration frame
    ///
    /// `Ok(None)` means the loop was cancelled while waiting.
    async fn connect(&mut self) -> Result<Option<PendingConnection>> {
        if self.dialect_uses_listener() {
            self.set_state(LoopState::Disconnected);
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(None),
                    pending = recv_attach(&mut self.attach) => {
                        return match pending {
                            Some(pending) => Ok(Some(pending)),
                            None => Err(EndpointError::Registration("device listener stopped".into())),
                        };
                    }
                    Some(command) = self.commands.recv() => refuse(&self.ctx.registry, &self.slot, command),
                }
            }
        }

        let config = self.slot.config();
        let companion = config
            .companion
            .ok_or_else(|| EndpointError::Registration("no companion address".into()))?;
        let timeout = config.registration_timeout;
        self.set_state(LoopState::Connecting);

        let mut conn = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(None),
            conn = LineConnection::connect(companion, timeout) => conn?,
        };
        let first = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(None),
            first = conn.recv_timeout(timeout) => first?,
        };

        match first {
            Some(Inbound::Message(LineMessage::Register {
                device_id,
                device_name,
                capabilities,
            })) => Ok(Some(PendingConnection {
                conn,
                device_id,
                device_name,
                capabilities,
            })),
            Some(Inbound::Message(other)) => Err(EndpointError::Registration(format!(
                "expected registration from {}, got {}",
                companion,
                other.id().name()
            ))),
            Some(Inbound::Malformed(e)) => Err(EndpointError::Malformed(e)),
            None => Err(EndpointError::Registration(format!(
                "{} closed before registering",
                companion
            ))),
        }
    }

    async fn register(&mut self, pending: PendingConnection) -> Result<LineConnection> {
        let PendingConnection {
            mut conn,
            device_id,
            device_name,
            capabilities,
        } = pending;
        self.set_state(LoopState::Connecting);

        if device_id != self.slot.id() {
            let reason = format!("device {} does not belong to interface {}", device_id, self.slot.name());
            if let Err(e) = conn.send(LineMessage::RegisterReject { reason: reason.clone() }).await {
                debug!("Could not send rejection to {}: {}", conn.peer_addr(), e);
            }
            return Err(EndpointError::Registration(reason));
        }

        conn.send(LineMessage::RegisterAck {
            keepalive_secs: self.slot.config().keepalive_secs,
        })
        .await?;

        self.device_caps = capabilities;
        self.last_activity = Instant::now();
        self.malformed_run = 0;
        self.ctx.registry.set_health(self.slot.id(), SlotHealth::Registered);
        self.set_state(LoopState::Registered);
        info!(
            slot = self.slot.id(),
            device = %device_name,
            "Device registered on {} from {}",
            self.slot.name(),
            conn.peer_addr()
        );
        Ok(conn)
    }

    async fn serve(&mut self, mut conn: LineConnection) -> SessionEnd {
        let expiry = self.slot.config().expiry;
        let mut ticker = tokio::time::interval(expiry_check_period(expiry));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let end = loop {
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => Ok(Some(SessionEnd::Shutdown)),
                inbound = conn.recv() => self.on_inbound(&mut conn, inbound).await,
                Some(command) = self.commands.recv() => self.on_command(&mut conn, command).await.map(|_| None),
                event = next_leg_event(&mut self.leg) => self.on_runtime_event(&mut conn, event).await.map(|_| None),
                Some(pending) = recv_attach(&mut self.attach) => Ok(Some(SessionEnd::Replaced(pending))),
                _ = ticker.tick() => Ok(self.check_expiry(expiry)),
            };
            match outcome {
                Ok(None) => continue,
                Ok(Some(end)) => break end,
                Err(e) => break SessionEnd::Fault(e),
            }
        };

        self.close_session(conn, &end).await;
        end
    }

    fn check_expiry(&self, expiry: Duration) -> Option<SessionEnd> {
        let silent = self.last_activity.elapsed();
        if silent <= expiry {
            return None;
        }
        Some(SessionEnd::Expired(EndpointError::Expired {
            slot: self.slot.name().to_string(),
            silent,
        }))
    }

    async fn close_session(&mut self, mut conn: LineConnection, end: &SessionEnd) {
        let id = self.slot.id();
        match end {
            SessionEnd::Shutdown => {
                if let Err(e) = self.clear_call(&mut conn, HangupCause::NORMAL_CLEARING).await {
                    debug!("Hangup during shutdown failed: {}", e);
                }
                if let Some(request) = self.dialect.shutdown_request() {
                    if let Err(e) = conn.send(request).await {
                        debug!("Shutdown request to {} failed: {}", conn.peer_addr(), e);
                    }
                }
                self.ctx.registry.set_health(id, SlotHealth::Absent);
                let _ = conn.close().await;
            }
            SessionEnd::Expired(e) => {
                warn!(slot = id, "{}", e);
                self.finish_leg(HangupCause::RECOVERY_ON_TIMER_EXPIRE).await;
                self.ctx.registry.set_health(id, SlotHealth::Expired);
                self.ctx.registry.force_idle(id);
                self.set_state(LoopState::Expired);
            }
            SessionEnd::Closed => {
                self.finish_leg(HangupCause::DESTINATION_OUT_OF_ORDER).await;
                self.ctx.registry.set_health(id, SlotHealth::Absent);
                self.set_state(LoopState::Disconnected);
            }
            SessionEnd::Unregistered => {
                self.ctx.registry.set_health(id, SlotHealth::Absent);
                let _ = conn.close().await;
                self.set_state(LoopState::Disconnected);
            }
            SessionEnd::Replaced(_) => {
                info!(slot = id, "Interface {} re-registered from a new connection", self.slot.name());
                self.finish_leg(HangupCause::NORMAL_CLEARING).await;
            }
            SessionEnd::Fault(_) => {
                self.finish_leg(HangupCause::DESTINATION_OUT_OF_ORDER).await;
                self.ctx.registry.set_health(id, SlotHealth::Faulted);
            }
        }
    }

    async fn on_inbound(
        &mut self,
        conn: &mut LineConnection,
        inbound: rvoip_line_transport::Result<Option<Inbound>>,
    ) -> Result<Option<SessionEnd>> {
        match inbound {
            Ok(Some(Inbound::Message(message))) => {
                self.last_activity = Instant::now();
                self.malformed_run = 0;
                self.on_message(conn, message).await
            }
            Ok(Some(Inbound::Malformed(e))) => {
                self.last_activity = Instant::now();
                self.malformed_run += 1;
                if self.dialect.malformed_policy().disconnects_after(self.malformed_run) {
                    warn!(
                        slot = self.slot.id(),
                        "Dropping connection to {} after {} malformed messages: {}",
                        conn.peer_addr(),
                        self.malformed_run,
                        e
                    );
                    return Ok(Some(SessionEnd::Closed));
                }
                debug!(slot = self.slot.id(), "Dropped malformed message from {}: {}", conn.peer_addr(), e);
                Ok(None)
            }
            Ok(None) => {
                info!(slot = self.slot.id(), "Device on {} disconnected", self.slot.name());
                Ok(Some(SessionEnd::Closed))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn on_message(&mut self, conn: &mut LineConnection, message: LineMessage) -> Result<Option<SessionEnd>> {
        match message {
            LineMessage::KeepAlive { timestamp } => {
                trace!(slot = self.slot.id(), "Keepalive {}", timestamp);
                conn.send(LineMessage::KeepAliveAck { timestamp }).await?;
            }
            LineMessage::KeepAliveAck { .. } => {}
            LineMessage::Register { device_id, .. } => {
                debug!(slot = self.slot.id(), "Repeated registration from device {}", device_id);
                conn.send(LineMessage::RegisterAck {
                    keepalive_secs: self.slot.config().keepalive_secs,
                })
                .await?;
            }
            LineMessage::Unregister => {
                info!(slot = self.slot.id(), "Device on {} unregistered", self.slot.name());
                self.finish_leg(HangupCause::NORMAL_CLEARING).await;
                conn.send(LineMessage::UnregisterAck).await?;
                return Ok(Some(SessionEnd::Unregistered));
            }
            LineMessage::CallControl {
                call_ref,
                action,
                cause,
                party,
            } => self.on_call_control(conn, call_ref, action, cause, party).await?,
            LineMessage::Dtmf {
                call_ref,
                digit,
                duration_ms,
            } => self.on_dtmf(call_ref, digit, duration_ms).await,
            LineMessage::MediaNegotiation {
                call_ref,
                address,
                port,
                codec,
                sample_rate,
                frame_ms,
            } => {
                let remote = SocketAddr::new(address, port);
                let codec = if codec.is_empty() {
                    self.ctx.default_codec.clone()
                } else {
                    CodecDescriptor::new(codec, sample_rate, frame_ms)
                };
                self.on_media(conn, call_ref, remote, codec).await?
            }
            other => debug!(slot = self.slot.id(), "Ignoring {} from device", other.id().name()),
        }
        Ok(None)
    }

    fn is_current(&self, call_ref: CallReference) -> bool {
        self.leg.as_ref().map_or(false, |leg| leg.call_ref() == call_ref)
    }

    async fn on_call_control(
        &mut self,
        conn: &mut LineConnection,
        call_ref: CallReference,
        action: CallAction,
        cause: HangupCause,
        party: String,
    ) -> Result<()> {
        if !self.is_current(call_ref) {
            match action {
                CallAction::Offer => return self.accept_inbound(conn, call_ref, party).await,
                CallAction::Hangup => debug!(call_ref = %call_ref, "Hangup for unknown call"),
                other => warn!(call_ref = %call_ref, "{:?} for unknown call", other),
            }
            return Ok(());
        }

        match action {
            CallAction::Offer => warn!(call_ref = %call_ref, "Repeated offer ignored"),
            CallAction::Ring => {
                self.report(ChannelState::RingReady).await;
                self.acknowledge_pending();
            }
            CallAction::Answer => {
                self.report(ChannelState::Answered).await;
                self.acknowledge_pending();
            }
            CallAction::Hold => self.report(ChannelState::Held).await,
            CallAction::Resume => {
                let active = self
                    .leg
                    .as_ref()
                    .map_or(false, |leg| leg.phase() == ChannelPhase::Active);
                let state = if active {
                    ChannelState::ExchangeMedia
                } else {
                    ChannelState::Answered
                };
                self.report(state).await;
            }
            CallAction::Hangup => {
                let cause = if cause == HangupCause::NONE {
                    HangupCause::NORMAL_CLEARING
                } else {
                    cause
                };
                info!(call_ref = %call_ref, "Device hung up {}: {}", self.slot.name(), cause);
                self.finish_leg(cause).await;
            }
        }
        Ok(())
    }

    async fn accept_inbound(&mut self, conn: &mut LineConnection, call_ref: CallReference, party: String) -> Result<()> {
        if self.leg.is_some() {
            info!(call_ref = %call_ref, "Rejecting inbound call on {}: line busy", self.slot.name());
            self.ctx.stats.record_inbound_failed();
            conn.send(LineMessage::hangup(call_ref, HangupCause::USER_BUSY)).await?;
            return Ok(());
        }

        let handle = match self.ctx.registry.reserve(&SlotSelector::Id(self.slot.id())) {
            Ok(handle) => handle,
            Err(e) => {
                info!(call_ref = %call_ref, "Rejecting inbound call: {}", e);
                self.ctx.stats.record_inbound_failed();
                conn.send(LineMessage::hangup(call_ref, HangupCause::USER_BUSY)).await?;
                return Ok(());
            }
        };

        let name = format!("{}/{}", self.dialect.name(), self.slot.name());
        let profile = CallerProfile::inbound(
            self.slot.config(),
            self.dialect.name(),
            &party,
            Some(conn.peer_addr().ip()),
        );
        let mut leg = CallLeg::new(handle, CallDirection::Inbound, call_ref, name);

        match leg.start_routing(self.ctx.runtime.as_ref(), profile).await {
            Ok(token) => {
                info!(
                    slot = self.slot.id(),
                    call_ref = %call_ref,
                    "Inbound call from {} on {} as session {}",
                    party,
                    self.slot.name(),
                    token
                );
                self.ctx.directory.insert(token, self.slot.id());
                self.ctx.stats.record_inbound();
                self.leg = Some(leg);
                self.set_state(LoopState::Active(call_ref));
            }
            Err(e) => {
                warn!(call_ref = %call_ref, "Runtime refused inbound call: {}", e);
                leg.destroy(self.ctx.runtime.as_ref(), &self.ctx.registry).await;
                self.ctx.stats.record_inbound_failed();
                conn.send(LineMessage::hangup(call_ref, HangupCause::NORMAL_TEMPORARY_FAILURE))
                    .await?;
            }
        }
        Ok(())
    }

    async fn on_dtmf(&mut self, call_ref: CallReference, digit: DtmfDigit, duration_ms: u32) {
        let Some(leg) = self.leg.as_ref().filter(|leg| leg.call_ref() == call_ref) else {
            debug!(call_ref = %call_ref, "DTMF {} for unknown call", digit);
            return;
        };
        debug!(call_ref = %call_ref, "DTMF {} from device", digit);
        let event = DtmfEvent::new(digit, Duration::from_millis(u64::from(duration_ms)));
        if let Err(e) = leg.queue_dtmf(self.ctx.runtime.as_ref(), event).await {
            warn!(call_ref = %call_ref, "Could not queue DTMF: {}", e);
        }
    }

    async fn on_media(
        &mut self,
        conn: &mut LineConnection,
        call_ref: CallReference,
        remote: SocketAddr,
        codec: CodecDescriptor,
    ) -> Result<()> {
        let routing = self
            .leg
            .as_ref()
            .map_or(false, |leg| leg.call_ref() == call_ref && leg.phase() == ChannelPhase::Routing);
        if !routing {
            debug!(call_ref = %call_ref, "Ignoring media negotiation");
            return Ok(());
        }

        let (bind, linear_configured) = {
            let config = self.slot.config();
            (config.media_bind, config.capabilities.linear_audio)
        };
        let path = match self.ctx.media.open(bind, remote, &codec).await {
            Ok(path) => path,
            Err(e) => {
                warn!(call_ref = %call_ref, "Cannot open media path to {}: {}", remote, e);
                return self.clear_call(conn, HangupCause::NORMAL_TEMPORARY_FAILURE).await;
            }
        };
        let local = path.local_addr();
        let linear = linear_configured && self.device_caps.linear_audio;

        let activated = match self.leg.as_mut() {
            Some(leg) => {
                leg.activate_media(self.ctx.runtime.as_ref(), codec.clone(), path, linear)
                    .await
            }
            None => return Ok(()),
        };
        if let Err(e) = activated {
            warn!(call_ref = %call_ref, "Media activation failed: {}", e);
            return self.clear_call(conn, HangupCause::NORMAL_TEMPORARY_FAILURE).await;
        }

        let address = if local.ip().is_unspecified() {
            conn.local_addr().ip()
        } else {
            local.ip()
        };
        info!(call_ref = %call_ref, "Media {} <-> {} using {}", local, remote, codec.name);
        conn.send(LineMessage::MediaNegotiation {
            call_ref,
            address,
            port: local.port(),
            codec: codec.name,
            sample_rate: codec.sample_rate,
            frame_ms: codec.frame_ms,
        })
        .await?;
        self.acknowledge_pending();
        Ok(())
    }

    async fn on_command(&mut self, conn: &mut LineConnection, command: LoopCommand) -> Result<()> {
        match command {
            LoopCommand::Originate(request) => self.place_call(conn, request).await,
            LoopCommand::CancelOriginate(leg) => {
                if self.leg.as_ref().map_or(false, |current| current.id() == leg) {
                    info!(slot = self.slot.id(), "Cancelling unanswered call on {}", self.slot.name());
                    self.pending = None;
                    self.clear_call(conn, HangupCause::NO_ANSWER).await
                } else {
                    Ok(())
                }
            }
            LoopCommand::Kill { token, signal } => {
                if self.leg.as_ref().and_then(CallLeg::token) == Some(&token) {
                    self.apply_kill(conn, signal).await
                } else {
                    debug!("Kill for session {} not on {}", token, self.slot.name());
                    Ok(())
                }
            }
        }
    }

    async fn place_call(&mut self, conn: &mut LineConnection, request: OutboundRequest) -> Result<()> {
        let OutboundRequest { handle, profile, reply } = request;
        if self.leg.is_some() {
            self.ctx.registry.release(&handle);
            let _ = reply.send(Err(OriginateError::Busy(self.slot.name().to_string())));
            return Ok(());
        }

        let call_ref = self.allocate_call_ref();
        let destination = profile.destination_number.clone();
        let mut leg = CallLeg::new(handle, CallDirection::Outbound, call_ref, profile.channel_name.clone());
        let token = match leg.start_routing(self.ctx.runtime.as_ref(), profile).await {
            Ok(token) => token,
            Err(e) => {
                warn!(call_ref = %call_ref, "Runtime refused outbound call: {}", e);
                leg.destroy(self.ctx.runtime.as_ref(), &self.ctx.registry).await;
                let _ = reply.send(Err(OriginateError::NoProfile(e.to_string())));
                return Ok(());
            }
        };

        info!(
            slot = self.slot.id(),
            call_ref = %call_ref,
            "Placing call to {} on {} as session {}",
            destination,
            self.slot.name(),
            token
        );
        self.ctx.directory.insert(token.clone(), self.slot.id());
        self.ctx.stats.record_outbound();
        self.pending = Some(PendingOriginate {
            leg: leg.id(),
            token,
            reply,
        });
        self.leg = Some(leg);
        self.set_state(LoopState::Active(call_ref));

        let offer = LineMessage::CallControl {
            call_ref,
            action: CallAction::Offer,
            cause: HangupCause::NONE,
            party: destination,
        };
        if let Err(e) = conn.send(offer).await {
            self.finish_leg(HangupCause::DESTINATION_OUT_OF_ORDER).await;
            return Err(e.into());
        }
        Ok(())
    }

    fn allocate_call_ref(&mut self) -> CallReference {
        let call_ref = CallReference(self.next_call_ref);
        self.next_call_ref = self
            .next_call_ref
            .checked_add(1)
            .unwrap_or(OUTBOUND_CALL_REF_BASE);
        call_ref
    }

    async fn on_runtime_event(&mut self, conn: &mut LineConnection, event: RuntimeEvent) -> Result<()> {
        match event {
            RuntimeEvent::Kill(signal) => self.apply_kill(conn, signal).await,
            RuntimeEvent::Answer => {
                let Some(leg) = self.leg.as_ref() else {
                    return Ok(());
                };
                if leg.direction() != CallDirection::Inbound {
                    debug!(call_ref = %leg.call_ref(), "Ignoring answer for outbound call");
                    return Ok(());
                }
                let call_ref = leg.call_ref();
                if let Err(e) = leg.report_state(self.ctx.runtime.as_ref(), ChannelState::Answered).await {
                    warn!(call_ref = %call_ref, "Could not report answer: {}", e);
                }
                conn.send(LineMessage::call_control(call_ref, CallAction::Answer)).await?;
                Ok(())
            }
            RuntimeEvent::SendDtmf(dtmf) => {
                let Some(call_ref) = self.leg.as_ref().map(CallLeg::call_ref) else {
                    return Ok(());
                };
                if !self.dialect.mirrors_dtmf() {
                    debug!(call_ref = %call_ref, "Not sending DTMF {} to {} device", dtmf.digit, self.dialect.name());
                    return Ok(());
                }
                conn.send(LineMessage::Dtmf {
                    call_ref,
                    digit: dtmf.digit,
                    duration_ms: duration_ms(dtmf.duration),
                })
                .await?;
                Ok(())
            }
            RuntimeEvent::Hangup(cause) => self.clear_call(conn, cause).await,
        }
    }

    async fn apply_kill(&mut self, conn: &mut LineConnection, signal: KillSignal) -> Result<()> {
        match signal {
            KillSignal::Break => {
                if let Some(leg) = self.leg.as_ref() {
                    leg.request_break();
                }
                Ok(())
            }
            KillSignal::Kill => {
                info!(slot = self.slot.id(), "Kill requested on {}", self.slot.name());
                self.clear_call(conn, HangupCause::NORMAL_CLEARING).await
            }
        }
    }

    async fn report(&self, state: ChannelState) {
        if let Some(leg) = self.leg.as_ref() {
            if let Err(e) = leg.report_state(self.ctx.runtime.as_ref(), state).await {
                warn!(call_ref = %leg.call_ref(), "Could not report {:?}: {}", state, e);
            }
        }
    }

    /// Tell the device to hang up the current call, then destroy the leg
    async fn clear_call(&mut self, conn: &mut LineConnection, cause: HangupCause) -> Result<()> {
        let Some(call_ref) = self.leg.as_ref().map(CallLeg::call_ref) else {
            return Ok(());
        };
        let sent = conn.send(LineMessage::hangup(call_ref, cause)).await;
        self.finish_leg(cause).await;
        sent.map_err(Into::into)
    }

    /// Destroy the current leg, if any, and settle a waiting origination
    async fn finish_leg(&mut self, cause: HangupCause) {
        let Some(mut leg) = self.leg.take() else {
            return;
        };
        leg.request_hangup(cause);
        if let Some(token) = leg.token() {
            self.ctx.directory.remove(token);
        }
        leg.destroy(self.ctx.runtime.as_ref(), &self.ctx.registry).await;

        if let Some(pending) = self.pending.take() {
            if pending.leg == leg.id() {
                let outcome = if cause == HangupCause::USER_BUSY {
                    OriginateError::Busy(self.slot.name().to_string())
                } else {
                    OriginateError::Unavailable(format!("{} ({})", self.slot.name(), cause))
                };
                let _ = pending.reply.send(Err(outcome));
            } else {
                self.pending = Some(pending);
            }
        }

        let current = *self.state.borrow();
        if current.is_registered() {
            self.set_state(LoopState::Registered);
        }
    }

    fn acknowledge_pending(&mut self) {
        let current = self.leg.as_ref().map(CallLeg::id);
        if let Some(pending) = self.pending.take() {
            if Some(pending.leg) == current {
                debug!("Device acknowledged session {}", pending.token);
                let _ = pending.reply.send(Ok(pending.token));
            } else {
                self.pending = Some(pending);
            }
        }
    }
}

/// Turn a command away while no device is registered
fn refuse(registry: &InterfaceRegistry, slot: &InterfaceSlot, command: LoopCommand) {
    match command {
        LoopCommand::Originate(request) => {
            registry.release(&request.handle);
            let _ = request
                .reply
                .send(Err(OriginateError::Unavailable(slot.name().to_string())));
        }
        other => debug!(slot = slot.id(), "Dropping {:?}: no device registered", other),
    }
}

async fn next_leg_event(leg: &mut Option<CallLeg>) -> RuntimeEvent {
    match leg {
        Some(leg) => leg.next_event().await,
        None => std::future::pending().await,
    }
}

async fn recv_attach(attach: &mut Option<mpsc::Receiver<PendingConnection>>) -> Option<PendingConnection> {
    match attach {
        Some(rx) => rx.recv().await,
        None => None,
    }
}

/// Tone length on the wire, saturating at the field's range
fn duration_ms(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

fn expiry_check_period(expiry: Duration) -> Duration {
    (expiry / 4).clamp(Duration::from_millis(50), Duration::from_secs(5))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_check_period_bounds() {
        assert_eq!(expiry_check_period(Duration::from_secs(60)), Duration::from_secs(5));
        assert_eq!(expiry_check_period(Duration::from_secs(2)), Duration::from_millis(500));
        assert_eq!(expiry_check_period(Duration::from_millis(40)), Duration::from_millis(50));
    }

    #[test]
    fn test_dtmf_duration_saturates() {
        assert_eq!(duration_ms(Duration::from_millis(120)), 120);
        assert_eq!(duration_ms(Duration::from_secs(u64::from(u32::MAX))), u32::MAX);
    }

    #[test]
    fn test_loop_state_registration() {
        assert!(LoopState::Registered.is_registered());
        assert!(LoopState::Active(CallReference(3)).is_registered());
        assert!(!LoopState::Expired.is_registered());
    }

    #[test]
    fn test_call_directory() {
        let directory = CallDirectory::default();
        let token = SessionToken::new("abc");
        directory.insert(token.clone(), 4);
        assert_eq!(directory.slot_for(&token), Some(4));
        assert_eq!(directory.remove(&token), Some(4));
        assert!(directory.is_empty());
    }
}
