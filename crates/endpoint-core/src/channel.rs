//! Call-leg state machine
//!
//! A [`CallLeg`] is one call on one slot. It moves through
//!
//! ```text
//! Init -> Routing -> Active -> HungUp -> Destroyed
//!   |        |                  ^
//!   +--------+------------------+
//! ```
//!
//! `Init -> Routing` happens once the runtime session exists and holds the
//! caller profile. `Routing -> Active` happens once media is negotiated and
//! the runtime has the leg's [`FrameBridge`]. Any live phase can hang up, and
//! destruction always releases the registry slot.
//!
//! The leg itself is owned by its signaling loop. The only state shared with
//! the runtime is the flag set and the media path behind the frame bridge.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use rvoip_line_codec::{CallReference, HangupCause};

use crate::errors::ChannelError;
use crate::media::{CodecDescriptor, Frame, MediaPath};
use crate::registry::{InterfaceRegistry, LegId, SlotHandle, SlotId};
use crate::runtime::{
    CallDirection, CallerProfile, ChannelState, DtmfEvent, RuntimeEvent, RuntimeSubscription, SessionRuntime,
    SessionToken,
};

/// Lifecycle phase of a call leg
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPhase {
    Init,
    Routing,
    Active,
    HungUp,
    Destroyed,
}

impl ChannelPhase {
    pub fn can_transition_to(self, next: ChannelPhase) -> bool {
        use ChannelPhase::*;
        matches!(
            (self, next),
            (Init, Routing) | (Routing, Active) | (Init | Routing | Active, HungUp) | (HungUp, Destroyed)
        )
    }

    pub fn is_live(self) -> bool {
        !matches!(self, Self::HungUp | Self::Destroyed)
    }
}

/// Independent per-leg flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LegFlagSet {
    /// Frames may flow
    pub io: bool,
    pub media_active: bool,
    pub dtmf_pending: bool,
    pub hangup_requested: bool,
    /// Frames are raw 16-bit linear samples
    pub linear_audio: bool,
    pub break_requested: bool,
    pub reading: bool,
    pub writing: bool,
}

#[derive(Debug, Clone, Copy)]
enum IoDirection {
    Read,
    Write,
}

/// Flag set guarded so that related flags change together
///
/// `hangup_requested` has no clearing setter.
#[derive(Debug, Default)]
pub struct LegFlags {
    inner: Mutex<LegFlagSet>,
}

impl LegFlags {
    pub fn snapshot(&self) -> LegFlagSet {
        *self.inner.lock()
    }

    /// Open the leg for frames; refused once hangup was requested
    pub fn start_media(&self, linear_audio: bool) -> bool {
        let mut flags = self.inner.lock();
        if flags.hangup_requested {
            return false;
        }
        flags.io = true;
        flags.media_active = true;
        flags.linear_audio = linear_audio;
        true
    }

    pub fn set_dtmf_pending(&self, pending: bool) {
        self.inner.lock().dtmf_pending = pending;
    }

    pub fn request_break(&self) -> bool {
        let mut flags = self.inner.lock();
        if flags.hangup_requested {
            return false;
        }
        flags.break_requested = true;
        true
    }

    /// Consume a pending break
    pub fn take_break(&self) -> bool {
        std::mem::take(&mut self.inner.lock().break_requested)
    }

    /// Mark the leg hung up and clear every media flag
    ///
    /// Returns `true` only for the first request.
    pub fn request_hangup(&self) -> bool {
        let mut flags = self.inner.lock();
        let first = !flags.hangup_requested;
        flags.hangup_requested = true;
        flags.io = false;
        flags.media_active = false;
        flags.reading = false;
        flags.writing = false;
        first
    }

    /// Mark a read or write in progress until the guard drops
    fn begin(&self, direction: IoDirection) -> Result<IoGuard<'_>, ChannelError> {
        let mut flags = self.inner.lock();
        if flags.hangup_requested {
            return Err(ChannelError::HungUp);
        }
        if !flags.io {
            return Err(ChannelError::NotActive);
        }
        match direction {
            IoDirection::Read => flags.reading = true,
            IoDirection::Write => flags.writing = true,
        }
        Ok(IoGuard { flags: self, direction })
    }

    fn end(&self, direction: IoDirection) {
        let mut flags = self.inner.lock();
        match direction {
            IoDirection::Read => flags.reading = false,
            IoDirection::Write => flags.writing = false,
        }
    }
}

/// Clears the in-progress flag even when the I/O future is dropped midway
struct IoGuard<'a> {
    flags: &'a LegFlags,
    direction: IoDirection,
}

impl Drop for IoGuard<'_> {
    fn drop(&mut self) {
        self.flags.end(self.direction);
    }
}

struct LegShared {
    name: String,
    flags: LegFlags,
    codec: RwLock<Option<CodecDescriptor>>,
    media: RwLock<Option<Arc<dyn MediaPath>>>,
    wake: Notify,
}

impl LegShared {
    fn interrupt(&self) {
        self.wake.notify_waiters();
    }
}

/// Frame read/write pair handed to the session runtime
#[derive(Clone)]
pub struct FrameBridge {
    shared: Arc<LegShared>,
}

enum ReadOutcome {
    Data(io::Result<Bytes>),
    Interrupted,
    Idle,
}

impl FrameBridge {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn flags(&self) -> LegFlagSet {
        self.shared.flags.snapshot()
    }

    pub fn codec(&self) -> Option<CodecDescriptor> {
        self.shared.codec.read().clone()
    }

    fn media(&self) -> Result<(CodecDescriptor, Arc<dyn MediaPath>), ChannelError> {
        let flags = self.shared.flags.snapshot();
        if flags.hangup_requested {
            return Err(ChannelError::HungUp);
        }
        let codec = self.shared.codec.read().clone();
        let media = self.shared.media.read().clone();
        match (flags.io, codec, media) {
            (true, Some(codec), Some(media)) => Ok((codec, media)),
            _ => Err(ChannelError::NotActive),
        }
    }

    /// Next frame from the device
    ///
    /// Waits at most one frame duration. With nothing to deliver, or after a
    /// break request, returns a comfort-noise frame instead.
    pub async fn read_frame(&self) -> Result<Frame, ChannelError> {
        loop {
            // Registered before the flags are checked so a hangup or break
            // landing in between still wakes this read.
            let interrupted = self.shared.wake.notified();
            tokio::pin!(interrupted);
            interrupted.as_mut().enable();

            let (codec, media) = self.media()?;
            if self.shared.flags.take_break() {
                debug!("Break on {}", self.shared.name);
                return Ok(Frame::comfort_noise(codec.sample_rate));
            }

            let reading = self.shared.flags.begin(IoDirection::Read)?;
            let outcome = tokio::select! {
                received = media.recv() => ReadOutcome::Data(received),
                _ = &mut interrupted => ReadOutcome::Interrupted,
                _ = tokio::time::sleep(codec.frame_duration()) => ReadOutcome::Idle,
            };
            drop(reading);

            match outcome {
                ReadOutcome::Data(Ok(data)) if data.is_empty() => continue,
                ReadOutcome::Data(Ok(data)) => {
                    let linear = self.shared.flags.snapshot().linear_audio;
                    return Ok(Frame::voice(device_order(data, linear), codec.sample_rate));
                }
                ReadOutcome::Data(Err(e)) => return Err(ChannelError::Media(e)),
                ReadOutcome::Interrupted => continue,
                ReadOutcome::Idle => return Ok(Frame::comfort_noise(codec.sample_rate)),
            }
        }
    }

    /// Forward a frame to the device
    ///
    /// Comfort-noise frames are not forwarded. A short write is logged and
    /// otherwise ignored.
    pub async fn write_frame(&self, frame: &Frame) -> Result<(), ChannelError> {
        let (_, media) = self.media()?;
        if frame.is_comfort_noise() {
            return Ok(());
        }

        let writing = self.shared.flags.begin(IoDirection::Write)?;
        let linear = self.shared.flags.snapshot().linear_audio;
        let payload = device_order(frame.data.clone(), linear);
        let sent = media.send(&payload).await;
        drop(writing);

        match sent {
            Ok(n) if n < payload.len() => {
                warn!("Short write on {}: {} of {} bytes", self.shared.name, n, payload.len());
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("Media write failed on {}: {}", self.shared.name, e);
                Err(ChannelError::Media(e))
            }
        }
    }
}

impl fmt::Debug for FrameBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBridge")
            .field("name", &self.shared.name)
            .field("flags", &self.shared.flags.snapshot())
            .finish()
    }
}

/// Devices carry linear samples little-endian
fn device_order(data: Bytes, linear: bool) -> Bytes {
    if !linear || cfg!(target_endian = "little") {
        return data;
    }
    let mut swapped = BytesMut::from(&data[..]);
    for pair in swapped.chunks_exact_mut(2) {
        pair.swap(0, 1);
    }
    swapped.freeze()
}

/// One call on one slot
pub struct CallLeg {
    handle: SlotHandle,
    direction: CallDirection,
    call_ref: CallReference,
    phase: ChannelPhase,
    token: Option<SessionToken>,
    events: Option<RuntimeSubscription>,
    shared: Arc<LegShared>,
    hangup_cause: Option<HangupCause>,
    created_at: Instant,
}

impl CallLeg {
    /// New leg in `Init`, occupying the slot behind `handle`
    pub fn new(handle: SlotHandle, direction: CallDirection, call_ref: CallReference, name: impl Into<String>) -> Self {
        Self {
            handle,
            direction,
            call_ref,
            phase: ChannelPhase::Init,
            token: None,
            events: None,
            shared: Arc::new(LegShared {
                name: name.into(),
                flags: LegFlags::default(),
                codec: RwLock::new(None),
                media: RwLock::new(None),
                wake: Notify::new(),
            }),
            hangup_cause: None,
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> LegId {
        self.handle.leg()
    }

    pub fn slot_id(&self) -> SlotId {
        self.handle.slot_id()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn call_ref(&self) -> CallReference {
        self.call_ref
    }

    pub fn phase(&self) -> ChannelPhase {
        self.phase
    }

    pub fn token(&self) -> Option<&SessionToken> {
        self.token.as_ref()
    }

    pub fn hangup_cause(&self) -> Option<HangupCause> {
        self.hangup_cause
    }

    pub fn flags(&self) -> LegFlagSet {
        self.shared.flags.snapshot()
    }

    pub fn bridge(&self) -> FrameBridge {
        FrameBridge {
            shared: Arc::clone(&self.shared),
        }
    }

    fn advance(&mut self, next: ChannelPhase) -> Result<(), ChannelError> {
        if !self.phase.can_transition_to(next) {
            return Err(ChannelError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        debug!(call_ref = %self.call_ref, "Leg {} {:?} -> {:?}", self.shared.name, self.phase, next);
        self.phase = next;
        Ok(())
    }

    /// Create the runtime session and move to `Routing`
    pub async fn start_routing(
        &mut self,
        runtime: &dyn SessionRuntime,
        profile: CallerProfile,
    ) -> Result<SessionToken, ChannelError> {
        if self.phase != ChannelPhase::Init {
            return Err(ChannelError::InvalidTransition {
                from: self.phase,
                to: ChannelPhase::Routing,
            });
        }

        let token = runtime.create_session(self.direction, profile).await?;
        self.token = Some(token.clone());
        self.events = Some(runtime.subscribe(&token)?);
        runtime.set_channel_state(&token, ChannelState::Routing).await?;
        self.advance(ChannelPhase::Routing)?;
        Ok(token)
    }

    /// Install the negotiated media path and move to `Active`
    pub async fn activate_media(
        &mut self,
        runtime: &dyn SessionRuntime,
        codec: CodecDescriptor,
        media: Arc<dyn MediaPath>,
        linear_capable: bool,
    ) -> Result<(), ChannelError> {
        if self.phase != ChannelPhase::Routing {
            return Err(ChannelError::InvalidTransition {
                from: self.phase,
                to: ChannelPhase::Active,
            });
        }
        let token = self.token.clone().ok_or(ChannelError::NotActive)?;

        let linear = linear_capable && codec.is_linear();
        *self.shared.codec.write() = Some(codec);
        *self.shared.media.write() = Some(media);
        if !self.shared.flags.start_media(linear) {
            return Err(ChannelError::HungUp);
        }

        runtime.attach_media(&token, self.bridge()).await?;
        runtime.set_channel_state(&token, ChannelState::ExchangeMedia).await?;
        self.advance(ChannelPhase::Active)
    }

    /// Report a device-side call progress state to the runtime
    pub async fn report_state(&self, runtime: &dyn SessionRuntime, state: ChannelState) -> Result<(), ChannelError> {
        match &self.token {
            Some(token) if self.phase.is_live() => Ok(runtime.set_channel_state(token, state).await?),
            _ => Err(ChannelError::NotActive),
        }
    }

    pub async fn queue_dtmf(&self, runtime: &dyn SessionRuntime, event: DtmfEvent) -> Result<(), ChannelError> {
        let token = self.token.as_ref().ok_or(ChannelError::NotActive)?;
        self.shared.flags.set_dtmf_pending(true);
        runtime.queue_dtmf(token, event).await?;
        Ok(())
    }

    /// Interrupt a blocked frame read
    pub fn request_break(&self) -> bool {
        let requested = self.shared.flags.request_break();
        self.shared.interrupt();
        requested
    }

    /// Move to `HungUp`; later requests keep the first cause
    pub fn request_hangup(&mut self, cause: HangupCause) -> bool {
        if !self.phase.is_live() {
            return false;
        }
        self.shared.flags.request_hangup();
        self.shared.interrupt();
        self.hangup_cause = Some(cause);
        self.phase = ChannelPhase::HungUp;
        info!(
            call_ref = %self.call_ref,
            "Leg {} hung up after {:?}: {}",
            self.shared.name,
            self.created_at.elapsed(),
            cause
        );
        true
    }

    /// Tear the leg down and return its slot to idle
    ///
    /// Works from any phase; a leg that never reached `Active` is hung up
    /// first. Calling it again is a no-op.
    pub async fn destroy(&mut self, runtime: &dyn SessionRuntime, registry: &InterfaceRegistry) {
        if self.phase == ChannelPhase::Destroyed {
            return;
        }
        let cause = self.hangup_cause.unwrap_or(HangupCause::NORMAL_CLEARING);
        self.request_hangup(cause);

        *self.shared.media.write() = None;
        *self.shared.codec.write() = None;
        self.events = None;

        if let Some(token) = self.token.take() {
            if let Err(e) = runtime.set_channel_state(&token, ChannelState::HungUp(cause)).await {
                debug!("Session {} already gone: {}", token, e);
            }
            runtime.unsubscribe(&token);
            runtime.destroy_session(&token).await;
        }

        registry.release(&self.handle);
        self.phase = ChannelPhase::Destroyed;
        debug!(call_ref = %self.call_ref, slot = self.slot_id(), "Leg {} destroyed", self.shared.name);
    }

    /// Next runtime event for this leg
    ///
    /// Pends forever when the leg has no subscription. A runtime that drops
    /// the subscription is treated as a normal hangup.
    pub async fn next_event(&mut self) -> RuntimeEvent {
        let received = match self.events.as_mut() {
            Some(rx) => rx.recv().await,
            None => return std::future::pending::<RuntimeEvent>().await,
        };
        match received {
            Some(event) => event,
            None => {
                self.events = None;
                RuntimeEvent::Hangup(HangupCause::NORMAL_CLEARING)
            }
        }
    }
}

impl fmt::Debug for CallLeg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallLeg")
            .field("name", &self.shared.name)
            .field("leg", &self.handle.leg())
            .field("direction", &self.direction)
            .field("call_ref", &self.call_ref)
            .field("phase", &self.phase)
            .field("token", &self.token)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MemoryMediaPath;
    use crate::registry::{test_registry, SlotSelector};
    use crate::runtime::MemoryRuntime;
    use std::time::Duration;

    fn profile() -> CallerProfile {
        let registry = test_registry(&["a"]);
        CallerProfile::outbound(registry.slot(1).unwrap().config(), "handset", "5551212")
    }

    fn leg(registry: &InterfaceRegistry) -> CallLeg {
        let handle = registry.reserve(&SlotSelector::Id(1)).unwrap();
        CallLeg::new(handle, CallDirection::Outbound, CallReference(1), "handset/a/5551212")
    }

    async fn active_leg(
        registry: &InterfaceRegistry,
        runtime: &MemoryRuntime,
    ) -> (CallLeg, crate::media::MemoryMediaPeer) {
        active_leg_with(registry, runtime, CodecDescriptor::default()).await
    }

    async fn active_leg_with(
        registry: &InterfaceRegistry,
        runtime: &MemoryRuntime,
        codec: CodecDescriptor,
    ) -> (CallLeg, crate::media::MemoryMediaPeer) {
        let mut leg = leg(registry);
        leg.start_routing(runtime, profile()).await.unwrap();
        let (path, peer) = MemoryMediaPath::pair("127.0.0.1:4000".parse().unwrap());
        leg.activate_media(runtime, codec, Arc::new(path), true).await.unwrap();
        (leg, peer)
    }

    /// One-second frames, so an idle read never finishes by itself in these tests
    fn slow_codec() -> CodecDescriptor {
        CodecDescriptor::new("L16", 8000, 1000)
    }

    #[tokio::test]
    async fn test_destroy_from_init_releases_slot() {
        let registry = test_registry(&["a"]);
        let runtime = MemoryRuntime::new();
        let mut leg = leg(&registry);
        assert!(!registry.lookup(1).unwrap().is_idle());

        leg.destroy(&runtime, &registry).await;
        assert_eq!(leg.phase(), ChannelPhase::Destroyed);
        assert!(registry.lookup(1).unwrap().is_idle());
        assert_eq!(runtime.created_count(), 0);
    }

    #[tokio::test]
    async fn test_destroy_from_routing_releases_slot_and_session() {
        let registry = test_registry(&["a"]);
        let runtime = MemoryRuntime::new();
        let mut leg = leg(&registry);
        let token = leg.start_routing(&runtime, profile()).await.unwrap();
        assert_eq!(leg.phase(), ChannelPhase::Routing);
        assert!(runtime.is_subscribed(&token));

        leg.destroy(&runtime, &registry).await;
        leg.destroy(&runtime, &registry).await;
        assert!(registry.lookup(1).unwrap().is_idle());
        assert!(!runtime.contains(&token));
        assert!(!runtime.is_subscribed(&token));
        assert!(leg.token().is_none());
        assert_eq!(registry.lookup(1).unwrap().releases, 1);
    }

    #[tokio::test]
    async fn test_routing_cannot_be_skipped() {
        let registry = test_registry(&["a"]);
        let runtime = MemoryRuntime::new();
        let mut leg = leg(&registry);
        let (path, _peer) = MemoryMediaPath::pair("127.0.0.1:4000".parse().unwrap());
        let result = leg
            .activate_media(&runtime, CodecDescriptor::default(), Arc::new(path), true)
            .await;
        assert!(matches!(
            result,
            Err(ChannelError::InvalidTransition {
                from: ChannelPhase::Init,
                to: ChannelPhase::Active
            })
        ));
    }

    #[tokio::test]
    async fn test_hangup_clears_media_flags_together() {
        let registry = test_registry(&["a"]);
        let runtime = MemoryRuntime::new();
        let (mut leg, _peer) = active_leg(&registry, &runtime).await;
        let flags = leg.flags();
        assert!(flags.io && flags.media_active && flags.linear_audio);

        assert!(leg.request_hangup(HangupCause::USER_BUSY));
        assert!(!leg.request_hangup(HangupCause::NORMAL_CLEARING));
        let flags = leg.flags();
        assert!(flags.hangup_requested);
        assert!(!flags.io && !flags.media_active && !flags.reading && !flags.writing);
        assert_eq!(leg.hangup_cause(), Some(HangupCause::USER_BUSY));

        // hangup is sticky
        assert!(!leg.shared.flags.start_media(true));
        assert!(leg.flags().hangup_requested);
    }

    #[tokio::test]
    async fn test_read_frame_returns_comfort_noise_when_idle() {
        let registry = test_registry(&["a"]);
        let runtime = MemoryRuntime::new();
        let (leg, _peer) = active_leg(&registry, &runtime).await;

        let frame = tokio::time::timeout(Duration::from_secs(1), leg.bridge().read_frame())
            .await
            .unwrap()
            .unwrap();
        assert!(frame.is_comfort_noise());
        assert_eq!(&frame.data[..], &crate::media::CNG_PAYLOAD);
    }

    #[tokio::test]
    async fn test_read_frame_skips_empty_reads() {
        let registry = test_registry(&["a"]);
        let runtime = MemoryRuntime::new();
        let (leg, peer) = active_leg(&registry, &runtime).await;

        peer.to_adapter.send(Bytes::new()).await.unwrap();
        peer.to_adapter.send(Bytes::from_static(&[1, 0, 2, 0])).await.unwrap();
        let frame = leg.bridge().read_frame().await.unwrap();
        assert_eq!(frame.kind, crate::media::FrameKind::Voice);
        assert_eq!(&frame.data[..], &[1, 0, 2, 0]);
    }

    #[tokio::test]
    async fn test_break_and_hangup_interrupt_reads() {
        let registry = test_registry(&["a"]);
        let runtime = MemoryRuntime::new();
        let (mut leg, _peer) = active_leg(&registry, &runtime).await;
        let bridge = leg.bridge();

        assert!(leg.request_break());
        assert!(bridge.read_frame().await.unwrap().is_comfort_noise());
        assert!(!bridge.flags().break_requested);

        leg.request_hangup(HangupCause::NORMAL_CLEARING);
        assert!(matches!(bridge.read_frame().await, Err(ChannelError::HungUp)));
        assert!(matches!(
            bridge.write_frame(&Frame::voice(vec![0u8; 4], 8000)).await,
            Err(ChannelError::HungUp)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_hangup_wakes_a_read_that_is_just_starting() {
        for _ in 0..50 {
            let registry = test_registry(&["a"]);
            let runtime = MemoryRuntime::new();
            let (mut leg, _peer) = active_leg_with(&registry, &runtime, slow_codec()).await;
            let bridge = leg.bridge();

            let reader = tokio::spawn(async move { bridge.read_frame().await });
            tokio::task::yield_now().await;
            leg.request_hangup(HangupCause::NORMAL_CLEARING);

            let result = tokio::time::timeout(Duration::from_millis(500), reader)
                .await
                .expect("read should end well before the frame time")
                .unwrap();
            assert!(matches!(result, Err(ChannelError::HungUp)));
        }
    }

    #[tokio::test]
    async fn test_cancelled_read_clears_reading_flag() {
        let registry = test_registry(&["a"]);
        let runtime = MemoryRuntime::new();
        let (leg, _peer) = active_leg_with(&registry, &runtime, slow_codec()).await;
        let bridge = leg.bridge();

        let mut read = Box::pin(bridge.read_frame());
        tokio::select! {
            _ = &mut read => panic!("read finished without audio"),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }
        assert!(bridge.flags().reading);

        drop(read);
        assert!(!bridge.flags().reading);
        assert!(bridge.flags().io);
    }

    #[tokio::test]
    async fn test_short_write_is_not_fatal() {
        let registry = test_registry(&["a"]);
        let runtime = MemoryRuntime::new();
        let mut leg = leg(&registry);
        leg.start_routing(&runtime, profile()).await.unwrap();
        let (path, mut peer) = MemoryMediaPath::pair("127.0.0.1:4000".parse().unwrap());
        leg.activate_media(&runtime, CodecDescriptor::default(), Arc::new(path.with_write_limit(2)), true)
            .await
            .unwrap();

        let bridge = runtime.bridge(leg.token().unwrap()).unwrap();
        bridge.write_frame(&Frame::voice(vec![1u8, 2, 3, 4], 8000)).await.unwrap();
        assert_eq!(&peer.from_adapter.recv().await.unwrap()[..], &[1, 2]);
        assert!(!bridge.flags().writing);
    }

    #[tokio::test]
    async fn test_write_refused_before_media() {
        let registry = test_registry(&["a"]);
        let runtime = MemoryRuntime::new();
        let mut leg = leg(&registry);
        leg.start_routing(&runtime, profile()).await.unwrap();
        let result = leg.bridge().write_frame(&Frame::voice(vec![0u8; 2], 8000)).await;
        assert!(matches!(result, Err(ChannelError::NotActive)));
    }

    #[tokio::test]
    async fn test_dropped_subscription_reads_as_hangup() {
        let registry = test_registry(&["a"]);
        let runtime = MemoryRuntime::new();
        let mut leg = leg(&registry);
        let token = leg.start_routing(&runtime, profile()).await.unwrap();
        runtime.unsubscribe(&token);
        assert_eq!(
            leg.next_event().await,
            RuntimeEvent::Hangup(HangupCause::NORMAL_CLEARING)
        );
    }
}
