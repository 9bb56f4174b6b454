//! In-process session runtime
//!
//! Keeps sessions in memory, records every state change and parks frame
//! bridges so callers can drive media by hand. Used by the daemon when no
//! external call engine is attached, and by tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use rvoip_line_codec::HangupCause;

use super::{
    CallDirection, CallerProfile, ChannelState, DtmfEvent, KillSignal, RuntimeEvent, RuntimeSubscription,
    SessionRuntime, SessionToken,
};
use crate::channel::FrameBridge;
use crate::errors::RuntimeError;

#[derive(Debug)]
struct MemorySession {
    direction: CallDirection,
    profile: CallerProfile,
    history: Vec<ChannelState>,
    dtmf: VecDeque<DtmfEvent>,
    bridge: Option<FrameBridge>,
}

#[derive(Debug, Default)]
pub struct MemoryRuntime {
    sessions: DashMap<SessionToken, MemorySession>,
    subscribers: DashMap<SessionToken, mpsc::UnboundedSender<RuntimeEvent>>,
    auto_answer: bool,
    max_sessions: Option<usize>,
    created: AtomicU64,
    destroyed: AtomicU64,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every inbound call as soon as its leg subscribes
    pub fn with_auto_answer(mut self) -> Self {
        self.auto_answer = true;
        self
    }

    /// Refuse new sessions while `limit` are live
    pub fn with_session_limit(mut self, limit: usize) -> Self {
        self.max_sessions = Some(limit);
        self
    }

    /// Deliver an event to the leg subscribed to `token`
    pub fn send(&self, token: &SessionToken, event: RuntimeEvent) -> bool {
        match self.subscribers.get(token) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn kill(&self, token: &SessionToken, signal: KillSignal) -> bool {
        self.send(token, RuntimeEvent::Kill(signal))
    }

    pub fn answer(&self, token: &SessionToken) -> bool {
        self.send(token, RuntimeEvent::Answer)
    }

    pub fn hangup(&self, token: &SessionToken, cause: HangupCause) -> bool {
        self.send(token, RuntimeEvent::Hangup(cause))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn destroyed_count(&self) -> u64 {
        self.destroyed.load(Ordering::Relaxed)
    }

    pub fn contains(&self, token: &SessionToken) -> bool {
        self.sessions.contains_key(token)
    }

    pub fn tokens(&self) -> Vec<SessionToken> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn direction(&self, token: &SessionToken) -> Option<CallDirection> {
        self.sessions.get(token).map(|s| s.direction)
    }

    /// Every state reported for the session, oldest first
    pub fn state_history(&self, token: &SessionToken) -> Vec<ChannelState> {
        self.sessions
            .get(token)
            .map(|s| s.history.clone())
            .unwrap_or_default()
    }

    pub fn bridge(&self, token: &SessionToken) -> Option<FrameBridge> {
        self.sessions.get(token).and_then(|s| s.bridge.clone())
    }

    pub fn is_subscribed(&self, token: &SessionToken) -> bool {
        self.subscribers.contains_key(token)
    }
}

#[async_trait]
impl SessionRuntime for MemoryRuntime {
    async fn create_session(
        &self,
        direction: CallDirection,
        profile: CallerProfile,
    ) -> Result<SessionToken, RuntimeError> {
        if let Some(limit) = self.max_sessions {
            if self.sessions.len() >= limit {
                return Err(RuntimeError::Rejected(format!("{} sessions already live", limit)));
            }
        }
        let token = SessionToken::new(Uuid::new_v4().to_string());
        info!(
            "Created {} session {} on {} for {}",
            direction, token, profile.channel_name, profile.destination_number
        );
        self.sessions.insert(
            token.clone(),
            MemorySession {
                direction,
                profile,
                history: vec![ChannelState::Init],
                dtmf: VecDeque::new(),
                bridge: None,
            },
        );
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(token)
    }

    async fn destroy_session(&self, token: &SessionToken) {
        self.subscribers.remove(token);
        if self.sessions.remove(token).is_some() {
            self.destroyed.fetch_add(1, Ordering::Relaxed);
            debug!("Destroyed session {}", token);
        }
    }

    async fn set_channel_state(&self, token: &SessionToken, state: ChannelState) -> Result<(), RuntimeError> {
        let mut session = self
            .sessions
            .get_mut(token)
            .ok_or_else(|| RuntimeError::SessionNotFound(token.to_string()))?;
        if session.history.last() != Some(&state) {
            debug!("Session {} state {:?}", token, state);
            session.history.push(state);
        }
        Ok(())
    }

    async fn channel_state(&self, token: &SessionToken) -> Option<ChannelState> {
        self.sessions.get(token).and_then(|s| s.history.last().copied())
    }

    async fn caller_profile(&self, token: &SessionToken) -> Option<CallerProfile> {
        self.sessions.get(token).map(|s| s.profile.clone())
    }

    async fn set_caller_profile(&self, token: &SessionToken, profile: CallerProfile) -> Result<(), RuntimeError> {
        let mut session = self
            .sessions
            .get_mut(token)
            .ok_or_else(|| RuntimeError::SessionNotFound(token.to_string()))?;
        session.profile = profile;
        Ok(())
    }

    async fn queue_dtmf(&self, token: &SessionToken, event: DtmfEvent) -> Result<(), RuntimeError> {
        let mut session = self
            .sessions
            .get_mut(token)
            .ok_or_else(|| RuntimeError::SessionNotFound(token.to_string()))?;
        debug!("Session {} queued DTMF {}", token, event.digit);
        session.dtmf.push_back(event);
        Ok(())
    }

    async fn dequeue_dtmf(&self, token: &SessionToken) -> Option<DtmfEvent> {
        self.sessions.get_mut(token).and_then(|mut s| s.dtmf.pop_front())
    }

    fn subscribe(&self, token: &SessionToken) -> Result<RuntimeSubscription, RuntimeError> {
        let direction = self
            .direction(token)
            .ok_or_else(|| RuntimeError::SessionNotFound(token.to_string()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        if self.auto_answer && direction == CallDirection::Inbound {
            let _ = tx.send(RuntimeEvent::Answer);
        }
        self.subscribers.insert(token.clone(), tx);
        Ok(rx)
    }

    fn unsubscribe(&self, token: &SessionToken) {
        self.subscribers.remove(token);
    }

    async fn attach_media(&self, token: &SessionToken, bridge: FrameBridge) -> Result<(), RuntimeError> {
        let mut session = self
            .sessions
            .get_mut(token)
            .ok_or_else(|| RuntimeError::SessionNotFound(token.to_string()))?;
        session.bridge = Some(bridge);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvoip_line_codec::DtmfDigit;
    use std::time::Duration;

    fn profile() -> CallerProfile {
        CallerProfile {
            caller_id_name: "lobby".into(),
            caller_id_number: "100".into(),
            destination_number: "5551212".into(),
            dialplan: "XML".into(),
            context: "default".into(),
            source: super::super::PROFILE_SOURCE.into(),
            channel_name: "handset/lobby/5551212".into(),
            network_addr: None,
        }
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let runtime = MemoryRuntime::new();
        let token = runtime.create_session(CallDirection::Outbound, profile()).await.unwrap();
        runtime.set_channel_state(&token, ChannelState::Routing).await.unwrap();
        runtime.set_channel_state(&token, ChannelState::Routing).await.unwrap();
        assert_eq!(
            runtime.state_history(&token),
            vec![ChannelState::Init, ChannelState::Routing]
        );
        assert_eq!(runtime.channel_state(&token).await, Some(ChannelState::Routing));

        runtime.destroy_session(&token).await;
        runtime.destroy_session(&token).await;
        assert_eq!(runtime.destroyed_count(), 1);
        assert!(runtime
            .set_channel_state(&token, ChannelState::Answered)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_session_limit_rejects_until_a_session_ends() {
        let runtime = MemoryRuntime::new().with_session_limit(1);
        let first = runtime.create_session(CallDirection::Inbound, profile()).await.unwrap();
        let refused = runtime.create_session(CallDirection::Inbound, profile()).await;
        assert!(matches!(refused, Err(RuntimeError::Rejected(_))));
        assert_eq!(runtime.created_count(), 1);

        runtime.destroy_session(&first).await;
        assert!(runtime.create_session(CallDirection::Outbound, profile()).await.is_ok());
    }

    #[tokio::test]
    async fn test_dtmf_queue_is_fifo() {
        let runtime = MemoryRuntime::new();
        let token = runtime.create_session(CallDirection::Inbound, profile()).await.unwrap();
        for c in ['1', '2'] {
            let event = DtmfEvent::new(DtmfDigit::new(c).unwrap(), Duration::from_millis(100));
            runtime.queue_dtmf(&token, event).await.unwrap();
        }
        assert_eq!(runtime.dequeue_dtmf(&token).await.unwrap().digit.as_char(), '1');
        assert_eq!(runtime.dequeue_dtmf(&token).await.unwrap().digit.as_char(), '2');
        assert!(runtime.dequeue_dtmf(&token).await.is_none());
    }

    #[tokio::test]
    async fn test_auto_answer_on_subscribe() {
        let runtime = MemoryRuntime::new().with_auto_answer();
        let inbound = runtime.create_session(CallDirection::Inbound, profile()).await.unwrap();
        let outbound = runtime.create_session(CallDirection::Outbound, profile()).await.unwrap();

        let mut rx = runtime.subscribe(&inbound).unwrap();
        assert_eq!(rx.try_recv().unwrap(), RuntimeEvent::Answer);

        let mut rx = runtime.subscribe(&outbound).unwrap();
        assert!(rx.try_recv().is_err());
        assert!(runtime.kill(&outbound, KillSignal::Break));
        assert_eq!(rx.try_recv().unwrap(), RuntimeEvent::Kill(KillSignal::Break));

        runtime.unsubscribe(&outbound);
        assert!(!runtime.kill(&outbound, KillSignal::Kill));
    }
}
