//! Cloud manager (C7): per-device sign-up -> sign-in -> publish -> ping
//! state machine with retry/back-off, driven entirely by [`crate::clock`]
//! callbacks rather than a dedicated task per device.
//!
//! Constants reproduced verbatim from the original implementation's retry
//! tables: `session_timeout = [3, 50, 50, 50, 10]` seconds between sign-up/
//! sign-in/refresh attempts, `message_timeout = [1, 2, 4, 8, 10]` seconds
//! between publish/ping/find attempts, `MAX_RETRY_COUNT = 5`,
//! `MAX_CONTEXT_SIZE = 2`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ocf_async::sync::spin::Mutex;
use tracing::{info, warn};

use crate::clock::{Clock, Tag};
use crate::config::CloudConfig;

pub type DeviceId = u8;

#[derive(thiserror::Error, Debug)]
pub enum CloudError {
    #[error("device {0} already has a cloud context")]
    AlreadyStarted(DeviceId),
    #[error("at capacity: {0} concurrent cloud contexts")]
    Capacity(usize),
    #[error("no cloud context for device {0}")]
    NotStarted(DeviceId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudState {
    Init,
    SigningUp,
    SignedUp,
    SigningIn,
    SignedIn,
    Publishing,
    Published,
    Pinging,
    Finished,
    Reconnecting,
    Reset,
    Fail,
}

/// Terminal states surfaced to the application's callback (§6, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudCallbackEvent {
    Finished,
    Fail,
    Reset,
}

/// The `(HTTP-like status * 10000 + service code)` response classification
/// (§4.6/§4.6.1), expressed as a closed enum rather than string comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudResponseClass {
    TokenExpired,
    AccountAuthorizationFailed,
    DeviceNotFound,
    InternalServerError,
    Other,
}

pub fn classify(status: u32, service_code: u32) -> CloudResponseClass {
    let combined = status * 10000 + service_code;
    match combined {
        4000004 | 4000005 => CloudResponseClass::TokenExpired,
        4010001 | 4010002 | 4030001 | 4040002 => CloudResponseClass::AccountAuthorizationFailed,
        4040001 => CloudResponseClass::DeviceNotFound,
        5000000..=5009999 => CloudResponseClass::InternalServerError,
        _ => CloudResponseClass::Other,
    }
}

#[derive(Debug, Clone)]
pub struct CloudContext {
    pub device: DeviceId,
    pub state: CloudState,
    pub ci_url: String,
    pub uid: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub retry_count: u8,
    pub ping_interval_secs: Option<u64>,
    ever_signed_up: bool,
    tick_tag: Tag,
}

impl CloudContext {
    fn new(device: DeviceId, ci_url: String, tick_tag: Tag) -> Self {
        Self {
            device,
            state: CloudState::Init,
            ci_url,
            uid: None,
            access_token: None,
            refresh_token: None,
            retry_count: 0,
            ping_interval_secs: None,
            ever_signed_up: false,
            tick_tag,
        }
    }
}

/// Network transport consumed by the state machine. Kept as a trait so the
/// state machine itself has no networking dependency and is unit-testable
/// by feeding it canned responses.
#[async_trait::async_trait]
pub trait CloudTransport: Send + Sync {
    async fn sign_up(&self, ctx: &CloudContext) -> Result<SignResponse, (u32, u32)>;
    async fn sign_in(&self, ctx: &CloudContext) -> Result<SignResponse, (u32, u32)>;
    async fn refresh_token(&self, ctx: &CloudContext) -> Result<SignResponse, (u32, u32)>;
    async fn publish(&self, ctx: &CloudContext) -> Result<(), (u32, u32)>;
    async fn find_ping_interval(&self, ctx: &CloudContext) -> Result<Vec<u64>, (u32, u32)>;
    async fn ping(&self, ctx: &CloudContext) -> Result<(), (u32, u32)>;
}

#[derive(Debug, Clone, Default)]
pub struct SignResponse {
    pub uid: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

/// Per-device sign-up/sign-in/publish/ping state machine, bounded at
/// `max_context_size` concurrently tracked devices.
pub struct CloudManager {
    config: CloudConfig,
    clock: Arc<Clock>,
    contexts: Mutex<HashMap<DeviceId, CloudContext>>,
}

impl CloudManager {
    pub fn new(config: CloudConfig, clock: Arc<Clock>) -> Self {
        Self {
            config,
            clock,
            contexts: Mutex::new(HashMap::new()),
        }
    }

    /// Starts the state machine for `device` and schedules its first tick
    /// immediately, so the caller's event loop drives `Init -> SigningUp`
    /// on its very next [`Self::drain_due`] without a separate kick-off call.
    pub fn cloud_start(&self, device: DeviceId, ci_url: String) -> Result<(), CloudError> {
        let mut contexts = self.contexts.lock();
        if contexts.contains_key(&device) {
            return Err(CloudError::AlreadyStarted(device));
        }
        if contexts.len() >= self.config.max_context_size {
            return Err(CloudError::Capacity(self.config.max_context_size));
        }
        let tag = self.clock.new_tag();
        self.clock.schedule(tag, 0);
        contexts.insert(device, CloudContext::new(device, ci_url, tag));
        Ok(())
    }

    pub fn cloud_stop(&self, device: DeviceId) {
        if let Some(ctx) = self.contexts.lock().remove(&device) {
            self.clock.cancel(ctx.tick_tag);
        }
    }

    pub fn state(&self, device: DeviceId) -> Option<CloudState> {
        self.contexts.lock().get(&device).map(|c| c.state)
    }

    fn session_timeout(&self, retry_count: u8) -> u64 {
        self.config.session_timeout_secs[(retry_count as usize).min(self.config.session_timeout_secs.len() - 1)]
    }

    fn message_timeout(&self, retry_count: u8) -> u64 {
        self.config.message_timeout_secs[(retry_count as usize).min(self.config.message_timeout_secs.len() - 1)]
    }

    /// Drives one step of the state machine for `device`, dispatching on the
    /// classified response of whatever action the current state implies.
    /// Every transition schedules its own next action on the timed-event
    /// queue rather than looping synchronously.
    pub async fn tick(
        &self,
        device: DeviceId,
        transport: &dyn CloudTransport,
    ) -> Result<Option<CloudCallbackEvent>, CloudError> {
        let state = {
            let contexts = self.contexts.lock();
            contexts.get(&device).map(|c| c.state).ok_or(CloudError::NotStarted(device))?
        };

        match state {
            CloudState::Init => self.begin_sign_up(device),
            CloudState::SigningUp => self.attempt_sign_up(device, transport).await,
            CloudState::SignedUp => {
                self.set_state(device, CloudState::SigningIn);
                Ok(None)
            }
            CloudState::SigningIn | CloudState::Reconnecting => {
                self.attempt_sign_in(device, transport).await
            }
            CloudState::SignedIn => {
                self.set_state(device, CloudState::Publishing);
                Ok(None)
            }
            CloudState::Publishing => self.attempt_publish(device, transport).await,
            CloudState::Published => self.attempt_find_ping(device, transport).await,
            CloudState::Pinging => self.attempt_ping(device, transport).await,
            CloudState::Finished | CloudState::Reset | CloudState::Fail => Ok(None),
        }
    }

    fn set_state(&self, device: DeviceId, state: CloudState) {
        if let Some(ctx) = self.contexts.lock().get_mut(&device) {
            ctx.state = state;
        }
    }

    fn clear_retry(&self, device: DeviceId) {
        if let Some(ctx) = self.contexts.lock().get_mut(&device) {
            ctx.retry_count = 0;
        }
    }

    fn begin_sign_up(&self, device: DeviceId) -> Result<Option<CloudCallbackEvent>, CloudError> {
        self.set_state(device, CloudState::SigningUp);
        Ok(None)
    }

    async fn attempt_sign_up(
        &self,
        device: DeviceId,
        transport: &dyn CloudTransport,
    ) -> Result<Option<CloudCallbackEvent>, CloudError> {
        let ctx_snapshot = self.snapshot(device)?;
        match transport.sign_up(&ctx_snapshot).await {
            Ok(resp) => {
                self.apply_sign_response(device, resp);
                let mut contexts = self.contexts.lock();
                if let Some(ctx) = contexts.get_mut(&device) {
                    ctx.ever_signed_up = true;
                }
                self.clear_retry(device);
                self.set_state(device, CloudState::SignedUp);
                Ok(None)
            }
            Err((status, code)) => self.dispatch_failure(device, status, code, CloudState::SigningUp).await,
        }
    }

    async fn attempt_sign_in(
        &self,
        device: DeviceId,
        transport: &dyn CloudTransport,
    ) -> Result<Option<CloudCallbackEvent>, CloudError> {
        let ctx_snapshot = self.snapshot(device)?;
        match transport.sign_in(&ctx_snapshot).await {
            Ok(resp) => {
                self.apply_sign_response(device, resp);
                self.clear_retry(device);
                self.set_state(device, CloudState::SignedIn);
                Ok(None)
            }
            Err((status, code)) => {
                let class = classify(status, code);
                if class == CloudResponseClass::TokenExpired {
                    self.clear_retry(device);
                    self.set_state(device, CloudState::Reconnecting);
                    return self.attempt_refresh(device, transport).await;
                }
                self.dispatch_failure(device, status, code, CloudState::SigningIn).await
            }
        }
    }

    async fn attempt_refresh(
        &self,
        device: DeviceId,
        transport: &dyn CloudTransport,
    ) -> Result<Option<CloudCallbackEvent>, CloudError> {
        let ctx_snapshot = self.snapshot(device)?;
        match transport.refresh_token(&ctx_snapshot).await {
            Ok(resp) => {
                self.apply_sign_response(device, resp);
                self.clear_retry(device);
                self.set_state(device, CloudState::SigningIn);
                Ok(None)
            }
            Err((status, code)) => self.dispatch_failure(device, status, code, CloudState::Reconnecting).await,
        }
    }

    async fn attempt_publish(
        &self,
        device: DeviceId,
        transport: &dyn CloudTransport,
    ) -> Result<Option<CloudCallbackEvent>, CloudError> {
        let ctx_snapshot = self.snapshot(device)?;
        match transport.publish(&ctx_snapshot).await {
            Ok(()) => {
                self.clear_retry(device);
                self.set_state(device, CloudState::Published);
                Ok(None)
            }
            Err((status, code)) => self.dispatch_failure(device, status, code, CloudState::Publishing).await,
        }
    }

    async fn attempt_find_ping(
        &self,
        device: DeviceId,
        transport: &dyn CloudTransport,
    ) -> Result<Option<CloudCallbackEvent>, CloudError> {
        let ctx_snapshot = self.snapshot(device)?;
        match transport.find_ping_interval(&ctx_snapshot).await {
            Ok(intervals) => {
                // The last element wins (Open Question OQ1, resolved in
                // DESIGN.md to preserve this compatibility behaviour).
                if let Some(&last) = intervals.last() {
                    if let Some(ctx) = self.contexts.lock().get_mut(&device) {
                        ctx.ping_interval_secs = Some(last);
                    }
                }
                self.clear_retry(device);
                self.set_state(device, CloudState::Pinging);
                Ok(None)
            }
            Err((status, code)) => self.dispatch_failure(device, status, code, CloudState::Published).await,
        }
    }

    async fn attempt_ping(
        &self,
        device: DeviceId,
        transport: &dyn CloudTransport,
    ) -> Result<Option<CloudCallbackEvent>, CloudError> {
        let ctx_snapshot = self.snapshot(device)?;
        match transport.ping(&ctx_snapshot).await {
            Ok(()) => {
                self.clear_retry(device);
                self.set_state(device, CloudState::Finished);
                Ok(Some(CloudCallbackEvent::Finished))
            }
            Err((status, code)) => self.dispatch_failure(device, status, code, CloudState::Pinging).await,
        }
    }

    /// Central response-classification dispatch (§4.6): decides the next
    /// state and whether `retry_count` advances, given the class of failure
    /// and the state the failing action was attempted from.
    async fn dispatch_failure(
        &self,
        device: DeviceId,
        status: u32,
        code: u32,
        from_state: CloudState,
    ) -> Result<Option<CloudCallbackEvent>, CloudError> {
        match classify(status, code) {
            CloudResponseClass::TokenExpired => {
                self.clear_retry(device);
                self.set_state(device, CloudState::Reconnecting);
                Ok(None)
            }
            CloudResponseClass::AccountAuthorizationFailed => {
                self.clear_retry(device);
                self.set_state(device, CloudState::Reconnecting);
                self.set_state(device, CloudState::SigningIn);
                Ok(None)
            }
            CloudResponseClass::DeviceNotFound => {
                self.set_state(device, CloudState::Reset);
                Ok(Some(CloudCallbackEvent::Reset))
            }
            CloudResponseClass::InternalServerError => {
                if let Some(ctx) = self.contexts.lock().get_mut(&device) {
                    ctx.retry_count = self.config.max_retry_count;
                }
                self.set_state(device, CloudState::Fail);
                Ok(Some(CloudCallbackEvent::Fail))
            }
            CloudResponseClass::Other => {
                let retry_count = {
                    let mut contexts = self.contexts.lock();
                    let ctx = contexts.get_mut(&device).ok_or(CloudError::NotStarted(device))?;
                    ctx.retry_count += 1;
                    ctx.retry_count
                };
                if retry_count >= self.config.max_retry_count {
                    self.set_state(device, CloudState::Fail);
                    return Ok(Some(CloudCallbackEvent::Fail));
                }
                self.set_state(device, from_state);
                warn!(device, retry_count, "cloud action failed, retrying");
                Ok(None)
            }
        }
    }

    fn apply_sign_response(&self, device: DeviceId, resp: SignResponse) {
        if let Some(ctx) = self.contexts.lock().get_mut(&device) {
            if resp.uid.is_some() {
                ctx.uid = resp.uid;
            }
            if resp.access_token.is_some() {
                ctx.access_token = resp.access_token;
            }
            if resp.refresh_token.is_some() {
                ctx.refresh_token = resp.refresh_token;
            }
        }
    }

    /// Clones the context out from behind the lock so the transport call
    /// below doesn't hold it across an `.await`.
    fn snapshot(&self, device: DeviceId) -> Result<CloudContext, CloudError> {
        let contexts = self.contexts.lock();
        contexts.get(&device).cloned().ok_or(CloudError::NotStarted(device))
    }

    /// Underlying session disconnect for a `Finished` device: cancel the
    /// ping timer, enter `Reconnecting`, and restart at sign-in (or sign-up
    /// if the device was never signed up).
    pub fn on_session_disconnect(&self, device: DeviceId) {
        let mut contexts = self.contexts.lock();
        let Some(ctx) = contexts.get_mut(&device) else {
            return;
        };
        if ctx.state != CloudState::Finished {
            return;
        }
        ctx.retry_count = 0;
        ctx.state = if ctx.ever_signed_up {
            CloudState::SigningIn
        } else {
            CloudState::Init
        };
        info!(device, "cloud session disconnected, reconnecting");
    }

    /// Next-tick delay for `device`'s current state, used by the caller to
    /// schedule the next [`Self::tick`] on the timed-event queue.
    pub fn next_delay_secs(&self, device: DeviceId) -> Option<u64> {
        let contexts = self.contexts.lock();
        let ctx = contexts.get(&device)?;
        Some(match ctx.state {
            CloudState::SigningUp | CloudState::SigningIn | CloudState::Reconnecting => {
                self.session_timeout(ctx.retry_count)
            }
            CloudState::Publishing | CloudState::Published => self.message_timeout(ctx.retry_count),
            CloudState::Pinging => ctx.ping_interval_secs.unwrap_or(60),
            _ => return None,
        })
    }

    /// Drains whatever cloud-manager tags came due on `clock`, ticks each
    /// matching device once, and reschedules per [`Self::next_delay_secs`].
    /// Called once per event-loop iteration alongside [`Clock::poll`].
    pub async fn drain_due(&self, transport: &dyn CloudTransport) -> Vec<(DeviceId, CloudCallbackEvent)> {
        let mut due = Vec::new();
        self.clock.poll(&mut due);
        if due.is_empty() {
            return Vec::new();
        }
        let due_set: HashSet<Tag> = due.into_iter().collect();
        let devices: Vec<DeviceId> = self
            .contexts
            .lock()
            .values()
            .filter(|c| due_set.contains(&c.tick_tag))
            .map(|c| c.device)
            .collect();

        let mut events = Vec::new();
        for device in devices {
            match self.tick(device, transport).await {
                Ok(Some(event)) => events.push((device, event)),
                Ok(None) => {}
                Err(e) => {
                    warn!(device, error = %e, "cloud tick failed");
                    continue;
                }
            }
            let Some(delay_secs) = self.next_delay_secs(device) else {
                continue;
            };
            if let Some(tag) = self.contexts.lock().get(&device).map(|c| c.tick_tag) {
                self.clock.schedule(tag, delay_secs * 1000);
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedTransport {
        sign_in_calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl CloudTransport for ScriptedTransport {
        async fn sign_up(&self, _ctx: &CloudContext) -> Result<SignResponse, (u32, u32)> {
            Ok(SignResponse {
                uid: Some("uid".into()),
                access_token: Some("at".into()),
                refresh_token: Some("rt".into()),
            })
        }

        async fn sign_in(&self, _ctx: &CloudContext) -> Result<SignResponse, (u32, u32)> {
            let call = self.sign_in_calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                Err((400, 4000004)) // token expired
            } else {
                Ok(SignResponse::default())
            }
        }

        async fn refresh_token(&self, _ctx: &CloudContext) -> Result<SignResponse, (u32, u32)> {
            Ok(SignResponse {
                refresh_token: Some("rt2".into()),
                ..Default::default()
            })
        }

        async fn publish(&self, _ctx: &CloudContext) -> Result<(), (u32, u32)> {
            Ok(())
        }

        async fn find_ping_interval(&self, _ctx: &CloudContext) -> Result<Vec<u64>, (u32, u32)> {
            Ok(vec![30, 60, 90])
        }

        async fn ping(&self, _ctx: &CloudContext) -> Result<(), (u32, u32)> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn sign_in_token_expired_then_refresh_then_success() {
        let clock = Arc::new(Clock::new());
        let mgr = CloudManager::new(CloudConfig::default(), clock);
        mgr.cloud_start(0, "coaps+tcp://example".into()).unwrap();
        let transport = ScriptedTransport {
            sign_in_calls: AtomicU32::new(0),
        };

        mgr.tick(0, &transport).await.unwrap(); // Init -> SigningUp
        mgr.tick(0, &transport).await.unwrap(); // SigningUp -> SignedUp
        mgr.tick(0, &transport).await.unwrap(); // SignedUp -> SigningIn
        mgr.tick(0, &transport).await.unwrap(); // SigningIn fails (expired) -> Reconnecting + refresh
        assert_eq!(mgr.state(0), Some(CloudState::SigningIn));
        mgr.tick(0, &transport).await.unwrap(); // SigningIn succeeds
        assert_eq!(mgr.state(0), Some(CloudState::SignedIn));
    }

    #[tokio::test]
    async fn ping_interval_last_element_wins() {
        let clock = Arc::new(Clock::new());
        let mgr = CloudManager::new(CloudConfig::default(), clock);
        mgr.cloud_start(0, "coaps+tcp://example".into()).unwrap();
        let transport = ScriptedTransport {
            sign_in_calls: AtomicU32::new(1),
        };
        // Init->SigningUp->SignedUp->SigningIn->SignedIn->Publishing->Published->Pinging
        for _ in 0..7 {
            mgr.tick(0, &transport).await.unwrap();
        }
        assert_eq!(mgr.contexts.lock().get(&0).unwrap().ping_interval_secs, Some(90));
    }

    #[tokio::test]
    async fn max_context_size_is_enforced() {
        let clock = Arc::new(Clock::new());
        let mgr = CloudManager::new(
            CloudConfig {
                max_context_size: 1,
                ..Default::default()
            },
            clock,
        );
        mgr.cloud_start(0, "a".into()).unwrap();
        assert!(matches!(mgr.cloud_start(1, "b".into()), Err(CloudError::Capacity(1))));
    }
}
