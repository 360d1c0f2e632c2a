//! TCP connection engine (C4).
//!
//! Active and waiting TCP sessions, non-blocking connect with retry,
//! FIFO message queueing while a connection is pending, and asynchronous
//! teardown signalled to the shared event loop. Modelled on the reference
//! stack's `ConnectionRegistry` (an `Arc<Mutex<HashMap<..>>>`-backed session
//! pool) generalised to carry both the active-session and waiting-session
//! maps, guarded by one `std::sync::Mutex` since `shutdown(device)`
//! iterates while holding it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tower::limit::rate::Rate;
use tower::limit::RateLimit;
use tower::{Service, ServiceExt};
use tracing::{debug, info, trace, warn};

use crate::config::TcpConfig;
use crate::endpoint::Endpoint;
use crate::pool::{Message, MessagePool};

/// A no-op `tower::Service` whose only purpose is to carry a
/// `RateLimit` wrapper: `accept()` awaits `ready()` on it to throttle to
/// `TcpConfig::accept_rate_limit` connections per second, the way the
/// reference TCP layer's listener accept loop is rate-limited.
#[derive(Clone, Copy, Default)]
struct AcceptProbe;

impl Service<()> for AcceptProbe {
    type Response = ();
    type Error = std::convert::Infallible;
    type Future = std::future::Ready<Result<(), std::convert::Infallible>>;

    fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: ()) -> Self::Future {
        std::future::ready(Ok(()))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum TcpEngineError {
    #[error("a session already exists for this endpoint")]
    ExistsConnected,
    #[error("a connection attempt is already in progress for this endpoint")]
    ExistsConnecting,
    #[error("cannot re-dial an accepted connection")]
    CannotRedialAccepted,
    #[error("no session for endpoint")]
    NoSession,
    #[error("engine at capacity ({0} sessions)")]
    Capacity(usize),
    #[error("message pool exhausted or frame exceeds max_pdu")]
    PoolExhausted,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Per-TCP-session signalling state used by the CoAP-over-TCP framing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsmState {
    None,
    Sent,
    Done,
    Error,
}

/// Outcome of an on-connect callback / synchronous `connect()` attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    Connecting,
    ExistsConnected,
    ExistsConnecting,
    Timeout,
}

pub trait OnConnect: Send + Sync {
    fn call(&self, endpoint: Endpoint, outcome: ConnectOutcome);
}

struct ActiveSession {
    device: u8,
    endpoint: Endpoint,
    stream: Arc<AsyncMutex<TcpStream>>,
    csm_state: CsmState,
}

struct RetryState {
    start_time: Instant,
    count: u8,
    force_flag: bool,
}

struct WaitingSession {
    device: u8,
    endpoint: Endpoint,
    retry: RetryState,
    queued_messages: Vec<Message>,
    on_connect: Option<Arc<dyn OnConnect>>,
    cancel: tokio_util::sync::CancellationToken,
}

enum TeardownReq {
    Session(Endpoint),
    Device(u8),
}

struct State {
    active: HashMap<Endpoint, ActiveSession>,
    waiting: HashMap<Endpoint, WaitingSession>,
}

/// The TCP connection engine. One instance per runtime; all session-list
/// mutations and lookups are serialised through `state`.
pub struct TcpEngine {
    config: TcpConfig,
    pool: Arc<MessagePool>,
    state: std::sync::Mutex<State>,
    free_async_tx: mpsc::UnboundedSender<TeardownReq>,
    free_async_rx: AsyncMutex<mpsc::UnboundedReceiver<TeardownReq>>,
    accept_gate: AsyncMutex<RateLimit<AcceptProbe>>,
}

impl TcpEngine {
    pub fn new(config: TcpConfig, pool: Arc<MessagePool>) -> Self {
        metrics::describe_gauge!("tcp_sessions_active", metrics::Unit::Count, "Number of active TCP sessions tracked by the engine");
        metrics::describe_counter!("tcp_connect_retries", metrics::Unit::Count, "Total number of non-blocking connect retries performed");
        let (tx, rx) = mpsc::unbounded_channel();
        let rate = Rate::new(config.accept_rate_limit.max(1) as u64, Duration::from_secs(1));
        Self {
            config,
            pool,
            state: std::sync::Mutex::new(State {
                active: HashMap::new(),
                waiting: HashMap::new(),
            }),
            free_async_tx: tx,
            free_async_rx: AsyncMutex::new(rx),
            accept_gate: AsyncMutex::new(RateLimit::new(AcceptProbe, rate)),
        }
    }

    fn session_count(&self) -> usize {
        let s = self.state.lock().expect("tcp engine mutex poisoned");
        s.active.len() + s.waiting.len()
    }

    /// Non-blocking connect per §4.3. An existing session for `endpoint`
    /// always wins the lookup first, matching `tcp_connect_locked`'s own
    /// order: only once no session is found does an accepted endpoint get
    /// refused as un-redialable.
    pub async fn connect(
        self: &Arc<Self>,
        device: u8,
        endpoint: Endpoint,
        on_connect: Option<Arc<dyn OnConnect>>,
    ) -> Result<ConnectOutcome, TcpEngineError> {
        {
            let s = self.state.lock().expect("tcp engine mutex poisoned");
            if s.active.contains_key(&endpoint) {
                return Ok(ConnectOutcome::ExistsConnected);
            }
            if s.waiting.contains_key(&endpoint) {
                return Ok(ConnectOutcome::ExistsConnecting);
            }
        }
        if endpoint.accepted {
            return Err(TcpEngineError::CannotRedialAccepted);
        }
        if self.session_count() >= self.config.max_sessions {
            return Err(TcpEngineError::Capacity(self.config.max_sessions));
        }

        let addr = endpoint.to_sockaddr();
        match tokio::time::timeout(Duration::from_millis(1), TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                self.promote_active(device, endpoint, stream, CsmState::None);
                Ok(ConnectOutcome::Connected)
            }
            _ => {
                // Either genuinely in-progress or the 1ms fast-path timed
                // out; both mean "create a waiting session and let the
                // retry task drive it", matching the non-blocking-connect
                // + selector-wakeup contract.
                self.spawn_waiting(device, endpoint, on_connect);
                Ok(ConnectOutcome::Connecting)
            }
        }
    }

    fn promote_active(&self, device: u8, endpoint: Endpoint, stream: TcpStream, csm_state: CsmState) {
        let mut s = self.state.lock().expect("tcp engine mutex poisoned");
        s.waiting.remove(&endpoint);
        s.active.insert(
            endpoint,
            ActiveSession {
                device,
                endpoint,
                stream: Arc::new(AsyncMutex::new(stream)),
                csm_state,
            },
        );
        metrics::gauge!("tcp_sessions_active").set(s.active.len() as f64);
    }

    fn spawn_waiting(self: &Arc<Self>, device: u8, endpoint: Endpoint, on_connect: Option<Arc<dyn OnConnect>>) {
        let cancel = tokio_util::sync::CancellationToken::new();
        {
            let mut s = self.state.lock().expect("tcp engine mutex poisoned");
            s.waiting.insert(
                endpoint,
                WaitingSession {
                    device,
                    endpoint,
                    retry: RetryState {
                        start_time: Instant::now(),
                        count: 0,
                        force_flag: false,
                    },
                    queued_messages: Vec::new(),
                    on_connect: on_connect.clone(),
                    cancel: cancel.clone(),
                },
            );
        }

        let engine = self.clone();
        tokio::spawn(async move {
            engine.run_retry_loop(device, endpoint, cancel).await;
        });
    }

    /// Drives the retry policy for one waiting session until it is promoted,
    /// expires, or is cancelled (`shutdown`/`end_session`).
    async fn run_retry_loop(
        self: Arc<Self>,
        device: u8,
        endpoint: Endpoint,
        cancel: tokio_util::sync::CancellationToken,
    ) {
        let timeout = Duration::from_secs(self.config.connect_retry_timeout_secs);
        loop {
            let addr = endpoint.to_sockaddr();
            let cycle_start = Instant::now();
            let attempt = tokio::select! {
                r = tokio::time::timeout(timeout, TcpStream::connect(addr)) => r,
                _ = cancel.cancelled() => return,
            };

            match attempt {
                Ok(Ok(stream)) => {
                    let on_connect = {
                        let mut s = self.state.lock().expect("tcp engine mutex poisoned");
                        let Some(waiting) = s.waiting.remove(&endpoint) else {
                            return;
                        };
                        drop(s);
                        self.promote_active(device, endpoint, stream, CsmState::None);
                        self.flush_queued(endpoint, waiting.queued_messages).await;
                        waiting.on_connect
                    };
                    if let Some(cb) = on_connect {
                        cb.call(endpoint, ConnectOutcome::Connected);
                    }
                    return;
                }
                Ok(Err(_)) | Err(_) => {
                    // A refused/errored connect returns almost instantly, but
                    // the retry policy still paces one attempt per `timeout`
                    // rather than hot-looping against an unreachable peer.
                    let elapsed = cycle_start.elapsed();
                    if elapsed < timeout {
                        tokio::select! {
                            _ = tokio::time::sleep(timeout - elapsed) => {}
                            _ = cancel.cancelled() => return,
                        }
                    }

                    let expired = {
                        let mut s = self.state.lock().expect("tcp engine mutex poisoned");
                        let Some(w) = s.waiting.get_mut(&endpoint) else {
                            return;
                        };
                        w.retry.count += 1;
                        w.retry.force_flag = false;
                        w.retry.start_time = Instant::now();
                        w.retry.count >= self.config.connect_retry_max_count
                    };
                    metrics::counter!("tcp_connect_retries").increment(1);
                    if expired {
                        let on_connect = {
                            let mut s = self.state.lock().expect("tcp engine mutex poisoned");
                            s.waiting.remove(&endpoint).and_then(|w| w.on_connect)
                        };
                        if let Some(cb) = on_connect {
                            cb.call(endpoint, ConnectOutcome::Timeout);
                        }
                        return;
                    }
                    trace!(?endpoint, "connect retry failed, will retry");
                }
            }
        }
    }

    async fn flush_queued(&self, endpoint: Endpoint, queued: Vec<Message>) {
        for msg in queued {
            if let Err(e) = self.send(endpoint, msg, false).await {
                warn!(?endpoint, "failed to flush queued message: {e}");
            }
        }
    }

    /// Accept a new inbound connection (server side). `csm_state` starts at
    /// `None` per §4.3. Throttled to `TcpConfig::accept_rate_limit`
    /// connections per second: past that rate this simply waits for the
    /// next window rather than rejecting the connection outright.
    pub async fn accept(&self, device: u8, stream: TcpStream, remote_addr: SocketAddr) -> Endpoint {
        {
            let mut gate = self.accept_gate.lock().await;
            let _ = gate.ready().await;
            let _ = gate.call(()).await;
        }

        let endpoint = Endpoint::from_sockaddr(remote_addr, true, false, device).accepted();
        self.promote_active(device, endpoint, stream, CsmState::None);
        info!(%remote_addr, "accepted TCP connection");
        endpoint
    }

    /// Sends `message`. If an active session exists, writes synchronously
    /// (bounded retry under partial writes is handled by `write_all`'s own
    /// internal loop, matching the "retry in place under EINTR" contract).
    /// If only a waiting session exists and `allow_queue`, the message is
    /// queued for FIFO delivery on promotion.
    pub async fn send(
        &self,
        endpoint: Endpoint,
        message: Message,
        allow_queue: bool,
    ) -> Result<usize, TcpEngineError> {
        let stream = {
            let s = self.state.lock().expect("tcp engine mutex poisoned");
            s.active.get(&endpoint).map(|a| a.stream.clone())
        };
        if let Some(stream) = stream {
            let data = message.data().to_vec();
            let mut guard = stream.lock().await;
            guard.write_all(&data).await?;
            return Ok(data.len());
        }

        if allow_queue {
            let mut s = self.state.lock().expect("tcp engine mutex poisoned");
            if let Some(w) = s.waiting.get_mut(&endpoint) {
                w.queued_messages.push(message);
                return Ok(0);
            }
        }
        Err(TcpEngineError::NoSession)
    }

    /// Reads one length-prefixed frame from `endpoint`'s active session and
    /// hands it back as a pool-backed [`Message`] rather than a bare
    /// `Vec<u8>`, so a received frame shares the same refcounted-slot
    /// lifetime as everything else flowing through the session layer.
    /// `header_len`/`length_of` extract the protocol length prefix (5-byte
    /// TLS record header, or CoAP-TCP length rules for plaintext) from the
    /// already-read prefix bytes. A zero-byte read means the peer closed and
    /// the session is torn down; a frame exceeding `max_pdu + max_header`
    /// also tears the session down. `encrypted` is recorded on the resulting
    /// `Message` as-is (the caller knows whether this endpoint carries a
    /// (D)TLS record or plaintext CoAP-TCP framing).
    pub async fn receive(
        &self,
        endpoint: Endpoint,
        header_len: usize,
        length_of: impl Fn(&[u8]) -> usize,
        max_total: usize,
        encrypted: bool,
    ) -> Result<Message, TcpEngineError> {
        let stream = {
            let s = self.state.lock().expect("tcp engine mutex poisoned");
            s.active.get(&endpoint).map(|a| a.stream.clone())
        }
        .ok_or(TcpEngineError::NoSession)?;

        let mut guard = stream.lock().await;
        let mut header = vec![0u8; header_len];
        let n = guard.read_exact(&mut header).await;
        match n {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                drop(guard);
                self.end_session(endpoint);
                return Err(TcpEngineError::Io(e));
            }
            Err(e) => return Err(e.into()),
        }

        let total_length = length_of(&header);
        if total_length > max_total {
            drop(guard);
            self.end_session(endpoint);
            return Err(TcpEngineError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "frame exceeds max_pdu + max_header",
            )));
        }

        let mut body = vec![0u8; total_length.saturating_sub(header_len)];
        guard.read_exact(&mut body).await?;

        let mut full = header;
        full.extend(body);
        self.pool
            .allocate(full, endpoint, encrypted)
            .ok_or(TcpEngineError::PoolExhausted)
    }

    /// Never frees directly: moves the session to the free-async list and
    /// lets the event loop drain it at the start of its next iteration, so a
    /// selector iteration still holding a reference is never invalidated
    /// out from under it.
    ///
    /// The send only fails if the event loop's receiver has already been
    /// dropped, which means the runtime is gone and teardown can no longer
    /// be completed; this is the one documented process-fatal path, so it
    /// panics rather than silently leaking the session.
    pub fn end_session(&self, endpoint: Endpoint) {
        use trace_err::TraceErrResult;
        self.free_async_tx
            .send(TeardownReq::Session(endpoint))
            .trace_expect("on-connect event queue exhausted during teardown");
    }

    /// Per-device shutdown: frees all sessions (active + waiting) for
    /// `device` synchronously, holding the engine mutex.
    pub fn shutdown(&self, device: u8) {
        let mut s = self.state.lock().expect("tcp engine mutex poisoned");
        s.active.retain(|_, a| a.device != device);
        let cancels: Vec<_> = s
            .waiting
            .iter()
            .filter(|(_, w)| w.device == device)
            .map(|(_, w)| w.cancel.clone())
            .collect();
        s.waiting.retain(|_, w| w.device != device);
        drop(s);
        for c in cancels {
            c.cancel();
        }
    }

    pub async fn shutdown_all(&self) {
        let mut s = self.state.lock().expect("tcp engine mutex poisoned");
        s.active.clear();
        let cancels: Vec<_> = s.waiting.values().map(|w| w.cancel.clone()).collect();
        s.waiting.clear();
        drop(s);
        for c in cancels {
            c.cancel();
        }
    }

    /// Drains the free-async teardown list. Called once per event-loop
    /// iteration, before any other work, per the ordering guarantee that a
    /// selector-borrowed session reference is never invalidated mid-use.
    pub async fn drain_free_async(&self) {
        let mut rx = self.free_async_rx.lock().await;
        while let Ok(req) = rx.try_recv() {
            match req {
                TeardownReq::Session(endpoint) => {
                    let mut s = self.state.lock().expect("tcp engine mutex poisoned");
                    if s.active.remove(&endpoint).is_some() {
                        debug!(?endpoint, "active session freed");
                        metrics::gauge!("tcp_sessions_active").set(s.active.len() as f64);
                    }
                    if let Some(w) = s.waiting.remove(&endpoint) {
                        w.cancel.cancel();
                    }
                }
                TeardownReq::Device(device) => {
                    drop(rx);
                    self.shutdown(device);
                    rx = self.free_async_rx.lock().await;
                }
            }
        }
    }

    pub fn active_session_count(&self) -> usize {
        self.state.lock().expect("tcp engine mutex poisoned").active.len()
    }

    pub fn csm_state(&self, endpoint: Endpoint) -> Option<CsmState> {
        self.state
            .lock()
            .expect("tcp engine mutex poisoned")
            .active
            .get(&endpoint)
            .map(|a| a.csm_state)
    }

    /// Current retry count of a waiting session, if one exists for `endpoint`.
    pub fn waiting_retry_count(&self, endpoint: Endpoint) -> Option<u8> {
        self.state
            .lock()
            .expect("tcp engine mutex poisoned")
            .waiting
            .get(&endpoint)
            .map(|w| w.retry.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_to_accepted_endpoint_is_refused() {
        let pool = Arc::new(MessagePool::new(Default::default()));
        let engine = Arc::new(TcpEngine::new(TcpConfig::default(), pool));
        let endpoint =
            Endpoint::from_sockaddr("127.0.0.1:1".parse().unwrap(), true, false, 0).accepted();
        let err = engine.connect(0, endpoint, None).await.unwrap_err();
        assert!(matches!(err, TcpEngineError::CannotRedialAccepted));
    }

    #[tokio::test]
    async fn connect_to_already_active_accepted_endpoint_returns_exists_connected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let pool = Arc::new(MessagePool::new(Default::default()));
        let engine = Arc::new(TcpEngine::new(TcpConfig::default(), pool));
        let endpoint = Endpoint::from_sockaddr(addr, true, false, 0);

        let first = engine.connect(0, endpoint, None).await.unwrap();
        assert!(matches!(first, ConnectOutcome::Connected | ConnectOutcome::Connecting));
        // Give a still-in-progress connect a chance to land before re-dialing.
        for _ in 0..50 {
            if engine.active_session_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(engine.active_session_count(), 1);

        let accepted = endpoint.accepted();
        let second = engine.connect(0, accepted, None).await.unwrap();
        assert_eq!(second, ConnectOutcome::ExistsConnected);
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let pool = Arc::new(MessagePool::new(Default::default()));
        let engine = Arc::new(TcpEngine::new(
            TcpConfig {
                max_sessions: 0,
                ..Default::default()
            },
            pool,
        ));
        let endpoint = Endpoint::from_sockaddr("127.0.0.1:9".parse().unwrap(), true, false, 0);
        let err = engine.connect(0, endpoint, None).await.unwrap_err();
        assert!(matches!(err, TcpEngineError::Capacity(0)));
    }
}
