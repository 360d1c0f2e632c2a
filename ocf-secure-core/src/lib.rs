//! Secure session engine, TCP connection engine and cloud manager for an
//! OCF-style constrained device runtime.
//!
//! This crate implements the three subsystems that share a single I/O event
//! thread and exchange sessions through mutex-guarded lists: the (D)TLS
//! session engine ([`tls`]), the TCP connection engine ([`tcp`]), and the
//! cloud manager's sign-up/sign-in/publish/ping state machine ([`cloud`]).
//! Everything else ([`clock`], [`pool`], [`endpoint`], [`certs`]) is the
//! supporting data model these three subsystems are built from.

pub mod certs;
pub mod clock;
pub mod cloud;
pub mod config;
pub mod endpoint;
pub mod event_loop;
pub mod pool;
pub mod prf;
pub mod tcp;
pub mod tls;

#[cfg(test)]
mod scenario_tests;

use std::sync::Arc;

/// The top-level error taxonomy described in the error-handling design.
///
/// Transient I/O conditions (`EINTR`, `WantRead`/`WantWrite`, `EINPROGRESS`)
/// are deliberately absent: they are fully absorbed and retried inside
/// [`tcp`] and [`tls`] and never escape as a value of this type.
#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    #[error("protocol fatal: {0}")]
    ProtocolFatal(#[from] tls::ProtocolFault),

    #[error("precondition violated: {0}")]
    Precondition(&'static str),

    #[error(transparent)]
    Tcp(#[from] tcp::TcpEngineError),

    #[error(transparent)]
    Tls(#[from] tls::TlsEngineError),

    #[error(transparent)]
    Cloud(#[from] cloud::CloudError),

    #[error(transparent)]
    Certs(#[from] certs::CertStoreError),
}

/// Session-event sink consumed by the core (outbound interface, §6).
///
/// `session_connected` fires exactly once per peer transitioning
/// `Handshaking -> Established`; `session_disconnected` fires at most once
/// per peer lifetime and before the peer's storage is released.
pub trait SessionEventSink: Send + Sync {
    fn session_connected(&self, endpoint: endpoint::Endpoint);
    fn session_disconnected(&self, endpoint: endpoint::Endpoint);
    fn inbound_message(&self, message: pool::Message);
}

/// Ties C1-C8 together into one runtime value, owning the shared mutexes
/// and task pool a single-instance-per-runtime value needs.
///
/// Modelled on the reference stack's registration-time `Cla` struct: config
/// values and computed state are set at construction, late-bound
/// collaborators (the session-event sink) are filled in once at `start()`,
/// and all background work is tracked by one [`ocf_async::TaskPool`] so
/// shutdown is the standard three-phase signal/close/wait sequence.
pub struct Runtime {
    config: config::Config,
    clock: Arc<clock::Clock>,
    pool: Arc<pool::MessagePool>,
    tcp: Arc<tcp::TcpEngine>,
    tls: Arc<tls::SessionEngine>,
    certs: Arc<certs::CertStore>,
    cloud: Arc<cloud::CloudManager>,
    tasks: Arc<ocf_async::TaskPool>,
}

impl Runtime {
    pub fn new(config: config::Config) -> Result<Self, CoreError> {
        let clock = Arc::new(clock::Clock::new());
        let pool = Arc::new(pool::MessagePool::new(config.pool.clone()));
        let certs = Arc::new(certs::CertStore::new());
        let tls_adapter = tls::TlsAdapterConfig::new(config.tls.as_ref())?;
        let tls = Arc::new(tls::SessionEngine::with_clock(
            config.session.clone(),
            tls_adapter,
            certs.clone(),
            clock.clone(),
        ));
        let tcp = Arc::new(tcp::TcpEngine::new(config.tcp.clone(), pool.clone()));
        let cloud = Arc::new(cloud::CloudManager::new(
            config.cloud.clone(),
            clock.clone(),
        ));

        Ok(Self {
            config,
            clock,
            pool,
            tcp,
            tls,
            certs,
            cloud,
            tasks: Arc::new(ocf_async::TaskPool::new()),
        })
    }

    pub fn config(&self) -> &config::Config {
        &self.config
    }

    pub fn clock(&self) -> &Arc<clock::Clock> {
        &self.clock
    }

    pub fn pool(&self) -> &Arc<pool::MessagePool> {
        &self.pool
    }

    pub fn tcp(&self) -> &Arc<tcp::TcpEngine> {
        &self.tcp
    }

    pub fn tls(&self) -> &Arc<tls::SessionEngine> {
        &self.tls
    }

    pub fn certs(&self) -> &Arc<certs::CertStore> {
        &self.certs
    }

    pub fn cloud(&self) -> &Arc<cloud::CloudManager> {
        &self.cloud
    }

    /// Spawns the C8 event loop and returns once it has been scheduled.
    /// Shutdown follows the standard `TaskPool` three-phase pattern.
    ///
    /// `transport` is the application's cloud-interface (CI) client; the
    /// cloud manager's state machine has no networking of its own (§C7) and
    /// the event loop drives it through whatever is passed in here.
    pub fn start(self: &Arc<Self>, transport: Arc<dyn cloud::CloudTransport>, sink: Arc<dyn SessionEventSink>) {
        let rt = self.clone();
        self.tasks.spawn(async move {
            event_loop::run(rt.clock.clone(), rt.tcp.clone(), rt.tls.clone(), rt.cloud.clone(), transport, sink).await;
        });
    }

    pub async fn shutdown(&self) {
        self.tasks.shutdown().await;
        self.tcp.shutdown_all().await;
        self.tls.close_all();
    }
}
