//! Event loop / scheduler (C8).
//!
//! One task drives the whole runtime: drain the TCP engine's free-async
//! teardown list, run whatever timed events are due (inactivity reaper,
//! cloud manager retries), then sleep until the next deadline or a
//! shutdown signal. `tokio::select!` is `biased` so a selector iteration
//! that is already holding a borrowed session reference always finishes
//! draining teardown requests before anything else touches the session
//! tables, matching the ordering guarantee in [`crate::tcp::TcpEngine`].

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::clock::Clock;
use crate::cloud::{CloudManager, CloudTransport};
use crate::tcp::TcpEngine;
use crate::tls::SessionEngine;
use crate::SessionEventSink;

/// Runs until `tasks.shutdown()` cancels the owning task. Intended to be
/// spawned exactly once per [`crate::Runtime`].
pub async fn run(
    clock: Arc<Clock>,
    tcp: Arc<TcpEngine>,
    tls: Arc<SessionEngine>,
    cloud: Arc<CloudManager>,
    transport: Arc<dyn CloudTransport>,
    _sink: Arc<dyn SessionEventSink>,
) {
    loop {
        tokio::select! {
            biased;

            _ = tcp.drain_free_async() => {
                continue;
            }

            _ = tick(&clock, &tls, &cloud, transport.as_ref()) => {
                continue;
            }
        }
    }
}

/// One scheduler tick: reap inactive DTLS peers, drive due cloud-manager
/// retries, then sleep until the next deadline (or a short default poll
/// interval if the queue is empty) so the loop doesn't spin.
async fn tick(clock: &Clock, tls: &SessionEngine, cloud: &CloudManager, transport: &dyn CloudTransport) {
    tls.reap_inactive();
    cloud.drain_due(transport).await;

    let mut due = Vec::new();
    let next_ms = clock.poll(&mut due);
    let wait = if next_ms == 0 {
        Duration::from_millis(200)
    } else {
        Duration::from_millis(next_ms.min(1000))
    };
    debug!(?wait, "event loop sleeping until next deadline");
    tokio::time::sleep(wait).await;
}
