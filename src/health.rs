//! Health surface.
//!
//! Exposes `GET /healthy` and `GET /ready` for the orchestrator's liveness
//! and readiness probes. The engine reports each sweep outcome here;
//! readiness requires a successful sweep within the last full
//! reconciliation interval.

use crate::error::Result;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Shared health signals for the probe endpoints.
pub struct HealthState {
    started: Instant,
    interval: Duration,
    healthy: AtomicBool,
    /// Milliseconds since `started` of the last successful sweep, plus one.
    /// Zero means no sweep has succeeded yet.
    last_sweep_ms: AtomicU64,
}

impl HealthState {
    pub fn new(interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            started: Instant::now(),
            interval,
            healthy: AtomicBool::new(true),
            last_sweep_ms: AtomicU64::new(0),
        })
    }

    pub fn record_sweep_success(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_sweep_ms.store(elapsed + 1, Ordering::Relaxed);
    }

    /// Mark the process unhealthy; the orchestrator will restart it.
    pub fn record_fatal(&self) {
        self.healthy.store(false, Ordering::Relaxed);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn is_ready(&self) -> bool {
        if !self.is_healthy() {
            return false;
        }
        match self.last_sweep_ms.load(Ordering::Relaxed) {
            0 => false,
            stamp => {
                let last = Duration::from_millis(stamp - 1);
                self.started.elapsed().saturating_sub(last) <= self.interval
            }
        }
    }
}

/// Serve the probe endpoints until the process exits.
pub async fn serve(addr: SocketAddr, state: Arc<HealthState>) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(address = %addr, "health surface listening");

    loop {
        let (mut socket, _) = listener.accept().await?;
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let read = match socket.read(&mut buf).await {
                Ok(read) => read,
                Err(e) => {
                    warn!("health probe read failed: {}", e);
                    return;
                }
            };
            let request = String::from_utf8_lossy(&buf[..read]);
            let response = respond(&request, &state);
            let _ = socket.write_all(response.as_bytes()).await;
        });
    }
}

fn respond(request: &str, state: &HealthState) -> &'static str {
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("");
    let up = match path {
        "/healthy" => state.is_healthy(),
        "/ready" => state.is_ready(),
        _ => return "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n",
    };
    if up {
        "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK"
    } else {
        "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_ready_before_first_sweep() {
        let state = HealthState::new(Duration::from_secs(120));
        assert!(state.is_healthy());
        assert!(!state.is_ready());
    }

    #[test]
    fn test_ready_after_successful_sweep() {
        let state = HealthState::new(Duration::from_secs(120));
        state.record_sweep_success();
        assert!(state.is_ready());
    }

    #[test]
    fn test_readiness_expires_after_one_interval() {
        let state = HealthState::new(Duration::ZERO);
        state.record_sweep_success();
        std::thread::sleep(Duration::from_millis(5));
        assert!(!state.is_ready());
    }

    #[test]
    fn test_fatal_clears_both_signals() {
        let state = HealthState::new(Duration::from_secs(120));
        state.record_sweep_success();
        state.record_fatal();
        assert!(!state.is_healthy());
        assert!(!state.is_ready());
    }

    #[test]
    fn test_probe_routing() {
        let state = HealthState::new(Duration::from_secs(120));
        assert!(respond("GET /healthy HTTP/1.1\r\n", &state).starts_with("HTTP/1.1 200"));
        assert!(respond("GET /ready HTTP/1.1\r\n", &state).starts_with("HTTP/1.1 503"));
        assert!(respond("GET /metrics HTTP/1.1\r\n", &state).starts_with("HTTP/1.1 404"));

        state.record_sweep_success();
        assert!(respond("GET /ready HTTP/1.1\r\n", &state).starts_with("HTTP/1.1 200"));
    }
}
