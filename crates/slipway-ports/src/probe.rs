//! Liveness probes
//!
//! A probe answers one question: is something accepting connections on
//! `host:port` right now. It must be cheap and must not hang; the caller
//! supplies the retry budget.

use std::time::Duration;

use tokio::net::TcpStream;

/// Single liveness check against a host port
#[async_trait::async_trait]
pub trait HealthProbe: Send + Sync {
    /// One attempt; `true` if the port answered
    async fn probe(&self, host: &str, port: u16) -> bool;
}

/// TCP connect probe
#[derive(Debug, Clone, Copy)]
pub struct TcpProbe {
    connect_timeout: Duration,
}

impl TcpProbe {
    /// Create new probe with a per-attempt connect timeout
    #[inline]
    #[must_use]
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

#[async_trait::async_trait]
impl HealthProbe for TcpProbe {
    async fn probe(&self, host: &str, port: u16) -> bool {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                tracing::debug!(host, port, error = %e, "probe refused");
                false
            }
            Err(_) => {
                tracing::debug!(host, port, "probe timed out");
                false
            }
        }
    }
}
