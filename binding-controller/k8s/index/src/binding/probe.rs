use tokio::{net::TcpStream, time};

/// Checks that a bound endpoint is reachable through cluster DNS.
#[async_trait::async_trait]
pub trait Prober: Send + Sync + 'static {
    async fn probe(&self, host: &str, port: u16) -> Result<(), ProbeError>;
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("failed to connect to {addr} after {attempts} attempts: {last_error}")]
pub struct ProbeError {
    pub addr: String,
    pub attempts: usize,
    pub last_error: String,
}

/// Dials the endpoint over TCP, retrying with a linearly increasing backoff.
#[derive(Clone, Debug)]
pub struct TcpProber {
    attempts: usize,
    backoff: time::Duration,
    timeout: time::Duration,
}

// === impl TcpProber ===

impl Default for TcpProber {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: time::Duration::from_secs(3),
            timeout: time::Duration::from_secs(1),
        }
    }
}

impl TcpProber {
    pub fn new(attempts: usize, backoff: time::Duration, timeout: time::Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
            timeout,
        }
    }
}

#[async_trait::async_trait]
impl Prober for TcpProber {
    async fn probe(&self, host: &str, port: u16) -> Result<(), ProbeError> {
        let addr = format!("{host}:{port}");
        let mut last_error = String::new();

        for attempt in 0..self.attempts {
            if attempt > 0 {
                time::sleep(self.backoff * attempt as u32).await;
            }
            match time::timeout(self.timeout, TcpStream::connect(&addr)).await {
                Ok(Ok(conn)) => {
                    drop(conn);
                    tracing::debug!(%addr, attempt, "Connected");
                    return Ok(());
                }
                Ok(Err(error)) => last_error = error.to_string(),
                Err(_) => last_error = format!("timed out after {:?}", self.timeout),
            }
            tracing::debug!(%addr, attempt, error = %last_error, "Probe failed");
        }

        Err(ProbeError {
            addr,
            attempts: self.attempts,
            last_error,
        })
    }
}
