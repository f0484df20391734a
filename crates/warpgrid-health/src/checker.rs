//! Check execution — TCP and HTTP probes.
//!
//! A [`Checker`] always produces a [`ProbeOutcome`]. Network and protocol
//! errors are folded into a `critical` outcome carrying the error text, so
//! callers never branch on a failure path.

use std::time::Duration;

use async_trait::async_trait;
use http_body_util::BodyExt;
use tracing::debug;

use warp_core::{CheckResult, CheckType, Query};

/// Longest response body kept as check output.
const MAX_OUTPUT_BYTES: usize = 4 * 1024;

/// Result of executing a check once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub result: CheckResult,
    pub output: String,
}

impl ProbeOutcome {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            result: CheckResult::Success,
            output: output.into(),
        }
    }

    pub fn critical(output: impl Into<String>) -> Self {
        Self {
            result: CheckResult::Critical,
            output: output.into(),
        }
    }
}

/// Executes a single check.
#[async_trait]
pub trait Checker: Send + Sync {
    async fn check(&self, query: &Query) -> ProbeOutcome;
}

/// Probes checks over the network.
#[derive(Debug, Clone)]
pub struct ProbeChecker {
    /// Upper bound for any single probe.
    timeout: Duration,
}

impl ProbeChecker {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for ProbeChecker {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[async_trait]
impl Checker for ProbeChecker {
    async fn check(&self, query: &Query) -> ProbeOutcome {
        let Some(address) = query.address.as_deref() else {
            return ProbeOutcome::critical("warpgrid: check has no address to probe");
        };

        // A check's own timeout may shorten the probe, never extend it.
        let timeout = query
            .timeout
            .map_or(self.timeout, |t| t.min(self.timeout));

        let probe = async {
            match query.check_type {
                CheckType::Tcp => tcp_probe(address).await,
                CheckType::Http => http_probe(address, &query.method, &query.path).await,
            }
        };

        match tokio::time::timeout(timeout, probe).await {
            Ok(outcome) => outcome,
            Err(_) => {
                debug!(%address, ?timeout, "check timed out");
                ProbeOutcome::critical(format!("warpgrid: check timed out after {timeout:?}"))
            }
        }
    }
}

/// Succeeds iff a TCP connection can be opened.
async fn tcp_probe(address: &str) -> ProbeOutcome {
    match tokio::net::TcpStream::connect(address).await {
        Ok(_) => {
            debug!(%address, "tcp check passing");
            ProbeOutcome::success(format!("tcp connect {address}: ok"))
        }
        Err(e) => {
            debug!(%address, error = %e, "tcp check failing");
            ProbeOutcome::critical(e.to_string())
        }
    }
}

/// Issues `method path` against `address`. Status < 400 is success.
async fn http_probe(address: &str, method: &str, path: &str) -> ProbeOutcome {
    let method = match http::Method::from_bytes(method.as_bytes()) {
        Ok(m) => m,
        Err(e) => return ProbeOutcome::critical(format!("warpgrid: {e}")),
    };

    let stream = match tokio::net::TcpStream::connect(address).await {
        Ok(s) => s,
        Err(e) => {
            debug!(error = %e, %address, %path, "http check connection failed");
            return ProbeOutcome::critical(format!("warpgrid: {e}"));
        }
    };

    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
        Ok(pair) => pair,
        Err(e) => {
            debug!(error = %e, %address, "http check handshake failed");
            return ProbeOutcome::critical(format!("warpgrid: {e}"));
        }
    };

    // Drive the connection in the background.
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = match http::Request::builder()
        .method(method)
        .uri(path)
        .header("host", address)
        .header("user-agent", "warpgrid-health/0.1")
        .body(http_body_util::Empty::<bytes::Bytes>::new())
    {
        Ok(req) => req,
        Err(e) => return ProbeOutcome::critical(format!("warpgrid: {e}")),
    };

    let resp = match sender.send_request(req).await {
        Ok(resp) => resp,
        Err(e) => {
            debug!(error = %e, %address, %path, "http check request failed");
            return ProbeOutcome::critical(format!("warpgrid: {e}"));
        }
    };

    let status = resp.status();
    // A body read error is reported, but the status code decides.
    let output = match resp.into_body().collect().await {
        Ok(body) => truncate_output(&body.to_bytes()),
        Err(e) => format!("warpgrid: {e}"),
    };

    if status.as_u16() < 400 {
        debug!(%status, %address, %path, "http check passing");
        ProbeOutcome::success(output)
    } else {
        debug!(%status, %address, %path, "http check failing");
        ProbeOutcome::critical(output)
    }
}

fn truncate_output(body: &[u8]) -> String {
    let end = body.len().min(MAX_OUTPUT_BYTES);
    String::from_utf8_lossy(&body[..end]).into_owned()
}
