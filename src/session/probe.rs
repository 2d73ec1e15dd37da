//! Transport probe: a short pre-flight connection that classifies
//! signaling failures before registration is attempted.
//!
//! A TLS failure here almost always means the PBX runs a self-signed
//! certificate this host has not accepted yet. The probe derives the
//! https:// URL of the same endpoint so the operator can open it in a
//! browser, inspect the certificate and accept it.

use std::fmt;
use std::time::Duration;

use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite;
use url::Url;

use super::transport::SignalSocket;

/// Default probe deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Handshake completed within the deadline.
    Reachable { rtt_ms: u128 },
    /// TLS layer refused: untrusted or self-signed certificate, most likely.
    TrustFailure { https_url: String, detail: String },
    /// No handshake before the deadline.
    Timeout { waited: Duration },
    /// Refused, unreachable, DNS failure or HTTP-level rejection.
    Failed { detail: String },
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeOutcome::Reachable { rtt_ms } => write!(f, "reachable ({rtt_ms} ms)"),
            ProbeOutcome::TrustFailure { detail, .. } => write!(f, "TLS trust failure: {detail}"),
            ProbeOutcome::Timeout { waited } => {
                write!(f, "no response within {}s", waited.as_secs())
            }
            ProbeOutcome::Failed { detail } => write!(f, "failed: {detail}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub url: String,
    pub outcome: ProbeOutcome,
}

impl ProbeReport {
    pub fn is_reachable(&self) -> bool {
        matches!(self.outcome, ProbeOutcome::Reachable { .. })
    }

    /// One-line operator guidance for the outcome.
    pub fn advice(&self) -> String {
        match &self.outcome {
            ProbeOutcome::Reachable { .. } => "signaling endpoint reachable".to_string(),
            ProbeOutcome::TrustFailure { https_url, .. } => format!(
                "the server certificate is not trusted; open {https_url} in a browser and accept the certificate, then try again"
            ),
            ProbeOutcome::Timeout { waited } => format!(
                "no answer within {}s; check the server address and firewall",
                waited.as_secs()
            ),
            ProbeOutcome::Failed { detail } => format!("connection failed: {detail}"),
        }
    }
}

/// Run the probe: connect, classify, close immediately.
pub async fn run(url: &Url, deadline: Duration) -> ProbeReport {
    tracing::debug!("Probing {} (deadline {:?})", url, deadline);
    let started = Instant::now();

    let outcome = match timeout(deadline, SignalSocket::connect(url)).await {
        Ok(Ok(mut socket)) => {
            let rtt_ms = started.elapsed().as_millis();
            socket.close().await;
            ProbeOutcome::Reachable { rtt_ms }
        }
        Ok(Err(e)) => classify(url, &e),
        Err(_) => ProbeOutcome::Timeout { waited: deadline },
    };

    tracing::debug!("Probe outcome for {}: {}", url, outcome);
    ProbeReport { url: url.to_string(), outcome }
}

fn classify(url: &Url, err: &tungstenite::Error) -> ProbeOutcome {
    match err {
        tungstenite::Error::Tls(e) => ProbeOutcome::TrustFailure {
            https_url: https_equivalent(url),
            detail: e.to_string(),
        },
        tungstenite::Error::Http(response) => ProbeOutcome::Failed {
            detail: format!(
                "server rejected the WebSocket upgrade (HTTP {})",
                response.status()
            ),
        },
        other => ProbeOutcome::Failed { detail: other.to_string() },
    }
}

/// wss://host:port/path rewritten as https://host:port/path, for manual
/// certificate inspection in a browser.
pub fn https_equivalent(url: &Url) -> String {
    let mut out = String::from("https://");
    out.push_str(url.host_str().unwrap_or_default());
    if let Some(port) = url.port() {
        out.push(':');
        out.push_str(&port.to_string());
    }
    out.push_str(url.path());
    out
}

/// Follow-up HTTPS GET against the derived URL to pull the certificate
/// error text out of the TLS stack. Used by the `probe` subcommand only;
/// the connect path never blocks on this.
pub async fn certificate_detail(https_url: &str) -> String {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
    {
        Ok(c) => c,
        Err(e) => return format!("could not build HTTPS client: {e}"),
    };

    match client.get(https_url).send().await {
        Ok(resp) => format!(
            "HTTPS endpoint answered with status {}; its certificate is trusted by this host",
            resp.status()
        ),
        Err(e) => {
            // reqwest wraps the TLS failure; the innermost source carries
            // the useful text from the TLS stack.
            let mut detail = e.to_string();
            let mut source = std::error::Error::source(&e);
            while let Some(s) = source {
                detail = s.to_string();
                source = std::error::Error::source(s);
            }
            detail
        }
    }
}

// ---------------------------------------------------------------------------
