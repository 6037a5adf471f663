//! HTTP client for the collection API.

use std::sync::Arc;
use std::time::Duration;

use rm_common::{ConfigurationSnapshot, CLIENT_VERSION};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::response::interpret_response;
use super::{count_records, TransmissionError, TransmissionOutcome, EVENTS_PATH, HEALTH_PATH, PASSPHRASE_HEADERS};

/// Sends payloads and probes health for one resolved configuration.
pub struct TransmissionClient {
    agent: ureq::Agent,
    api_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl std::fmt::Debug for TransmissionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransmissionClient")
            .field("api_url", &self.api_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "********"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// `User-Agent` header value.
pub fn user_agent() -> String {
    format!("ReportMate/{} ({})", CLIENT_VERSION, std::env::consts::OS)
}

impl TransmissionClient {
    pub fn new(snapshot: &ConfigurationSnapshot) -> Result<Self, TransmissionError> {
        let mut tls = native_tls::TlsConnector::builder();
        if !snapshot.validate_ssl {
            warn!("TLS certificate validation disabled by configuration");
            tls.danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true);
        }
        let connector = tls.build().map_err(|e| TransmissionError::Transport {
            detail: format!("TLS setup failed: {}", e),
        })?;

        let agent = ureq::AgentBuilder::new()
            .timeout(snapshot.timeout())
            .user_agent(&user_agent())
            .tls_connector(Arc::new(connector))
            .build();

        Ok(TransmissionClient {
            agent,
            api_url: snapshot.api_url.trim_end_matches('/').to_string(),
            api_key: snapshot.has_api_key().then(|| snapshot.api_key.clone()),
            timeout: snapshot.timeout(),
        })
    }

    pub fn events_url(&self) -> String {
        format!("{}{}", self.api_url, EVENTS_PATH)
    }

    pub fn health_url(&self) -> String {
        format!("{}{}", self.api_url, HEALTH_PATH)
    }

    /// `GET {apiUrl}/health`; any 2xx means up.
    pub fn check_health(&self) -> bool {
        let url = self.health_url();
        match self.agent.get(&url).call() {
            Ok(response) => {
                let up = (200..300).contains(&response.status());
                debug!(url = %url, status = response.status(), up, "health check");
                up
            }
            Err(ureq::Error::Status(status, _)) => {
                warn!(url = %url, status, "health check failed");
                false
            }
            Err(ureq::Error::Transport(t)) => {
                warn!(url = %url, error = %t, "health check unreachable");
                false
            }
        }
    }

    /// `POST {apiUrl}/api/events` with the payload as the JSON body.
    pub fn send(&self, payload: &Value) -> TransmissionOutcome {
        let body = match serde_json::to_string(payload) {
            Ok(body) => body,
            Err(e) => {
                return TransmissionOutcome::failure(TransmissionError::Encoding {
                    detail: e.to_string(),
                })
            }
        };
        let records = count_records(payload);
        let url = self.events_url();

        let mut request = self
            .agent
            .post(&url)
            .set("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            for header in PASSPHRASE_HEADERS {
                request = request.set(header, key);
            }
        }

        info!(url = %url, bytes = body.len(), records, "sending payload");
        let (status, text) = match request.send_string(&body) {
            Ok(response) => {
                let status = response.status();
                (status, read_body(response))
            }
            Err(ureq::Error::Status(status, response)) => (status, read_body(response)),
            Err(ureq::Error::Transport(t)) => {
                return TransmissionOutcome::failure(TransmissionError::Transport {
                    detail: t.to_string(),
                })
            }
        };

        let outcome = interpret_response(status, &text, records);
        debug!(status, success = outcome.is_success(), "payload response interpreted");
        outcome
    }
}

fn read_body(response: ureq::Response) -> String {
    response.into_string().unwrap_or_else(|e| {
        warn!(error = %e, "failed to read response body");
        String::new()
    })
}
