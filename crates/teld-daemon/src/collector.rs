//! Ingestion service client.
//!
//! Two operations reach the remote service: the connect handshake that
//! turns an application identity into a run token, and payload submission
//! during harvest. Failure folding is deliberately blunt: every outcome
//! short of acceptance discards the payload, and only a permanent
//! rejection touches the application entry (it clears the run token and
//! forces a re-connect).

use std::time::Duration;

use reqwest::StatusCode;
use serde_json::json;
use teld_core::harvest::Endpoint;
use teld_core::identity::AppIdentity;
use teld_core::Config;
use tracing::{debug, warn};

use crate::protocol::RejectReason;

/// Error raised while building the client.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    /// The HTTP client could not be constructed.
    #[error("cannot build ingest client: {0}")]
    Client(#[from] reqwest::Error),

    /// A CA bundle or directory could not be read.
    #[error("cannot load CA certificates from {path}: {source}")]
    CaUnreadable {
        /// Offending path.
        path: String,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },
}

/// Result of the connect handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// The service issued a run token.
    Accepted {
        /// Opaque application-run token; required on every upload.
        run_token: String,
    },
    /// The service turned the application away.
    Rejected(RejectReason),
    /// The service could not be reached; try again later.
    Unavailable,
}

/// Result of one payload submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The payload was accepted.
    Accepted,
    /// The payload or the run identity was rejected; re-connect before
    /// uploading anything else.
    RejectedPermanent,
    /// The service is temporarily unavailable. The payload is still
    /// discarded; there is no retry buffer.
    RejectedRetry,
}

/// HTTP client for the ingestion service.
#[derive(Debug)]
pub struct CollectorClient {
    http: reqwest::Client,
    base: String,
}

impl CollectorClient {
    /// Build a client from the daemon configuration, honouring proxy and
    /// CA settings.
    ///
    /// # Errors
    ///
    /// Returns a [`CollectorError`] if the CA material cannot be read or
    /// the underlying client cannot be built.
    pub fn new(cfg: &Config) -> Result<Self, CollectorError> {
        // Redirects are connect-level signals, not something to follow.
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .redirect(reqwest::redirect::Policy::none());

        if !cfg.proxy.is_empty() {
            builder = builder.proxy(reqwest::Proxy::all(&cfg.proxy)?);
        }
        if !cfg.ca_file.is_empty() {
            builder = add_ca_bundle(builder, &cfg.ca_file)?;
        }
        if !cfg.ca_path.is_empty() {
            let entries =
                std::fs::read_dir(&cfg.ca_path).map_err(|source| CollectorError::CaUnreadable {
                    path: cfg.ca_path.clone(),
                    source,
                })?;
            for entry in entries.flatten() {
                builder = add_ca_bundle(builder, &entry.path().display().to_string())?;
            }
        }

        // A bare host gets the https scheme; a full URL (used by tests)
        // passes through.
        let base = if cfg.collector.contains("://") {
            cfg.collector.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", cfg.collector)
        };

        Ok(Self {
            http: builder.build()?,
            base,
        })
    }

    fn url(&self, method: &str, license: &str, run_token: Option<&str>) -> String {
        let mut url = format!(
            "{}/invoke?method={method}&license_key={license}",
            self.base
        );
        if let Some(token) = run_token {
            url.push_str("&run_token=");
            url.push_str(token);
        }
        url
    }

    /// Perform the connect handshake for `identity`.
    pub async fn connect(&self, identity: &AppIdentity) -> ConnectOutcome {
        let body = json!({
            "app_names": identity.app_names,
            "language": identity.language,
            "agent_version": identity.agent_version,
            "high_security": identity.high_security,
        });

        let response = self
            .http
            .post(self.url("connect", &identity.license, None))
            .json(&body)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                debug!(app = %identity, "connect failed: {e}");
                return ConnectOutcome::Unavailable;
            }
        };

        let status = response.status();
        if status.is_redirection() {
            return ConnectOutcome::Rejected(RejectReason::Redirected);
        }
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::GONE => {
                ConnectOutcome::Rejected(RejectReason::InvalidLicense)
            }
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
                ConnectOutcome::Rejected(RejectReason::HighSecurityMismatch)
            }
            s if s.is_success() => match parse_run_token(response).await {
                Some(run_token) => ConnectOutcome::Accepted { run_token },
                None => {
                    warn!(app = %identity, "connect reply carried no run token");
                    ConnectOutcome::Unavailable
                }
            },
            _ => ConnectOutcome::Unavailable,
        }
    }

    /// Submit one reduced payload for the application run `run_token`.
    ///
    /// The run identity travels in the URL only; the body is exactly the
    /// reduced payload.
    pub async fn submit(
        &self,
        endpoint: Endpoint,
        license: &str,
        run_token: &str,
        body: Vec<u8>,
    ) -> UploadOutcome {
        let response = self
            .http
            .post(self.url(endpoint.method(), license, Some(run_token)))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                debug!(endpoint = endpoint.method(), "submit failed: {e}");
                return UploadOutcome::RejectedRetry;
            }
        };

        let status = response.status();
        if status.is_success() {
            return UploadOutcome::Accepted;
        }
        match status {
            StatusCode::UNAUTHORIZED
            | StatusCode::FORBIDDEN
            | StatusCode::CONFLICT
            | StatusCode::GONE
            | StatusCode::PRECONDITION_FAILED
            | StatusCode::PAYLOAD_TOO_LARGE
            | StatusCode::UNSUPPORTED_MEDIA_TYPE => UploadOutcome::RejectedPermanent,
            _ => UploadOutcome::RejectedRetry,
        }
    }
}

fn add_ca_bundle(
    builder: reqwest::ClientBuilder,
    path: &str,
) -> Result<reqwest::ClientBuilder, CollectorError> {
    let pem = std::fs::read(path).map_err(|source| CollectorError::CaUnreadable {
        path: path.to_string(),
        source,
    })?;
    let mut builder = builder;
    for cert in reqwest::Certificate::from_pem_bundle(&pem)? {
        builder = builder.add_root_certificate(cert);
    }
    Ok(builder)
}

async fn parse_run_token(response: reqwest::Response) -> Option<String> {
    let body: serde_json::Value = response.json().await.ok()?;
    body["return_value"]["run_token"]
        .as_str()
        .map(ToString::to_string)
}
