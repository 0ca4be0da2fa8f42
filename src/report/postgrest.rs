//! PostgREST RPC reporter.
//!
//! The attendance service exposes a database function over a PostgREST
//! gateway (as Supabase does). A scan is delivered as
//! `POST {endpoint}/rest/v1/rpc/{function}` with a JSON body of named
//! parameters, and the function's boolean result comes back as the body.

use super::{DeliveryError, ReportFuture, Reporter, ScanOutcome, ScanReport, decode_verdict, truncate};
use reqwest::Url;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Remote procedure called for every scan unless configured otherwise.
pub const DEFAULT_RPC_FUNCTION: &str = "scan_attendance";

/// Path prefix of the PostgREST RPC endpoints behind the gateway.
const RPC_PATH: &str = "rest/v1/rpc/";

/// Startup errors while building the reporter.
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("invalid service endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("missing service credential")]
    MissingCredential,
    #[error("invalid RPC function name '{0}'")]
    InvalidFunction(String),
    #[error("RPC timeout must be greater than zero")]
    ZeroTimeout,
    #[error("HTTP client setup failed: {0}")]
    Client(#[from] reqwest::Error),
}

/// Raw reply from the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcResponse {
    pub status: u16,
    pub body: String,
}

/// Boxed future returned by [`RpcTransport::call`].
pub type CallFuture<'a> =
    Pin<Box<dyn Future<Output = Result<RpcResponse, DeliveryError>> + Send + 'a>>;

/// Executes one RPC call. Split out from [`RpcReporter`] so the reporting
/// logic can be tested without a network.
pub trait RpcTransport: Send + Sync {
    fn call<'a>(&'a self, function: &'a str, body: String) -> CallFuture<'a>;
}

/// Named parameters of the attendance function.
#[derive(Debug, Serialize)]
struct ScanParams<'a> {
    p_tag_uid: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    p_reader_id: Option<&'a str>,
}

/// Error body PostgREST sends with non-2xx statuses.
#[derive(Debug, Deserialize)]
struct GatewayError {
    message: Option<String>,
    code: Option<String>,
    hint: Option<String>,
}

/// Build the JSON request body for a scan.
pub fn request_body(report: &ScanReport<'_>) -> String {
    let params = ScanParams {
        p_tag_uid: report.tag.as_str(),
        p_reader_id: report.reader_id,
    };
    // Serializing two string fields cannot fail.
    serde_json::to_string(&params).unwrap_or_default()
}

/// Reduce an error response to a one-line message for the logs.
fn status_message(body: &str) -> String {
    match serde_json::from_str::<GatewayError>(body) {
        Ok(GatewayError {
            message: Some(message),
            code,
            hint,
        }) => {
            let mut line = message;
            if let Some(code) = code {
                line = format!("{line} [{code}]");
            }
            if let Some(hint) = hint {
                line = format!("{line} (hint: {hint})");
            }
            line
        }
        _ => truncate(body, 200).to_string(),
    }
}

/// Reporter that calls a PostgREST function through an [`RpcTransport`].
#[derive(Debug, Clone)]
pub struct RpcReporter<T> {
    transport: T,
    function: String,
}

impl<T: RpcTransport> RpcReporter<T> {
    pub fn new(transport: T, function: impl Into<String>) -> Self {
        Self {
            transport,
            function: function.into(),
        }
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    async fn deliver(&self, report: ScanReport<'_>) -> ScanOutcome {
        let body = request_body(&report);
        tracing::debug!(function = %self.function, %body, "Calling attendance RPC");

        match self.transport.call(&self.function, body).await {
            Ok(RpcResponse { status, body }) if (200..300).contains(&status) => {
                decode_verdict(&body)
            }
            Ok(RpcResponse { status, body }) => ScanOutcome::DeliveryFailed(DeliveryError::Status {
                status,
                message: status_message(&body),
            }),
            Err(e) => ScanOutcome::DeliveryFailed(e),
        }
    }
}

impl<T: RpcTransport> Reporter for RpcReporter<T> {
    fn report<'a>(&'a self, report: ScanReport<'a>) -> ReportFuture<'a> {
        Box::pin(self.deliver(report))
    }
}

/// Production transport using reqwest.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base: Url,
    api_key: String,
}

impl HttpTransport {
    /// Validate the endpoint and credential and build the HTTP client.
    ///
    /// `timeout` bounds every call, connection included.
    pub fn new(endpoint: &str, api_key: &str, timeout: Duration) -> Result<Self, ReportError> {
        let invalid = |reason: String| ReportError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason,
        };

        let endpoint = endpoint.trim();
        let mut base = Url::parse(endpoint).map_err(|e| invalid(e.to_string()))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme '{}'", base.scheme())));
        }
        if base.cannot_be_a_base() {
            return Err(invalid("not a base URL".to_string()));
        }
        // Url::join replaces the last segment unless the path ends with '/'.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(ReportError::MissingCredential);
        }

        if timeout.is_zero() {
            return Err(ReportError::ZeroTimeout);
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base,
            api_key: api_key.to_string(),
        })
    }

    /// Full URL of the RPC endpoint for `function`.
    pub fn rpc_url(&self, function: &str) -> Result<Url, ReportError> {
        if function.is_empty()
            || !function
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ReportError::InvalidFunction(function.to_string()));
        }
        self.base
            .join(RPC_PATH)
            .and_then(|rpc| rpc.join(function))
            .map_err(|e| ReportError::InvalidEndpoint {
                endpoint: self.base.to_string(),
                reason: e.to_string(),
            })
    }

    async fn post(&self, function: &str, body: String) -> Result<RpcResponse, DeliveryError> {
        let url = self
            .rpc_url(function)
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let response = self
            .client
            .post(url.clone())
            .header("apikey", &self.api_key)
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| classify_reqwest(&url, e))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| classify_reqwest(&url, e))?;

        tracing::debug!(%url, status, response_len = body.len(), "Attendance RPC completed");
        Ok(RpcResponse { status, body })
    }
}

fn classify_reqwest(url: &Url, err: reqwest::Error) -> DeliveryError {
    if err.is_timeout() {
        DeliveryError::Timeout(format!("{url}: {err}"))
    } else {
        DeliveryError::Transport(format!("{url}: {err}"))
    }
}

impl RpcTransport for HttpTransport {
    fn call<'a>(&'a self, function: &'a str, body: String) -> CallFuture<'a> {
        Box::pin(self.post(function, body))
    }
}
