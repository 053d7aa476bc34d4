//! Round-trip prober
//!
//! Issues exactly one HTTP request per [`Probe`] and classifies the outcome.
//! There are no retries: whether a failure is fatal is the caller's decision.

use std::fmt;

use reqwest::header::HOST;
use reqwest::{Method, StatusCode};
use thiserror::Error;
use tracing::debug;

/// Why a probe failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    /// DNS, connect, timeout or body read failure
    Connect {
        /// Transport error text
        message: String,
    },
    /// The response status was not 200
    BadStatus {
        /// Status code returned by the server
        status: u16,
        /// Response body, verbatim, to surface server-side error text
        body: String,
    },
    /// The response body differed from the expected contents
    BodyMismatch {
        /// Body actually returned
        got: String,
        /// Body that was expected
        want: String,
    },
}

/// A failed probe, with enough context to tell which request went wrong
#[derive(Debug, Clone, Error)]
#[error("{}", describe(.label, .url, .failure))]
pub struct ProbeError {
    /// Human-readable label, e.g. `GET RWX NodePort`
    pub label: String,
    /// HTTP method used
    pub method: Method,
    /// URL that was requested
    pub url: String,
    /// Classified failure
    pub failure: ProbeFailure,
}

fn describe(label: &str, url: &str, failure: &ProbeFailure) -> String {
    match failure {
        ProbeFailure::Connect { message } => {
            format!("failed to connect to {} {}: {}", label, url, message)
        }
        ProbeFailure::BadStatus { status, body } => format!(
            "{} {} returned non-200 status code {}: {}",
            label, url, status, body
        ),
        ProbeFailure::BodyMismatch { got, want } => format!(
            "{} {} returned unexpected body {:?} instead of expected body {:?}",
            label, url, got, want
        ),
    }
}

/// A single HTTP round trip to perform
#[derive(Debug, Clone)]
pub struct Probe {
    label: String,
    method: Method,
    url: String,
    body: Option<String>,
    expected_body: Option<String>,
    host_header: Option<String>,
}

impl Probe {
    /// A GET probe with no body expectation
    pub fn get(label: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            method: Method::GET,
            url: url.into(),
            body: None,
            expected_body: None,
            host_header: None,
        }
    }

    /// A POST probe sending `body` as `application/octet-stream`
    pub fn post(label: impl Into<String>, url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            method: Method::POST,
            url: url.into(),
            body: Some(body.into()),
            expected_body: None,
            host_header: None,
        }
    }

    /// Require the response body to equal `expected` byte-for-byte.
    ///
    /// An empty expectation leaves the body unchecked.
    pub fn expect_body(mut self, expected: impl Into<String>) -> Self {
        let expected = expected.into();
        self.expected_body = (!expected.is_empty()).then_some(expected);
        self
    }

    /// Send `host` as the virtual-host header instead of the URL's host
    pub fn host_header(mut self, host: impl Into<String>) -> Self {
        self.host_header = Some(host.into());
        self
    }

    /// The label used in failure messages
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The URL this probe targets
    pub fn url(&self) -> &str {
        &self.url
    }

    fn fail(&self, failure: ProbeFailure) -> ProbeError {
        ProbeError {
            label: self.label.clone(),
            method: self.method.clone(),
            url: self.url.clone(),
            failure,
        }
    }
}

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.label, self.url)
    }
}

/// Runs [`Probe`]s against a shared HTTP client
#[derive(Debug, Clone)]
pub struct Prober {
    client: reqwest::Client,
}

impl Prober {
    /// Wrap a configured client (proxy, TLS options, etc.)
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Perform the probe once and classify the outcome
    pub async fn run(&self, probe: &Probe) -> Result<(), ProbeError> {
        let mut request = self.client.request(probe.method.clone(), &probe.url);
        if let Some(host) = &probe.host_header {
            request = request.header(HOST, host);
        }
        if let Some(body) = &probe.body {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(body.clone());
        }

        let response = request.send().await.map_err(|e| {
            probe.fail(ProbeFailure::Connect {
                message: e.to_string(),
            })
        })?;
        let status = response.status();
        let body = response.text().await.map_err(|e| {
            probe.fail(ProbeFailure::Connect {
                message: format!("failed to read response body: {}", e),
            })
        })?;

        debug!(label = %probe.label, url = %probe.url, status = status.as_u16(), "probe response");

        if status != StatusCode::OK {
            return Err(probe.fail(ProbeFailure::BadStatus {
                status: status.as_u16(),
                body,
            }));
        }

        match &probe.expected_body {
            Some(want) if *want != body => Err(probe.fail(ProbeFailure::BodyMismatch {
                got: body,
                want: want.clone(),
            })),
            _ => Ok(()),
        }
    }
}
