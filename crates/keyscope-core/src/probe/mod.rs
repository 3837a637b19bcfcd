pub mod http;
pub mod logging;
pub mod mock;

use crate::error::ProbeError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub use http::HttpProbeExecutor;
pub use logging::{LoggingTransport, RequestLogEntry};
pub use mock::MockTransport;

/// HTTP method used by a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully rendered request, ready to send.
#[derive(Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    pub method: HttpMethod,
    /// Endpoint template the request was rendered from. Used in logs and
    /// errors because it never contains secrets.
    pub endpoint: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl ProbeRequest {
    pub fn new(method: HttpMethod, endpoint: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers
            .iter()
            .any(|(existing, _)| existing.eq_ignore_ascii_case(name))
    }
}

impl fmt::Debug for ProbeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Header values routinely carry the credential.
        let headers: Vec<&str> = self.headers.iter().map(|(name, _)| name.as_str()).collect();
        f.debug_struct("ProbeRequest")
            .field("method", &self.method)
            .field("endpoint", &self.endpoint)
            .field("headers", &headers)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

/// Status code and fully drained body of one HTTP call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub status: u16,
    pub body: Vec<u8>,
}

impl ProbeResult {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Something that can execute a probe request.
///
/// Implementations must return `Ok` for every HTTP status and reserve `Err`
/// for network or protocol failures. They must not retry.
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    async fn probe(&self, request: &ProbeRequest) -> Result<ProbeResult, ProbeError>;
}

#[async_trait]
impl<T: ProbeTransport + ?Sized> ProbeTransport for Arc<T> {
    async fn probe(&self, request: &ProbeRequest) -> Result<ProbeResult, ProbeError> {
        (**self).probe(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_debug_hides_header_values() {
        let request = ProbeRequest::new(HttpMethod::Get, "/users/me", "https://api.example/users/me")
            .header("Authorization", "Bearer secret-token");
        let printed = format!("{:?}", request);
        assert!(printed.contains("Authorization"));
        assert!(!printed.contains("secret-token"));
    }

    #[test]
    fn test_method_serde_uppercase() {
        let method: HttpMethod = serde_yaml::from_str("DELETE").unwrap();
        assert_eq!(method, HttpMethod::Delete);
        assert_eq!(serde_json::to_string(&HttpMethod::Patch).unwrap(), "\"PATCH\"");
    }

    #[test]
    fn test_has_header_case_insensitive() {
        let request = ProbeRequest::new(HttpMethod::Post, "/x", "https://h/x")
            .header("content-type", "application/json");
        assert!(request.has_header("Content-Type"));
        assert!(!request.has_header("Accept"));
    }
}
