use super::{HttpMethod, ProbeRequest, ProbeResult, ProbeTransport};
use crate::error::ProbeError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// One line of the request log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestLogEntry {
    pub method: HttpMethod,
    pub path: String,
    /// `None` when the request failed before a status was received.
    pub status: Option<u16>,
    pub timestamp: DateTime<Utc>,
    pub elapsed_ms: u64,
}

/// Transport wrapper that records every request it forwards.
///
/// Each request is emitted as a `tracing` event and kept in memory so a
/// caller can print the full log after the run.
pub struct LoggingTransport<T> {
    inner: T,
    entries: Mutex<Vec<RequestLogEntry>>,
}

impl<T: ProbeTransport> LoggingTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Copy of the log so far, in completion order.
    pub fn entries(&self) -> Vec<RequestLogEntry> {
        self.entries.lock().clone()
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

#[async_trait]
impl<T: ProbeTransport> ProbeTransport for LoggingTransport<T> {
    async fn probe(&self, request: &ProbeRequest) -> Result<ProbeResult, ProbeError> {
        let timestamp = Utc::now();
        let started = Instant::now();
        let result = self.inner.probe(request).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let status = result.as_ref().ok().map(|r| r.status);
        match status {
            Some(code) => tracing::debug!(
                method = %request.method,
                path = %request.endpoint,
                status = code,
                elapsed_ms,
                "probe request"
            ),
            None => tracing::debug!(
                method = %request.method,
                path = %request.endpoint,
                elapsed_ms,
                "probe request failed"
            ),
        }

        self.entries.lock().push(RequestLogEntry {
            method: request.method,
            path: request.endpoint.clone(),
            status,
            timestamp,
            elapsed_ms,
        });

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::MockTransport;

    #[tokio::test]
    async fn test_records_status_and_failures() {
        let mock = MockTransport::new();
        mock.on(HttpMethod::Get, "/users/me", 200, r#"{"id":"u1"}"#);
        mock.fail(HttpMethod::Get, "/down", "connection refused");
        let transport = LoggingTransport::new(mock);

        let ok = ProbeRequest::new(HttpMethod::Get, "/users/me", "https://api.example/users/me");
        let bad = ProbeRequest::new(HttpMethod::Get, "/down", "https://api.example/down");
        assert!(transport.probe(&ok).await.is_ok());
        assert!(transport.probe(&bad).await.is_err());

        let entries = transport.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, "/users/me");
        assert_eq!(entries[0].status, Some(200));
        assert_eq!(entries[1].status, None);
    }
}
