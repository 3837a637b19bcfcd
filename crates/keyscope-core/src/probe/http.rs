use super::{HttpMethod, ProbeRequest, ProbeResult, ProbeTransport};
use crate::config::RunConfig;
use crate::error::ProbeError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

/// Probe executor backed by a shared `reqwest` client.
///
/// The client is cheap to clone and safe to use from every probe task at once.
#[derive(Clone)]
pub struct HttpProbeExecutor {
    client: reqwest::Client,
}

impl HttpProbeExecutor {
    /// Create an executor using the timeout and user agent from `config`.
    pub fn new(config: &RunConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent).context("Invalid user agent")?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout())
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { client })
    }

    /// Wrap an already configured client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn to_reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
        HttpMethod::Head => reqwest::Method::HEAD,
    }
}

fn transport_error(request: &ProbeRequest, error: reqwest::Error) -> ProbeError {
    // The URL may embed the credential (query-string keys), so drop it.
    let message = if error.is_timeout() {
        "request timed out".to_string()
    } else {
        error.without_url().to_string()
    };
    ProbeError::Transport {
        endpoint: request.endpoint.clone(),
        message,
    }
}

#[async_trait]
impl ProbeTransport for HttpProbeExecutor {
    async fn probe(&self, request: &ProbeRequest) -> Result<ProbeResult, ProbeError> {
        let mut builder = self
            .client
            .request(to_reqwest_method(request.method), &request.url);

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|error| transport_error(request, error))?;

        let status = response.status().as_u16();
        // Reading to the end releases the connection back to the pool.
        let body = response
            .bytes()
            .await
            .map_err(|error| transport_error(request, error))?;

        Ok(ProbeResult::new(status, body.to_vec()))
    }
}
