use super::{HttpMethod, ProbeRequest, ProbeResult, ProbeTransport};
use crate::error::ProbeError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
enum MockReply {
    Respond { status: u16, body: String },
    Fail(String),
}

#[derive(Debug, Clone)]
struct MockRoute {
    method: HttpMethod,
    path: String,
    reply: MockReply,
    delay: Option<Duration>,
}

/// In-memory transport answering from a fixed route table.
///
/// Routes match on method and URL path (query string optional). A request
/// with no matching route fails as a transport error, so an unexpected call
/// never goes unnoticed.
///
/// Public so integration tests and custom service definitions can be
/// exercised without a network. The CLI only ever uses `HttpProbeExecutor`.
#[derive(Debug, Default)]
pub struct MockTransport {
    routes: Mutex<Vec<MockRoute>>,
    calls: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `method path` with `status` and `body`. Later registrations for
    /// the same route replace earlier ones.
    pub fn on(&self, method: HttpMethod, path: &str, status: u16, body: &str) -> &Self {
        self.push(MockRoute {
            method,
            path: path.to_string(),
            reply: MockReply::Respond {
                status,
                body: body.to_string(),
            },
            delay: None,
        })
    }

    /// Like [`MockTransport::on`] but the reply is held back for `delay`.
    pub fn on_delayed(
        &self,
        method: HttpMethod,
        path: &str,
        status: u16,
        body: &str,
        delay: Duration,
    ) -> &Self {
        self.push(MockRoute {
            method,
            path: path.to_string(),
            reply: MockReply::Respond {
                status,
                body: body.to_string(),
            },
            delay: Some(delay),
        })
    }

    /// Fail `method path` with a transport error.
    pub fn fail(&self, method: HttpMethod, path: &str, message: &str) -> &Self {
        self.push(MockRoute {
            method,
            path: path.to_string(),
            reply: MockReply::Fail(message.to_string()),
            delay: None,
        })
    }

    /// Every request seen so far as `"METHOD /path"`, in arrival order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, method: HttpMethod, path: &str) -> usize {
        let wanted = format!("{} {}", method, path);
        self.calls.lock().iter().filter(|c| **c == wanted).count()
    }

    fn push(&self, route: MockRoute) -> &Self {
        let mut routes = self.routes.lock();
        routes.retain(|r| !(r.method == route.method && r.path == route.path));
        routes.push(route);
        self
    }

    fn find(&self, method: HttpMethod, path: &str) -> Option<MockRoute> {
        let without_query = path.split('?').next().unwrap_or(path);
        let routes = self.routes.lock();
        routes
            .iter()
            .find(|r| r.method == method && r.path == path)
            .or_else(|| {
                routes
                    .iter()
                    .find(|r| r.method == method && r.path == without_query)
            })
            .cloned()
    }
}

/// Path and query of an absolute URL.
fn url_path(url: &str) -> &str {
    let after_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    match after_scheme.find('/') {
        Some(idx) => &after_scheme[idx..],
        None => "/",
    }
}

#[async_trait]
impl ProbeTransport for MockTransport {
    async fn probe(&self, request: &ProbeRequest) -> Result<ProbeResult, ProbeError> {
        let path = url_path(&request.url);
        self.calls.lock().push(format!("{} {}", request.method, path));

        let Some(route) = self.find(request.method, path) else {
            return Err(ProbeError::Transport {
                endpoint: request.endpoint.clone(),
                message: format!("no mock route for {} {}", request.method, path),
            });
        };

        if let Some(delay) = route.delay {
            tokio::time::sleep(delay).await;
        }

        match route.reply {
            MockReply::Respond { status, body } => Ok(ProbeResult::new(status, body.into_bytes())),
            MockReply::Fail(message) => Err(ProbeError::Transport {
                endpoint: request.endpoint.clone(),
                message,
            }),
        }
    }
}
