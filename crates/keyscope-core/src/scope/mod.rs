pub mod table;
pub mod template;

use crate::accumulator::Resource;
use crate::credential::Credential;
use crate::error::ProbeError;
use crate::probe::ProbeRequest;
use table::HttpTest;
use template::TemplateContext;

pub use table::{
    load_tests, BodyMarker, MarkerOutcome, ResourceMapping, ScopeTable, ScopeTest,
};

/// Service-wide request settings shared by every probe of a run.
#[derive(Debug, Clone)]
pub struct ProbeContext {
    pub base_url: String,
    pub headers: Vec<(String, String)>,
    pub credential: Credential,
}

impl ProbeContext {
    /// Render `test` into a request. `parent` is the resource a fan-out test
    /// was dispatched for.
    pub fn build_request(
        &self,
        test: &HttpTest,
        parent: Option<&Resource>,
    ) -> Result<ProbeRequest, ProbeError> {
        let ctx = TemplateContext::new(&self.credential).with_parent(parent);

        let path = template::render(&test.endpoint, &ctx)?;
        let url = if path.starts_with("http://") || path.starts_with("https://") {
            path
        } else {
            format!("{}{}", self.base_url.trim_end_matches('/'), path)
        };

        let mut request = ProbeRequest::new(test.method, test.endpoint.clone(), url);
        for (name, value) in &self.headers {
            request = request.header(name.clone(), template::render(value, &ctx)?);
        }

        if let Some(payload) = &test.payload {
            let body = template::render_json(payload, &ctx)?;
            if !request.has_header("Content-Type") {
                request = request.header("Content-Type", "application/json");
            }
            request.body = Some(body.to_string());
        }

        Ok(request)
    }
}
