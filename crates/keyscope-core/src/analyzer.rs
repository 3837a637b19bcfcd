use crate::accumulator::{RunAccumulator, UserIdentity};
use crate::classifier::{classify, Outcome};
use crate::config::RunConfig;
use crate::credential::Credential;
use crate::error::ProbeError;
use crate::probe::ProbeTransport;
use crate::projection::{account_resource, project, AnalyzerResult};
use crate::redact::redact_credential;
use crate::runner::{CancelToken, ProbeRunner};
use crate::scope::table::{lookup_field, value_to_string, HttpTest};
use crate::scope::template::{self, TemplateContext};
use crate::scope::{ProbeContext, ScopeTable, ScopeTest};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// The call that proves a credential is live and says who owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityCheck {
    #[serde(flatten)]
    pub test: HttpTest,
    #[serde(default = "default_id_field")]
    pub id_field: String,
    #[serde(default)]
    pub name_field: Option<String>,
    #[serde(default)]
    pub email_field: Option<String>,
    /// Accept a live credential whose response carries no id (for example a
    /// key allowed to authenticate but not to read account details). The run
    /// then proceeds without an identity.
    #[serde(default)]
    pub optional_id: bool,
}

fn default_id_field() -> String {
    "id".to_string()
}

/// Everything needed to analyze credentials for one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub analyzer_type: String,
    #[serde(default)]
    pub description: Option<String>,
    pub base_url: String,
    /// Header templates sent with every probe, e.g. `Bearer {{key}}`.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Credential fields that must be present before any request is made.
    #[serde(default = "default_required_fields")]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub identity: Option<IdentityCheck>,
    /// Full scope universe; derived from the tests when empty.
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub tests: Vec<ScopeTest>,
}

fn default_required_fields() -> Vec<String> {
    vec!["key".to_string()]
}

impl ServiceDefinition {
    pub fn from_yaml(source: &str) -> Result<Self, ProbeError> {
        let definition: ServiceDefinition = serde_yaml::from_str(source)
            .map_err(|e| ProbeError::Config(format!("failed to parse service definition: {e}")))?;
        definition.validate()?;
        Ok(definition)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read service definition: {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Invalid service definition: {}", path.display()))
    }

    /// Build the validated scope table for this service.
    pub fn table(&self) -> Result<ScopeTable, ProbeError> {
        ScopeTable::new(self.tests.clone(), self.scopes.clone())
    }

    /// Credential fields referenced by placeholders anywhere in the
    /// definition.
    pub fn credential_fields(&self) -> BTreeSet<String> {
        let mut templates: Vec<&str> = vec![self.base_url.as_str()];
        templates.extend(self.headers.values().map(String::as_str));
        if let Some(identity) = &self.identity {
            templates.push(&identity.test.endpoint);
        }
        for test in &self.tests {
            templates.push(&test.test.endpoint);
            if let Some(payload) = &test.test.payload {
                collect_strings(payload, &mut templates);
            }
        }

        templates
            .into_iter()
            .flat_map(template::placeholders)
            .filter(|name| name != "fake_id" && !name.starts_with("parent."))
            .collect()
    }

    fn validate(&self) -> Result<(), ProbeError> {
        if self.analyzer_type.trim().is_empty() {
            return Err(ProbeError::Config("analyzer_type must not be empty".into()));
        }
        self.table()?;

        let missing: Vec<String> = self
            .credential_fields()
            .into_iter()
            .filter(|field| !self.required_fields.contains(field))
            .collect();
        if !missing.is_empty() {
            return Err(ProbeError::Config(format!(
                "{}: placeholders {} are not listed in required_fields",
                self.analyzer_type,
                missing.join(", ")
            )));
        }
        Ok(())
    }
}

/// Result of a run that got past the identity check.
///
/// `error` holds the aggregate of every probe that could not be completed;
/// `result` still contains everything the other probes found.
#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub result: AnalyzerResult,
    pub error: Option<ProbeError>,
}

impl AnalysisOutcome {
    /// One line per failed check.
    pub fn failures(&self) -> Vec<String> {
        self.error
            .as_ref()
            .map(|e| e.failures().iter().map(ToString::to_string).collect())
            .unwrap_or_default()
    }

    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

/// Drives one service definition: identity check, probe stages, projection.
pub struct Analyzer {
    definition: ServiceDefinition,
    table: Arc<ScopeTable>,
    transport: Arc<dyn ProbeTransport>,
    config: RunConfig,
}

impl Analyzer {
    pub fn new(
        definition: ServiceDefinition,
        transport: Arc<dyn ProbeTransport>,
        config: RunConfig,
    ) -> Result<Self, ProbeError> {
        config.validate()?;
        let table = Arc::new(definition.table()?);
        Ok(Self {
            definition,
            table,
            transport,
            config,
        })
    }

    pub fn definition(&self) -> &ServiceDefinition {
        &self.definition
    }

    pub fn table(&self) -> &ScopeTable {
        &self.table
    }

    pub async fn analyze(&self, credential: &Credential) -> Result<AnalysisOutcome, ProbeError> {
        self.analyze_with_cancel(credential, CancelToken::new()).await
    }

    /// Analyze `credential`. Fails outright only when the credential is
    /// unusable (missing fields, rejected identity) or the identity call
    /// itself fails; probe failures after that are reported in the outcome.
    pub async fn analyze_with_cancel(
        &self,
        credential: &Credential,
        cancel: CancelToken,
    ) -> Result<AnalysisOutcome, ProbeError> {
        for field in &self.definition.required_fields {
            credential.require(field)?;
        }

        let context = self.probe_context(credential)?;
        let accumulator = Arc::new(RunAccumulator::for_table(&self.table));

        if let Some(identity) = &self.definition.identity {
            match self.check_identity(identity, &context).await? {
                Some(user) => {
                    info!(analyzer = %self.definition.analyzer_type, user = %user.id, "credential is valid");
                    accumulator.set_identity(user);
                }
                None => info!(analyzer = %self.definition.analyzer_type, "credential is valid, owner not disclosed"),
            }
        }

        let runner = ProbeRunner::new(Arc::clone(&self.transport), context)
            .with_concurrency(self.config.concurrency)
            .with_cancel(cancel);
        let error = match runner.run_all(self.table.tests(), &accumulator).await {
            Ok(()) => None,
            Err(error) => {
                let error = scrub_error(error, credential);
                warn!(analyzer = %self.definition.analyzer_type, error = %error, "some checks could not be completed");
                Some(error)
            }
        };

        let account = account_resource(&self.definition.analyzer_type, accumulator.identity());
        accumulator.bind_unplaced_scopes(account)?;

        let result = project(&self.definition.analyzer_type, &accumulator.snapshot());
        Ok(AnalysisOutcome { result, error })
    }

    fn probe_context(&self, credential: &Credential) -> Result<ProbeContext, ProbeError> {
        let ctx = TemplateContext::new(credential);
        let base_url = match &self.config.base_url_override {
            Some(url) => url.clone(),
            None => template::render(&self.definition.base_url, &ctx)?,
        };
        let headers = self
            .definition
            .headers
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        Ok(ProbeContext {
            base_url,
            headers,
            credential: credential.clone(),
        })
    }

    async fn check_identity(
        &self,
        identity: &IdentityCheck,
        context: &ProbeContext,
    ) -> Result<Option<UserIdentity>, ProbeError> {
        let request = context.build_request(&identity.test, None)?;
        let result = self.transport.probe(&request).await;

        match classify(&identity.test, &result) {
            Outcome::Granted => {}
            Outcome::Denied => {
                let status = result.as_ref().map(|r| r.status).unwrap_or_default();
                return Err(ProbeError::Auth { status });
            }
            Outcome::Unverifiable => {
                return Err(ProbeError::AmbiguousResponse {
                    endpoint: identity.test.endpoint.clone(),
                    status: result.as_ref().map(|r| r.status).unwrap_or_default(),
                    reason: "identity check could not be verified".to_string(),
                })
            }
            Outcome::Error(error) => return Err(scrub_error(error, &context.credential)),
        }

        let response = result?;
        let body = match response.json() {
            Ok(body) => body,
            Err(_) if identity.optional_id => return Ok(None),
            Err(e) => {
                return Err(ProbeError::AmbiguousResponse {
                    endpoint: identity.test.endpoint.clone(),
                    status: response.status,
                    reason: format!("identity response is not JSON: {e}"),
                })
            }
        };

        let field = |name: &Option<String>| {
            name.as_deref()
                .and_then(|f| lookup_field(&body, f))
                .map(value_to_string)
                .filter(|v| !v.is_empty())
        };
        let id = lookup_field(&body, &identity.id_field)
            .map(value_to_string)
            .filter(|v| !v.is_empty());
        let id = match id {
            Some(id) => id,
            None if identity.optional_id => return Ok(None),
            None => {
                return Err(ProbeError::AmbiguousResponse {
                    endpoint: identity.test.endpoint.clone(),
                    status: response.status,
                    reason: format!("identity response has no '{}' field", identity.id_field),
                })
            }
        };

        Ok(Some(UserIdentity {
            id,
            name: field(&identity.name_field),
            email: field(&identity.email_field),
        }))
    }
}

/// Every string nested in a JSON payload.
fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|item| collect_strings(item, out)),
        Value::Object(map) => map.values().for_each(|item| collect_strings(item, out)),
        _ => {}
    }
}

fn scrub_error(error: ProbeError, credential: &Credential) -> ProbeError {
    match error {
        ProbeError::Transport { endpoint, message } => ProbeError::Transport {
            endpoint,
            message: redact_credential(&message, credential),
        },
        ProbeError::AmbiguousResponse {
            endpoint,
            status,
            reason,
        } => ProbeError::AmbiguousResponse {
            endpoint,
            status,
            reason: redact_credential(&reason, credential),
        },
        ProbeError::Partial(errors) => ProbeError::Partial(
            errors
                .into_iter()
                .map(|e| scrub_error(e, credential))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{HttpMethod, MockTransport};

    const SERVICE: &str = r#"
analyzer_type: things
base_url: https://{{domain}}/api
required_fields: [key, domain]
headers:
  Authorization: "Bearer {{key}}"
identity:
  endpoint: /me
  valid_status_codes: [200]
  invalid_status_codes: [401]
  email_field: email
tests:
  - name: things:read
    test:
      endpoint: /things
      valid_status_codes: [200]
      invalid_status_codes: [403]
    resources:
      path: /data
      name_field: name
      resource_type: thing
"#;

    fn credential() -> Credential {
        Credential::from_key("tok-1").with("domain", "things.example")
    }

    #[test]
    fn test_definition_requires_declared_placeholders() {
        let source = SERVICE.replace("required_fields: [key, domain]", "required_fields: [key]");
        let err = ServiceDefinition::from_yaml(&source).unwrap_err();
        assert!(err.to_string().contains("domain"));
    }

    #[test]
    fn test_credential_fields() {
        let definition = ServiceDefinition::from_yaml(SERVICE).unwrap();
        let fields: Vec<_> = definition.credential_fields().into_iter().collect();
        assert_eq!(fields, vec!["domain".to_string(), "key".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_credential_field_fails_before_any_request() {
        let mock = Arc::new(MockTransport::new());
        let analyzer = Analyzer::new(
            ServiceDefinition::from_yaml(SERVICE).unwrap(),
            mock.clone(),
            RunConfig::default(),
        )
        .unwrap();

        let err = analyzer.analyze(&Credential::from_key("tok")).await.unwrap_err();
        assert!(matches!(err, ProbeError::Config(_)));
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_identity_not_json_is_error() {
        let mock = Arc::new(MockTransport::new());
        mock.on(HttpMethod::Get, "/api/me", 200, "<html>welcome</html>");
        let analyzer = Analyzer::new(
            ServiceDefinition::from_yaml(SERVICE).unwrap(),
            mock.clone(),
            RunConfig::default(),
        )
        .unwrap();

        let err = analyzer.analyze(&credential()).await.unwrap_err();
        assert!(matches!(err, ProbeError::AmbiguousResponse { .. }));
        assert_eq!(mock.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_base_url_override() {
        let mock = Arc::new(MockTransport::new());
        mock.on(HttpMethod::Get, "/proxy/me", 200, r#"{"id":"u1"}"#);
        mock.on(HttpMethod::Get, "/proxy/things", 403, "{}");
        let config = RunConfig {
            base_url_override: Some("https://gateway.internal/proxy".to_string()),
            ..RunConfig::default()
        };
        let analyzer = Analyzer::new(
            ServiceDefinition::from_yaml(SERVICE).unwrap(),
            mock.clone(),
            config,
        )
        .unwrap();

        let outcome = analyzer.analyze(&credential()).await.unwrap();
        assert!(outcome.is_complete());
        assert_eq!(outcome.result.metadata["denied_scopes"], "things:read");
    }

    #[test]
    fn test_payload_placeholders_must_be_required() {
        let source = SERVICE.replace(
            "      endpoint: /things\n",
            "      endpoint: /things\n      method: POST\n      payload: { org: \"{{org_id}}\", id: \"{{fake_id}}\" }\n",
        );
        let err = ServiceDefinition::from_yaml(&source).unwrap_err();
        assert!(err.to_string().contains("org_id"));

        let fixed = source.replace("required_fields: [key, domain]", "required_fields: [key, domain, org_id]");
        let definition = ServiceDefinition::from_yaml(&fixed).unwrap();
        assert!(definition.credential_fields().contains("org_id"));
    }

    #[tokio::test]
    async fn test_cancelled_run_is_never_complete() {
        let mock = Arc::new(MockTransport::new());
        mock.on(HttpMethod::Get, "/api/me", 200, r#"{"id":"u1"}"#);
        mock.on(HttpMethod::Get, "/api/things", 200, r#"{"data":[]}"#);
        let analyzer = Analyzer::new(
            ServiceDefinition::from_yaml(SERVICE).unwrap(),
            mock.clone(),
            RunConfig::default(),
        )
        .unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = analyzer.analyze_with_cancel(&credential(), cancel).await.unwrap();

        assert!(!outcome.is_complete());
        let error = outcome.error.unwrap();
        assert!(error.failures().iter().all(|f| f.is_cancelled()));
        assert_eq!(mock.calls(), vec!["GET /api/me".to_string()]);
    }

    #[tokio::test]
    async fn test_account_resource_is_stored_before_binding() {
        let source = SERVICE.replace(
            "tests:\n",
            "tests:\n  - name: billing:read\n    test:\n      endpoint: /billing\n      valid_status_codes: [200]\n      invalid_status_codes: [403]\n",
        );
        let mock = Arc::new(MockTransport::new());
        mock.on(HttpMethod::Get, "/api/me", 200, r#"{"id":"u1","email":"a@b.com"}"#);
        mock.on(HttpMethod::Get, "/api/things", 200, r#"{"data":[{"id":"t1","name":"Thing1"}]}"#);
        mock.on(HttpMethod::Get, "/api/billing", 200, "{}");
        let analyzer = Analyzer::new(
            ServiceDefinition::from_yaml(&source).unwrap(),
            mock.clone(),
            RunConfig::default(),
        )
        .unwrap();

        let outcome = analyzer.analyze(&credential()).await.unwrap();
        let result = outcome.result.sorted();
        let account = result
            .bindings
            .iter()
            .find(|b| b.permission == "billing:read")
            .unwrap();
        assert_eq!(account.resource.resource_type, "account");
        assert_eq!(account.resource.id, "u1");
        assert_eq!(result.bindings.len(), 2);
        assert!(result.unbounded_resources.is_empty());
    }

    #[tokio::test]
    async fn test_optional_identity_id() {
        let source = SERVICE.replace("  email_field: email\n", "  email_field: email\n  optional_id: true\n");
        let mock = Arc::new(MockTransport::new());
        mock.on(HttpMethod::Get, "/api/me", 200, r#"{"message":"ok"}"#);
        mock.on(HttpMethod::Get, "/api/things", 403, "{}");
        let analyzer = Analyzer::new(
            ServiceDefinition::from_yaml(&source).unwrap(),
            mock.clone(),
            RunConfig::default(),
        )
        .unwrap();

        let outcome = analyzer.analyze(&credential()).await.unwrap();
        assert!(outcome.is_complete());
        assert!(!outcome.result.metadata.contains_key("user_id"));
        assert_eq!(outcome.result.metadata["denied_scopes"], "things:read");
    }

    #[test]
    fn test_scrub_error_removes_secret() {
        let error = ProbeError::Partial(vec![ProbeError::Transport {
            endpoint: "/things".into(),
            message: "bad header value tok-1".into(),
        }]);
        let scrubbed = scrub_error(error, &credential()).to_string();
        assert!(!scrubbed.contains("tok-1"));
    }
}
