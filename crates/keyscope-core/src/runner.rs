use crate::accumulator::{PermissionRecord, PermissionStatus, Resource, RunAccumulator};
use crate::classifier::{classify, Outcome};
use crate::error::ProbeError;
use crate::probe::{ProbeResult, ProbeTransport};
use crate::redact::redact_credential;
use crate::scope::table::{lookup_field, value_to_string, ResourceMapping};
use crate::scope::{ProbeContext, ScopeTest};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Default number of probes allowed in flight at once.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Caller-controlled cancellation for a run.
#[derive(Clone)]
pub struct CancelToken {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        // The sender lives as long as any clone of the token, so this only
        // returns on an actual cancel.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs scope tests against a service with bounded parallelism.
pub struct ProbeRunner {
    transport: Arc<dyn ProbeTransport>,
    context: Arc<ProbeContext>,
    concurrency: usize,
    cancel: CancelToken,
}

impl ProbeRunner {
    pub fn new(transport: Arc<dyn ProbeTransport>, context: ProbeContext) -> Self {
        Self {
            transport,
            context: Arc::new(context),
            concurrency: DEFAULT_CONCURRENCY,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run every test, stage by stage, recording results in `accumulator`.
    ///
    /// A failing probe never stops its siblings. When any probe fails the
    /// returned error lists all failures, and the accumulator still holds
    /// every result that did succeed.
    pub async fn run_all(
        &self,
        tests: &[ScopeTest],
        accumulator: &Arc<RunAccumulator>,
    ) -> Result<(), ProbeError> {
        let mut stages: Vec<u32> = tests.iter().map(|t| t.stage).collect();
        stages.sort_unstable();
        stages.dedup();

        let mut errors = Vec::new();
        for stage in stages {
            if self.cancel.is_cancelled() {
                warn!(stage, "run cancelled, skipping remaining stages");
                errors.extend(tests.iter().filter(|t| t.stage >= stage).map(|t| {
                    ProbeError::Cancelled {
                        endpoint: t.test.endpoint.clone(),
                    }
                }));
                break;
            }
            let stage_tests: Vec<&ScopeTest> = tests.iter().filter(|t| t.stage == stage).collect();
            info!(stage, tests = stage_tests.len(), "running probe stage");
            errors.extend(self.run_stage(&stage_tests, accumulator).await);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProbeError::Partial(errors))
        }
    }

    async fn run_stage(
        &self,
        tests: &[&ScopeTest],
        accumulator: &Arc<RunAccumulator>,
    ) -> Vec<ProbeError> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut join_set = JoinSet::new();
        let mut errors = Vec::new();

        for &test in tests {
            if should_skip(test, accumulator) {
                debug!(scope = %test.name, "gate scopes already granted, skipping probe");
                if let Err(e) = record_granted(test, accumulator) {
                    errors.push(e);
                }
                continue;
            }

            let parents: Vec<Option<Resource>> = match &test.for_each {
                Some(resource_type) => {
                    let found = accumulator.list_resources_by_type(resource_type);
                    if found.is_empty() {
                        debug!(scope = %test.name, resource_type = %resource_type, "no resources to fan out over");
                        if let Err(e) = accumulator
                            .add_permission(PermissionRecord::new(&test.name, PermissionStatus::Unverified))
                        {
                            errors.push(e);
                        }
                        continue;
                    }
                    found.into_iter().map(Some).collect()
                }
                None => vec![None],
            };

            for parent in parents {
                let test = test.clone();
                let transport = Arc::clone(&self.transport);
                let context = Arc::clone(&self.context);
                let accumulator = Arc::clone(accumulator);
                let semaphore = Arc::clone(&semaphore);
                let cancel = self.cancel.clone();

                join_set.spawn(async move {
                    let endpoint = test.test.endpoint.clone();
                    let cancelled = || ProbeError::Cancelled {
                        endpoint: endpoint.clone(),
                    };

                    let _permit = tokio::select! {
                        permit = semaphore.acquire_owned() => permit.map_err(|_| cancelled())?,
                        _ = cancel.cancelled() => return Err(cancelled()),
                    };

                    tokio::select! {
                        result = execute_test(&*transport, &context, &test, parent.as_ref(), &accumulator) => result,
                        _ = cancel.cancelled() => Err(cancelled()),
                    }
                });
            }
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    let message = redact_credential(&error.to_string(), &self.context.credential);
                    warn!(error = %message, "probe failed");
                    errors.push(error);
                }
                Err(join_error) => {
                    warn!(error = %join_error, "probe task panicked");
                    errors.push(ProbeError::TaskFailed(join_error.to_string()));
                }
            }
        }

        errors
    }
}

fn should_skip(test: &ScopeTest, accumulator: &RunAccumulator) -> bool {
    !test.skip_if_granted.is_empty()
        && test
            .skip_if_granted
            .iter()
            .all(|scope| accumulator.has_permission(scope))
}

fn record_granted(test: &ScopeTest, accumulator: &RunAccumulator) -> Result<(), ProbeError> {
    let mut record = PermissionRecord::granted(&test.name);
    record.actions = test.actions.clone();
    accumulator.add_permission(record)?;
    for implied in &test.implied_scopes {
        accumulator.add_permission(PermissionRecord::granted(implied))?;
    }
    Ok(())
}

/// Probe, classify and record one test. Updates to the accumulator happen
/// only after the response is in, so a cancelled probe leaves no trace.
async fn execute_test(
    transport: &dyn ProbeTransport,
    context: &ProbeContext,
    test: &ScopeTest,
    parent: Option<&Resource>,
    accumulator: &RunAccumulator,
) -> Result<(), ProbeError> {
    let request = context.build_request(&test.test, parent)?;
    debug!(scope = %test.name, method = %request.method, endpoint = %request.endpoint, "probing");

    let result = transport.probe(&request).await;
    let outcome = classify(&test.test, &result);
    debug!(scope = %test.name, outcome = ?outcome, "classified");

    match outcome {
        Outcome::Granted => {
            record_granted(test, accumulator)?;
            if let (Some(mapping), Ok(response)) = (&test.resources, &result) {
                for resource in extract_resources(mapping, response, test, parent)? {
                    accumulator.add_resource(resource)?;
                }
            }
            Ok(())
        }
        Outcome::Denied => accumulator.add_permission(PermissionRecord::denied(&test.name)),
        Outcome::Unverifiable => accumulator
            .add_permission(PermissionRecord::new(&test.name, PermissionStatus::Unverified)),
        Outcome::Error(error) => Err(error),
    }
}

/// Map a response body to resources according to `mapping`.
pub fn extract_resources(
    mapping: &ResourceMapping,
    response: &ProbeResult,
    test: &ScopeTest,
    parent: Option<&Resource>,
) -> Result<Vec<Resource>, ProbeError> {
    let mapping_error = |reason: String| ProbeError::AmbiguousResponse {
        endpoint: test.test.endpoint.clone(),
        status: response.status,
        reason,
    };

    let body = response
        .json()
        .map_err(|e| mapping_error(format!("expected a JSON body to map resources: {e}")))?;
    let root = if mapping.path.is_empty() {
        Some(&body)
    } else {
        body.pointer(&mapping.path)
    };

    let items: Vec<&Value> = match root {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(Value::Null) | None => Vec::new(),
        Some(object) => vec![object],
    };

    let mut resources = Vec::with_capacity(items.len());
    for item in items {
        let id = lookup_field(item, &mapping.id_field)
            .map(value_to_string)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                mapping_error(format!("item is missing id field '{}'", mapping.id_field))
            })?;
        let name = mapping
            .name_field
            .as_deref()
            .and_then(|field| lookup_field(item, field))
            .map(value_to_string)
            .unwrap_or_else(|| id.clone());

        let mut resource = Resource::new(id, name, mapping.resource_type.clone());
        for field in &mapping.metadata_fields {
            if let Some(value) = lookup_field(item, field) {
                resource = resource.with_metadata(field.trim_start_matches('/'), value_to_string(value));
            }
        }
        if let Some(parent) = parent {
            resource = resource.with_parent(parent.key());
        }
        if mapping.bound {
            resource = resource.with_permission(test.name.clone());
        }
        resources.push(resource);
    }

    Ok(resources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::Credential;
    use crate::probe::{HttpMethod, MockTransport};
    use crate::scope::ScopeTable;
    use std::time::Duration;

    fn context() -> ProbeContext {
        ProbeContext {
            base_url: "https://api.example.com".to_string(),
            headers: vec![("Authorization".to_string(), "Bearer {{key}}".to_string())],
            credential: Credential::from_key("tok"),
        }
    }

    fn runner(mock: Arc<MockTransport>) -> ProbeRunner {
        ProbeRunner::new(mock, context()).with_concurrency(4)
    }

    const TABLE: &str = r#"
- name: sites:read
  test:
    endpoint: /sites
    valid_status_codes: [200]
    invalid_status_codes: [403]
  resources:
    resource_type: site
- name: files:read
  stage: 1
  for_each: site
  test:
    endpoint: /sites/{{parent.id}}/files
    valid_status_codes: [200]
    invalid_status_codes: [403]
  resources:
    path: /files
    name_field: path
    resource_type: file
- name: sites:write
  test:
    endpoint: /sites/{{fake_id}}
    method: DELETE
    valid_status_codes: [404]
    invalid_status_codes: [403]
  implied_scopes: [sites:read, hooks:read]
"#;

    #[tokio::test]
    async fn test_staged_fan_out_links_parents() {
        let table = ScopeTable::from_source(TABLE).unwrap();
        let mock = Arc::new(MockTransport::new());
        mock.on(HttpMethod::Get, "/sites", 200, r#"[{"id":"s1"},{"id":"s2"}]"#);
        mock.on(HttpMethod::Get, "/sites/s1/files", 200, r#"{"files":[{"id":"f1","path":"/index.html"}]}"#);
        mock.on(HttpMethod::Get, "/sites/s2/files", 200, r#"{"files":[]}"#);
        mock.on(HttpMethod::Delete, &format!("/sites/{}", crate::scope::template::FAKE_ID), 403, "{}");

        let acc = Arc::new(RunAccumulator::for_table(&table));
        runner(Arc::clone(&mock)).run_all(table.tests(), &acc).await.unwrap();

        let files = acc.list_resources_by_type("file");
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "/index.html");
        assert_eq!(files[0].parent.as_ref().unwrap().id, "s1");
        assert!(acc.has_permission("files:read"));
        assert_eq!(acc.permission("sites:write").unwrap().status, PermissionStatus::Denied);
        assert_eq!(mock.call_count(HttpMethod::Get, "/sites"), 1);
    }

    #[tokio::test]
    async fn test_implied_scopes_granted_without_own_request() {
        let table = ScopeTable::from_source(TABLE).unwrap();
        let mock = Arc::new(MockTransport::new());
        mock.on(HttpMethod::Get, "/sites", 500, "");
        mock.on(HttpMethod::Delete, &format!("/sites/{}", crate::scope::template::FAKE_ID), 404, "{}");

        let acc = Arc::new(RunAccumulator::for_table(&table));
        let err = runner(mock).run_all(table.tests(), &acc).await.unwrap_err();

        // sites:read's own probe failed, hooks:read has no probe at all.
        assert!(acc.has_permission("sites:read"));
        assert!(acc.has_permission("hooks:read"));
        assert!(acc.has_permission("sites:write"));
        assert!(err.to_string().contains("/sites"));
        // No sites were listed, so the fan-out could not run.
        assert_eq!(acc.permission("files:read").unwrap().status, PermissionStatus::Unverified);
    }

    #[tokio::test]
    async fn test_skip_if_granted_avoids_request() {
        let source = r#"
- name: admin
  test:
    endpoint: /admin
    valid_status_codes: [200]
- name: members:list
  stage: 1
  skip_if_granted: [admin]
  test:
    endpoint: /members
    valid_status_codes: [200]
"#;
        let table = ScopeTable::from_source(source).unwrap();
        let mock = Arc::new(MockTransport::new());
        mock.on(HttpMethod::Get, "/admin", 200, "{}");

        let acc = Arc::new(RunAccumulator::for_table(&table));
        runner(Arc::clone(&mock)).run_all(table.tests(), &acc).await.unwrap();

        assert!(acc.has_permission("members:list"));
        assert_eq!(mock.call_count(HttpMethod::Get, "/members"), 0);
    }

    #[tokio::test]
    async fn test_cancel_reports_in_flight_requests() {
        let source = r#"
- name: slow
  test:
    endpoint: /slow
    valid_status_codes: [200]
- name: fast
  test:
    endpoint: /fast
    valid_status_codes: [200]
"#;
        let table = ScopeTable::from_source(source).unwrap();
        let mock = Arc::new(MockTransport::new());
        mock.on_delayed(HttpMethod::Get, "/slow", 200, "{}", Duration::from_secs(30));
        mock.on(HttpMethod::Get, "/fast", 200, "{}");

        let cancel = CancelToken::new();
        let acc = Arc::new(RunAccumulator::for_table(&table));
        let runner = runner(mock).with_cancel(cancel.clone());

        let trigger = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        };
        let (result, ()) = tokio::join!(runner.run_all(table.tests(), &acc), trigger);

        let err = result.unwrap_err();
        let failures = err.failures();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].is_cancelled());
        assert!(acc.has_permission("fast"));
        assert!(acc.permission("slow").is_none());
    }

    /// Cancels the run as soon as the first response is in.
    struct CancelAfterFirst {
        inner: MockTransport,
        cancel: CancelToken,
    }

    #[async_trait::async_trait]
    impl ProbeTransport for CancelAfterFirst {
        async fn probe(&self, request: &crate::probe::ProbeRequest) -> Result<ProbeResult, ProbeError> {
            let result = self.inner.probe(request).await;
            self.cancel.cancel();
            result
        }
    }

    #[tokio::test]
    async fn test_cancel_between_stages_reports_skipped_tests() {
        let source = r#"
- name: a
  test:
    endpoint: /a
    valid_status_codes: [200]
- name: b
  stage: 1
  test:
    endpoint: /b
    valid_status_codes: [200]
- name: c
  stage: 2
  test:
    endpoint: /c
    valid_status_codes: [200]
"#;
        let table = ScopeTable::from_source(source).unwrap();
        let cancel = CancelToken::new();
        let inner = MockTransport::new();
        inner.on(HttpMethod::Get, "/a", 200, "{}");
        inner.on(HttpMethod::Get, "/b", 200, "{}");
        inner.on(HttpMethod::Get, "/c", 200, "{}");
        let transport = Arc::new(CancelAfterFirst {
            inner,
            cancel: cancel.clone(),
        });

        let acc = Arc::new(RunAccumulator::for_table(&table));
        let err = ProbeRunner::new(transport.clone(), context())
            .with_cancel(cancel)
            .run_all(table.tests(), &acc)
            .await
            .unwrap_err();

        assert!(matches!(err, ProbeError::Partial(_)));
        let failures = err.failures();
        assert_eq!(failures.len(), 2);
        assert!(failures.iter().all(|f| f.is_cancelled()));
        assert_eq!(failures[0].endpoint(), Some("/b"));
        assert!(acc.has_permission("a"));
        assert!(acc.permission("b").is_none());
        assert_eq!(transport.inner.calls(), vec!["GET /a".to_string()]);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_runs_nothing() {
        let table = ScopeTable::from_source(TABLE).unwrap();
        let mock = Arc::new(MockTransport::new());
        let cancel = CancelToken::new();
        cancel.cancel();

        let acc = Arc::new(RunAccumulator::for_table(&table));
        let err = runner(Arc::clone(&mock))
            .with_cancel(cancel)
            .run_all(table.tests(), &acc)
            .await
            .unwrap_err();

        assert_eq!(err.failures().len(), table.tests().len());
        assert!(mock.calls().is_empty());
        assert!(acc.snapshot().permissions.is_empty());
    }

    #[test]
    fn test_extract_resources_single_object_and_metadata() {
        let test: ScopeTest = serde_yaml::from_str(
            r#"
name: team:read
test:
  endpoint: /teams/{{parent.id}}
  valid_status_codes: [200]
resources:
  path: /data
  name_field: name
  resource_type: team
  metadata_fields: [description, /owner/id]
  bound: false
"#,
        )
        .unwrap();
        let response = ProbeResult::new(
            200,
            r#"{"data":{"id":7,"name":"Ops","description":"on call","owner":{"id":"u9"}}}"#,
        );

        let mapping = test.resources.clone().unwrap();
        let resources = extract_resources(&mapping, &response, &test, None).unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].id, "7");
        assert_eq!(resources[0].metadata["description"], "on call");
        assert_eq!(resources[0].metadata["owner/id"], "u9");
        assert!(resources[0].permissions.is_empty());
    }

    #[test]
    fn test_extract_resources_requires_ids() {
        let test: ScopeTest = serde_yaml::from_str(
            "name: r\ntest:\n  endpoint: /x\n  valid_status_codes: [200]\nresources:\n  resource_type: thing\n",
        )
        .unwrap();
        let response = ProbeResult::new(200, r#"[{"name":"no id"}]"#);
        let mapping = test.resources.clone().unwrap();
        assert!(extract_resources(&mapping, &response, &test, None).is_err());
    }
}
