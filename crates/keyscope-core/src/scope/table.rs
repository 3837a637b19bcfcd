use crate::error::ProbeError;
use crate::probe::HttpMethod;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::Path;

/// Outcome a body marker assigns when it matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerOutcome {
    Granted,
    Denied,
    Unverifiable,
}

/// Secondary check on the response body.
///
/// A marker without `status` applies to every status in
/// `invalid_status_codes`; with `status` it applies to that status only.
/// `contains` is a substring test on the raw body, `field` is a key or JSON
/// pointer into the parsed body, optionally compared with `equals`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BodyMarker {
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub contains: Option<String>,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub equals: Option<String>,
    pub outcome: MarkerOutcome,
}

impl BodyMarker {
    pub fn applies_to(&self, status: u16, test: &HttpTest) -> bool {
        match self.status {
            Some(expected) => expected == status,
            None => test.invalid_status_codes.contains(&status),
        }
    }

    /// Whether the body satisfies this marker. `Err` when the marker needs a
    /// JSON body and the body did not parse.
    pub fn matches(&self, body: &str, json: Option<&Value>) -> Result<bool, String> {
        if let Some(needle) = &self.contains {
            if !body.contains(needle.as_str()) {
                return Ok(false);
            }
        }

        if let Some(field) = &self.field {
            let Some(json) = json else {
                return Err(format!("body is not JSON, cannot read field '{field}'"));
            };
            return Ok(match (lookup_field(json, field), &self.equals) {
                (Some(value), Some(expected)) => value_to_string(value) == *expected,
                (Some(_), None) => true,
                (None, _) => false,
            });
        }

        Ok(true)
    }
}

/// The HTTP side of a scope test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpTest {
    pub endpoint: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub valid_status_codes: Vec<u16>,
    #[serde(default)]
    pub invalid_status_codes: Vec<u16>,
    #[serde(default)]
    pub markers: Vec<BodyMarker>,
}

impl HttpTest {
    pub fn is_valid_status(&self, status: u16) -> bool {
        self.valid_status_codes.contains(&status)
    }

    pub fn is_invalid_status(&self, status: u16) -> bool {
        self.invalid_status_codes.contains(&status)
    }
}

/// How to turn a response body into resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMapping {
    /// JSON pointer to an array of items or a single object; empty = root.
    #[serde(default)]
    pub path: String,
    #[serde(default = "default_id_field")]
    pub id_field: String,
    #[serde(default)]
    pub name_field: Option<String>,
    pub resource_type: String,
    #[serde(default)]
    pub metadata_fields: Vec<String>,
    /// Bound resources carry the test's scope; unbound ones are reported as
    /// discoverable without a specific permission.
    #[serde(default = "default_true")]
    pub bound: bool,
}

fn default_id_field() -> String {
    "id".to_string()
}

fn default_true() -> bool {
    true
}

/// One row of the permission table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeTest {
    pub name: String,
    pub test: HttpTest,
    #[serde(default)]
    pub implied_scopes: Vec<String>,
    /// Actions or endpoints reported alongside the permission.
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub resources: Option<ResourceMapping>,
    /// Stages run in ascending order; tests in one stage run concurrently.
    #[serde(default)]
    pub stage: u32,
    /// Run once per resource of this type discovered by an earlier stage.
    #[serde(default)]
    pub for_each: Option<String>,
    /// Skip the probe when all of these scopes are already granted and
    /// record this scope as granted instead.
    #[serde(default)]
    pub skip_if_granted: Vec<String>,
}

/// Validated, immutable table of scope tests for one service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopeTable {
    scopes: Vec<String>,
    tests: Vec<ScopeTest>,
}

impl ScopeTable {
    /// Build a table. When `declared` is empty the scope universe is every
    /// test name plus every implied scope; otherwise every name used by a
    /// test must appear in `declared`.
    pub fn new(tests: Vec<ScopeTest>, declared: Vec<String>) -> Result<Self, ProbeError> {
        let scopes = if declared.is_empty() {
            let mut scopes = Vec::new();
            for test in &tests {
                for name in std::iter::once(&test.name).chain(&test.implied_scopes) {
                    if !scopes.contains(name) {
                        scopes.push(name.clone());
                    }
                }
            }
            scopes
        } else {
            declared
        };

        let issues = validate_tests(&tests, &scopes);
        if !issues.is_empty() {
            return Err(ProbeError::Config(issues.join("; ")));
        }

        Ok(Self { scopes, tests })
    }

    /// Parse a bare list of scope tests from YAML or JSON.
    pub fn from_source(source: &str) -> Result<Self, ProbeError> {
        Self::new(load_tests(source)?, Vec::new())
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scope table: {}", path.display()))?;
        Self::from_source(&content)
            .with_context(|| format!("Invalid scope table: {}", path.display()))
    }

    pub fn tests(&self) -> &[ScopeTest] {
        &self.tests
    }

    /// Every scope name a permission record may carry, in declaration order.
    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    pub fn contains_scope(&self, name: &str) -> bool {
        self.scopes.iter().any(|s| s == name)
    }

    /// Distinct stages in execution order.
    pub fn stages(&self) -> Vec<u32> {
        self.tests
            .iter()
            .map(|t| t.stage)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn tests_in_stage(&self, stage: u32) -> Vec<&ScopeTest> {
        self.tests.iter().filter(|t| t.stage == stage).collect()
    }
}

/// Parse scope tests from static configuration. YAML is a superset of the
/// JSON the tables are also written in, so one parser covers both.
pub fn load_tests(source: &str) -> Result<Vec<ScopeTest>, ProbeError> {
    serde_yaml::from_str(source)
        .map_err(|e| ProbeError::Config(format!("failed to parse scope tests: {e}")))
}

fn validate_tests(tests: &[ScopeTest], scopes: &[String]) -> Vec<String> {
    let mut issues = Vec::new();
    let known: Vec<&str> = scopes.iter().map(String::as_str).collect();

    let check_scope = |issues: &mut Vec<String>, name: &str, context: &str| {
        if !known.contains(&name) {
            let hint = suggest(name, &known)
                .map(|s| format!(" (did you mean '{s}'?)"))
                .unwrap_or_default();
            issues.push(format!("{context} references unknown scope '{name}'{hint}"));
        }
    };

    for test in tests {
        let label = format!("test '{}' ({})", test.name, test.test.endpoint);

        if test.name.trim().is_empty() {
            issues.push(format!("test for {} has an empty name", test.test.endpoint));
        }
        if test.test.endpoint.trim().is_empty() {
            issues.push(format!("test '{}' has an empty endpoint", test.name));
        }

        check_scope(&mut issues, &test.name, &label);
        for implied in &test.implied_scopes {
            check_scope(&mut issues, implied, &label);
        }
        for gate in &test.skip_if_granted {
            check_scope(&mut issues, gate, &label);
        }

        let http = &test.test;
        if http.valid_status_codes.is_empty() && http.invalid_status_codes.is_empty() {
            issues.push(format!("{label} declares no status codes"));
        }
        for code in &http.valid_status_codes {
            if http.invalid_status_codes.contains(code) {
                issues.push(format!("{label} lists status {code} as both valid and invalid"));
            }
        }
        for marker in &http.markers {
            match marker.status {
                Some(code) if !http.is_valid_status(code) && !http.is_invalid_status(code) => {
                    issues.push(format!(
                        "{label} has a body marker for status {code}, which is neither valid nor invalid"
                    ));
                }
                None if http.invalid_status_codes.is_empty() => {
                    issues.push(format!(
                        "{label} has a body marker without status but no invalid status codes"
                    ));
                }
                _ => {}
            }
        }

        if let Some(mapping) = &test.resources {
            if mapping.resource_type.trim().is_empty() {
                issues.push(format!("{label} maps resources without a resource_type"));
            }
        }

        if let Some(parent_type) = &test.for_each {
            let produced_earlier = tests.iter().any(|other| {
                other.stage < test.stage
                    && other
                        .resources
                        .as_ref()
                        .is_some_and(|m| &m.resource_type == parent_type)
            });
            if !produced_earlier {
                issues.push(format!(
                    "{label} fans out over '{parent_type}' but no earlier stage discovers that resource type"
                ));
            }
        }
    }

    issues
}

/// Closest known name within edit distance 2.
pub fn suggest<'a>(name: &str, candidates: &[&'a str]) -> Option<&'a str> {
    let mut best_match = None;
    let mut best_distance = usize::MAX;

    for &candidate in candidates {
        let dist = strsim::damerau_levenshtein(name, candidate);
        if dist < best_distance && dist <= 2 && dist > 0 {
            best_distance = dist;
            best_match = Some(candidate);
        }
    }

    best_match
}

/// Read a plain key or a JSON pointer (`/a/b/0`) from a JSON value.
pub fn lookup_field<'v>(value: &'v Value, field: &str) -> Option<&'v Value> {
    if field.starts_with('/') {
        value.pointer(field)
    } else {
        value.get(field)
    }
}

/// Render a scalar JSON value as a plain string.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
