use crate::accumulator::{PermissionStatus, Resource, RunSnapshot, UserIdentity};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A permission that applies to a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub resource: Resource,
    pub permission: String,
}

/// Uniform output of one analyzer run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerResult {
    pub analyzer_type: String,
    pub bindings: Vec<Binding>,
    pub unbounded_resources: Vec<Resource>,
    pub metadata: BTreeMap<String, String>,
}

impl AnalyzerResult {
    /// Canonical ordering. Probe tasks finish in any order, so compare or
    /// print results only after sorting.
    pub fn sorted(mut self) -> Self {
        self.bindings.sort_by(|a, b| {
            a.resource
                .key()
                .cmp(&b.resource.key())
                .then_with(|| a.permission.cmp(&b.permission))
        });
        self.unbounded_resources.sort_by_key(Resource::key);
        self
    }

    /// Distinct permissions that appear in at least one binding.
    pub fn permissions(&self) -> BTreeSet<&str> {
        self.bindings.iter().map(|b| b.permission.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty() && self.unbounded_resources.is_empty()
    }
}

/// Resource type used for the credential's own account.
pub const ACCOUNT_RESOURCE_TYPE: &str = "account";

/// Turn a finished run into bindings and unbounded resources.
///
/// Every granted permission a resource carries yields one binding; a
/// resource with none is unbounded.
pub fn project(analyzer_type: &str, snapshot: &RunSnapshot) -> AnalyzerResult {
    let granted = snapshot.granted_scopes();
    let mut bindings = Vec::new();
    let mut unbounded_resources = Vec::new();

    for resource in &snapshot.resources {
        let applicable: Vec<&String> = resource
            .permissions
            .iter()
            .filter(|p| granted.contains(p.as_str()))
            .collect();

        if applicable.is_empty() {
            unbounded_resources.push(resource.clone());
            continue;
        }
        for permission in applicable {
            bindings.push(Binding {
                resource: resource.clone(),
                permission: permission.clone(),
            });
        }
    }

    AnalyzerResult {
        analyzer_type: analyzer_type.to_string(),
        bindings,
        unbounded_resources,
        metadata: run_metadata(snapshot),
    }
}

/// Resource standing for the credential's own account. Granted scopes that
/// no listed resource carries are bound to it.
pub fn account_resource(analyzer_type: &str, identity: Option<&UserIdentity>) -> Resource {
    match identity {
        Some(identity) => {
            let name = identity
                .name
                .clone()
                .or_else(|| identity.email.clone())
                .unwrap_or_else(|| identity.id.clone());
            let mut account = Resource::new(identity.id.clone(), name, ACCOUNT_RESOURCE_TYPE);
            if let Some(email) = &identity.email {
                account = account.with_metadata("email", email.clone());
            }
            account
        }
        None => Resource::new(
            format!("{analyzer_type}-credential"),
            format!("{analyzer_type} credential"),
            ACCOUNT_RESOURCE_TYPE,
        ),
    }
}

fn run_metadata(snapshot: &RunSnapshot) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();

    if let Some(identity) = &snapshot.identity {
        metadata.insert("user_id".to_string(), identity.id.clone());
        if let Some(name) = &identity.name {
            metadata.insert("user_name".to_string(), name.clone());
        }
        if let Some(email) = &identity.email {
            metadata.insert("user_email".to_string(), email.clone());
        }
    }

    let scopes_with = |status: PermissionStatus| {
        snapshot
            .permissions
            .iter()
            .filter(|p| p.status == status)
            .map(|p| p.scope.as_str())
            .collect::<BTreeSet<_>>()
    };
    let granted = scopes_with(PermissionStatus::Granted);
    let denied = scopes_with(PermissionStatus::Denied);
    let mut unverified = scopes_with(PermissionStatus::Unverified);
    // Scopes that never got a record could not be checked.
    for scope in &snapshot.scopes {
        if snapshot.status_of(scope).is_none() {
            unverified.insert(scope.as_str());
        }
    }

    let join = |set: BTreeSet<&str>| set.into_iter().collect::<Vec<_>>().join(",");
    metadata.insert("granted_scopes".to_string(), join(granted));
    metadata.insert("denied_scopes".to_string(), join(denied));
    metadata.insert("unverified_scopes".to_string(), join(unverified));
    metadata
}
