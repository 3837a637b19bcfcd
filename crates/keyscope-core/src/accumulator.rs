use crate::error::ProbeError;
use crate::scope::ScopeTable;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::OnceLock;

/// Result of testing one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PermissionStatus {
    Granted,
    Denied,
    Unverified,
}

impl PermissionStatus {
    /// Strength used to resolve conflicting records for the same scope.
    fn rank(&self) -> u8 {
        match self {
            PermissionStatus::Granted => 3,
            PermissionStatus::Denied => 2,
            PermissionStatus::Unverified => 1,
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            PermissionStatus::Granted => "GRANTED",
            PermissionStatus::Denied => "DENIED",
            PermissionStatus::Unverified => "UNVERIFIED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRecord {
    pub scope: String,
    pub status: PermissionStatus,
    #[serde(default)]
    pub actions: Vec<String>,
}

impl PermissionRecord {
    pub fn new(scope: impl Into<String>, status: PermissionStatus) -> Self {
        Self {
            scope: scope.into(),
            status,
            actions: Vec::new(),
        }
    }

    pub fn granted(scope: impl Into<String>) -> Self {
        Self::new(scope, PermissionStatus::Granted)
    }

    pub fn denied(scope: impl Into<String>) -> Self {
        Self::new(scope, PermissionStatus::Denied)
    }
}

/// Stable identity of a resource inside one run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub resource_type: String,
    pub id: String,
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.resource_type, self.id)
    }
}

/// Something a credential can reach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub name: String,
    pub resource_type: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Parent by key; the parent is always added to the accumulator first.
    #[serde(default)]
    pub parent: Option<ResourceKey>,
    /// Granted scopes that apply to this resource.
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl Resource {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        resource_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            resource_type: resource_type.into(),
            metadata: BTreeMap::new(),
            parent: None,
            permissions: Vec::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_parent(mut self, parent: ResourceKey) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_permission(mut self, scope: impl Into<String>) -> Self {
        let scope = scope.into();
        if !self.permissions.contains(&scope) {
            self.permissions.push(scope);
        }
        self
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey {
            resource_type: self.resource_type.clone(),
            id: self.id.clone(),
        }
    }

    fn merge(&mut self, other: Resource) {
        if self.name.is_empty() {
            self.name = other.name;
        }
        if self.parent.is_none() {
            self.parent = other.parent;
        }
        self.metadata.extend(other.metadata);
        for scope in other.permissions {
            if !self.permissions.contains(&scope) {
                self.permissions.push(scope);
            }
        }
    }
}

/// Owner of the credential, as reported by the identity check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Default)]
struct ResourceStore {
    items: Vec<Resource>,
    index: HashMap<ResourceKey, usize>,
}

/// Everything learned during one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub identity: Option<UserIdentity>,
    pub scopes: Vec<String>,
    pub resources: Vec<Resource>,
    pub permissions: Vec<PermissionRecord>,
}

impl RunSnapshot {
    pub fn status_of(&self, scope: &str) -> Option<PermissionStatus> {
        self.permissions
            .iter()
            .find(|p| p.scope == scope)
            .map(|p| p.status)
    }

    pub fn granted_scopes(&self) -> BTreeSet<&str> {
        self.permissions
            .iter()
            .filter(|p| p.status == PermissionStatus::Granted)
            .map(|p| p.scope.as_str())
            .collect()
    }
}

/// Shared result object for one run. Probe tasks write to it concurrently;
/// every method locks internally and holds the lock only for the update.
#[derive(Default)]
pub struct RunAccumulator {
    identity: OnceLock<UserIdentity>,
    known_scopes: Option<BTreeSet<String>>,
    resources: Mutex<ResourceStore>,
    permissions: Mutex<BTreeMap<String, PermissionRecord>>,
}

impl RunAccumulator {
    /// Accumulator that accepts any scope name.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulator that rejects scopes missing from `table`.
    pub fn for_table(table: &ScopeTable) -> Self {
        Self {
            known_scopes: Some(table.scopes().iter().cloned().collect()),
            ..Self::default()
        }
    }

    /// Record the credential owner. Only the first call has an effect.
    pub fn set_identity(&self, identity: UserIdentity) -> bool {
        self.identity.set(identity).is_ok()
    }

    pub fn identity(&self) -> Option<&UserIdentity> {
        self.identity.get()
    }

    /// Add a resource, merging with an existing one of the same key.
    pub fn add_resource(&self, resource: Resource) -> Result<(), ProbeError> {
        let mut store = self.resources.lock();

        if let Some(parent) = &resource.parent {
            if !store.index.contains_key(parent) {
                return Err(ProbeError::Config(format!(
                    "resource {} references parent {} which was never added",
                    resource.key(),
                    parent
                )));
            }
        }

        let key = resource.key();
        let existing = store.index.get(&key).copied();
        match existing {
            Some(idx) => store.items[idx].merge(resource),
            None => {
                let idx = store.items.len();
                store.items.push(resource);
                store.index.insert(key, idx);
            }
        }
        Ok(())
    }

    /// Record the outcome for a scope. A Granted record is never replaced by
    /// a weaker one; Denied beats Unverified.
    pub fn add_permission(&self, record: PermissionRecord) -> Result<(), ProbeError> {
        if let Some(known) = &self.known_scopes {
            if !known.contains(&record.scope) {
                return Err(ProbeError::Config(format!(
                    "permission '{}' is not declared in the scope table",
                    record.scope
                )));
            }
        }

        let mut permissions = self.permissions.lock();
        match permissions.get_mut(&record.scope) {
            Some(existing) if existing.status.rank() > record.status.rank() => {}
            Some(existing) if existing.status == record.status => {
                for action in record.actions {
                    if !existing.actions.contains(&action) {
                        existing.actions.push(action);
                    }
                }
            }
            _ => {
                permissions.insert(record.scope.clone(), record);
            }
        }
        Ok(())
    }

    /// Give every granted scope that no resource carries to `account`, and
    /// add it. Nothing is added when every granted scope is already placed.
    pub fn bind_unplaced_scopes(&self, account: Resource) -> Result<(), ProbeError> {
        let placed: BTreeSet<String> = self
            .resources
            .lock()
            .items
            .iter()
            .flat_map(|r| r.permissions.iter().cloned())
            .collect();
        let unplaced: Vec<String> = self
            .permissions
            .lock()
            .values()
            .filter(|p| p.status == PermissionStatus::Granted && !placed.contains(&p.scope))
            .map(|p| p.scope.clone())
            .collect();

        if unplaced.is_empty() {
            return Ok(());
        }
        let account = unplaced
            .into_iter()
            .fold(account, |account, scope| account.with_permission(scope));
        self.add_resource(account)
    }

    pub fn has_permission(&self, scope: &str) -> bool {
        self.permissions
            .lock()
            .get(scope)
            .is_some_and(|p| p.status == PermissionStatus::Granted)
    }

    pub fn permission(&self, scope: &str) -> Option<PermissionRecord> {
        self.permissions.lock().get(scope).cloned()
    }

    pub fn list_resources_by_type(&self, resource_type: &str) -> Vec<Resource> {
        self.resources
            .lock()
            .items
            .iter()
            .filter(|r| r.resource_type == resource_type)
            .cloned()
            .collect()
    }

    pub fn resource_count(&self) -> usize {
        self.resources.lock().items.len()
    }

    /// Copy of the current state for projection.
    pub fn snapshot(&self) -> RunSnapshot {
        let resources = self.resources.lock().items.clone();
        let permissions = self.permissions.lock().values().cloned().collect();
        RunSnapshot {
            identity: self.identity.get().cloned(),
            scopes: self
                .known_scopes
                .as_ref()
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default(),
            resources,
            permissions,
        }
    }
}
