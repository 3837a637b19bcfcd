use crate::error::ProbeError;
use std::collections::BTreeMap;
use std::fmt;

/// A credential bundle handed to an analyzer: named secrets plus context
/// such as a domain or workspace.
///
/// Values are only ever read to render requests. `Debug` prints field names,
/// never values.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credential {
    fields: BTreeMap<String, String>,
}

impl Credential {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bundle holding a single `key` field, the common case.
    pub fn from_key(key: impl Into<String>) -> Self {
        Self::new().with("key", key)
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Look up a field that the service definition marks as required.
    pub fn require(&self, name: &str) -> Result<&str, ProbeError> {
        match self.get(name) {
            Some(value) if !value.trim().is_empty() => Ok(value),
            _ => Err(ProbeError::Config(format!(
                "credential is missing required field '{name}'"
            ))),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Secret values, for scrubbing them out of logs and error messages.
    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.fields.values().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.fields.keys().map(|k| (k, "***")))
            .finish()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Credential {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut credential = Credential::new();
        for (name, value) in iter {
            credential.insert(name, value);
        }
        credential
    }
}
