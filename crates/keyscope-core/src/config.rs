use crate::error::ProbeError;
use crate::runner::DEFAULT_CONCURRENCY;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Per-run settings, loaded from `keyscope.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Maximum probes in flight at once, to stay under vendor rate limits.
    pub concurrency: usize,

    /// Timeout for each individual request.
    pub timeout_secs: u64,

    pub user_agent: String,

    /// Replace the service definition's base URL (proxies, staging hosts).
    pub base_url_override: Option<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            timeout_secs: 10,
            user_agent: format!("keyscope/{}", env!("CARGO_PKG_VERSION")),
            base_url_override: None,
        }
    }
}

impl RunConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ProbeError> {
        if self.concurrency == 0 {
            return Err(ProbeError::Config("concurrency must be at least 1".into()));
        }
        if self.timeout_secs == 0 {
            return Err(ProbeError::Config("timeout_secs must be at least 1".into()));
        }
        Ok(())
    }

    /// Apply `KEYSCOPE_CONCURRENCY` and `KEYSCOPE_TIMEOUT_SECS` from the
    /// process environment.
    pub fn with_env_overrides(self) -> anyhow::Result<Self> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn with_overrides<F>(mut self, lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("KEYSCOPE_CONCURRENCY") {
            self.concurrency = value.trim().parse().map_err(|e| {
                anyhow::anyhow!("Invalid KEYSCOPE_CONCURRENCY '{}': {}", value, e)
            })?;
        }
        if let Some(value) = lookup("KEYSCOPE_TIMEOUT_SECS") {
            self.timeout_secs = value.trim().parse().map_err(|e| {
                anyhow::anyhow!("Invalid KEYSCOPE_TIMEOUT_SECS '{}': {}", value, e)
            })?;
        }
        Ok(self)
    }
}

/// Load run configuration from a TOML file.
pub fn load_config(path: &Path) -> anyhow::Result<RunConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e))?;
    let config: RunConfig = toml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse config file '{}': {}", path.display(), e))?;
    config.validate()?;
    Ok(config)
}

/// Generate a starter config file.
pub fn generate_default_config() -> String {
    r#"# keyscope run configuration

# Maximum number of probe requests in flight at once
concurrency = 10

# Per-request timeout in seconds
timeout_secs = 10

# User-Agent sent with every probe
# user_agent = "keyscope"

# Send every probe to this base URL instead of the service's own
# base_url_override = "https://proxy.internal.example"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_template_parses() {
        let config: RunConfig = toml::from_str(&generate_default_config()).unwrap();
        assert_eq!(config.concurrency, 10);
        assert_eq!(config.timeout_secs, 10);
        assert!(config.user_agent.starts_with("keyscope/"));
    }

    #[test]
    fn test_load_config_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "concurrency = 3").unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "concurrency = 0").unwrap();
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn test_overrides() {
        let config = RunConfig::default()
            .with_overrides(|name| match name {
                "KEYSCOPE_CONCURRENCY" => Some("2".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.concurrency, 2);

        let bad = RunConfig::default().with_overrides(|name| match name {
            "KEYSCOPE_TIMEOUT_SECS" => Some("soon".to_string()),
            _ => None,
        });
        assert!(bad.is_err());
    }
}
