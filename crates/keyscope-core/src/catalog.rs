use crate::analyzer::ServiceDefinition;
use crate::error::ProbeError;
use crate::scope::table::suggest;

/// Service definitions compiled into the binary.
const BUNDLED: &[(&str, &str)] = &[
    ("dropbox", include_str!("../services/dropbox.yaml")),
    ("notion", include_str!("../services/notion.yaml")),
    ("opsgenie", include_str!("../services/opsgenie.yaml")),
];

/// Names of the bundled services, sorted.
pub fn bundled_names() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = BUNDLED.iter().map(|(name, _)| *name).collect();
    names.sort_unstable();
    names
}

/// Raw YAML of a bundled service.
pub fn bundled_source(name: &str) -> Option<&'static str> {
    BUNDLED
        .iter()
        .find(|(bundled, _)| bundled.eq_ignore_ascii_case(name))
        .map(|(_, source)| *source)
}

/// Parse a bundled service definition by name.
pub fn load_bundled(name: &str) -> Result<ServiceDefinition, ProbeError> {
    match bundled_source(name) {
        Some(source) => ServiceDefinition::from_yaml(source),
        None => {
            let names = bundled_names();
            let hint = suggest(&name.to_lowercase(), &names)
                .map(|s| format!(" (did you mean '{s}'?)"))
                .unwrap_or_default();
            Err(ProbeError::Config(format!(
                "unknown service '{}'{}; bundled services: {}",
                name,
                hint,
                names.join(", ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_bundled_definition_is_valid() {
        for name in bundled_names() {
            let definition = load_bundled(name)
                .unwrap_or_else(|e| panic!("bundled service '{name}' is invalid: {e}"));
            assert_eq!(definition.analyzer_type, name);
            assert!(!definition.tests.is_empty());
            assert!(definition.table().is_ok());
        }
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        assert!(load_bundled("Dropbox").is_ok());
    }

    #[test]
    fn test_unknown_service_suggests_name() {
        let err = load_bundled("dropbx").unwrap_err().to_string();
        assert!(err.contains("did you mean 'dropbox'"));
        assert!(err.contains("notion"));
    }

    #[test]
    fn test_opsgenie_fans_out_over_teams() {
        let table = load_bundled("opsgenie").unwrap().table().unwrap();
        assert_eq!(table.stages(), vec![0, 1]);
        assert_eq!(table.tests_in_stage(1)[0].for_each.as_deref(), Some("team"));
    }
}
