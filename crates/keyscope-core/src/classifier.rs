use crate::error::ProbeError;
use crate::probe::ProbeResult;
use crate::scope::table::{HttpTest, MarkerOutcome};

/// What a single probe says about its scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Granted,
    Denied,
    Unverifiable,
    Error(ProbeError),
}

impl From<MarkerOutcome> for Outcome {
    fn from(outcome: MarkerOutcome) -> Self {
        match outcome {
            MarkerOutcome::Granted => Outcome::Granted,
            MarkerOutcome::Denied => Outcome::Denied,
            MarkerOutcome::Unverifiable => Outcome::Unverifiable,
        }
    }
}

/// Decide what `result` means for the scope `test` checks.
///
/// Transport errors propagate. Statuses outside both declared sets are
/// errors. When the test declares body markers for the status, the first
/// matching marker decides; a body that matches none of them (or cannot be
/// parsed for a field check) is reported as ambiguous, never as Denied.
pub fn classify(test: &HttpTest, result: &Result<ProbeResult, ProbeError>) -> Outcome {
    let response = match result {
        Ok(response) => response,
        Err(error) => return Outcome::Error(error.clone()),
    };
    let status = response.status;

    let default = if test.is_valid_status(status) {
        Outcome::Granted
    } else if test.is_invalid_status(status) {
        Outcome::Denied
    } else {
        return Outcome::Error(ProbeError::UnexpectedStatus {
            endpoint: test.endpoint.clone(),
            status,
        });
    };

    let markers: Vec<_> = test
        .markers
        .iter()
        .filter(|m| m.applies_to(status, test))
        .collect();
    if markers.is_empty() {
        return default;
    }

    let body = response.text();
    let json = response.json().ok();
    for marker in markers {
        match marker.matches(&body, json.as_ref()) {
            Ok(true) => return marker.outcome.into(),
            Ok(false) => continue,
            Err(reason) => {
                return Outcome::Error(ProbeError::AmbiguousResponse {
                    endpoint: test.endpoint.clone(),
                    status,
                    reason,
                })
            }
        }
    }

    Outcome::Error(ProbeError::AmbiguousResponse {
        endpoint: test.endpoint.clone(),
        status,
        reason: "response body matched none of the expected markers".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::HttpMethod;
    use crate::scope::table::BodyMarker;

    fn plain_test() -> HttpTest {
        HttpTest {
            endpoint: "/things".to_string(),
            method: HttpMethod::Get,
            payload: None,
            valid_status_codes: vec![200, 201],
            invalid_status_codes: vec![401, 403],
            markers: Vec::new(),
        }
    }

    /// Delete-a-missing-object probe: 409 `not_found` means the delete was
    /// authorized, 401 `missing_scope` means it was not.
    fn marker_test() -> HttpTest {
        HttpTest {
            endpoint: "/files/delete_v2".to_string(),
            method: HttpMethod::Post,
            payload: None,
            valid_status_codes: vec![409],
            invalid_status_codes: vec![401],
            markers: vec![
                BodyMarker {
                    status: Some(409),
                    contains: Some("not_found".into()),
                    field: None,
                    equals: None,
                    outcome: MarkerOutcome::Granted,
                },
                BodyMarker {
                    status: None,
                    contains: None,
                    field: Some("/error/.tag".into()),
                    equals: Some("missing_scope".into()),
                    outcome: MarkerOutcome::Denied,
                },
                BodyMarker {
                    status: Some(409),
                    contains: Some("too_many_write_operations".into()),
                    field: None,
                    equals: None,
                    outcome: MarkerOutcome::Unverifiable,
                },
            ],
        }
    }

    fn ok(status: u16, body: &str) -> Result<ProbeResult, ProbeError> {
        Ok(ProbeResult::new(status, body.as_bytes().to_vec()))
    }

    #[test]
    fn test_every_configured_status_classifies() {
        let test = plain_test();
        for &status in &test.valid_status_codes {
            assert_eq!(classify(&test, &ok(status, "")), Outcome::Granted);
        }
        for &status in &test.invalid_status_codes {
            assert_eq!(classify(&test, &ok(status, "")), Outcome::Denied);
        }
    }

    #[test]
    fn test_unexpected_status_names_endpoint() {
        let outcome = classify(&plain_test(), &ok(500, "oops"));
        match outcome {
            Outcome::Error(ProbeError::UnexpectedStatus { endpoint, status }) => {
                assert_eq!(endpoint, "/things");
                assert_eq!(status, 500);
            }
            other => panic!("expected unexpected status, got {:?}", other),
        }
    }

    #[test]
    fn test_transport_error_propagates() {
        let err = ProbeError::Transport {
            endpoint: "/things".into(),
            message: "dns failure".into(),
        };
        assert_eq!(
            classify(&plain_test(), &Err(err.clone())),
            Outcome::Error(err)
        );
    }

    #[test]
    fn test_markers_disambiguate() {
        let test = marker_test();
        assert_eq!(
            classify(&test, &ok(409, r#"{"error":{".tag":"path_lookup","path_lookup":{".tag":"not_found"}}}"#)),
            Outcome::Granted
        );
        assert_eq!(
            classify(&test, &ok(401, r#"{"error":{".tag":"missing_scope","required_scope":"files.content.write"}}"#)),
            Outcome::Denied
        );
        assert_eq!(
            classify(&test, &ok(409, r#"{"error":{".tag":"too_many_write_operations"}}"#)),
            Outcome::Unverifiable
        );
    }

    #[test]
    fn test_unmatched_marker_is_ambiguous_not_denied() {
        let test = marker_test();
        let outcome = classify(&test, &ok(401, r#"{"error":{".tag":"expired_access_token"}}"#));
        assert!(matches!(
            outcome,
            Outcome::Error(ProbeError::AmbiguousResponse { status: 401, .. })
        ));
    }

    #[test]
    fn test_unparseable_body_is_error() {
        let test = marker_test();
        let outcome = classify(&test, &ok(401, "<html>Unauthorized</html>"));
        assert!(matches!(
            outcome,
            Outcome::Error(ProbeError::AmbiguousResponse { .. })
        ));
    }
}
