use crate::OperationalCode;
use serde_json::Value;
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{error, warn};

const STATE_KEY: &str = "CurrentState";
const INCIDENTS_KEY: &str = "EinsatzData";
const SEVERITY_KEY: &str = "Alarmstufe";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    #[error("feed kept failing with status {status} after {attempts} attempts")]
    Transient { status: u16, attempts: u32 },
    #[error("feed returned unexpected status {0}")]
    Status(u16),
    #[error("feed request failed: {0}")]
    Network(String),
    #[error("feed body is not valid json: {0}")]
    Body(String),
    #[error("cannot read feed snapshot: {0}")]
    Snapshot(String),
    #[error("feed credential not accepted, CurrentState: {0}")]
    AuthPending(String),
    #[error("unexpected feed shape: {0}")]
    Shape(String),
    #[error("unknown CurrentState: {0}")]
    UnknownState(String),
    #[error("alarm code not in allow-list: {0}")]
    UnrecognizedAlarm(String),
}

/// Case-insensitive allow-list of severity codes that count as a real alarm.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlarmCodes {
    codes: BTreeSet<String>,
}

impl AlarmCodes {
    pub fn new<'a, I>(codes: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        Self {
            codes: codes
                .into_iter()
                .map(|code| code.trim().to_lowercase())
                .filter(|code| !code.is_empty())
                .collect(),
        }
    }

    pub fn contains(&self, code: &str) -> bool {
        self.codes.contains(&code.trim().to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

/// Outcome of one poll cycle: the code to distribute plus the payload it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub code: OperationalCode,
    pub payload: Value,
    pub issue: Option<FeedError>,
}

impl Classification {
    pub fn from_error(issue: FeedError) -> Self {
        Self {
            code: OperationalCode::Error,
            payload: Value::Null,
            issue: Some(issue),
        }
    }

    pub fn first_incident(&self) -> Option<&Value> {
        self.payload
            .get(INCIDENTS_KEY)
            .and_then(Value::as_array)
            .and_then(|incidents| incidents.first())
    }
}

/// Pure classification of a feed payload.
pub fn evaluate(payload: &Value, codes: &AlarmCodes) -> Result<OperationalCode, FeedError> {
    let state = payload
        .get(STATE_KEY)
        .ok_or_else(|| FeedError::Shape(format!("missing {STATE_KEY}")))?
        .as_str()
        .ok_or_else(|| FeedError::Shape(format!("{STATE_KEY} is not a string")))?;

    match state {
        "data" => {
            let incidents = payload
                .get(INCIDENTS_KEY)
                .and_then(Value::as_array)
                .ok_or_else(|| FeedError::Shape(format!("missing {INCIDENTS_KEY} list")))?;
            let Some(incident) = incidents.first() else {
                return Ok(OperationalCode::Normal);
            };
            let severity = incident
                .get(SEVERITY_KEY)
                .and_then(Value::as_str)
                .ok_or_else(|| FeedError::Shape(format!("incident without {SEVERITY_KEY}")))?;
            if codes.contains(severity) {
                Ok(OperationalCode::Alarm)
            } else {
                Err(FeedError::UnrecognizedAlarm(severity.to_string()))
            }
        }
        "token" | "waiting" => Err(FeedError::AuthPending(state.to_string())),
        other => Err(FeedError::UnknownState(other.to_string())),
    }
}

/// Classifies `payload`, degrading every failure to [`OperationalCode::Error`].
pub fn classify(payload: Value, codes: &AlarmCodes) -> Classification {
    match evaluate(&payload, codes) {
        Ok(code) => Classification {
            code,
            payload,
            issue: None,
        },
        Err(issue) => {
            match &issue {
                FeedError::AuthPending(state) => {
                    warn!(event = "feed_auth_pending", state = %state, "{issue}");
                }
                _ => {
                    error!(event = "feed_unrecognized", error = %issue, payload = %payload);
                }
            }
            Classification {
                code: OperationalCode::Error,
                payload,
                issue: Some(issue),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn codes() -> AlarmCodes {
        AlarmCodes::new(["b4", "T1", " s2 "])
    }

    #[test]
    fn empty_incident_list_is_normal() {
        let payload = json!({"CurrentState": "data", "EinsatzData": []});
        let result = classify(payload, &codes());
        assert_eq!(result.code, OperationalCode::Normal);
        assert!(result.issue.is_none());
        assert!(result.first_incident().is_none());
    }

    #[test]
    fn listed_severity_is_alarm_regardless_of_case() {
        for severity in ["b4", "B4", "t1", "S2"] {
            let payload = json!({
                "CurrentState": "data",
                "EinsatzData": [{"Alarmstufe": severity, "Strasse": "Hauptplatz"}]
            });
            let result = classify(payload, &codes());
            assert_eq!(result.code, OperationalCode::Alarm, "severity {severity}");
            assert_eq!(
                result.first_incident().and_then(|i| i.get("Strasse")),
                Some(&json!("Hauptplatz"))
            );
        }
    }

    #[test]
    fn unlisted_severity_is_error() {
        let payload = json!({"CurrentState": "data", "EinsatzData": [{"Alarmstufe": "x9"}]});
        let result = classify(payload, &codes());
        assert_eq!(result.code, OperationalCode::Error);
        assert_eq!(
            result.issue,
            Some(FeedError::UnrecognizedAlarm("x9".to_string()))
        );
    }

    #[test]
    fn pending_authorization_states_are_error() {
        for state in ["waiting", "token"] {
            let result = classify(json!({ "CurrentState": state }), &codes());
            assert_eq!(result.code, OperationalCode::Error);
            assert_eq!(result.issue, Some(FeedError::AuthPending(state.to_string())));
        }
    }

    #[test]
    fn malformed_payloads_never_escape_as_alarm_or_normal() {
        let samples = [
            json!(null),
            json!([]),
            json!("data"),
            json!({}),
            json!({"CurrentState": 3}),
            json!({"CurrentState": "data"}),
            json!({"CurrentState": "data", "EinsatzData": {}}),
            json!({"CurrentState": "data", "EinsatzData": [{}]}),
            json!({"CurrentState": "data", "EinsatzData": [{"Alarmstufe": 4}]}),
            json!({"CurrentState": "mystery"}),
        ];
        for payload in samples {
            let result = classify(payload.clone(), &codes());
            assert_eq!(result.code, OperationalCode::Error, "payload {payload}");
            assert!(result.issue.is_some());
        }
    }

    #[test]
    fn only_first_incident_decides() {
        let payload = json!({
            "CurrentState": "data",
            "EinsatzData": [{"Alarmstufe": "b4"}, {"Alarmstufe": "x9"}]
        });
        assert_eq!(evaluate(&payload, &codes()), Ok(OperationalCode::Alarm));
    }

    #[test]
    fn empty_allow_list_turns_every_incident_into_error() {
        let payload = json!({"CurrentState": "data", "EinsatzData": [{"Alarmstufe": "b4"}]});
        let empty = AlarmCodes::default();
        assert!(empty.is_empty());
        assert_eq!(
            evaluate(&payload, &empty),
            Err(FeedError::UnrecognizedAlarm("b4".to_string()))
        );
    }
}
