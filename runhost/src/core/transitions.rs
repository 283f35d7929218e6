//! Instance status state machine.
//!
//! Client-initiated transitions only ever start from `prepare`:
//! - `prepare -> prepare` (edit fields)
//! - `prepare -> running` (start the invocation)
//!
//! `running -> finished|error` belongs to the invocation engine. Terminal
//! states have no outgoing transitions.

use serde_json::Value;

use crate::core::types::Status;

/// Parse a client-supplied status value.
pub fn parse_status(value: &Value) -> Result<Status, String> {
    match value {
        Value::String(raw) => {
            Status::parse(raw).ok_or_else(|| format!("invalid status = '{}'", raw))
        }
        other => Err(format!("invalid status = '{}'", other)),
    }
}

/// Validate a client transition from `from` to `to`.
pub fn validate_client_transition(from: Status, to: Status) -> Result<(), String> {
    if from != Status::Prepare {
        return Err("instance can only be updated if status = 'prepare'".to_string());
    }
    match to {
        Status::Prepare | Status::Running => Ok(()),
        other => Err(format!(
            "status cannot change from '{}' to '{}' (only 'prepare' or 'running' allowed)",
            from, other
        )),
    }
}

/// Validate an engine transition (invocation outcome) from `from` to `to`.
pub fn validate_engine_transition(from: Status, to: Status) -> Result<(), String> {
    match (from, to) {
        (Status::Running, Status::Finished | Status::Error) => Ok(()),
        _ => Err(format!(
            "invocation cannot move status from '{}' to '{}'",
            from, to
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_status_rejects_unknown_and_non_strings() {
        assert_eq!(parse_status(&json!("running")), Ok(Status::Running));
        assert_eq!(
            parse_status(&json!("paused")),
            Err("invalid status = 'paused'".to_string())
        );
        assert!(parse_status(&json!(1)).is_err());
        assert!(parse_status(&Value::Null).is_err());
    }

    /// Only `prepare` accepts client updates, whatever the target.
    #[test]
    fn non_prepare_sources_are_rejected() {
        for from in [Status::Running, Status::Finished, Status::Error] {
            for to in Status::ALL {
                assert!(validate_client_transition(from, to).is_err(), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn prepare_moves_only_to_prepare_or_running() {
        assert!(validate_client_transition(Status::Prepare, Status::Prepare).is_ok());
        assert!(validate_client_transition(Status::Prepare, Status::Running).is_ok());
        assert!(validate_client_transition(Status::Prepare, Status::Finished).is_err());
        assert!(validate_client_transition(Status::Prepare, Status::Error).is_err());
    }

    #[test]
    fn engine_only_completes_running_instances() {
        assert!(validate_engine_transition(Status::Running, Status::Finished).is_ok());
        assert!(validate_engine_transition(Status::Running, Status::Error).is_ok());
        assert!(validate_engine_transition(Status::Finished, Status::Error).is_err());
        assert!(validate_engine_transition(Status::Prepare, Status::Finished).is_err());
    }
}
