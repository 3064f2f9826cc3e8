use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::core::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComputationState {
    NotStarted,
    Pending,
    Started,
    Success,
    Failure,
}

/// Answer to `poll_computation`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputationStatus {
    pub state: ComputationState,
    pub task_id: Option<String>,
    pub current_size: u64,
    pub total_size: Option<u64>,     // Known once finished
    pub error: Option<ErrorPayload>,
}

impl ComputationStatus {
    pub fn not_started() -> Self {
        ComputationStatus {
            state: ComputationState::NotStarted,
            task_id: None,
            current_size: 0,
            total_size: None,
            error: None,
        }
    }
}

/// JSON error body for the web layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: String,
    pub message: String,
    pub correlation_id: String,
    pub status_code: u16,
}

impl From<&Error> for ErrorPayload {
    fn from(err: &Error) -> Self {
        ErrorPayload {
            kind: err.kind.as_str().to_string(),
            message: err.context.clone(),
            correlation_id: Uuid::new_v4().simple().to_string(),
            status_code: err.kind.status_code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;

    #[test]
    fn test_payload_shape() {
        let err = Error::new(ErrorKind::Cancelled, "task was revoked".to_string());
        let payload = ErrorPayload::from(&err);
        assert_eq!(payload.kind, "Cancelled");
        assert_eq!(payload.status_code, 409);
        assert_eq!(payload.correlation_id.len(), 32);

        let json = serde_json::to_value(ComputationStatus::not_started()).unwrap();
        assert_eq!(json["state"], "NOT_STARTED");
    }
}
