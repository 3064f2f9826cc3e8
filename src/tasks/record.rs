use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use crate::core::error::{Error, ErrorKind, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Started,
    Success,
    Failure,
}

impl TaskState {
    pub fn is_finished(&self) -> bool {
        matches!(self, TaskState::Success | TaskState::Failure)
    }
}

/// Task arguments, positional or by keyword
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "arg_type", content = "args", rename_all = "lowercase")]
pub enum TaskArgs {
    Positional(Vec<Value>),
    Keyword(Map<String, Value>),
}

impl TaskArgs {
    pub fn keyword(pairs: &[(&str, Value)]) -> Self {
        TaskArgs::Keyword(pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect())
    }

    /// Look up by name for keyword args, by index for positional ones
    pub fn get(&self, name: &str, index: usize) -> Option<&Value> {
        match self {
            TaskArgs::Positional(values) => values.get(index),
            TaskArgs::Keyword(map) => map.get(name),
        }
    }

    pub fn get_str(&self, name: &str, index: usize) -> Result<&str> {
        self.get(name, index)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::new(ErrorKind::BadInput, format!("missing string argument '{}'", name)))
    }
}

/// Per-task time limits. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskLimits {
    pub soft: Option<Duration>,
    pub hard: Option<Duration>,
}

impl TaskLimits {
    /// Fill unset limits from `defaults`
    pub fn or(self, defaults: TaskLimits) -> TaskLimits {
        TaskLimits {
            soft: self.soft.or(defaults.soft),
            hard: self.hard.or(defaults.hard),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub task_id: String,
    pub name: String,
    pub args: TaskArgs,
    pub limits: TaskLimits,
    pub state: TaskState,
    pub error: Option<Error>,
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn new(task_id: String, name: String, args: TaskArgs, limits: TaskLimits) -> Self {
        TaskRecord {
            task_id,
            name,
            args,
            limits,
            state: TaskState::Pending,
            error: None,
            result: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn succeed(&mut self, result: Value) {
        self.state = TaskState::Success;
        self.result = Some(result);
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: Error) {
        self.state = TaskState::Failure;
        self.error = Some(error);
        self.finished_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_wire_names() {
        assert_eq!(serde_json::to_string(&TaskState::Started).unwrap(), "\"STARTED\"");
        assert!(TaskState::Failure.is_finished());
        assert!(!TaskState::Pending.is_finished());
    }

    #[test]
    fn test_args_lookup() {
        let kw = TaskArgs::keyword(&[("chain_id", json!("abc"))]);
        assert_eq!(kw.get_str("chain_id", 0).unwrap(), "abc");
        assert_eq!(serde_json::to_value(&kw).unwrap()["arg_type"], "keyword");

        let pos = TaskArgs::Positional(vec![json!("abc")]);
        assert_eq!(pos.get_str("chain_id", 0).unwrap(), "abc");
        assert_eq!(pos.get_str("other", 1).unwrap_err().kind, ErrorKind::BadInput);
    }
}
