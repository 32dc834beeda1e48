use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// A status condition, upserted by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl Condition {
    pub fn new(type_: &str, status: ConditionStatus, reason: &str, message: impl Into<String>) -> Self {
        Self { type_: type_.to_string(), status, reason: reason.to_string(), message: message.into(), last_transition_time: None }
    }
}

/// Insert or replace the condition of the same type.
/// The transition time only moves when the status flips.
pub fn set_condition(conditions: &mut Vec<Condition>, mut cond: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == cond.type_) {
        Some(existing) => {
            if existing.status != cond.status || existing.last_transition_time.is_none() {
                cond.last_transition_time = Some(crate::now_rfc3339());
            } else {
                cond.last_transition_time = existing.last_transition_time.take();
            }
            *existing = cond;
        }
        None => {
            cond.last_transition_time = Some(crate::now_rfc3339());
            conditions.push(cond);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_keeps_one_per_type() {
        let mut conds = Vec::new();
        set_condition(&mut conds, Condition::new("BuildReady", ConditionStatus::False, "BuildStarted", "job created"));
        set_condition(&mut conds, Condition::new("SourceReady", ConditionStatus::True, "Fetched", ""));
        set_condition(&mut conds, Condition::new("BuildReady", ConditionStatus::True, "BuildSucceeded", "image pushed"));
        assert_eq!(conds.len(), 2);
        let build = conds.iter().find(|c| c.type_ == "BuildReady").map(|c| c.status);
        assert_eq!(build, Some(ConditionStatus::True));
        assert!(conds.iter().all(|c| c.last_transition_time.is_some()));
    }
}
