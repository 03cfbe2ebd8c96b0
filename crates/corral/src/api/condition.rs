use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    QuotaReserved,
    Admitted,
    PodsReady,
    Evicted,
    Finished,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: ConditionStatus,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(
        condition_type: ConditionType,
        status: ConditionStatus,
        reason: &str,
        message: String,
        now: DateTime<Utc>,
    ) -> Self {
        Condition {
            condition_type,
            status,
            reason: reason.to_string(),
            message,
            last_transition_time: now,
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

pub fn find_condition(
    conditions: &[Condition],
    condition_type: ConditionType,
) -> Option<&Condition> {
    conditions
        .iter()
        .find(|c| c.condition_type == condition_type)
}

pub fn condition_is_true(conditions: &[Condition], condition_type: ConditionType) -> bool {
    find_condition(conditions, condition_type).is_some_and(|c| c.is_true())
}

/// Inserts or replaces the condition of the same type. The transition time is
/// only advanced when the status actually flips, matching the external
/// store's condition semantics.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions
        .iter_mut()
        .find(|c| c.condition_type == condition.condition_type)
    {
        Some(existing) => {
            let transition = if existing.status == condition.status {
                existing.last_transition_time
            } else {
                condition.last_transition_time
            };
            *existing = Condition {
                last_transition_time: transition,
                ..condition
            };
        }
        None => conditions.push(condition),
    }
}

pub mod reasons {
    pub const QUOTA_RESERVED: &str = "QuotaReserved";
    pub const ADMITTED: &str = "Admitted";
    pub const PREEMPTED: &str = "Preempted";
    pub const INADMISSIBLE: &str = "Inadmissible";
    pub const FINISHED: &str = "JobFinished";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_condition_keeps_transition_on_same_status() {
        let t0 = DateTime::UNIX_EPOCH;
        let t1 = t0 + chrono::Duration::seconds(10);
        let mut conditions = vec![];
        set_condition(
            &mut conditions,
            Condition::new(
                ConditionType::Admitted,
                ConditionStatus::True,
                reasons::ADMITTED,
                String::new(),
                t0,
            ),
        );
        set_condition(
            &mut conditions,
            Condition::new(
                ConditionType::Admitted,
                ConditionStatus::True,
                reasons::ADMITTED,
                "again".to_string(),
                t1,
            ),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, t0);
        assert_eq!(conditions[0].message, "again");

        set_condition(
            &mut conditions,
            Condition::new(
                ConditionType::Admitted,
                ConditionStatus::False,
                reasons::PREEMPTED,
                String::new(),
                t1,
            ),
        );
        assert_eq!(conditions[0].last_transition_time, t1);
    }
}
