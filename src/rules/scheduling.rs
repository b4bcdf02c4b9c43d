// Periodic activation pattern for rule updates

use serde::Serialize;

use super::RuleKey;
use crate::error::ValidationError;

/// Runs a rule every `frequency` frames, shifted by `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RuleScheduling {
    #[serde(rename = "rule", serialize_with = "serialize_key")]
    rule: RuleKey,
    frequency: i64,
    offset: i64,
}

fn serialize_key<S: serde::Serializer>(key: &RuleKey, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(key.name())
}

impl RuleScheduling {
    /// Requires `frequency >= 1` and `0 <= offset < frequency`.
    pub fn new(rule: RuleKey, frequency: i64, offset: i64) -> Result<Self, ValidationError> {
        if frequency < 1 || offset < 0 || offset >= frequency {
            return Err(ValidationError::InvalidSchedule {
                rule: rule.name().to_string(),
                frequency,
                offset,
            });
        }
        Ok(Self {
            rule,
            frequency,
            offset,
        })
    }

    pub fn every_tick(rule: RuleKey) -> Self {
        Self {
            rule,
            frequency: 1,
            offset: 0,
        }
    }

    pub fn rule(&self) -> RuleKey {
        self.rule
    }

    pub fn frequency(&self) -> i64 {
        self.frequency
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn is_expected_at_frame(&self, frame: i64) -> bool {
        frame >= 0 && frame % self.frequency == self.offset
    }
}
