use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::core::scheduler::cron_expr;

/// When an agent runs: only on demand, or on a cron schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Trigger {
    Manual,
    Cron(String),
}

#[derive(Debug, thiserror::Error)]
pub enum TriggerParseError {
    #[error("invalid trigger '{0}': expected \"manual\" or \"cron:<expression>\"")]
    Unknown(String),
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },
}

impl Trigger {
    pub fn cron_expression(&self) -> Option<&str> {
        match self {
            Trigger::Manual => None,
            Trigger::Cron(expr) => Some(expr),
        }
    }
}

impl FromStr for Trigger {
    type Err = TriggerParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("manual") {
            return Ok(Trigger::Manual);
        }
        let Some(expr) = raw.strip_prefix("cron:") else {
            return Err(TriggerParseError::Unknown(raw.to_string()));
        };
        let expr = expr.split_whitespace().collect::<Vec<_>>().join(" ");
        cron_expr::parse_schedule(&expr).map_err(|e| TriggerParseError::InvalidCron {
            expr: expr.clone(),
            reason: e.to_string(),
        })?;
        Ok(Trigger::Cron(expr))
    }
}

impl TryFrom<String> for Trigger {
    type Error = TriggerParseError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<Trigger> for String {
    fn from(trigger: Trigger) -> Self {
        trigger.to_string()
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Manual => f.write_str("manual"),
            Trigger::Cron(expr) => write!(f, "cron:{}", expr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_manual_and_cron() {
        assert_eq!("manual".parse::<Trigger>().unwrap(), Trigger::Manual);
        assert_eq!(
            "cron:  */15   * * * *".parse::<Trigger>().unwrap(),
            Trigger::Cron("*/15 * * * *".to_string())
        );
    }

    #[test]
    fn rejects_unknown_trigger_kinds() {
        let err = "webhook:github".parse::<Trigger>().unwrap_err();
        assert!(matches!(err, TriggerParseError::Unknown(_)));
    }

    #[test]
    fn rejects_malformed_cron() {
        let err = "cron: not a schedule".parse::<Trigger>().unwrap_err();
        assert!(matches!(err, TriggerParseError::InvalidCron { .. }));
    }
}
