//! Declarative schedule specifications.

use serde::{Deserialize, Serialize};

/// The period tag for a `simple` schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimplePeriod {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

/// A task's declared dispatch schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    Simple { simple_type: SimplePeriod },
    Cron { cron_expr: String },
    Manual,
}

impl Schedule {
    /// Translate this schedule to a 5-field cron expression, or `None` for
    /// `manual` schedules (which are never auto-dispatched).
    pub fn to_cron_expr(&self) -> Option<String> {
        match self {
            Schedule::Simple { simple_type } => Some(
                match simple_type {
                    SimplePeriod::Hourly => "0 * * * *",
                    SimplePeriod::Daily => "0 2 * * *",
                    SimplePeriod::Weekly => "0 2 * * 0",
                    SimplePeriod::Monthly => "0 2 1 * *",
                }
                .to_string(),
            ),
            Schedule::Cron { cron_expr } => Some(cron_expr.clone()),
            Schedule::Manual => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_schedules_translate_to_fixed_cron() {
        assert_eq!(
            Schedule::Simple {
                simple_type: SimplePeriod::Hourly
            }
            .to_cron_expr(),
            Some("0 * * * *".to_string())
        );
        assert_eq!(
            Schedule::Simple {
                simple_type: SimplePeriod::Weekly
            }
            .to_cron_expr(),
            Some("0 2 * * 0".to_string())
        );
    }

    #[test]
    fn manual_never_schedules() {
        assert_eq!(Schedule::Manual.to_cron_expr(), None);
    }

    #[test]
    fn cron_schedule_passes_through_user_string() {
        let s = Schedule::Cron {
            cron_expr: "*/5 * * * *".to_string(),
        };
        assert_eq!(s.to_cron_expr(), Some("*/5 * * * *".to_string()));
    }
}
