use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use interfaces::CadenceSpec;

use crate::types::{EngineError, Result};

/// A compiled, validated run cadence.
#[derive(Debug, Clone)]
pub enum Cadence {
    Every(Duration),
    Cron(Box<cron::Schedule>),
}

impl Cadence {
    /// Validate a declarative cadence. Malformed expressions are a
    /// configuration error: the task never starts until corrected.
    pub fn compile(spec: &CadenceSpec) -> Result<Self> {
        match spec {
            CadenceSpec::Interval { minutes } => {
                if *minutes == 0 {
                    return Err(EngineError::Configuration(
                        "interval cadence must be at least one minute".to_string(),
                    ));
                }
                Ok(Cadence::Every(Duration::minutes(*minutes as i64)))
            }
            CadenceSpec::Cron { expr } => {
                let schedule = cron::Schedule::from_str(expr).map_err(|e| {
                    EngineError::Configuration(format!("invalid cron expression '{}': {}", expr, e))
                })?;
                Ok(Cadence::Cron(Box::new(schedule)))
            }
        }
    }

    /// Pure next-run computation.
    ///
    /// Interval cadences are measured from the previous run's start; a task
    /// that has never run is due immediately. Cron cadences fire at the first
    /// occurrence after the previous run (which may already be in the past —
    /// the scheduler then runs it once as catch-up); a cron task that has
    /// never run waits for its first scheduled occurrence.
    pub fn next_run(&self, last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Cadence::Every(interval) => match last_run {
                Some(last) => last + *interval,
                None => now,
            },
            Cadence::Cron(schedule) => {
                let base = last_run.unwrap_or(now);
                schedule
                    .after(&base)
                    .next()
                    // A schedule with no future occurrence (e.g. a fixed past
                    // year) never fires.
                    .unwrap_or(DateTime::<Utc>::MAX_UTC)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, h, m, 0).unwrap()
    }

    #[test]
    fn interval_runs_immediately_when_never_run() {
        let c = Cadence::compile(&CadenceSpec::Interval { minutes: 30 }).unwrap();
        let now = at(9, 0);
        assert_eq!(c.next_run(None, now), now);
    }

    #[test]
    fn interval_is_measured_from_last_run_start() {
        let c = Cadence::compile(&CadenceSpec::Interval { minutes: 30 }).unwrap();
        let next = c.next_run(Some(at(9, 0)), at(9, 10));
        assert_eq!(next, at(9, 30));
    }

    #[test]
    fn interval_catch_up_is_due_once() {
        let c = Cadence::compile(&CadenceSpec::Interval { minutes: 30 }).unwrap();
        // Last run long ago: due now, and once re-based it moves forward.
        let now = at(12, 0);
        assert!(c.next_run(Some(at(9, 0)), now) <= now);
        assert!(c.next_run(Some(now), now) > now);
    }

    #[test]
    fn cron_fires_at_next_occurrence_after_last_run() {
        let c = Cadence::compile(&CadenceSpec::Cron {
            expr: "0 0 8 * * *".to_string(),
        })
        .unwrap();
        let next = c.next_run(Some(at(8, 0)), at(9, 30));
        // Next 08:00 after the 08:00 run is tomorrow's.
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 11, 8, 0, 0).unwrap());
    }

    #[test]
    fn cron_never_run_waits_for_first_occurrence() {
        let c = Cadence::compile(&CadenceSpec::Cron {
            expr: "0 0 8 * * *".to_string(),
        })
        .unwrap();
        let now = at(9, 30);
        assert!(c.next_run(None, now) > now);
    }

    #[test]
    fn malformed_cron_is_a_configuration_error() {
        let err = Cadence::compile(&CadenceSpec::Cron {
            expr: "not a cron".to_string(),
        })
        .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn zero_interval_is_rejected() {
        assert!(Cadence::compile(&CadenceSpec::Interval { minutes: 0 }).is_err());
    }
}
