//! Source lifecycle state machine.
//!
//! ```text
//! pending --Created--> analyzing --Analyzed(ok)--> active <--Replayed(n>0)-- stale
//!                          |                         |                        |
//!                          +--Analyzed(low)/Failed-->+--Replayed(0)---------->+
//!                          v                                                  |
//!                        failed --ManualRetry--> analyzing <--ReanalysisDue---+
//!
//! {any settled state} --Disabled--> disabled --Enabled--> {previous state}
//! ```
//!
//! Every status write goes through [`Lifecycle::apply`]. The persisted state
//! must satisfy [`check_consistency`]; [`reconcile`] repairs rows that do not
//! (e.g. after a crash mid-analysis).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::Source;
use crate::recipe::Recipe;

/// Minimum confidence for a recipe to be scheduled for replay.
pub const ACCEPTANCE_THRESHOLD: f64 = 0.3;

/// Lifecycle status of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Pending,
    Analyzing,
    Active,
    Stale,
    Failed,
    Disabled,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStatus::Pending => "pending",
            SourceStatus::Analyzing => "analyzing",
            SourceStatus::Active => "active",
            SourceStatus::Stale => "stale",
            SourceStatus::Failed => "failed",
            SourceStatus::Disabled => "disabled",
        }
    }

    /// Statuses whose recipe is replayed on schedule.
    pub fn is_replayable(&self) -> bool {
        matches!(self, SourceStatus::Active | SourceStatus::Stale)
    }
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SourceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(SourceStatus::Pending),
            "analyzing" => Ok(SourceStatus::Analyzing),
            "active" => Ok(SourceStatus::Active),
            "stale" => Ok(SourceStatus::Stale),
            "failed" => Ok(SourceStatus::Failed),
            "disabled" => Ok(SourceStatus::Disabled),
            _ => Err(format!("Unknown source status: {}", s)),
        }
    }
}

/// Something that happened to a source.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The source was just registered.
    Created,
    /// The scheduler picked a stale source for automatic re-analysis.
    ReanalysisDue,
    /// The user asked to re-analyze a failed source.
    ManualRetry,
    /// The analyzer produced a recipe (already validated).
    Analyzed(Recipe),
    /// The analyzer could not produce a recipe.
    AnalysisFailed(String),
    /// A scheduled replay completed with this many events.
    Replayed(u32),
    /// A scheduled replay aborted.
    ReplayFailed(String),
    Disabled,
    Enabled,
}

impl Outcome {
    pub fn name(&self) -> &'static str {
        match self {
            Outcome::Created => "created",
            Outcome::ReanalysisDue => "reanalysis-due",
            Outcome::ManualRetry => "manual-retry",
            Outcome::Analyzed(_) => "analyzed",
            Outcome::AnalysisFailed(_) => "analysis-failed",
            Outcome::Replayed(_) => "replayed",
            Outcome::ReplayFailed(_) => "replay-failed",
            Outcome::Disabled => "disabled",
            Outcome::Enabled => "enabled",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Bound on automatic re-analysis of stale sources.
///
/// Delay schedule before attempt N+1 after N unproductive attempts:
/// immediately, 1h, 6h, 24h (capped by `max_delay`).
#[derive(Debug, Clone)]
pub struct ReanalysisPolicy {
    pub max_attempts: u32,
    pub max_delay: TimeDelta,
}

impl Default for ReanalysisPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_delay: TimeDelta::hours(24),
        }
    }
}

impl ReanalysisPolicy {
    pub fn delay_for_attempt(&self, attempts_so_far: u32) -> TimeDelta {
        let delay = match attempts_so_far {
            0 => TimeDelta::zero(),
            1 => TimeDelta::hours(1),
            2 => TimeDelta::hours(6),
            _ => TimeDelta::hours(24),
        };
        std::cmp::min(delay, self.max_delay)
    }
}

/// The single authoritative transition function.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    pub policy: ReanalysisPolicy,
    pub acceptance_threshold: f64,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            policy: ReanalysisPolicy::default(),
            acceptance_threshold: ACCEPTANCE_THRESHOLD,
        }
    }
}

impl Lifecycle {
    pub fn new(policy: ReanalysisPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    /// Apply `outcome` to `source`, updating status and the lifecycle-owned
    /// columns. Returns the new status.
    pub fn apply(
        &self,
        source: &mut Source,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<SourceStatus, AppError> {
        use SourceStatus::*;

        let from = source.status;
        let invalid = |outcome: &Outcome| AppError::InvalidTransition {
            from: from.to_string(),
            outcome: outcome.to_string(),
        };

        let next = match (from, outcome) {
            (Pending, Outcome::Created) => Analyzing,

            (Stale, Outcome::ReanalysisDue) => {
                source.reanalysis_attempts += 1;
                source.next_analysis_at = None;
                Analyzing
            }

            (Failed, Outcome::ManualRetry) => {
                source.reanalysis_attempts = 0;
                source.next_analysis_at = None;
                source.last_error = None;
                Analyzing
            }

            (Analyzing, Outcome::Analyzed(recipe)) => {
                let accepted = recipe.is_accepted(self.acceptance_threshold);
                let confidence = recipe.confidence();
                source.recipe = Some(recipe);
                if accepted {
                    source.last_error = None;
                    Active
                } else {
                    source.last_error = Some(format!(
                        "Recipe confidence {confidence:.2} is below the acceptance threshold {:.2}",
                        self.acceptance_threshold
                    ));
                    Failed
                }
            }

            (Analyzing, Outcome::AnalysisFailed(error)) => {
                source.last_error = Some(error);
                Failed
            }

            (Active | Stale, Outcome::Replayed(count)) => {
                source.last_event_count = count;
                source.last_scraped_at = Some(now);
                source.last_error = None;
                if count > 0 {
                    source.reanalysis_attempts = 0;
                    source.next_analysis_at = None;
                    Active
                } else if from == Stale {
                    Stale
                } else if source.reanalysis_attempts >= self.policy.max_attempts {
                    source.last_error = Some(format!(
                        "{} automatic re-analyses did not restore any events; retry manually",
                        source.reanalysis_attempts
                    ));
                    Failed
                } else {
                    source.next_analysis_at =
                        Some(now + self.policy.delay_for_attempt(source.reanalysis_attempts));
                    Stale
                }
            }

            (Active | Stale, Outcome::ReplayFailed(error)) => {
                source.last_scraped_at = Some(now);
                source.last_error = Some(error);
                from
            }

            (Disabled, Outcome::Enabled) => source.resume_status.take().unwrap_or(Pending),

            (Disabled, outcome @ Outcome::Disabled) => return Err(invalid(&outcome)),

            (_, Outcome::Disabled) => {
                source.resume_status = Some(match from {
                    Analyzing if source.recipe.is_some() => Stale,
                    Analyzing => Pending,
                    other => other,
                });
                Disabled
            }

            (_, outcome) => return Err(invalid(&outcome)),
        };

        source.status = next;
        source.updated_at = now;
        Ok(next)
    }
}

/// [`Lifecycle::apply`] with default policy at the current time.
pub fn apply_outcome(source: &mut Source, outcome: Outcome) -> Result<SourceStatus, AppError> {
    Lifecycle::default().apply(source, outcome, Utc::now())
}

/// Check that a persisted combination is one the state machine can produce.
pub fn check_consistency(
    status: SourceStatus,
    resume_status: Option<SourceStatus>,
    last_event_count: u32,
    has_recipe: bool,
) -> Result<(), String> {
    match status {
        SourceStatus::Active | SourceStatus::Stale if !has_recipe => {
            Err(format!("{status} source has no recipe"))
        }
        SourceStatus::Stale if last_event_count > 0 => Err(format!(
            "stale source reports {last_event_count} events from its last replay"
        )),
        SourceStatus::Disabled => match resume_status {
            None => Err("disabled source has no state to resume".into()),
            Some(SourceStatus::Disabled | SourceStatus::Analyzing) => {
                Err("disabled source resumes into a transient state".into())
            }
            Some(inner) => check_consistency(inner, None, last_event_count, has_recipe),
        },
        _ => Ok(()),
    }
}

/// Repair a source loaded from storage so it satisfies [`check_consistency`].
///
/// Returns true when anything changed.
pub fn reconcile(source: &mut Source) -> bool {
    let before = (source.status, source.resume_status, source.last_error.clone());
    let has_recipe = source.recipe.is_some();

    let repair = |status: SourceStatus, last_event_count: u32| match status {
        SourceStatus::Analyzing if has_recipe => SourceStatus::Stale,
        SourceStatus::Analyzing => SourceStatus::Pending,
        SourceStatus::Active | SourceStatus::Stale if !has_recipe => SourceStatus::Failed,
        SourceStatus::Stale if last_event_count > 0 => SourceStatus::Active,
        other => other,
    };

    if source.status == SourceStatus::Disabled {
        let inner = source.resume_status.unwrap_or(if has_recipe {
            SourceStatus::Active
        } else {
            SourceStatus::Failed
        });
        let inner = match inner {
            SourceStatus::Disabled => SourceStatus::Failed,
            other => repair(other, source.last_event_count),
        };
        source.resume_status = Some(inner);
    } else {
        let repaired = repair(source.status, source.last_event_count);
        if repaired == SourceStatus::Failed && source.status != SourceStatus::Failed {
            source.last_error = Some("Recipe missing; re-analysis required".into());
        }
        if repaired == SourceStatus::Stale && source.status == SourceStatus::Analyzing {
            source.last_event_count = 0;
        }
        source.status = repaired;
        source.resume_status = None;
    }

    before != (source.status, source.resume_status, source.last_error.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{make_test_recipe, make_test_source};

    fn recipe(confidence: f64) -> Recipe {
        make_test_recipe(confidence)
    }

    fn source_in(status: SourceStatus) -> Source {
        let mut source = make_test_source("https://example.org/events");
        source.status = status;
        if status.is_replayable() {
            source.recipe = Some(recipe(0.8));
        }
        source
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            SourceStatus::Pending,
            SourceStatus::Analyzing,
            SourceStatus::Active,
            SourceStatus::Stale,
            SourceStatus::Failed,
            SourceStatus::Disabled,
        ] {
            let parsed: SourceStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_created_starts_analysis() {
        let mut source = source_in(SourceStatus::Pending);
        let status = apply_outcome(&mut source, Outcome::Created).unwrap();
        assert_eq!(status, SourceStatus::Analyzing);
    }

    #[test]
    fn test_accepted_recipe_activates() {
        let mut source = source_in(SourceStatus::Analyzing);
        let status = apply_outcome(&mut source, Outcome::Analyzed(recipe(0.3))).unwrap();
        assert_eq!(status, SourceStatus::Active);
        assert!(source.recipe.is_some());
    }

    #[test]
    fn test_low_confidence_recipe_fails_but_is_kept() {
        let mut source = source_in(SourceStatus::Analyzing);
        let status = apply_outcome(&mut source, Outcome::Analyzed(recipe(0.2))).unwrap();
        assert_eq!(status, SourceStatus::Failed);
        assert!(source.recipe.is_some());
        assert!(source.last_error.as_deref().unwrap().contains("0.20"));
    }

    #[test]
    fn test_analysis_failure_records_error() {
        let mut source = source_in(SourceStatus::Analyzing);
        let status =
            apply_outcome(&mut source, Outcome::AnalysisFailed("HTTP 404".into())).unwrap();
        assert_eq!(status, SourceStatus::Failed);
        assert_eq!(source.last_error.as_deref(), Some("HTTP 404"));
    }

    #[test]
    fn test_replay_yield_drives_active_and_stale() {
        let mut source = source_in(SourceStatus::Active);
        assert_eq!(
            apply_outcome(&mut source, Outcome::Replayed(4)).unwrap(),
            SourceStatus::Active
        );
        assert_eq!(source.last_event_count, 4);
        assert!(source.last_scraped_at.is_some());

        assert_eq!(
            apply_outcome(&mut source, Outcome::Replayed(0)).unwrap(),
            SourceStatus::Stale
        );
        assert!(source.next_analysis_at.is_some());

        assert_eq!(
            apply_outcome(&mut source, Outcome::Replayed(2)).unwrap(),
            SourceStatus::Active
        );
        assert!(source.next_analysis_at.is_none());
    }

    #[test]
    fn test_replay_failure_keeps_status() {
        let mut source = source_in(SourceStatus::Active);
        let status =
            apply_outcome(&mut source, Outcome::ReplayFailed("Timeout".into())).unwrap();
        assert_eq!(status, SourceStatus::Active);
        assert_eq!(source.last_error.as_deref(), Some("Timeout"));
    }

    #[test]
    fn test_failed_only_leaves_by_manual_retry() {
        let mut source = source_in(SourceStatus::Failed);
        assert!(apply_outcome(&mut source, Outcome::ReanalysisDue).is_err());
        assert!(apply_outcome(&mut source, Outcome::Replayed(3)).is_err());
        assert_eq!(
            apply_outcome(&mut source, Outcome::ManualRetry).unwrap(),
            SourceStatus::Analyzing
        );
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut source = source_in(SourceStatus::Pending);
        let err = apply_outcome(&mut source, Outcome::Replayed(1)).unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
        assert_eq!(source.status, SourceStatus::Pending);

        let mut source = source_in(SourceStatus::Active);
        assert!(apply_outcome(&mut source, Outcome::ReanalysisDue).is_err());
        assert!(apply_outcome(&mut source, Outcome::Analyzed(recipe(0.9))).is_err());
    }

    #[test]
    fn test_disable_retains_sub_state() {
        for status in [
            SourceStatus::Active,
            SourceStatus::Stale,
            SourceStatus::Failed,
        ] {
            let mut source = source_in(status);
            if status == SourceStatus::Stale {
                source.last_event_count = 0;
            }
            assert_eq!(
                apply_outcome(&mut source, Outcome::Disabled).unwrap(),
                SourceStatus::Disabled
            );
            assert!(apply_outcome(&mut source, Outcome::Disabled).is_err());
            assert!(apply_outcome(&mut source, Outcome::Replayed(1)).is_err());
            assert_eq!(apply_outcome(&mut source, Outcome::Enabled).unwrap(), status);
        }
    }

    #[test]
    fn test_reanalysis_is_bounded() {
        let lifecycle = Lifecycle::default();
        let now = Utc::now();
        let mut source = source_in(SourceStatus::Active);

        for attempt in 1..=3 {
            assert_eq!(
                lifecycle.apply(&mut source, Outcome::Replayed(0), now).unwrap(),
                SourceStatus::Stale
            );
            lifecycle
                .apply(&mut source, Outcome::ReanalysisDue, now)
                .unwrap();
            assert_eq!(source.reanalysis_attempts, attempt);
            lifecycle
                .apply(&mut source, Outcome::Analyzed(recipe(0.9)), now)
                .unwrap();
        }

        let status = lifecycle
            .apply(&mut source, Outcome::Replayed(0), now)
            .unwrap();
        assert_eq!(status, SourceStatus::Failed);
        assert!(source.last_error.as_deref().unwrap().contains("retry manually"));
    }

    #[test]
    fn test_reanalysis_backoff_schedule() {
        let policy = ReanalysisPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), TimeDelta::zero());
        assert_eq!(policy.delay_for_attempt(1), TimeDelta::hours(1));
        assert_eq!(policy.delay_for_attempt(2), TimeDelta::hours(6));
        assert_eq!(policy.delay_for_attempt(7), TimeDelta::hours(24));

        let lifecycle = Lifecycle::default();
        let now = Utc::now();
        let mut source = source_in(SourceStatus::Active);
        source.reanalysis_attempts = 1;
        lifecycle
            .apply(&mut source, Outcome::Replayed(0), now)
            .unwrap();
        assert_eq!(source.next_analysis_at, Some(now + TimeDelta::hours(1)));
    }

    #[test]
    fn test_productive_replay_resets_attempts() {
        let mut source = source_in(SourceStatus::Active);
        source.reanalysis_attempts = 2;
        apply_outcome(&mut source, Outcome::Replayed(5)).unwrap();
        assert_eq!(source.reanalysis_attempts, 0);
    }

    #[test]
    fn test_consistency_rules() {
        use SourceStatus::*;
        assert!(check_consistency(Active, None, 3, true).is_ok());
        assert!(check_consistency(Active, None, 3, false).is_err());
        assert!(check_consistency(Stale, None, 0, true).is_ok());
        assert!(check_consistency(Stale, None, 2, true).is_err());
        assert!(check_consistency(Failed, None, 0, false).is_ok());
        assert!(check_consistency(Disabled, Some(Active), 1, true).is_ok());
        assert!(check_consistency(Disabled, Some(Active), 1, false).is_err());
        assert!(check_consistency(Disabled, None, 0, true).is_err());
    }

    #[test]
    fn test_reconcile_repairs_inconsistent_rows() {
        let mut source = source_in(SourceStatus::Pending);
        source.status = SourceStatus::Active;
        source.recipe = None;
        assert!(reconcile(&mut source));
        assert_eq!(source.status, SourceStatus::Failed);
        assert!(source.last_error.is_some());

        let mut source = source_in(SourceStatus::Pending);
        source.status = SourceStatus::Analyzing;
        assert!(reconcile(&mut source));
        assert_eq!(source.status, SourceStatus::Pending);

        let mut source = source_in(SourceStatus::Active);
        source.status = SourceStatus::Analyzing;
        assert!(reconcile(&mut source));
        assert_eq!(source.status, SourceStatus::Stale);

        let mut source = source_in(SourceStatus::Active);
        source.last_event_count = 7;
        assert!(!reconcile(&mut source));

        let mut source = source_in(SourceStatus::Active);
        source.status = SourceStatus::Disabled;
        assert!(reconcile(&mut source));
        assert_eq!(source.resume_status, Some(SourceStatus::Active));
    }

    #[test]
    fn test_every_reachable_state_is_consistent() {
        let lifecycle = Lifecycle::default();
        let now = Utc::now();
        let outcomes = || {
            vec![
                Outcome::Created,
                Outcome::ReanalysisDue,
                Outcome::ManualRetry,
                Outcome::Analyzed(recipe(0.9)),
                Outcome::Analyzed(recipe(0.1)),
                Outcome::AnalysisFailed("boom".into()),
                Outcome::Replayed(0),
                Outcome::Replayed(3),
                Outcome::ReplayFailed("HTTP 500".into()),
                Outcome::Disabled,
                Outcome::Enabled,
            ]
        };

        let mut frontier = vec![make_test_source("https://example.org")];
        for _ in 0..6 {
            let mut next = Vec::new();
            for source in &frontier {
                for outcome in outcomes() {
                    let mut candidate = source.clone();
                    if lifecycle.apply(&mut candidate, outcome, now).is_ok() {
                        if candidate.status != SourceStatus::Analyzing {
                            check_consistency(
                                candidate.status,
                                candidate.resume_status,
                                candidate.last_event_count,
                                candidate.recipe.is_some(),
                            )
                            .unwrap();
                        }
                        next.push(candidate);
                    }
                }
            }
            next.truncate(200);
            frontier = next;
        }
    }
}
