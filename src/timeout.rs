//! Per-phase deadline profiles with graceful degradation for DM calls
//! only. Defaults for `ban_kick`/`default` match
//! `original_source/tests/unit/test_moderation_timeout_handler.py`; the
//! other classes are extrapolated in the same proportion (tighter for
//! user-visible latency sensitive actions, looser for background/database
//! work).

use crate::retry::OperationClass;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct DeadlineProfile {
    pub operation_total: Duration,
    pub dm_budget: Duration,
    pub database_budget: Duration,
    pub api_budget: Duration,
    pub max_extend_attempts: u32,
    pub extend_factor: f64,
    /// Graceful degradation under `extend`/`operation_total` pressure only
    /// applies to non-critical classes.
    pub graceful_degradation: bool,
}

impl DeadlineProfile {
    pub fn for_class(class: OperationClass) -> Self {
        match class {
            OperationClass::BanKick => DeadlineProfile {
                operation_total: Duration::from_secs(15),
                dm_budget: Duration::from_secs(2),
                database_budget: Duration::from_secs(10),
                api_budget: Duration::from_secs(5),
                max_extend_attempts: 2,
                extend_factor: 1.5,
                graceful_degradation: false,
            },
            OperationClass::Timeout => DeadlineProfile {
                operation_total: Duration::from_secs(12),
                dm_budget: Duration::from_secs(2),
                database_budget: Duration::from_secs(10),
                api_budget: Duration::from_secs(5),
                max_extend_attempts: 2,
                extend_factor: 1.5,
                graceful_degradation: false,
            },
            OperationClass::Messages => DeadlineProfile {
                operation_total: Duration::from_secs(20),
                dm_budget: Duration::from_secs(3),
                database_budget: Duration::from_secs(10),
                api_budget: Duration::from_secs(5),
                max_extend_attempts: 2,
                extend_factor: 1.5,
                graceful_degradation: true,
            },
            OperationClass::Database => DeadlineProfile {
                operation_total: Duration::from_secs(25),
                dm_budget: Duration::from_secs(3),
                database_budget: Duration::from_secs(10),
                api_budget: Duration::from_secs(5),
                max_extend_attempts: 2,
                extend_factor: 1.5,
                graceful_degradation: true,
            },
            OperationClass::ApiOther => DeadlineProfile {
                operation_total: Duration::from_secs(25),
                dm_budget: Duration::from_secs(3),
                database_budget: Duration::from_secs(10),
                api_budget: Duration::from_secs(5),
                max_extend_attempts: 2,
                extend_factor: 1.5,
                graceful_degradation: true,
            },
        }
    }

    /// The `operation_total` after extending `attempt` times (capped at
    /// `max_extend_attempts`), for non-critical classes only.
    pub fn extended_total(&self, attempt: u32) -> Duration {
        if !self.graceful_degradation || attempt == 0 {
            return self.operation_total;
        }
        let attempt = attempt.min(self.max_extend_attempts);
        let factor = self.extend_factor.powi(attempt as i32);
        Duration::from_secs_f64(self.operation_total.as_secs_f64() * factor)
    }
}

pub struct TimeoutHarness;

impl TimeoutHarness {
    pub fn profile(class: OperationClass) -> DeadlineProfile {
        DeadlineProfile::for_class(class)
    }

    /// Runs a best-effort DM under `dm_budget`; elapsing the deadline
    /// degrades to `None` rather than propagating an error.
    pub async fn run_dm<T, Fut>(profile: &DeadlineProfile, fut: Fut) -> Option<T>
    where
        Fut: Future<Output = T>,
    {
        tokio::time::timeout(profile.dm_budget, fut).await.ok()
    }

    /// Runs a database or API call under its budget; elapsing the deadline
    /// is a classified cancellation, not a silent degradation.
    pub async fn run_budgeted<T, Fut>(
        budget: Duration,
        fut: Fut,
    ) -> Result<T, crate::error::ModerationError>
    where
        Fut: Future<Output = T>,
    {
        tokio::time::timeout(budget, fut)
            .await
            .map_err(|_| crate::error::ModerationError::Cancelled {
                reason: "operation exceeded its budget".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ban_kick_defaults_match_original_source() {
        let profile = DeadlineProfile::for_class(OperationClass::BanKick);
        assert_eq!(profile.operation_total, Duration::from_secs(15));
        assert_eq!(profile.dm_budget, Duration::from_secs(2));
    }

    #[test]
    fn default_class_falls_back_to_twenty_five_seconds() {
        let profile = DeadlineProfile::for_class(OperationClass::ApiOther);
        assert_eq!(profile.operation_total, Duration::from_secs(25));
    }

    #[tokio::test]
    async fn dm_budget_elapse_degrades_to_none() {
        let profile = DeadlineProfile {
            dm_budget: Duration::from_millis(5),
            ..DeadlineProfile::for_class(OperationClass::BanKick)
        };
        let result = TimeoutHarness::run_dm(&profile, async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            "sent"
        })
        .await;
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn database_budget_elapse_is_a_classified_cancellation() {
        let result = TimeoutHarness::run_budgeted(Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
        })
        .await;
        assert!(matches!(
            result,
            Err(crate::error::ModerationError::Cancelled { .. })
        ));
    }

    #[test]
    fn extend_scales_operation_total_for_non_critical_classes() {
        let profile = DeadlineProfile::for_class(OperationClass::Database);
        let extended = profile.extended_total(1);
        assert!(extended > profile.operation_total);
        let not_extended = DeadlineProfile::for_class(OperationClass::BanKick).extended_total(1);
        assert_eq!(not_extended, DeadlineProfile::for_class(OperationClass::BanKick).operation_total);
    }
}
