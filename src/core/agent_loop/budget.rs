use std::time::Duration;

use crate::config::BudgetConfig;
use crate::core::error::{BudgetKind, RunFailure};
use crate::core::store::RunCounters;
use crate::core::version::BudgetOverrides;

/// Effective ceilings for one run: the daemon defaults overlaid with the version's overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct Budget {
    pub max_turns: u32,
    pub max_wall_clock: Duration,
    pub max_total_tokens: Option<u64>,
    pub max_cost_usd: Option<f64>,
}

impl Budget {
    pub fn resolve(defaults: &BudgetConfig, overrides: &BudgetOverrides) -> Self {
        Self {
            max_turns: overrides.max_turns.unwrap_or(defaults.max_turns).max(1),
            max_wall_clock: Duration::from_secs(
                overrides
                    .max_wall_clock_secs
                    .unwrap_or(defaults.max_wall_clock_secs),
            ),
            max_total_tokens: overrides.max_total_tokens.or(defaults.max_total_tokens),
            max_cost_usd: overrides.max_cost_usd.or(defaults.max_cost_usd),
        }
    }

    /// Checked before each round. `elapsed` includes time spent by earlier attempts of the run.
    pub fn check(&self, counters: &RunCounters, elapsed: Duration) -> Result<(), RunFailure> {
        if counters.turns >= self.max_turns {
            return Err(RunFailure::BudgetExceeded {
                kind: BudgetKind::Turns,
                limit: self.max_turns.to_string(),
            });
        }
        if !self.max_wall_clock.is_zero() && elapsed >= self.max_wall_clock {
            return Err(RunFailure::BudgetExceeded {
                kind: BudgetKind::WallClock,
                limit: format!("{}s", self.max_wall_clock.as_secs()),
            });
        }
        if let Some(max) = self.max_total_tokens
            && counters.total_tokens() >= max
        {
            return Err(RunFailure::BudgetExceeded {
                kind: BudgetKind::Tokens,
                limit: max.to_string(),
            });
        }
        if let Some(max) = self.max_cost_usd
            && counters.cost_usd >= max
        {
            return Err(RunFailure::BudgetExceeded {
                kind: BudgetKind::Cost,
                limit: format!("${:.4}", max),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> BudgetConfig {
        BudgetConfig {
            max_turns: 10,
            max_wall_clock_secs: 60,
            max_total_tokens: Some(1_000),
            max_cost_usd: None,
        }
    }

    #[test]
    fn overrides_win_over_defaults() {
        let budget = Budget::resolve(
            &defaults(),
            &BudgetOverrides {
                max_turns: Some(2),
                max_cost_usd: Some(0.5),
                ..Default::default()
            },
        );
        assert_eq!(budget.max_turns, 2);
        assert_eq!(budget.max_total_tokens, Some(1_000));
        assert_eq!(budget.max_cost_usd, Some(0.5));
    }

    #[test]
    fn each_ceiling_reports_its_kind() {
        let budget = Budget::resolve(&defaults(), &BudgetOverrides {
            max_cost_usd: Some(0.01),
            ..Default::default()
        });
        let kind_of = |counters: RunCounters, elapsed: u64| match budget
            .check(&counters, Duration::from_secs(elapsed))
        {
            Err(RunFailure::BudgetExceeded { kind, .. }) => Some(kind),
            _ => None,
        };

        assert_eq!(kind_of(RunCounters::default(), 0), None);
        assert_eq!(
            kind_of(RunCounters { turns: 10, ..Default::default() }, 0),
            Some(BudgetKind::Turns)
        );
        assert_eq!(kind_of(RunCounters::default(), 61), Some(BudgetKind::WallClock));
        assert_eq!(
            kind_of(
                RunCounters {
                    input_tokens: 900,
                    output_tokens: 100,
                    ..Default::default()
                },
                0
            ),
            Some(BudgetKind::Tokens)
        );
        assert_eq!(
            kind_of(RunCounters { cost_usd: 0.02, ..Default::default() }, 0),
            Some(BudgetKind::Cost)
        );
    }
}
