//! Exit predicates.
//!
//! Evaluated in priority order with short-circuit: a funding flip beats
//! everything else, erosion beats age, age beats opportunity swapping.
//! Predicates are pure functions of `(position, context)`; the only state
//! in the evaluator is the better-opportunity hysteresis streak, which
//! exists so a single-tick APY blip cannot churn a position.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use uuid::Uuid;

use crate::config::RebalanceConfig;
use crate::models::{ExitReason, Opportunity, Position};

/// Everything a predicate may look at, gathered by the monitoring phase.
#[derive(Debug, Clone)]
pub struct ExitContext {
    pub now: DateTime<Utc>,
    /// Per-second divergence currently observable for the pair.
    pub current_divergence: Decimal,
    /// Best same-symbol opportunity on the market right now, if any.
    pub best_alternative: Option<Opportunity>,
    /// One round trip of fees for this position's venues and size.
    pub round_trip_cost_usd: Decimal,
}

pub struct RiskEvaluator {
    policy: RebalanceConfig,
    /// Consecutive better-opportunity hits per position.
    better_streaks: Mutex<HashMap<Uuid, u32>>,
}

impl RiskEvaluator {
    pub fn new(policy: RebalanceConfig) -> Self {
        Self {
            policy,
            better_streaks: Mutex::new(HashMap::new()),
        }
    }

    /// First matching predicate wins.
    pub fn evaluate(&self, position: &Position, ctx: &ExitContext) -> Option<ExitReason> {
        if self.funding_flip(ctx) {
            return Some(ExitReason::FundingFlip);
        }
        if self.profit_erosion(position, ctx) {
            return Some(ExitReason::ProfitErosion);
        }
        if self.time_limit(position, ctx) {
            return Some(ExitReason::TimeLimit);
        }
        if self.better_opportunity(position, ctx) {
            return Some(ExitReason::BetterOpportunity);
        }
        None
    }

    /// Forget hysteresis state for a position that no longer exists.
    pub fn forget(&self, position_id: Uuid) {
        self.better_streaks.lock().remove(&position_id);
    }

    /// Priority 1: the divergence inverted; the pair now pays funding.
    fn funding_flip(&self, ctx: &ExitContext) -> bool {
        ctx.current_divergence <= Decimal::ZERO
    }

    /// Priority 2: divergence decayed below the configured fraction of its
    /// entry value.
    fn profit_erosion(&self, position: &Position, ctx: &ExitContext) -> bool {
        if position.entry_divergence <= Decimal::ZERO {
            return false;
        }
        ctx.current_divergence / position.entry_divergence < self.policy.erosion_threshold
    }

    /// Priority 3: position has been on longer than the configured cap.
    fn time_limit(&self, position: &Position, ctx: &ExitContext) -> bool {
        position.age(ctx.now).num_hours() >= self.policy.max_age_hours
    }

    /// Priority 4 (optional): a strictly better same-symbol pair exists,
    /// net of the round trip it would cost to swap, persisting for the
    /// configured number of consecutive evaluations.
    fn better_opportunity(&self, position: &Position, ctx: &ExitContext) -> bool {
        if !self.policy.enable_better_opportunity {
            return false;
        }
        let Some(alternative) = &ctx.best_alternative else {
            self.better_streaks.lock().remove(&position.id);
            return false;
        };

        let realized_apy = position.realized_apy(ctx.now);
        let swap_cost_apy = if position.size_usd > Decimal::ZERO {
            ctx.round_trip_cost_usd / position.size_usd
        } else {
            Decimal::ZERO
        };
        let improves = alternative.net_apy
            > realized_apy + self.policy.min_improvement + swap_cost_apy;

        let mut streaks = self.better_streaks.lock();
        if !improves {
            streaks.remove(&position.id);
            return false;
        }
        let streak = streaks.entry(position.id).or_insert(0);
        *streak += 1;
        *streak >= self.policy.hysteresis_evals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PositionStatus;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn position(entry_divergence: Decimal, age_hours: i64) -> Position {
        let now = Utc::now();
        Position {
            id: Uuid::new_v4(),
            symbol: "BTC".into(),
            long_venue: "aster".into(),
            short_venue: "lighter".into(),
            size_usd: dec!(1000),
            entry_long_price: dec!(50000),
            entry_short_price: dec!(50001),
            entry_long_rate: Decimal::ZERO,
            entry_short_rate: entry_divergence,
            entry_divergence,
            current_divergence: None,
            cumulative_funding_usd: Decimal::ZERO,
            total_fees_usd: Decimal::ZERO,
            status: PositionStatus::Open,
            exit_reason: None,
            opened_at: now - Duration::hours(age_hours),
            last_check_at: None,
            closed_at: None,
            realized_pnl_usd: None,
        }
    }

    fn ctx(current_divergence: Decimal) -> ExitContext {
        ExitContext {
            now: Utc::now(),
            current_divergence,
            best_alternative: None,
            round_trip_cost_usd: dec!(0.8),
        }
    }

    fn evaluator(enable_better: bool) -> RiskEvaluator {
        RiskEvaluator::new(RebalanceConfig {
            enable_better_opportunity: enable_better,
            ..RebalanceConfig::default()
        })
    }

    #[test]
    fn test_funding_flip_is_priority_one() {
        let eval = evaluator(false);
        // Aged out AND eroded AND flipped: flip wins.
        let p = position(dec!(0.0000001), 200);
        let got = eval.evaluate(&p, &ctx(dec!(-0.00000002)));
        assert_eq!(got, Some(ExitReason::FundingFlip));
    }

    #[test]
    fn test_profit_erosion() {
        let eval = evaluator(false);
        let p = position(dec!(0.0000001), 1);
        // 40% of entry: below the 0.5 threshold.
        assert_eq!(
            eval.evaluate(&p, &ctx(dec!(0.00000004))),
            Some(ExitReason::ProfitErosion)
        );
        // 60% of entry: healthy.
        assert_eq!(eval.evaluate(&p, &ctx(dec!(0.00000006))), None);
    }

    #[test]
    fn test_time_limit() {
        let eval = evaluator(false);
        let healthy = ctx(dec!(0.0000001));
        assert_eq!(
            eval.evaluate(&position(dec!(0.0000001), 168), &healthy),
            Some(ExitReason::TimeLimit)
        );
        assert_eq!(
            eval.evaluate(&position(dec!(0.0000001), 167), &healthy),
            None
        );
    }

    #[test]
    fn test_better_opportunity_needs_hysteresis() {
        let eval = evaluator(true);
        let p = position(dec!(0.0000001), 1);

        let alternative = Opportunity {
            symbol: "BTC".into(),
            long_venue: "aster".into(),
            short_venue: "lighter".into(),
            long_rate: Decimal::ZERO,
            short_rate: dec!(0.000001),
            divergence: dec!(0.000001),
            net_apy: dec!(0.30),
            long_oi_usd: dec!(1000000),
            short_oi_usd: dec!(1000000),
            min_volume_24h_usd: dec!(500000),
            observed_at: Utc::now(),
        };
        let mut context = ctx(dec!(0.0000001));
        context.best_alternative = Some(alternative);

        // First sighting arms the streak, second fires.
        assert_eq!(eval.evaluate(&p, &context), None);
        assert_eq!(
            eval.evaluate(&p, &context),
            Some(ExitReason::BetterOpportunity)
        );
    }

    #[test]
    fn test_better_opportunity_streak_resets() {
        let eval = evaluator(true);
        let p = position(dec!(0.0000001), 1);

        let alternative = Opportunity {
            symbol: "BTC".into(),
            long_venue: "aster".into(),
            short_venue: "lighter".into(),
            long_rate: Decimal::ZERO,
            short_rate: dec!(0.000001),
            divergence: dec!(0.000001),
            net_apy: dec!(0.30),
            long_oi_usd: dec!(1000000),
            short_oi_usd: dec!(1000000),
            min_volume_24h_usd: dec!(500000),
            observed_at: Utc::now(),
        };
        let mut with_alt = ctx(dec!(0.0000001));
        with_alt.best_alternative = Some(alternative);
        let without_alt = ctx(dec!(0.0000001));

        assert_eq!(eval.evaluate(&p, &with_alt), None);
        // The improvement vanishes for one evaluation: streak resets.
        assert_eq!(eval.evaluate(&p, &without_alt), None);
        assert_eq!(eval.evaluate(&p, &with_alt), None);
        assert_eq!(
            eval.evaluate(&p, &with_alt),
            Some(ExitReason::BetterOpportunity)
        );
    }

    #[test]
    fn test_marginal_improvement_does_not_fire() {
        let eval = evaluator(true);
        let p = position(dec!(0.0000001), 1);

        // APY barely above the position's realized APY: inside the
        // min_improvement + swap-cost band.
        let alternative = Opportunity {
            symbol: "BTC".into(),
            long_venue: "aster".into(),
            short_venue: "lighter".into(),
            long_rate: Decimal::ZERO,
            short_rate: dec!(0.000001),
            divergence: dec!(0.000001),
            net_apy: dec!(0.0015),
            long_oi_usd: dec!(1000000),
            short_oi_usd: dec!(1000000),
            min_volume_24h_usd: dec!(500000),
            observed_at: Utc::now(),
        };
        let mut context = ctx(dec!(0.0000001));
        context.best_alternative = Some(alternative);

        assert_eq!(eval.evaluate(&p, &context), None);
        assert_eq!(eval.evaluate(&p, &context), None);
        assert_eq!(eval.evaluate(&p, &context), None);
    }
}
