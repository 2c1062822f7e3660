//! Per-venue fee schedules and round-trip cost.
//!
//! Pure computation: a profitable divergence on paper must survive four
//! fee events (entry and exit on each leg) in reality. The default liquidity
//! assumption is taker on every fill, the conservative upper bound; callers
//! that expect limit-first execution to rest as maker may override.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;

use crate::models::VenueSpec;

/// Which side of the fee schedule to assume for a fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssumedLiquidity {
    Maker,
    Taker,
}

#[derive(Debug, Clone, Copy)]
struct FeeSchedule {
    maker: Decimal,
    taker: Decimal,
}

/// Immutable after construction; shared by reference.
#[derive(Debug, Clone)]
pub struct FeeModel {
    venues: HashMap<String, FeeSchedule>,
}

impl FeeModel {
    pub fn from_specs(specs: &[VenueSpec]) -> Self {
        let venues = specs
            .iter()
            .map(|s| {
                (
                    s.name.clone(),
                    FeeSchedule {
                        maker: s.maker_fee,
                        taker: s.taker_fee,
                    },
                )
            })
            .collect();
        Self { venues }
    }

    /// Fee fraction for one fill on `venue`. Unknown venues get `None`;
    /// callers must treat that as an exclusion, not a free trade.
    pub fn fee(&self, venue: &str, liquidity: AssumedLiquidity) -> Option<Decimal> {
        let schedule = self.venues.get(venue)?;
        Some(match liquidity {
            AssumedLiquidity::Maker => schedule.maker,
            AssumedLiquidity::Taker => schedule.taker,
        })
    }

    /// Cost of one fill of `size_usd` notional on `venue`.
    pub fn fill_cost_usd(
        &self,
        venue: &str,
        size_usd: Decimal,
        liquidity: AssumedLiquidity,
    ) -> Option<Decimal> {
        Some(size_usd * self.fee(venue, liquidity)?)
    }

    /// Entry plus exit on both legs: `size × (fee(a) + fee(b)) × 2`.
    pub fn round_trip_cost_usd(
        &self,
        venue_a: &str,
        venue_b: &str,
        size_usd: Decimal,
        liquidity: AssumedLiquidity,
    ) -> Option<Decimal> {
        let total_rate = self.fee(venue_a, liquidity)? + self.fee(venue_b, liquidity)?;
        Some(size_usd * total_rate * dec!(2))
    }

    /// Entry half only (one fill per leg).
    pub fn entry_cost_usd(
        &self,
        venue_a: &str,
        venue_b: &str,
        size_usd: Decimal,
        liquidity: AssumedLiquidity,
    ) -> Option<Decimal> {
        let total_rate = self.fee(venue_a, liquidity)? + self.fee(venue_b, liquidity)?;
        Some(size_usd * total_rate)
    }
}
