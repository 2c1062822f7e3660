//! Funding-rate normalization and opportunity ranking.
//!
//! Venues quote funding per interval (1h on some, 8h on others); nothing is
//! comparable until everything is per-second. Orientation is mechanical:
//! the venue with the higher normalized rate is shorted (it pays us), the
//! lower one is longed.

use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::warn;

use crate::market::{AssumedLiquidity, FeeModel};
use crate::models::{Opportunity, VenueSpec};

pub const SECONDS_PER_YEAR: i64 = 365 * 86_400;

/// Output of `best_pair`: an oriented venue pair with its net APY.
#[derive(Debug, Clone, PartialEq)]
pub struct PairQuote {
    pub long_venue: String,
    pub short_venue: String,
    /// Per-second normalized rates.
    pub long_rate: Decimal,
    pub short_rate: Decimal,
    pub divergence: Decimal,
    /// Fraction per year, net of a full round trip of fees.
    pub net_apy: Decimal,
}

pub struct FundingAnalyzer {
    fees: FeeModel,
    intervals: HashMap<String, u64>,
}

impl FundingAnalyzer {
    pub fn new(fees: FeeModel, specs: &[VenueSpec]) -> Self {
        let intervals = specs
            .iter()
            .map(|s| (s.name.clone(), s.funding_interval_secs))
            .collect();
        Self { fees, intervals }
    }

    /// Per-second rate, or `None` for a venue with an unknown interval.
    pub fn normalize(&self, venue: &str, rate: Decimal) -> Option<Decimal> {
        let interval = *self.intervals.get(venue)?;
        if interval == 0 {
            return None;
        }
        Some(rate / Decimal::from(interval))
    }

    /// Annualized USD profit of holding the pair at `size_usd`, minus a
    /// full round trip of taker fees. Rates are raw per-interval.
    pub fn net_profitability(
        &self,
        venue_a: &str,
        rate_a: Decimal,
        venue_b: &str,
        rate_b: Decimal,
        size_usd: Decimal,
    ) -> Option<Decimal> {
        let per_sec_a = self.normalize(venue_a, rate_a)?;
        let per_sec_b = self.normalize(venue_b, rate_b)?;
        let divergence = (per_sec_a - per_sec_b).abs();
        let gross = divergence * Decimal::from(SECONDS_PER_YEAR) * size_usd;
        let cost =
            self.fees
                .round_trip_cost_usd(venue_a, venue_b, size_usd, AssumedLiquidity::Taker)?;
        Some(gross - cost)
    }

    /// Orient the best long/short pair for `symbol` from raw per-interval
    /// rates. Venues with unknown intervals are excluded; a pair whose net
    /// APY is not positive is excluded.
    pub fn best_pair(
        &self,
        symbol: &str,
        rates: &HashMap<String, Decimal>,
        size_usd: Decimal,
    ) -> Option<PairQuote> {
        let mut normalized: Vec<(String, Decimal)> = Vec::with_capacity(rates.len());
        for (venue, rate) in rates {
            match self.normalize(venue, *rate) {
                Some(per_sec) => normalized.push((venue.clone(), per_sec)),
                None => {
                    warn!(venue = %venue, symbol, "excluding venue with unknown funding interval");
                }
            }
        }
        if normalized.len() < 2 {
            return None;
        }

        // Higher normalized rate is the short side (it receives funding).
        normalized.sort_by(|a, b| a.1.cmp(&b.1));
        let (long_venue, long_rate) = normalized.first().cloned()?;
        let (short_venue, short_rate) = normalized.last().cloned()?;
        let divergence = short_rate - long_rate;
        if divergence <= Decimal::ZERO {
            return None;
        }

        let gross = divergence * Decimal::from(SECONDS_PER_YEAR) * size_usd;
        let cost = self.fees.round_trip_cost_usd(
            &long_venue,
            &short_venue,
            size_usd,
            AssumedLiquidity::Taker,
        )?;
        let net = gross - cost;
        if net <= Decimal::ZERO || size_usd.is_zero() {
            return None;
        }

        Some(PairQuote {
            long_venue,
            short_venue,
            long_rate,
            short_rate,
            divergence,
            net_apy: net / size_usd,
        })
    }

    /// Sort by net APY descending, then minimum 24h volume descending,
    /// then symbol, so ranking is total and stable across runs.
    pub fn rank(&self, mut opportunities: Vec<Opportunity>) -> Vec<Opportunity> {
        opportunities.sort_by(|a, b| {
            b.net_apy
                .cmp(&a.net_apy)
                .then(b.min_volume_24h_usd.cmp(&a.min_volume_24h_usd))
                .then(a.symbol.cmp(&b.symbol))
        });
        opportunities
    }
}
