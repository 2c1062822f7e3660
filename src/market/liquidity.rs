//! Pre-flight liquidity feasibility.
//!
//! Walks the order book from the touch consuming the requested notional and
//! reports expected slippage, spread and a blended liquidity score. Venues
//! that only expose top-of-book get a conservative BBO-only estimate.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::debug;

use crate::config::LiquidityConfig;
use crate::error::VenueError;
use crate::models::{BookLevel, Side};
use crate::venues::VenueAdapter;

const BOOK_DEPTH: usize = 50;

/// What the analyzer recommends for this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiquidityVerdict {
    ProceedLimit,
    ProceedMarket,
    InsufficientDepth,
    WideSpread,
    UnacceptableSlippage,
}

impl LiquidityVerdict {
    /// Whether the entry may go ahead at all.
    pub fn is_go(&self) -> bool {
        matches!(
            self,
            LiquidityVerdict::ProceedLimit | LiquidityVerdict::ProceedMarket
        )
    }
}

#[derive(Debug, Clone)]
pub struct LiquidityReport {
    pub depth_ok: bool,
    /// Volume-weighted fill deviation from mid, percent (0.1 = 0.1%).
    pub expected_slippage_pct: Decimal,
    pub spread_bps: Decimal,
    /// Blend of depth adequacy and spread tightness, in [0, 1].
    pub liquidity_score: f64,
    pub recommendation: LiquidityVerdict,
}

pub struct LiquidityAnalyzer {
    policy: LiquidityConfig,
}

impl LiquidityAnalyzer {
    pub fn new(policy: LiquidityConfig) -> Self {
        Self { policy }
    }

    pub async fn check(
        &self,
        venue: &Arc<dyn VenueAdapter>,
        symbol: &str,
        side: Side,
        size_usd: Decimal,
    ) -> Result<LiquidityReport, VenueError> {
        let ticker = venue.best_bid_ask(symbol).await?;
        let mid = ticker.mid();
        if mid <= Decimal::ZERO {
            return Ok(self.no_depth_report(Decimal::ZERO));
        }
        let spread_bps = ticker.spread_bps();

        if !venue.spec().has_full_depth {
            // Top-of-book only: no walk possible, market orders only and
            // only behind a tight spread.
            let spread_score = self.spread_score(spread_bps);
            let recommendation = if spread_bps <= self.policy.max_spread_bps {
                LiquidityVerdict::ProceedMarket
            } else {
                LiquidityVerdict::WideSpread
            };
            debug!(
                venue = venue.name(),
                symbol,
                spread_bps = %spread_bps,
                ?recommendation,
                "BBO-only liquidity estimate"
            );
            return Ok(LiquidityReport {
                depth_ok: true,
                expected_slippage_pct: spread_bps / dec!(200), // half-spread as pct
                spread_bps,
                liquidity_score: spread_score,
                recommendation,
            });
        }

        let book = venue.order_book(symbol, BOOK_DEPTH).await?;
        let levels = match side {
            Side::Buy => &book.asks,
            Side::Sell => &book.bids,
        };

        let walk = walk_book(levels, size_usd);
        let (depth_ok, vwap) = match walk {
            Some(vwap) => (true, vwap),
            None => (false, Decimal::ZERO),
        };

        let expected_slippage_pct = if depth_ok {
            ((vwap - mid) / mid * dec!(100)).abs()
        } else {
            // Whole visible book consumed: treat as unbounded.
            dec!(100)
        };

        let depth_score = depth_score(levels, size_usd);
        let spread_score = self.spread_score(spread_bps);
        let liquidity_score = 0.6 * depth_score + 0.4 * spread_score;

        let recommendation = if !depth_ok {
            LiquidityVerdict::InsufficientDepth
        } else if spread_bps > self.policy.max_spread_bps {
            LiquidityVerdict::WideSpread
        } else if expected_slippage_pct > self.policy.max_slippage_pct {
            LiquidityVerdict::UnacceptableSlippage
        } else if liquidity_score >= self.policy.min_liquidity_score {
            LiquidityVerdict::ProceedLimit
        } else {
            LiquidityVerdict::ProceedMarket
        };

        Ok(LiquidityReport {
            depth_ok,
            expected_slippage_pct,
            spread_bps,
            liquidity_score,
            recommendation,
        })
    }

    fn spread_score(&self, spread_bps: Decimal) -> f64 {
        if self.policy.max_spread_bps <= Decimal::ZERO {
            return 0.0;
        }
        let ratio = (spread_bps / self.policy.max_spread_bps)
            .to_f64()
            .unwrap_or(1.0);
        (1.0 - ratio).clamp(0.0, 1.0)
    }

    fn no_depth_report(&self, spread_bps: Decimal) -> LiquidityReport {
        LiquidityReport {
            depth_ok: false,
            expected_slippage_pct: dec!(100),
            spread_bps,
            liquidity_score: 0.0,
            recommendation: LiquidityVerdict::InsufficientDepth,
        }
    }
}

/// Consume `size_usd` notional from the touch; returns the VWAP or `None`
/// when the visible book is exhausted first.
fn walk_book(levels: &[BookLevel], size_usd: Decimal) -> Option<Decimal> {
    let mut remaining_usd = size_usd;
    let mut filled_base = Decimal::ZERO;
    let mut cost = Decimal::ZERO;

    for level in levels {
        if remaining_usd <= Decimal::ZERO {
            break;
        }
        if level.price <= Decimal::ZERO {
            continue;
        }
        let level_usd = level.price * level.qty;
        let take_usd = remaining_usd.min(level_usd);
        let take_base = take_usd / level.price;
        filled_base += take_base;
        cost += take_usd;
        remaining_usd -= take_usd;
    }

    if remaining_usd > Decimal::ZERO || filled_base.is_zero() {
        return None;
    }
    Some(cost / filled_base)
}

/// Notional available within the walked depth relative to twice the order
/// size, clamped to [0, 1]. Twice: one order should not be half the book.
fn depth_score(levels: &[BookLevel], size_usd: Decimal) -> f64 {
    if size_usd <= Decimal::ZERO {
        return 1.0;
    }
    let available: Decimal = levels.iter().map(|l| l.price * l.qty).sum();
    let ratio = (available / (size_usd * dec!(2))).to_f64().unwrap_or(0.0);
    ratio.clamp(0.0, 1.0)
}
