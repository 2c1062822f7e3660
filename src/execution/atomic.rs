//! Two-leg atomic entry.
//!
//! "Atomic" here means: after this function returns, either both legs are
//! filled to the same base quantity, or net exposure is zero (possibly at a
//! rollback cost), or a rollback incident is recorded for the operator.
//! There is no fourth outcome. The returned `AtomicResult` is the single
//! authoritative event for Position creation.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AtomicConfig;
use crate::error::{ExecError, PreflightCheck, RollbackIncident, VenueError};
use crate::execution::hedge::{HedgeManager, HedgeRequest, OperationMode};
use crate::execution::order_executor::{ExecMode, OrderExecutor};
use crate::execution::ModeUsed;
use crate::market::{BookTickerCache, LiquidityAnalyzer, LiquidityVerdict};
use crate::models::{OrderStatus, Side};
use crate::venues::{round_qty_down, VenueAdapter};

/// One leg of an atomic order pair.
#[derive(Clone)]
pub struct AtomicOrderSpec {
    pub venue: Arc<dyn VenueAdapter>,
    pub symbol: String,
    pub side: Side,
    pub size_usd: Decimal,
    pub mode: ExecMode,
    /// Explicit base quantity; closing legs target the actual position
    /// quantity instead of `size_usd / mid`.
    pub qty_override: Option<Decimal>,
}

/// Final state of one leg after the atomic attempt.
#[derive(Debug, Clone)]
pub struct LegFill {
    pub venue: String,
    pub symbol: String,
    pub side: Side,
    pub requested_qty: Decimal,
    pub filled_qty: Decimal,
    pub avg_price: Decimal,
    pub fees_paid: Decimal,
    pub mode_used: Option<ModeUsed>,
}

impl LegFill {
    fn remaining(&self) -> Decimal {
        (self.requested_qty - self.filled_qty).max(Decimal::ZERO)
    }

    fn is_complete(&self, lot: Decimal) -> bool {
        self.requested_qty - self.filled_qty < lot.max(Decimal::new(1, 12))
    }
}

#[derive(Debug, Clone)]
pub struct AtomicResult {
    pub all_filled: bool,
    /// Neither leg filled at all; canceled cleanly, nothing to unwind.
    pub entry_rejected: bool,
    pub long: LegFill,
    pub short: LegFill,
    /// `min(max_leverage(a), max_leverage(b))`, applied where supported.
    pub leverage_used: u32,
    pub rollback_performed: bool,
    pub rollback_cost_usd: Decimal,
    pub incident: Option<RollbackIncident>,
}

impl AtomicResult {
    pub fn total_fees_usd(&self) -> Decimal {
        self.long.fees_paid + self.short.fees_paid
    }
}

pub struct AtomicMultiOrderExecutor {
    cache: Arc<BookTickerCache>,
    executor: OrderExecutor,
    hedge: HedgeManager,
    liquidity: LiquidityAnalyzer,
    config: AtomicConfig,
}

impl AtomicMultiOrderExecutor {
    pub fn new(
        cache: Arc<BookTickerCache>,
        executor: OrderExecutor,
        hedge: HedgeManager,
        liquidity: LiquidityAnalyzer,
        config: AtomicConfig,
    ) -> Self {
        Self {
            cache,
            executor,
            hedge,
            liquidity,
            config,
        }
    }

    /// Execute a delta-neutral pair. `operation` selects the hedge profile
    /// and, when `Closing`, makes every order reduce-only.
    pub async fn execute_atomic(
        &self,
        long: AtomicOrderSpec,
        short: AtomicOrderSpec,
        rollback_on_partial: bool,
        operation: OperationMode,
        cancel: &CancellationToken,
    ) -> Result<AtomicResult, ExecError> {
        if long.symbol != short.symbol {
            return Err(ExecError::InvalidPair(format!(
                "symbol mismatch: {} vs {}",
                long.symbol, short.symbol
            )));
        }
        if long.side == short.side {
            return Err(ExecError::InvalidPair(format!(
                "legs on the same side: {}",
                long.side.as_str()
            )));
        }
        if long.size_usd != short.size_usd {
            return Err(ExecError::InvalidPair(format!(
                "notional mismatch: {} vs {}",
                long.size_usd, short.size_usd
            )));
        }

        let symbol = long.symbol.clone();
        let reduce_only = operation == OperationMode::Closing;

        // Pre-flight 1: normalize leverage to the weaker venue.
        let leverage_used = if operation == OperationMode::Opening {
            self.normalize_leverage(&long.venue, &short.venue, &symbol)
                .await?
        } else {
            0
        };

        // Pre-flight 2: warm subscriptions on both books.
        let warmup = Duration::from_millis(self.config.warmup_ms);
        for leg in [&long, &short] {
            leg.venue.subscribe_book_ticker(&symbol).await.map_err(ExecError::Venue)?;
            if self
                .cache
                .wait_warm(leg.venue.name(), &symbol, warmup)
                .await
                .is_none()
            {
                return Err(ExecError::PreflightRejected {
                    venue: leg.venue.name().to_string(),
                    symbol: symbol.clone(),
                    check: PreflightCheck::Warmup,
                });
            }
        }

        // Pre-flight 3: liquidity gates on both legs.
        for leg in [&long, &short] {
            let report = self
                .liquidity
                .check(&leg.venue, &symbol, leg.side, leg.size_usd)
                .await
                .map_err(ExecError::Venue)?;
            if !report.recommendation.is_go() {
                let check = match report.recommendation {
                    LiquidityVerdict::InsufficientDepth => PreflightCheck::Depth,
                    LiquidityVerdict::UnacceptableSlippage => PreflightCheck::Slippage,
                    _ => PreflightCheck::Spread,
                };
                info!(
                    venue = leg.venue.name(),
                    symbol = %symbol,
                    ?check,
                    score = report.liquidity_score,
                    "pre-flight rejected"
                );
                return Err(ExecError::PreflightRejected {
                    venue: leg.venue.name().to_string(),
                    symbol: symbol.clone(),
                    check,
                });
            }
        }

        // Pre-flight 4: break-even price alignment across venues.
        let lot_long = long.venue.lot_size(&symbol).await.map_err(ExecError::Venue)?;
        let lot_short = short.venue.lot_size(&symbol).await.map_err(ExecError::Venue)?;
        let lot_coarse = lot_long.max(lot_short);

        let alignment = self.align_prices(&long, &short, &symbol).await?;
        let reference_mid = alignment
            .as_ref()
            .map(|a| a.anchor_mid)
            .unwrap_or_else(|| alignment_fallback_mid(&self.cache, &long, &short, &symbol));
        if reference_mid <= Decimal::ZERO {
            return Err(ExecError::PreflightRejected {
                venue: long.venue.name().to_string(),
                symbol: symbol.clone(),
                check: PreflightCheck::Warmup,
            });
        }
        let qty = round_qty_down(long.size_usd / reference_mid, lot_coarse);
        let qty_long = match long.qty_override {
            Some(q) => round_qty_down(q, lot_long),
            None => qty,
        };
        let qty_short = match short.qty_override {
            Some(q) => round_qty_down(q, lot_short),
            None => qty,
        };
        if qty_long <= Decimal::ZERO || qty_short <= Decimal::ZERO {
            return Err(ExecError::InvalidPair(format!(
                "size {} too small for lot {}",
                long.size_usd, lot_coarse
            )));
        }

        // Concurrent placement with a short first-round sub-timeout.
        let total_timeout = Duration::from_millis(self.executor.config().total_timeout_ms);
        let t1 = total_timeout.mul_f64(self.config.first_round_fraction);
        let (long_price, short_price) = match &alignment {
            Some(a) => (Some(a.long_price), Some(a.short_price)),
            None => (None, None),
        };

        let (long_first, short_first) = tokio::join!(
            self.place_first_round(&long, &symbol, qty_long, long_price, t1, reduce_only, cancel),
            self.place_first_round(&short, &symbol, qty_short, short_price, t1, reduce_only, cancel),
        );
        let mut long_fill = long_first?;
        let mut short_fill = short_first?;

        let long_done = long_fill.is_complete(lot_long);
        let short_done = short_fill.is_complete(lot_short);
        let no_fills =
            long_fill.filled_qty.is_zero() && short_fill.filled_qty.is_zero();

        if long_done && short_done {
            return Ok(self.success(long_fill, short_fill, leverage_used));
        }

        if no_fills {
            debug!(symbol = %symbol, "neither leg filled; entry rejected");
            return Ok(AtomicResult {
                all_filled: false,
                entry_rejected: true,
                long: long_fill,
                short: short_fill,
                leverage_used,
                rollback_performed: false,
                rollback_cost_usd: Decimal::ZERO,
                incident: None,
            });
        }

        // Exactly one leg complete: drive the other with the hedge machine,
        // targeting the filled leg's price for break-even entry.
        if long_done != short_done {
            let (trigger_price, lagging, lagging_spec) = if long_done {
                (long_fill.avg_price, &mut short_fill, &short)
            } else {
                (short_fill.avg_price, &mut long_fill, &long)
            };

            let hedge_request = HedgeRequest {
                symbol: symbol.clone(),
                side: lagging_spec.side,
                target_qty: lagging.remaining(),
                trigger_fill_price: trigger_price,
                mode: operation,
            };
            let hedged = self
                .hedge
                .drive(&lagging_spec.venue, &hedge_request, cancel)
                .await
                .map_err(ExecError::Venue)?;

            merge_fill(lagging, &hedged.filled_qty, hedged.avg_price, hedged.fees_paid);
            if hedged.mode_used.is_some() {
                lagging.mode_used = hedged.mode_used;
            }

            if long_fill.is_complete(lot_long) && short_fill.is_complete(lot_short) {
                return Ok(self.success(long_fill, short_fill, leverage_used));
            }
        }

        // Partial exposure remains. Either unwind it or report it raw.
        if !rollback_on_partial {
            return Ok(AtomicResult {
                all_filled: false,
                entry_rejected: false,
                long: long_fill,
                short: short_fill,
                leverage_used,
                rollback_performed: false,
                rollback_cost_usd: Decimal::ZERO,
                incident: None,
            });
        }

        warn!(
            symbol = %symbol,
            long_filled = %long_fill.filled_qty,
            short_filled = %short_fill.filled_qty,
            "atomic entry failed; rolling back filled legs"
        );
        let (rollback_cost_usd, incident) = self
            .rollback(&long, &long_fill, &short, &short_fill)
            .await;

        Ok(AtomicResult {
            all_filled: false,
            entry_rejected: false,
            long: long_fill,
            short: short_fill,
            leverage_used,
            rollback_performed: true,
            rollback_cost_usd,
            incident,
        })
    }

    fn success(&self, long: LegFill, short: LegFill, leverage_used: u32) -> AtomicResult {
        AtomicResult {
            all_filled: true,
            entry_rejected: false,
            long,
            short,
            leverage_used,
            rollback_performed: false,
            rollback_cost_usd: Decimal::ZERO,
            incident: None,
        }
    }

    /// `L = min(max_lev(a), max_lev(b))`; venues that cannot set
    /// account leverage are tolerated.
    async fn normalize_leverage(
        &self,
        venue_a: &Arc<dyn VenueAdapter>,
        venue_b: &Arc<dyn VenueAdapter>,
        symbol: &str,
    ) -> Result<u32, ExecError> {
        let lev_a = venue_a.max_leverage(symbol).await.map_err(ExecError::Venue)?;
        let lev_b = venue_b.max_leverage(symbol).await.map_err(ExecError::Venue)?;
        let leverage = lev_a.min(lev_b).max(1);

        for venue in [venue_a, venue_b] {
            match venue.set_account_leverage(symbol, leverage).await {
                Ok(()) => {}
                Err(VenueError::Unsupported(_)) => {
                    debug!(venue = venue.name(), symbol, "venue manages leverage account-wide");
                }
                Err(e) => return Err(ExecError::Venue(e)),
            }
        }
        Ok(leverage)
    }

    /// Propose aligned entry prices around the lower of the two mids so the
    /// pair enters at non-negative price divergence. Aborts (returns `None`)
    /// when the venues disagree on price beyond the bound or an aligned
    /// price would cross its local book.
    async fn align_prices(
        &self,
        long: &AtomicOrderSpec,
        short: &AtomicOrderSpec,
        symbol: &str,
    ) -> Result<Option<Alignment>, ExecError> {
        let quote_long = match self.cache.get(long.venue.name(), symbol) {
            Some(q) if !q.stale => q.ticker,
            _ => return Ok(None),
        };
        let quote_short = match self.cache.get(short.venue.name(), symbol) {
            Some(q) if !q.stale => q.ticker,
            _ => return Ok(None),
        };

        let mid_long = quote_long.mid();
        let mid_short = quote_short.mid();
        if mid_long <= Decimal::ZERO || mid_short <= Decimal::ZERO {
            return Ok(None);
        }

        let anchor_mid = mid_long.min(mid_short);
        let inter_spread = (mid_long - mid_short).abs();
        let spread_pct = inter_spread / anchor_mid * dec!(100);
        if spread_pct > self.config.max_alignment_spread_pct {
            debug!(
                symbol,
                spread_pct = %spread_pct,
                "inter-venue spread too wide for price alignment"
            );
            return Ok(None);
        }

        let tick_long = long.venue.tick_size(symbol).await.map_err(ExecError::Venue)?;
        let tick_short = short.venue.tick_size(symbol).await.map_err(ExecError::Venue)?;
        let tick_coarse = tick_long.max(tick_short);
        let offset_cap = tick_coarse * Decimal::from(self.config.max_alignment_offset_ticks);
        let offset = (inter_spread * dec!(0.25)).min(offset_cap);

        let long_price =
            crate::venues::round_toward_passive(anchor_mid - offset, tick_long, Side::Buy);
        let short_price =
            crate::venues::round_toward_passive(anchor_mid + offset, tick_short, Side::Sell);

        // Post-only feasibility on each local book.
        if long_price >= quote_long.ask || short_price <= quote_short.bid {
            debug!(symbol, "aligned price would cross a local book");
            return Ok(None);
        }

        Ok(Some(Alignment {
            long_price,
            short_price,
            anchor_mid,
        }))
    }

    /// First concurrent round for one leg: the aligned post-only limit when
    /// we have one, otherwise BBO-priced limit attempts, never market
    /// (unless the leg explicitly asks for market mode).
    #[allow(clippy::too_many_arguments)]
    async fn place_first_round(
        &self,
        leg: &AtomicOrderSpec,
        symbol: &str,
        qty: Decimal,
        aligned_price: Option<Decimal>,
        t1: Duration,
        reduce_only: bool,
        cancel: &CancellationToken,
    ) -> Result<LegFill, ExecError> {
        let mut fill = LegFill {
            venue: leg.venue.name().to_string(),
            symbol: symbol.to_string(),
            side: leg.side,
            requested_qty: qty,
            filled_qty: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            fees_paid: Decimal::ZERO,
            mode_used: None,
        };

        if leg.mode == ExecMode::MarketOnly {
            let outcome = self
                .executor
                .execute_with_timeout(
                    &leg.venue,
                    symbol,
                    leg.side,
                    qty,
                    ExecMode::MarketOnly,
                    reduce_only,
                    t1,
                    cancel,
                )
                .await
                .map_err(ExecError::Venue)?;
            merge_fill(&mut fill, &outcome.filled_qty, outcome.avg_price, outcome.fees_paid);
            fill.mode_used = outcome.mode_used;
            return Ok(fill);
        }

        if let Some(price) = aligned_price {
            match self
                .place_aligned_limit(leg, symbol, qty, price, t1, reduce_only, cancel)
                .await
            {
                Ok(Some(aligned_fill)) => return Ok(aligned_fill),
                Ok(None) => {
                    // Book moved; alignment abandoned for this leg.
                }
                Err(e) => return Err(e),
            }
        }

        let outcome = self
            .executor
            .execute_with_timeout(
                &leg.venue,
                symbol,
                leg.side,
                qty,
                ExecMode::LimitOnly,
                reduce_only,
                t1,
                cancel,
            )
            .await
            .map_err(ExecError::Venue)?;
        merge_fill(&mut fill, &outcome.filled_qty, outcome.avg_price, outcome.fees_paid);
        fill.mode_used = outcome.mode_used;
        Ok(fill)
    }

    /// One post-only limit at the aligned price, polled for `t1`.
    /// `Ok(None)` means the book moved and the price was rejected.
    #[allow(clippy::too_many_arguments)]
    async fn place_aligned_limit(
        &self,
        leg: &AtomicOrderSpec,
        symbol: &str,
        qty: Decimal,
        price: Decimal,
        t1: Duration,
        reduce_only: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<LegFill>, ExecError> {
        let placed = leg
            .venue
            .place_limit(crate::venues::LimitOrder {
                symbol: symbol.to_string(),
                side: leg.side,
                qty,
                price,
                post_only: true,
                reduce_only,
            })
            .await;

        let client_id = match placed {
            Ok(id) => id,
            Err(VenueError::PostOnlyReject) => return Ok(None),
            Err(e) => return Err(ExecError::Venue(e)),
        };

        let poll_interval = Duration::from_millis(self.executor.config().poll_interval_ms);
        let deadline = Instant::now() + t1;
        let mut order = leg
            .venue
            .order_status(&client_id)
            .await
            .map_err(ExecError::Venue)?;
        while !order.status.is_terminal()
            && Instant::now() < deadline
            && !cancel.is_cancelled()
        {
            tokio::time::sleep(poll_interval).await;
            order = leg
                .venue
                .order_status(&client_id)
                .await
                .map_err(ExecError::Venue)?;
        }

        if order.status != OrderStatus::Filled {
            leg.venue.cancel(&client_id).await.map_err(ExecError::Venue)?;
            order = leg
                .venue
                .order_status(&client_id)
                .await
                .map_err(ExecError::Venue)?;
        }

        Ok(Some(LegFill {
            venue: leg.venue.name().to_string(),
            symbol: symbol.to_string(),
            side: leg.side,
            requested_qty: qty,
            filled_qty: order.filled_qty,
            avg_price: order.avg_fill_price,
            fees_paid: order.fees_paid,
            mode_used: if order.filled_qty > Decimal::ZERO {
                Some(ModeUsed::InsideLimit)
            } else {
                None
            },
        }))
    }

    /// Compensating action: reduce-only market each filled leg back to
    /// zero. Deliberately not cancelable; it completes or escalates.
    async fn rollback(
        &self,
        long: &AtomicOrderSpec,
        long_fill: &LegFill,
        short: &AtomicOrderSpec,
        short_fill: &LegFill,
    ) -> (Decimal, Option<RollbackIncident>) {
        let mut cost = Decimal::ZERO;
        let mut incident: Option<RollbackIncident> = None;

        for (spec, fill) in [(long, long_fill), (short, short_fill)] {
            if fill.filled_qty <= Decimal::ZERO {
                continue;
            }
            match self.rollback_leg(spec, fill).await {
                Ok(leg_cost) => cost += leg_cost,
                Err(leg_incident) => {
                    error!(incident = %leg_incident, "ROLLBACK INCIDENT");
                    if incident.is_none() {
                        incident = Some(leg_incident);
                    }
                }
            }
        }

        (cost, incident)
    }

    async fn rollback_leg(
        &self,
        spec: &AtomicOrderSpec,
        fill: &LegFill,
    ) -> Result<Decimal, RollbackIncident> {
        let unwind_side = fill.side.opposite();
        let mut residual = fill.filled_qty;
        let mut cost = Decimal::ZERO;
        let mut last_error = String::new();
        let retries = self.config.rollback_retries.max(3);
        let poll_interval = Duration::from_millis(self.executor.config().poll_interval_ms);

        for attempt in 1..=retries {
            if residual <= Decimal::ZERO {
                break;
            }
            let placed = spec
                .venue
                .place_market(&fill.symbol, unwind_side, residual, true)
                .await;
            let client_id = match placed {
                Ok(id) => id,
                Err(e) => {
                    last_error = e.to_string();
                    warn!(
                        venue = spec.venue.name(),
                        symbol = %fill.symbol,
                        attempt,
                        error = %last_error,
                        "rollback placement failed"
                    );
                    tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                    continue;
                }
            };

            // Poll to terminal; market orders settle fast or not at all.
            let deadline = Instant::now() + Duration::from_secs(5);
            let mut order = match spec.venue.order_status(&client_id).await {
                Ok(o) => o,
                Err(e) => {
                    last_error = e.to_string();
                    continue;
                }
            };
            while !order.status.is_terminal() && Instant::now() < deadline {
                tokio::time::sleep(poll_interval).await;
                match spec.venue.order_status(&client_id).await {
                    Ok(o) => order = o,
                    Err(e) => {
                        last_error = e.to_string();
                        break;
                    }
                }
            }

            if order.filled_qty > Decimal::ZERO {
                // Realized loss of the round trip plus unwind fees.
                let entry_avg = fill.avg_price;
                let leg_loss = match fill.side {
                    Side::Buy => (entry_avg - order.avg_fill_price) * order.filled_qty,
                    Side::Sell => (order.avg_fill_price - entry_avg) * order.filled_qty,
                };
                cost += leg_loss + order.fees_paid;
                residual -= order.filled_qty;
            } else {
                last_error = format!("rollback order {} ended {:?}", client_id, order.status);
            }
        }

        if residual > Decimal::ZERO {
            return Err(RollbackIncident {
                venue: spec.venue.name().to_string(),
                symbol: fill.symbol.clone(),
                side: fill.side,
                residual_qty: residual,
                attempts: retries,
                last_error,
            });
        }

        info!(
            venue = spec.venue.name(),
            symbol = %fill.symbol,
            cost_usd = %cost,
            "rollback complete, net exposure restored to zero"
        );
        Ok(cost)
    }
}

struct Alignment {
    long_price: Decimal,
    short_price: Decimal,
    anchor_mid: Decimal,
}

fn alignment_fallback_mid(
    cache: &Arc<BookTickerCache>,
    long: &AtomicOrderSpec,
    short: &AtomicOrderSpec,
    symbol: &str,
) -> Decimal {
    let mid_long = cache
        .get(long.venue.name(), symbol)
        .map(|q| q.ticker.mid())
        .unwrap_or(Decimal::ZERO);
    let mid_short = cache
        .get(short.venue.name(), symbol)
        .map(|q| q.ticker.mid())
        .unwrap_or(Decimal::ZERO);
    if mid_long.is_zero() {
        return mid_short;
    }
    if mid_short.is_zero() {
        return mid_long;
    }
    mid_long.min(mid_short)
}

/// Fold an additional (possibly partial) fill into a leg, size-weighting
/// the average price.
fn merge_fill(leg: &mut LegFill, add_qty: &Decimal, add_price: Decimal, add_fees: Decimal) {
    if *add_qty <= Decimal::ZERO {
        leg.fees_paid += add_fees.max(Decimal::ZERO);
        return;
    }
    let total = leg.filled_qty + add_qty;
    if total > Decimal::ZERO {
        leg.avg_price =
            (leg.avg_price * leg.filled_qty + add_price * *add_qty) / total;
    }
    leg.filled_qty = total;
    leg.fees_paid += add_fees.max(Decimal::ZERO);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_fill_weights_prices() {
        let mut leg = LegFill {
            venue: "aster".into(),
            symbol: "BTC".into(),
            side: Side::Sell,
            requested_qty: dec!(0.05),
            filled_qty: dec!(0.02),
            avg_price: dec!(50000),
            fees_paid: dec!(0.2),
            mode_used: Some(ModeUsed::InsideLimit),
        };
        merge_fill(&mut leg, &dec!(0.03), dec!(50002), dec!(0.3));
        assert_eq!(leg.filled_qty, dec!(0.05));
        // (0.02*50000 + 0.03*50002) / 0.05 = 50001.2
        assert_eq!(leg.avg_price, dec!(50001.2));
        assert_eq!(leg.fees_paid, dec!(0.5));
    }

    #[test]
    fn test_leg_completion_tolerance() {
        let leg = LegFill {
            venue: "aster".into(),
            symbol: "BTC".into(),
            side: Side::Buy,
            requested_qty: dec!(0.0500),
            filled_qty: dec!(0.0495),
            avg_price: dec!(50000),
            fees_paid: Decimal::ZERO,
            mode_used: None,
        };
        // Within one lot of the request counts as complete.
        assert!(leg.is_complete(dec!(0.001)));
        assert!(!leg.is_complete(dec!(0.0001)));
    }
}
