//! Single-order tiered execution.
//!
//! Limit-first with a market fallback: post-only one tick inside the spread
//! while retries last, at the touch after that, market for whatever is left
//! when the budget runs out. Pricing only ever uses a live BBO; a cache hit
//! older than the staleness limit forces a venue refresh.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::OrderConfig;
use crate::error::VenueError;
use crate::execution::ModeUsed;
use crate::market::BookTickerCache;
use crate::models::{BookTicker, OrderStatus, Side, TrackedOrder};
use crate::venues::{round_qty_down, round_toward_passive, LimitOrder, VenueAdapter};

/// Placement strategy for one order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    LimitOnly,
    LimitWithFallback,
    MarketOnly,
}

/// What actually happened; partial fills are data, not errors.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub requested_qty: Decimal,
    pub filled_qty: Decimal,
    pub avg_price: Decimal,
    pub fees_paid: Decimal,
    pub mode_used: Option<ModeUsed>,
    /// Percent vs the reference mid at start; positive is adverse.
    pub slippage_pct: Decimal,
}

impl ExecOutcome {
    pub fn is_complete(&self, lot: Decimal) -> bool {
        self.requested_qty - self.filled_qty < lot.max(Decimal::new(1, 12))
    }
}

/// Running fill accumulator across attempts of one logical order.
#[derive(Debug, Default)]
struct FillAccum {
    filled: Decimal,
    cost: Decimal,
    fees: Decimal,
}

/// Per-venue-order high-water marks, so cumulative reports are only
/// counted once.
#[derive(Debug, Default)]
struct OrderCounted {
    qty: Decimal,
    fees: Decimal,
}

impl FillAccum {
    /// Absorb the cumulative state of one venue order, given what we had
    /// already counted from it. Safe to call repeatedly on the same order.
    fn absorb(&mut self, order: &TrackedOrder, counted: &mut OrderCounted) {
        let qty_delta = order.filled_qty - counted.qty;
        if qty_delta > Decimal::ZERO {
            self.filled += qty_delta;
            self.cost += qty_delta * order.avg_fill_price;
            counted.qty = order.filled_qty;
        }
        let fee_delta = order.fees_paid - counted.fees;
        if fee_delta > Decimal::ZERO {
            self.fees += fee_delta;
            counted.fees = order.fees_paid;
        }
    }

    fn avg_price(&self) -> Decimal {
        if self.filled.is_zero() {
            Decimal::ZERO
        } else {
            self.cost / self.filled
        }
    }
}

pub struct OrderExecutor {
    cache: Arc<BookTickerCache>,
    config: OrderConfig,
}

impl OrderExecutor {
    pub fn new(cache: Arc<BookTickerCache>, config: OrderConfig) -> Self {
        Self { cache, config }
    }

    pub fn config(&self) -> &OrderConfig {
        &self.config
    }

    /// Live BBO: the cache when fresh, otherwise a venue round trip (the
    /// adapter is responsible for refreshing or erroring on staleness).
    pub async fn live_bbo(
        &self,
        venue: &Arc<dyn VenueAdapter>,
        symbol: &str,
    ) -> Result<BookTicker, VenueError> {
        if let Some(quote) = self.cache.get(venue.name(), symbol) {
            if !quote.stale {
                return Ok(quote.ticker);
            }
        }
        venue.best_bid_ask(symbol).await
    }

    /// Drive one order of `qty` base units to completion.
    pub async fn execute(
        &self,
        venue: &Arc<dyn VenueAdapter>,
        symbol: &str,
        side: Side,
        qty: Decimal,
        mode: ExecMode,
        reduce_only: bool,
        cancel: &CancellationToken,
    ) -> Result<ExecOutcome, VenueError> {
        self.execute_with_timeout(
            venue,
            symbol,
            side,
            qty,
            mode,
            reduce_only,
            Duration::from_millis(self.config.total_timeout_ms),
            cancel,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn execute_with_timeout(
        &self,
        venue: &Arc<dyn VenueAdapter>,
        symbol: &str,
        side: Side,
        qty: Decimal,
        mode: ExecMode,
        reduce_only: bool,
        total_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecOutcome, VenueError> {
        let tick = venue.tick_size(symbol).await?;
        let lot = venue.lot_size(symbol).await?;
        let reference_mid = self.live_bbo(venue, symbol).await?.mid();

        let deadline = Instant::now() + total_timeout;
        let attempt_timeout = total_timeout / self.config.max_attempts.max(1);
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        let mut accum = FillAccum::default();
        let mut mode_used: Option<ModeUsed> = None;
        let mut remaining = round_qty_down(qty, lot);

        if mode != ExecMode::MarketOnly {
            let mut attempt: u32 = 0;
            while attempt < self.config.max_attempts
                && remaining >= lot
                && Instant::now() < deadline
                && !cancel.is_cancelled()
            {
                let bbo = self.live_bbo(venue, symbol).await?;
                let inside = attempt < self.config.inside_tick_retries;
                let raw_price = match (side, inside) {
                    (Side::Buy, true) => bbo.ask - tick,
                    (Side::Buy, false) => bbo.ask,
                    (Side::Sell, true) => bbo.bid + tick,
                    (Side::Sell, false) => bbo.bid,
                };
                let price = round_toward_passive(raw_price, tick, side);

                let placed = venue
                    .place_limit(LimitOrder {
                        symbol: symbol.to_string(),
                        side,
                        qty: remaining,
                        price,
                        post_only: inside,
                        reduce_only,
                    })
                    .await;

                let client_id = match placed {
                    Ok(id) => id,
                    Err(VenueError::PostOnlyReject) => {
                        debug!(venue = venue.name(), symbol, attempt, "post-only reject, re-pricing");
                        attempt += 1;
                        continue;
                    }
                    Err(e) if e.is_transient() => {
                        warn!(venue = venue.name(), symbol, error = %e, "transient placement error");
                        tokio::time::sleep(poll_interval).await;
                        attempt += 1;
                        continue;
                    }
                    Err(e) => return Err(e),
                };

                let sub_deadline = (Instant::now() + attempt_timeout).min(deadline);
                let mut counted = OrderCounted::default();
                let order = self
                    .poll_order(venue, &client_id, sub_deadline, poll_interval, cancel)
                    .await?;
                accum.absorb(&order, &mut counted);

                if order.status == OrderStatus::Filled {
                    remaining = round_qty_down(qty - accum.filled, lot);
                    mode_used = Some(if inside {
                        ModeUsed::InsideLimit
                    } else {
                        ModeUsed::TouchLimit
                    });
                    if remaining < lot {
                        break;
                    }
                } else {
                    // Sub-timeout, rejection or cancellation: take down the
                    // remainder and carry partial fills forward.
                    venue.cancel(&client_id).await?;
                    let settled = venue.order_status(&client_id).await?;
                    accum.absorb(&settled, &mut counted);
                    remaining = round_qty_down(qty - accum.filled, lot);
                    if accum.filled > Decimal::ZERO && mode_used.is_none() {
                        mode_used = Some(if inside {
                            ModeUsed::InsideLimit
                        } else {
                            ModeUsed::TouchLimit
                        });
                    }
                }

                attempt += 1;
            }
        }

        // Terminal market fallback for whatever is left.
        let market_allowed = matches!(mode, ExecMode::MarketOnly | ExecMode::LimitWithFallback);
        if market_allowed && remaining >= lot && !cancel.is_cancelled() {
            let client_id = venue
                .place_market(symbol, side, remaining, reduce_only)
                .await?;
            let sub_deadline = Instant::now() + attempt_timeout.max(Duration::from_millis(500));
            let mut counted = OrderCounted::default();
            let order = self
                .poll_order(venue, &client_id, sub_deadline, poll_interval, cancel)
                .await?;
            accum.absorb(&order, &mut counted);
            if order.filled_qty > Decimal::ZERO {
                mode_used = Some(ModeUsed::Market);
            }
        }

        let avg_price = accum.avg_price();
        let slippage_pct = signed_slippage_pct(side, avg_price, reference_mid);

        Ok(ExecOutcome {
            requested_qty: qty,
            filled_qty: accum.filled,
            avg_price,
            fees_paid: accum.fees,
            mode_used,
            slippage_pct,
        })
    }

    /// Poll until the order is terminal, the deadline passes or the token
    /// trips. Returns the last observed state.
    async fn poll_order(
        &self,
        venue: &Arc<dyn VenueAdapter>,
        client_id: &str,
        deadline: Instant,
        poll_interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<TrackedOrder, VenueError> {
        loop {
            let order = venue.order_status(client_id).await?;
            if order.status.is_terminal() {
                return Ok(order);
            }
            if Instant::now() >= deadline || cancel.is_cancelled() {
                return Ok(order);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

/// Percent deviation of the achieved price from the reference mid, signed
/// so that positive is always adverse for the trader.
pub fn signed_slippage_pct(side: Side, avg_price: Decimal, reference_mid: Decimal) -> Decimal {
    if reference_mid.is_zero() || avg_price.is_zero() {
        return Decimal::ZERO;
    }
    match side {
        Side::Buy => (avg_price - reference_mid) / reference_mid * dec!(100),
        Side::Sell => (reference_mid - avg_price) / reference_mid * dec!(100),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VenueSpec;
    use crate::venues::mock::{LimitBehavior, MockVenue};

    fn spec(name: &str) -> VenueSpec {
        VenueSpec {
            name: name.to_string(),
            funding_interval_secs: 3600,
            maker_fee: dec!(0.0002),
            taker_fee: dec!(0.0005),
            supports_account_leverage: true,
            has_full_depth: true,
        }
    }

    fn setup() -> (Arc<BookTickerCache>, OrderExecutor, Arc<MockVenue>) {
        let cache = Arc::new(BookTickerCache::default());
        let executor = OrderExecutor::new(
            cache.clone(),
            OrderConfig {
                total_timeout_ms: 2_000,
                inside_tick_retries: 2,
                max_attempts: 4,
                poll_interval_ms: 50,
                staleness_limit_ms: 2_000,
            },
        );
        let venue = Arc::new(MockVenue::new(spec("lighter"), 20).with_cache(cache.clone()));
        venue.set_book("BTC", dec!(50000), dec!(50010));
        venue.set_tick_lot("BTC", dec!(1), dec!(0.001));
        (cache, executor, venue)
    }

    #[tokio::test(start_paused = true)]
    async fn test_inside_limit_fill() {
        let (_cache, executor, venue) = setup();
        let adapter: Arc<dyn VenueAdapter> = venue.clone();
        let cancel = CancellationToken::new();

        let outcome = executor
            .execute(
                &adapter,
                "BTC",
                Side::Buy,
                dec!(0.02),
                ExecMode::LimitWithFallback,
                false,
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(outcome.filled_qty, dec!(0.02));
        // Buy priced one tick inside: ask - 1.
        assert_eq!(outcome.avg_price, dec!(50009));
        assert_eq!(outcome.mode_used, Some(ModeUsed::InsideLimit));
        // One tick inside still pays a little over mid on a 10-wide book.
        assert!(outcome.slippage_pct > Decimal::ZERO);
        assert!(outcome.slippage_pct < dec!(0.01));
    }

    #[tokio::test(start_paused = true)]
    async fn test_post_only_rejects_then_touch() {
        let (_cache, executor, venue) = setup();
        // Two inside attempts rejected, third attempt is at the touch.
        venue.script_limit("BTC", LimitBehavior::PostOnlyReject);
        venue.script_limit("BTC", LimitBehavior::PostOnlyReject);
        venue.script_limit("BTC", LimitBehavior::Fill);
        let adapter: Arc<dyn VenueAdapter> = venue.clone();
        let cancel = CancellationToken::new();

        let outcome = executor
            .execute(
                &adapter,
                "BTC",
                Side::Buy,
                dec!(0.01),
                ExecMode::LimitWithFallback,
                false,
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(outcome.filled_qty, dec!(0.01));
        // Attempt index 2 >= inside_tick_retries: touch at the ask.
        assert_eq!(outcome.avg_price, dec!(50010));
        assert_eq!(outcome.mode_used, Some(ModeUsed::TouchLimit));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_then_remainder_retry() {
        let (_cache, executor, venue) = setup();
        venue.script_limit("BTC", LimitBehavior::FillPartial(dec!(0.4)));
        venue.script_limit("BTC", LimitBehavior::Fill);
        let adapter: Arc<dyn VenueAdapter> = venue.clone();
        let cancel = CancellationToken::new();

        let outcome = executor
            .execute(
                &adapter,
                "BTC",
                Side::Buy,
                dec!(0.01),
                ExecMode::LimitWithFallback,
                false,
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(outcome.filled_qty, dec!(0.01));
        assert_eq!(venue.net_position("BTC"), dec!(0.01));
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_only_never_markets() {
        let (_cache, executor, venue) = setup();
        for _ in 0..4 {
            venue.script_limit("BTC", LimitBehavior::Rest);
        }
        let adapter: Arc<dyn VenueAdapter> = venue.clone();
        let cancel = CancellationToken::new();

        let outcome = executor
            .execute(
                &adapter,
                "BTC",
                Side::Buy,
                dec!(0.01),
                ExecMode::LimitOnly,
                false,
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(outcome.filled_qty, Decimal::ZERO);
        assert!(outcome.mode_used.is_none());
        assert_eq!(venue.net_position("BTC"), Decimal::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_markets_the_remainder() {
        let (_cache, executor, venue) = setup();
        venue.script_limit("BTC", LimitBehavior::FillPartial(dec!(0.5)));
        for _ in 0..3 {
            venue.script_limit("BTC", LimitBehavior::Rest);
        }
        let adapter: Arc<dyn VenueAdapter> = venue.clone();
        let cancel = CancellationToken::new();

        let outcome = executor
            .execute(
                &adapter,
                "BTC",
                Side::Buy,
                dec!(0.02),
                ExecMode::LimitWithFallback,
                false,
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(outcome.filled_qty, dec!(0.02));
        assert_eq!(outcome.mode_used, Some(ModeUsed::Market));
        assert_eq!(venue.net_position("BTC"), dec!(0.02));
        // Half maker at 50009, half taker at the 50010 ask.
        assert!(outcome.avg_price > dec!(50009) && outcome.avg_price <= dec!(50010));
    }

    #[tokio::test(start_paused = true)]
    async fn test_market_only() {
        let (_cache, executor, venue) = setup();
        let adapter: Arc<dyn VenueAdapter> = venue.clone();
        let cancel = CancellationToken::new();

        let outcome = executor
            .execute(
                &adapter,
                "BTC",
                Side::Sell,
                dec!(0.01),
                ExecMode::MarketOnly,
                false,
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(outcome.filled_qty, dec!(0.01));
        assert_eq!(outcome.mode_used, Some(ModeUsed::Market));
        assert_eq!(outcome.avg_price, dec!(50000));
        // Selling at the bid from a 50005 mid is adverse.
        assert!(outcome.slippage_pct > Decimal::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_returns_accumulated_state() {
        let (_cache, executor, venue) = setup();
        venue.script_limit("BTC", LimitBehavior::FillPartial(dec!(0.5)));
        venue.script_limit("BTC", LimitBehavior::Rest);
        let adapter: Arc<dyn VenueAdapter> = venue.clone();
        let cancel = CancellationToken::new();
        cancel.cancel();

        // Already-tripped token: nothing should be placed at all.
        let outcome = executor
            .execute(
                &adapter,
                "BTC",
                Side::Buy,
                dec!(0.02),
                ExecMode::LimitWithFallback,
                false,
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(outcome.filled_qty, Decimal::ZERO);
        assert_eq!(venue.orders_placed(), 0);
    }

    #[test]
    fn test_signed_slippage() {
        // Buying above mid is adverse; selling above mid is favorable.
        assert!(signed_slippage_pct(Side::Buy, dec!(101), dec!(100)) > Decimal::ZERO);
        assert!(signed_slippage_pct(Side::Sell, dec!(101), dec!(100)) < Decimal::ZERO);
        assert_eq!(
            signed_slippage_pct(Side::Buy, dec!(100.5), dec!(100)),
            dec!(0.5)
        );
    }
}
