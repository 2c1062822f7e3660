//! Second-leg hedge driver.
//!
//! Runs only after the first leg has filled, which means every millisecond
//! spent here is unhedged directional exposure. The state machine tries to
//! hedge at break-even first, then walks an adaptive limit ladder, and
//! finally takes the market. Profiles differ by direction: opening can
//! afford more patience than closing.

use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{HedgeConfig, HedgeProfileConfig};
use crate::error::VenueError;
use crate::execution::ModeUsed;
use crate::market::BookTickerCache;
use crate::models::{BookTicker, OrderStatus, Side, TrackedOrder};
use crate::venues::{round_qty_down, round_toward_passive, LimitOrder, VenueAdapter};

/// Bounded BBO re-reads after a post-only reject within one attempt.
const MAX_REPRICES_PER_ATTEMPT: u32 = 2;

/// Whether the hedge opens or closes exposure; selects the retry profile
/// and makes the market fallback reduce-only when closing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationMode {
    Opening,
    Closing,
}

#[derive(Debug, Clone)]
pub struct HedgeRequest {
    pub symbol: String,
    pub side: Side,
    pub target_qty: Decimal,
    /// Fill price of the triggering leg; break-even target for this one.
    pub trigger_fill_price: Decimal,
    pub mode: OperationMode,
}

#[derive(Debug, Clone)]
pub struct HedgeOutcome {
    pub filled_qty: Decimal,
    pub avg_price: Decimal,
    pub fees_paid: Decimal,
    pub mode_used: Option<ModeUsed>,
}

impl HedgeOutcome {
    pub fn is_complete(&self, target: Decimal, lot: Decimal) -> bool {
        target - self.filled_qty < lot.max(Decimal::new(1, 12))
    }
}

#[derive(Debug, Default)]
struct Accum {
    filled: Decimal,
    cost: Decimal,
    fees: Decimal,
}

impl Accum {
    fn absorb(&mut self, order: &TrackedOrder, counted_qty: &mut Decimal, counted_fees: &mut Decimal) {
        let qty_delta = order.filled_qty - *counted_qty;
        if qty_delta > Decimal::ZERO {
            self.filled += qty_delta;
            self.cost += qty_delta * order.avg_fill_price;
            *counted_qty = order.filled_qty;
        }
        let fee_delta = order.fees_paid - *counted_fees;
        if fee_delta > Decimal::ZERO {
            self.fees += fee_delta;
            *counted_fees = order.fees_paid;
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

pub struct HedgeManager {
    cache: Arc<BookTickerCache>,
    config: HedgeConfig,
    poll_interval: Duration,
}

impl HedgeManager {
    pub fn new(cache: Arc<BookTickerCache>, config: HedgeConfig, poll_interval: Duration) -> Self {
        Self {
            cache,
            config,
            poll_interval,
        }
    }

    pub fn profile(&self, mode: OperationMode) -> &HedgeProfileConfig {
        match mode {
            OperationMode::Opening => &self.config.opening,
            OperationMode::Closing => &self.config.closing,
        }
    }

    async fn live_bbo(
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

    /// Drive the hedge leg to completion. Returns accumulated state even
    /// when incomplete; deciding what a shortfall means (rollback) is the
    /// atomic executor's call, not ours. On cancellation the live attempt
    /// is canceled and accumulated state returned; no market fallback.
    pub async fn drive(
        &self,
        venue: &Arc<dyn VenueAdapter>,
        req: &HedgeRequest,
        cancel: &CancellationToken,
    ) -> Result<HedgeOutcome, VenueError> {
        let profile = self.profile(req.mode).clone();
        let tick = venue.tick_size(&req.symbol).await?;
        let lot = venue.lot_size(&req.symbol).await?;

        let total_timeout = Duration::from_millis(profile.total_timeout_ms);
        let deadline = Instant::now() + total_timeout;
        let attempt_timeout = total_timeout / profile.max_retries.max(1);

        let mut accum = Accum::default();
        let mut mode_used: Option<ModeUsed> = None;
        let mut remaining = round_qty_down(req.target_qty, lot);

        // Phase 1: break-even targeting at the trigger leg's fill price.
        if remaining >= lot && !cancel.is_cancelled() {
            if let Some(price) = self
                .break_even_price(venue, req, tick, &profile)
                .await?
            {
                debug!(
                    venue = venue.name(),
                    symbol = %req.symbol,
                    price = %price,
                    "break-even hedge attempt"
                );
                let filled_before = accum.filled;
                match self
                    .run_limit_attempt(
                        venue,
                        req,
                        price,
                        true,
                        remaining,
                        (Instant::now() + attempt_timeout).min(deadline),
                        &mut accum,
                        cancel,
                    )
                    .await
                {
                    Ok(()) => {}
                    // Book moved under us; the ladder takes over.
                    Err(VenueError::PostOnlyReject) => {}
                    Err(e) if e.is_transient() => {}
                    Err(e) => return Err(e),
                }
                remaining = round_qty_down(req.target_qty - accum.filled, lot);
                if accum.filled > filled_before {
                    mode_used = Some(ModeUsed::InsideLimit);
                }
            }
        }

        // Phase 2: adaptive ladder, inside the spread first, then at touch.
        let mut attempt: u32 = 0;
        while attempt < profile.max_retries
            && remaining >= lot
            && Instant::now() < deadline
            && !cancel.is_cancelled()
        {
            let inside = attempt < profile.inside_tick_retries;
            let mut reprices: u32 = 0;

            // A post-only reject refreshes the BBO and re-prices without
            // consuming the attempt, bounded per attempt.
            let placed_price = loop {
                let bbo = self.live_bbo(venue, &req.symbol).await?;
                let raw_price = match (req.side, inside) {
                    (Side::Buy, true) => bbo.ask - tick,
                    (Side::Buy, false) => bbo.ask,
                    (Side::Sell, true) => bbo.bid + tick,
                    (Side::Sell, false) => bbo.bid,
                };
                let price = round_toward_passive(raw_price, tick, req.side);

                let filled_before = accum.filled;
                match self
                    .run_limit_attempt(
                        venue,
                        req,
                        price,
                        inside,
                        remaining,
                        (Instant::now() + attempt_timeout).min(deadline),
                        &mut accum,
                        cancel,
                    )
                    .await
                {
                    Ok(()) => break Some((price, filled_before)),
                    Err(VenueError::PostOnlyReject) if reprices < MAX_REPRICES_PER_ATTEMPT => {
                        reprices += 1;
                        continue;
                    }
                    Err(VenueError::PostOnlyReject) => break None,
                    Err(e) if e.is_transient() => {
                        warn!(venue = venue.name(), symbol = %req.symbol, error = %e, "transient hedge error");
                        break None;
                    }
                    Err(e) => return Err(e),
                }
            };

            remaining = round_qty_down(req.target_qty - accum.filled, lot);
            if let Some((_, filled_before)) = placed_price {
                if accum.filled > filled_before {
                    mode_used = Some(if inside {
                        ModeUsed::InsideLimit
                    } else {
                        ModeUsed::TouchLimit
                    });
                }
            }

            attempt += 1;
            if remaining >= lot && attempt < profile.max_retries && !cancel.is_cancelled() {
                let jitter = rand::thread_rng().gen_range(0..=profile.retry_backoff_ms / 2);
                tokio::time::sleep(Duration::from_millis(profile.retry_backoff_ms + jitter)).await;
            }
        }

        // Phase 3: market fallback. Never on cancellation; abort handling
        // belongs to the caller's rollback path.
        if remaining >= lot && !cancel.is_cancelled() {
            let reduce_only = req.mode == OperationMode::Closing;
            info!(
                venue = venue.name(),
                symbol = %req.symbol,
                remaining = %remaining,
                reduce_only,
                "hedge market fallback"
            );
            let client_id = venue
                .place_market(&req.symbol, req.side, remaining, reduce_only)
                .await?;
            let mut counted_qty = Decimal::ZERO;
            let mut counted_fees = Decimal::ZERO;
            let order = self
                .poll_order(venue, &client_id, Instant::now() + attempt_timeout, cancel)
                .await?;
            accum.absorb(&order, &mut counted_qty, &mut counted_fees);
            if order.filled_qty > Decimal::ZERO {
                mode_used = Some(ModeUsed::Market);
            }
        }

        Ok(HedgeOutcome {
            filled_qty: accum.filled,
            avg_price: accum.avg_price(),
            fees_paid: accum.fees,
            mode_used,
        })
    }

    /// The trigger price, if hedging at it is still feasible: it must lie
    /// within the current BBO without crossing, and the market must not
    /// have moved more than the deviation bound since the trigger fill.
    async fn break_even_price(
        &self,
        venue: &Arc<dyn VenueAdapter>,
        req: &HedgeRequest,
        tick: Decimal,
        profile: &HedgeProfileConfig,
    ) -> Result<Option<Decimal>, VenueError> {
        if req.trigger_fill_price <= Decimal::ZERO {
            return Ok(None);
        }
        let bbo = self.live_bbo(venue, &req.symbol).await?;
        let target = round_toward_passive(req.trigger_fill_price, tick, req.side);

        let deviation_pct =
            ((bbo.mid() - req.trigger_fill_price) / req.trigger_fill_price * dec!(100)).abs();
        if deviation_pct >= profile.max_deviation_pct {
            debug!(
                symbol = %req.symbol,
                deviation_pct = %deviation_pct,
                "market moved too far for break-even hedge"
            );
            return Ok(None);
        }

        let within_book = target >= bbo.bid && target <= bbo.ask;
        let crosses = match req.side {
            Side::Buy => target >= bbo.ask,
            Side::Sell => target <= bbo.bid,
        };
        if !within_book || crosses {
            return Ok(None);
        }
        Ok(Some(target))
    }

    /// Place one post-only (or touch) limit for `qty` and poll it until
    /// the sub-deadline, folding fills into `accum`. Unfilled remainder is
    /// canceled and late fills are captured.
    #[allow(clippy::too_many_arguments)]
    async fn run_limit_attempt(
        &self,
        venue: &Arc<dyn VenueAdapter>,
        req: &HedgeRequest,
        price: Decimal,
        post_only: bool,
        qty: Decimal,
        sub_deadline: Instant,
        accum: &mut Accum,
        cancel: &CancellationToken,
    ) -> Result<(), VenueError> {
        let client_id = venue
            .place_limit(LimitOrder {
                symbol: req.symbol.clone(),
                side: req.side,
                qty,
                price,
                post_only,
                reduce_only: req.mode == OperationMode::Closing,
            })
            .await?;

        let mut counted_qty = Decimal::ZERO;
        let mut counted_fees = Decimal::ZERO;
        let order = self
            .poll_order(venue, &client_id, sub_deadline, cancel)
            .await?;
        accum.absorb(&order, &mut counted_qty, &mut counted_fees);

        if order.status != OrderStatus::Filled {
            venue.cancel(&client_id).await?;
            let settled = venue.order_status(&client_id).await?;
            accum.absorb(&settled, &mut counted_qty, &mut counted_fees);
        }
        Ok(())
    }

    async fn poll_order(
        &self,
        venue: &Arc<dyn VenueAdapter>,
        client_id: &str,
        deadline: Instant,
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
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
