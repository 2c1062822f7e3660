//! Venue adapter contract.
//!
//! One trait per exchange, narrow on purpose: the strategy core only ever
//! needs quotes, books, order placement/tracking and instrument metadata.
//! Real REST/WS clients implement this outside the core; the in-tree
//! [`mock::MockVenue`] backs tests and paper trading.

pub mod mock;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::VenueError;
use crate::models::{BookTicker, OrderBook, Side, TrackedOrder, VenueSpec};

/// A post-only or crossing limit order request.
#[derive(Debug, Clone)]
pub struct LimitOrder {
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub price: Decimal,
    pub post_only: bool,
    pub reduce_only: bool,
}

/// Uniform capability surface over one exchange. All prices and quantities
/// are `Decimal`; adapters must never silently truncate.
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    /// Immutable session attributes (fees, funding interval, capabilities).
    fn spec(&self) -> &VenueSpec;

    fn name(&self) -> &str {
        &self.spec().name
    }

    /// Current best bid/ask. Prefers the live WS cache; errors if the quote
    /// is stale and a REST refresh also fails.
    async fn best_bid_ask(&self, symbol: &str) -> Result<BookTicker, VenueError>;

    /// Order book to `depth` levels, bids descending and asks ascending.
    /// Uses the WS snapshot when the venue maintains full depth.
    async fn order_book(&self, symbol: &str, depth: usize) -> Result<OrderBook, VenueError>;

    /// Place a limit order; returns the client id. Fails with
    /// [`VenueError::PostOnlyReject`] when a post-only price would cross.
    async fn place_limit(&self, order: LimitOrder) -> Result<String, VenueError>;

    async fn place_market(
        &self,
        symbol: &str,
        side: Side,
        qty: Decimal,
        reduce_only: bool,
    ) -> Result<String, VenueError>;

    /// Idempotent: canceling an unknown or already-terminal order succeeds.
    async fn cancel(&self, client_id: &str) -> Result<(), VenueError>;

    async fn order_status(&self, client_id: &str) -> Result<TrackedOrder, VenueError>;

    /// May return [`VenueError::Unsupported`] on cross-margin venues.
    async fn set_account_leverage(&self, symbol: &str, leverage: u32) -> Result<(), VenueError>;

    async fn max_leverage(&self, symbol: &str) -> Result<u32, VenueError>;

    async fn tick_size(&self, symbol: &str) -> Result<Decimal, VenueError>;

    async fn lot_size(&self, symbol: &str) -> Result<Decimal, VenueError>;

    /// Signed net base-asset position on this venue (long positive).
    /// Startup reconciliation uses this to find half-open exposure.
    async fn position_qty(&self, symbol: &str) -> Result<Decimal, VenueError>;

    /// Ensure the WS book-ticker stream for `symbol` is running and feeding
    /// the process-wide cache. Idempotent.
    async fn subscribe_book_ticker(&self, symbol: &str) -> Result<(), VenueError>;

    /// Round a price toward the passive side of the book so post-only
    /// limits cannot cross: buys round down, sells round up.
    async fn round_price(
        &self,
        symbol: &str,
        price: Decimal,
        side: Side,
    ) -> Result<Decimal, VenueError> {
        let tick = self.tick_size(symbol).await?;
        Ok(round_toward_passive(price, tick, side))
    }
}

/// Snap `price` onto the tick grid, rounding toward the passive side.
pub fn round_toward_passive(price: Decimal, tick: Decimal, side: Side) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    let ticks = price / tick;
    let snapped = match side {
        Side::Buy => ticks.floor(),
        Side::Sell => ticks.ceil(),
    };
    snapped * tick
}

/// Snap a base quantity down onto the lot grid.
pub fn round_qty_down(qty: Decimal, lot: Decimal) -> Decimal {
    if lot <= Decimal::ZERO {
        return qty;
    }
    (qty / lot).floor() * lot
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_round_toward_passive_is_idempotent() {
        let tick = dec!(0.5);
        let buy = round_toward_passive(dec!(50000.3), tick, Side::Buy);
        assert_eq!(buy, dec!(50000.0));
        assert_eq!(round_toward_passive(buy, tick, Side::Buy), buy);

        let sell = round_toward_passive(dec!(50000.3), tick, Side::Sell);
        assert_eq!(sell, dec!(50000.5));
        assert_eq!(round_toward_passive(sell, tick, Side::Sell), sell);
    }

    #[test]
    fn test_round_on_grid_unchanged() {
        let tick = dec!(0.1);
        assert_eq!(round_toward_passive(dec!(100.2), tick, Side::Buy), dec!(100.2));
        assert_eq!(round_toward_passive(dec!(100.2), tick, Side::Sell), dec!(100.2));
    }

    #[test]
    fn test_round_qty_down() {
        assert_eq!(round_qty_down(dec!(0.0237), dec!(0.001)), dec!(0.023));
        assert_eq!(round_qty_down(dec!(5), Decimal::ZERO), dec!(5));
    }
}
