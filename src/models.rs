//! Core data model for the funding-rate arbitrage engine.
//!
//! Everything that crosses a component boundary lives here: venue metadata,
//! top-of-book quotes, funding rates, ranked opportunities, delta-neutral
//! positions and the orders that build them. Prices, quantities and fees are
//! `Decimal` end-to-end; floats only appear in derived scores.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

/// Immutable per-venue capabilities and fee schedule, fixed for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueSpec {
    /// Venue identifier, e.g. `lighter`, `aster`.
    pub name: String,
    /// Funding interval in seconds (3600 for 1h venues, 28800 for 8h).
    pub funding_interval_secs: u64,
    /// Maker fee as a fraction of notional (0.0002 = 2 bps).
    pub maker_fee: Decimal,
    /// Taker fee as a fraction of notional.
    pub taker_fee: Decimal,
    /// Whether `set_account_leverage` is honored (false = cross-margin).
    pub supports_account_leverage: bool,
    /// Whether the WS feed maintains full depth (false = top-of-book only).
    pub has_full_depth: bool,
}

/// Best bid/offer snapshot for a (venue, symbol).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BookTicker {
    pub bid: Decimal,
    pub ask: Decimal,
    pub bid_size: Decimal,
    pub ask_size: Decimal,
    /// Venue sequence number; staleness tracking requires it to advance.
    pub seq: u64,
    pub ts: DateTime<Utc>,
}

impl BookTicker {
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / dec!(2)
    }

    pub fn spread(&self) -> Decimal {
        self.ask - self.bid
    }

    pub fn spread_bps(&self) -> Decimal {
        let mid = self.mid();
        if mid.is_zero() {
            return Decimal::ZERO;
        }
        self.spread() / mid * dec!(10000)
    }
}

/// One price level of an order book.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub qty: Decimal,
}

/// Order book snapshot. Bids descending, asks ascending.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBook {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

/// Raw per-interval funding rate as reported by a venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingRate {
    pub venue: String,
    pub symbol: String,
    /// Raw rate per funding interval (can be negative).
    pub rate: Decimal,
    pub interval_secs: u64,
    pub next_payment_at: Option<DateTime<Utc>>,
}

/// A ranked cross-venue funding divergence, oriented so that the short side
/// receives funding: `divergence = short_rate - long_rate > 0` (per-second).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub symbol: String,
    pub long_venue: String,
    pub short_venue: String,
    /// Normalized per-second rate paid/received on the long venue.
    pub long_rate: Decimal,
    /// Normalized per-second rate on the short venue.
    pub short_rate: Decimal,
    pub divergence: Decimal,
    /// Estimated net APY as a fraction (0.0255 = 2.55%/year), after fees.
    pub net_apy: Decimal,
    pub long_oi_usd: Decimal,
    pub short_oi_usd: Decimal,
    /// Smaller of the two venues' 24h notional volume; ranking tiebreak.
    pub min_volume_24h_usd: Decimal,
    pub observed_at: DateTime<Utc>,
}

/// Lifecycle of a delta-neutral position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Opening,
    Open,
    Closing,
    Closed,
    Failed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Opening => "OPENING",
            PositionStatus::Open => "OPEN",
            PositionStatus::Closing => "CLOSING",
            PositionStatus::Closed => "CLOSED",
            PositionStatus::Failed => "FAILED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "OPENING" => Some(PositionStatus::Opening),
            "OPEN" => Some(PositionStatus::Open),
            "CLOSING" => Some(PositionStatus::Closing),
            "CLOSED" => Some(PositionStatus::Closed),
            "FAILED" => Some(PositionStatus::Failed),
            _ => None,
        }
    }
}

/// Why a position was (or is being) closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    FundingFlip,
    ProfitErosion,
    TimeLimit,
    BetterOpportunity,
    /// Startup reconciliation force-closed a half-open entry.
    Reconciliation,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::FundingFlip => "FUNDING_FLIP",
            ExitReason::ProfitErosion => "PROFIT_EROSION",
            ExitReason::TimeLimit => "TIME_LIMIT",
            ExitReason::BetterOpportunity => "BETTER_OPPORTUNITY",
            ExitReason::Reconciliation => "RECONCILIATION",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "FUNDING_FLIP" => Some(ExitReason::FundingFlip),
            "PROFIT_EROSION" => Some(ExitReason::ProfitErosion),
            "TIME_LIMIT" => Some(ExitReason::TimeLimit),
            "BETTER_OPPORTUNITY" => Some(ExitReason::BetterOpportunity),
            "RECONCILIATION" => Some(ExitReason::Reconciliation),
            _ => None,
        }
    }
}

/// The core entity: one delta-neutral long/short pair across two venues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub symbol: String,
    pub long_venue: String,
    pub short_venue: String,
    /// Notional per leg in USD.
    pub size_usd: Decimal,
    pub entry_long_price: Decimal,
    pub entry_short_price: Decimal,
    /// Per-second normalized rates captured at entry.
    pub entry_long_rate: Decimal,
    pub entry_short_rate: Decimal,
    pub entry_divergence: Decimal,
    pub current_divergence: Option<Decimal>,
    /// Funding received minus paid, non-decreasing while OPEN/CLOSING.
    pub cumulative_funding_usd: Decimal,
    /// All trading fees paid so far, non-decreasing while OPEN/CLOSING.
    pub total_fees_usd: Decimal,
    pub status: PositionStatus,
    pub exit_reason: Option<ExitReason>,
    pub opened_at: DateTime<Utc>,
    pub last_check_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub realized_pnl_usd: Option<Decimal>,
}

impl Position {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.opened_at
    }

    /// Base quantity of the long leg implied by notional and entry price.
    pub fn long_qty(&self) -> Decimal {
        if self.entry_long_price.is_zero() {
            return Decimal::ZERO;
        }
        self.size_usd / self.entry_long_price
    }

    pub fn short_qty(&self) -> Decimal {
        if self.entry_short_price.is_zero() {
            return Decimal::ZERO;
        }
        self.size_usd / self.entry_short_price
    }

    /// Funding collected so far, annualized over the position lifetime, as
    /// a fraction of notional. Used by the better-opportunity exit.
    pub fn realized_apy(&self, now: DateTime<Utc>) -> Decimal {
        let elapsed_secs = Decimal::from((now - self.opened_at).num_seconds().max(1));
        let seconds_per_year = Decimal::from(365i64 * 86_400);
        if self.size_usd.is_zero() {
            return Decimal::ZERO;
        }
        self.cumulative_funding_usd / self.size_usd / elapsed_secs * seconds_per_year
    }
}

/// Order lifecycle as reported by a venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    Placed,
    Partial,
    Filled,
    Canceled,
    Rejected,
    Unknown,
}

impl OrderStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected
        )
    }
}

/// An order we placed on a venue, tracked through its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedOrder {
    pub venue: String,
    pub symbol: String,
    pub client_id: String,
    pub venue_id: Option<String>,
    pub side: Side,
    pub requested_qty: Decimal,
    pub filled_qty: Decimal,
    pub avg_fill_price: Decimal,
    pub fees_paid: Decimal,
    pub status: OrderStatus,
}

/// One observed (or interval-estimated) funding transfer for a position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingPayment {
    pub position_id: Uuid,
    pub venue: String,
    pub symbol: String,
    pub amount_usd: Decimal,
    pub paid_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
    }

    #[test]
    fn test_book_ticker_mid_and_spread() {
        let t = BookTicker {
            bid: dec!(50000),
            ask: dec!(50010),
            bid_size: dec!(1),
            ask_size: dec!(1),
            seq: 1,
            ts: Utc::now(),
        };
        assert_eq!(t.mid(), dec!(50005));
        assert_eq!(t.spread(), dec!(10));
        // 10 / 50005 * 10000 ≈ 2 bps
        assert!((t.spread_bps() - dec!(2)).abs() < dec!(0.01));
    }

    #[test]
    fn test_status_round_trip() {
        for s in [
            PositionStatus::Opening,
            PositionStatus::Open,
            PositionStatus::Closing,
            PositionStatus::Closed,
            PositionStatus::Failed,
        ] {
            assert_eq!(PositionStatus::from_str(s.as_str()), Some(s));
        }
        assert_eq!(PositionStatus::from_str("???"), None);
    }

    #[test]
    fn test_terminal_order_states() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(!OrderStatus::Placed.is_terminal());
        assert!(!OrderStatus::Partial.is_terminal());
    }

    #[test]
    fn test_realized_apy_annualizes_funding() {
        let now = Utc::now();
        let mut p = Position {
            id: Uuid::new_v4(),
            symbol: "BTC".to_string(),
            long_venue: "aster".to_string(),
            short_venue: "lighter".to_string(),
            size_usd: dec!(1000),
            entry_long_price: dec!(50000),
            entry_short_price: dec!(50000),
            entry_long_rate: Decimal::ZERO,
            entry_short_rate: Decimal::ZERO,
            entry_divergence: Decimal::ZERO,
            current_divergence: None,
            cumulative_funding_usd: Decimal::ZERO,
            total_fees_usd: Decimal::ZERO,
            status: PositionStatus::Open,
            exit_reason: None,
            opened_at: now - Duration::days(365),
            last_check_at: None,
            closed_at: None,
            realized_pnl_usd: None,
        };
        p.cumulative_funding_usd = dec!(25);
        // $25 on $1000 over one year = 2.5% APY
        let apy = p.realized_apy(now);
        assert!((apy - dec!(0.025)).abs() < dec!(0.0001));
    }
}
