//! Simulated venue for tests and paper trading.
//!
//! Deterministic by default (limit orders fill, markets fill at the touch),
//! scriptable per symbol so executor and hedge tests can force partial
//! fills, post-only rejects, resting orders and rejections. Tracks a signed
//! net position per symbol so rollback tests can assert zero residual
//! exposure.

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::error::VenueError;
use crate::market::BookTickerCache;
use crate::models::{BookLevel, BookTicker, OrderBook, OrderStatus, Side, TrackedOrder, VenueSpec};
use crate::venues::{LimitOrder, VenueAdapter};

/// How the next scripted limit placement behaves.
#[derive(Debug, Clone, Copy)]
pub enum LimitBehavior {
    /// Fill fully at the order price.
    Fill,
    /// Fill this fraction; the remainder rests as PARTIAL.
    FillPartial(Decimal),
    /// Rest as PLACED, then fill fully after N status polls.
    FillAfterPolls(u32),
    /// Simulate the book moving between quote and placement.
    PostOnlyReject,
    /// Rest as PLACED until canceled.
    Rest,
    /// Venue rejects the order outright.
    Reject,
}

/// How the next scripted market placement behaves.
#[derive(Debug, Clone, Copy)]
pub enum MarketBehavior {
    Fill,
    Reject,
}

#[derive(Debug, Clone)]
struct MockBook {
    ticker: BookTicker,
    depth_bids: Vec<BookLevel>,
    depth_asks: Vec<BookLevel>,
    tick: Decimal,
    lot: Decimal,
}

#[derive(Default)]
struct Inner {
    books: HashMap<String, MockBook>,
    orders: HashMap<String, TrackedOrder>,
    fill_after: HashMap<String, u32>,
    limit_scripts: HashMap<String, VecDeque<LimitBehavior>>,
    market_scripts: HashMap<String, VecDeque<MarketBehavior>>,
    net_position: HashMap<String, Decimal>,
    leverage_calls: Vec<(String, u32)>,
    next_id: u64,
    seq: u64,
}

pub struct MockVenue {
    spec: VenueSpec,
    max_leverage: u32,
    /// Extra adverse price movement applied to market fills, in bps.
    market_slippage_bps: Decimal,
    cache: Option<Arc<BookTickerCache>>,
    inner: Mutex<Inner>,
}

impl MockVenue {
    pub fn new(spec: VenueSpec, max_leverage: u32) -> Self {
        Self {
            spec,
            max_leverage,
            market_slippage_bps: Decimal::ZERO,
            cache: None,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Attach the shared cache that `subscribe_book_ticker` and
    /// `set_book` feed, as a live adapter's WS handler would.
    pub fn with_cache(mut self, cache: Arc<BookTickerCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_market_slippage_bps(mut self, bps: Decimal) -> Self {
        self.market_slippage_bps = bps;
        self
    }

    /// Seed or move the book for a symbol; pushes the tick into the cache.
    pub fn set_book(&self, symbol: &str, bid: Decimal, ask: Decimal) {
        let mut inner = self.inner.lock();
        inner.seq += 1;
        let seq = inner.seq;
        let ticker = BookTicker {
            bid,
            ask,
            bid_size: dec!(10),
            ask_size: dec!(10),
            seq,
            ts: chrono::Utc::now(),
        };
        let tick = default_tick(bid);
        let book = inner.books.entry(symbol.to_string()).or_insert(MockBook {
            ticker,
            depth_bids: Vec::new(),
            depth_asks: Vec::new(),
            tick,
            lot: dec!(0.001),
        });
        book.ticker = ticker;
        book.depth_bids = synthetic_depth(bid, -tick);
        book.depth_asks = synthetic_depth(ask, tick);
        drop(inner);
        self.push_to_cache(symbol, ticker);
    }

    /// Override the synthetic depth with explicit levels.
    pub fn set_depth(&self, symbol: &str, bids: Vec<BookLevel>, asks: Vec<BookLevel>) {
        let mut inner = self.inner.lock();
        if let Some(book) = inner.books.get_mut(symbol) {
            book.depth_bids = bids;
            book.depth_asks = asks;
        }
    }

    pub fn set_tick_lot(&self, symbol: &str, tick: Decimal, lot: Decimal) {
        let mut inner = self.inner.lock();
        if let Some(book) = inner.books.get_mut(symbol) {
            book.tick = tick;
            book.lot = lot;
        }
    }

    pub fn script_limit(&self, symbol: &str, behavior: LimitBehavior) {
        self.inner
            .lock()
            .limit_scripts
            .entry(symbol.to_string())
            .or_default()
            .push_back(behavior);
    }

    pub fn script_market(&self, symbol: &str, behavior: MarketBehavior) {
        self.inner
            .lock()
            .market_scripts
            .entry(symbol.to_string())
            .or_default()
            .push_back(behavior);
    }

    /// Signed base-asset exposure accumulated through fills.
    pub fn net_position(&self, symbol: &str) -> Decimal {
        self.inner
            .lock()
            .net_position
            .get(symbol)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Leverage values accepted via `set_account_leverage`.
    pub fn leverage_calls(&self) -> Vec<(String, u32)> {
        self.inner.lock().leverage_calls.clone()
    }

    pub fn order(&self, client_id: &str) -> Option<TrackedOrder> {
        self.inner.lock().orders.get(client_id).cloned()
    }

    pub fn orders_placed(&self) -> usize {
        self.inner.lock().orders.len()
    }

    fn push_to_cache(&self, symbol: &str, ticker: BookTicker) {
        if let Some(cache) = &self.cache {
            cache.update(&self.spec.name, symbol, ticker);
        }
    }

    fn fee_rate(&self, maker: bool) -> Decimal {
        if maker {
            self.spec.maker_fee
        } else {
            self.spec.taker_fee
        }
    }

    fn record_fill(inner: &mut Inner, symbol: &str, side: Side, qty: Decimal) {
        let entry = inner
            .net_position
            .entry(symbol.to_string())
            .or_insert(Decimal::ZERO);
        match side {
            Side::Buy => *entry += qty,
            Side::Sell => *entry -= qty,
        }
    }

    fn ensure_book(inner: &mut Inner, symbol: &str) -> MockBook {
        inner
            .books
            .entry(symbol.to_string())
            .or_insert_with(|| {
                let bid = dec!(99.99);
                let ask = dec!(100.01);
                MockBook {
                    ticker: BookTicker {
                        bid,
                        ask,
                        bid_size: dec!(10),
                        ask_size: dec!(10),
                        seq: 1,
                        ts: chrono::Utc::now(),
                    },
                    depth_bids: synthetic_depth(bid, dec!(-0.01)),
                    depth_asks: synthetic_depth(ask, dec!(0.01)),
                    tick: dec!(0.01),
                    lot: dec!(0.001),
                }
            })
            .clone()
    }
}

fn default_tick(price: Decimal) -> Decimal {
    if price >= dec!(10000) {
        dec!(1)
    } else if price >= dec!(100) {
        dec!(0.01)
    } else {
        dec!(0.0001)
    }
}

fn synthetic_depth(touch: Decimal, step: Decimal) -> Vec<BookLevel> {
    (0..10)
        .map(|i| BookLevel {
            price: touch + step * Decimal::from(i),
            qty: dec!(10),
        })
        .collect()
}

#[async_trait]
impl VenueAdapter for MockVenue {
    fn spec(&self) -> &VenueSpec {
        &self.spec
    }

    async fn best_bid_ask(&self, symbol: &str) -> Result<BookTicker, VenueError> {
        let mut inner = self.inner.lock();
        let book = Self::ensure_book(&mut inner, symbol);
        Ok(book.ticker)
    }

    async fn order_book(&self, symbol: &str, depth: usize) -> Result<OrderBook, VenueError> {
        let mut inner = self.inner.lock();
        let book = Self::ensure_book(&mut inner, symbol);
        Ok(OrderBook {
            bids: book.depth_bids.into_iter().take(depth).collect(),
            asks: book.depth_asks.into_iter().take(depth).collect(),
        })
    }

    async fn place_limit(&self, order: LimitOrder) -> Result<String, VenueError> {
        let mut inner = self.inner.lock();
        let book = Self::ensure_book(&mut inner, &order.symbol);

        // A crossing post-only is rejected before any script applies.
        if order.post_only {
            let crosses = match order.side {
                Side::Buy => order.price >= book.ticker.ask,
                Side::Sell => order.price <= book.ticker.bid,
            };
            if crosses {
                return Err(VenueError::PostOnlyReject);
            }
        }

        let behavior = inner
            .limit_scripts
            .get_mut(&order.symbol)
            .and_then(|q| q.pop_front())
            .unwrap_or(LimitBehavior::Fill);

        inner.next_id += 1;
        let client_id = format!("mock-{}-{}", self.spec.name, inner.next_id);
        let fee = self.fee_rate(order.post_only);

        let mut tracked = TrackedOrder {
            venue: self.spec.name.clone(),
            symbol: order.symbol.clone(),
            client_id: client_id.clone(),
            venue_id: Some(format!("v{}", inner.next_id)),
            side: order.side,
            requested_qty: order.qty,
            filled_qty: Decimal::ZERO,
            avg_fill_price: Decimal::ZERO,
            fees_paid: Decimal::ZERO,
            status: OrderStatus::Placed,
        };

        match behavior {
            LimitBehavior::Fill => {
                tracked.filled_qty = order.qty;
                tracked.avg_fill_price = order.price;
                tracked.fees_paid = order.qty * order.price * fee;
                tracked.status = OrderStatus::Filled;
                Self::record_fill(&mut inner, &order.symbol, order.side, order.qty);
            }
            LimitBehavior::FillPartial(fraction) => {
                let filled = order.qty * fraction;
                tracked.filled_qty = filled;
                tracked.avg_fill_price = order.price;
                tracked.fees_paid = filled * order.price * fee;
                tracked.status = OrderStatus::Partial;
                Self::record_fill(&mut inner, &order.symbol, order.side, filled);
            }
            LimitBehavior::FillAfterPolls(polls) => {
                // Carry the limit price so the deferred fill uses it.
                tracked.avg_fill_price = order.price;
                inner.fill_after.insert(client_id.clone(), polls);
            }
            LimitBehavior::PostOnlyReject => {
                return Err(VenueError::PostOnlyReject);
            }
            LimitBehavior::Rest => {
                tracked.avg_fill_price = order.price;
            }
            LimitBehavior::Reject => {
                tracked.status = OrderStatus::Rejected;
            }
        }

        inner.orders.insert(client_id.clone(), tracked);
        Ok(client_id)
    }

    async fn place_market(
        &self,
        symbol: &str,
        side: Side,
        qty: Decimal,
        reduce_only: bool,
    ) -> Result<String, VenueError> {
        let mut inner = self.inner.lock();
        let book = Self::ensure_book(&mut inner, symbol);

        let behavior = inner
            .market_scripts
            .get_mut(symbol)
            .and_then(|q| q.pop_front())
            .unwrap_or(MarketBehavior::Fill);

        inner.next_id += 1;
        let client_id = format!("mock-{}-{}", self.spec.name, inner.next_id);

        let mut tracked = TrackedOrder {
            venue: self.spec.name.clone(),
            symbol: symbol.to_string(),
            client_id: client_id.clone(),
            venue_id: Some(format!("v{}", inner.next_id)),
            side,
            requested_qty: qty,
            filled_qty: Decimal::ZERO,
            avg_fill_price: Decimal::ZERO,
            fees_paid: Decimal::ZERO,
            status: OrderStatus::Placed,
        };

        match behavior {
            MarketBehavior::Reject => {
                tracked.status = OrderStatus::Rejected;
            }
            MarketBehavior::Fill => {
                let mut fill_qty = qty;
                if reduce_only {
                    // Reduce-only caps at the reducible quantity.
                    let net = inner
                        .net_position
                        .get(symbol)
                        .copied()
                        .unwrap_or(Decimal::ZERO);
                    let reducible = match side {
                        Side::Buy => (-net).max(Decimal::ZERO),
                        Side::Sell => net.max(Decimal::ZERO),
                    };
                    fill_qty = fill_qty.min(reducible);
                    if fill_qty <= Decimal::ZERO {
                        tracked.status = OrderStatus::Rejected;
                        inner.orders.insert(client_id.clone(), tracked);
                        return Ok(client_id);
                    }
                }

                let slip = self.market_slippage_bps / dec!(10000);
                let price = match side {
                    Side::Buy => book.ticker.ask * (Decimal::ONE + slip),
                    Side::Sell => book.ticker.bid * (Decimal::ONE - slip),
                };
                tracked.filled_qty = fill_qty;
                tracked.avg_fill_price = price;
                tracked.fees_paid = fill_qty * price * self.fee_rate(false);
                tracked.status = OrderStatus::Filled;
                Self::record_fill(&mut inner, symbol, side, fill_qty);
            }
        }

        inner.orders.insert(client_id.clone(), tracked);
        Ok(client_id)
    }

    async fn cancel(&self, client_id: &str) -> Result<(), VenueError> {
        let mut inner = self.inner.lock();
        if let Some(order) = inner.orders.get_mut(client_id) {
            if !order.status.is_terminal() {
                order.status = OrderStatus::Canceled;
            }
        }
        // Unknown id: NotFound is treated as success (idempotent cancel).
        Ok(())
    }

    async fn order_status(&self, client_id: &str) -> Result<TrackedOrder, VenueError> {
        let mut inner = self.inner.lock();
        match inner.fill_after.get(client_id).copied() {
            Some(0) => {
                inner.fill_after.remove(client_id);
                let fee = self.fee_rate(true);
                let (symbol, side, qty) = {
                    let order = inner
                        .orders
                        .get_mut(client_id)
                        .ok_or_else(|| VenueError::NotFound(client_id.to_string()))?;
                    // The limit price was carried in avg_fill_price at
                    // placement; the resting order fills at it.
                    order.status = OrderStatus::Filled;
                    order.filled_qty = order.requested_qty;
                    order.fees_paid = order.requested_qty * order.avg_fill_price * fee;
                    (order.symbol.clone(), order.side, order.requested_qty)
                };
                Self::record_fill(&mut inner, &symbol, side, qty);
            }
            Some(remaining) => {
                inner
                    .fill_after
                    .insert(client_id.to_string(), remaining - 1);
            }
            None => {}
        }
        inner
            .orders
            .get(client_id)
            .cloned()
            .ok_or_else(|| VenueError::NotFound(client_id.to_string()))
    }

    async fn set_account_leverage(&self, symbol: &str, leverage: u32) -> Result<(), VenueError> {
        if !self.spec.supports_account_leverage {
            return Err(VenueError::Unsupported("account leverage (cross-margin)"));
        }
        self.inner
            .lock()
            .leverage_calls
            .push((symbol.to_string(), leverage));
        Ok(())
    }

    async fn max_leverage(&self, _symbol: &str) -> Result<u32, VenueError> {
        Ok(self.max_leverage)
    }

    async fn tick_size(&self, symbol: &str) -> Result<Decimal, VenueError> {
        let mut inner = self.inner.lock();
        Ok(Self::ensure_book(&mut inner, symbol).tick)
    }

    async fn lot_size(&self, symbol: &str) -> Result<Decimal, VenueError> {
        let mut inner = self.inner.lock();
        Ok(Self::ensure_book(&mut inner, symbol).lot)
    }

    async fn position_qty(&self, symbol: &str) -> Result<Decimal, VenueError> {
        Ok(self.net_position(symbol))
    }

    async fn subscribe_book_ticker(&self, symbol: &str) -> Result<(), VenueError> {
        let ticker = {
            let mut inner = self.inner.lock();
            Self::ensure_book(&mut inner, symbol).ticker
        };
        self.push_to_cache(symbol, ticker);
        Ok(())
    }
}
