//! Process-wide best-bid/ask cache.
//!
//! Venue WS handlers write last-value snapshots per (venue, symbol); readers
//! get the current snapshot plus a staleness flag and never block writers
//! for more than a map lookup. A quote is stale when its sequence number has
//! not advanced within the staleness window, which covers both a silent feed
//! and a frozen one.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::models::BookTicker;

/// Default window after which an unchanged quote is considered stale.
pub const DEFAULT_STALENESS_LIMIT: Duration = Duration::from_secs(2);

/// A cache read: the snapshot plus whether it should still be trusted.
#[derive(Debug, Clone, Copy)]
pub struct Quote {
    pub ticker: BookTicker,
    pub stale: bool,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    ticker: BookTicker,
    /// Monotonic instant of the last seq advance, not the last write.
    last_advance: Instant,
}

pub struct BookTickerCache {
    entries: RwLock<HashMap<(String, String), Entry>>,
    staleness_limit: Duration,
}

impl BookTickerCache {
    pub fn new(staleness_limit: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            staleness_limit,
        }
    }

    pub fn staleness_limit(&self) -> Duration {
        self.staleness_limit
    }

    /// Write path, called by venue WS handlers. A snapshot whose `seq` has
    /// not advanced refreshes nothing.
    pub fn update(&self, venue: &str, symbol: &str, ticker: BookTicker) {
        let key = (venue.to_string(), symbol.to_string());
        let mut entries = self.entries.write();
        match entries.get_mut(&key) {
            Some(entry) if ticker.seq <= entry.ticker.seq => {
                // Out-of-order or duplicate frame; keep the newer snapshot
                // and do not touch the advance clock.
            }
            Some(entry) => {
                entry.ticker = ticker;
                entry.last_advance = Instant::now();
            }
            None => {
                entries.insert(
                    key,
                    Entry {
                        ticker,
                        last_advance: Instant::now(),
                    },
                );
            }
        }
    }

    pub fn get(&self, venue: &str, symbol: &str) -> Option<Quote> {
        let entries = self.entries.read();
        let entry = entries.get(&(venue.to_string(), symbol.to_string()))?;
        Some(Quote {
            ticker: entry.ticker,
            stale: entry.last_advance.elapsed() > self.staleness_limit,
        })
    }

    /// Block up to `warmup` for the first fresh tick on (venue, symbol).
    /// Returns `None` when the warm-up window closes without one.
    pub async fn wait_warm(
        &self,
        venue: &str,
        symbol: &str,
        warmup: Duration,
    ) -> Option<BookTicker> {
        let deadline = tokio::time::Instant::now() + warmup;
        loop {
            if let Some(quote) = self.get(venue, symbol) {
                if !quote.stale {
                    return Some(quote.ticker);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for BookTickerCache {
    fn default() -> Self {
        Self::new(DEFAULT_STALENESS_LIMIT)
    }
}

pub fn ticker(bid: rust_decimal::Decimal, ask: rust_decimal::Decimal, seq: u64) -> BookTicker {
    use rust_decimal_macros::dec;
    BookTicker {
        bid,
        ask,
        bid_size: dec!(1),
        ask_size: dec!(1),
        seq,
        ts: now(),
    }
}

fn now() -> DateTime<Utc> {
    Utc::now()
}
