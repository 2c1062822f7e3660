//! Market data and pre-trade analytics: the shared book-ticker cache, the
//! per-venue fee model and the liquidity gate.

pub mod book_ticker;
pub mod fees;
pub mod liquidity;

pub use book_ticker::{BookTickerCache, Quote};
pub use fees::{AssumedLiquidity, FeeModel};
pub use liquidity::{LiquidityAnalyzer, LiquidityReport, LiquidityVerdict};
