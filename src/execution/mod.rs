//! Order execution: single-order tiered placement, the second-leg hedge
//! state machine and the two-leg atomic entry with compensating rollback.

pub mod atomic;
pub mod hedge;
pub mod order_executor;

pub use atomic::{AtomicMultiOrderExecutor, AtomicOrderSpec, AtomicResult, LegFill};
pub use hedge::{HedgeManager, HedgeOutcome, HedgeRequest, OperationMode};
pub use order_executor::{ExecMode, ExecOutcome, OrderExecutor};

/// How the final fill of an operation was achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeUsed {
    /// Post-only limit one tick inside the spread.
    InsideLimit,
    /// Limit at the opposite-side best price (crossing risk).
    TouchLimit,
    Market,
}
