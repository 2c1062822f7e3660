//! Durable position journal.
//!
//! Every status transition is flushed before the corresponding venue action
//! is considered durable, so a restart can reconcile half-done work. The
//! backend is abstract: sqlite in production, in-memory for tests.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::models::{ExitReason, FundingPayment, Position, PositionStatus};

pub use memory::MemoryPositionStore;
pub use sqlite::SqlitePositionStore;

#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn create(&self, position: &Position) -> Result<()>;

    async fn update(&self, position: &Position) -> Result<()>;

    /// Terminal transition to CLOSED with reason and realized PnL.
    async fn close(
        &self,
        id: Uuid,
        reason: ExitReason,
        realized_pnl: Decimal,
        closed_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<Position>>;

    /// Positions with status OPEN.
    async fn list_open(&self) -> Result<Vec<Position>>;

    async fn list_by_status(&self, statuses: &[PositionStatus]) -> Result<Vec<Position>>;

    /// Append a funding payment. Returns `false` when the
    /// `(venue, symbol, paid_at)` key was already recorded (idempotent).
    async fn record_funding(&self, payment: &FundingPayment) -> Result<bool>;

    async fn list_funding(&self, position_id: Uuid) -> Result<Vec<FundingPayment>>;

    /// Named strategy state blobs (session policy, cooldowns).
    async fn load_state(&self, name: &str) -> Result<Option<serde_json::Value>>;

    async fn save_state(&self, name: &str, value: &serde_json::Value) -> Result<()>;
}
