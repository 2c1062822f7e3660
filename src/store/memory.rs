//! In-memory store for tests and throwaway runs.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::models::{ExitReason, FundingPayment, Position, PositionStatus};
use crate::store::PositionStore;

#[derive(Default)]
struct Inner {
    positions: HashMap<Uuid, Position>,
    payments: Vec<FundingPayment>,
    payment_keys: HashSet<(String, String, i64)>,
    state: HashMap<String, serde_json::Value>,
}

#[derive(Default)]
pub struct MemoryPositionStore {
    inner: Mutex<Inner>,
}

impl MemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn payment_key(payment: &FundingPayment) -> (String, String, i64) {
    (
        payment.venue.clone(),
        payment.symbol.clone(),
        payment.paid_at.timestamp_millis(),
    )
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn create(&self, position: &Position) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.positions.contains_key(&position.id) {
            return Err(anyhow!("position {} already exists", position.id));
        }
        inner.positions.insert(position.id, position.clone());
        Ok(())
    }

    async fn update(&self, position: &Position) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.positions.contains_key(&position.id) {
            return Err(anyhow!("position {} not found", position.id));
        }
        inner.positions.insert(position.id, position.clone());
        Ok(())
    }

    async fn close(
        &self,
        id: Uuid,
        reason: ExitReason,
        realized_pnl: Decimal,
        closed_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let position = inner
            .positions
            .get_mut(&id)
            .ok_or_else(|| anyhow!("position {} not found", id))?;
        position.status = PositionStatus::Closed;
        position.exit_reason = Some(reason);
        position.realized_pnl_usd = Some(realized_pnl);
        position.closed_at = Some(closed_at);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Position>> {
        Ok(self.inner.lock().positions.get(&id).cloned())
    }

    async fn list_open(&self) -> Result<Vec<Position>> {
        self.list_by_status(&[PositionStatus::Open]).await
    }

    async fn list_by_status(&self, statuses: &[PositionStatus]) -> Result<Vec<Position>> {
        let inner = self.inner.lock();
        let mut positions: Vec<Position> = inner
            .positions
            .values()
            .filter(|p| statuses.contains(&p.status))
            .cloned()
            .collect();
        positions.sort_by_key(|p| p.opened_at);
        Ok(positions)
    }

    async fn record_funding(&self, payment: &FundingPayment) -> Result<bool> {
        let mut inner = self.inner.lock();
        if !inner.payment_keys.insert(payment_key(payment)) {
            return Ok(false);
        }
        inner.payments.push(payment.clone());
        Ok(true)
    }

    async fn list_funding(&self, position_id: Uuid) -> Result<Vec<FundingPayment>> {
        let inner = self.inner.lock();
        let mut payments: Vec<FundingPayment> = inner
            .payments
            .iter()
            .filter(|p| p.position_id == position_id)
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.paid_at);
        Ok(payments)
    }

    async fn load_state(&self, name: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.inner.lock().state.get(name).cloned())
    }

    async fn save_state(&self, name: &str, value: &serde_json::Value) -> Result<()> {
        self.inner
            .lock()
            .state
            .insert(name.to_string(), value.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn position() -> Position {
        Position {
            id: Uuid::new_v4(),
            symbol: "BTC".into(),
            long_venue: "aster".into(),
            short_venue: "lighter".into(),
            size_usd: dec!(1000),
            entry_long_price: dec!(50000),
            entry_short_price: dec!(50001),
            entry_long_rate: dec!(-0.00000001),
            entry_short_rate: dec!(0.00000002),
            entry_divergence: dec!(0.00000003),
            current_divergence: None,
            cumulative_funding_usd: Decimal::ZERO,
            total_fees_usd: dec!(0.4),
            status: PositionStatus::Open,
            exit_reason: None,
            opened_at: Utc::now(),
            last_check_at: None,
            closed_at: None,
            realized_pnl_usd: None,
        }
    }

    #[tokio::test]
    async fn test_create_get_close_round_trip() {
        let store = MemoryPositionStore::new();
        let p = position();
        store.create(&p).await.unwrap();
        assert!(store.create(&p).await.is_err());

        assert_eq!(store.list_open().await.unwrap().len(), 1);

        let closed_at = Utc::now();
        store
            .close(p.id, ExitReason::FundingFlip, dec!(1.23), closed_at)
            .await
            .unwrap();

        let got = store.get(p.id).await.unwrap().unwrap();
        assert_eq!(got.status, PositionStatus::Closed);
        assert_eq!(got.exit_reason, Some(ExitReason::FundingFlip));
        assert_eq!(got.realized_pnl_usd, Some(dec!(1.23)));
        assert!(store.list_open().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_funding_dedup() {
        let store = MemoryPositionStore::new();
        let p = position();
        store.create(&p).await.unwrap();

        let paid_at = Utc::now();
        let payment = FundingPayment {
            position_id: p.id,
            venue: "lighter".into(),
            symbol: "BTC".into(),
            amount_usd: dec!(0.05),
            paid_at,
        };
        assert!(store.record_funding(&payment).await.unwrap());
        // Same (venue, symbol, paid_at): idempotent no-op.
        assert!(!store.record_funding(&payment).await.unwrap());
        assert_eq!(store.list_funding(p.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_state_blob() {
        let store = MemoryPositionStore::new();
        assert!(store.load_state("session").await.unwrap().is_none());
        store
            .save_state("session", &serde_json::json!({"opened": true}))
            .await
            .unwrap();
        let got = store.load_state("session").await.unwrap().unwrap();
        assert_eq!(got["opened"], true);
    }
}
