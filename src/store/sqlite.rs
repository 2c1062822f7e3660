//! Sqlite-backed position journal.
//!
//! WAL journal mode so the write-ahead property holds across crashes.
//! Decimals are stored as text: prices and rates must round-trip exactly,
//! and REAL columns would silently truncate them.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::{ExitReason, FundingPayment, Position, PositionStatus};
use crate::store::PositionStore;

#[derive(Clone)]
pub struct SqlitePositionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqlitePositionStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open position db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                long_venue TEXT NOT NULL,
                short_venue TEXT NOT NULL,
                size_usd TEXT NOT NULL,
                entry_long_price TEXT NOT NULL,
                entry_short_price TEXT NOT NULL,
                entry_long_rate TEXT NOT NULL,
                entry_short_rate TEXT NOT NULL,
                entry_divergence TEXT NOT NULL,
                current_divergence TEXT,
                status TEXT NOT NULL,
                exit_reason TEXT,
                opened_at TEXT NOT NULL,
                last_check_at TEXT,
                closed_at TEXT,
                realized_pnl_usd TEXT,
                cumulative_funding_usd TEXT NOT NULL DEFAULT '0',
                total_fees_usd TEXT NOT NULL DEFAULT '0',
                metadata TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS funding_payments (
                id TEXT PRIMARY KEY,
                position_id TEXT NOT NULL REFERENCES positions(id),
                venue TEXT NOT NULL,
                symbol TEXT NOT NULL,
                amount_usd TEXT NOT NULL,
                paid_at TEXT NOT NULL,
                UNIQUE(venue, symbol, paid_at)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_funding_position ON funding_payments(position_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS strategy_state (
                name TEXT PRIMARY KEY,
                state_data TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

const POSITION_COLUMNS: &str = "id, symbol, long_venue, short_venue, size_usd, \
    entry_long_price, entry_short_price, entry_long_rate, entry_short_rate, \
    entry_divergence, current_divergence, status, exit_reason, opened_at, \
    last_check_at, closed_at, realized_pnl_usd, cumulative_funding_usd, \
    total_fees_usd";

fn parse_dec(s: &str) -> Result<Decimal> {
    Decimal::from_str(s).with_context(|| format!("parse decimal '{}'", s))
}

fn parse_dec_opt(s: Option<String>) -> Result<Option<Decimal>> {
    s.map(|v| parse_dec(&v)).transpose()
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("parse timestamp '{}'", s))?
        .with_timezone(&Utc))
}

fn parse_ts_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|v| parse_ts(&v)).transpose()
}

/// Raw text row, converted outside the rusqlite closure so decimal and
/// timestamp parse errors surface as real errors instead of panics.
struct RawPosition {
    id: String,
    symbol: String,
    long_venue: String,
    short_venue: String,
    size_usd: String,
    entry_long_price: String,
    entry_short_price: String,
    entry_long_rate: String,
    entry_short_rate: String,
    entry_divergence: String,
    current_divergence: Option<String>,
    status: String,
    exit_reason: Option<String>,
    opened_at: String,
    last_check_at: Option<String>,
    closed_at: Option<String>,
    realized_pnl_usd: Option<String>,
    cumulative_funding_usd: String,
    total_fees_usd: String,
}

impl RawPosition {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            symbol: row.get(1)?,
            long_venue: row.get(2)?,
            short_venue: row.get(3)?,
            size_usd: row.get(4)?,
            entry_long_price: row.get(5)?,
            entry_short_price: row.get(6)?,
            entry_long_rate: row.get(7)?,
            entry_short_rate: row.get(8)?,
            entry_divergence: row.get(9)?,
            current_divergence: row.get(10)?,
            status: row.get(11)?,
            exit_reason: row.get(12)?,
            opened_at: row.get(13)?,
            last_check_at: row.get(14)?,
            closed_at: row.get(15)?,
            realized_pnl_usd: row.get(16)?,
            cumulative_funding_usd: row.get(17)?,
            total_fees_usd: row.get(18)?,
        })
    }

    fn into_position(self) -> Result<Position> {
        Ok(Position {
            id: Uuid::parse_str(&self.id).context("parse position id")?,
            symbol: self.symbol,
            long_venue: self.long_venue,
            short_venue: self.short_venue,
            size_usd: parse_dec(&self.size_usd)?,
            entry_long_price: parse_dec(&self.entry_long_price)?,
            entry_short_price: parse_dec(&self.entry_short_price)?,
            entry_long_rate: parse_dec(&self.entry_long_rate)?,
            entry_short_rate: parse_dec(&self.entry_short_rate)?,
            entry_divergence: parse_dec(&self.entry_divergence)?,
            current_divergence: parse_dec_opt(self.current_divergence)?,
            status: PositionStatus::from_str(&self.status)
                .ok_or_else(|| anyhow!("unknown status '{}'", self.status))?,
            exit_reason: self.exit_reason.as_deref().and_then(ExitReason::from_str),
            opened_at: parse_ts(&self.opened_at)?,
            last_check_at: parse_ts_opt(self.last_check_at)?,
            closed_at: parse_ts_opt(self.closed_at)?,
            realized_pnl_usd: parse_dec_opt(self.realized_pnl_usd)?,
            cumulative_funding_usd: parse_dec(&self.cumulative_funding_usd)?,
            total_fees_usd: parse_dec(&self.total_fees_usd)?,
        })
    }
}

#[async_trait]
impl PositionStore for SqlitePositionStore {
    async fn create(&self, position: &Position) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO positions \
             (id, symbol, long_venue, short_venue, size_usd, entry_long_price, \
              entry_short_price, entry_long_rate, entry_short_rate, entry_divergence, \
              current_divergence, status, exit_reason, opened_at, last_check_at, \
              closed_at, realized_pnl_usd, cumulative_funding_usd, total_fees_usd, metadata) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, NULL)",
            params![
                position.id.to_string(),
                &position.symbol,
                &position.long_venue,
                &position.short_venue,
                position.size_usd.to_string(),
                position.entry_long_price.to_string(),
                position.entry_short_price.to_string(),
                position.entry_long_rate.to_string(),
                position.entry_short_rate.to_string(),
                position.entry_divergence.to_string(),
                position.current_divergence.map(|d| d.to_string()),
                position.status.as_str(),
                position.exit_reason.map(|r| r.as_str()),
                position.opened_at.to_rfc3339(),
                position.last_check_at.map(|t| t.to_rfc3339()),
                position.closed_at.map(|t| t.to_rfc3339()),
                position.realized_pnl_usd.map(|d| d.to_string()),
                position.cumulative_funding_usd.to_string(),
                position.total_fees_usd.to_string(),
            ],
        )
        .context("insert position")?;
        Ok(())
    }

    async fn update(&self, position: &Position) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE positions SET \
                 current_divergence = ?2, status = ?3, exit_reason = ?4, \
                 last_check_at = ?5, closed_at = ?6, realized_pnl_usd = ?7, \
                 cumulative_funding_usd = ?8, total_fees_usd = ?9, \
                 entry_long_price = ?10, entry_short_price = ?11 \
                 WHERE id = ?1",
                params![
                    position.id.to_string(),
                    position.current_divergence.map(|d| d.to_string()),
                    position.status.as_str(),
                    position.exit_reason.map(|r| r.as_str()),
                    position.last_check_at.map(|t| t.to_rfc3339()),
                    position.closed_at.map(|t| t.to_rfc3339()),
                    position.realized_pnl_usd.map(|d| d.to_string()),
                    position.cumulative_funding_usd.to_string(),
                    position.total_fees_usd.to_string(),
                    position.entry_long_price.to_string(),
                    position.entry_short_price.to_string(),
                ],
            )
            .context("update position")?;
        if changed == 0 {
            return Err(anyhow!("position {} not found", position.id));
        }
        Ok(())
    }

    async fn close(
        &self,
        id: Uuid,
        reason: ExitReason,
        realized_pnl: Decimal,
        closed_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE positions SET status = 'CLOSED', exit_reason = ?2, \
                 realized_pnl_usd = ?3, closed_at = ?4 WHERE id = ?1",
                params![
                    id.to_string(),
                    reason.as_str(),
                    realized_pnl.to_string(),
                    closed_at.to_rfc3339(),
                ],
            )
            .context("close position")?;
        if changed == 0 {
            return Err(anyhow!("position {} not found", id));
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Position>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM positions WHERE id = ?1 LIMIT 1",
            POSITION_COLUMNS
        ))?;
        let mut rows = stmt.query(params![id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(RawPosition::from_row(row)?.into_position()?)),
            None => Ok(None),
        }
    }

    async fn list_open(&self) -> Result<Vec<Position>> {
        self.list_by_status(&[PositionStatus::Open]).await
    }

    async fn list_by_status(&self, statuses: &[PositionStatus]) -> Result<Vec<Position>> {
        let conn = self.conn.lock().await;
        let placeholders: Vec<String> = (1..=statuses.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "SELECT {} FROM positions WHERE status IN ({}) ORDER BY opened_at ASC",
            POSITION_COLUMNS,
            placeholders.join(", ")
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let status_params: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        let raw_rows = stmt.query_map(rusqlite::params_from_iter(status_params), |row| {
            RawPosition::from_row(row)
        })?;

        let mut positions = Vec::new();
        for raw in raw_rows {
            positions.push(raw?.into_position()?);
        }
        Ok(positions)
    }

    async fn record_funding(&self, payment: &FundingPayment) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "INSERT OR IGNORE INTO funding_payments \
                 (id, position_id, venue, symbol, amount_usd, paid_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    Uuid::new_v4().to_string(),
                    payment.position_id.to_string(),
                    &payment.venue,
                    &payment.symbol,
                    payment.amount_usd.to_string(),
                    payment.paid_at.to_rfc3339(),
                ],
            )
            .context("insert funding payment")?;
        Ok(changed > 0)
    }

    async fn list_funding(&self, position_id: Uuid) -> Result<Vec<FundingPayment>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT position_id, venue, symbol, amount_usd, paid_at \
             FROM funding_payments WHERE position_id = ?1 ORDER BY paid_at ASC",
        )?;
        let raw_rows = stmt.query_map(params![position_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut payments = Vec::new();
        for raw in raw_rows {
            let (pid, venue, symbol, amount, paid_at) = raw?;
            payments.push(FundingPayment {
                position_id: Uuid::parse_str(&pid).context("parse payment position id")?,
                venue,
                symbol,
                amount_usd: parse_dec(&amount)?,
                paid_at: parse_ts(&paid_at)?,
            });
        }
        Ok(payments)
    }

    async fn load_state(&self, name: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare_cached("SELECT state_data FROM strategy_state WHERE name = ?1 LIMIT 1")?;
        let mut rows = stmt.query(params![name])?;
        match rows.next()? {
            Some(row) => {
                let raw: String = row.get(0)?;
                Ok(Some(
                    serde_json::from_str(&raw).context("parse strategy state")?,
                ))
            }
            None => Ok(None),
        }
    }

    async fn save_state(&self, name: &str, value: &serde_json::Value) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO strategy_state (name, state_data, updated_at) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT(name) DO UPDATE SET \
                state_data = excluded.state_data, \
                updated_at = excluded.updated_at",
            params![name, value.to_string(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn store() -> (SqlitePositionStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        (
            SqlitePositionStore::new(path.to_str().unwrap()).unwrap(),
            dir,
        )
    }

    fn position() -> Position {
        Position {
            id: Uuid::new_v4(),
            symbol: "BTC".into(),
            long_venue: "aster".into(),
            short_venue: "lighter".into(),
            size_usd: dec!(1000),
            entry_long_price: dec!(50000.5),
            entry_short_price: dec!(50001.5),
            entry_long_rate: dec!(-0.0000000278),
            entry_short_rate: dec!(0.0000000556),
            entry_divergence: dec!(0.0000000834),
            current_divergence: None,
            cumulative_funding_usd: Decimal::ZERO,
            total_fees_usd: dec!(0.4),
            status: PositionStatus::Opening,
            exit_reason: None,
            opened_at: Utc::now(),
            last_check_at: None,
            closed_at: None,
            realized_pnl_usd: None,
        }
    }

    #[tokio::test]
    async fn test_decimal_round_trip_is_exact() {
        let (store, _dir) = store();
        let p = position();
        store.create(&p).await.unwrap();

        let got = store.get(p.id).await.unwrap().unwrap();
        assert_eq!(got.entry_divergence, dec!(0.0000000834));
        assert_eq!(got.entry_long_price, dec!(50000.5));
        assert_eq!(got.size_usd, dec!(1000));
        assert_eq!(got.status, PositionStatus::Opening);
    }

    #[tokio::test]
    async fn test_status_transitions_and_listing() {
        let (store, _dir) = store();
        let mut p = position();
        store.create(&p).await.unwrap();

        assert!(store.list_open().await.unwrap().is_empty());
        let reconcilable = store
            .list_by_status(&[PositionStatus::Opening, PositionStatus::Closing])
            .await
            .unwrap();
        assert_eq!(reconcilable.len(), 1);

        p.status = PositionStatus::Open;
        p.current_divergence = Some(dec!(0.00000005));
        p.last_check_at = Some(Utc::now());
        store.update(&p).await.unwrap();
        assert_eq!(store.list_open().await.unwrap().len(), 1);

        store
            .close(p.id, ExitReason::TimeLimit, dec!(-0.1), Utc::now())
            .await
            .unwrap();
        let got = store.get(p.id).await.unwrap().unwrap();
        assert_eq!(got.status, PositionStatus::Closed);
        assert_eq!(got.exit_reason, Some(ExitReason::TimeLimit));
    }

    #[tokio::test]
    async fn test_funding_unique_key() {
        let (store, _dir) = store();
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
        assert!(!store.record_funding(&payment).await.unwrap());

        // A different venue at the same instant is a distinct payment.
        let other = FundingPayment {
            venue: "aster".into(),
            ..payment.clone()
        };
        assert!(store.record_funding(&other).await.unwrap());
        assert_eq!(store.list_funding(p.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_update_unknown_position_errors() {
        let (store, _dir) = store();
        assert!(store.update(&position()).await.is_err());
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        {
            let store = SqlitePositionStore::new(path.to_str().unwrap()).unwrap();
            store
                .save_state("session", &serde_json::json!({"opened": 1}))
                .await
                .unwrap();
        }
        let store = SqlitePositionStore::new(path.to_str().unwrap()).unwrap();
        let got = store.load_state("session").await.unwrap().unwrap();
        assert_eq!(got["opened"], 1);
    }
}
