//! Three-phase strategy loop.
//!
//! Every tick: monitor open pairs, close what the exit rules flag, open the
//! best new opportunity capacity allows. Phase 1 is read-mostly and runs
//! per-position work concurrently; Phases 2 and 3 serialize on a
//! per-position mutex so a close and a re-open can never interleave.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use futures_util::future::join_all;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::execution::atomic::{AtomicMultiOrderExecutor, AtomicOrderSpec};
use crate::execution::hedge::OperationMode;
use crate::execution::order_executor::{ExecMode, OrderExecutor};
use crate::funding::service::{FundingSource, OpportunityQuery};
use crate::market::FeeModel;
use crate::market::{AssumedLiquidity, BookTickerCache};
use crate::models::{
    ExitReason, FundingPayment, Opportunity, Position, PositionStatus, Side,
};
use crate::store::PositionStore;
use crate::strategy::exits::{ExitContext, RiskEvaluator};
use crate::venues::VenueAdapter;

const SESSION_STATE_KEY: &str = "orchestrator_session";

/// Persisted slice of session policy, so a restart cannot double-open.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionState {
    single_position_opened: bool,
    /// Symbol -> last close time, for the re-entry cooldown.
    cooldowns: HashMap<String, DateTime<Utc>>,
}

/// Running totals reported in the shutdown summary.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    pub cycles: u64,
    pub entries_attempted: u64,
    pub entries_opened: u64,
    pub entries_rejected: u64,
    pub exits_triggered: u64,
    pub exits_by_reason: HashMap<&'static str, u64>,
    pub rollback_incidents: u64,
    pub funding_accrued_usd: Decimal,
    pub fees_paid_usd: Decimal,
}

/// Per-cycle structured summary.
#[derive(Debug, Default, Clone)]
pub struct CycleSummary {
    pub positions_monitored: usize,
    pub opportunities_considered: usize,
    pub entries_attempted: usize,
    pub entries_opened: usize,
    pub exits_triggered: usize,
    pub rollback_incidents: usize,
}

pub struct StrategyOrchestrator {
    config: AppConfig,
    venues: HashMap<String, Arc<dyn VenueAdapter>>,
    #[allow(dead_code)]
    cache: Arc<BookTickerCache>,
    fees: FeeModel,
    atomic: AtomicMultiOrderExecutor,
    executor: OrderExecutor,
    source: Arc<dyn FundingSource>,
    store: Arc<dyn PositionStore>,
    evaluator: RiskEvaluator,
    /// Per-position serialization for Phases 2 and 3.
    locks: parking_lot::Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    session: parking_lot::Mutex<SessionState>,
    stats: parking_lot::Mutex<SessionStats>,
    fatal_incident: AtomicBool,
}

impl StrategyOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AppConfig,
        venues: HashMap<String, Arc<dyn VenueAdapter>>,
        cache: Arc<BookTickerCache>,
        fees: FeeModel,
        atomic: AtomicMultiOrderExecutor,
        executor: OrderExecutor,
        source: Arc<dyn FundingSource>,
        store: Arc<dyn PositionStore>,
    ) -> Self {
        let evaluator = RiskEvaluator::new(config.rebalance.clone());
        Self {
            config,
            venues,
            cache,
            fees,
            atomic,
            executor,
            source,
            store,
            evaluator,
            locks: parking_lot::Mutex::new(HashMap::new()),
            session: parking_lot::Mutex::new(SessionState::default()),
            stats: parking_lot::Mutex::new(SessionStats::default()),
            fatal_incident: AtomicBool::new(false),
        }
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.lock().clone()
    }

    /// True when a rollback incident occurred and the config says that is
    /// fatal (exit code 4).
    pub fn fatal_incident(&self) -> bool {
        self.fatal_incident.load(Ordering::Acquire)
    }

    fn position_lock(&self, id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.lock().entry(id).or_default().clone()
    }

    /// Main loop: reconcile once, then tick until shutdown. On shutdown the
    /// in-flight cycle gets a grace period to finish its rollback/close
    /// work before we persist and leave.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.load_session_state().await?;
        self.reconcile().await?;

        let tick = Duration::from_secs(self.config.tick_interval_seconds.max(1));
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = cancel.cancelled() => break,
            }

            // A shutdown arriving mid-cycle gives the cycle a grace period
            // to finish its rollback/close work before we bail out.
            let grace = Duration::from_secs(self.config.shutdown_grace_seconds);
            let cycle = self.execute_cycle(&cancel);
            tokio::pin!(cycle);
            let summary = tokio::select! {
                result = &mut cycle => result,
                _ = cancel.cancelled() => {
                    match tokio::time::timeout(grace, &mut cycle).await {
                        Ok(result) => result,
                        Err(_) => {
                            warn!("shutdown grace period expired mid-cycle");
                            break;
                        }
                    }
                }
            };

            match summary {
                Ok(summary) => {
                    info!(
                        monitored = summary.positions_monitored,
                        considered = summary.opportunities_considered,
                        entries_attempted = summary.entries_attempted,
                        entries_opened = summary.entries_opened,
                        exits = summary.exits_triggered,
                        incidents = summary.rollback_incidents,
                        "cycle complete"
                    );
                }
                Err(e) => error!(error = %e, "cycle failed"),
            }

            if self.fatal_incident() {
                error!("rollback incident is configured as fatal; stopping");
                break;
            }
            if cancel.is_cancelled() {
                break;
            }
        }

        self.save_session_state().await.ok();
        self.log_session_summary();
        Ok(())
    }

    fn log_session_summary(&self) {
        let stats = self.stats.lock();
        info!(
            cycles = stats.cycles,
            entries_attempted = stats.entries_attempted,
            entries_opened = stats.entries_opened,
            entries_rejected = stats.entries_rejected,
            exits = stats.exits_triggered,
            rollback_incidents = stats.rollback_incidents,
            funding_accrued_usd = %stats.funding_accrued_usd,
            fees_paid_usd = %stats.fees_paid_usd,
            "session summary"
        );
        for (reason, count) in &stats.exits_by_reason {
            info!(reason, count, "exits by reason");
        }
    }

    /// One monitor/close/open pass.
    pub async fn execute_cycle(&self, cancel: &CancellationToken) -> Result<CycleSummary> {
        let mut summary = CycleSummary::default();
        self.stats.lock().cycles += 1;

        // Phase 1: monitor, concurrently across positions.
        let open_positions = self.store.list_open().await?;
        summary.positions_monitored = open_positions.len();
        let monitors = open_positions
            .iter()
            .map(|p| self.monitor_position(p.clone()));
        for result in join_all(monitors).await {
            if let Err(e) = result {
                warn!(error = %e, "monitor failed for a position");
            }
        }

        if cancel.is_cancelled() {
            return Ok(summary);
        }

        // Phase 2: close what the exit rules flag, and re-drive any
        // close that did not finish last cycle.
        let candidates = self
            .store
            .list_by_status(&[PositionStatus::Open, PositionStatus::Closing])
            .await?;
        for position in candidates {
            if cancel.is_cancelled() {
                return Ok(summary);
            }
            let lock = self.position_lock(position.id);
            let _guard = lock.lock().await;
            // State may have moved while we waited on the lock.
            let Some(position) = self.store.get(position.id).await? else {
                continue;
            };
            match position.status {
                PositionStatus::Open => {
                    if let Some(reason) = self.should_exit(&position).await? {
                        summary.exits_triggered += 1;
                        self.close_position(position, reason, cancel).await?;
                    }
                }
                PositionStatus::Closing => {
                    let reason = position.exit_reason.unwrap_or(ExitReason::Reconciliation);
                    self.close_position(position, reason, cancel).await?;
                }
                _ => {}
            }
        }

        if cancel.is_cancelled() {
            return Ok(summary);
        }

        // Phase 3: open, capacity and session policy permitting.
        let (considered, attempted, opened, incidents) = self.open_phase(cancel).await?;
        summary.opportunities_considered = considered;
        summary.entries_attempted = attempted;
        summary.entries_opened = opened;
        summary.rollback_incidents = incidents;

        Ok(summary)
    }

    /// Phase 1 for one position: refresh divergence and accrue funding.
    async fn monitor_position(&self, mut position: Position) -> Result<()> {
        let now = Utc::now();
        let comparison = self
            .source
            .compare(
                &position.symbol,
                &position.long_venue,
                &position.short_venue,
            )
            .await
            .with_context(|| format!("compare rates for {}", position.symbol))?;

        let divergence = Decimal::from_f64(comparison.divergence).unwrap_or(Decimal::ZERO);
        position.current_divergence = Some(divergence);
        position.last_check_at = Some(now);

        // Accrue from the last recorded payment, not just the latest
        // boundary: slow ticks or downtime must not lose intervals.
        let accrued_through = self
            .store
            .list_funding(position.id)
            .await?
            .last()
            .map(|p| p.paid_at)
            .unwrap_or(position.opened_at)
            .max(position.opened_at);

        for payment in self.estimate_funding(&position, divergence, accrued_through, now) {
            // The unique (venue, symbol, paid_at) key makes the interval
            // accrual idempotent across cycles.
            if self.store.record_funding(&payment).await? {
                position.cumulative_funding_usd += payment.amount_usd;
                self.stats.lock().funding_accrued_usd += payment.amount_usd;
                debug!(
                    position = %position.id,
                    amount = %payment.amount_usd,
                    paid_at = %payment.paid_at,
                    "funding interval accrued"
                );
            }
        }

        self.store.update(&position).await
    }

    /// Interval-aligned funding estimates: one payment per completed
    /// funding interval of the short (receiving) venue between the accrual
    /// watermark and `now`, valued at the current divergence. A
    /// non-positive divergence contributes nothing, which keeps the
    /// cumulative series non-decreasing.
    fn estimate_funding(
        &self,
        position: &Position,
        divergence: Decimal,
        accrued_through: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Vec<FundingPayment> {
        if divergence <= Decimal::ZERO {
            return Vec::new();
        }
        let Some(venue) = self.venues.get(&position.short_venue) else {
            return Vec::new();
        };
        let interval = venue.spec().funding_interval_secs as i64;
        if interval <= 0 {
            return Vec::new();
        }

        let amount = divergence * Decimal::from(interval) * position.size_usd;
        // First boundary strictly after the watermark; a recorded payment
        // sits exactly on its boundary so this never double-counts.
        let mut boundary_ts = (accrued_through.timestamp() / interval + 1) * interval;
        let latest_ts = (now.timestamp() / interval) * interval;

        let mut payments = Vec::new();
        while boundary_ts <= latest_ts {
            if let Some(boundary) = Utc.timestamp_opt(boundary_ts, 0).single() {
                if boundary > position.opened_at {
                    payments.push(FundingPayment {
                        position_id: position.id,
                        venue: position.short_venue.clone(),
                        symbol: position.symbol.clone(),
                        amount_usd: amount,
                        paid_at: boundary,
                    });
                }
            }
            boundary_ts += interval;
        }
        payments
    }

    /// Phase 2 decision inputs for one open position.
    async fn should_exit(&self, position: &Position) -> Result<Option<ExitReason>> {
        let current_divergence = position.current_divergence.unwrap_or(position.entry_divergence);
        let best_alternative = if self.config.rebalance.enable_better_opportunity {
            self.source.best(&position.symbol).await.unwrap_or_else(|e| {
                warn!(error = %e, "best-opportunity lookup failed");
                None
            })
        } else {
            None
        };
        let round_trip_cost_usd = self
            .fees
            .round_trip_cost_usd(
                &position.long_venue,
                &position.short_venue,
                position.size_usd,
                AssumedLiquidity::Taker,
            )
            .unwrap_or(Decimal::ZERO);

        let ctx = ExitContext {
            now: Utc::now(),
            current_divergence,
            best_alternative,
            round_trip_cost_usd,
        };
        Ok(self.evaluator.evaluate(position, &ctx))
    }

    /// Issue both closing legs atomically, reduce-only, with the CLOSING
    /// hedge profile. An incomplete close stays CLOSING and is re-driven
    /// next cycle.
    async fn close_position(
        &self,
        mut position: Position,
        reason: ExitReason,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (long_venue, short_venue) = match (
            self.venues.get(&position.long_venue),
            self.venues.get(&position.short_venue),
        ) {
            (Some(l), Some(s)) => (l.clone(), s.clone()),
            _ => {
                warn!(position = %position.id, "venue no longer configured; cannot close");
                return Ok(());
            }
        };

        // Flush the transition before touching the venues.
        if position.status != PositionStatus::Closing {
            position.status = PositionStatus::Closing;
            position.exit_reason = Some(reason);
            self.store.update(&position).await?;
            info!(
                position = %position.id,
                symbol = %position.symbol,
                reason = reason.as_str(),
                "closing position"
            );
        }

        // Close what is actually on the venues, not what we remember.
        let long_qty = long_venue
            .position_qty(&position.symbol)
            .await
            .unwrap_or_else(|_| position.long_qty());
        let short_qty = short_venue
            .position_qty(&position.symbol)
            .await
            .unwrap_or_else(|_| -position.short_qty());

        // A degenerate pair (a side already flat, e.g. a re-driven close
        // whose leg landed last cycle) cannot go through the two-leg
        // executor: flatten any leftover side and settle the books.
        if long_qty <= Decimal::ZERO || short_qty >= Decimal::ZERO {
            self.force_flatten(&position).await;
            let realized = position.cumulative_funding_usd - position.total_fees_usd;
            let now = Utc::now();
            self.store.close(position.id, reason, realized, now).await?;
            self.evaluator.forget(position.id);
            self.session.lock().cooldowns.insert(position.symbol.clone(), now);
            self.save_session_state().await.ok();
            let mut stats = self.stats.lock();
            stats.exits_triggered += 1;
            *stats.exits_by_reason.entry(reason.as_str()).or_insert(0) += 1;
            return Ok(());
        }

        let close_long = AtomicOrderSpec {
            venue: long_venue,
            symbol: position.symbol.clone(),
            side: Side::Sell,
            size_usd: position.size_usd,
            mode: ExecMode::LimitWithFallback,
            qty_override: Some(long_qty.max(Decimal::ZERO)),
        };
        let close_short = AtomicOrderSpec {
            venue: short_venue,
            symbol: position.symbol.clone(),
            side: Side::Buy,
            size_usd: position.size_usd,
            mode: ExecMode::LimitWithFallback,
            qty_override: Some((-short_qty).max(Decimal::ZERO)),
        };

        let result = match self
            .atomic
            .execute_atomic(close_short, close_long, false, OperationMode::Closing, cancel)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                warn!(position = %position.id, error = %e, "close attempt failed; will retry");
                return Ok(());
            }
        };

        position.total_fees_usd += result.total_fees_usd();

        if !result.all_filled {
            warn!(
                position = %position.id,
                "close incomplete; position stays CLOSING for next cycle"
            );
            self.store.update(&position).await?;
            return Ok(());
        }

        // result.long is the buy leg (short venue), result.short the sell
        // leg (long venue) because of the argument order above.
        let exit_short_price = result.long.avg_price;
        let exit_long_price = result.short.avg_price;
        let qty_long = result.short.filled_qty;
        let qty_short = result.long.filled_qty;

        let price_pnl = (exit_long_price - position.entry_long_price) * qty_long
            + (position.entry_short_price - exit_short_price) * qty_short;
        let realized =
            price_pnl + position.cumulative_funding_usd - position.total_fees_usd;

        let now = Utc::now();
        self.store.close(position.id, reason, realized, now).await?;
        self.evaluator.forget(position.id);

        {
            let mut session = self.session.lock();
            session.cooldowns.insert(position.symbol.clone(), now);
        }
        self.save_session_state().await.ok();

        {
            let mut stats = self.stats.lock();
            stats.exits_triggered += 1;
            *stats.exits_by_reason.entry(reason.as_str()).or_insert(0) += 1;
            stats.fees_paid_usd += result.total_fees_usd();
        }

        info!(
            position = %position.id,
            symbol = %position.symbol,
            reason = reason.as_str(),
            realized_pnl_usd = %realized,
            "position closed"
        );
        Ok(())
    }

    /// Phase 3: rank, filter, size and enter.
    async fn open_phase(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(usize, usize, usize, usize)> {
        if self.config.session.single_position_per_session
            && self.session.lock().single_position_opened
        {
            debug!("single-position session already consumed; skipping open phase");
            return Ok((0, 0, 0, 0));
        }

        let live = self
            .store
            .list_by_status(&[
                PositionStatus::Open,
                PositionStatus::Opening,
                PositionStatus::Closing,
            ])
            .await?;
        if live.len() >= self.config.max_positions {
            debug!(open = live.len(), "at capacity; skipping open phase");
            return Ok((0, 0, 0, 0));
        }

        let query = OpportunityQuery {
            min_profit: Some(self.config.min_profit_apy),
            max_oi_usd: self.config.max_oi_usd,
            dexes: self.venues.keys().cloned().collect(),
            symbols: self.config.symbols.clone(),
        };
        let mut opportunities = self.source.opportunities(&query).await?;
        let considered = opportunities.len();
        // Service ranking is advisory; order locally by our own criteria.
        opportunities.sort_by(|a, b| {
            b.net_apy
                .cmp(&a.net_apy)
                .then(b.min_volume_24h_usd.cmp(&a.min_volume_24h_usd))
                .then(a.symbol.cmp(&b.symbol))
        });

        let now = Utc::now();
        let cooldown = chrono::Duration::seconds(self.config.cooldown_seconds as i64);
        let live_symbols: Vec<String> = live.iter().map(|p| p.symbol.clone()).collect();

        let mut attempted = 0usize;
        let mut opened = 0usize;
        let mut incidents = 0usize;
        let mut slots = self.config.max_positions - live.len();

        for opportunity in opportunities {
            if attempted >= self.config.max_new_per_cycle || slots == 0 || cancel.is_cancelled() {
                break;
            }
            if !self.venues.contains_key(&opportunity.long_venue)
                || !self.venues.contains_key(&opportunity.short_venue)
            {
                continue;
            }
            if live_symbols.contains(&opportunity.symbol) {
                continue;
            }
            {
                let session = self.session.lock();
                if let Some(last_close) = session.cooldowns.get(&opportunity.symbol) {
                    if now - *last_close < cooldown {
                        debug!(symbol = %opportunity.symbol, "symbol in cooldown");
                        continue;
                    }
                }
            }

            attempted += 1;
            match self.try_open(&opportunity, cancel).await {
                Ok(OpenOutcome::Opened) => {
                    opened += 1;
                    slots -= 1;
                    if self.config.session.single_position_per_session {
                        self.session.lock().single_position_opened = true;
                        self.save_session_state().await.ok();
                        break;
                    }
                }
                Ok(OpenOutcome::Rejected) => {}
                Ok(OpenOutcome::Incident) => incidents += 1,
                Err(e) => warn!(symbol = %opportunity.symbol, error = %e, "entry attempt errored"),
            }
        }

        Ok((considered, attempted, opened, incidents))
    }

    async fn try_open(
        &self,
        opportunity: &Opportunity,
        cancel: &CancellationToken,
    ) -> Result<OpenOutcome> {
        let size_usd = self.config.max_position_size_usd;
        let long_venue = self.venues[&opportunity.long_venue].clone();
        let short_venue = self.venues[&opportunity.short_venue].clone();
        let now = Utc::now();

        // Journal the intent before any venue sees an order.
        let mut position = Position {
            id: Uuid::new_v4(),
            symbol: opportunity.symbol.clone(),
            long_venue: opportunity.long_venue.clone(),
            short_venue: opportunity.short_venue.clone(),
            size_usd,
            entry_long_price: Decimal::ZERO,
            entry_short_price: Decimal::ZERO,
            entry_long_rate: opportunity.long_rate,
            entry_short_rate: opportunity.short_rate,
            entry_divergence: opportunity.divergence,
            current_divergence: Some(opportunity.divergence),
            cumulative_funding_usd: Decimal::ZERO,
            total_fees_usd: Decimal::ZERO,
            status: PositionStatus::Opening,
            exit_reason: None,
            opened_at: now,
            last_check_at: None,
            closed_at: None,
            realized_pnl_usd: None,
        };
        self.store.create(&position).await?;
        self.stats.lock().entries_attempted += 1;

        let lock = self.position_lock(position.id);
        let _guard = lock.lock().await;

        let long_leg = AtomicOrderSpec {
            venue: long_venue,
            symbol: opportunity.symbol.clone(),
            side: Side::Buy,
            size_usd,
            mode: ExecMode::LimitWithFallback,
            qty_override: None,
        };
        let short_leg = AtomicOrderSpec {
            venue: short_venue,
            symbol: opportunity.symbol.clone(),
            side: Side::Sell,
            size_usd,
            mode: ExecMode::LimitWithFallback,
            qty_override: None,
        };

        let result = match self
            .atomic
            .execute_atomic(long_leg, short_leg, true, OperationMode::Opening, cancel)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                debug!(symbol = %opportunity.symbol, error = %e, "entry pre-flight failed");
                position.status = PositionStatus::Failed;
                self.store.update(&position).await?;
                self.stats.lock().entries_rejected += 1;
                return Ok(OpenOutcome::Rejected);
            }
        };

        if result.all_filled {
            position.entry_long_price = result.long.avg_price;
            position.entry_short_price = result.short.avg_price;
            position.total_fees_usd = result.total_fees_usd();
            position.status = PositionStatus::Open;
            self.store.update(&position).await?;
            {
                let mut stats = self.stats.lock();
                stats.entries_opened += 1;
                stats.fees_paid_usd += result.total_fees_usd();
            }
            info!(
                position = %position.id,
                symbol = %position.symbol,
                long = %position.long_venue,
                short = %position.short_venue,
                size_usd = %position.size_usd,
                entry_divergence = %position.entry_divergence,
                leverage = result.leverage_used,
                "position opened"
            );
            return Ok(OpenOutcome::Opened);
        }

        // Entry did not complete; the atomic executor has already restored
        // net-zero exposure or reported an incident.
        position.status = PositionStatus::Failed;
        position.total_fees_usd = result.total_fees_usd();
        self.store.update(&position).await?;
        self.stats.lock().entries_rejected += 1;

        if let Some(incident) = &result.incident {
            error!(incident = %incident, position = %position.id, "rollback incident");
            self.stats.lock().rollback_incidents += 1;
            if !self.config.continue_on_rollback_incident {
                self.fatal_incident.store(true, Ordering::Release);
            }
            return Ok(OpenOutcome::Incident);
        }
        if result.rollback_performed {
            info!(
                position = %position.id,
                rollback_cost_usd = %result.rollback_cost_usd,
                "entry rolled back"
            );
        }
        Ok(OpenOutcome::Rejected)
    }

    /// Startup pass over journal rows that were mid-flight when the last
    /// process died. OPENING entries are force-flattened (never re-driven:
    /// the book has moved during downtime). CLOSING entries re-drive
    /// through the normal Phase 2 path on the first cycle.
    pub async fn reconcile(&self) -> Result<()> {
        let stuck = self
            .store
            .list_by_status(&[PositionStatus::Opening])
            .await?;
        for mut position in stuck {
            warn!(
                position = %position.id,
                symbol = %position.symbol,
                "reconciling half-open entry from previous run"
            );
            self.force_flatten(&position).await;
            position.status = PositionStatus::Failed;
            position.exit_reason = Some(ExitReason::Reconciliation);
            self.store.update(&position).await?;
        }
        Ok(())
    }

    /// Reduce-only market out whatever residual the venues report.
    async fn force_flatten(&self, position: &Position) {
        for venue_name in [&position.long_venue, &position.short_venue] {
            let Some(venue) = self.venues.get(venue_name) else {
                continue;
            };
            let qty = match venue.position_qty(&position.symbol).await {
                Ok(q) => q,
                Err(e) => {
                    error!(venue = %venue_name, error = %e, "cannot query residual position");
                    continue;
                }
            };
            if qty.is_zero() {
                continue;
            }
            let side = if qty > Decimal::ZERO {
                Side::Sell
            } else {
                Side::Buy
            };
            let flatten = self
                .executor
                .execute(
                    venue,
                    &position.symbol,
                    side,
                    qty.abs(),
                    ExecMode::MarketOnly,
                    true,
                    &CancellationToken::new(),
                )
                .await;
            match flatten {
                Ok(outcome) if outcome.filled_qty == qty.abs() => {
                    info!(
                        venue = %venue_name,
                        symbol = %position.symbol,
                        qty = %qty,
                        "residual exposure flattened"
                    );
                }
                Ok(outcome) => {
                    error!(
                        venue = %venue_name,
                        symbol = %position.symbol,
                        residual = %(qty.abs() - outcome.filled_qty),
                        "residual exposure NOT fully flattened; operator action required"
                    );
                }
                Err(e) => {
                    error!(venue = %venue_name, error = %e, "flatten failed; operator action required");
                }
            }
        }
    }

    async fn load_session_state(&self) -> Result<()> {
        if let Some(raw) = self.store.load_state(SESSION_STATE_KEY).await? {
            match serde_json::from_value::<SessionState>(raw) {
                Ok(state) => {
                    *self.session.lock() = state;
                }
                Err(e) => warn!(error = %e, "could not parse session state; starting fresh"),
            }
        }
        Ok(())
    }

    async fn save_session_state(&self) -> Result<()> {
        let value = {
            let session = self.session.lock();
            serde_json::to_value(&*session)?
        };
        self.store.save_state(SESSION_STATE_KEY, &value).await
    }
}

enum OpenOutcome {
    Opened,
    Rejected,
    Incident,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::models::VenueSpec;
    use rust_decimal_macros::dec;

    fn config() -> AppConfig {
        toml::from_str(
            r#"
                [[exchanges]]
                name = "lighter"
                funding_interval_secs = 3600

                [[exchanges]]
                name = "aster"
                funding_interval_secs = 28800
            "#,
        )
        .unwrap()
    }

    fn position(opened_at: DateTime<Utc>) -> Position {
        Position {
            id: Uuid::new_v4(),
            symbol: "BTC".into(),
            long_venue: "aster".into(),
            short_venue: "lighter".into(),
            size_usd: dec!(1000),
            entry_long_price: dec!(50000),
            entry_short_price: dec!(50001),
            entry_long_rate: Decimal::ZERO,
            entry_short_rate: dec!(0.0000001),
            entry_divergence: dec!(0.0000001),
            current_divergence: None,
            cumulative_funding_usd: Decimal::ZERO,
            total_fees_usd: Decimal::ZERO,
            status: PositionStatus::Open,
            exit_reason: None,
            opened_at,
            last_check_at: None,
            closed_at: None,
            realized_pnl_usd: None,
        }
    }

    fn orchestrator() -> StrategyOrchestrator {
        use crate::config::{HedgeConfig, LiquidityConfig, OrderConfig};
        use crate::execution::hedge::HedgeManager;
        use crate::funding::StaticFundingSource;
        use crate::market::LiquidityAnalyzer;
        use crate::store::MemoryPositionStore;
        use crate::venues::mock::MockVenue;

        let config = config();
        let cache = Arc::new(BookTickerCache::default());
        let specs: Vec<VenueSpec> = config.venue_specs();
        let fees = FeeModel::from_specs(&specs);

        let mut venues: HashMap<String, Arc<dyn VenueAdapter>> = HashMap::new();
        for spec in &specs {
            venues.insert(
                spec.name.clone(),
                Arc::new(MockVenue::new(spec.clone(), 20).with_cache(cache.clone())),
            );
        }

        let executor = OrderExecutor::new(cache.clone(), OrderConfig::default());
        let hedge = HedgeManager::new(
            cache.clone(),
            HedgeConfig::default(),
            Duration::from_millis(50),
        );
        let atomic = AtomicMultiOrderExecutor::new(
            cache.clone(),
            OrderExecutor::new(cache.clone(), OrderConfig::default()),
            hedge,
            LiquidityAnalyzer::new(LiquidityConfig::default()),
            config.execution.atomic.clone(),
        );

        StrategyOrchestrator::new(
            config,
            venues,
            cache,
            fees,
            atomic,
            executor,
            Arc::new(StaticFundingSource::default()),
            Arc::new(MemoryPositionStore::new()),
        )
    }

    #[test]
    fn test_funding_estimate_covers_every_completed_interval() {
        let orch = orchestrator();
        let opened = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        let p = position(opened);

        // Short venue (lighter) pays hourly. Two completed hour boundaries
        // have passed, so two interval payments accrue.
        let now = opened + chrono::Duration::seconds(2 * 3600 + 120);
        let payments = orch.estimate_funding(&p, dec!(0.0000001), opened, now);
        assert_eq!(payments.len(), 2);
        for payment in &payments {
            assert_eq!(payment.venue, "lighter");
            assert_eq!(payment.paid_at.timestamp() % 3600, 0);
            assert!(payment.paid_at > opened);
            // 1e-7 per second * 3600 s * $1000 = $0.36
            assert_eq!(payment.amount_usd, dec!(0.36));
        }
        assert!(payments[0].paid_at < payments[1].paid_at);

        // Same cycle repeated: same boundaries, same keys.
        let again = orch.estimate_funding(&p, dec!(0.0000001), opened, now);
        assert_eq!(again[0].paid_at, payments[0].paid_at);
        assert_eq!(again[1].paid_at, payments[1].paid_at);
    }

    #[test]
    fn test_funding_estimate_resumes_from_watermark() {
        let orch = orchestrator();
        let opened = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        let p = position(opened);

        // Five hours elapse but the first two boundaries are already
        // recorded: only the three missing ones are generated, starting
        // right after the watermark.
        let now = opened + chrono::Duration::seconds(5 * 3600 + 120);
        let all = orch.estimate_funding(&p, dec!(0.0000001), opened, now);
        assert_eq!(all.len(), 5);

        let watermark = all[1].paid_at;
        let resumed = orch.estimate_funding(&p, dec!(0.0000001), watermark, now);
        assert_eq!(resumed.len(), 3);
        assert_eq!(resumed[0].paid_at, all[2].paid_at);
        assert_eq!(resumed.last().unwrap().paid_at, all[4].paid_at);
    }

    #[test]
    fn test_funding_estimate_skips_incomplete_interval() {
        let orch = orchestrator();
        // Opened mid-interval; no boundary has completed yet.
        let opened = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        let p = position(opened);
        let now = opened + chrono::Duration::seconds(60);
        assert!(orch
            .estimate_funding(&p, dec!(0.0000001), opened, now)
            .is_empty());
    }

    #[test]
    fn test_negative_divergence_never_accrues() {
        let orch = orchestrator();
        let opened = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        let p = position(opened);
        let now = opened + chrono::Duration::seconds(7200);
        assert!(orch
            .estimate_funding(&p, dec!(-0.0000001), opened, now)
            .is_empty());
    }
}
