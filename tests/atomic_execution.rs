//! End-to-end atomic entry scenarios against scriptable mock venues:
//! the happy path, the hedged partial fill, the full rollback and
//! leverage normalization.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio_util::sync::CancellationToken;

use basisbot_backend::config::{AtomicConfig, HedgeConfig, LiquidityConfig, OrderConfig};
use basisbot_backend::execution::atomic::{AtomicMultiOrderExecutor, AtomicOrderSpec};
use basisbot_backend::execution::hedge::{HedgeManager, OperationMode};
use basisbot_backend::execution::order_executor::{ExecMode, OrderExecutor};
use basisbot_backend::execution::ModeUsed;
use basisbot_backend::market::{BookTickerCache, LiquidityAnalyzer};
use basisbot_backend::models::{Side, VenueSpec};
use basisbot_backend::venues::mock::{LimitBehavior, MarketBehavior, MockVenue};
use basisbot_backend::venues::VenueAdapter;

fn spec(name: &str, interval: u64, supports_leverage: bool) -> VenueSpec {
    VenueSpec {
        name: name.to_string(),
        funding_interval_secs: interval,
        maker_fee: dec!(0.0002),
        taker_fee: dec!(0.0005),
        supports_account_leverage: supports_leverage,
        has_full_depth: true,
    }
}

struct Setup {
    lighter: Arc<MockVenue>,
    aster: Arc<MockVenue>,
    atomic: AtomicMultiOrderExecutor,
}

fn setup() -> Setup {
    setup_with_leverage(20, true, 20, true)
}

fn setup_with_leverage(
    lighter_lev: u32,
    lighter_supports: bool,
    aster_lev: u32,
    aster_supports: bool,
) -> Setup {
    let cache = Arc::new(BookTickerCache::default());
    let lighter = Arc::new(
        MockVenue::new(spec("lighter", 3600, lighter_supports), lighter_lev)
            .with_cache(cache.clone()),
    );
    let aster = Arc::new(
        MockVenue::new(spec("aster", 28800, aster_supports), aster_lev)
            .with_cache(cache.clone()),
    );
    for venue in [&lighter, &aster] {
        venue.set_book("BTC", dec!(50000), dec!(50010));
        venue.set_tick_lot("BTC", dec!(1), dec!(0.001));
    }

    let order_config = OrderConfig {
        total_timeout_ms: 4_000,
        inside_tick_retries: 3,
        max_attempts: 5,
        poll_interval_ms: 50,
        staleness_limit_ms: 2_000,
    };
    let atomic = AtomicMultiOrderExecutor::new(
        cache.clone(),
        OrderExecutor::new(cache.clone(), order_config),
        HedgeManager::new(
            cache.clone(),
            HedgeConfig::default(),
            Duration::from_millis(50),
        ),
        LiquidityAnalyzer::new(LiquidityConfig::default()),
        AtomicConfig::default(),
    );

    Setup {
        lighter,
        aster,
        atomic,
    }
}

fn legs(setup: &Setup, size_usd: Decimal) -> (AtomicOrderSpec, AtomicOrderSpec) {
    let long = AtomicOrderSpec {
        venue: setup.aster.clone() as Arc<dyn VenueAdapter>,
        symbol: "BTC".into(),
        side: Side::Buy,
        size_usd,
        mode: ExecMode::LimitWithFallback,
        qty_override: None,
    };
    let short = AtomicOrderSpec {
        venue: setup.lighter.clone() as Arc<dyn VenueAdapter>,
        symbol: "BTC".into(),
        side: Side::Sell,
        size_usd,
        mode: ExecMode::LimitWithFallback,
        qty_override: None,
    };
    (long, short)
}

#[tokio::test(start_paused = true)]
async fn happy_path_both_legs_fill_as_limits() {
    let setup = setup();
    let (long, short) = legs(&setup, dec!(1000));
    let cancel = CancellationToken::new();

    let result = setup
        .atomic
        .execute_atomic(long, short, true, OperationMode::Opening, &cancel)
        .await
        .unwrap();

    assert!(result.all_filled);
    assert!(!result.entry_rejected);
    assert!(!result.rollback_performed);
    assert!(result.incident.is_none());

    // Delta-neutral: equal and opposite base quantities.
    assert_eq!(result.long.filled_qty, result.short.filled_qty);
    assert_eq!(
        setup.aster.net_position("BTC"),
        -setup.lighter.net_position("BTC")
    );

    // Aligned entry: the pair's price divergence is non-negative.
    assert!(result.short.avg_price >= result.long.avg_price);

    // Maker fees on both entry legs only (exit half still unpaid):
    // 2 bps of ~$1000 per leg.
    let fees = result.total_fees_usd();
    assert!(fees > dec!(0.3) && fees < dec!(0.5), "fees = {}", fees);
}

#[tokio::test(start_paused = true)]
async fn partial_fill_is_hedged_to_completion() {
    let setup = setup();

    // Short leg fills outright; long leg fills 40% in the first round,
    // then the hedge ladder rests twice and finally fills at the touch.
    setup.aster.script_limit("BTC", LimitBehavior::FillPartial(dec!(0.4)));
    setup.aster.script_limit("BTC", LimitBehavior::Rest); // break-even attempt
    setup.aster.script_limit("BTC", LimitBehavior::Rest); // ladder inside
    setup.aster.script_limit("BTC", LimitBehavior::Rest); // ladder inside
    setup.aster.script_limit("BTC", LimitBehavior::Rest); // ladder inside
    setup.aster.script_limit("BTC", LimitBehavior::Fill); // ladder touch

    let (long, short) = legs(&setup, dec!(1000));
    let cancel = CancellationToken::new();

    let result = setup
        .atomic
        .execute_atomic(long, short, true, OperationMode::Opening, &cancel)
        .await
        .unwrap();

    assert!(result.all_filled, "hedge must complete the lagging leg");
    assert!(!result.rollback_performed);
    assert_eq!(result.long.filled_qty, result.short.filled_qty);

    // The hedged leg ended on a touch limit and its average is
    // size-weighted between the first-round fill and the touch fill.
    assert_eq!(result.long.mode_used, Some(ModeUsed::TouchLimit));
    assert!(result.long.avg_price > dec!(50000));
    assert!(result.long.avg_price <= dec!(50010));

    assert_eq!(
        setup.aster.net_position("BTC"),
        -setup.lighter.net_position("BTC")
    );
}

#[tokio::test(start_paused = true)]
async fn failed_hedge_triggers_rollback_to_zero_exposure() {
    let setup = setup();

    // Long leg fills; short leg never fills: first round rests, hedge
    // attempts all rest, and the market fallback is rejected by the venue.
    for _ in 0..20 {
        setup.lighter.script_limit("BTC", LimitBehavior::Rest);
    }
    setup.lighter.script_market("BTC", MarketBehavior::Reject);

    let (long, short) = legs(&setup, dec!(1000));
    let cancel = CancellationToken::new();

    let result = setup
        .atomic
        .execute_atomic(long, short, true, OperationMode::Opening, &cancel)
        .await
        .unwrap();

    assert!(!result.all_filled);
    assert!(!result.entry_rejected);
    assert!(result.rollback_performed);
    assert!(result.incident.is_none(), "rollback itself succeeded");
    // Fees were paid entering and unwinding: compensation costs money.
    assert!(result.rollback_cost_usd > Decimal::ZERO);

    // The whole point: no residual directional exposure anywhere.
    assert_eq!(setup.aster.net_position("BTC"), Decimal::ZERO);
    assert_eq!(setup.lighter.net_position("BTC"), Decimal::ZERO);
}

#[tokio::test(start_paused = true)]
async fn rollback_failure_is_an_incident_not_silence() {
    let setup = setup();

    // Short leg never fills and its market fallback rejects.
    for _ in 0..20 {
        setup.lighter.script_limit("BTC", LimitBehavior::Rest);
    }
    setup.lighter.script_market("BTC", MarketBehavior::Reject);
    // And the long venue also rejects every rollback market order.
    for _ in 0..5 {
        setup.aster.script_market("BTC", MarketBehavior::Reject);
    }

    let (long, short) = legs(&setup, dec!(1000));
    let cancel = CancellationToken::new();

    let result = setup
        .atomic
        .execute_atomic(long, short, true, OperationMode::Opening, &cancel)
        .await
        .unwrap();

    assert!(!result.all_filled);
    assert!(result.rollback_performed);
    let incident = result.incident.expect("incident must be surfaced");
    assert_eq!(incident.venue, "aster");
    assert!(incident.residual_qty > Decimal::ZERO);
    // The residual really is still there; the operator must act.
    assert!(setup.aster.net_position("BTC") > Decimal::ZERO);
}

#[tokio::test(start_paused = true)]
async fn neither_leg_filled_is_a_clean_reject() {
    let setup = setup();
    for _ in 0..10 {
        setup.lighter.script_limit("BTC", LimitBehavior::Rest);
        setup.aster.script_limit("BTC", LimitBehavior::Rest);
    }

    let (long, short) = legs(&setup, dec!(1000));
    // Limit-only legs so nothing ever markets.
    let long = AtomicOrderSpec {
        mode: ExecMode::LimitOnly,
        ..long
    };
    let short = AtomicOrderSpec {
        mode: ExecMode::LimitOnly,
        ..short
    };
    let cancel = CancellationToken::new();

    let result = setup
        .atomic
        .execute_atomic(long, short, true, OperationMode::Opening, &cancel)
        .await
        .unwrap();

    assert!(result.entry_rejected);
    assert!(!result.all_filled);
    assert!(!result.rollback_performed);
    assert_eq!(result.rollback_cost_usd, Decimal::ZERO);
    assert_eq!(setup.aster.net_position("BTC"), Decimal::ZERO);
    assert_eq!(setup.lighter.net_position("BTC"), Decimal::ZERO);
}

#[tokio::test(start_paused = true)]
async fn leverage_normalizes_to_weaker_venue() {
    // lighter: 50x, settable. aster: 3x, cross-margin (Unsupported).
    let setup = setup_with_leverage(50, true, 3, false);
    let (long, short) = legs(&setup, dec!(1000));
    let cancel = CancellationToken::new();

    let result = setup
        .atomic
        .execute_atomic(long, short, true, OperationMode::Opening, &cancel)
        .await
        .unwrap();

    assert!(result.all_filled);
    assert_eq!(result.leverage_used, 3);
    // The settable venue was told 3x; the cross-margin venue was
    // tolerated, not errored.
    assert_eq!(setup.lighter.leverage_calls(), vec![("BTC".to_string(), 3)]);
    assert!(setup.aster.leverage_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn preflight_rejects_thin_book() {
    let setup = setup();
    // Starve the lighter book.
    setup.lighter.set_depth(
        "BTC",
        vec![basisbot_backend::models::BookLevel {
            price: dec!(50000),
            qty: dec!(0.0001),
        }],
        vec![basisbot_backend::models::BookLevel {
            price: dec!(50010),
            qty: dec!(0.0001),
        }],
    );

    let (long, short) = legs(&setup, dec!(100000));
    let cancel = CancellationToken::new();

    let err = setup
        .atomic
        .execute_atomic(long, short, true, OperationMode::Opening, &cancel)
        .await
        .unwrap_err();

    match err {
        basisbot_backend::error::ExecError::PreflightRejected { .. } => {}
        other => panic!("expected preflight rejection, got {other:?}"),
    }
    // No orders were placed anywhere.
    assert_eq!(setup.lighter.orders_placed(), 0);
    assert_eq!(setup.aster.orders_placed(), 0);
}
