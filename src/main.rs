//! Basisbot: delta-neutral funding-rate arbitrage across perp DEXes.
//!
//! Wires configuration, venues, market data, execution and the strategy
//! loop together, then runs until SIGINT. Exit codes: 0 normal, 2 invalid
//! configuration, 3 venue authentication failure at startup, 4 fatal
//! rollback incident.

use anyhow::{Context, Result};
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use basisbot_backend::config::AppConfig;
use basisbot_backend::execution::atomic::AtomicMultiOrderExecutor;
use basisbot_backend::execution::hedge::HedgeManager;
use basisbot_backend::execution::order_executor::OrderExecutor;
use basisbot_backend::funding::service::{
    FundingServiceClient, FundingSource, StaticFundingSource,
};
use basisbot_backend::market::{BookTickerCache, FeeModel, LiquidityAnalyzer};
use basisbot_backend::models::Opportunity;
use basisbot_backend::store::{PositionStore, SqlitePositionStore};
use basisbot_backend::strategy::StrategyOrchestrator;
use basisbot_backend::venues::mock::MockVenue;
use basisbot_backend::venues::VenueAdapter;

const EXIT_CONFIG_INVALID: u8 = 2;
const EXIT_VENUE_AUTH: u8 = 3;
const EXIT_ROLLBACK_INCIDENT: u8 = 4;

#[derive(Parser, Debug)]
#[command(name = "basisbot", about = "Delta-neutral funding-rate arbitrage")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, env = "BASISBOT_CONFIG", default_value = "basisbot.toml")]
    config: PathBuf,

    /// Force paper trading regardless of the config file.
    #[arg(long)]
    dry_run: bool,

    /// Run a single cycle and exit (operator validation).
    #[arg(long)]
    once: bool,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Build the venue adapter set. Paper mode instantiates simulated venues
/// seeded from config; live mode requires real adapters registered for the
/// configured exchange names, plus credentials in the environment.
fn build_venues(
    config: &AppConfig,
    cache: &Arc<BookTickerCache>,
) -> Result<HashMap<String, Arc<dyn VenueAdapter>>, VenueBuildError> {
    let mut venues: HashMap<String, Arc<dyn VenueAdapter>> = HashMap::new();

    if config.execution.dry_run {
        for exchange in &config.exchanges {
            let venue = MockVenue::new(exchange.to_spec(), exchange.max_leverage)
                .with_cache(cache.clone());
            for symbol in &config.symbols {
                let mid = config
                    .paper_prices
                    .get(symbol)
                    .copied()
                    .unwrap_or(rust_decimal_macros::dec!(100));
                let half_tick = mid * rust_decimal_macros::dec!(0.0001);
                venue.set_book(symbol, mid - half_tick, mid + half_tick);
            }
            venues.insert(exchange.name.clone(), Arc::new(venue));
        }
        return Ok(venues);
    }

    // Live adapters are external collaborators; none ship in this crate.
    // Each exchange needs an adapter implementation registered here and
    // API credentials as {NAME}_API_KEY / {NAME}_API_SECRET.
    for exchange in &config.exchanges {
        let key_var = format!("{}_API_KEY", exchange.name.to_uppercase());
        if std::env::var(&key_var).is_err() {
            return Err(VenueBuildError::MissingCredentials(
                exchange.name.clone(),
                key_var,
            ));
        }
        return Err(VenueBuildError::NoAdapter(exchange.name.clone()));
    }
    Ok(venues)
}

#[derive(Debug)]
enum VenueBuildError {
    MissingCredentials(String, String),
    NoAdapter(String),
}

/// Paper mode without a service URL gets a small built-in divergence so
/// the whole loop can be watched end to end without any network.
fn paper_opportunities(config: &AppConfig) -> Vec<Opportunity> {
    use rust_decimal_macros::dec;
    let mut names = config.exchanges.iter().map(|e| e.name.clone());
    let (Some(long_venue), Some(short_venue)) = (names.next(), names.next()) else {
        return Vec::new();
    };
    config
        .symbols
        .iter()
        .map(|symbol| Opportunity {
            symbol: symbol.clone(),
            long_venue: long_venue.clone(),
            short_venue: short_venue.clone(),
            long_rate: dec!(-0.0000000003),
            short_rate: dec!(0.0000000008),
            divergence: dec!(0.0000000011),
            net_apy: dec!(0.033),
            long_oi_usd: dec!(5000000),
            short_oi_usd: dec!(5000000),
            min_volume_24h_usd: dec!(1000000),
            observed_at: chrono::Utc::now(),
        })
        .collect()
}

async fn run(args: Args) -> Result<u8> {
    let mut config = match AppConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, path = %args.config.display(), "configuration invalid");
            return Ok(EXIT_CONFIG_INVALID);
        }
    };
    if args.dry_run {
        config.execution.dry_run = true;
    }
    if let Err(e) = config.validate() {
        error!(error = %e, "configuration invalid");
        return Ok(EXIT_CONFIG_INVALID);
    }

    info!(
        exchanges = config.exchanges.len(),
        dry_run = config.execution.dry_run,
        max_positions = config.max_positions,
        tick_interval_s = config.tick_interval_seconds,
        "starting basisbot"
    );

    let cache = Arc::new(BookTickerCache::new(Duration::from_millis(
        config.execution.order.staleness_limit_ms,
    )));

    let venues = match build_venues(&config, &cache) {
        Ok(venues) => venues,
        Err(VenueBuildError::MissingCredentials(venue, var)) => {
            error!(venue = %venue, env_var = %var, "venue credentials missing");
            return Ok(EXIT_VENUE_AUTH);
        }
        Err(VenueBuildError::NoAdapter(venue)) => {
            error!(
                venue = %venue,
                "no live adapter registered for venue; run with --dry-run or link an adapter"
            );
            return Ok(EXIT_VENUE_AUTH);
        }
    };

    let specs = config.venue_specs();
    let fees = FeeModel::from_specs(&specs);

    let source: Arc<dyn FundingSource> = match (&config.funding_service_url, config.execution.dry_run)
    {
        (Some(url), _) => Arc::new(
            FundingServiceClient::new(url).context("build funding service client")?,
        ),
        (None, true) => {
            warn!("no funding service configured; using built-in paper opportunities");
            Arc::new(StaticFundingSource::new(paper_opportunities(&config)))
        }
        (None, false) => unreachable!("validated: live mode requires funding_service_url"),
    };

    let store: Arc<dyn PositionStore> = Arc::new(
        SqlitePositionStore::new(&config.database_path).context("open position store")?,
    );

    let order_executor = OrderExecutor::new(cache.clone(), config.execution.order.clone());
    let hedge = HedgeManager::new(
        cache.clone(),
        config.hedge.clone(),
        Duration::from_millis(config.execution.order.poll_interval_ms),
    );
    let atomic = AtomicMultiOrderExecutor::new(
        cache.clone(),
        OrderExecutor::new(cache.clone(), config.execution.order.clone()),
        hedge,
        LiquidityAnalyzer::new(config.liquidity.clone()),
        config.execution.atomic.clone(),
    );

    let orchestrator = Arc::new(StrategyOrchestrator::new(
        config.clone(),
        venues,
        cache,
        fees,
        atomic,
        order_executor,
        source,
        store,
    ));

    let cancel = CancellationToken::new();

    if args.once {
        orchestrator.reconcile().await?;
        let summary = orchestrator.execute_cycle(&cancel).await?;
        info!(
            monitored = summary.positions_monitored,
            entries_opened = summary.entries_opened,
            exits = summary.exits_triggered,
            "single cycle complete"
        );
        return Ok(if orchestrator.fatal_incident() {
            EXIT_ROLLBACK_INCIDENT
        } else {
            0
        });
    }

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
                cancel.cancel();
            }
        });
    }

    orchestrator.run(cancel).await?;

    Ok(if orchestrator.fatal_incident() {
        EXIT_ROLLBACK_INCIDENT
    } else {
        0
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    init_tracing();

    let args = Args::parse();
    match run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %e, "fatal error");
            ExitCode::FAILURE
        }
    }
}
