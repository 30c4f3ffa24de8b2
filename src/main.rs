mod aggregator;
mod aligner;
mod api;
mod audit;
mod balance;
mod cli;
mod config;
mod context;
mod dealer;
mod dispatcher;
mod error;
mod funding;
mod health;
mod market_data;
mod order_status;
mod position;
mod signal;
mod store;
mod symbol;
mod threshold;
mod venue;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rust_decimal::Decimal;

use audit::AuditLog;
use balance::BalanceRefresher;
use cli::{Cli, Command};
use config::OrderConfig;
use context::{CancelContext, OrderMode};
use dispatcher::SignalDispatcher;
use funding::FundingTracker;
use health::HealthMonitor;
use order_status::{connect_and_listen_orders, ListenKeyManager, StreamReadyFlag};
use position::{PositionCache, PositionTracker};
use signal::SignalGenerator;
use store::Store;
use symbol::SymbolRegistry;
use threshold::ThresholdEngine;
use venue::rest::RestVenueAdapter;
use venue::venue_a::{VenueA, VenueADepthFeed, VenueAOrderStatusFeed};
use venue::venue_b::{VenueB, VenueBDepthFeed, VenueBOrderStatusFeed};
use venue::{VenueAdapter, VenueKind};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();
    let config_dir = Path::new(&cli.config_dir);
    let config = Arc::new(OrderConfig::load(config_dir, &cli.env)?);

    match &cli.command {
        Command::CheckConfig => {
            log::info!("config for env={} loaded and validated ok", config.env);
            return Ok(());
        }
        Command::Fetch => return run_fetch(config).await,
        Command::Order { venue, symbol, side, qty, price } => {
            return run_manual_order(config, venue, symbol, side, qty, price.as_deref()).await
        }
        Command::Run => {}
    }

    log::info!("[MAIN] starting xvenue-arb env={}", config.env);

    let registry = Arc::new(SymbolRegistry::from_config(&config)?);
    let store = Store::connect(&config.redis.url).await?;

    let venue_a_creds = config.exchanges.get("A").cloned().unwrap_or_default();
    let venue_b_creds = config.exchanges.get("B").cloned().unwrap_or_default();
    let venue_a_rest = RestVenueAdapter::new(VenueKind::A, venue_a_base_url(), venue_a_creds.clone());
    let venue_b_rest = RestVenueAdapter::new(VenueKind::B, venue_b_base_url(), venue_b_creds.clone());
    let venue_a: Arc<dyn VenueAdapter> = Arc::new(VenueA::new(venue_a_rest.clone()));
    let venue_b: Arc<dyn VenueAdapter> = Arc::new(VenueB::new(venue_b_rest.clone()));

    let mut venues: HashMap<VenueKind, Arc<dyn VenueAdapter>> = HashMap::new();
    venues.insert(VenueKind::A, venue_a.clone());
    venues.insert(VenueKind::B, venue_b.clone());

    let root_ctx = CancelContext::new(config.configured_order_mode()?);

    // ── Startup sequence (§11.1): flatten resting orders, set margin mode /
    // leverage / hedge mode for every symbol×venue, clear stale locks, do one
    // synchronous balance refresh, before any steady-state worker starts.
    for symbol in registry.all() {
        for (kind, adapter) in &venues {
            let native = &symbol.instrument(*kind).native_name;
            if let Err(e) = adapter.cancel_all_orders(native).await {
                log::warn!("[MAIN] startup cancel-all failed for {kind}:{native}: {e}");
            }
            if let Err(e) = adapter.set_margin_mode_cross(native).await {
                log::warn!("[MAIN] startup set-margin-mode failed for {kind}:{native}: {e}");
            }
            if let Err(e) = adapter.set_leverage(native, config.symbol_leverage).await {
                log::warn!("[MAIN] startup set-leverage failed for {kind}:{native}: {e}");
            }
            if let Err(e) = adapter.disable_hedge_mode().await {
                log::warn!("[MAIN] startup disable-hedge-mode failed for {kind}:{native}: {e}");
            }
        }
    }
    store.clear_processing().await?;

    let balance_refresher = Arc::new(BalanceRefresher { venues: venues.clone(), store: store.clone() });
    balance_refresher.refresh_once().await;

    let audit = Arc::new(AuditLog::new(config.output_data.order_loop.clone()));
    let stream_ready = StreamReadyFlag::new();

    // ── Market-Data Fanout (§4.2): one streaming connection per venue.
    let native_a: Vec<String> = registry.all().map(|s| s.instrument(VenueKind::A).native_name.clone()).collect();
    let native_b: Vec<String> = registry.all().map(|s| s.instrument(VenueKind::B).native_name.clone()).collect();
    {
        let store = store.clone();
        let ctx = root_ctx.child();
        let feed = VenueADepthFeed { ws_url: venue_a_public_ws_url() };
        tokio::spawn(async move {
            market_data::connect_and_listen(VenueKind::A, &feed, native_a, store, ctx).await;
        });
    }
    {
        let store = store.clone();
        let ctx = root_ctx.child();
        let feed = VenueBDepthFeed { ws_base_url: venue_b_public_ws_url() };
        tokio::spawn(async move {
            market_data::connect_and_listen(VenueKind::B, &feed, native_b, store, ctx).await;
        });
    }

    // ── Order-Book Aggregator (§4.3): two workers per symbol.
    let symbol_names: Vec<String> = registry.all().map(|s| s.canonical.clone()).collect();
    let _agg_handles = aggregator::spawn_all(
        symbol_names,
        store.clone(),
        root_ctx.child(),
        config.redis.orderbook_stream.clone(),
        config.redis.orderbook_stream_size,
    );

    // ── Position Tracker (§2.5).
    {
        let tracker = PositionTracker { registry: registry.clone(), venues: venues.clone(), store: store.clone() };
        let ctx = root_ctx.child();
        tokio::spawn(async move {
            tracker.run(ctx, Duration::from_secs(10)).await;
        });
    }

    // ── Funding-Rate Tracker (§2.6), one per venue.
    for (kind, adapter) in venues.clone() {
        let tracker = FundingTracker { registry: registry.clone(), venue: kind, adapter, store: store.clone() };
        let ctx = root_ctx.child();
        tokio::spawn(async move {
            tracker.run(ctx, Duration::from_secs(5 * 60)).await;
        });
    }

    // ── Threshold Engine (§4.4).
    {
        let engine = ThresholdEngine { config: config.clone(), store: store.clone() };
        let ctx = root_ctx.child();
        tokio::spawn(async move {
            engine.run(ctx, Duration::from_secs(5)).await;
        });
    }

    // ── Exchange Health Monitor.
    {
        let monitor = HealthMonitor::new(venues.clone(), root_ctx.child());
        tokio::spawn(async move {
            monitor.run(Duration::from_secs(60)).await;
        });
    }

    // ── Balance Refresher steady-state loop.
    {
        let refresher = balance_refresher.clone();
        let ctx = root_ctx.child();
        tokio::spawn(async move {
            refresher.run(ctx, Duration::from_secs(20)).await;
        });
    }

    // ── Position Aligner (§4.8).
    {
        let aligner = aligner::PositionAligner {
            registry: registry.clone(),
            config: config.clone(),
            venue_a: venue_a.clone(),
            venue_b: venue_b.clone(),
            store: store.clone(),
            ctx: root_ctx.child(),
            client_tag: config.client_tag.clone(),
        };
        tokio::spawn(async move {
            aligner.run(Duration::from_secs(30)).await;
        });
    }

    // ── Order-Status Streams (§4.9), one per venue.
    {
        let feed = VenueAOrderStatusFeed {
            ws_url: venue_a_private_ws_url(),
            api_key: venue_a_creds.api_key.clone().unwrap_or_default(),
            secret: venue_a_creds.secret.clone().unwrap_or_default(),
            passphrase: venue_a_creds.password.clone().unwrap_or_default(),
        };
        let store = store.clone();
        let ready = stream_ready.clone();
        let ctx = root_ctx.child();
        tokio::spawn(async move {
            connect_and_listen_orders(VenueKind::A, &feed, store, ready, ctx).await;
        });
    }
    {
        let listen_key_mgr = ListenKeyManager::new(venue_b_rest.clone());
        let feed = VenueBOrderStatusFeed::new(venue_b_private_ws_base_url(), listen_key_mgr, root_ctx.child());
        let store = store.clone();
        let ready = stream_ready.clone();
        let ctx = root_ctx.child();
        tokio::spawn(async move {
            connect_and_listen_orders(VenueKind::B, &feed, store, ready, ctx).await;
        });
    }

    // ── Signal Generator -> Signal Dispatcher pipeline (§4.5, §4.6).
    {
        let generator = SignalGenerator {
            config: config.clone(),
            registry: registry.clone(),
            store: store.clone(),
            position_cache: Arc::new(PositionCache::new(store.clone())),
        };
        let dispatcher = Arc::new(SignalDispatcher {
            config: config.clone(),
            registry: registry.clone(),
            store: store.clone(),
            ctx: root_ctx.child(),
            venue_a: venue_a.clone(),
            venue_b: venue_b.clone(),
            audit: audit.clone(),
            stream_ready: stream_ready.clone(),
        });
        let ctx = root_ctx.child();
        tokio::spawn(async move {
            generator
                .run(ctx, "0".to_string(), |signal| {
                    let dispatcher = dispatcher.clone();
                    async move { dispatcher.dispatch(signal).await }
                })
                .await;
        });
    }

    // ── Read-only HTTP balance/position/health API (§10.6).
    let app = api::router(store.clone(), registry.clone(), root_ctx.clone(), stream_ready.clone());
    let listener = tokio::net::TcpListener::bind("0.0.0.0:8089").await?;
    log::info!("[MAIN] HTTP API listening on 0.0.0.0:8089");
    let serve_ctx = root_ctx.child();
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                while !serve_ctx.is_canceled() {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            })
            .await;
    });

    wait_for_shutdown_signal().await;
    log::info!("[MAIN] shutdown signal received, canceling workers");
    root_ctx.cancel();

    for symbol in registry.all() {
        for (kind, adapter) in &venues {
            let native = &symbol.instrument(*kind).native_name;
            if let Err(e) = adapter.cancel_all_orders(native).await {
                log::warn!("[MAIN] shutdown cancel-all failed for {kind}:{native}: {e}");
            }
        }
    }

    let _ = server.await;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

async fn run_fetch(config: Arc<OrderConfig>) -> anyhow::Result<()> {
    let registry = Arc::new(SymbolRegistry::from_config(&config)?);
    let venue_a_rest = RestVenueAdapter::new(VenueKind::A, venue_a_base_url(), config.exchanges.get("A").cloned().unwrap_or_default());
    let venue_b_rest = RestVenueAdapter::new(VenueKind::B, venue_b_base_url(), config.exchanges.get("B").cloned().unwrap_or_default());
    let venue_a = VenueA::new(venue_a_rest);
    let venue_b = VenueB::new(venue_b_rest);

    for (name, adapter) in [("A", &venue_a as &dyn VenueAdapter), ("B", &venue_b as &dyn VenueAdapter)] {
        match adapter.get_balance().await {
            Ok(b) => println!("{name} balance: used={} free={} total={}", b.used, b.free, b.total),
            Err(e) => println!("{name} balance fetch failed: {e}"),
        }
        match adapter.get_positions().await {
            Ok(positions) => {
                for (native, status) in positions {
                    println!("{name} position {native}: {:?} qty={}", status.direction, status.qty);
                }
            }
            Err(e) => println!("{name} positions fetch failed: {e}"),
        }
    }
    let _ = registry;
    Ok(())
}

async fn run_manual_order(
    config: Arc<OrderConfig>,
    venue: &str,
    symbol: &str,
    side: &str,
    qty: &str,
    price: Option<&str>,
) -> anyhow::Result<()> {
    let registry = Arc::new(SymbolRegistry::from_config(&config)?);
    let sym = registry.require(symbol)?;
    let kind = if venue.eq_ignore_ascii_case("A") { VenueKind::A } else { VenueKind::B };
    let native = sym.instrument(kind).native_name.clone();
    let creds = config.exchanges.get(kind.name()).cloned().unwrap_or_default();
    let order_side = if side.eq_ignore_ascii_case("buy") { venue::OrderSide::Buy } else { venue::OrderSide::Sell };
    let qty: Decimal = qty.parse()?;
    let client_id = format!("cr{}mko{}", config.client_tag, chrono::Utc::now().timestamp_millis());

    let result = match kind {
        VenueKind::A => {
            let adapter = VenueA::new(RestVenueAdapter::new(VenueKind::A, venue_a_base_url(), creds));
            place_manual(&adapter, &native, order_side, qty, price, &client_id).await
        }
        VenueKind::B => {
            let adapter = VenueB::new(RestVenueAdapter::new(VenueKind::B, venue_b_base_url(), creds));
            place_manual(&adapter, &native, order_side, qty, price, &client_id).await
        }
    };
    match result {
        Ok(order) => println!("placed order {} on {venue}:{symbol}", order.id),
        Err(e) => println!("order failed: {e}"),
    }
    Ok(())
}

async fn place_manual(
    adapter: &dyn VenueAdapter,
    native: &str,
    side: venue::OrderSide,
    qty: Decimal,
    price: Option<&str>,
    client_id: &str,
) -> Result<venue::OrderRecord, error::VenueError> {
    match price {
        Some(p) => {
            let price: Decimal = p.parse().map_err(|_| error::VenueError::InvalidOrder("bad price".to_string()))?;
            adapter.place_limit_post_only(native, side, qty, price, client_id).await
        }
        None => adapter.place_market(native, side, qty, false, client_id).await,
    }
}

fn venue_a_base_url() -> String {
    std::env::var("VENUE_A_REST_URL").unwrap_or_else(|_| "https://www.okx.com".to_string())
}
fn venue_b_base_url() -> String {
    std::env::var("VENUE_B_REST_URL").unwrap_or_else(|_| "https://fapi.binance.com".to_string())
}
fn venue_a_public_ws_url() -> String {
    std::env::var("VENUE_A_PUBLIC_WS_URL").unwrap_or_else(|_| "wss://ws.okx.com:8443/ws/v5/public".to_string())
}
fn venue_b_public_ws_url() -> String {
    std::env::var("VENUE_B_PUBLIC_WS_URL").unwrap_or_else(|_| "wss://fstream.binance.com/ws".to_string())
}
fn venue_a_private_ws_url() -> String {
    std::env::var("VENUE_A_PRIVATE_WS_URL").unwrap_or_else(|_| "wss://ws.okx.com:8443/ws/v5/private".to_string())
}
fn venue_b_private_ws_base_url() -> String {
    std::env::var("VENUE_B_PRIVATE_WS_BASE_URL").unwrap_or_else(|_| "wss://fstream.binance.com/ws".to_string())
}
