use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use warp::Filter;

mod broadcaster;
mod config;
mod entity_id;
mod feed;
mod feed_types;
mod gc;
mod ingest;
mod persistence;
mod state;
mod static_data;
mod store;
mod subscribers;
mod timetable;
mod websocket;

use broadcaster::Broadcaster;
use config::Config;
use feed::HttpFeedSource;
use persistence::{load_store, save_store};
use state::AppState;
use static_data::StaticCatalog;
use store::RealtimeStore;
use websocket::handle_viewer;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt::init();

    // 1. Configuration
    let config = Config::from_env()?;
    if !config.has_credentials {
        warn!("PTD_UID is empty, realtime fetches will fail until it is configured");
    }

    // 2. Recover the last realtime state
    let store = match load_store(&config.data_dir) {
        Ok(Some(store)) => store,
        Ok(None) => RealtimeStore::new(),
        Err(e) => {
            warn!("failed to load previous realtime state: {}", e);
            RealtimeStore::new()
        }
    };

    // 3. Static catalog, refreshed in the background once its feed expires
    let catalog = StaticCatalog::new(config.static_source.clone());
    if let Err(e) = catalog.load_initial() {
        warn!(
            "initial GTFS load failed: {}. Background updater will retry.",
            e
        );
    }
    catalog.start_updater(config.catalog_check, config.timezone);

    let state = Arc::new(AppState::new(store, catalog, config.send_timeout));

    // 4. Persistence loop
    let state_clone_persist = state.clone();
    let data_dir = config.data_dir.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
            if let Err(e) = save_store(&state_clone_persist.store, &data_dir) {
                error!("error saving realtime state: {}", e);
            }
        }
    });

    // 5. Ingest + reconcile + broadcast
    let source = HttpFeedSource::new(
        config.vehicle_positions_url.clone(),
        config.trip_updates_url.clone(),
        config.feed_format,
        config.fetch_timeout,
    )?;
    let broadcaster = Broadcaster::new(state.clone(), source, &config);
    tokio::spawn(broadcaster.run());

    // 6. HTTP + WebSocket server
    let state_filter_base = state.clone();
    let state_filter = warp::any().map(move || state_filter_base.clone()).boxed();
    let send_timeout = config.send_timeout;

    // GET /ws
    let ws_route = warp::path("ws")
        .and(warp::ws())
        .and(state_filter.clone())
        .map(move |ws: warp::ws::Ws, state: Arc<AppState>| {
            let registry = state.subscribers.clone();
            ws.on_upgrade(move |socket| handle_viewer(socket, registry, send_timeout))
        });

    // GET /timetable
    let timetable_route = warp::path("timetable")
        .and(warp::get())
        .and(state_filter.clone())
        .map(|state: Arc<AppState>| warp::reply::json(&*state.latest_snapshot()));

    let routes = ws_route.or(timetable_route).boxed();

    info!("server running at http://localhost:{}", config.port);
    warp::serve(routes).run(([0, 0, 0, 0], config.port)).await;
    Ok(())
}
