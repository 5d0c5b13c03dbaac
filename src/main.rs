// fieldtrack - Main Entry Point
// Copyright (C) 2024 - fieldtrack authors
// Licensed under AGPL v3

use std::sync::Arc;

use clap::Parser;
use fieldtrack::broadcaster::Broadcaster;
use fieldtrack::config::{Config, MapArgs, Mode, TrackArgs};
use fieldtrack::geocode::NominatimGeocoder;
use fieldtrack::live_map::LiveMap;
use fieldtrack::map_surface::GeoJsonSurface;
use fieldtrack::net::ApiClient;
use fieldtrack::provider::GpsdProvider;
use fieldtrack::sampler::{PositionSampler, SamplerUpdate};
use fieldtrack::store::PositionStore;
use fieldtrack::sync_gate::SyncGate;
use tokio::signal;
use tower_http::services::ServeDir;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command-line arguments
    let config = Config::parse();

    // Initialize logging
    init_logging(config.verbose);

    match &config.mode {
        Mode::Track(args) => run_track(&config, args).await,
        Mode::Map(args) => run_map(&config, args).await,
    }
}

/// Sample, broadcast and sync one actor's position until Ctrl+C
async fn run_track(config: &Config, args: &TrackArgs) -> Result<(), Box<dyn std::error::Error>> {
    info!("Tracking actor {} from gpsd at {}", args.actor, args.gpsd);

    let store = Arc::new(PositionStore::new());
    let provider = Arc::new(GpsdProvider::new(args.gpsd.clone()));
    let geocoder = Arc::new(NominatimGeocoder::new(config.geocoder_url.clone())?);
    let api = Arc::new(ApiClient::new(config.api_base.clone(), config.token.clone())?.with_paths(args.api_paths()));

    let sampler = PositionSampler::new(Arc::clone(&provider), Arc::clone(&geocoder)).start(|update| match update {
        SamplerUpdate::Ready { lat, lng, accuracy, address } => {
            info!(lat, lng, accuracy, "Location captured: {}", address);
        }
        SamplerUpdate::Error(e) => warn!("Location capture failed: {}", e),
    });

    let mut broadcaster = Broadcaster::new(provider, Arc::clone(&store));
    broadcaster.track(Some(&args.actor)).await;

    let sync = SyncGate::new(api, geocoder, store, Some(args.actor.clone())).spawn_every(args.sync_interval());

    info!("Tracker ready");
    wait_for_shutdown().await?;

    info!("Shutting down...");
    sync.stop().await;
    broadcaster.stop().await;
    sampler.stop().await;
    info!("Tracker stopped");
    Ok(())
}

/// Keep the live map up to date until Ctrl+C
async fn run_map(config: &Config, args: &MapArgs) -> Result<(), Box<dyn std::error::Error>> {
    let api = Arc::new(ApiClient::new(config.api_base.clone(), config.token.clone())?.with_paths(args.api_paths()));
    let map = LiveMap::new(api, GeoJsonSurface::new(&args.work_dir))?;
    info!("Live map initialized in {}", args.work_dir.display());

    // Optional: HTTP server to expose work directory (markers.json)
    if let Some(port) = args.http_port {
        let work_dir = args.work_dir.clone();
        tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind((std::net::Ipv4Addr::UNSPECIFIED, port)).await {
                Ok(l) => l,
                Err(e) => {
                    error!("HTTP server failed to bind to port {}: {}", port, e);
                    return;
                }
            };
            info!("HTTP server on port {} serving {}", port, work_dir.display());
            let app = axum::Router::new().fallback_service(ServeDir::new(work_dir));
            if let Err(e) = axum::serve(listener, app).await {
                error!("HTTP server error: {}", e);
            }
        });
    }

    let polling = map.spawn_every(args.poll_interval());

    wait_for_shutdown().await?;

    info!("Shutting down...");
    polling.stop().await;
    info!("Live map stopped");
    Ok(())
}

async fn wait_for_shutdown() -> Result<(), Box<dyn std::error::Error>> {
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received shutdown signal (Ctrl+C)");
            Ok(())
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
            Err(err.into())
        }
    }
}

/// Initialize logging subsystem
fn init_logging(verbose: bool) {
    use tracing_subscriber::fmt::format::FmtSpan;

    let subscriber = tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .with_span_events(if verbose {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        });

    if verbose {
        subscriber.with_max_level(tracing::Level::DEBUG).init();
        info!("Verbose logging enabled (DEBUG level)");
    } else {
        subscriber.with_max_level(tracing::Level::INFO).init();
    }
}
