pub use anyhow::Result;
use anyhow::{Context, Error};
use clap::{Parser, Subcommand};
use metrics::describe_counter;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info_span};
use tracing_subscriber::{
    fmt::{format::FmtSpan, Subscriber},
    prelude::*,
    EnvFilter,
};

mod classify;
mod config;
mod db;
mod errors;
mod geocoders;
mod geometry;
mod osrm;
mod pipeline;
mod planner;
mod route_cache;
mod server;

use crate::config::Config;
use crate::db::Db;
use crate::geocoders::router::ProviderPriority;
use crate::geocoders::{
    census::CensusProvider, google::GoogleMapsProvider, osm::OsmProvider,
    shared_http_client, GeocodingProvider, SharedHttpClient,
};
use crate::osrm::OsrmClient;
use crate::pipeline::{import_fuel_prices, ImportOptions};
use crate::route_cache::RouteCache;
use crate::server::{run_server, AppState};

/// Our command-line arguments.
#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "plan minimum-cost refueling stops for long-haul routes"
)]
struct Opt {
    /// Command to run.
    #[command(subcommand)]
    cmd: Command,
}

/// Subcommands for fuel-router.
#[derive(Debug, Subcommand)]
enum Command {
    /// Import the fuel price feed and geocode new stations.
    Import {
        /// Path to the price feed CSV.
        #[arg(long = "csv", default_value = "/app/data/fuel-prices-for-be-assessment.csv")]
        csv: PathBuf,

        /// Seconds to sleep between geocoding requests, per worker.
        #[arg(long = "sleep", default_value = "0.1")]
        sleep: f64,

        /// Maximum number of stations to geocode (0 = no limit).
        #[arg(long = "max", default_value = "0")]
        max: usize,

        /// Number of concurrent geocoding workers.
        #[arg(long = "concurrent", default_value = "5")]
        concurrent: usize,

        /// Skip stations that already have a geocode_source recorded.
        #[arg(long = "skip_attempted")]
        skip_attempted: bool,

        /// Provider priority strategy. [smart, google_then_census]
        #[arg(long = "provider", default_value = "smart")]
        provider: ProviderPriority,
    },

    /// Start in server mode.
    Server {
        /// Address that the server should listen on.
        #[arg(long = "listen-address", default_value = "127.0.0.1:8000")]
        listen_address: String,
    },
}

// Our main entrypoint. We rely on the fact that `anyhow::Error` has a `Debug`
// implementation that will print a nice friendly error if we return from `main`
// with an error.
#[tokio::main]
async fn main() -> Result<()> {
    // Configure tracing.
    let filter = EnvFilter::from_default_env();
    Subscriber::builder()
        .with_writer(std::io::stderr)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_env_filter(filter)
        .finish()
        .init();
    let _span = info_span!("fuel-router").entered();
    debug!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    // Parse our command-line arguments and environment.
    let opt = Opt::parse();
    let config = Config::from_env()?;

    // Describe our global metrics. Other metrics are described in the modules
    // that use them.
    describe_counter!(
        "fuelrouter.selected_errors.count",
        "Particularly interesting errors, by component and cause"
    );

    let result = match opt.cmd {
        Command::Import {
            csv,
            sleep,
            max,
            concurrent,
            skip_attempted,
            provider,
        } => {
            let db = connect_and_migrate(&config).await?;
            let http = shared_http_client(concurrent);
            let (census, google, osm) = build_providers(&http, &config, Some(db.clone()));
            import_fuel_prices(
                db,
                census,
                google,
                osm,
                ImportOptions {
                    csv_path: csv,
                    sleep_seconds: sleep,
                    max,
                    concurrent,
                    skip_attempted,
                    priority: provider,
                },
            )
            .await
        }
        Command::Server { listen_address } => {
            let db = connect_and_migrate(&config).await?;
            let redis_url = config
                .redis_url
                .as_deref()
                .context("could not read REDIS_URL")?;
            let route_cache = RouteCache::new(redis_url).await?;
            let http = shared_http_client(8);
            let (census, google, osm) = build_providers(&http, &config, Some(db.clone()));
            let state = AppState {
                db,
                osrm: OsrmClient::new(
                    http.clone(),
                    config.osrm_base_url.clone(),
                    Some(route_cache),
                ),
                census,
                google,
                osm,
                internal_api_key: config.internal_api_key.clone(),
            };
            run_server(&listen_address, state).await
        }
    };

    if let Err(err) = result {
        errors::display_causes_and_backtrace(&err);
        std::process::exit(1);
    }
    Ok(())
}

/// Connect to the store and bring the schema up to date.
async fn connect_and_migrate(config: &Config) -> Result<Db> {
    let db = Db::connect(&config.database_url).await?;
    db.migrate().await?;
    Ok(db)
}

/// Build the three geocoding providers shared by a run.
fn build_providers(
    http: &SharedHttpClient,
    config: &Config,
    geocode_cache: Option<Db>,
) -> (
    Arc<dyn GeocodingProvider>,
    Arc<dyn GeocodingProvider>,
    Arc<dyn GeocodingProvider>,
) {
    let census = Arc::new(CensusProvider::new(http.clone(), geocode_cache));
    let google = Arc::new(GoogleMapsProvider::new(
        http.clone(),
        config.google_maps_api_key.clone(),
    ));
    let osm = Arc::new(OsmProvider::new(http.clone()));
    (census, google, osm)
}
