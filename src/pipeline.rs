//! The bulk ingest pipeline: parse the fuel price feed, insert new
//! stations, then geocode everything that still lacks a location.
//!
//! Geocoding is the slow part (three external APIs, some of them politely
//! throttled), so it runs on a bounded pool of concurrent workers. All
//! database writes stay on one side of a clear line: workers only *read*
//! station rows and talk to providers, and the single serial collector
//! draining the pool owns every update. That keeps batching trivial and
//! means a crashed worker can never leave a half-written row behind.
//!
//! A station that fails to geocode is recorded and counted, never fatal;
//! the only errors that abort an import are file/parse problems and
//! store failures.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use geo_types::Point;
use metrics::{counter, describe_counter};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::classify::{clean_piece, normalize_address_components};
use crate::db::{Db, GeocodeUpdate, NewStation};
use crate::geocoders::router::{GeocodingRouter, ProviderPriority};
use crate::geocoders::GeocodingProvider;

/// How many completed geocodes to buffer before writing a batch.
const UPDATE_BATCH_SIZE: usize = 50;

/// How often to log progress, in completed stations.
const PROGRESS_EVERY: usize = 100;

/// Options for an import run, straight from the CLI.
#[derive(Clone, Debug)]
pub struct ImportOptions {
    pub csv_path: PathBuf,
    /// Seconds each worker sleeps before asking the router, to stay polite
    /// to the free providers.
    pub sleep_seconds: f64,
    /// Cap on stations geocoded this run; 0 means no cap.
    pub max: usize,
    /// Worker pool size.
    pub concurrent: usize,
    /// Skip stations with a `geocode_source` already recorded.
    pub skip_attempted: bool,
    pub priority: ProviderPriority,
}

/// One row of the OPIS price feed.
#[derive(Debug, Deserialize)]
struct FeedRow {
    #[serde(rename = "OPIS Truckstop ID")]
    opis_id: i32,
    #[serde(rename = "Truckstop Name")]
    name: String,
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "City")]
    city: String,
    #[serde(rename = "State")]
    state: String,
    #[serde(rename = "Rack ID")]
    rack_id: String,
    #[serde(rename = "Retail Price")]
    retail_price: String,
}

/// What one worker hands back to the collector.
struct WorkerOutcome {
    id: i64,
    location: Option<Point<f64>>,
    source: String,
    meta: Option<Value>,
}

/// Run the whole import: parse, insert, geocode.
pub async fn import_fuel_prices(
    db: Db,
    census: Arc<dyn GeocodingProvider>,
    google: Arc<dyn GeocodingProvider>,
    osm: Arc<dyn GeocodingProvider>,
    options: ImportOptions,
) -> Result<()> {
    describe_counter!(
        "fuelrouter.stations_imported.total",
        "Stations inserted from the price feed"
    );
    describe_counter!(
        "fuelrouter.stations_geocoded.total",
        "Stations geocoded, by outcome"
    );

    if !google.viable() {
        warn!(
            "GOOGLE_MAPS_API_KEY is missing. Only the US Census geocoder will be \
             used; highway intersections and single routes may stay unresolved."
        );
    }

    // Phase 1: parse the feed.
    info!("reading CSV from {}", options.csv_path.display());
    let stations = read_feed(&options.csv_path)?;
    info!("parsed {} unique stations", stations.len());

    // Phase 2: insert rows we don't have yet.
    let existing = db.existing_opis_ids().await?;
    let to_insert: Vec<NewStation> = stations
        .into_iter()
        .filter(|s| !existing.contains(&s.opis_id))
        .collect();
    if to_insert.is_empty() {
        info!("no new records to insert");
    } else {
        let inserted = db.insert_stations(&to_insert).await?;
        counter!("fuelrouter.stations_imported.total", inserted);
        info!("inserted {} new records", inserted);
    }

    // Phase 3: geocode everything still missing a location.
    let ids = db
        .station_ids_to_geocode(options.skip_attempted, options.max)
        .await?;
    let total = ids.len();
    info!(
        "geocoding {} stations with {} workers (strategy: {})",
        total, options.concurrent, options.priority
    );
    if total == 0 {
        return Ok(());
    }

    let sleep_seconds = options.sleep_seconds;
    let priority = options.priority;
    let mut completions = futures::stream::iter(ids.into_iter().map(|id| {
        let db = db.clone();
        let census = census.clone();
        let google = google.clone();
        let osm = osm.clone();
        process_station(db, census, google, osm, priority, sleep_seconds, id)
    }))
    .buffer_unordered(options.concurrent);

    // The serial collector: the only place that writes geocode results.
    let mut attempted = 0;
    let mut successes = 0;
    let mut unresolved = 0;
    let mut batch: Vec<GeocodeUpdate> = Vec::with_capacity(UPDATE_BATCH_SIZE);
    while let Some(outcome) = completions.next().await {
        attempted += 1;
        if outcome.location.is_some() {
            successes += 1;
            counter!("fuelrouter.stations_geocoded.total", 1, "outcome" => "success");
            info!("✓ {}", outcome.source);
        } else {
            unresolved += 1;
            counter!("fuelrouter.stations_geocoded.total", 1, "outcome" => "unresolved");
            warn!("✗ {}", outcome.source);
        }

        batch.push(GeocodeUpdate {
            id: outcome.id,
            location: outcome.location,
            geocode_source: outcome.source,
            geocode_meta: outcome.meta,
        });
        if batch.len() >= UPDATE_BATCH_SIZE {
            db.update_geocode_results(&batch)
                .await
                .context("could not save geocode batch")?;
            batch.clear();
        }

        if attempted % PROGRESS_EVERY == 0 {
            info!("progress: {}/{}", attempted, total);
        }
    }
    if !batch.is_empty() {
        db.update_geocode_results(&batch)
            .await
            .context("could not save final geocode batch")?;
    }

    info!(
        "done. attempted: {}, success: {}, unresolved: {}",
        attempted, successes, unresolved
    );
    Ok(())
}

/// Parse and normalize the feed, de-duplicating by OPIS id (first row wins).
fn read_feed(csv_path: &Path) -> Result<Vec<NewStation>> {
    let mut rdr = csv::Reader::from_path(csv_path)
        .with_context(|| format!("cannot open {}", csv_path.display()))?;

    let mut seen = HashSet::new();
    let mut stations = Vec::new();
    for (i, row) in rdr.deserialize::<FeedRow>().enumerate() {
        let row = row.with_context(|| format!("bad feed row {}", i + 2))?;
        if !seen.insert(row.opis_id) {
            continue;
        }

        let (address, city, state) =
            normalize_address_components(&row.address, &row.city, &row.state);
        let rack_id = match row.rack_id.trim() {
            "" => None,
            raw => Some(raw.parse::<i32>().with_context(|| {
                format!("bad rack ID {:?} for station {}", raw, row.opis_id)
            })?),
        };
        let retail_price: Decimal = row.retail_price.trim().parse().with_context(|| {
            format!(
                "bad retail price {:?} for station {}",
                row.retail_price, row.opis_id
            )
        })?;

        stations.push(NewStation {
            opis_id: row.opis_id,
            name: clean_piece(&row.name),
            address,
            city,
            state,
            rack_id,
            retail_price,
        });
    }
    Ok(stations)
}

/// Geocode one station. Infallible by design: anything that goes wrong is
/// folded into an `error:` source label for the collector to record.
#[instrument(level = "debug", skip_all, fields(station_id = id))]
async fn process_station(
    db: Db,
    census: Arc<dyn GeocodingProvider>,
    google: Arc<dyn GeocodingProvider>,
    osm: Arc<dyn GeocodingProvider>,
    priority: ProviderPriority,
    sleep_seconds: f64,
    id: i64,
) -> WorkerOutcome {
    let station = match db.station_address(id).await {
        Ok(station) => station,
        Err(err) => {
            return WorkerOutcome {
                id,
                location: None,
                source: format!("error:{}", err),
                meta: None,
            }
        }
    };

    if sleep_seconds > 0.0 {
        tokio::time::sleep(Duration::from_secs_f64(sleep_seconds)).await;
    }

    // A fresh router per station: its in-process cache is single-owner, so
    // the worker pool needs no locks. Cross-station reuse comes from the
    // persistent cache inside the Census provider.
    let mut router = GeocodingRouter::new(census, google, osm, priority);
    let (location, debug) = router
        .geocode_station(&station.address, &station.city, &station.state)
        .await;

    // A provider handing back coordinates outside WGS84 bounds is broken;
    // record the failure rather than persisting garbage.
    if let Some(point) = &location {
        if !crate::geometry::in_wgs84_bounds(point) {
            warn!(
                "discarding out-of-bounds geocode ({}, {}) for station {}",
                point.y(),
                point.x(),
                station.opis_id
            );
            return WorkerOutcome {
                id,
                location: None,
                source: "error:geocode out of WGS84 bounds".to_owned(),
                meta: serde_json::to_value(&debug).ok(),
            };
        }
    }

    let source = match (&location, &debug.success_label) {
        (Some(_), Some(label)) => format!("geocoded:{}", label),
        _ => format!(
            "unresolved:{}:{}",
            debug.classification.as_deref().unwrap_or("UNKNOWN"),
            debug.reason.unwrap_or("no_reason"),
        ),
    };
    let meta = serde_json::to_value(&debug).ok();

    WorkerOutcome {
        id,
        location,
        source,
        meta,
    }
}
