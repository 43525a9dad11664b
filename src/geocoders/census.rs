//! US Census Bureau geocoder.
//!
//! Free, no API key, reasonably accurate for real postal addresses, and
//! slow enough that we keep a persistent cache of every query in the
//! store. See
//! <https://geocoding.geo.census.gov/geocoder/Geocoding_Services_API.html>.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use geo_types::Point;
use metrics::{counter, describe_histogram, histogram, Unit};
use serde_json::{json, Value};
use tracing::{debug, warn};
use url::Url;

use crate::db::Db;
use crate::geocoders::{get_bytes, GeocodingProvider, SharedHttpClient};

const BASE_URL: &str =
    "https://geocoding.geo.census.gov/geocoder/locations/onelineaddress";

/// The Census API can be very slow; give it plenty of room per attempt.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Statuses worth retrying: rate limiting and transient gateway failures.
const RETRYABLE_STATUSES: &[u16] = &[429, 502, 503, 504];

pub struct CensusProvider {
    client: SharedHttpClient,
    /// Persistent geocode cache. `None` in unit tests and anywhere else a
    /// store isn't available; the provider then goes straight to the API.
    cache: Option<Db>,
    max_retries: u32,
}

impl CensusProvider {
    pub fn new(client: SharedHttpClient, cache: Option<Db>) -> CensusProvider {
        describe_histogram!(
            "fuelrouter.census.geocode_request.duration_seconds",
            Unit::Seconds,
            "Time required for the Census API to geocode one address"
        );
        CensusProvider {
            client,
            cache,
            max_retries: 2,
        }
    }

    /// One GET against the onelineaddress endpoint. `Ok(None)` means "try
    /// again", which keeps the retry policy in one place in `geocode`.
    async fn request_once(&self, query: &str) -> Option<Result<Value, Value>> {
        let mut url = match Url::parse(BASE_URL) {
            Ok(url) => url,
            Err(err) => {
                return Some(Err(json!({
                    "provider": self.name(),
                    "query": query,
                    "error": err.to_string(),
                })))
            }
        };
        url.query_pairs_mut()
            .append_pair("address", query)
            .append_pair("benchmark", "Public_AR_Current")
            .append_pair("format", "json")
            .finish();

        let start = Instant::now();
        let result = get_bytes(&self.client, &url, &[], REQUEST_TIMEOUT).await;
        histogram!(
            "fuelrouter.census.geocode_request.duration_seconds",
            (Instant::now() - start).as_secs_f64(),
        );

        let (status, body) = match result {
            Ok(pair) => pair,
            Err(err) => {
                warn!("census transport error for {:?}: {:#}", query, err);
                counter!("fuelrouter.selected_errors.count", 1, "component" => "census", "cause" => "transport");
                return None;
            }
        };

        if RETRYABLE_STATUSES.contains(&status.as_u16()) {
            warn!("census API status {} for {:?}, retrying", status, query);
            return None;
        }
        if !status.is_success() {
            warn!("census API unexpected status {} for {:?}", status, query);
            counter!("fuelrouter.selected_errors.count", 1, "component" => "census", "cause" => status.to_string());
            return None;
        }

        match serde_json::from_slice::<Value>(&body) {
            Ok(data) => Some(Ok(data)),
            Err(_) => {
                // Probably an HTML error page; treat as transient.
                warn!(
                    "census API returned non-JSON for {:?}: {:?}…",
                    query,
                    String::from_utf8_lossy(&body[..body.len().min(100)])
                );
                None
            }
        }
    }
}

#[async_trait]
impl GeocodingProvider for CensusProvider {
    fn name(&self) -> &'static str {
        "census"
    }

    async fn geocode(&self, query: &str) -> (Option<Point<f64>>, Value) {
        let normalized = query.trim().to_lowercase();

        // Check the persistent cache first. A cache failure is only worth a
        // warning; we can always re-ask the API.
        if let Some(db) = &self.cache {
            match db.geocode_cache_lookup(&normalized).await {
                Ok(Some((point, mut meta))) => {
                    counter!("fuelrouter.geocode_cache_hits.total", 1);
                    if let Some(obj) = meta.as_object_mut() {
                        obj.insert("provider".to_owned(), json!(self.name()));
                    }
                    return (Some(point), meta);
                }
                Ok(None) => {}
                Err(err) => warn!("geocode cache lookup failed: {:#}", err),
            }
        }

        for attempt in 0..self.max_retries {
            if attempt > 0 {
                // Linear backoff, matching how gently the Census API likes
                // to be treated: 2s, 4s, ...
                tokio::time::sleep(Duration::from_secs(2 * u64::from(attempt))).await;
            }

            let data = match self.request_once(query).await {
                Some(Ok(data)) => data,
                Some(Err(meta)) => return (None, meta),
                None => continue,
            };

            let matches = match data["result"]["addressMatches"].as_array() {
                Some(matches) => matches,
                None => {
                    warn!("census response missing addressMatches for {:?}", query);
                    continue;
                }
            };
            let Some(first) = matches.first() else {
                debug!("census had no match for {:?}", query);
                return (
                    None,
                    json!({ "provider": self.name(), "query": query, "result": null }),
                );
            };

            // WGS84: `x` is longitude, `y` is latitude.
            let (lon, lat) = match (
                first["coordinates"]["x"].as_f64(),
                first["coordinates"]["y"].as_f64(),
            ) {
                (Some(lon), Some(lat)) => (lon, lat),
                _ => {
                    return (
                        None,
                        json!({ "provider": self.name(), "query": query, "result": null }),
                    )
                }
            };

            let point = Point::new(lon, lat);
            let mut meta = first.clone();
            if let Some(obj) = meta.as_object_mut() {
                obj.insert("provider".to_owned(), json!(self.name()));
            }

            if let Some(db) = &self.cache {
                // Concurrent workers may race to insert the same normalized
                // query; the store resolves that to "first writer wins" and
                // we never see an error for it.
                if let Err(err) = db
                    .geocode_cache_store(query, &normalized, point, &meta)
                    .await
                {
                    warn!("could not store geocode cache entry: {:#}", err);
                }
            }

            return (Some(point), meta);
        }

        (
            None,
            json!({
                "provider": self.name(),
                "query": query,
                "error": format!("no answer after {} attempts", self.max_retries),
            }),
        )
    }
}
