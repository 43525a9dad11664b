//! Client for the external OSRM routing engine.
//!
//! One endpoint: driving route between two coordinates, full-overview
//! polyline6 geometry, no turn-by-turn steps. Responses are cached in
//! Redis for 24 hours keyed by the coordinate pair; a broken cache only
//! costs us speed, never correctness.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::errors::PlanError;
use crate::geocoders::{get_bytes, SharedHttpClient};
use crate::route_cache::{RouteCache, ROUTE_TTL_SECONDS};

pub const DEFAULT_BASE_URL: &str = "http://router.project-osrm.org/route/v1/driving";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// The slice of an OSRM route we care about.
#[derive(Clone, Debug, Deserialize)]
pub struct OsrmRoute {
    /// Encoded polyline, precision 6.
    pub geometry: String,
    /// Total driving distance in meters.
    pub distance: f64,
}

pub struct OsrmClient {
    client: SharedHttpClient,
    base_url: String,
    cache: Option<RouteCache>,
}

impl OsrmClient {
    pub fn new(
        client: SharedHttpClient,
        base_url: String,
        cache: Option<RouteCache>,
    ) -> OsrmClient {
        OsrmClient {
            client,
            base_url,
            cache,
        }
    }

    /// Fetch the driving route between two `(lat, lon)` coordinates.
    pub async fn route(
        &self,
        start: (f64, f64),
        finish: (f64, f64),
    ) -> Result<OsrmRoute, PlanError> {
        let cache_key = format!(
            "osrm_route:{},{}:{},{}",
            start.0, start.1, finish.0, finish.1
        );

        if let Some(cache) = &self.cache {
            match cache.get(&cache_key).await {
                Ok(Some(cached)) => match serde_json::from_str::<Value>(&cached) {
                    Ok(raw) => {
                        debug!("route cache hit for {}", cache_key);
                        return parse_route(&raw);
                    }
                    Err(err) => warn!("ignoring corrupt cached route: {}", err),
                },
                Ok(None) => {}
                Err(err) => warn!("route cache read failed: {:#}", err),
            }
        }

        // OSRM wants `{lon},{lat};{lon},{lat}`.
        let url_str = format!(
            "{}/{},{};{},{}",
            self.base_url, start.1, start.0, finish.1, finish.0
        );
        let mut url = Url::parse(&url_str)
            .map_err(|err| PlanError::RoutingEngine(format!("bad OSRM URL: {}", err)))?;
        url.query_pairs_mut()
            .append_pair("overview", "full")
            .append_pair("geometries", "polyline6")
            .append_pair("steps", "false")
            .finish();

        let (status, body) = get_bytes(&self.client, &url, &[], REQUEST_TIMEOUT)
            .await
            .map_err(|err| {
                PlanError::RoutingEngine(format!(
                    "failed to connect to routing service: {:#}",
                    err
                ))
            })?;
        if !status.is_success() {
            return Err(PlanError::RoutingEngine(format!(
                "routing service returned HTTP {}",
                status
            )));
        }

        let data: Value = serde_json::from_slice(&body).map_err(|err| {
            PlanError::RoutingEngine(format!("bad routing service response: {}", err))
        })?;
        if data["code"].as_str() != Some("Ok") {
            return Err(PlanError::RoutingEngine(format!(
                "OSRM error: {}",
                data["message"].as_str().unwrap_or("unknown")
            )));
        }

        let raw_route = &data["routes"][0];
        let route = parse_route(raw_route)?;

        if let Some(cache) = &self.cache {
            if let Err(err) = cache
                .set_ex(&cache_key, &raw_route.to_string(), ROUTE_TTL_SECONDS)
                .await
            {
                warn!("route cache write failed: {:#}", err);
            }
        }

        Ok(route)
    }
}

fn parse_route(raw: &Value) -> Result<OsrmRoute, PlanError> {
    serde_json::from_value(raw.clone()).map_err(|err| {
        PlanError::RoutingEngine(format!("malformed route in response: {}", err))
    })
}
