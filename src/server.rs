//! Code to support server mode: the HTTP shell around the planner.
//!
//! One route, `POST /api/v1/route-plan`. The handler is a thin
//! orchestration layer: resolve the endpoints, fetch the route, load the
//! corridor, run the planner, translate errors into status codes. All the
//! interesting decisions live in the modules it calls.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    headers::HeaderMap,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::db::Db;
use crate::errors::PlanError;
use crate::geocoders::router::{GeocodingRouter, ProviderPriority};
use crate::geocoders::GeocodingProvider;
use crate::geometry;
use crate::osrm::OsrmClient;
use crate::planner::{plan_fuel_stops, PlanStop, RouteStation};

/// Rough contiguous-US bounding box, for an advisory sanity check on
/// resolved endpoints. Deliberately a warning, not a rejection: the box is
/// too crude to gate real traffic on.
const USA_LAT_RANGE: (f64, f64) = (24.0, 50.0);
const USA_LON_RANGE: (f64, f64) = (-125.0, -66.0);

/// Shared server state.
pub struct AppState {
    pub db: Db,
    pub osrm: OsrmClient,
    pub census: Arc<dyn GeocodingProvider>,
    pub google: Arc<dyn GeocodingProvider>,
    pub osm: Arc<dyn GeocodingProvider>,
    pub internal_api_key: Option<String>,
}

// Run the server. Should not return.
pub async fn run_server(listen_addr: &str, state: AppState) -> Result<()> {
    let app = Router::new()
        .route("/api/v1/route-plan", post(handle_route_plan))
        .layer(Extension(Arc::new(state)))
        // Plenty for two endpoints and a corridor width.
        .layer(DefaultBodyLimit::max(16384));

    let listen_addr = listen_addr.parse().with_context(|| {
        format!("could not parse listen address: {:?}", listen_addr)
    })?;

    axum::Server::bind(&listen_addr)
        .serve(app.into_make_service())
        .await
        .context("web server failed to start")
}

/// A route endpoint: either a free-text location or explicit coordinates.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(untagged, deny_unknown_fields)]
enum EndpointSpec {
    Coords { lat: f64, lon: f64 },
    Address(String),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RoutePlanRequest {
    start: EndpointSpec,
    finish: EndpointSpec,
    #[serde(default = "default_corridor_miles")]
    corridor_miles: i64,
}

fn default_corridor_miles() -> i64 {
    10
}

#[derive(Debug, Serialize)]
struct LatLon {
    lat: f64,
    lon: f64,
}

#[derive(Debug, Serialize)]
struct RoutePlanResponse {
    start: LatLon,
    finish: LatLon,
    route_distance_miles: f64,
    /// `[min_lon, min_lat, max_lon, max_lat]` of the route geometry.
    bbox: [f64; 4],
    /// The encoded polyline (precision 6), passed through for the client.
    polyline: String,
    fuel_plan: Vec<PlanStop>,
    total_cost: f64,
    total_gallons: f64,
}

/// An error we can hand back to axum.
enum ApiError {
    Plan(PlanError),
    Forbidden(String),
}

impl From<PlanError> for ApiError {
    fn from(err: PlanError) -> Self {
        ApiError::Plan(err)
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::Plan(PlanError::Store(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Forbidden(message) => (
                StatusCode::FORBIDDEN,
                serde_json::json!({ "error": message }),
            ),
            ApiError::Plan(err) => {
                let status = match &err {
                    PlanError::Validation(_) => StatusCode::BAD_REQUEST,
                    PlanError::GeocodingUnresolved { .. } => StatusCode::BAD_REQUEST,
                    PlanError::RoutingEngine(_) => StatusCode::INTERNAL_SERVER_ERROR,
                    PlanError::PlanningInfeasible(_) => StatusCode::UNPROCESSABLE_ENTITY,
                    PlanError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let body = match &err {
                    PlanError::PlanningInfeasible(message) => serde_json::json!({
                        "error": message,
                        "detail":
                            "Try increasing corridor_miles or check route feasibility.",
                    }),
                    other => serde_json::json!({ "error": other.to_string() }),
                };
                (status, body)
            }
        };
        (status, Json(body)).into_response()
    }
}

/// POST /api/v1/route-plan
async fn handle_route_plan(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Json(raw): Json<Value>,
) -> Result<Json<RoutePlanResponse>, ApiError> {
    check_api_key(&headers, state.internal_api_key.as_deref())?;

    // Deserialize by hand so shape problems are our 400, not the
    // extractor's default rejection.
    let request: RoutePlanRequest = serde_json::from_value(raw)
        .map_err(|err| PlanError::Validation(format!("invalid request: {}", err)))?;
    if !(1..=50).contains(&request.corridor_miles) {
        return Err(PlanError::Validation(
            "corridor_miles must be between 1 and 50".to_owned(),
        )
        .into());
    }

    // Resolve both endpoints to coordinates.
    let start = resolve_endpoint(&state, &request.start).await?;
    let finish = resolve_endpoint(&state, &request.finish).await?;
    for coords in [start, finish] {
        warn_if_outside_usa(coords);
    }

    // Fetch and decode the driving route.
    let route = state.osrm.route(start, finish).await?;
    let route_points = geometry::decode_polyline6(&route.geometry);
    if route_points.len() < 2 {
        return Err(PlanError::RoutingEngine(
            "routing service returned a degenerate geometry".to_owned(),
        )
        .into());
    }
    let total_miles = geometry::meters_to_miles(route.distance);
    let straight_line_miles =
        geometry::meters_to_miles(geometry::haversine_distance(start, finish));
    if total_miles < straight_line_miles {
        warn!(
            "routing engine distance {:.1} mi is shorter than the {:.1} mi \
             straight line between the endpoints",
            total_miles, straight_line_miles
        );
    }

    // Load corridor stations, projected onto the route.
    let wkt = geometry::linestring_wkt(&route_points);
    let corridor = state
        .db
        .stations_within_corridor(&wkt, request.corridor_miles as f64)
        .await?;
    let stations: Vec<RouteStation> = corridor
        .into_iter()
        .map(|s| RouteStation {
            opis_id: s.opis_id,
            name: s.name,
            address: s.address,
            city: s.city,
            state: s.state,
            lat: s.lat,
            lon: s.lon,
            price_per_gallon: decimal_to_f64(s.retail_price),
            dist_from_start: s.fraction * total_miles,
        })
        .collect();

    let plan = plan_fuel_stops(&stations, total_miles)?;

    Ok(Json(RoutePlanResponse {
        start: LatLon {
            lat: start.0,
            lon: start.1,
        },
        finish: LatLon {
            lat: finish.0,
            lon: finish.1,
        },
        route_distance_miles: total_miles,
        bbox: geometry::bbox(&route_points),
        polyline: route.geometry,
        fuel_plan: plan.stops,
        total_cost: plan.total_cost,
        total_gallons: plan.total_gallons,
    }))
}

/// Enforce the `X-API-Key` header against the configured internal key.
fn check_api_key(headers: &HeaderMap, configured: Option<&str>) -> Result<(), ApiError> {
    let presented = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok());
    match (configured, presented) {
        // No key configured, none presented: the server is open.
        (None, None) => Ok(()),
        (None, Some(_)) => Err(ApiError::Forbidden(
            "API Key authentication is enabled but not configured on the server."
                .to_owned(),
        )),
        (Some(_), None) => {
            Err(ApiError::Forbidden("Authentication required.".to_owned()))
        }
        (Some(expected), Some(presented)) if expected == presented => Ok(()),
        (Some(_), Some(_)) => Err(ApiError::Forbidden("Invalid API Key.".to_owned())),
    }
}

/// Resolve an endpoint spec to `(lat, lon)`.
async fn resolve_endpoint(
    state: &AppState,
    spec: &EndpointSpec,
) -> Result<(f64, f64), PlanError> {
    match spec {
        EndpointSpec::Coords { lat, lon } => {
            if !(-90.0..=90.0).contains(lat) || !(-180.0..=180.0).contains(lon) {
                return Err(PlanError::Validation(format!(
                    "coordinates out of range: ({}, {})",
                    lat, lon
                )));
            }
            Ok((*lat, *lon))
        }
        EndpointSpec::Address(query) => {
            let query = query.trim();
            if query.is_empty() {
                return Err(PlanError::Validation("address cannot be empty".to_owned()));
            }

            // A fresh router per request: its cache lives only as long as
            // this request does.
            let mut router = GeocodingRouter::new(
                state.census.clone(),
                state.google.clone(),
                state.osm.clone(),
                ProviderPriority::Smart,
            );
            let (point, _debug) = router.geocode_string(query).await;
            match point {
                Some(point) => Ok((point.y(), point.x())),
                None => Err(PlanError::GeocodingUnresolved {
                    query: query.to_owned(),
                    hint: if router.google_viable() {
                        None
                    } else {
                        Some(
                            "Google Maps API Key not configured, and the free \
                             providers failed for this input."
                                .to_owned(),
                        )
                    },
                }),
            }
        }
    }
}

/// Log a warning for endpoints outside the rough contiguous-US box.
fn warn_if_outside_usa(coords: (f64, f64)) {
    let (lat, lon) = coords;
    if !(USA_LAT_RANGE.0..=USA_LAT_RANGE.1).contains(&lat)
        || !(USA_LON_RANGE.0..=USA_LON_RANGE.1).contains(&lon)
    {
        warn!(
            "endpoint ({}, {}) is outside the contiguous US; planning anyway",
            lat, lon
        );
    }
}

fn decimal_to_f64(value: rust_decimal::Decimal) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    value.to_f64().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_spec_accepts_strings_and_coords() {
        let spec: EndpointSpec = serde_json::from_value(serde_json::json!("Miami, FL"))
            .unwrap();
        assert_eq!(spec, EndpointSpec::Address("Miami, FL".to_owned()));

        let spec: EndpointSpec =
            serde_json::from_value(serde_json::json!({ "lat": 25.76, "lon": -80.19 }))
                .unwrap();
        assert_eq!(
            spec,
            EndpointSpec::Coords {
                lat: 25.76,
                lon: -80.19
            }
        );

        assert!(serde_json::from_value::<EndpointSpec>(serde_json::json!({
            "latitude": 25.76
        }))
        .is_err());
    }

    #[test]
    fn corridor_miles_defaults_to_ten() {
        let request: RoutePlanRequest = serde_json::from_value(serde_json::json!({
            "start": "Miami, FL",
            "finish": "New York, NY",
        }))
        .unwrap();
        assert_eq!(request.corridor_miles, 10);
    }

    #[test]
    fn api_key_decision_table() {
        let header = |value: Option<&str>| {
            let mut headers = HeaderMap::new();
            if let Some(value) = value {
                headers.insert("x-api-key", value.parse().unwrap());
            }
            headers
        };

        // Open server.
        assert!(check_api_key(&header(None), None).is_ok());
        // Key presented but none configured: misconfiguration, not access.
        assert!(check_api_key(&header(Some("k")), None).is_err());
        // Key configured but absent or wrong.
        assert!(check_api_key(&header(None), Some("secret")).is_err());
        assert!(check_api_key(&header(Some("wrong")), Some("secret")).is_err());
        // Matching key.
        assert!(check_api_key(&header(Some("secret")), Some("secret")).is_ok());
    }

    #[test]
    fn decimal_prices_convert_cleanly() {
        let price: rust_decimal::Decimal = "3.459".parse().unwrap();
        assert!((decimal_to_f64(price) - 3.459).abs() < 1e-12);
    }
}
