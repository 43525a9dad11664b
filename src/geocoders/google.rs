//! Google Maps Platform geocoder.
//!
//! The only commercial provider, and the only one that can reliably
//! resolve highway intersections and "EXIT 15"-style references. Requires
//! `GOOGLE_MAPS_API_KEY`; without one the provider stays constructable but
//! reports itself non-viable so the router can degrade to Census-only
//! coverage.

use std::time::Duration;

use async_trait::async_trait;
use geo_types::Point;
use metrics::counter;
use serde_json::{json, Value};
use tracing::warn;
use url::Url;

use crate::geocoders::{get_bytes, GeocodingProvider, SharedHttpClient};

const BASE_URL: &str = "https://maps.googleapis.com/maps/api/geocode/json";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct GoogleMapsProvider {
    client: SharedHttpClient,
    api_key: Option<String>,
}

impl GoogleMapsProvider {
    pub fn new(client: SharedHttpClient, api_key: Option<String>) -> GoogleMapsProvider {
        if api_key.is_none() {
            warn!("GoogleMapsProvider has no GOOGLE_MAPS_API_KEY; its requests will fail");
        }
        GoogleMapsProvider { client, api_key }
    }
}

#[async_trait]
impl GeocodingProvider for GoogleMapsProvider {
    fn name(&self) -> &'static str {
        "google_maps"
    }

    fn viable(&self) -> bool {
        self.api_key.is_some()
    }

    async fn geocode(&self, query: &str) -> (Option<Point<f64>>, Value) {
        let api_key = match &self.api_key {
            Some(key) => key,
            None => {
                return (
                    None,
                    json!({ "provider": self.name(), "error": "missing API key" }),
                )
            }
        };

        let mut url = match Url::parse(BASE_URL) {
            Ok(url) => url,
            Err(err) => {
                return (
                    None,
                    json!({ "provider": self.name(), "query": query, "error": err.to_string() }),
                )
            }
        };
        url.query_pairs_mut()
            .append_pair("address", query)
            .append_pair("key", api_key)
            .finish();

        // No retries: Google either answers or bills us for asking again.
        let (status, body) =
            match get_bytes(&self.client, &url, &[], REQUEST_TIMEOUT).await {
                Ok(pair) => pair,
                Err(err) => {
                    counter!("fuelrouter.selected_errors.count", 1, "component" => "google_maps", "cause" => "transport");
                    return (
                        None,
                        json!({ "provider": self.name(), "query": query, "error": format!("{:#}", err) }),
                    );
                }
            };
        if !status.is_success() {
            counter!("fuelrouter.selected_errors.count", 1, "component" => "google_maps", "cause" => status.to_string());
            return (
                None,
                json!({ "provider": self.name(), "query": query, "error": format!("HTTP {}", status) }),
            );
        }
        let data: Value = match serde_json::from_slice(&body) {
            Ok(data) => data,
            Err(err) => {
                return (
                    None,
                    json!({ "provider": self.name(), "query": query, "error": format!("parse error: {}", err) }),
                )
            }
        };

        let api_status = data["status"].as_str().unwrap_or("");
        if api_status != "OK" {
            return (
                None,
                json!({
                    "provider": self.name(),
                    "query": query,
                    "status": api_status,
                    "error_message": data["error_message"],
                }),
            );
        }

        let top = &data["results"][0];
        let location = &top["geometry"]["location"];
        match (location["lat"].as_f64(), location["lng"].as_f64()) {
            (Some(lat), Some(lon)) => {
                let meta = json!({
                    "provider": self.name(),
                    "query": query,
                    "formatted_address": top["formatted_address"],
                    "place_id": top["place_id"],
                    "types": top["types"],
                    "partial_match": top["partial_match"].as_bool().unwrap_or(false),
                });
                (Some(Point::new(lon, lat)), meta)
            }
            _ => (
                None,
                json!({ "provider": self.name(), "query": query, "result": null }),
            ),
        }
    }
}
