//! OpenStreetMap (Nominatim) geocoder.
//!
//! Free and keyless, which makes it the fallback of last resort for
//! "City, ST" level queries. The public instance has a strict usage
//! policy: identify yourself with a User-Agent and stay at or under one
//! request per second. We enforce the rate limit here with a leaky-bucket
//! limiter rather than trusting every caller to remember, and we never
//! retry.
//!
//! See <https://operations.osmfoundation.org/policies/nominatim/>.

use std::time::Duration;

use async_trait::async_trait;
use geo_types::Point;
use leaky_bucket::RateLimiter;
use metrics::counter;
use serde_json::{json, Value};
use url::Url;

use crate::geocoders::{get_bytes, GeocodingProvider, SharedHttpClient};

const BASE_URL: &str = "https://nominatim.openstreetmap.org/search";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct OsmProvider {
    client: SharedHttpClient,
    user_agent: String,
    limiter: RateLimiter,
}

impl OsmProvider {
    pub fn new(client: SharedHttpClient) -> OsmProvider {
        OsmProvider {
            client,
            user_agent: format!(
                "{}/{} (fuel price routing)",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION"),
            ),
            // One request per second, with no burst allowance.
            limiter: RateLimiter::builder()
                .initial(1)
                .max(1)
                .refill(1)
                .interval(Duration::from_secs(1))
                .fair(false)
                .build(),
        }
    }
}

#[async_trait]
impl GeocodingProvider for OsmProvider {
    fn name(&self) -> &'static str {
        "osm"
    }

    async fn geocode(&self, query: &str) -> (Option<Point<f64>>, Value) {
        self.limiter.acquire_one().await;

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
            .append_pair("q", query)
            .append_pair("format", "json")
            .append_pair("limit", "1")
            .finish();

        let headers = [("User-Agent", self.user_agent.as_str())];
        let (status, body) =
            match get_bytes(&self.client, &url, &headers, REQUEST_TIMEOUT).await {
                Ok(pair) => pair,
                Err(err) => {
                    counter!("fuelrouter.selected_errors.count", 1, "component" => "osm", "cause" => "transport");
                    return (
                        None,
                        json!({ "provider": self.name(), "query": query, "error": format!("{:#}", err) }),
                    );
                }
            };
        if !status.is_success() {
            counter!("fuelrouter.selected_errors.count", 1, "component" => "osm", "cause" => status.to_string());
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

        let top = match data.as_array().and_then(|results| results.first()) {
            Some(top) => top,
            None => {
                return (
                    None,
                    json!({ "provider": self.name(), "query": query, "result": null }),
                )
            }
        };

        // Nominatim returns coordinates as strings.
        let lat = top["lat"].as_str().and_then(|s| s.parse::<f64>().ok());
        let lon = top["lon"].as_str().and_then(|s| s.parse::<f64>().ok());
        match (lat, lon) {
            (Some(lat), Some(lon)) => {
                let meta = json!({
                    "provider": self.name(),
                    "query": query,
                    "display_name": top["display_name"],
                    "type": top["type"],
                    "class": top["class"],
                });
                (Some(Point::new(lon, lat)), meta)
            }
            _ => (
                None,
                json!({ "provider": self.name(), "query": query, "error": "parse error: bad coordinates" }),
            ),
        }
    }
}
