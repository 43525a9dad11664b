//! The geocoding router.
//!
//! Takes either a free-form query or a station's (address, city, state)
//! triple and works through an ordered list of provider strategies chosen
//! from the address classification. The per-classification attempt lists
//! are *data* (see [`strategy_table`]), walked by one loop, so adding or
//! reordering a strategy never touches control flow.
//!
//! A router is cheap and is constructed fresh for every request (or every
//! ingest worker task), which is what makes its in-process cache safe
//! without locks: the cache lives and dies with the request. Negative
//! results are cached too, so one request never asks a provider the same
//! question twice.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::format_err;
use geo_types::Point;
use serde::Serialize;
use serde_json::{json, Value};

use crate::classify::{best_road_pairs, classify, extract_roads, remove_exit_and_noise, AddressKind};
use crate::geocoders::GeocodingProvider;
use crate::{Error, Result};

/// Which provider ordering to use for postal addresses.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProviderPriority {
    /// Census first for postal addresses (it's free), Google for the rest.
    Smart,
    /// Google first everywhere it's viable. Costs money, resolves more.
    GoogleThenCensus,
}

impl Default for ProviderPriority {
    fn default() -> Self {
        ProviderPriority::Smart
    }
}

impl fmt::Display for ProviderPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderPriority::Smart => "smart",
            ProviderPriority::GoogleThenCensus => "google_then_census",
        };
        s.fmt(f)
    }
}

impl FromStr for ProviderPriority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "smart" => Ok(ProviderPriority::Smart),
            "google_then_census" => Ok(ProviderPriority::GoogleThenCensus),
            _ => Err(format_err!("unknown provider priority {:?}", s)),
        }
    }
}

/// Which of the router's providers a strategy uses.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ProviderKind {
    Census,
    Google,
    Osm,
}

/// How to build the query string for one strategy.
#[derive(Clone, Copy, Debug)]
enum QueryTemplate {
    /// `"{address}, {city}, {state}"`.
    FullAddress,
    /// The raw address alone.
    AddressOnly,
    /// `"{address-with-exits-stripped}, {city}, {state}"`.
    NoExitFull,
    /// `"{pair.0} & {pair.1}, {city}, {state}"` for the i-th ranked road
    /// pair. Skipped when fewer pairs exist.
    BestPair(usize),
    /// `"{city}, {state}"`.
    Place,
}

/// One strategy: a provider, a query shape, and the label recorded in
/// `geocoded:<provider>:<strategy>` on success.
struct Attempt {
    provider: ProviderKind,
    template: QueryTemplate,
    strategy: &'static str,
}

const fn attempt(
    provider: ProviderKind,
    template: QueryTemplate,
    strategy: &'static str,
) -> Attempt {
    Attempt {
        provider,
        template,
        strategy,
    }
}

/// The ordered strategies for a classification, plus the terminal reason
/// code recorded when every one of them comes up empty.
fn strategy_table(
    kind: AddressKind,
    priority: ProviderPriority,
    google_viable: bool,
) -> (Vec<Attempt>, &'static str) {
    use AddressKind::*;
    use ProviderKind::*;
    use QueryTemplate::*;

    match kind {
        PostalAddress => {
            let attempts = if priority == ProviderPriority::GoogleThenCensus
                && google_viable
            {
                vec![
                    attempt(Google, FullAddress, "postal_full"),
                    attempt(Census, FullAddress, "postal_full"),
                    attempt(Census, AddressOnly, "postal_simple"),
                ]
            } else {
                vec![
                    attempt(Census, FullAddress, "postal_full"),
                    attempt(Census, AddressOnly, "postal_simple"),
                    attempt(Google, FullAddress, "postal_fallback"),
                ]
            };
            (attempts, "postal_no_match")
        }
        HighwayIntersection2 => (
            vec![
                attempt(Google, NoExitFull, "no_exit"),
                attempt(Google, BestPair(0), "best_pair"),
                attempt(Google, Place, "place_fallback"),
            ],
            "hwy2_no_match",
        ),
        HighwayIntersectionMulti => (
            vec![
                attempt(Google, BestPair(0), "best_pair_0"),
                attempt(Google, BestPair(1), "best_pair_1"),
                attempt(Google, NoExitFull, "no_exit_fallback"),
                attempt(Google, Place, "place_fallback"),
            ],
            "hwy_multi_no_match",
        ),
        SingleRoute | MileMarker => (
            vec![attempt(Google, Place, "place_fallback")],
            "unresolvable_single_route_no_place",
        ),
        Unknown => (
            vec![
                attempt(Google, NoExitFull, "unknown_clean"),
                attempt(Google, Place, "place_fallback"),
            ],
            "unknown_exhausted",
        ),
    }
}

/// The decision record for one routing run, persisted as `geocode_meta`.
#[derive(Clone, Debug, Default, Serialize)]
pub struct GeocodeDebug {
    pub classification: Option<String>,
    pub classification_info: Option<Value>,
    pub attempts: Vec<Value>,
    pub success: bool,
    pub success_label: Option<String>,
    pub reason: Option<&'static str>,
}

pub struct GeocodingRouter {
    census: Arc<dyn GeocodingProvider>,
    google: Arc<dyn GeocodingProvider>,
    osm: Arc<dyn GeocodingProvider>,
    priority: ProviderPriority,
    /// Request-scoped cache, keyed `"<provider>:<query>"`. Holds negative
    /// results as well so a request never repeats a failed lookup.
    cache: HashMap<String, (Option<Point<f64>>, Value)>,
}

impl GeocodingRouter {
    pub fn new(
        census: Arc<dyn GeocodingProvider>,
        google: Arc<dyn GeocodingProvider>,
        osm: Arc<dyn GeocodingProvider>,
        priority: ProviderPriority,
    ) -> GeocodingRouter {
        GeocodingRouter {
            census,
            google,
            osm,
            priority,
            cache: HashMap::new(),
        }
    }

    pub fn google_viable(&self) -> bool {
        self.google.viable()
    }

    fn provider(&self, kind: ProviderKind) -> &Arc<dyn GeocodingProvider> {
        match kind {
            ProviderKind::Census => &self.census,
            ProviderKind::Google => &self.google,
            ProviderKind::Osm => &self.osm,
        }
    }

    /// Ask one provider, going through the request cache, and append an
    /// audit entry either way.
    async fn try_provider(
        &mut self,
        kind: ProviderKind,
        query: &str,
        attempts: &mut Vec<Value>,
    ) -> Option<Point<f64>> {
        let provider = self.provider(kind).clone();
        let cache_key = format!("{}:{}", provider.name(), query);

        if let Some((point, meta)) = self.cache.get(&cache_key) {
            attempts.push(json!({
                "label": format!("{}_cached", provider.name()),
                "query": query,
                "meta_summary": summarize_meta(meta),
            }));
            return *point;
        }

        let (point, meta) = provider.geocode(query).await;
        attempts.push(json!({
            "label": format!("{}_query", provider.name()),
            "query": query,
            "meta_summary": summarize_meta(&meta),
        }));
        self.cache.insert(cache_key, (point, meta));
        point
    }

    /// Geocode a free-form query (a route endpoint like "Miami, FL").
    ///
    /// Tries Google when it's viable, then Census, then OSM.
    pub async fn geocode_string(&mut self, query: &str) -> (Option<Point<f64>>, GeocodeDebug) {
        let mut debug = GeocodeDebug::default();

        let order = [
            (ProviderKind::Google, self.google_viable()),
            (ProviderKind::Census, true),
            (ProviderKind::Osm, true),
        ];
        for (kind, viable) in order {
            if !viable {
                continue;
            }
            if let Some(point) = self.try_provider(kind, query, &mut debug.attempts).await {
                debug.success = true;
                debug.success_label =
                    Some(format!("{}:string_query", self.provider(kind).name()));
                return (Some(point), debug);
            }
        }

        debug.reason = Some("string_exhausted");
        (None, debug)
    }

    /// Geocode a station address using the classification-driven strategy
    /// table.
    pub async fn geocode_station(
        &mut self,
        address: &str,
        city: &str,
        state: &str,
    ) -> (Option<Point<f64>>, GeocodeDebug) {
        let classified = classify(address);
        let mut debug = GeocodeDebug {
            classification: Some(classified.kind.to_string()),
            classification_info: Some(json!({
                "raw": address,
                "roads": classified.roads,
                "reason": classified.reason,
            })),
            ..GeocodeDebug::default()
        };

        let no_exit_addr = remove_exit_and_noise(address);
        let road_source = if no_exit_addr.is_empty() {
            address
        } else {
            no_exit_addr.as_str()
        };
        let pairs = best_road_pairs(&extract_roads(road_source), 2);

        let (attempts, terminal_reason) =
            strategy_table(classified.kind, self.priority, self.google_viable());

        for a in &attempts {
            if a.provider == ProviderKind::Google && !self.google_viable() {
                continue;
            }
            let query = match render_query(a.template, address, &no_exit_addr, city, state, &pairs)
            {
                Some(query) => query,
                None => continue,
            };
            if let Some(point) = self
                .try_provider(a.provider, &query, &mut debug.attempts)
                .await
            {
                debug.success = true;
                debug.success_label = Some(format!(
                    "{}:{}",
                    self.provider(a.provider).name(),
                    a.strategy
                ));
                return (Some(point), debug);
            }
        }

        debug.reason = Some(terminal_reason);
        (None, debug)
    }
}

/// Render a query template. `None` means the template doesn't apply (e.g.
/// asking for the second-best road pair of a two-road address).
fn render_query(
    template: QueryTemplate,
    address: &str,
    no_exit_addr: &str,
    city: &str,
    state: &str,
    pairs: &[(String, String)],
) -> Option<String> {
    let query = match template {
        QueryTemplate::FullAddress => format!("{}, {}, {}", address, city, state),
        QueryTemplate::AddressOnly => address.to_owned(),
        QueryTemplate::NoExitFull => format!("{}, {}, {}", no_exit_addr, city, state),
        QueryTemplate::BestPair(i) => {
            let (a, b) = pairs.get(i)?;
            format!("{} & {}, {}, {}", a, b, city, state)
        }
        QueryTemplate::Place => format!("{}, {}", city, state),
    };
    Some(query.trim_matches(|c| c == ',' || c == ' ').to_owned())
}

/// Compress provider metadata down to the fields worth keeping in the
/// audit trail. Anything unrecognized is truncated raw.
pub fn summarize_meta(meta: &Value) -> Value {
    if meta.is_null() {
        return json!({ "meta": null });
    }

    if let Some(obj) = meta.as_object() {
        let mut keep = serde_json::Map::new();
        for key in [
            "matched_address",
            "match",
            "status",
            "score",
            "coordinates",
            "benchmark",
            "vintage",
            "error",
            "provider",
            "query",
            "importance",
            "type",
            "formatted_address",
        ] {
            if let Some(value) = obj.get(key) {
                keep.insert(key.to_owned(), value.clone());
            }
        }
        if keep.is_empty() {
            let raw = meta.to_string();
            keep.insert(
                "raw_truncated".to_owned(),
                json!(raw.chars().take(500).collect::<String>()),
            );
        }
        return Value::Object(keep);
    }

    json!({ "raw_truncated": meta.to_string().chars().take(500).collect::<String>() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A canned provider for router tests.
    struct StubProvider {
        name: &'static str,
        result: Option<Point<f64>>,
        viable: bool,
        calls: AtomicUsize,
    }

    impl StubProvider {
        fn new(name: &'static str, result: Option<Point<f64>>) -> Arc<StubProvider> {
            Arc::new(StubProvider {
                name,
                result,
                viable: true,
                calls: AtomicUsize::new(0),
            })
        }

        fn non_viable(name: &'static str) -> Arc<StubProvider> {
            Arc::new(StubProvider {
                name,
                result: None,
                viable: false,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GeocodingProvider for StubProvider {
        fn name(&self) -> &'static str {
            self.name
        }

        fn viable(&self) -> bool {
            self.viable
        }

        async fn geocode(&self, query: &str) -> (Option<Point<f64>>, Value) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.result {
                Some(point) => (Some(point), json!({ "provider": self.name, "query": query })),
                None => (None, json!({ "provider": self.name, "query": query, "error": "no match" })),
            }
        }
    }

    fn router_with(
        census: &Arc<StubProvider>,
        google: &Arc<StubProvider>,
        osm: &Arc<StubProvider>,
        priority: ProviderPriority,
    ) -> GeocodingRouter {
        GeocodingRouter::new(
            census.clone(),
            google.clone(),
            osm.clone(),
            priority,
        )
    }

    fn attempt_labels(debug: &GeocodeDebug) -> Vec<String> {
        debug
            .attempts
            .iter()
            .map(|a| a["label"].as_str().unwrap_or("").to_owned())
            .collect()
    }

    #[tokio::test]
    async fn geocode_string_falls_back_to_osm() {
        let census = StubProvider::new("census", None);
        let google = StubProvider::new("google_maps", None);
        let osm = StubProvider::new("osm", Some(Point::new(-80.0, 25.0)));
        let mut router = router_with(&census, &google, &osm, ProviderPriority::Smart);

        let (point, debug) = router.geocode_string("Unique City, ST").await;
        assert_eq!(point, Some(Point::new(-80.0, 25.0)));

        let labels = attempt_labels(&debug);
        assert_eq!(
            labels.iter().filter(|l| *l == "osm_query").count(),
            1,
            "labels: {:?}",
            labels
        );
        assert_eq!(debug.success_label.as_deref(), Some("osm:string_query"));
    }

    #[tokio::test]
    async fn identical_queries_hit_the_provider_once() {
        let census = StubProvider::new("census", Some(Point::new(-80.0, 25.0)));
        let google = StubProvider::non_viable("google_maps");
        let osm = StubProvider::new("osm", None);
        let mut router = router_with(&census, &google, &osm, ProviderPriority::Smart);

        let (first, _) = router.geocode_string("Miami, FL").await;
        let (second, debug) = router.geocode_string("Miami, FL").await;
        assert_eq!(first, second);
        assert_eq!(census.calls(), 1);
        assert_eq!(attempt_labels(&debug), vec!["census_cached".to_owned()]);
    }

    #[tokio::test]
    async fn negative_results_are_cached_too() {
        let census = StubProvider::new("census", None);
        let google = StubProvider::non_viable("google_maps");
        let osm = StubProvider::new("osm", None);
        let mut router = router_with(&census, &google, &osm, ProviderPriority::Smart);

        router.geocode_string("Nowhere, XX").await;
        router.geocode_string("Nowhere, XX").await;
        assert_eq!(census.calls(), 1);
        assert_eq!(osm.calls(), 1);
    }

    #[tokio::test]
    async fn postal_addresses_try_census_first_by_default() {
        let census = StubProvider::new("census", Some(Point::new(-80.19, 25.76)));
        let google = StubProvider::new("google_maps", Some(Point::new(0.0, 0.0)));
        let osm = StubProvider::new("osm", None);
        let mut router = router_with(&census, &google, &osm, ProviderPriority::Smart);

        let (point, debug) = router
            .geocode_station("123 Main St", "Miami", "FL")
            .await;
        assert!(point.is_some());
        assert_eq!(debug.classification.as_deref(), Some("POSTAL_ADDRESS"));
        assert_eq!(debug.success_label.as_deref(), Some("census:postal_full"));
        assert_eq!(google.calls(), 0);
        // The full query carries city and state.
        assert_eq!(
            debug.attempts[0]["query"].as_str(),
            Some("123 Main St, Miami, FL")
        );
    }

    #[tokio::test]
    async fn google_then_census_priority_asks_google_first() {
        let census = StubProvider::new("census", Some(Point::new(-1.0, 1.0)));
        let google = StubProvider::new("google_maps", Some(Point::new(-2.0, 2.0)));
        let osm = StubProvider::new("osm", None);
        let mut router =
            router_with(&census, &google, &osm, ProviderPriority::GoogleThenCensus);

        let (point, debug) = router
            .geocode_station("123 Main St", "Miami", "FL")
            .await;
        assert_eq!(point, Some(Point::new(-2.0, 2.0)));
        assert_eq!(
            debug.success_label.as_deref(),
            Some("google_maps:postal_full")
        );
        assert_eq!(census.calls(), 0);
    }

    #[tokio::test]
    async fn intersections_walk_googles_strategies_in_order() {
        let census = StubProvider::new("census", None);
        let google = StubProvider::new("google_maps", None);
        let osm = StubProvider::new("osm", None);
        let mut router = router_with(&census, &google, &osm, ProviderPriority::Smart);

        let (point, debug) = router
            .geocode_station("I-95 EXIT 12 & US-1", "Jacksonville", "FL")
            .await;
        assert!(point.is_none());
        assert_eq!(
            debug.classification.as_deref(),
            Some("HIGHWAY_INTERSECTION_2")
        );
        assert_eq!(debug.reason, Some("hwy2_no_match"));

        let queries: Vec<&str> = debug
            .attempts
            .iter()
            .filter_map(|a| a["query"].as_str())
            .collect();
        assert_eq!(
            queries,
            vec![
                "I-95 & US-1, Jacksonville, FL",
                "I-95 & US-1, Jacksonville, FL",
                "Jacksonville, FL",
            ]
        );
        // The duplicate best-pair query is served from the request cache.
        assert_eq!(google.calls(), 2);
        assert_eq!(
            attempt_labels(&debug)[1],
            "google_maps_cached".to_owned()
        );
    }

    #[tokio::test]
    async fn mile_markers_only_try_the_place() {
        let census = StubProvider::new("census", None);
        let google = StubProvider::new("google_maps", Some(Point::new(-81.0, 29.0)));
        let osm = StubProvider::new("osm", None);
        let mut router = router_with(&census, &google, &osm, ProviderPriority::Smart);

        let (point, debug) = router
            .geocode_station("I-75 MM 120", "Ocala", "FL")
            .await;
        assert!(point.is_some());
        assert_eq!(debug.classification.as_deref(), Some("MILE_MARKER"));
        assert_eq!(
            debug.success_label.as_deref(),
            Some("google_maps:place_fallback")
        );
        assert_eq!(debug.attempts[0]["query"].as_str(), Some("Ocala, FL"));
    }

    #[tokio::test]
    async fn no_google_key_degrades_to_terminal_reason() {
        let census = StubProvider::new("census", None);
        let google = StubProvider::non_viable("google_maps");
        let osm = StubProvider::new("osm", None);
        let mut router = router_with(&census, &google, &osm, ProviderPriority::Smart);

        let (point, debug) = router
            .geocode_station("I-95 & US-1", "Jacksonville", "FL")
            .await;
        assert!(point.is_none());
        assert!(debug.attempts.is_empty());
        assert_eq!(debug.reason, Some("hwy2_no_match"));
        assert_eq!(google.calls(), 0);
    }

    #[tokio::test]
    async fn multi_road_interchanges_rank_their_pairs() {
        let census = StubProvider::new("census", None);
        let google = StubProvider::new("google_maps", None);
        let osm = StubProvider::new("osm", None);
        let mut router = router_with(&census, &google, &osm, ProviderPriority::Smart);

        let (_, debug) = router
            .geocode_station("SR-7 & US-30 & I-76", "Denver", "CO")
            .await;
        assert_eq!(
            debug.classification.as_deref(),
            Some("HIGHWAY_INTERSECTION_MULTI")
        );
        let queries: Vec<&str> = debug
            .attempts
            .iter()
            .filter_map(|a| a["query"].as_str())
            .collect();
        // I+SR and I+US pairs outrank SR+US.
        assert_eq!(queries[0], "SR-7 & I-76, Denver, CO");
        assert_eq!(queries[1], "US-30 & I-76, Denver, CO");
        assert_eq!(debug.reason, Some("hwy_multi_no_match"));
    }

    #[test]
    fn summarize_meta_keeps_interesting_keys() {
        let meta = json!({
            "provider": "census",
            "query": "somewhere",
            "error": "no match",
            "uninteresting_blob": { "a": [1, 2, 3] },
        });
        let summary = summarize_meta(&meta);
        assert_eq!(summary["provider"], json!("census"));
        assert_eq!(summary["error"], json!("no match"));
        assert!(summary.get("uninteresting_blob").is_none());

        let summary = summarize_meta(&json!({ "opaque": true }));
        assert!(summary["raw_truncated"].is_string());
    }

    #[test]
    fn provider_priority_parses_cli_values() {
        assert_eq!(
            "smart".parse::<ProviderPriority>().unwrap(),
            ProviderPriority::Smart
        );
        assert_eq!(
            "google_then_census".parse::<ProviderPriority>().unwrap(),
            ProviderPriority::GoogleThenCensus
        );
        assert!("censusfirst".parse::<ProviderPriority>().is_err());
    }
}
