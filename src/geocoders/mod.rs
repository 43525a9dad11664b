//! Geocoding backends.
//!
//! Three external providers (US Census, Google Maps, OSM Nominatim) behind
//! one small trait. Providers never let an error escape: every failure mode
//! is folded into a `(None, metadata)` return so the router can fall
//! through to its next strategy and record what happened.

use std::{sync::Arc, time::Duration};

use anyhow::{format_err, Context, Result};
use async_trait::async_trait;
use futures::stream::StreamExt;
use geo_types::Point;
use hyper::{client::HttpConnector, Body, Client, Request, StatusCode};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use serde_json::Value;
use url::Url;

pub mod census;
pub mod google;
pub mod osm;
pub mod router;

/// A `hyper` client shared between multiple workers.
pub type SharedHttpClient = Arc<Client<HttpsConnector<HttpConnector>>>;

pub fn shared_http_client(concurrency: usize) -> SharedHttpClient {
    // Create a shared `hyper::Client` with a connection pool, so that we can
    // use keep-alive.
    Arc::new(
        Client::builder().pool_max_idle_per_host(concurrency).build(
            // The public OSRM demo server is plain HTTP, so we can't insist
            // on TLS here the way a single-API client could.
            HttpsConnectorBuilder::new()
                .with_native_roots()
                .https_or_http()
                .enable_http1()
                .enable_http2()
                .build(),
        ),
    )
}

/// Abstract geocoding provider interface.
#[async_trait]
pub trait GeocodingProvider: Send + Sync + 'static {
    /// A short name for this provider, e.g. `census` or `google_maps`.
    ///
    /// This appears in per-request cache keys, audit-trail labels, and the
    /// `geocoded:<provider>:<strategy>` source labels stored with each
    /// station, so it must stay stable.
    fn name(&self) -> &'static str;

    /// Is this provider ready to accept queries? Providers that need
    /// credentials report `false` here when they have none, and the router
    /// skips their strategies entirely.
    fn viable(&self) -> bool {
        true
    }

    /// Geocode a single free-form query.
    ///
    /// Failures never propagate past this boundary: they come back as
    /// `(None, metadata)` with an `error` field describing what went wrong.
    async fn geocode(&self, query: &str) -> (Option<Point<f64>>, Value);
}

/// Perform a GET request and collect the response body, with a hard
/// per-attempt timeout.
pub(crate) async fn get_bytes(
    client: &SharedHttpClient,
    url: &Url,
    headers: &[(&'static str, &str)],
    timeout: Duration,
) -> Result<(StatusCode, Vec<u8>)> {
    let mut builder = Request::builder().method("GET").uri(url.as_str());
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let req = builder
        .body(Body::empty())
        .context("could not build request")?;

    let res = tokio::time::timeout(timeout, client.request(req))
        .await
        .map_err(|_| format_err!("request timed out after {:?}", timeout))?
        .context("transport error")?;

    let status = res.status();
    let mut body = res.into_body();
    let mut body_data = vec![];
    while let Some(chunk_result) = body.next().await {
        let chunk = chunk_result.context("error reading response body")?;
        body_data.extend(&chunk[..]);
    }
    Ok((status, body_data))
}
