//! Environment configuration.

use std::env;

use anyhow::{Context, Result};

use crate::osrm;

/// Everything we read from the environment (or a `.env` file in
/// development). Only `DATABASE_URL` is unconditionally required; the
/// Google key and the internal API key degrade gracefully when absent.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    /// Required by `server` (route caching); unused by `import`.
    pub redis_url: Option<String>,
    pub google_maps_api_key: Option<String>,
    /// When set, `X-API-Key` must match it on every request.
    pub internal_api_key: Option<String>,
    pub osrm_base_url: String,
}

impl Config {
    pub fn from_env() -> Result<Config> {
        dotenvy::dotenv().ok();
        Ok(Config {
            database_url: env::var("DATABASE_URL")
                .context("could not read DATABASE_URL")?,
            redis_url: non_empty(env::var("REDIS_URL").ok()),
            google_maps_api_key: non_empty(env::var("GOOGLE_MAPS_API_KEY").ok()),
            internal_api_key: non_empty(env::var("INTERNAL_API_KEY").ok()),
            osrm_base_url: non_empty(env::var("OSRM_BASE_URL").ok())
                .unwrap_or_else(|| osrm::DEFAULT_BASE_URL.to_owned()),
        })
    }
}

/// Treat empty environment variables the same as unset ones.
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}
