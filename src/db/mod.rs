//! The relational store: stations and the persistent geocode cache.
//!
//! Everything spatial is delegated to PostGIS; this module owns the SQL
//! and maps rows to plain structs. The schema lives in `migrations/` and
//! is embedded into the binary at compile time.

use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};

mod geocode_cache;
mod stations;

pub use stations::{CorridorStation, GeocodeUpdate, NewStation, StationAddress};

/// How many rows to insert per statement during bulk ingest.
pub const INSERT_BATCH_SIZE: usize = 2000;

/// A handle to the store. Cheap to clone; clones share one pool.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres.
    pub async fn connect(database_url: &str) -> Result<Db> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("could not connect to Postgres")?;
        Ok(Db { pool })
    }

    /// Apply any pending embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("could not run database migrations")?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}
