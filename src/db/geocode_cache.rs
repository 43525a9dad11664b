//! The persistent geocode cache.
//!
//! Every Census query lands here keyed by its normalized text (trimmed,
//! lowercased, whitespace already collapsed upstream). Concurrent ingest
//! workers can race to insert the same key; the unique index plus
//! `ON CONFLICT DO NOTHING` makes the first writer win silently.

use geo_types::Point;
use serde_json::Value;

use crate::db::Db;

impl Db {
    /// Look up a cached geocode by normalized query text.
    pub async fn geocode_cache_lookup(
        &self,
        normalized: &str,
    ) -> sqlx::Result<Option<(Point<f64>, Value)>> {
        let row: Option<(f64, f64, Value)> = sqlx::query_as(
            "SELECT ST_X(location), ST_Y(location), metadata \
             FROM geocode_cache WHERE normalized_text = $1",
        )
        .bind(normalized)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|(lon, lat, metadata)| (Point::new(lon, lat), metadata)))
    }

    /// Store a geocode result. A duplicate key is a no-op, not an error.
    pub async fn geocode_cache_store(
        &self,
        query_text: &str,
        normalized: &str,
        point: Point<f64>,
        metadata: &Value,
    ) -> sqlx::Result<()> {
        sqlx::query(
            "INSERT INTO geocode_cache (query_text, normalized_text, location, metadata) \
             VALUES ($1, $2, ST_SetSRID(ST_MakePoint($3, $4), 4326), $5) \
             ON CONFLICT DO NOTHING",
        )
        .bind(query_text)
        .bind(normalized)
        .bind(point.x())
        .bind(point.y())
        .bind(metadata)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
