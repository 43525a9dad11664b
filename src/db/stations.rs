//! Station rows: bulk ingest writes and the corridor query.

use std::collections::HashSet;

use geo_types::Point;
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::{Postgres, QueryBuilder};

use crate::db::{Db, INSERT_BATCH_SIZE};

/// A station parsed from the price feed, ready to insert.
#[derive(Clone, Debug)]
pub struct NewStation {
    pub opis_id: i32,
    pub name: String,
    pub address: String,
    pub city: String,
    pub state: String,
    pub rack_id: Option<i32>,
    pub retail_price: Decimal,
}

/// The address fields a geocoding worker needs.
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct StationAddress {
    pub id: i64,
    pub opis_id: i32,
    pub name: String,
    pub address: String,
    pub city: String,
    pub state: String,
}

/// The outcome of geocoding one station, ready to persist.
#[derive(Clone, Debug)]
pub struct GeocodeUpdate {
    pub id: i64,
    /// `None` when geocoding failed; we still record the source label.
    pub location: Option<Point<f64>>,
    pub geocode_source: String,
    pub geocode_meta: Option<Value>,
}

/// A station inside the route corridor, annotated with its projection
/// onto the route line.
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct CorridorStation {
    pub opis_id: i32,
    pub name: String,
    pub address: String,
    pub city: String,
    pub state: String,
    pub retail_price: Decimal,
    pub lon: f64,
    pub lat: f64,
    /// Normalized [0, 1] position of the perpendicular projection onto the
    /// route line (`ST_LineLocatePoint`).
    pub fraction: f64,
}

impl Db {
    /// All `opis_id`s already present, for the ingest set-difference.
    pub async fn existing_opis_ids(&self) -> sqlx::Result<HashSet<i32>> {
        let ids: Vec<i32> = sqlx::query_scalar("SELECT opis_id FROM stations")
            .fetch_all(self.pool())
            .await?;
        Ok(ids.into_iter().collect())
    }

    /// Insert new stations in batches. Rows whose `opis_id` raced into the
    /// table since the set-difference are skipped, not errors.
    pub async fn insert_stations(&self, stations: &[NewStation]) -> sqlx::Result<u64> {
        let mut inserted = 0;
        for chunk in stations.chunks(INSERT_BATCH_SIZE) {
            let mut query: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO stations \
                 (opis_id, name, address, city, state, rack_id, retail_price) ",
            );
            query.push_values(chunk, |mut row, station| {
                row.push_bind(station.opis_id)
                    .push_bind(&station.name)
                    .push_bind(&station.address)
                    .push_bind(&station.city)
                    .push_bind(&station.state)
                    .push_bind(station.rack_id)
                    .push_bind(station.retail_price);
            });
            query.push(" ON CONFLICT (opis_id) DO NOTHING");
            inserted += query.build().execute(self.pool()).await?.rows_affected();
        }
        Ok(inserted)
    }

    /// The geocoding working set: stations with no location yet, optionally
    /// restricted to ones never attempted, in stable `opis_id` order.
    pub async fn station_ids_to_geocode(
        &self,
        skip_attempted: bool,
        max: usize,
    ) -> sqlx::Result<Vec<i64>> {
        let mut sql = "SELECT id FROM stations WHERE location IS NULL".to_owned();
        if skip_attempted {
            sql.push_str(" AND geocode_source IS NULL");
        }
        sql.push_str(" ORDER BY opis_id");
        if max > 0 {
            sql.push_str(&format!(" LIMIT {}", max));
        }
        sqlx::query_scalar(&sql).fetch_all(self.pool()).await
    }

    pub async fn station_address(&self, id: i64) -> sqlx::Result<StationAddress> {
        sqlx::query_as(
            "SELECT id, opis_id, name, address, city, state FROM stations WHERE id = $1",
        )
        .bind(id)
        .fetch_one(self.pool())
        .await
    }

    /// Persist a batch of geocoding outcomes in one transaction.
    pub async fn update_geocode_results(
        &self,
        updates: &[GeocodeUpdate],
    ) -> sqlx::Result<()> {
        let mut tx = self.pool().begin().await?;
        for update in updates {
            match update.location {
                Some(point) => {
                    sqlx::query(
                        "UPDATE stations \
                         SET location = ST_SetSRID(ST_MakePoint($1, $2), 4326)::geography, \
                             geocode_source = $3, geocode_meta = $4, updated_at = now() \
                         WHERE id = $5",
                    )
                    .bind(point.x())
                    .bind(point.y())
                    .bind(&update.geocode_source)
                    .bind(&update.geocode_meta)
                    .bind(update.id)
                    .execute(&mut *tx)
                    .await?;
                }
                None => {
                    sqlx::query(
                        "UPDATE stations \
                         SET geocode_source = $1, geocode_meta = $2, updated_at = now() \
                         WHERE id = $3",
                    )
                    .bind(&update.geocode_source)
                    .bind(&update.geocode_meta)
                    .bind(update.id)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }
        tx.commit().await
    }

    /// All geocoded stations within `corridor_miles` of the route line,
    /// annotated with their projection fraction and ordered by it.
    ///
    /// `route_wkt` is a `LINESTRING` in WGS84 with `lon lat` coordinate
    /// order; the distance filter runs on the geography type so the radius
    /// is real meters, not degrees.
    pub async fn stations_within_corridor(
        &self,
        route_wkt: &str,
        corridor_miles: f64,
    ) -> sqlx::Result<Vec<CorridorStation>> {
        let corridor_meters = crate::geometry::miles_to_meters(corridor_miles);
        sqlx::query_as(
            "SELECT opis_id, name, address, city, state, retail_price, \
                    ST_X(location::geometry) AS lon, \
                    ST_Y(location::geometry) AS lat, \
                    ST_LineLocatePoint(ST_GeomFromText($1, 4326), location::geometry) \
                        AS fraction \
             FROM stations \
             WHERE location IS NOT NULL \
               AND ST_DWithin(location, ST_GeomFromText($1, 4326)::geography, $2) \
             ORDER BY fraction",
        )
        .bind(route_wkt)
        .bind(corridor_meters)
        .fetch_all(self.pool())
        .await
    }
}
