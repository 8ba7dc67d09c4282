//! Direct-write path against the Postgres store.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tokuten_core::{DataSource, StoredBonus, StoredMovie};

use crate::gateway::{PathError, WritePath};

#[derive(Debug, Clone)]
pub struct PgMovieStore {
    pool: PgPool,
}

impl PgMovieStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    /// Builds the pool without opening a connection; an unreachable database then fails
    /// individual loads and stores instead of startup.
    pub fn connect_lazy(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(5))
            .connect_lazy(database_url)
            .context("parsing DATABASE_URL")?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")
    }
}

fn parse_data_source(external_id: &str, raw: &str) -> Result<DataSource, PathError> {
    raw.parse().map_err(|message| PathError::Decode {
        external_id: external_id.to_string(),
        message,
    })
}

fn optional_u32(value: Option<i32>) -> Option<u32> {
    value.and_then(|v| u32::try_from(v).ok())
}

fn optional_i32(value: Option<u32>) -> Option<i32> {
    value.and_then(|v| i32::try_from(v).ok())
}

fn bonus_from_row(external_id: &str, row: &PgRow) -> Result<StoredBonus, PathError> {
    let data_source: String = row.try_get("data_source")?;
    Ok(StoredBonus {
        bonus_key: row.try_get("bonus_key")?,
        exhibitor_id: row.try_get("exhibitor_id")?,
        exhibitor_name: row.try_get("exhibitor_name")?,
        description: row.try_get("description")?,
        quantity: optional_u32(row.try_get("quantity")?),
        week_index: optional_u32(row.try_get("week_index")?),
        data_source: parse_data_source(external_id, &data_source)?,
    })
}

#[async_trait]
impl WritePath for PgMovieStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn load(&self, external_id: &str) -> Result<Option<StoredMovie>, PathError> {
        let row = sqlx::query(
            r#"
            SELECT external_id, title, english_title, release_date, synopsis,
                   poster_url, backdrop_url, rating, is_rerelease, data_source
              FROM movies
             WHERE external_id = $1
            "#,
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let bonus_rows = sqlx::query(
            r#"
            SELECT bonus_key, exhibitor_id, exhibitor_name, description,
                   quantity, week_index, data_source
              FROM movie_bonuses
             WHERE external_id = $1
             ORDER BY exhibitor_id, week_index NULLS FIRST, bonus_key
            "#,
        )
        .bind(external_id)
        .fetch_all(&self.pool)
        .await?;
        let bonuses = bonus_rows
            .iter()
            .map(|r| bonus_from_row(external_id, r))
            .collect::<Result<Vec<_>, _>>()?;

        let data_source: String = row.try_get("data_source")?;
        let release_date: Option<NaiveDate> = row.try_get("release_date")?;
        Ok(Some(StoredMovie {
            external_id: row.try_get("external_id")?,
            title: row.try_get("title")?,
            english_title: row.try_get("english_title")?,
            release_date,
            synopsis: row.try_get("synopsis")?,
            poster_url: row.try_get("poster_url")?,
            backdrop_url: row.try_get("backdrop_url")?,
            rating: row.try_get("rating")?,
            is_rerelease: row.try_get("is_rerelease")?,
            data_source: parse_data_source(external_id, &data_source)?,
            bonuses,
        }))
    }

    async fn store(&self, movie: &StoredMovie) -> Result<(), PathError> {
        let mut tx = self.pool.begin().await?;

        // Curated movie rows keep their descriptive columns; the re-release flag only ever turns on.
        sqlx::query(
            r#"
            INSERT INTO movies (external_id, title, english_title, release_date, synopsis,
                                poster_url, backdrop_url, rating, is_rerelease, data_source)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (external_id) DO UPDATE SET
                title         = CASE WHEN movies.data_source = 'manual' THEN movies.title ELSE EXCLUDED.title END,
                english_title = CASE WHEN movies.data_source = 'manual' THEN movies.english_title ELSE EXCLUDED.english_title END,
                release_date  = CASE WHEN movies.data_source = 'manual' THEN movies.release_date ELSE EXCLUDED.release_date END,
                synopsis      = CASE WHEN movies.data_source = 'manual' THEN movies.synopsis ELSE EXCLUDED.synopsis END,
                poster_url    = CASE WHEN movies.data_source = 'manual' THEN movies.poster_url ELSE EXCLUDED.poster_url END,
                backdrop_url  = CASE WHEN movies.data_source = 'manual' THEN movies.backdrop_url ELSE EXCLUDED.backdrop_url END,
                rating        = CASE WHEN movies.data_source = 'manual' THEN movies.rating ELSE EXCLUDED.rating END,
                is_rerelease  = movies.is_rerelease OR EXCLUDED.is_rerelease,
                updated_at    = now()
            "#,
        )
        .bind(&movie.external_id)
        .bind(&movie.title)
        .bind(&movie.english_title)
        .bind(movie.release_date)
        .bind(&movie.synopsis)
        .bind(&movie.poster_url)
        .bind(&movie.backdrop_url)
        .bind(movie.rating)
        .bind(movie.is_rerelease)
        .bind(movie.data_source.as_str())
        .execute(&mut *tx)
        .await?;

        for bonus in &movie.bonuses {
            sqlx::query(
                r#"
                INSERT INTO movie_bonuses (external_id, bonus_key, exhibitor_id, exhibitor_name,
                                           description, quantity, week_index, data_source)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (external_id, bonus_key) DO UPDATE SET
                    exhibitor_name = EXCLUDED.exhibitor_name,
                    description    = EXCLUDED.description,
                    quantity       = EXCLUDED.quantity,
                    week_index     = EXCLUDED.week_index,
                    updated_at     = now()
                WHERE movie_bonuses.data_source <> 'manual'
                "#,
            )
            .bind(&movie.external_id)
            .bind(&bonus.bonus_key)
            .bind(&bonus.exhibitor_id)
            .bind(&bonus.exhibitor_name)
            .bind(&bonus.description)
            .bind(optional_i32(bonus.quantity))
            .bind(optional_i32(bonus.week_index))
            .bind(bonus.data_source.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_columns_round_trip_through_unsigned_fields() {
        assert_eq!(optional_u32(Some(3)), Some(3));
        assert_eq!(optional_u32(Some(-1)), None);
        assert_eq!(optional_i32(Some(u32::MAX)), None);
        assert_eq!(optional_i32(None), None);
    }

    #[test]
    fn unknown_data_source_tag_is_a_decode_error() {
        let err = parse_data_source("100", "scraper").unwrap_err();
        assert!(matches!(err, PathError::Decode { .. }));
        assert_eq!(parse_data_source("100", "manual").unwrap(), DataSource::Manual);
    }
}
