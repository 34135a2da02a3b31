use std::collections::{BTreeMap, BTreeSet};

use anyhow::Context;
use async_trait::async_trait;
use cosy_core::{
    fold_text, CurationFamily, CurationSlot, GeoPoint, ScopeKind, ScopeStat, ScoreRecord, ScoredVenue,
    VenueRecord,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;

use crate::store::{SlugLookup, StoreError, VenueStore};

const VENUE_COLUMNS: &str = "v.slug, v.provider, v.provider_id, v.identity_key, v.name, v.city, v.country, \
     v.lat, v.lng, v.rating, v.review_count, v.amenities, v.description, v.website, v.image_url, v.updated_at";

#[derive(Debug, Clone)]
pub struct PgVenueStore {
    pool: PgPool,
}

impl PgVenueStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")?;
        info!("database migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Constraint violations surface as conflicts so callers can skip the record.
fn write_error(err: sqlx::Error) -> StoreError {
    if let Some(db) = err.as_database_error() {
        if matches!(db.code().as_deref(), Some("23505") | Some("23503") | Some("23514")) {
            return StoreError::Conflict(db.message().to_string());
        }
    }
    StoreError::Backend(err)
}

fn venue_from_row(row: &PgRow) -> Result<VenueRecord, sqlx::Error> {
    let lat: Option<f64> = row.try_get("lat")?;
    let lng: Option<f64> = row.try_get("lng")?;
    let review_count: Option<i32> = row.try_get("review_count")?;
    Ok(VenueRecord {
        slug: row.try_get("slug")?,
        provider: row.try_get("provider")?,
        provider_id: row.try_get("provider_id")?,
        identity_key: row.try_get("identity_key")?,
        name: row.try_get("name")?,
        city: row.try_get("city")?,
        country: row.try_get("country")?,
        coordinates: lat.zip(lng).map(|(lat, lng)| GeoPoint { lat, lng }),
        rating: row.try_get("rating")?,
        review_count: review_count.and_then(|n| u32::try_from(n).ok()),
        amenities: row.try_get("amenities")?,
        description: row.try_get("description")?,
        website: row.try_get("website")?,
        image_url: row.try_get("image_url")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn slot_from_row(row: &PgRow, family: &CurationFamily) -> Result<CurationSlot, sqlx::Error> {
    let position: i16 = row.try_get("position")?;
    Ok(CurationSlot {
        family: family.clone(),
        position: u8::try_from(position).unwrap_or_default(),
        slug: row.try_get("slug")?,
        score: row.try_get("score")?,
        image_url: row.try_get("image_url")?,
        rating: row.try_get("rating")?,
        cue_tags: row.try_get("cue_tags")?,
    })
}

#[async_trait]
impl SlugLookup for PgVenueStore {
    async fn slug_taken(&self, slug: &str) -> Result<bool, StoreError> {
        let taken: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (SELECT 1 FROM venues WHERE slug = $1)
                OR EXISTS (SELECT 1 FROM slug_redirects WHERE old_slug = $1)
            "#,
        )
        .bind(slug)
        .fetch_one(&self.pool)
        .await?;
        Ok(taken)
    }

    async fn countries_for_city(&self, city: &str) -> Result<BTreeSet<String>, StoreError> {
        let rows: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT country
              FROM venues
             WHERE city_key = $1
               AND country IS NOT NULL
            "#,
        )
        .bind(fold_text(city))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }
}

#[async_trait]
impl VenueStore for PgVenueStore {
    async fn find_by_identity(&self, identity_key: &str) -> Result<Option<VenueRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {VENUE_COLUMNS} FROM venues v WHERE v.identity_key = $1"
        ))
        .bind(identity_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(venue_from_row).transpose()?)
    }

    async fn upsert_venue(&self, venue: &VenueRecord) -> Result<VenueRecord, StoreError> {
        let slug: String = sqlx::query_scalar(
            r#"
            INSERT INTO venues (
                slug, provider, provider_id, identity_key, name, city, city_key, country,
                lat, lng, rating, review_count, amenities, description, website, image_url, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (identity_key) DO UPDATE
               SET name = EXCLUDED.name,
                   city = EXCLUDED.city,
                   city_key = EXCLUDED.city_key,
                   country = EXCLUDED.country,
                   lat = EXCLUDED.lat,
                   lng = EXCLUDED.lng,
                   rating = EXCLUDED.rating,
                   review_count = EXCLUDED.review_count,
                   amenities = EXCLUDED.amenities,
                   description = EXCLUDED.description,
                   website = EXCLUDED.website,
                   image_url = EXCLUDED.image_url,
                   updated_at = EXCLUDED.updated_at
            RETURNING slug
            "#,
        )
        .bind(&venue.slug)
        .bind(&venue.provider)
        .bind(&venue.provider_id)
        .bind(&venue.identity_key)
        .bind(&venue.name)
        .bind(&venue.city)
        .bind(venue.city.as_deref().map(fold_text))
        .bind(&venue.country)
        .bind(venue.coordinates.map(|c| c.lat))
        .bind(venue.coordinates.map(|c| c.lng))
        .bind(venue.rating)
        .bind(venue.review_count.and_then(|n| i32::try_from(n).ok()))
        .bind(&venue.amenities)
        .bind(&venue.description)
        .bind(&venue.website)
        .bind(&venue.image_url)
        .bind(venue.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(write_error)?;

        Ok(VenueRecord {
            slug,
            ..venue.clone()
        })
    }

    async fn upsert_raw_score(&self, score: &ScoreRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO venue_scores (slug, raw, computed_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (slug) DO UPDATE
               SET raw = EXCLUDED.raw,
                   computed_at = EXCLUDED.computed_at
            "#,
        )
        .bind(&score.slug)
        .bind(score.raw)
        .bind(score.computed_at)
        .execute(&self.pool)
        .await
        .map_err(write_error)?;
        Ok(())
    }

    async fn count_venues_in_city(&self, city: &str) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM venues WHERE city_key = $1")
            .bind(fold_text(city))
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn venues_page(&self, after: Option<&str>, limit: usize) -> Result<Vec<VenueRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {VENUE_COLUMNS}
              FROM venues v
             WHERE ($1::text IS NULL OR v.slug > $1)
             ORDER BY v.slug
             LIMIT $2
            "#
        ))
        .bind(after)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(venue_from_row).collect::<Result<_, _>>()?)
    }

    async fn scored_page(
        &self,
        city: Option<&str>,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ScoredVenue>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {VENUE_COLUMNS}, s.raw, s.calibrated, s.computed_at
              FROM venue_scores s
              JOIN venues v ON v.slug = s.slug
             WHERE ($1::text IS NULL OR v.city_key = $1)
               AND ($2::text IS NULL OR s.slug > $2)
             ORDER BY s.slug
             LIMIT $3
            "#
        ))
        .bind(city.map(fold_text))
        .bind(after)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let venue = venue_from_row(row)?;
            let score = ScoreRecord {
                slug: venue.slug.clone(),
                raw: row.try_get("raw")?,
                calibrated: row.try_get("calibrated")?,
                computed_at: row.try_get("computed_at")?,
            };
            out.push(ScoredVenue { venue, score });
        }
        Ok(out)
    }

    async fn scored_cities(&self) -> Result<Vec<String>, StoreError> {
        let cities: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT ON (v.city_key) v.city
              FROM venues v
              JOIN venue_scores s ON s.slug = v.slug
             WHERE v.city IS NOT NULL
             ORDER BY v.city_key, v.city
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(cities)
    }

    async fn city_countries(&self) -> Result<BTreeMap<String, BTreeSet<String>>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT city_key, country
              FROM venues
             WHERE city_key IS NOT NULL
               AND country IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for row in rows {
            let city_key: String = row.try_get("city_key")?;
            let country: String = row.try_get("country")?;
            out.entry(city_key).or_default().insert(country);
        }
        Ok(out)
    }

    async fn replace_scope_stats(&self, stats: &[ScopeStat]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM scope_stats").execute(&mut *tx).await?;
        sqlx::query(
            r#"
            INSERT INTO scope_stats (kind, key, median, iqr, samples)
            SELECT * FROM UNNEST($1::text[], $2::text[], $3::float8[], $4::float8[], $5::int4[])
            "#,
        )
        .bind(stats.iter().map(|s| s.kind.as_str().to_string()).collect::<Vec<_>>())
        .bind(stats.iter().map(|s| s.key.clone()).collect::<Vec<_>>())
        .bind(stats.iter().map(|s| s.median).collect::<Vec<_>>())
        .bind(stats.iter().map(|s| s.iqr).collect::<Vec<_>>())
        .bind(
            stats
                .iter()
                .map(|s| i32::try_from(s.samples).unwrap_or(i32::MAX))
                .collect::<Vec<_>>(),
        )
        .execute(&mut *tx)
        .await
        .map_err(write_error)?;
        tx.commit().await?;
        Ok(())
    }

    async fn scope_stats(&self) -> Result<Vec<ScopeStat>, StoreError> {
        let rows = sqlx::query("SELECT kind, key, median, iqr, samples FROM scope_stats ORDER BY kind, key")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let kind: String = row.try_get("kind")?;
            let Some(kind) = ScopeKind::parse(&kind) else {
                continue;
            };
            let samples: i32 = row.try_get("samples")?;
            out.push(ScopeStat {
                kind,
                key: row.try_get("key")?,
                median: row.try_get("median")?,
                iqr: row.try_get("iqr")?,
                samples: u32::try_from(samples).unwrap_or_default(),
            });
        }
        Ok(out)
    }

    async fn set_calibrated(&self, updates: &[(String, f64)]) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE venue_scores s
               SET calibrated = u.calibrated
              FROM UNNEST($1::text[], $2::float8[]) AS u(slug, calibrated)
             WHERE s.slug = u.slug
            "#,
        )
        .bind(updates.iter().map(|(slug, _)| slug.clone()).collect::<Vec<_>>())
        .bind(updates.iter().map(|(_, c)| *c).collect::<Vec<_>>())
        .execute(&self.pool)
        .await
        .map_err(write_error)?;
        Ok(())
    }

    async fn replace_slots(&self, family: &CurationFamily, slots: &[CurationSlot]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        match family {
            CurationFamily::Featured => {
                sqlx::query("DELETE FROM featured_slots").execute(&mut *tx).await?;
                for slot in slots {
                    sqlx::query(
                        r#"
                        INSERT INTO featured_slots (position, slug, score, image_url, rating, cue_tags)
                        VALUES ($1, $2, $3, $4, $5, $6)
                        "#,
                    )
                    .bind(i16::from(slot.position))
                    .bind(&slot.slug)
                    .bind(slot.score)
                    .bind(&slot.image_url)
                    .bind(slot.rating)
                    .bind(&slot.cue_tags)
                    .execute(&mut *tx)
                    .await
                    .map_err(write_error)?;
                }
            }
            CurationFamily::City(city) => {
                sqlx::query("DELETE FROM city_slots WHERE city = $1")
                    .bind(city)
                    .execute(&mut *tx)
                    .await?;
                for slot in slots {
                    sqlx::query(
                        r#"
                        INSERT INTO city_slots (city, rank, slug, score, image_url, rating, cue_tags)
                        VALUES ($1, $2, $3, $4, $5, $6, $7)
                        "#,
                    )
                    .bind(city)
                    .bind(i16::from(slot.position))
                    .bind(&slot.slug)
                    .bind(slot.score)
                    .bind(&slot.image_url)
                    .bind(slot.rating)
                    .bind(&slot.cue_tags)
                    .execute(&mut *tx)
                    .await
                    .map_err(write_error)?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn slots(&self, family: &CurationFamily) -> Result<Vec<CurationSlot>, StoreError> {
        let rows = match family {
            CurationFamily::Featured => {
                sqlx::query(
                    r#"
                    SELECT position, slug, score, image_url, rating, cue_tags
                      FROM featured_slots
                     ORDER BY position
                    "#,
                )
                .fetch_all(&self.pool)
                .await?
            }
            CurationFamily::City(city) => {
                sqlx::query(
                    r#"
                    SELECT rank AS position, slug, score, image_url, rating, cue_tags
                      FROM city_slots
                     WHERE city = $1
                     ORDER BY rank
                    "#,
                )
                .bind(city)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows
            .iter()
            .map(|row| slot_from_row(row, family))
            .collect::<Result<_, _>>()?)
    }

    async fn rename_slug(&self, old: &str, new: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let renamed = sqlx::query("UPDATE venues SET slug = $2 WHERE slug = $1")
            .bind(old)
            .bind(new)
            .execute(&mut *tx)
            .await
            .map_err(write_error)?;
        if renamed.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("venue {old}")));
        }
        sqlx::query("UPDATE slug_redirects SET new_slug = $2 WHERE new_slug = $1")
            .bind(old)
            .bind(new)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM slug_redirects WHERE old_slug = $1")
            .bind(new)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO slug_redirects (old_slug, new_slug)
            VALUES ($1, $2)
            ON CONFLICT (old_slug) DO UPDATE SET new_slug = EXCLUDED.new_slug
            "#,
        )
        .bind(old)
        .bind(new)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn redirect_for(&self, old: &str) -> Result<Option<String>, StoreError> {
        let target: Option<String> =
            sqlx::query_scalar("SELECT new_slug FROM slug_redirects WHERE old_slug = $1")
                .bind(old)
                .fetch_optional(&self.pool)
                .await?;
        Ok(target)
    }
}
