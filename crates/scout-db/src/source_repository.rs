use chrono::{DateTime, Utc};
use scout_core::error::AppError;
use scout_core::lifecycle::SourceStatus;
use scout_core::models::{ExtractedEvent, NewSource, Source, SourceUpdate};
use scout_core::recipe::Recipe;
use scout_core::traits::SourceStore;
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

const SOURCE_COLUMNS: &str = "id, name, url, domain, recipe, status, resume_status, \
    last_scraped_at, last_event_count, last_error, reanalysis_attempts, next_analysis_at, \
    created_at, updated_at";

/// PostgreSQL-backed [`SourceStore`].
///
/// Recipes live in a JSONB column in their persisted document shape.
#[derive(Clone)]
pub struct SourceRepository {
    pool: Pool<Postgres>,
}

impl SourceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Number of events stored for a source.
    pub async fn event_count(&self, source_id: Uuid) -> Result<i64, AppError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM events WHERE source_id = $1")
            .bind(source_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(row.0)
    }

    async fn fetch_sources(&self, filter: &str) -> Result<Vec<Source>, AppError> {
        let query = format!("SELECT {SOURCE_COLUMNS} FROM sources {filter} ORDER BY created_at ASC");
        let rows = sqlx::query_as::<_, SourceRow>(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

        rows.into_iter().map(Source::try_from).collect()
    }

    fn ensure_updated(id: Uuid, rows_affected: u64) -> Result<(), AppError> {
        if rows_affected == 0 {
            return Err(AppError::DatabaseError(format!("source {id} not found")));
        }
        Ok(())
    }
}

fn db_error(e: sqlx::Error) -> AppError {
    AppError::DatabaseError(e.to_string())
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct SourceRow {
    id: Uuid,
    name: String,
    url: String,
    domain: String,
    recipe: Option<serde_json::Value>,
    status: String,
    resume_status: Option<String>,
    last_scraped_at: Option<DateTime<Utc>>,
    last_event_count: i32,
    last_error: Option<String>,
    reanalysis_attempts: i32,
    next_analysis_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn parse_status(raw: &str) -> Result<SourceStatus, AppError> {
    raw.parse().map_err(AppError::DatabaseError)
}

impl TryFrom<SourceRow> for Source {
    type Error = AppError;

    fn try_from(row: SourceRow) -> Result<Self, Self::Error> {
        // An unreadable recipe is dropped; the scheduler's reconcile pass
        // then fails the source instead of replaying garbage.
        let recipe = match row.recipe {
            None => None,
            Some(value) => match Recipe::from_value(value) {
                Ok(recipe) => Some(recipe),
                Err(e) => {
                    tracing::warn!(source_id = %row.id, error = %e, "Stored recipe is unreadable");
                    None
                }
            },
        };

        Ok(Source {
            id: row.id,
            name: row.name,
            url: row.url,
            domain: row.domain,
            recipe,
            status: parse_status(&row.status)?,
            resume_status: row.resume_status.as_deref().map(parse_status).transpose()?,
            last_scraped_at: row.last_scraped_at,
            last_event_count: row.last_event_count.max(0) as u32,
            last_error: row.last_error,
            reanalysis_attempts: row.reanalysis_attempts.max(0) as u32,
            next_analysis_at: row.next_analysis_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

// -- Trait implementation --

impl SourceStore for SourceRepository {
    async fn create_source(&self, source: &NewSource) -> Result<Source, AppError> {
        let query = format!(
            "INSERT INTO sources (name, url, domain) VALUES ($1, $2, $3) RETURNING {SOURCE_COLUMNS}"
        );
        let row = sqlx::query_as::<_, SourceRow>(&query)
            .bind(&source.name)
            .bind(&source.url)
            .bind(&source.domain)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match e.as_database_error() {
                Some(db) if db.is_unique_violation() => {
                    AppError::DatabaseError(format!("Source already registered: {}", source.url))
                }
                _ => db_error(e),
            })?;

        row.try_into()
    }

    async fn get_source(&self, id: Uuid) -> Result<Option<Source>, AppError> {
        let query = format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE id = $1");
        let row = sqlx::query_as::<_, SourceRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        row.map(Source::try_from).transpose()
    }

    async fn get_source_by_url(&self, url: &str) -> Result<Option<Source>, AppError> {
        let query = format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE url = $1");
        let row = sqlx::query_as::<_, SourceRow>(&query)
            .bind(url)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        row.map(Source::try_from).transpose()
    }

    async fn list_enabled_sources(&self) -> Result<Vec<Source>, AppError> {
        self.fetch_sources("WHERE status NOT IN ('failed', 'disabled')")
            .await
    }

    async fn list_sources(&self) -> Result<Vec<Source>, AppError> {
        self.fetch_sources("").await
    }

    async fn save_recipe(
        &self,
        id: Uuid,
        recipe: &Recipe,
        status: SourceStatus,
    ) -> Result<(), AppError> {
        let document = serde_json::to_value(recipe)?;
        let result = sqlx::query(
            r#"
            UPDATE sources
            SET recipe = $2, status = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(document)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Self::ensure_updated(id, result.rows_affected())
    }

    async fn update_source_outcome(&self, id: Uuid, update: &SourceUpdate) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE sources
            SET status = $2,
                resume_status = $3,
                last_event_count = $4,
                last_scraped_at = $5,
                last_error = $6,
                reanalysis_attempts = $7,
                next_analysis_at = $8,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(update.status.as_str())
        .bind(update.resume_status.map(|s| s.as_str()))
        .bind(i32::try_from(update.last_event_count).unwrap_or(i32::MAX))
        .bind(update.last_scraped_at)
        .bind(&update.last_error)
        .bind(i32::try_from(update.reanalysis_attempts).unwrap_or(i32::MAX))
        .bind(update.next_analysis_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Self::ensure_updated(id, result.rows_affected())
    }

    async fn upsert_event(&self, source_id: Uuid, event: &ExtractedEvent) -> Result<bool, AppError> {
        // xmax is 0 only for a freshly inserted tuple.
        let row: (bool,) = sqlx::query_as(
            r#"
            INSERT INTO events (
                source_id, dedup_key, title, start_time, end_time, description,
                location_name, location_address, url, page_url, is_free, price_min, image_url
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (source_id, dedup_key) DO UPDATE SET
                title = EXCLUDED.title,
                end_time = EXCLUDED.end_time,
                description = EXCLUDED.description,
                location_name = EXCLUDED.location_name,
                location_address = EXCLUDED.location_address,
                url = EXCLUDED.url,
                page_url = EXCLUDED.page_url,
                is_free = EXCLUDED.is_free,
                price_min = EXCLUDED.price_min,
                image_url = EXCLUDED.image_url,
                last_seen_at = NOW()
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(source_id)
        .bind(&event.dedup_key)
        .bind(&event.title)
        .bind(event.start_time.with_timezone(&Utc))
        .bind(event.end_time.map(|t| t.with_timezone(&Utc)))
        .bind(&event.description)
        .bind(&event.location_name)
        .bind(&event.location_address)
        .bind(&event.url)
        .bind(&event.page_url)
        .bind(event.is_free)
        .bind(event.price_min)
        .bind(&event.image_url)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(row.0)
    }
}
