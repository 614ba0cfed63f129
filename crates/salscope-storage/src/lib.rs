//! Embedded listing store for salscope: positions, vacancies and résumés in SQLite.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::NaiveDate;
use salscope_core::{
    decide_dedup, listing_id_for_url, normalize_position_name, reobserved_listing_id,
    reobserved_listing_key,
    DedupDecision, Listing, ListingDraft, ListingInput, ListingKind, MonthKey, MonthRange,
    Position, ValidationError,
};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "salscope-storage";

/// Connection string for a throwaway store that lives as long as the pool.
pub const IN_MEMORY_URL: &str = "sqlite::memory:";

const LISTING_COLUMNS: &str =
    "id, position_id, title, company, salary, date, month, url, skills, experience, grade";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("listing store unavailable at {url}: {source}")]
    Unavailable {
        url: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("listing key `{key}` already stored in {table}")]
    ConstraintViolation { table: &'static str, key: String },
    #[error("unreadable row in {table}: {detail}")]
    CorruptRow { table: &'static str, detail: String },
    #[error("encoding listing field: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("store query failed: {0}")]
    Database(#[from] sqlx::Error),
}

/// Per-batch ingestion tally; `total == new + duplicates + rejected`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub total: usize,
    pub new: usize,
    pub duplicates: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteOutcome {
    Inserted,
    Duplicate,
}

/// Store boundary. Every method is a suspension point; nothing else awaits.
#[async_trait]
pub trait ListingRepository: Send + Sync {
    async fn get_or_create_position(&self, name: &str) -> Result<i64, StoreError>;

    async fn find_position(&self, name: &str) -> Result<Option<i64>, StoreError>;

    async fn list_positions(&self) -> Result<Vec<Position>, StoreError>;

    /// Insert records one at a time. A uniqueness failure on one record is
    /// counted as a duplicate; any other store failure aborts the batch.
    async fn add_listings(
        &self,
        kind: ListingKind,
        batch: Vec<ListingInput>,
    ) -> Result<IngestSummary, StoreError>;

    /// Listings for `position` whose month lies in `range`. Unknown positions
    /// yield an empty result and are not created.
    async fn query_listings(
        &self,
        kind: ListingKind,
        position: &str,
        range: &MonthRange,
    ) -> Result<Vec<Listing>, StoreError>;

    /// Drop every position and listing and recreate the empty schema.
    async fn reset(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct SqliteListingStore {
    pool: SqlitePool,
}

impl SqliteListingStore {
    /// Open (creating if missing) the store at `database_url` and apply the schema.
    pub async fn open(database_url: &str) -> Result<Self, StoreError> {
        let unavailable = |source| StoreError::Unavailable {
            url: database_url.to_string(),
            source,
        };

        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(unavailable)?
            .create_if_missing(true)
            .foreign_keys(true);

        // One connection: single writer, and `sqlite::memory:` databases are per-connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(unavailable)?;

        let mut conn = pool.acquire().await.map_err(unavailable)?;
        apply_schema(&mut conn).await.map_err(unavailable)?;
        drop(conn);

        info!(database_url, "listing store ready");
        Ok(Self { pool })
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::open(IN_MEMORY_URL).await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn ensure_position(&self, name: &str) -> Result<i64, StoreError> {
        let name = normalize_position_name(name);
        if name.is_empty() {
            return Err(ValidationError::EmptyPosition.into());
        }
        sqlx::query("INSERT INTO positions (name) VALUES (?1) ON CONFLICT(name) DO NOTHING")
            .bind(name)
            .execute(&self.pool)
            .await?;
        let id: i64 = sqlx::query_scalar("SELECT id FROM positions WHERE name = ?1")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    async fn lookup_position(&self, name: &str) -> Result<Option<i64>, StoreError> {
        let name = normalize_position_name(name);
        let id: Option<i64> = sqlx::query_scalar("SELECT id FROM positions WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    /// Stored observation of `url`, preferring the one from `month`.
    async fn find_observation(
        &self,
        kind: ListingKind,
        url: &str,
        month: &MonthKey,
    ) -> Result<Option<Listing>, StoreError> {
        let sql = format!(
            "SELECT {LISTING_COLUMNS} FROM {table} WHERE url = ?1 \
             ORDER BY (month = ?2) DESC, month DESC LIMIT 1",
            table = kind.table()
        );
        let row = sqlx::query(&sql)
            .bind(url)
            .bind(month.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| listing_from_row(kind, &row)).transpose()
    }

    async fn write_draft(
        &self,
        kind: ListingKind,
        draft: &ListingDraft,
    ) -> Result<WriteOutcome, StoreError> {
        let position_id = self.ensure_position(&draft.position).await?;
        let existing = self.find_observation(kind, &draft.url, &draft.month).await?;
        let decision = decide_dedup(existing.as_ref(), draft);
        debug!(url = %draft.url, month = %draft.month, ?decision, "dedup decision");

        match decision {
            DedupDecision::Insert => {
                let id = listing_id_for_url(&draft.url);
                self.insert_listing(kind, id, &draft.url, position_id, draft)
                    .await?;
                Ok(WriteOutcome::Inserted)
            }
            DedupDecision::Reobserve { original_id } => {
                let id = reobserved_listing_id(original_id, &draft.month);
                let key = reobserved_listing_key(&draft.url, &draft.month);
                self.insert_listing(kind, id, &key, position_id, draft).await?;
                Ok(WriteOutcome::Inserted)
            }
            DedupDecision::Overwrite { id } => {
                self.overwrite_listing(kind, id, position_id, draft).await?;
                Ok(WriteOutcome::Duplicate)
            }
            DedupDecision::Skip => Ok(WriteOutcome::Duplicate),
        }
    }

    async fn insert_listing(
        &self,
        kind: ListingKind,
        id: Uuid,
        listing_key: &str,
        position_id: i64,
        draft: &ListingDraft,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO {} (id, position_id, title, company, salary, date, month, url, \
             listing_key, skills, experience, grade) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            kind.table()
        );
        let result = sqlx::query(&sql)
            .bind(id.to_string())
            .bind(position_id)
            .bind(draft.title.as_str())
            .bind(draft.company.as_deref())
            .bind(draft.salary)
            .bind(draft.date.format("%Y-%m-%d").to_string())
            .bind(draft.month.as_str())
            .bind(draft.url.as_str())
            .bind(listing_key)
            .bind(serde_json::to_string(&draft.skills)?)
            .bind(serde_json::to_string(&draft.experience)?)
            .bind(draft.grade.as_deref())
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::ConstraintViolation {
                    table: kind.table(),
                    key: listing_key.to_string(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn overwrite_listing(
        &self,
        kind: ListingKind,
        id: Uuid,
        position_id: i64,
        draft: &ListingDraft,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE {} SET position_id = ?1, title = ?2, company = ?3, salary = ?4, date = ?5, \
             skills = ?6, experience = ?7, grade = ?8 WHERE id = ?9",
            kind.table()
        );
        sqlx::query(&sql)
            .bind(position_id)
            .bind(draft.title.as_str())
            .bind(draft.company.as_deref())
            .bind(draft.salary)
            .bind(draft.date.format("%Y-%m-%d").to_string())
            .bind(serde_json::to_string(&draft.skills)?)
            .bind(serde_json::to_string(&draft.experience)?)
            .bind(draft.grade.as_deref())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ListingRepository for SqliteListingStore {
    async fn get_or_create_position(&self, name: &str) -> Result<i64, StoreError> {
        self.ensure_position(name).await
    }

    async fn find_position(&self, name: &str) -> Result<Option<i64>, StoreError> {
        self.lookup_position(name).await
    }

    async fn list_positions(&self) -> Result<Vec<Position>, StoreError> {
        let rows = sqlx::query("SELECT id, name FROM positions ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(Position {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
            });
        }
        Ok(out)
    }

    async fn add_listings(
        &self,
        kind: ListingKind,
        batch: Vec<ListingInput>,
    ) -> Result<IngestSummary, StoreError> {
        let span = info_span!("add_listings", table = kind.table(), batch = batch.len());
        async move {
            let mut summary = IngestSummary::default();
            for input in batch {
                summary.total += 1;
                let url = input.url.clone();
                let draft = match input.into_draft() {
                    Ok(draft) => draft,
                    Err(reason) => {
                        warn!(%url, %reason, "rejecting listing");
                        summary.rejected += 1;
                        continue;
                    }
                };

                match self.write_draft(kind, &draft).await {
                    Ok(WriteOutcome::Inserted) => summary.new += 1,
                    Ok(WriteOutcome::Duplicate) => summary.duplicates += 1,
                    Err(StoreError::ConstraintViolation { key, .. }) => {
                        warn!(%key, "uniqueness constraint hit, counting listing as duplicate");
                        summary.duplicates += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
            info!(
                total = summary.total,
                new = summary.new,
                duplicates = summary.duplicates,
                rejected = summary.rejected,
                "batch ingested"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    async fn query_listings(
        &self,
        kind: ListingKind,
        position: &str,
        range: &MonthRange,
    ) -> Result<Vec<Listing>, StoreError> {
        let span = info_span!("query_listings", table = kind.table(), position);
        async move {
            let Some(position_id) = self.lookup_position(position).await? else {
                debug!("unknown position, returning no listings");
                return Ok(Vec::new());
            };

            let sql = format!(
                "SELECT {LISTING_COLUMNS} FROM {table} WHERE position_id = ?1 \
                 AND (?2 IS NULL OR month >= ?2) AND (?3 IS NULL OR month <= ?3) \
                 ORDER BY date, id",
                table = kind.table()
            );
            let rows = sqlx::query(&sql)
                .bind(position_id)
                .bind(range.start.as_ref().map(MonthKey::as_str))
                .bind(range.end.as_ref().map(MonthKey::as_str))
                .fetch_all(&self.pool)
                .await?;

            let listings = rows
                .iter()
                .map(|row| listing_from_row(kind, row))
                .collect::<Result<Vec<_>, _>>()?;
            debug!(count = listings.len(), "listings loaded");
            Ok(listings)
        }
        .instrument(span)
        .await
    }

    async fn reset(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for kind in ListingKind::ALL {
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", kind.table()))
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DROP TABLE IF EXISTS positions")
            .execute(&mut *tx)
            .await?;
        apply_schema(&mut tx).await?;
        tx.commit().await?;
        warn!("listing store reset");
        Ok(())
    }
}

fn schema_statements() -> Vec<String> {
    let mut statements = vec![
        "CREATE TABLE IF NOT EXISTS positions (\
            id INTEGER PRIMARY KEY AUTOINCREMENT, \
            name TEXT NOT NULL UNIQUE)"
            .to_string(),
    ];
    for kind in ListingKind::ALL {
        let table = kind.table();
        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
                id TEXT PRIMARY KEY, \
                position_id INTEGER NOT NULL REFERENCES positions(id), \
                title TEXT NOT NULL, \
                company TEXT, \
                salary REAL NOT NULL CHECK (salary >= 0), \
                date TEXT NOT NULL, \
                month TEXT NOT NULL, \
                url TEXT NOT NULL, \
                listing_key TEXT NOT NULL UNIQUE, \
                skills TEXT NOT NULL DEFAULT '[]', \
                experience TEXT NOT NULL, \
                grade TEXT)"
        ));
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_position ON {table} (position_id)"
        ));
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_month ON {table} (month)"
        ));
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_url ON {table} (url)"
        ));
    }
    statements
}

async fn apply_schema(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    for statement in schema_statements() {
        sqlx::query(&statement).execute(&mut *conn).await?;
    }
    Ok(())
}

fn listing_from_row(kind: ListingKind, row: &SqliteRow) -> Result<Listing, StoreError> {
    let table = kind.table();
    let corrupt = |detail: String| StoreError::CorruptRow { table, detail };

    let id: String = row.try_get("id")?;
    let date: String = row.try_get("date")?;
    let month: String = row.try_get("month")?;
    let skills: String = row.try_get("skills")?;
    let experience: String = row.try_get("experience")?;

    Ok(Listing {
        id: Uuid::parse_str(&id).map_err(|err| corrupt(format!("id `{id}`: {err}")))?,
        kind,
        position_id: row.try_get("position_id")?,
        title: row.try_get("title")?,
        company: row.try_get("company")?,
        salary: row.try_get("salary")?,
        date: NaiveDate::parse_from_str(&date, "%Y-%m-%d")
            .map_err(|err| corrupt(format!("date `{date}`: {err}")))?,
        month: MonthKey::parse(&month).map_err(|err| corrupt(err.to_string()))?,
        url: row.try_get("url")?,
        skills: serde_json::from_str(&skills)
            .map_err(|err| corrupt(format!("skills: {err}")))?,
        experience: serde_json::from_str(&experience)
            .map_err(|err| corrupt(format!("experience: {err}")))?,
        grade: row.try_get("grade")?,
    })
}
