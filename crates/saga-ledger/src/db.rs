// SPDX-License-Identifier: MIT OR Apache-2.0

//! Backend-agnostic database handle and event-row primitives.
//!
//! SQLite backs development and tests; Postgres backs production. SQL is
//! written once with `$N` placeholders (both dialects accept them); only
//! pool types and row decoding dispatch per backend.

use crate::error::LedgerError;
use crate::schema::{POSTGRES_SCHEMA, SQLITE_SCHEMA};
use chrono::{DateTime, Utc};
use saga_canonical::JsonMap;
use saga_envelope::Event;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

const EVENT_COLUMNS: &str = "id, campaign_id, scene_id, replay_ordinal, event_type, \
     event_schema_version, world_time, wall_time_utc, prev_event_hash, payload_hash, \
     idempotency_key, actor_id, plan_id, execution_request_id, approved_by, payload, \
     migrator_applied_from";

const INSERT_EVENT: &str = "INSERT INTO events (campaign_id, scene_id, replay_ordinal, \
     event_type, event_schema_version, world_time, wall_time_utc, prev_event_hash, \
     payload_hash, idempotency_key, actor_id, plan_id, execution_request_id, approved_by, \
     payload, migrator_applied_from) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)";

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

/// Raw `events` row; converted to [`Event`] after decoding.
#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    id: i64,
    campaign_id: i64,
    scene_id: Option<i64>,
    replay_ordinal: i64,
    event_type: String,
    event_schema_version: i32,
    world_time: i64,
    wall_time_utc: i64,
    prev_event_hash: Vec<u8>,
    payload_hash: Vec<u8>,
    idempotency_key: Vec<u8>,
    actor_id: Option<String>,
    plan_id: Option<String>,
    execution_request_id: Option<String>,
    approved_by: Option<String>,
    payload: String,
    migrator_applied_from: Option<i32>,
}

fn bytes_to_array<const N: usize>(bytes: Vec<u8>, column: &str) -> Result<[u8; N], LedgerError> {
    <[u8; N]>::try_from(bytes).map_err(|b| LedgerError::Inconsistent {
        detail: format!("column {column} holds {} bytes, expected {N}", b.len()),
    })
}

impl EventRow {
    fn into_event(self) -> Result<Event, LedgerError> {
        let payload: JsonMap =
            serde_json::from_str(&self.payload).map_err(|e| LedgerError::Inconsistent {
                detail: format!("stored payload is not a JSON object: {e}"),
            })?;
        let wall_time_utc = DateTime::<Utc>::from_timestamp_millis(self.wall_time_utc)
            .ok_or_else(|| LedgerError::Inconsistent {
                detail: format!("wall_time_utc {} out of range", self.wall_time_utc),
            })?;
        Ok(Event {
            id: self.id,
            campaign_id: self.campaign_id,
            scene_id: self.scene_id,
            replay_ordinal: self.replay_ordinal,
            event_type: self.event_type,
            event_schema_version: self.event_schema_version,
            world_time: self.world_time,
            wall_time_utc,
            prev_event_hash: bytes_to_array(self.prev_event_hash, "prev_event_hash")?,
            payload_hash: bytes_to_array(self.payload_hash, "payload_hash")?,
            idempotency_key: bytes_to_array(self.idempotency_key, "idempotency_key")?,
            actor_id: self.actor_id,
            plan_id: self.plan_id,
            execution_request_id: self.execution_request_id,
            approved_by: self.approved_by,
            payload,
            migrator_applied_from: self.migrator_applied_from,
        })
    }
}

fn rows_to_events(rows: Vec<EventRow>) -> Result<Vec<Event>, LedgerError> {
    rows.into_iter().map(EventRow::into_event).collect()
}

fn payload_text(payload: &JsonMap) -> Result<String, LedgerError> {
    let bytes = saga_canonical::canonical_bytes(payload)?;
    String::from_utf8(bytes).map_err(|_| LedgerError::Inconsistent {
        detail: "canonical payload is not valid UTF-8".to_string(),
    })
}

// ---------------------------------------------------------------------------
// Db
// ---------------------------------------------------------------------------

/// Pooled connection handle to either supported backend.
#[derive(Debug, Clone)]
pub enum Db {
    /// Development / test backend.
    Sqlite(SqlitePool),
    /// Production backend.
    Postgres(PgPool),
}

impl Db {
    /// Connect to `database_url` (`sqlite:` or `postgres:` scheme).
    ///
    /// In-memory SQLite is pinned to a single pooled connection so every
    /// query observes the same database.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Storage`] on connection failure.
    pub async fn connect(database_url: &str) -> Result<Self, LedgerError> {
        if database_url.starts_with("postgres") {
            let pool = PgPoolOptions::new()
                .max_connections(8)
                .connect(database_url)
                .await?;
            return Ok(Db::Postgres(pool));
        }
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let max = if database_url.contains(":memory:") { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max)
            .connect_with(options)
            .await?;
        Ok(Db::Sqlite(pool))
    }

    /// An in-memory SQLite database with the schema applied; the standard
    /// test fixture.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Storage`] on connection or DDL failure.
    pub async fn in_memory() -> Result<Self, LedgerError> {
        let db = Self::connect("sqlite::memory:").await?;
        db.apply_schema().await?;
        Ok(db)
    }

    /// The Postgres pool, when this handle is backed by Postgres. The
    /// lock service uses this to decide whether the advisory tier exists.
    #[must_use]
    pub fn pg_pool(&self) -> Option<&PgPool> {
        match self {
            Db::Sqlite(_) => None,
            Db::Postgres(pool) => Some(pool),
        }
    }

    /// Create all tables, indexes, and triggers for this backend.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Storage`] on DDL failure.
    pub async fn apply_schema(&self) -> Result<(), LedgerError> {
        match self {
            Db::Sqlite(pool) => {
                for statement in SQLITE_SCHEMA {
                    sqlx::query(statement).execute(pool).await?;
                }
            }
            Db::Postgres(pool) => {
                for statement in POSTGRES_SCHEMA {
                    sqlx::query(statement).execute(pool).await?;
                }
            }
        }
        Ok(())
    }

    // -- event primitives ---------------------------------------------------

    /// Insert a fully formed event row; returns the stored row.
    ///
    /// The caller computes hashes and the ordinal; the database's unique
    /// indexes and dense-ordinal trigger still apply.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Storage`] carrying the violation for the caller to
    /// classify.
    pub(crate) async fn insert_event_row(&self, event: &Event) -> Result<Event, LedgerError> {
        let payload = payload_text(&event.payload)?;
        let wall_millis = event.wall_time_utc.timestamp_millis();
        let id = match self {
            Db::Sqlite(pool) => {
                let result = sqlx::query(INSERT_EVENT)
                    .bind(event.campaign_id)
                    .bind(event.scene_id)
                    .bind(event.replay_ordinal)
                    .bind(&event.event_type)
                    .bind(event.event_schema_version)
                    .bind(event.world_time)
                    .bind(wall_millis)
                    .bind(event.prev_event_hash.to_vec())
                    .bind(event.payload_hash.to_vec())
                    .bind(event.idempotency_key.to_vec())
                    .bind(event.actor_id.as_deref())
                    .bind(event.plan_id.as_deref())
                    .bind(event.execution_request_id.as_deref())
                    .bind(event.approved_by.as_deref())
                    .bind(&payload)
                    .bind(event.migrator_applied_from)
                    .execute(pool)
                    .await?;
                result.last_insert_rowid()
            }
            Db::Postgres(pool) => {
                let insert_returning = format!("{INSERT_EVENT} RETURNING id");
                sqlx::query_scalar(&insert_returning)
                    .bind(event.campaign_id)
                    .bind(event.scene_id)
                    .bind(event.replay_ordinal)
                    .bind(&event.event_type)
                    .bind(event.event_schema_version)
                    .bind(event.world_time)
                    .bind(wall_millis)
                    .bind(event.prev_event_hash.to_vec())
                    .bind(event.payload_hash.to_vec())
                    .bind(event.idempotency_key.to_vec())
                    .bind(event.actor_id.as_deref())
                    .bind(event.plan_id.as_deref())
                    .bind(event.execution_request_id.as_deref())
                    .bind(event.approved_by.as_deref())
                    .bind(&payload)
                    .bind(event.migrator_applied_from)
                    .fetch_one(pool)
                    .await?
            }
        };
        let mut stored = event.clone();
        stored.id = id;
        Ok(stored)
    }

    /// The highest-ordinal event of a campaign, if any.
    pub(crate) async fn chain_tip(&self, campaign_id: i64) -> Result<Option<Event>, LedgerError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE campaign_id = $1 \
             ORDER BY replay_ordinal DESC LIMIT 1"
        );
        let row: Option<EventRow> = match self {
            Db::Sqlite(pool) => {
                sqlx::query_as(&sql).bind(campaign_id).fetch_optional(pool).await?
            }
            Db::Postgres(pool) => {
                sqlx::query_as(&sql).bind(campaign_id).fetch_optional(pool).await?
            }
        };
        row.map(EventRow::into_event).transpose()
    }

    /// Fetch a campaign's event at a given ordinal.
    pub(crate) async fn event_at_ordinal(
        &self,
        campaign_id: i64,
        replay_ordinal: i64,
    ) -> Result<Option<Event>, LedgerError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE campaign_id = $1 AND replay_ordinal = $2"
        );
        let row: Option<EventRow> = match self {
            Db::Sqlite(pool) => sqlx::query_as(&sql)
                .bind(campaign_id)
                .bind(replay_ordinal)
                .fetch_optional(pool)
                .await?,
            Db::Postgres(pool) => sqlx::query_as(&sql)
                .bind(campaign_id)
                .bind(replay_ordinal)
                .fetch_optional(pool)
                .await?,
        };
        row.map(EventRow::into_event).transpose()
    }

    /// Fetch an event by its unique `(campaign_id, idempotency_key)`.
    pub(crate) async fn event_by_idempotency_key(
        &self,
        campaign_id: i64,
        key: &[u8; 16],
    ) -> Result<Option<Event>, LedgerError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE campaign_id = $1 AND idempotency_key = $2"
        );
        let key = key.to_vec();
        let row: Option<EventRow> = match self {
            Db::Sqlite(pool) => sqlx::query_as(&sql)
                .bind(campaign_id)
                .bind(key)
                .fetch_optional(pool)
                .await?,
            Db::Postgres(pool) => sqlx::query_as(&sql)
                .bind(campaign_id)
                .bind(key)
                .fetch_optional(pool)
                .await?,
        };
        row.map(EventRow::into_event).transpose()
    }

    /// Earliest committed event matching a retried intent: same request,
    /// plan, event type, and payload hash.
    pub(crate) async fn event_for_intent(
        &self,
        campaign_id: i64,
        execution_request_id: &str,
        plan_id: Option<&str>,
        event_type: &str,
        payload_hash: &[u8; 32],
    ) -> Result<Option<Event>, LedgerError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE campaign_id = $1 AND execution_request_id = $2 AND event_type = $3 \
               AND payload_hash = $4 AND COALESCE(plan_id, '') = $5 \
             ORDER BY replay_ordinal ASC LIMIT 1"
        );
        let hash = payload_hash.to_vec();
        let plan = plan_id.unwrap_or("");
        let row: Option<EventRow> = match self {
            Db::Sqlite(pool) => sqlx::query_as(&sql)
                .bind(campaign_id)
                .bind(execution_request_id)
                .bind(event_type)
                .bind(hash)
                .bind(plan)
                .fetch_optional(pool)
                .await?,
            Db::Postgres(pool) => sqlx::query_as(&sql)
                .bind(campaign_id)
                .bind(execution_request_id)
                .bind(event_type)
                .bind(hash)
                .bind(plan)
                .fetch_optional(pool)
                .await?,
        };
        row.map(EventRow::into_event).transpose()
    }

    /// Events of a campaign, optionally scene-scoped, by ascending ordinal.
    pub(crate) async fn select_events(
        &self,
        campaign_id: i64,
        scene_id: Option<i64>,
    ) -> Result<Vec<Event>, LedgerError> {
        let rows: Vec<EventRow> = match scene_id {
            Some(scene) => {
                let sql = format!(
                    "SELECT {EVENT_COLUMNS} FROM events \
                     WHERE campaign_id = $1 AND scene_id = $2 ORDER BY replay_ordinal ASC"
                );
                match self {
                    Db::Sqlite(pool) => sqlx::query_as(&sql)
                        .bind(campaign_id)
                        .bind(scene)
                        .fetch_all(pool)
                        .await?,
                    Db::Postgres(pool) => sqlx::query_as(&sql)
                        .bind(campaign_id)
                        .bind(scene)
                        .fetch_all(pool)
                        .await?,
                }
            }
            None => {
                let sql = format!(
                    "SELECT {EVENT_COLUMNS} FROM events \
                     WHERE campaign_id = $1 ORDER BY replay_ordinal ASC"
                );
                match self {
                    Db::Sqlite(pool) => {
                        sqlx::query_as(&sql).bind(campaign_id).fetch_all(pool).await?
                    }
                    Db::Postgres(pool) => {
                        sqlx::query_as(&sql).bind(campaign_id).fetch_all(pool).await?
                    }
                }
            }
        };
        rows_to_events(rows)
    }
}
