// SPDX-License-Identifier: MIT OR Apache-2.0

//! World-table operations and the event ledger repository.

use crate::db::Db;
use crate::error::{InsertViolation, LedgerError, classify_insert_error};
use chrono::Utc;
use saga_canonical::JsonMap;
use saga_envelope::{
    Event, IdempotencyInputs, envelope_hash, idempotency_key_v2, payload_hash,
};
use saga_locks::{EncounterLocks, genesis_scope};
use saga_telemetry::{Metrics, field};
use std::time::{Duration, Instant};
use tracing::debug;

/// Insert retry budget under ordinal contention.
const APPEND_RETRY_BUDGET: u32 = 5;

/// Base back-off between contended insert attempts.
const APPEND_BACKOFF: Duration = Duration::from_millis(5);

// ---------------------------------------------------------------------------
// World tables
// ---------------------------------------------------------------------------

/// A player/bot message attached to a scene.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Transcript {
    /// Surrogate id.
    pub id: i64,
    /// Owning scene.
    pub scene_id: i64,
    /// Message author (user id or bot identity).
    pub author: String,
    /// Message text.
    pub content: String,
    /// `active`, `finalized`, or `error`.
    pub status: String,
}

impl Db {
    /// Create a campaign; returns its id.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Storage`] on query failure (also for the remaining
    /// operations in this block).
    pub async fn create_campaign(&self, name: &str) -> Result<i64, LedgerError> {
        const SQL: &str = "INSERT INTO campaigns (name) VALUES ($1)";
        match self {
            Db::Sqlite(pool) => Ok(sqlx::query(SQL)
                .bind(name)
                .execute(pool)
                .await?
                .last_insert_rowid()),
            Db::Postgres(pool) => Ok(sqlx::query_scalar(&format!("{SQL} RETURNING id"))
                .bind(name)
                .fetch_one(pool)
                .await?),
        }
    }

    /// Create a scene in a campaign; returns its id.
    pub async fn create_scene(
        &self,
        campaign_id: i64,
        channel_id: i64,
    ) -> Result<i64, LedgerError> {
        const SQL: &str = "INSERT INTO scenes (campaign_id, channel_id) VALUES ($1, $2)";
        match self {
            Db::Sqlite(pool) => Ok(sqlx::query(SQL)
                .bind(campaign_id)
                .bind(channel_id)
                .execute(pool)
                .await?
                .last_insert_rowid()),
            Db::Postgres(pool) => Ok(sqlx::query_scalar(&format!("{SQL} RETURNING id"))
                .bind(campaign_id)
                .bind(channel_id)
                .fetch_one(pool)
                .await?),
        }
    }

    /// The campaign owning a scene.
    pub async fn campaign_for_scene(&self, scene_id: i64) -> Result<Option<i64>, LedgerError> {
        const SQL: &str = "SELECT campaign_id FROM scenes WHERE id = $1";
        let id = match self {
            Db::Sqlite(pool) => sqlx::query_scalar(SQL).bind(scene_id).fetch_optional(pool).await?,
            Db::Postgres(pool) => {
                sqlx::query_scalar(SQL).bind(scene_id).fetch_optional(pool).await?
            }
        };
        Ok(id)
    }

    /// Create a character; returns its id.
    pub async fn create_character(
        &self,
        campaign_id: i64,
        name: &str,
    ) -> Result<i64, LedgerError> {
        const SQL: &str = "INSERT INTO characters (campaign_id, name) VALUES ($1, $2)";
        match self {
            Db::Sqlite(pool) => Ok(sqlx::query(SQL)
                .bind(campaign_id)
                .bind(name)
                .execute(pool)
                .await?
                .last_insert_rowid()),
            Db::Postgres(pool) => Ok(sqlx::query_scalar(&format!("{SQL} RETURNING id"))
                .bind(campaign_id)
                .bind(name)
                .fetch_one(pool)
                .await?),
        }
    }

    /// Look up a character name by id within a campaign.
    pub async fn character_name(
        &self,
        campaign_id: i64,
        character_id: i64,
    ) -> Result<Option<String>, LedgerError> {
        const SQL: &str = "SELECT name FROM characters WHERE campaign_id = $1 AND id = $2";
        let name = match self {
            Db::Sqlite(pool) => sqlx::query_scalar(SQL)
                .bind(campaign_id)
                .bind(character_id)
                .fetch_optional(pool)
                .await?,
            Db::Postgres(pool) => sqlx::query_scalar(SQL)
                .bind(campaign_id)
                .bind(character_id)
                .fetch_optional(pool)
                .await?,
        };
        Ok(name)
    }

    /// Whether a character with this name exists in the campaign.
    pub async fn character_exists(
        &self,
        campaign_id: i64,
        name: &str,
    ) -> Result<bool, LedgerError> {
        const SQL: &str =
            "SELECT COUNT(*) FROM characters WHERE campaign_id = $1 AND name = $2";
        let count: i64 = match self {
            Db::Sqlite(pool) => sqlx::query_scalar(SQL)
                .bind(campaign_id)
                .bind(name)
                .fetch_one(pool)
                .await?,
            Db::Postgres(pool) => sqlx::query_scalar(SQL)
                .bind(campaign_id)
                .bind(name)
                .fetch_one(pool)
                .await?,
        };
        Ok(count > 0)
    }

    /// Record a transcript line; returns its id.
    pub async fn create_transcript(
        &self,
        scene_id: i64,
        author: &str,
        content: &str,
    ) -> Result<i64, LedgerError> {
        const SQL: &str =
            "INSERT INTO transcripts (scene_id, author, content, status) VALUES ($1, $2, $3, 'active')";
        match self {
            Db::Sqlite(pool) => Ok(sqlx::query(SQL)
                .bind(scene_id)
                .bind(author)
                .bind(content)
                .execute(pool)
                .await?
                .last_insert_rowid()),
            Db::Postgres(pool) => Ok(sqlx::query_scalar(&format!("{SQL} RETURNING id"))
                .bind(scene_id)
                .bind(author)
                .bind(content)
                .fetch_one(pool)
                .await?),
        }
    }

    /// Most recent transcripts for a scene, newest first, bounded.
    pub async fn recent_transcripts(
        &self,
        scene_id: i64,
        limit: i64,
    ) -> Result<Vec<Transcript>, LedgerError> {
        const SQL: &str = "SELECT id, scene_id, author, content, status FROM transcripts \
             WHERE scene_id = $1 ORDER BY id DESC LIMIT $2";
        let rows = match self {
            Db::Sqlite(pool) => sqlx::query_as(SQL)
                .bind(scene_id)
                .bind(limit)
                .fetch_all(pool)
                .await?,
            Db::Postgres(pool) => sqlx::query_as(SQL)
                .bind(scene_id)
                .bind(limit)
                .fetch_all(pool)
                .await?,
        };
        Ok(rows)
    }

    /// Terminal-state transition for a transcript.
    pub async fn set_transcript_status(
        &self,
        transcript_id: i64,
        status: &str,
    ) -> Result<(), LedgerError> {
        const SQL: &str = "UPDATE transcripts SET status = $1 WHERE id = $2";
        match self {
            Db::Sqlite(pool) => {
                sqlx::query(SQL).bind(status).bind(transcript_id).execute(pool).await?;
            }
            Db::Postgres(pool) => {
                sqlx::query(SQL).bind(status).bind(transcript_id).execute(pool).await?;
            }
        }
        Ok(())
    }

    /// Fetch a transcript's status (diagnostics and tests).
    pub async fn transcript_status(
        &self,
        transcript_id: i64,
    ) -> Result<Option<String>, LedgerError> {
        const SQL: &str = "SELECT status FROM transcripts WHERE id = $1";
        let status = match self {
            Db::Sqlite(pool) => {
                sqlx::query_scalar(SQL).bind(transcript_id).fetch_optional(pool).await?
            }
            Db::Postgres(pool) => {
                sqlx::query_scalar(SQL).bind(transcript_id).fetch_optional(pool).await?
            }
        };
        Ok(status)
    }

    /// Delete a campaign; dependent rows cascade.
    pub async fn delete_campaign(&self, campaign_id: i64) -> Result<(), LedgerError> {
        const SQL: &str = "DELETE FROM campaigns WHERE id = $1";
        match self {
            Db::Sqlite(pool) => {
                sqlx::query(SQL).bind(campaign_id).execute(pool).await?;
            }
            Db::Postgres(pool) => {
                sqlx::query(SQL).bind(campaign_id).execute(pool).await?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// EventLedger
// ---------------------------------------------------------------------------

/// Parameters for [`EventLedger::append_event`].
#[derive(Debug, Clone)]
pub struct AppendEvent<'a> {
    /// Owning campaign.
    pub campaign_id: i64,
    /// Owning scene, when encounter-scoped.
    pub scene_id: Option<i64>,
    /// Event type identifier.
    pub event_type: &'a str,
    /// Restricted-JSON payload.
    pub payload: JsonMap,
    /// Acting entity; numeric ids are normalized to character names.
    pub actor_id: Option<String>,
    /// Plan provenance.
    pub plan_id: Option<&'a str>,
    /// Execution request provenance; enables retry collapse.
    pub execution_request_id: Option<&'a str>,
    /// Confirming user for two-phase actions.
    pub approved_by: Option<&'a str>,
}

impl<'a> AppendEvent<'a> {
    /// Minimal append request with only the required fields.
    #[must_use]
    pub fn new(campaign_id: i64, event_type: &'a str, payload: JsonMap) -> Self {
        Self {
            campaign_id,
            scene_id: None,
            event_type,
            payload,
            actor_id: None,
            plan_id: None,
            execution_request_id: None,
            approved_by: None,
        }
    }
}

/// The append-only event ledger repository.
///
/// Enforces the central invariants: dense per-campaign ordinals, chain
/// continuity, and `(campaign_id, idempotency_key)` uniqueness.
#[derive(Debug, Clone)]
pub struct EventLedger {
    db: Db,
    locks: EncounterLocks,
    metrics: Metrics,
    lock_timeout: Duration,
}

impl EventLedger {
    /// Wire the repository to its storage, lock service, and metrics.
    #[must_use]
    pub fn new(db: Db, locks: EncounterLocks, metrics: Metrics, lock_timeout: Duration) -> Self {
        Self {
            db,
            locks,
            metrics,
            lock_timeout,
        }
    }

    /// The underlying database handle.
    #[must_use]
    pub fn db(&self) -> &Db {
        &self.db
    }

    /// The metrics handle this repository reports into.
    #[must_use]
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// The lock service serializing encounter-scoped writes.
    #[must_use]
    pub fn locks(&self) -> &EncounterLocks {
        &self.locks
    }

    /// Configured lock acquisition timeout.
    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Idempotently create the genesis event for a campaign.
    ///
    /// Serialized on a per-campaign sentinel lock scope so two
    /// bootstrappers cannot insert two genesis rows; a cross-process race
    /// that slips past the lock resolves through the ordinal uniqueness
    /// constraint and re-fetch.
    ///
    /// # Errors
    ///
    /// [`LedgerError`] on lock or storage failure.
    pub async fn ensure_genesis(&self, campaign_id: i64) -> Result<Event, LedgerError> {
        let _guard = self
            .locks
            .acquire(self.db.pg_pool(), genesis_scope(campaign_id), self.lock_timeout)
            .await?;

        if let Some(existing) = self.db.event_at_ordinal(campaign_id, 0).await? {
            return Ok(existing);
        }
        let genesis = Event::genesis(campaign_id, Utc::now());
        match self.db.insert_event_row(&genesis).await {
            Ok(stored) => {
                self.metrics.inc_counter("events.genesis_created", 1);
                Ok(stored)
            }
            Err(LedgerError::Storage(e))
                if classify_insert_error(&e) != InsertViolation::Other =>
            {
                self.db
                    .event_at_ordinal(campaign_id, 0)
                    .await?
                    .ok_or(LedgerError::Inconsistent {
                        detail: format!(
                            "genesis insert for campaign {campaign_id} conflicted but no row exists"
                        ),
                    })
            }
            Err(e) => Err(e),
        }
    }

    /// Append an event, acquiring the encounter lock when the request is
    /// scene-scoped.
    ///
    /// # Errors
    ///
    /// See [`append_event_under_lock`](Self::append_event_under_lock).
    pub async fn append_event(&self, request: AppendEvent<'_>) -> Result<Event, LedgerError> {
        match request.scene_id {
            Some(scene_id) => {
                let _guard = self
                    .locks
                    .acquire(self.db.pg_pool(), scene_id, self.lock_timeout)
                    .await?;
                self.append_event_under_lock(request).await
            }
            None => self.append_event_under_lock(request).await,
        }
    }

    /// Append an event; the caller already holds the encounter lock for
    /// the request's scene (the executor holds it across a whole chain).
    ///
    /// Atomic and idempotent: a retried intent (same execution request,
    /// plan, event type, and payload) returns the originally committed
    /// row, and a concurrent writer claiming the candidate ordinal first
    /// triggers a bounded retry.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::Inconsistent`] when no genesis event exists;
    /// - [`LedgerError::IdempotencyCollision`] when a stored event shares
    ///   the candidate key with different content;
    /// - [`LedgerError::Contention`] past the retry budget;
    /// - [`LedgerError::Canonical`] / [`LedgerError::Storage`] propagated.
    pub async fn append_event_under_lock(
        &self,
        request: AppendEvent<'_>,
    ) -> Result<Event, LedgerError> {
        let started = Instant::now();
        // Normalization happens before any hash or key computation.
        let actor_id = self.normalize_actor(request.campaign_id, request.actor_id).await?;
        let payload_digest = payload_hash(&request.payload)?;

        // A retried request collapses onto the event committed for the
        // same intent; the ordinal in the v2 key material has moved on,
        // so the committed intent is matched by content, not by key.
        if let Some(request_id) = request.execution_request_id
            && let Some(existing) = self
                .db
                .event_for_intent(
                    request.campaign_id,
                    request_id,
                    request.plan_id,
                    request.event_type,
                    &payload_digest,
                )
                .await?
        {
            self.record_reuse(&existing);
            return Ok(existing);
        }

        let mut attempts = 0;
        while attempts < APPEND_RETRY_BUDGET {
            attempts += 1;

            let tip = self.db.chain_tip(request.campaign_id).await?.ok_or_else(|| {
                LedgerError::Inconsistent {
                    detail: format!(
                        "campaign {} has no genesis event; call ensure_genesis first",
                        request.campaign_id
                    ),
                }
            })?;
            let replay_ordinal = tip.replay_ordinal + 1;
            let idempotency_key = idempotency_key_v2(
                IdempotencyInputs {
                    campaign_id: request.campaign_id,
                    event_type: request.event_type,
                    execution_request_id: request.execution_request_id,
                    plan_id: request.plan_id,
                    replay_ordinal,
                },
                &request.payload,
            )?;

            let candidate = Event {
                id: 0,
                campaign_id: request.campaign_id,
                scene_id: request.scene_id,
                replay_ordinal,
                event_type: request.event_type.to_string(),
                event_schema_version: saga_envelope::EVENT_SCHEMA_VERSION,
                world_time: replay_ordinal,
                wall_time_utc: Utc::now(),
                prev_event_hash: envelope_hash(&tip),
                payload_hash: payload_digest,
                idempotency_key,
                actor_id: actor_id.clone(),
                plan_id: request.plan_id.map(str::to_string),
                execution_request_id: request.execution_request_id.map(str::to_string),
                approved_by: request.approved_by.map(str::to_string),
                payload: request.payload.clone(),
                migrator_applied_from: None,
            };

            match self.db.insert_event_row(&candidate).await {
                Ok(stored) => {
                    self.metrics.inc_counter("events.applied", 1);
                    self.metrics.observe_histogram(
                        "event.apply.latency_ms",
                        started.elapsed().as_millis() as u64,
                    );
                    return Ok(stored);
                }
                Err(LedgerError::Storage(e)) => match classify_insert_error(&e) {
                    InsertViolation::IdempotencyKey => {
                        let existing = self
                            .db
                            .event_by_idempotency_key(request.campaign_id, &idempotency_key)
                            .await?
                            .ok_or(LedgerError::Inconsistent {
                                detail: "idempotency conflict reported but no row found"
                                    .to_string(),
                            })?;
                        if existing.payload_hash != candidate.payload_hash
                            || existing.event_type != candidate.event_type
                        {
                            self.metrics.inc_counter("events.idempotent_collision", 1);
                            return Err(LedgerError::IdempotencyCollision {
                                campaign_id: request.campaign_id,
                                event_type: request.event_type.to_string(),
                            });
                        }
                        self.record_reuse(&existing);
                        return Ok(existing);
                    }
                    InsertViolation::Ordinal => {
                        debug!(
                            target: "saga",
                            campaign_id = request.campaign_id,
                            attempt = attempts,
                            "ordinal contention, retrying append"
                        );
                        tokio::time::sleep(APPEND_BACKOFF * attempts).await;
                    }
                    InsertViolation::Other => return Err(LedgerError::Storage(e)),
                },
                Err(e) => return Err(e),
            }
        }
        Err(LedgerError::Contention {
            attempts: APPEND_RETRY_BUDGET,
        })
    }

    /// Insert a caller-built event row verbatim.
    ///
    /// The database-side integrity guards still apply; violations map to
    /// [`LedgerError::Integrity`]. Exists for migration tooling and
    /// boundary tests, not the normal append path.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Integrity`] on any constraint or trigger rejection.
    pub async fn insert_event_raw(&self, event: &Event) -> Result<Event, LedgerError> {
        match self.db.insert_event_row(event).await {
            Ok(stored) => Ok(stored),
            Err(LedgerError::Storage(e))
                if classify_insert_error(&e) != InsertViolation::Other =>
            {
                Err(LedgerError::Integrity {
                    detail: e
                        .as_database_error()
                        .map(|d| d.message().to_string())
                        .unwrap_or_else(|| e.to_string()),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Events of a campaign in replay order, optionally scene-scoped.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Storage`] on query failure.
    pub async fn list_events(
        &self,
        campaign_id: i64,
        scene_id: Option<i64>,
    ) -> Result<Vec<Event>, LedgerError> {
        self.db.select_events(campaign_id, scene_id).await
    }

    fn record_reuse(&self, existing: &Event) {
        self.metrics.inc_counter("events.idempotent_reuse", 1);
        self.metrics.log_event(
            "events",
            "idempotent_reuse",
            [
                field("campaign_id", existing.campaign_id),
                field("replay_ordinal", existing.replay_ordinal),
                field("event_type", existing.event_type.clone()),
            ],
        );
    }

    /// Replace a numeric actor reference by the character's name when the
    /// character exists; any other value is stored verbatim.
    async fn normalize_actor(
        &self,
        campaign_id: i64,
        actor_id: Option<String>,
    ) -> Result<Option<String>, LedgerError> {
        let Some(actor) = actor_id else {
            return Ok(None);
        };
        if let Ok(character_id) = actor.parse::<i64>()
            && let Some(name) = self.db.character_name(campaign_id, character_id).await?
        {
            return Ok(Some(name));
        }
        Ok(Some(actor))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
