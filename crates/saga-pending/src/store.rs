// SPDX-License-Identifier: MIT OR Apache-2.0

//! Persistence for staged pending actions.

use crate::{PendingError, StagedChain};
use chrono::{DateTime, Utc};
use saga_ledger::Db;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

const PENDING_COLUMNS: &str = "id, campaign_id, scene_id, channel_id, user_id, request_id, \
     chain, mechanics, narration, player_tx_id, bot_tx_id, status, created_at, expires_at, \
     dedup_hash";

/// Injectable wall clock.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

// ---------------------------------------------------------------------------
// Status and rows
// ---------------------------------------------------------------------------

/// Lifecycle of a pending action: one transition out of `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingStatus {
    /// Awaiting user decision.
    Pending,
    /// Applied to the ledger.
    Confirmed,
    /// Discarded by the user.
    Canceled,
    /// Timed out before a decision.
    Expired,
    /// Confirmation was attempted and failed.
    Error,
}

impl PendingStatus {
    /// Stable storage string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PendingStatus::Pending => "pending",
            PendingStatus::Confirmed => "confirmed",
            PendingStatus::Canceled => "canceled",
            PendingStatus::Expired => "expired",
            PendingStatus::Error => "error",
        }
    }

    fn parse(s: &str) -> Result<Self, PendingError> {
        match s {
            "pending" => Ok(PendingStatus::Pending),
            "confirmed" => Ok(PendingStatus::Confirmed),
            "canceled" => Ok(PendingStatus::Canceled),
            "expired" => Ok(PendingStatus::Expired),
            "error" => Ok(PendingStatus::Error),
            other => Err(PendingError::Corrupt {
                detail: format!("unknown pending status '{other}'"),
            }),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PendingRow {
    id: i64,
    campaign_id: i64,
    scene_id: i64,
    channel_id: i64,
    user_id: String,
    request_id: String,
    chain: String,
    mechanics: String,
    narration: String,
    player_tx_id: Option<i64>,
    bot_tx_id: Option<i64>,
    status: String,
    created_at: i64,
    expires_at: i64,
    dedup_hash: Option<String>,
}

/// A staged action awaiting confirmation or a terminal state.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAction {
    /// Surrogate id.
    pub id: i64,
    /// Owning campaign.
    pub campaign_id: i64,
    /// Owning scene.
    pub scene_id: i64,
    /// Channel the request arrived on.
    pub channel_id: i64,
    /// Requesting user.
    pub user_id: String,
    /// Idempotency scope of the staged chain.
    pub request_id: String,
    /// The staged chain and its provenance.
    pub staged: StagedChain,
    /// Preview mechanics shown at staging time.
    pub mechanics: String,
    /// Player-visible narration shown at staging time.
    pub narration: String,
    /// Player transcript awaiting finalization.
    pub player_tx_id: Option<i64>,
    /// Bot transcript awaiting finalization.
    pub bot_tx_id: Option<i64>,
    /// Lifecycle status.
    pub status: PendingStatus,
    /// Staging time.
    pub created_at: DateTime<Utc>,
    /// Expiry deadline.
    pub expires_at: DateTime<Utc>,
    /// Chain fingerprint backing dedup.
    pub dedup_hash: Option<String>,
}

impl PendingRow {
    fn into_action(self) -> Result<PendingAction, PendingError> {
        let staged: StagedChain =
            serde_json::from_str(&self.chain).map_err(|e| PendingError::Corrupt {
                detail: format!("stored chain does not parse: {e}"),
            })?;
        let timestamp = |millis: i64| {
            DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| PendingError::Corrupt {
                detail: format!("timestamp {millis} out of range"),
            })
        };
        Ok(PendingAction {
            id: self.id,
            campaign_id: self.campaign_id,
            scene_id: self.scene_id,
            channel_id: self.channel_id,
            user_id: self.user_id,
            request_id: self.request_id,
            staged,
            mechanics: self.mechanics,
            narration: self.narration,
            player_tx_id: self.player_tx_id,
            bot_tx_id: self.bot_tx_id,
            status: PendingStatus::parse(&self.status)?,
            created_at: timestamp(self.created_at)?,
            expires_at: timestamp(self.expires_at)?,
            dedup_hash: self.dedup_hash,
        })
    }
}

/// First 32 hex characters of the SHA-256 over the canonical chain
/// serialization.
///
/// # Errors
///
/// [`PendingError`] when the staged chain cannot be serialized into the
/// restricted JSON the canonical encoder accepts.
pub fn dedup_hash(staged: &StagedChain) -> Result<String, PendingError> {
    let value = serde_json::to_value(staged).map_err(|e| PendingError::Corrupt {
        detail: format!("chain serialization failed: {e}"),
    })?;
    let object = value.as_object().ok_or_else(|| PendingError::Corrupt {
        detail: "chain did not serialize to an object".to_string(),
    })?;
    let bytes = saga_canonical::canonical_bytes(object)?;
    let digest: [u8; 32] = Sha256::digest(&bytes).into();
    Ok(hex::encode(digest)[..32].to_string())
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Parameters for [`PendingStore::create`].
#[derive(Debug, Clone)]
pub struct CreatePending {
    /// Owning campaign.
    pub campaign_id: i64,
    /// Owning scene.
    pub scene_id: i64,
    /// Originating channel.
    pub channel_id: i64,
    /// Requesting user.
    pub user_id: String,
    /// Idempotency scope of the staged chain.
    pub request_id: String,
    /// The chain to stage.
    pub staged: StagedChain,
    /// Preview mechanics text.
    pub mechanics: String,
    /// Player-visible narration.
    pub narration: String,
    /// Linked player transcript.
    pub player_tx_id: Option<i64>,
    /// Linked bot transcript.
    pub bot_tx_id: Option<i64>,
    /// Seconds until the staged action expires.
    pub ttl_seconds: i64,
}

/// Repository for pending actions.
#[derive(Clone)]
pub struct PendingStore {
    db: Db,
    clock: Clock,
}

impl PendingStore {
    /// Wire the store to its database with the real clock.
    #[must_use]
    pub fn new(db: Db) -> Self {
        Self {
            db,
            clock: Arc::new(Utc::now),
        }
    }

    /// Override the clock (tests).
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// The underlying database handle.
    #[must_use]
    pub fn db(&self) -> &Db {
        &self.db
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Stage a chain, or return the active row already staging the same
    /// chain for this `(scene, user)`.
    ///
    /// # Errors
    ///
    /// [`PendingError`] on serialization or storage failure.
    pub async fn create(&self, params: CreatePending) -> Result<PendingAction, PendingError> {
        let dedup = dedup_hash(&params.staged)?;
        if let Some(existing) = self
            .active_by_dedup(params.scene_id, &params.user_id, &dedup)
            .await?
        {
            return Ok(existing);
        }

        let chain_text =
            serde_json::to_string(&params.staged).map_err(|e| PendingError::Corrupt {
                detail: format!("chain serialization failed: {e}"),
            })?;
        let created = self.now();
        let expires = created + chrono::Duration::seconds(params.ttl_seconds);

        const SQL: &str = "INSERT INTO pending_actions (campaign_id, scene_id, channel_id, \
             user_id, request_id, chain, mechanics, narration, player_tx_id, bot_tx_id, \
             status, created_at, expires_at, dedup_hash) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'pending', $11, $12, $13)";
        let insert = match &self.db {
            Db::Sqlite(pool) => sqlx::query(SQL)
                .bind(params.campaign_id)
                .bind(params.scene_id)
                .bind(params.channel_id)
                .bind(&params.user_id)
                .bind(&params.request_id)
                .bind(&chain_text)
                .bind(&params.mechanics)
                .bind(&params.narration)
                .bind(params.player_tx_id)
                .bind(params.bot_tx_id)
                .bind(created.timestamp_millis())
                .bind(expires.timestamp_millis())
                .bind(&dedup)
                .execute(pool)
                .await
                .map(|r| r.last_insert_rowid()),
            Db::Postgres(pool) => {
                sqlx::query_scalar(&format!("{SQL} RETURNING id"))
                    .bind(params.campaign_id)
                    .bind(params.scene_id)
                    .bind(params.channel_id)
                    .bind(&params.user_id)
                    .bind(&params.request_id)
                    .bind(&chain_text)
                    .bind(&params.mechanics)
                    .bind(&params.narration)
                    .bind(params.player_tx_id)
                    .bind(params.bot_tx_id)
                    .bind(created.timestamp_millis())
                    .bind(expires.timestamp_millis())
                    .bind(&dedup)
                    .fetch_one(pool)
                    .await
            }
        };

        let id = match insert {
            Ok(id) => id,
            Err(e) => {
                // A concurrent double-submit lost the partial-unique race;
                // the winner's row is the answer.
                if e.as_database_error().is_some_and(|d| d.is_unique_violation())
                    && let Some(existing) = self
                        .active_by_dedup(params.scene_id, &params.user_id, &dedup)
                        .await?
                {
                    return Ok(existing);
                }
                return Err(PendingError::Storage(e));
            }
        };

        self.get(id).await?.ok_or_else(|| PendingError::Corrupt {
            detail: format!("inserted pending action {id} not found"),
        })
    }

    async fn active_by_dedup(
        &self,
        scene_id: i64,
        user_id: &str,
        dedup: &str,
    ) -> Result<Option<PendingAction>, PendingError> {
        let sql = format!(
            "SELECT {PENDING_COLUMNS} FROM pending_actions \
             WHERE scene_id = $1 AND user_id = $2 AND dedup_hash = $3 AND status = 'pending' \
             ORDER BY id DESC LIMIT 1"
        );
        let row: Option<PendingRow> = match &self.db {
            Db::Sqlite(pool) => sqlx::query_as(&sql)
                .bind(scene_id)
                .bind(user_id)
                .bind(dedup)
                .fetch_optional(pool)
                .await?,
            Db::Postgres(pool) => sqlx::query_as(&sql)
                .bind(scene_id)
                .bind(user_id)
                .bind(dedup)
                .fetch_optional(pool)
                .await?,
        };
        row.map(PendingRow::into_action).transpose()
    }

    /// Fetch by id.
    ///
    /// # Errors
    ///
    /// [`PendingError`] on storage failure or a corrupt row.
    pub async fn get(&self, id: i64) -> Result<Option<PendingAction>, PendingError> {
        let sql = format!("SELECT {PENDING_COLUMNS} FROM pending_actions WHERE id = $1");
        let row: Option<PendingRow> = match &self.db {
            Db::Sqlite(pool) => sqlx::query_as(&sql).bind(id).fetch_optional(pool).await?,
            Db::Postgres(pool) => sqlx::query_as(&sql).bind(id).fetch_optional(pool).await?,
        };
        row.map(PendingRow::into_action).transpose()
    }

    /// The most recent pending action for a user in a scene.
    ///
    /// # Errors
    ///
    /// [`PendingError`] on storage failure or a corrupt row.
    pub async fn get_latest_pending_for_user(
        &self,
        scene_id: i64,
        user_id: &str,
    ) -> Result<Option<PendingAction>, PendingError> {
        let sql = format!(
            "SELECT {PENDING_COLUMNS} FROM pending_actions \
             WHERE scene_id = $1 AND user_id = $2 AND status = 'pending' \
             ORDER BY id DESC LIMIT 1"
        );
        let row: Option<PendingRow> = match &self.db {
            Db::Sqlite(pool) => sqlx::query_as(&sql)
                .bind(scene_id)
                .bind(user_id)
                .fetch_optional(pool)
                .await?,
            Db::Postgres(pool) => sqlx::query_as(&sql)
                .bind(scene_id)
                .bind(user_id)
                .fetch_optional(pool)
                .await?,
        };
        row.map(PendingRow::into_action).transpose()
    }

    /// Transition a row out of `pending`. Returns `false` when the row
    /// was already terminal (transitions are single-shot).
    ///
    /// # Errors
    ///
    /// [`PendingError`] on storage failure.
    pub async fn mark_status(&self, id: i64, status: PendingStatus) -> Result<bool, PendingError> {
        const SQL: &str =
            "UPDATE pending_actions SET status = $1 WHERE id = $2 AND status = 'pending'";
        let affected = match &self.db {
            Db::Sqlite(pool) => sqlx::query(SQL)
                .bind(status.as_str())
                .bind(id)
                .execute(pool)
                .await?
                .rows_affected(),
            Db::Postgres(pool) => sqlx::query(SQL)
                .bind(status.as_str())
                .bind(id)
                .execute(pool)
                .await?
                .rows_affected(),
        };
        Ok(affected > 0)
    }

    /// Expire every pending row whose deadline has passed; returns the
    /// number of rows flipped. Idempotent: already-terminal rows are
    /// untouched.
    ///
    /// # Errors
    ///
    /// [`PendingError`] on storage failure.
    pub async fn expire_stale(&self) -> Result<u64, PendingError> {
        const SQL: &str = "UPDATE pending_actions SET status = 'expired' \
             WHERE status = 'pending' AND expires_at < $1";
        let now = self.now().timestamp_millis();
        let affected = match &self.db {
            Db::Sqlite(pool) => sqlx::query(SQL).bind(now).execute(pool).await?.rows_affected(),
            Db::Postgres(pool) => {
                sqlx::query(SQL).bind(now).execute(pool).await?.rows_affected()
            }
        };
        Ok(affected)
    }
}
