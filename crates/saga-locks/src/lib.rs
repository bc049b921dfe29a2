// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use saga_telemetry::Metrics;
use sqlx::PgPool;
use sqlx::pool::PoolConnection;
use sqlx::postgres::Postgres;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;

/// Advisory lock class for encounter scopes; the second key is the
/// encounter id. 32-bit key space via the two-int variant.
const ADVISORY_CLASS: i32 = 1001;

/// Poll interval while waiting for the advisory lock.
const POLL_STEP: Duration = Duration::from_millis(50);

/// Lock scope used to serialize `ensure_genesis` for a campaign.
///
/// Scene ids are positive, so negated campaign ids never collide with a
/// real encounter scope.
#[must_use]
pub fn genesis_scope(campaign_id: i64) -> i64 {
    -campaign_id
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures while acquiring an encounter lock.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The advisory lock was not obtained within the timeout.
    #[error("encounter lock timeout after {waited_ms}ms")]
    Timeout {
        /// Milliseconds spent polling.
        waited_ms: u64,
    },

    /// The database rejected the advisory lock query.
    #[error("advisory lock query failed: {0}")]
    Storage(#[from] sqlx::Error),
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Scoped serialization service keyed by encounter id.
#[derive(Debug, Clone)]
pub struct EncounterLocks {
    local: Arc<Mutex<HashMap<i64, Arc<Mutex<()>>>>>,
    metrics: Metrics,
}

impl EncounterLocks {
    /// Create a lock service reporting into `metrics`.
    #[must_use]
    pub fn new(metrics: Metrics) -> Self {
        Self {
            local: Arc::new(Mutex::new(HashMap::new())),
            metrics,
        }
    }

    async fn local_lock(&self, encounter_id: i64) -> Arc<Mutex<()>> {
        let mut registry = self.local.lock().await;
        registry
            .entry(encounter_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquire the encounter lock.
    ///
    /// The in-process mutex is taken first to serialize same-process
    /// tasks cheaply; when `pg` is present the Postgres advisory lock is
    /// then polled as the cross-process source of truth. The returned
    /// guard releases both tiers when dropped.
    ///
    /// # Errors
    ///
    /// [`LockError::Timeout`] when the advisory lock stays contended past
    /// `timeout`; [`LockError::Storage`] on query failure. The in-process
    /// tier is released before either error returns.
    pub async fn acquire(
        &self,
        pg: Option<&PgPool>,
        encounter_id: i64,
        timeout: Duration,
    ) -> Result<EncounterGuard, LockError> {
        let local = self.local_lock(encounter_id).await.lock_owned().await;

        let advisory = match pg {
            Some(pool) => {
                let handle = self
                    .acquire_advisory(pool, encounter_id, timeout)
                    .await?;
                self.metrics.inc_counter("locks.mode.pg", 1);
                Some(handle)
            }
            None => {
                self.metrics.inc_counter("locks.mode.inproc", 1);
                None
            }
        };

        Ok(EncounterGuard {
            _local: local,
            advisory,
        })
    }

    async fn acquire_advisory(
        &self,
        pool: &PgPool,
        encounter_id: i64,
        timeout: Duration,
    ) -> Result<AdvisoryLock, LockError> {
        let key = encounter_id as i32;
        let mut conn = pool.acquire().await.inspect_err(|_| {
            self.metrics.inc_counter("locks.acquire.error", 1);
        })?;

        let mut waited = Duration::ZERO;
        loop {
            let locked: bool =
                sqlx::query_scalar("SELECT pg_try_advisory_lock($1, $2)")
                    .bind(ADVISORY_CLASS)
                    .bind(key)
                    .fetch_one(&mut *conn)
                    .await
                    .inspect_err(|_| {
                        self.metrics.inc_counter("locks.acquire.error", 1);
                    })?;
            if locked {
                break;
            }
            if waited >= timeout {
                let waited_ms = waited.as_millis() as u64;
                self.metrics.inc_counter("locks.acquire.timeout", 1);
                self.metrics.observe_histogram("locks.wait_ms", waited_ms);
                return Err(LockError::Timeout { waited_ms });
            }
            tokio::time::sleep(POLL_STEP).await;
            waited += POLL_STEP;
        }

        self.metrics.inc_counter("locks.acquire.success", 1);
        self.metrics
            .observe_histogram("locks.wait_ms", waited.as_millis() as u64);
        Ok(AdvisoryLock {
            conn: Some(conn),
            key,
        })
    }
}

// ---------------------------------------------------------------------------
// Guards
// ---------------------------------------------------------------------------

/// Held encounter lock; dropping releases both tiers.
#[derive(Debug)]
pub struct EncounterGuard {
    _local: OwnedMutexGuard<()>,
    advisory: Option<AdvisoryLock>,
}

impl EncounterGuard {
    /// Whether the cross-process tier is held (Postgres backends only).
    #[must_use]
    pub fn cross_process(&self) -> bool {
        self.advisory.is_some()
    }
}

/// A held Postgres advisory lock pinned to the pool connection that
/// acquired it; advisory locks are session-scoped, so the unlock must run
/// on the same connection.
#[derive(Debug)]
struct AdvisoryLock {
    conn: Option<PoolConnection<Postgres>>,
    key: i32,
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        let key = self.key;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let released =
                        sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1, $2)")
                            .bind(ADVISORY_CLASS)
                            .bind(key)
                            .fetch_one(&mut *conn)
                            .await;
                    if let Err(e) = released {
                        warn!(target: "saga", key, error = %e, "advisory unlock failed");
                    }
                });
            }
            Err(_) => {
                // No runtime to run the unlock on; the session lock is
                // released when the connection itself closes.
                warn!(target: "saga", key, "advisory lock dropped outside a runtime");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
