#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **via-control** – Control-loop registry for Vector Incident Atlas.
//!
//! Operator verdicts (suppress with TTL, permanent patch, lift) are
//! persisted in a small SQLite database next to the decaying prevalence
//! counters. An in-memory [`ActiveControls`] snapshot is rebuilt
//! copy-on-write after every change and on a timer, so the Tier-1 monitor
//! and the federated query layer read it without ever touching the
//! database on the hot path.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tokio::sync::RwLock;
use tracing::{debug, info};

use via_types::{
    hash_from_db, hash_to_db, now_ts, ActiveControls, ControlKind, ControlRecord, RhythmHash,
};

mod prevalence;
mod regression;

pub use prevalence::{PREVALENCE_HALF_LIFE_DAYS, PREVALENCE_SATURATION};
pub use regression::{RegressionCase, RegressionRecorder, MAX_SNAPSHOT_EVENTS};

//─────────────────────────────
//  Registry
//─────────────────────────────

/// SQLite-backed registry of suppress/patch verdicts and prevalence.
///
/// The registry exclusively owns its tables; other components read control
/// state only through the swapped [`ActiveControls`] snapshot.
pub struct ControlRegistry {
    pool: SqlitePool,
    active: RwLock<Arc<ActiveControls>>,
}

impl ControlRegistry {
    /// Open (or create) the control store at `path` and load the active set.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("opening control store at {}", path.as_ref().display()))?;
        Self::from_pool(pool).await
    }

    /// Open an in-memory control store, for tests and ephemeral runs.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(SqliteConnectOptions::new().filename(":memory:"))
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        let registry = Self {
            pool,
            active: RwLock::new(Arc::new(ActiveControls::default())),
        };
        registry.migrate().await?;
        registry.refresh().await?;
        Ok(registry)
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS control (
                hash INTEGER PRIMARY KEY,
                kind TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER,
                reason TEXT NOT NULL DEFAULT '',
                operator_id TEXT NOT NULL DEFAULT ''
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS prevalence (
                hash INTEGER PRIMARY KEY,
                count REAL NOT NULL,
                updated_at INTEGER NOT NULL
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_control_expires ON control(expires_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    //─────────────────────────────
    //  Verdicts
    //─────────────────────────────

    /// Suppress a rhythm class for `ttl_sec` seconds.
    ///
    /// Idempotent per hash: re-suppression extends the TTL to the larger of
    /// the old and new expiries. A patched hash stays patched. Returns the
    /// effective expiry epoch.
    pub async fn suppress(
        &self,
        hash: RhythmHash,
        ttl_sec: i64,
        reason: &str,
        operator_id: &str,
    ) -> Result<i64> {
        let now = now_ts();
        let requested = now + ttl_sec.max(0);
        let db_hash = hash_to_db(hash);

        let existing = sqlx::query("SELECT kind, expires_at FROM control WHERE hash = ?")
            .bind(db_hash)
            .fetch_optional(&self.pool)
            .await?;

        let expires_at = match existing {
            Some(row) if row.get::<String, _>("kind") == ControlKind::Patch.as_str() => {
                debug!(rhythm_hash = hash, "suppress ignored, hash is patched");
                self.refresh().await?;
                return Ok(i64::MAX);
            }
            Some(row) => {
                let prior: Option<i64> = row.get("expires_at");
                let effective = prior.unwrap_or(0).max(requested);
                sqlx::query("UPDATE control SET expires_at = ?, reason = ?, operator_id = ? WHERE hash = ?")
                    .bind(effective)
                    .bind(reason)
                    .bind(operator_id)
                    .bind(db_hash)
                    .execute(&self.pool)
                    .await?;
                effective
            }
            None => {
                sqlx::query(
                    "INSERT INTO control (hash, kind, created_at, expires_at, reason, operator_id) VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(db_hash)
                .bind(ControlKind::Suppress.as_str())
                .bind(now)
                .bind(requested)
                .bind(reason)
                .bind(operator_id)
                .execute(&self.pool)
                .await?;
                requested
            }
        };

        info!(rhythm_hash = hash, expires_at, "rhythm class suppressed");
        self.refresh().await?;
        Ok(expires_at)
    }

    /// Permanently patch a rhythm class as normal.
    ///
    /// Idempotent; a prior suppress row is upgraded in place. Returns `true`
    /// only on the first patch, which is the caller's cue to write the
    /// regression case.
    pub async fn patch(&self, hash: RhythmHash, reason: &str, operator_id: &str) -> Result<bool> {
        let now = now_ts();
        let db_hash = hash_to_db(hash);

        let existing = sqlx::query("SELECT kind FROM control WHERE hash = ?")
            .bind(db_hash)
            .fetch_optional(&self.pool)
            .await?;

        let newly_patched = match existing {
            Some(row) if row.get::<String, _>("kind") == ControlKind::Patch.as_str() => false,
            Some(_) => {
                sqlx::query(
                    "UPDATE control SET kind = ?, created_at = ?, expires_at = NULL, reason = ?, operator_id = ? WHERE hash = ?",
                )
                .bind(ControlKind::Patch.as_str())
                .bind(now)
                .bind(reason)
                .bind(operator_id)
                .bind(db_hash)
                .execute(&self.pool)
                .await?;
                true
            }
            None => {
                sqlx::query(
                    "INSERT INTO control (hash, kind, created_at, expires_at, reason, operator_id) VALUES (?, ?, ?, NULL, ?, ?)",
                )
                .bind(db_hash)
                .bind(ControlKind::Patch.as_str())
                .bind(now)
                .bind(reason)
                .bind(operator_id)
                .execute(&self.pool)
                .await?;
                true
            }
        };

        if newly_patched {
            info!(rhythm_hash = hash, "rhythm class patched");
        }
        self.refresh().await?;
        Ok(newly_patched)
    }

    /// Delete the verdict on a hash, whatever its kind. Returns whether a
    /// row existed.
    pub async fn lift(&self, hash: RhythmHash) -> Result<bool> {
        let result = sqlx::query("DELETE FROM control WHERE hash = ?")
            .bind(hash_to_db(hash))
            .execute(&self.pool)
            .await?;
        let existed = result.rows_affected() > 0;
        if existed {
            info!(rhythm_hash = hash, "verdict lifted");
        }
        self.refresh().await?;
        Ok(existed)
    }

    /// All persisted verdict rows, expired ones included.
    pub async fn records(&self) -> Result<Vec<ControlRecord>> {
        let rows = sqlx::query(
            "SELECT hash, kind, created_at, expires_at, reason, operator_id FROM control ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let kind = match row.get::<String, _>("kind").as_str() {
                    "patch" => ControlKind::Patch,
                    _ => ControlKind::Suppress,
                };
                Ok(ControlRecord {
                    rhythm_hash: hash_from_db(row.get("hash")),
                    kind,
                    created_at: row.get("created_at"),
                    expires_at: row.get("expires_at"),
                    reason: row.get("reason"),
                    operator_id: row.get("operator_id"),
                })
            })
            .collect()
    }

    //─────────────────────────────
    //  Active set
    //─────────────────────────────

    /// Current copy-on-write snapshot; cheap to clone, never blocks writers.
    pub async fn active_set(&self) -> Arc<ActiveControls> {
        self.active.read().await.clone()
    }

    /// Rebuild the snapshot from the database, pruning expired suppress
    /// rows. Called after every change and by the runtime's 5 s timer.
    pub async fn refresh(&self) -> Result<()> {
        let now = now_ts();
        let rows = sqlx::query("SELECT hash, kind, expires_at FROM control")
            .fetch_all(&self.pool)
            .await?;

        let mut next = ActiveControls::default();
        for row in rows {
            let hash = hash_from_db(row.get("hash"));
            match row.get::<String, _>("kind").as_str() {
                "patch" => {
                    next.patched.insert(hash);
                }
                _ => {
                    let expires_at: Option<i64> = row.get("expires_at");
                    if let Some(expiry) = expires_at {
                        if expiry > now {
                            next.suppressed.insert(hash, expiry);
                        }
                    }
                }
            }
        }

        *self.active.write().await = Arc::new(next);
        Ok(())
    }
}
