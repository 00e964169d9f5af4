//! Decaying historical-prevalence counters.
//!
//! Each promotion of a rhythm class bumps its counter; the counter decays
//! exponentially with a 7-day half-life, applied lazily whenever a row is
//! read or written. `historical_prevalence` normalizes the counter into
//! [0, 1] for the novelty term of the anomaly score.

use std::collections::HashMap;

use anyhow::Result;
use sqlx::Row;

use via_types::{hash_to_db, RhythmHash};

use crate::ControlRegistry;

/// Half-life of the prevalence counter, in days.
pub const PREVALENCE_HALF_LIFE_DAYS: f64 = 7.0;

/// Counter value at which a class counts as fully prevalent.
pub const PREVALENCE_SATURATION: f64 = 5.0;

const SECS_PER_DAY: f64 = 86_400.0;

/// Apply exponential decay to a counter over `elapsed_sec`.
fn decayed(count: f64, elapsed_sec: i64) -> f64 {
    if elapsed_sec <= 0 || count <= 0.0 {
        return count.max(0.0);
    }
    let days = elapsed_sec as f64 / SECS_PER_DAY;
    count * 0.5f64.powf(days / PREVALENCE_HALF_LIFE_DAYS)
}

impl ControlRegistry {
    /// Record one promotion of `hash` at `now`; returns the new counter.
    pub async fn bump_prevalence(&self, hash: RhythmHash, now: i64) -> Result<f64> {
        let db_hash = hash_to_db(hash);
        let row = sqlx::query("SELECT count, updated_at FROM prevalence WHERE hash = ?")
            .bind(db_hash)
            .fetch_optional(self.pool())
            .await?;

        let count = match row {
            Some(row) => {
                let prior: f64 = row.get("count");
                let updated_at: i64 = row.get("updated_at");
                decayed(prior, now - updated_at) + 1.0
            }
            None => 1.0,
        };

        sqlx::query(
            "INSERT INTO prevalence (hash, count, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(hash) DO UPDATE SET count = excluded.count, updated_at = excluded.updated_at",
        )
        .bind(db_hash)
        .bind(count)
        .bind(now)
        .execute(self.pool())
        .await?;

        Ok(count)
    }

    /// Decayed counter of `hash` as of `now`; zero when never promoted.
    pub async fn prevalence(&self, hash: RhythmHash, now: i64) -> Result<f64> {
        let row = sqlx::query("SELECT count, updated_at FROM prevalence WHERE hash = ?")
            .bind(hash_to_db(hash))
            .fetch_optional(self.pool())
            .await?;
        Ok(match row {
            Some(row) => {
                let count: f64 = row.get("count");
                let updated_at: i64 = row.get("updated_at");
                decayed(count, now - updated_at)
            }
            None => 0.0,
        })
    }

    /// Normalized historical prevalence in [0, 1].
    pub async fn historical_prevalence(&self, hash: RhythmHash, now: i64) -> Result<f64> {
        Ok((self.prevalence(hash, now).await? / PREVALENCE_SATURATION).min(1.0))
    }

    /// Batch form of [`historical_prevalence`](Self::historical_prevalence)
    /// for the analysis path.
    pub async fn historical_prevalences(
        &self,
        hashes: &[RhythmHash],
        now: i64,
    ) -> Result<HashMap<RhythmHash, f64>> {
        let mut out = HashMap::with_capacity(hashes.len());
        for &hash in hashes {
            out.insert(hash, self.historical_prevalence(hash, now).await?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decay_halves_per_half_life() {
        let week = (PREVALENCE_HALF_LIFE_DAYS * SECS_PER_DAY) as i64;
        assert!((decayed(4.0, week) - 2.0).abs() < 1e-9);
        assert!((decayed(4.0, 2 * week) - 1.0).abs() < 1e-9);
        assert_eq!(decayed(4.0, 0), 4.0);
        assert_eq!(decayed(-1.0, 100), 0.0);
    }

    #[tokio::test]
    async fn bump_accumulates_and_decays() -> Result<()> {
        let registry = ControlRegistry::in_memory().await?;
        let now = via_types::now_ts();

        assert_eq!(registry.prevalence(3, now).await?, 0.0);
        registry.bump_prevalence(3, now).await?;
        registry.bump_prevalence(3, now).await?;
        assert!((registry.prevalence(3, now).await? - 2.0).abs() < 1e-9);

        // A week later, the pair has decayed to one.
        let later = now + (PREVALENCE_HALF_LIFE_DAYS * SECS_PER_DAY) as i64;
        assert!((registry.prevalence(3, later).await? - 1.0).abs() < 1e-6);
        Ok(())
    }

    #[tokio::test]
    async fn historical_prevalence_saturates_at_one() -> Result<()> {
        let registry = ControlRegistry::in_memory().await?;
        let now = via_types::now_ts();
        for _ in 0..10 {
            registry.bump_prevalence(5, now).await?;
        }
        assert_eq!(registry.historical_prevalence(5, now).await?, 1.0);
        assert_eq!(registry.historical_prevalence(6, now).await?, 0.0);
        Ok(())
    }
}
