//! Rhythm-anomaly computation and the per-class state machine.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;
use tracing::{debug, info};

use via_control::ControlRegistry;
use via_types::{LogEvent, PointId, RhythmHash, Tier1Payload};

use crate::Tier1Index;

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Scoring knobs of the monitor.
#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    /// Blend between novelty and frequency anomaly.
    pub alpha: f64,
    /// Z-score at which the frequency term saturates.
    pub z_norm: f64,
    /// Minimum score an anomaly must reach to be reported.
    pub threshold: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            alpha: 0.6,
            z_norm: 4.0,
            threshold: 0.5,
        }
    }
}

/// Share of the window a single class can claim inside the novelty term.
///
/// Caps the prevalence contribution of the current window so that a novel
/// storm dominating the stream still scores above threshold.
const WINDOW_SHARE_CAP: f64 = 0.5;

//─────────────────────────────
//  State machine
//─────────────────────────────

/// Lifecycle of a rhythm class inside Tier-1. `Unseen` is the absence of an
/// entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RhythmState {
    /// Seen in the window, below threshold.
    Observed,
    /// Scored at or above threshold in the latest analysis.
    Candidate,
    /// Handed to the promotion pipeline.
    Promoted,
    /// Hidden by an unexpired suppress verdict.
    Suppressed,
    /// Permanently marked normal.
    Patched,
}

//─────────────────────────────
//  Anomalies
//─────────────────────────────

/// One reported rhythm anomaly.
#[derive(Debug, Clone, PartialEq)]
pub struct Anomaly {
    /// The anomalous rhythm class.
    pub rhythm_hash: RhythmHash,
    /// Most recent event bearing the hash.
    pub representative: LogEvent,
    /// Point id of the representative.
    pub representative_id: PointId,
    /// Blended anomaly score in [0, 1].
    pub score: f64,
    /// Novelty term of the score.
    pub novelty: f64,
    /// Saturated frequency term of the score.
    pub frequency: f64,
    /// Events aggregated under the class within the window.
    pub count: u64,
    /// Earliest sighting in the window.
    pub first_ts: i64,
    /// Latest sighting in the window.
    pub last_ts: i64,
}

struct ClassAggregate {
    count: u64,
    first_ts: i64,
    last_ts: i64,
    representative: Tier1Payload,
    representative_id: PointId,
    buckets: Vec<u64>,
}

//─────────────────────────────
//  Monitor
//─────────────────────────────

/// Aggregates the sliding window into scored rhythm anomalies.
pub struct Tier1Monitor {
    index: Arc<Tier1Index>,
    control: Arc<ControlRegistry>,
    config: MonitorConfig,
    states: DashMap<RhythmHash, RhythmState>,
}

impl Tier1Monitor {
    /// Monitor over `index`, consulting `control` for the active set and
    /// prevalence history.
    pub fn new(index: Arc<Tier1Index>, control: Arc<ControlRegistry>, config: MonitorConfig) -> Self {
        Self {
            index,
            control,
            config,
            states: DashMap::new(),
        }
    }

    /// Compute rhythm anomalies over the trailing `window_sec`.
    ///
    /// Classes in the active suppress/patch set never reach scoring; a
    /// suppressed class therefore neither appears nor promotes until its
    /// TTL lapses. Results are the top `top_k` classes scoring at or above
    /// the threshold, best first.
    pub async fn rhythm_anomalies(
        &self,
        window_sec: i64,
        top_k: usize,
        threshold: Option<f64>,
    ) -> Result<Vec<Anomaly>> {
        let now = via_types::now_ts();
        let threshold = threshold.unwrap_or(self.config.threshold);
        let active = self.control.active_set().await;
        let hidden = active.hidden_at(now);

        self.sync_control_states(&active, now);

        if top_k == 0 {
            return Ok(Vec::new());
        }

        let start_ts = now - window_sec.max(0);
        let window = self.index.scroll_window(start_ts, now, &hidden).await?;
        let total = window.len() as f64;
        if window.is_empty() {
            return Ok(Vec::new());
        }

        let minutes = ((window_sec + 59) / 60).max(1) as usize;
        let mut classes: HashMap<RhythmHash, ClassAggregate> = HashMap::new();
        for (id, payload) in window {
            let bucket = (((payload.ts - start_ts) / 60).max(0) as usize).min(minutes - 1);
            let entry = classes
                .entry(payload.rhythm_hash)
                .or_insert_with(|| ClassAggregate {
                    count: 0,
                    first_ts: payload.ts,
                    last_ts: payload.ts,
                    representative: payload.clone(),
                    representative_id: id,
                    buckets: vec![0; minutes],
                });
            entry.count += 1;
            entry.first_ts = entry.first_ts.min(payload.ts);
            entry.last_ts = entry.last_ts.max(payload.ts);
            entry.buckets[bucket] += 1;
            // Most recent wins; ties go to the lexicographically largest id.
            let newer = (payload.ts, id.as_bytes().to_owned())
                > (entry.representative.ts, entry.representative_id.as_bytes().to_owned());
            if newer {
                entry.representative = payload;
                entry.representative_id = id;
            }
        }

        let hashes: Vec<RhythmHash> = classes.keys().copied().collect();
        let prevalences = self.control.historical_prevalences(&hashes, now).await?;

        let mut anomalies = Vec::new();
        for (hash, agg) in classes {
            let hist = prevalences.get(&hash).copied().unwrap_or(0.0);
            let share = (agg.count as f64 / total).min(WINDOW_SHARE_CAP);
            let novelty = (1.0 - (hist + share)).clamp(0.0, 1.0);
            let frequency = frequency_term(&agg.buckets, self.config.z_norm);
            let score = self.config.alpha * novelty + (1.0 - self.config.alpha) * frequency;

            let state = if score >= threshold {
                RhythmState::Candidate
            } else {
                RhythmState::Observed
            };
            self.states.insert(hash, state);

            if score >= threshold {
                anomalies.push(Anomaly {
                    rhythm_hash: hash,
                    representative: agg.representative.to_event(),
                    representative_id: agg.representative_id,
                    score,
                    novelty,
                    frequency,
                    count: agg.count,
                    first_ts: agg.first_ts,
                    last_ts: agg.last_ts,
                });
            }
        }

        anomalies.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.rhythm_hash.cmp(&b.rhythm_hash))
        });
        anomalies.truncate(top_k);

        debug!(
            window_sec,
            classes = hashes.len(),
            reported = anomalies.len(),
            "rhythm analysis complete"
        );
        Ok(anomalies)
    }

    /// Record that a class was handed to the promotion pipeline.
    pub fn mark_promoted(&self, hash: RhythmHash) {
        self.states.insert(hash, RhythmState::Promoted);
        info!(rhythm_hash = hash, "rhythm class promoted");
    }

    /// Current lifecycle state of a class; `None` means never seen.
    pub fn state(&self, hash: RhythmHash) -> Option<RhythmState> {
        self.states.get(&hash).map(|s| *s.value())
    }

    /// Fold control verdicts into the state map: hidden classes move to
    /// `Suppressed`/`Patched`, and classes whose suppression lapsed return
    /// to `Observed`.
    fn sync_control_states(&self, active: &via_types::ActiveControls, now: i64) {
        for hash in &active.patched {
            self.states.insert(*hash, RhythmState::Patched);
        }
        for (hash, expiry) in &active.suppressed {
            if *expiry > now {
                self.states.insert(*hash, RhythmState::Suppressed);
            }
        }
        let lapsed: Vec<RhythmHash> = self
            .states
            .iter()
            .filter(|e| *e.value() == RhythmState::Suppressed && !active.is_hidden(*e.key(), now))
            .map(|e| *e.key())
            .collect();
        for hash in lapsed {
            self.states.insert(hash, RhythmState::Observed);
        }
    }
}

/// Saturated frequency-anomaly term in [0, 1].
///
/// The most recent minute is compared against the mean and deviation of the
/// earlier minutes. A class with no earlier history and a non-empty current
/// minute is infinitely anomalous and saturates the term.
fn frequency_term(buckets: &[u64], z_norm: f64) -> f64 {
    let (history, current) = match buckets.split_last() {
        Some((current, history)) => (history, *current as f64),
        None => return 0.0,
    };
    let mean = if history.is_empty() {
        0.0
    } else {
        history.iter().sum::<u64>() as f64 / history.len() as f64
    };
    let variance = if history.is_empty() {
        0.0
    } else {
        history
            .iter()
            .map(|x| {
                let d = *x as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / history.len() as f64
    };
    let sigma = variance.sqrt();

    let z = if sigma == 0.0 {
        if current > mean {
            f64::INFINITY
        } else {
            0.0
        }
    } else {
        ((current - mean) / sigma).max(0.0)
    };
    (z / z_norm).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::time::Duration;

    use via_store_memory::MemoryVectorBackend;
    use via_types::{Level, LogEvent};

    use crate::tier1_point;

    fn event(ts: i64, level: Level, message: String) -> LogEvent {
        LogEvent {
            ts,
            service: "gateway".into(),
            level,
            message,
            attributes: StdHashMap::new(),
        }
    }

    async fn monitor_with_index() -> (Tier1Monitor, Arc<Tier1Index>, Arc<ControlRegistry>) {
        let backend = Arc::new(MemoryVectorBackend::new());
        let index = Arc::new(
            Tier1Index::bootstrap(backend, 1800, 200_000).await.unwrap(),
        );
        let control = Arc::new(ControlRegistry::in_memory().await.unwrap());
        let monitor = Tier1Monitor::new(index.clone(), control.clone(), MonitorConfig::default());
        (monitor, index, control)
    }

    /// 500 steady INFO events over ten minutes plus a 30-event ERROR burst
    /// in the last minute.
    async fn ingest_burst_scenario(index: &Tier1Index, now: i64) -> RhythmHash {
        let mut points = Vec::new();
        for i in 0..500i64 {
            let ts = now - 600 + (i * 539) / 499;
            let e = event(
                ts,
                Level::Info,
                format!("connection established from 10.2.3.4:{}", 1024 + i),
            );
            points.push(tier1_point(&e, &via_encoder::encode(&e).unwrap()));
        }
        let mut error_hash = 0;
        for i in 0..30i64 {
            let e = event(
                now - 55 + i,
                Level::Error,
                format!("assertion failed at /src/io.c:{}", 10 + i),
            );
            let encoded = via_encoder::encode(&e).unwrap();
            error_hash = encoded.rhythm_hash;
            points.push(tier1_point(&e, &encoded));
        }
        index.upsert(points).await.unwrap();
        error_hash
    }

    #[tokio::test]
    async fn burst_scenario_reports_exactly_the_error_class() {
        let (monitor, index, _) = monitor_with_index().await;
        let now = via_types::now_ts();
        let error_hash = ingest_burst_scenario(&index, now).await;

        let anomalies = monitor.rhythm_anomalies(900, 5, None).await.unwrap();
        assert_eq!(anomalies.len(), 1, "steady INFO rhythm must not surface");
        let anomaly = &anomalies[0];
        assert_eq!(anomaly.rhythm_hash, error_hash);
        assert_eq!(anomaly.count, 30);
        assert!(anomaly.score >= 0.8, "score was {}", anomaly.score);
        assert!(anomaly.representative.message.contains("assertion failed"));
        assert_eq!(monitor.state(error_hash), Some(RhythmState::Candidate));
    }

    #[tokio::test]
    async fn representative_is_the_most_recent_event() {
        let (monitor, index, _) = monitor_with_index().await;
        let now = via_types::now_ts();
        ingest_burst_scenario(&index, now).await;

        let anomalies = monitor.rhythm_anomalies(900, 5, None).await.unwrap();
        assert_eq!(anomalies[0].representative.ts, now - 55 + 29);
    }

    #[tokio::test]
    async fn top_k_zero_reports_nothing() {
        let (monitor, index, _) = monitor_with_index().await;
        ingest_burst_scenario(&index, via_types::now_ts()).await;
        assert!(monitor.rhythm_anomalies(900, 0, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_window_reports_nothing() {
        let (monitor, _, _) = monitor_with_index().await;
        assert!(monitor.rhythm_anomalies(900, 5, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn suppressed_class_hides_until_expiry() {
        let (monitor, index, control) = monitor_with_index().await;
        let now = via_types::now_ts();
        let error_hash = ingest_burst_scenario(&index, now).await;

        control.suppress(error_hash, 1, "deploy noise", "op-1").await.unwrap();
        let hidden = monitor.rhythm_anomalies(900, 5, None).await.unwrap();
        assert!(hidden.is_empty());
        assert_eq!(monitor.state(error_hash), Some(RhythmState::Suppressed));

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        control.refresh().await.unwrap();
        let back = monitor.rhythm_anomalies(900, 5, None).await.unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].rhythm_hash, error_hash);
    }

    #[tokio::test]
    async fn patched_class_never_surfaces() {
        let (monitor, index, control) = monitor_with_index().await;
        let now = via_types::now_ts();
        let error_hash = ingest_burst_scenario(&index, now).await;

        control.patch(error_hash, "known benign", "op-1").await.unwrap();
        let anomalies = monitor.rhythm_anomalies(900, 5, None).await.unwrap();
        assert!(anomalies.is_empty());
        assert_eq!(monitor.state(error_hash), Some(RhythmState::Patched));
    }

    #[tokio::test]
    async fn promotion_history_lowers_novelty() {
        let (monitor, index, control) = monitor_with_index().await;
        let now = via_types::now_ts();
        let error_hash = ingest_burst_scenario(&index, now).await;

        let fresh = monitor.rhythm_anomalies(900, 5, None).await.unwrap();
        for _ in 0..6 {
            control.bump_prevalence(error_hash, now).await.unwrap();
        }
        let seasoned = monitor.rhythm_anomalies(900, 5, None).await.unwrap();
        // Saturated prevalence removes the novelty term entirely.
        assert!(seasoned.is_empty() || seasoned[0].score < fresh[0].score);
    }

    #[test]
    fn frequency_term_saturates_for_fresh_bursts() {
        // No history, non-empty current minute: infinitely anomalous.
        assert_eq!(frequency_term(&[0, 0, 0, 30], 4.0), 1.0);
        // Steady rate: nothing anomalous about the current minute.
        assert_eq!(frequency_term(&[50, 50, 50, 50], 4.0), 0.0);
        // Quiet current minute never goes negative.
        assert_eq!(frequency_term(&[50, 50, 50, 0], 4.0), 0.0);
    }
}
