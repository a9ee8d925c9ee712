//! Throughput estimation over the peer-traffic counter pairs.
//!
//! The tracker is fed raw counter rows from the peer-traffic group and
//! turns the monotonically growing completion-byte counters into rates.
//! Sampling and reporting run on separate clocks: samples are taken as
//! often as the caller records (at most once per millisecond), while a
//! report averages the samples of roughly one second.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::perf::bw;

const MIN_SAMPLE_SPACING: Duration = Duration::from_millis(1);
const REPORT_EVERY: Duration = Duration::from_secs(1);

/// Mean per-peer throughput of one local rank over the last report window.
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct BwReport {
    pub local_rank: usize,
    pub rank: usize,
    pub pid: usize,
    /// Bytes per second towards each peer rank, indexed by peer. `None`
    /// for peers whose counter did not move during the window.
    pub peer_rates: Vec<Option<f64>>,
}

struct RowState {
    pid: usize,
    rank: usize,
    prev: Vec<usize>,
    rates: Vec<Vec<f64>>,
}

/// Rate state across record calls, keyed by local rank.
pub struct BwTracker {
    world_size: usize,
    local_size: usize,
    last_sample: Option<Instant>,
    last_report: Option<Instant>,
    rows: BTreeMap<usize, RowState>,
}

impl BwTracker {
    pub fn new() -> Self {
        Self {
            world_size: 0,
            local_size: 0,
            last_sample: None,
            last_report: None,
            rows: BTreeMap::new(),
        }
    }

    /// Feeds one snapshot of occupied peer-traffic rows.
    ///
    /// The first snapshot only establishes baselines. Later snapshots
    /// record one rate sample per peer whose completion counter moved.
    pub fn record(&mut self, rows: &[Vec<usize>]) {
        self.record_at(rows, Instant::now());
    }

    /// Report for the closing window, once more than a second has passed
    /// since the previous report. Consumes the collected samples.
    pub fn take_report(&mut self) -> Option<Vec<BwReport>> {
        self.take_report_at(Instant::now())
    }

    fn record_at(&mut self, rows: &[Vec<usize>], now: Instant) {
        let elapsed = self.last_sample.map(|last| now.duration_since(last));
        if let Some(elapsed) = elapsed {
            if elapsed < MIN_SAMPLE_SPACING {
                return;
            }
        }
        let Some(first) = rows.iter().find(|row| row.len() > bw::LOCAL_SIZE) else {
            return;
        };
        let geometry = (first[bw::WORLD_SIZE], first[bw::LOCAL_SIZE]);
        if geometry.0 == 0 {
            return;
        }
        if geometry != (self.world_size, self.local_size) {
            // The job was relaunched with a different shape; every
            // baseline and sample belongs to the old shape.
            self.rows.clear();
            (self.world_size, self.local_size) = geometry;
        }

        for row in rows {
            if row.len() <= bw::LOCAL_SIZE {
                continue;
            }
            let local = row[bw::LOCAL_RANK];
            let peers = self.world_size.min(row.len().saturating_sub(bw::OFFSET) / 2);
            let fresh = !self.rows.contains_key(&local);
            let state = self.rows.entry(local).or_insert_with(|| RowState {
                pid: 0,
                rank: 0,
                prev: vec![0; peers],
                rates: vec![Vec::new(); peers],
            });
            state.pid = row[bw::PID];
            state.rank = row[bw::RANK];
            for peer in 0..peers.min(state.prev.len()) {
                let cur = row[bw::cpl_bytes_index(peer)];
                let prev = std::mem::replace(&mut state.prev[peer], cur);
                if fresh {
                    continue;
                }
                let Some(elapsed) = elapsed else { continue };
                // A counter that moved backwards means the slot was
                // recycled; the new value is a baseline, not a delta.
                if cur <= prev {
                    continue;
                }
                let rate = (cur - prev) as f64 * 1e9 / elapsed.as_nanos() as f64;
                state.rates[peer].push(rate);
            }
        }
        self.last_sample = Some(now);
    }

    fn take_report_at(&mut self, now: Instant) -> Option<Vec<BwReport>> {
        let last = *self.last_report.get_or_insert(now);
        if now.duration_since(last) <= REPORT_EVERY {
            return None;
        }
        self.last_report = Some(now);
        if self.rows.is_empty() {
            return None;
        }
        let reports = self
            .rows
            .iter_mut()
            .map(|(local, state)| BwReport {
                local_rank: *local,
                rank: state.rank,
                pid: state.pid,
                peer_rates: state
                    .rates
                    .iter_mut()
                    .map(|samples| {
                        if samples.is_empty() {
                            return None;
                        }
                        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
                        samples.clear();
                        Some(mean)
                    })
                    .collect(),
            })
            .collect();
        Some(reports)
    }
}

impl Default for BwTracker {
    fn default() -> Self {
        Self::new()
    }
}
