//! Cycle statistics kept per heap (and for the shared heap).

use crate::plan::{CycleSummary, GCKind};
use enum_map::EnumMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use strum::IntoEnumIterator;

/// Counters updated at the end of every cycle.
#[derive(Default)]
pub struct Stats {
    cycles: EnumMap<GCKind, AtomicUsize>,
    collections_coalesced: AtomicUsize,
    escalations: AtomicUsize,
    total_pause: Mutex<Duration>,
    last: Mutex<Option<CycleSummary>>,
}

/// A copy of the counters at one point in time.
#[derive(Clone, Debug, Default)]
pub struct StatsSnapshot {
    pub cycles: EnumMap<GCKind, usize>,
    pub collections_coalesced: usize,
    pub escalations: usize,
    pub total_pause: Duration,
    pub last: Option<CycleSummary>,
}

impl StatsSnapshot {
    pub fn total_cycles(&self) -> usize {
        self.cycles.values().sum()
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for kind in GCKind::iter().filter(|k| self.cycles[*k] > 0) {
            write!(f, "{}: {}, ", kind, self.cycles[kind])?;
        }
        write!(
            f,
            "coalesced: {}, escalations: {}, total pause: {:?}",
            self.collections_coalesced, self.escalations, self.total_pause
        )
    }
}

impl Stats {
    pub fn end_cycle(&self, summary: &CycleSummary) {
        self.cycles[summary.cycle.kind].fetch_add(1, Ordering::Relaxed);
        *self.total_pause.lock().unwrap() += summary.duration;
        *self.last.lock().unwrap() = Some(summary.clone());
    }

    pub fn coalesced(&self) {
        self.collections_coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn escalated(&self) {
        self.escalations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cycles(&self, kind: GCKind) -> usize {
        self.cycles[kind].load(Ordering::Relaxed)
    }

    pub fn last_summary(&self) -> Option<CycleSummary> {
        self.last.lock().unwrap().clone()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cycles: EnumMap::from_fn(|kind| self.cycles[kind].load(Ordering::Relaxed)),
            collections_coalesced: self.collections_coalesced.load(Ordering::Relaxed),
            escalations: self.escalations.load(Ordering::Relaxed),
            total_pause: *self.total_pause.lock().unwrap(),
            last: self.last_summary(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Cycle, GCReason};

    #[test]
    fn counts_per_kind() {
        let stats = Stats::default();
        for (id, kind) in [GCKind::Young, GCKind::Young, GCKind::Full].into_iter().enumerate() {
            let mut summary = CycleSummary::new(
                Cycle {
                    id: id as u64,
                    kind,
                    reason: GCReason::Explicit,
                },
                1,
            );
            summary.duration = Duration::from_millis(2);
            stats.end_cycle(&summary);
        }
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.cycles[GCKind::Young], 2);
        assert_eq!(snapshot.cycles[GCKind::Old], 0);
        assert_eq!(snapshot.total_cycles(), 3);
        assert_eq!(snapshot.total_pause, Duration::from_millis(6));
        assert_eq!(snapshot.last.as_ref().unwrap().cycle.kind, GCKind::Full);
        assert_eq!(
            snapshot.to_string(),
            "Young: 2, Full: 1, coalesced: 0, escalations: 0, total pause: 6ms"
        );
    }
}
