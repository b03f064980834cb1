//! When to collect, and what.

use crate::plan::GCKind;
use crate::util::constants::BYTES_IN_REGION;
use crate::util::options::Options;
use enum_map::EnumMap;
use std::time::{Duration, Instant};

/// Where the embedder says its context is in its life, for postponing collections.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StartupStatus {
    Normal,
    /// The context is starting up. Only a nearly full heap is collected.
    OnStartup,
    /// Startup ended recently. Collections are restrained until `until`.
    JustFinished { until: Instant },
}

/// An idle old cycle is scheduled once old space reaches this fraction of its limit.
const IDLE_OLD_LIMIT_RATE: f64 = 0.9;
/// An idle young cycle is scheduled when less than this is left in the young generation.
const IDLE_YOUNG_HEADROOM: usize = 2 * BYTES_IN_REGION;
/// Right after startup, collections wait until heap objects reach this fraction of the heap
/// size.
const JUST_FINISHED_STARTUP_RATE: f64 = 0.25;

/// Collection policy of one local heap.
pub(crate) struct HeapTrigger {
    /// Old space bytes (old, non-movable and huge together) that make the next cycle an old
    /// cycle.
    old_limit: usize,
    /// Live old bytes found by the last old or full cycle.
    last_live_old: usize,
    full_requested: bool,
    young_cycles_since_old: usize,
    /// Running average of young cycle survival rates.
    survival_average: Option<f64>,
    upgrade_to_old: bool,
    /// Grow limits as little as possible.
    memory_pressure: bool,
    startup: StartupStatus,
    /// Heap object bytes when the current latency-sensitive window started.
    sensitive_base: Option<usize>,
    /// The cycle to run the next time the embedder reports an idle period.
    idle_task: Option<GCKind>,
    /// Running average pause of each local cycle kind.
    pause_average: EnumMap<GCKind, Option<Duration>>,
    young_cycles_before_old: usize,
    native_size_limit: usize,
    heap_growing_factor: f64,
    min_old_space_limit: usize,
    old_space_size: usize,
    max_heap_size: usize,
    startup_headroom: usize,
    startup_restrain_time: Duration,
    sensitive_growth_limit: usize,
    idle_time_limit: Duration,
}

impl HeapTrigger {
    pub fn new(options: &Options) -> Self {
        Self {
            old_limit: options.min_old_space_limit.min(options.old_space_size),
            last_live_old: 0,
            full_requested: false,
            young_cycles_since_old: 0,
            survival_average: None,
            upgrade_to_old: false,
            memory_pressure: false,
            startup: StartupStatus::Normal,
            sensitive_base: None,
            idle_task: None,
            pause_average: EnumMap::default(),
            young_cycles_before_old: options.young_cycles_before_old,
            native_size_limit: options.native_size_limit,
            heap_growing_factor: options.heap_growing_factor,
            min_old_space_limit: options.min_old_space_limit,
            old_space_size: options.old_space_size,
            max_heap_size: options.old_space_size + 2 * options.young_semispace_size,
            startup_headroom: options.startup_headroom,
            startup_restrain_time: Duration::from_millis(options.startup_restrain_time_ms),
            sensitive_growth_limit: options.sensitive_growth_limit,
            idle_time_limit: Duration::from_millis(options.idle_time_limit_ms),
        }
    }

    pub fn old_limit(&self) -> usize {
        self.old_limit
    }

    pub fn is_old_limit_exceeded(&self, old_bytes: usize) -> bool {
        old_bytes > self.old_limit
    }

    /// The kind of the next local cycle. A postponed heap only collects its young
    /// generation.
    pub fn select_gc_type(&self, old_bytes: usize, native_bytes: usize, postponed: bool) -> GCKind {
        if postponed {
            GCKind::Young
        } else if self.full_requested {
            GCKind::Full
        } else if self.is_old_limit_exceeded(old_bytes)
            || native_bytes > self.native_size_limit
            || self.young_cycles_since_old >= self.young_cycles_before_old
            || self.upgrade_to_old
        {
            GCKind::Old
        } else {
            GCKind::Young
        }
    }

    /// Record a finished young cycle that kept `survived` of `young_bytes`.
    pub fn young_cycle_done(&mut self, survived: usize, young_bytes: usize) {
        self.young_cycles_since_old += 1;
        if young_bytes == 0 {
            return;
        }
        let rate = survived as f64 / young_bytes as f64;
        match self.survival_average {
            Some(average) => {
                // A sudden drop in survival means a generation of objects just died, some
                // of which were likely promoted already.
                if rate < average / 2.0 {
                    debug!("Survival rate {:.3} below half the average {:.3}", rate, average);
                    self.upgrade_to_old = true;
                }
                self.survival_average = Some((average + rate) / 2.0);
            }
            None => self.survival_average = Some(rate),
        }
    }

    fn growing_factor(&self) -> f64 {
        if self.memory_pressure {
            1.0
        } else {
            self.heap_growing_factor
        }
    }

    fn update_old_limit(&mut self) {
        self.old_limit = ((self.last_live_old as f64 * self.growing_factor()) as usize)
            .max(self.min_old_space_limit)
            .min(self.old_space_size);
        trace!("Old space limit is now {} bytes", self.old_limit);
    }

    /// Record a finished old or full cycle. `live` is the marked old space bytes, `free`
    /// and `committed` describe old space after sweeping.
    pub fn marking_cycle_done(&mut self, kind: GCKind, live: usize, free: usize, committed: usize) {
        debug_assert!(kind.is_marking());
        self.young_cycles_since_old = 0;
        self.upgrade_to_old = false;
        self.last_live_old = live;
        self.update_old_limit();
        self.full_requested = kind != GCKind::Full && free > committed / 2;
        if self.full_requested {
            debug!("Old space fragmented ({} of {} bytes free), requesting a full cycle", free, committed);
        }
    }

    /// Record how long a local cycle took.
    pub fn record_pause(&mut self, kind: GCKind, pause: Duration) {
        let average = &mut self.pause_average[kind];
        *average = Some(match *average {
            Some(average) => (average + pause) / 2,
            None => pause,
        });
    }

    /// Under memory pressure limits grow no further than the live bytes.
    pub fn set_memory_pressure(&mut self, pressure: bool) {
        self.memory_pressure = pressure;
        self.update_old_limit();
    }

    pub fn start_startup(&mut self) {
        self.startup = StartupStatus::OnStartup;
    }

    pub fn finish_startup(&mut self, now: Instant) {
        if self.startup == StartupStatus::OnStartup {
            self.startup = StartupStatus::JustFinished {
                until: now + self.startup_restrain_time,
            };
        }
    }

    pub fn startup_status(&self) -> StartupStatus {
        self.startup
    }

    /// Enter or leave a latency-sensitive window. `heap_object_bytes` is the heap size when
    /// the window starts.
    pub fn set_high_sensitive(&mut self, sensitive: bool, heap_object_bytes: usize) {
        self.sensitive_base = sensitive.then_some(heap_object_bytes);
    }

    /// Whether collections other than forced ones should wait. Restraint after startup ends
    /// on its own once its time is up.
    pub fn should_postpone(&mut self, heap_object_bytes: usize, now: Instant) -> bool {
        let nearly_full = heap_object_bytes > self.max_heap_size.saturating_sub(self.startup_headroom);
        match self.startup {
            StartupStatus::OnStartup => {
                if !nearly_full {
                    return true;
                }
            }
            StartupStatus::JustFinished { until } if now < until => {
                let threshold = (self.max_heap_size as f64 * JUST_FINISHED_STARTUP_RATE) as usize;
                if heap_object_bytes <= threshold {
                    return true;
                }
            }
            StartupStatus::JustFinished { .. } => {
                debug!("Startup restraint is over");
                self.startup = StartupStatus::Normal;
            }
            StartupStatus::Normal => {}
        }
        match self.sensitive_base {
            Some(base) => heap_object_bytes < base + self.sensitive_growth_limit && !nearly_full,
            None => false,
        }
    }

    /// Pick the cycle the next idle period should run, unless one is already picked.
    /// `young_free` is the room left in the young generation.
    pub fn schedule_idle_task(&mut self, young_free: usize, old_bytes: usize) -> Option<GCKind> {
        if self.idle_task.is_none() {
            self.idle_task = if old_bytes as f64 >= self.old_limit as f64 * IDLE_OLD_LIMIT_RATE {
                Some(GCKind::Old)
            } else if young_free < IDLE_YOUNG_HEADROOM {
                Some(GCKind::Young)
            } else {
                None
            };
        }
        self.idle_task
    }

    /// The pause the scheduled idle cycle is expected to take.
    pub fn predicted_idle_pause(&self) -> Duration {
        self.idle_task
            .and_then(|kind| self.pause_average[kind])
            .unwrap_or_default()
    }

    /// Take the scheduled idle cycle if an idle period of `idle` fits it.
    pub fn take_idle_task(&mut self, idle: Duration) -> Option<GCKind> {
        let kind = self.idle_task?;
        if idle < self.predicted_idle_pause() && idle < self.idle_time_limit {
            return None;
        }
        self.idle_task = None;
        Some(kind)
    }
}

/// When the shared heap starts a concurrent cycle.
pub(crate) struct SharedTrigger {
    /// Estimated shared object bytes: live bytes after the last cycle plus everything
    /// allocated since.
    estimated_bytes: usize,
    concurrent_limit: usize,
    /// Set once a cycle was asked for. Cleared when a cycle finishes.
    requested: bool,
    heap_growing_factor: f64,
    min_shared_space_limit: usize,
    shared_heap_size: usize,
}

impl SharedTrigger {
    pub fn new(options: &Options) -> Self {
        Self {
            estimated_bytes: 0,
            concurrent_limit: options.min_shared_space_limit.min(options.shared_heap_size),
            requested: false,
            heap_growing_factor: options.heap_growing_factor,
            min_shared_space_limit: options.min_shared_space_limit,
            shared_heap_size: options.shared_heap_size,
        }
    }

    /// Account for a shared allocation. Returns true if a cycle should start, at most once
    /// between two cycles.
    pub fn allocated(&mut self, bytes: usize) -> bool {
        self.estimated_bytes += bytes;
        if self.requested || self.estimated_bytes <= self.concurrent_limit {
            return false;
        }
        self.requested = true;
        true
    }

    pub fn concurrent_limit(&self) -> usize {
        self.concurrent_limit
    }

    pub fn cycle_done(&mut self, live: usize) {
        self.estimated_bytes = live;
        self.requested = false;
        self.concurrent_limit = ((live as f64 * self.heap_growing_factor) as usize)
            .max(self.min_shared_space_limit)
            .min(self.shared_heap_size);
        trace!("Shared concurrent limit is now {} bytes", self.concurrent_limit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::BYTES_IN_MBYTE;

    fn options() -> Options {
        let mut options = Options::default();
        options.min_old_space_limit = 8 * BYTES_IN_MBYTE;
        options.old_space_size = 64 * BYTES_IN_MBYTE;
        options.native_size_limit = BYTES_IN_MBYTE;
        options.young_cycles_before_old = 3;
        options.heap_growing_factor = 2.0;
        options
    }

    #[test]
    fn old_limit_native_pressure_and_young_streaks_select_old() {
        let mut trigger = HeapTrigger::new(&options());
        assert_eq!(trigger.select_gc_type(BYTES_IN_MBYTE, 0, false), GCKind::Young);
        assert_eq!(trigger.select_gc_type(9 * BYTES_IN_MBYTE, 0, false), GCKind::Old);
        assert_eq!(trigger.select_gc_type(0, 2 * BYTES_IN_MBYTE, false), GCKind::Old);
        for _ in 0..3 {
            trigger.young_cycle_done(10, 100);
        }
        assert_eq!(trigger.select_gc_type(0, 0, false), GCKind::Old);
    }

    #[test]
    fn limits_follow_live_bytes() {
        let mut trigger = HeapTrigger::new(&options());
        trigger.marking_cycle_done(GCKind::Old, 20 * BYTES_IN_MBYTE, 0, 24 * BYTES_IN_MBYTE);
        assert_eq!(trigger.old_limit(), 40 * BYTES_IN_MBYTE);
        trigger.marking_cycle_done(GCKind::Old, 60 * BYTES_IN_MBYTE, 0, 64 * BYTES_IN_MBYTE);
        assert_eq!(trigger.old_limit(), 64 * BYTES_IN_MBYTE);
        trigger.marking_cycle_done(GCKind::Old, 0, 0, 0);
        assert_eq!(trigger.old_limit(), 8 * BYTES_IN_MBYTE);
    }

    #[test]
    fn fragmentation_requests_full() {
        let mut trigger = HeapTrigger::new(&options());
        trigger.marking_cycle_done(GCKind::Old, BYTES_IN_MBYTE, 3 * BYTES_IN_MBYTE, 4 * BYTES_IN_MBYTE);
        assert_eq!(trigger.select_gc_type(0, 0, false), GCKind::Full);
        trigger.marking_cycle_done(GCKind::Full, BYTES_IN_MBYTE, 0, BYTES_IN_MBYTE);
        assert_eq!(trigger.select_gc_type(0, 0, false), GCKind::Young);
    }

    #[test]
    fn survival_drop_upgrades_to_old() {
        let mut trigger = HeapTrigger::new(&options());
        trigger.young_cycle_done(50, 100);
        assert_eq!(trigger.select_gc_type(0, 0, false), GCKind::Young);
        trigger.young_cycle_done(10, 100);
        assert_eq!(trigger.select_gc_type(0, 0, false), GCKind::Old);
    }

    #[test]
    fn shared_trigger_counts_allocations_since_the_last_cycle() {
        let mut options = Options::default();
        options.min_shared_space_limit = 1000;
        options.shared_heap_size = 10_000;
        let mut trigger = SharedTrigger::new(&options);
        assert!(!trigger.allocated(600));
        assert!(trigger.allocated(600));
        // Asked once until the cycle is done.
        assert!(!trigger.allocated(600));
        trigger.cycle_done(800);
        assert_eq!(trigger.concurrent_limit(), 1600);
        assert!(!trigger.allocated(700));
        assert!(trigger.allocated(200));
    }

    #[test]
    fn memory_pressure_keeps_limits_at_live_bytes() {
        let mut trigger = HeapTrigger::new(&options());
        trigger.marking_cycle_done(GCKind::Old, 20 * BYTES_IN_MBYTE, 0, 24 * BYTES_IN_MBYTE);
        assert_eq!(trigger.old_limit(), 40 * BYTES_IN_MBYTE);
        trigger.set_memory_pressure(true);
        assert_eq!(trigger.old_limit(), 20 * BYTES_IN_MBYTE);
        trigger.marking_cycle_done(GCKind::Full, 4 * BYTES_IN_MBYTE, 0, 4 * BYTES_IN_MBYTE);
        assert_eq!(trigger.old_limit(), 8 * BYTES_IN_MBYTE);
        trigger.marking_cycle_done(GCKind::Full, 12 * BYTES_IN_MBYTE, 0, 12 * BYTES_IN_MBYTE);
        assert_eq!(trigger.old_limit(), 12 * BYTES_IN_MBYTE);
        trigger.set_memory_pressure(false);
        assert_eq!(trigger.old_limit(), 24 * BYTES_IN_MBYTE);
    }

    #[test]
    fn startup_postpones_until_the_heap_is_nearly_full() {
        let mut options = options();
        options.young_semispace_size = 2 * BYTES_IN_MBYTE;
        options.startup_headroom = 8 * BYTES_IN_MBYTE;
        options.startup_restrain_time_ms = 1000;
        // 64 MiB old space and two 2 MiB halves.
        let max_heap_size = 68 * BYTES_IN_MBYTE;
        let mut trigger = HeapTrigger::new(&options);
        let now = Instant::now();
        assert!(!trigger.should_postpone(40 * BYTES_IN_MBYTE, now));

        trigger.start_startup();
        assert!(trigger.should_postpone(40 * BYTES_IN_MBYTE, now));
        assert!(!trigger.should_postpone(max_heap_size - 4 * BYTES_IN_MBYTE, now));
        assert_eq!(
            trigger.select_gc_type(9 * BYTES_IN_MBYTE, 0, trigger.startup_status() == StartupStatus::OnStartup),
            GCKind::Young
        );

        // Restrained to a quarter of the heap for a while after startup.
        trigger.finish_startup(now);
        assert!(trigger.should_postpone(16 * BYTES_IN_MBYTE, now));
        assert!(!trigger.should_postpone(18 * BYTES_IN_MBYTE, now));
        let later = now + Duration::from_millis(1001);
        assert!(!trigger.should_postpone(16 * BYTES_IN_MBYTE, later));
        assert_eq!(trigger.startup_status(), StartupStatus::Normal);
    }

    #[test]
    fn sensitive_windows_allow_bounded_growth() {
        let mut options = options();
        options.sensitive_growth_limit = 4 * BYTES_IN_MBYTE;
        let mut trigger = HeapTrigger::new(&options);
        let now = Instant::now();
        trigger.set_high_sensitive(true, 10 * BYTES_IN_MBYTE);
        assert!(trigger.should_postpone(13 * BYTES_IN_MBYTE, now));
        assert!(!trigger.should_postpone(14 * BYTES_IN_MBYTE, now));
        trigger.set_high_sensitive(false, 0);
        assert!(!trigger.should_postpone(11 * BYTES_IN_MBYTE, now));
    }

    #[test]
    fn idle_cycles_run_when_the_idle_period_fits() {
        let mut options = options();
        options.idle_time_limit_ms = 50;
        let mut trigger = HeapTrigger::new(&options);
        // Plenty of room: nothing to do while idle.
        assert_eq!(trigger.schedule_idle_task(BYTES_IN_MBYTE, 0), None);
        assert_eq!(trigger.take_idle_task(Duration::from_secs(1)), None);

        trigger.record_pause(GCKind::Young, Duration::from_millis(10));
        trigger.record_pause(GCKind::Young, Duration::from_millis(30));
        assert_eq!(trigger.schedule_idle_task(BYTES_IN_REGION, 0), Some(GCKind::Young));
        assert_eq!(trigger.predicted_idle_pause(), Duration::from_millis(20));
        assert_eq!(trigger.take_idle_task(Duration::from_millis(5)), None);
        assert_eq!(trigger.take_idle_task(Duration::from_millis(20)), Some(GCKind::Young));
        assert_eq!(trigger.take_idle_task(Duration::from_millis(20)), None);

        // Close to the old limit, an old cycle is due. Long idle periods run it even without
        // a pause estimate that fits.
        trigger.record_pause(GCKind::Old, Duration::from_secs(1));
        assert_eq!(trigger.schedule_idle_task(BYTES_IN_MBYTE, 15 * BYTES_IN_MBYTE / 2), Some(GCKind::Old));
        assert_eq!(trigger.take_idle_task(Duration::from_millis(40)), None);
        assert_eq!(trigger.take_idle_task(Duration::from_millis(50)), Some(GCKind::Old));
    }
}
