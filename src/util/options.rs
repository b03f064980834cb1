use crate::util::constants::*;
use std::default::Default;

/// The default size of one young half-generation.
pub const DEFAULT_YOUNG_SEMISPACE_SIZE: usize = 2 << LOG_BYTES_IN_MBYTE;
/// The default capacity of the old space of one heap (old, non-movable and huge together).
pub const DEFAULT_OLD_SPACE_SIZE: usize = 256 << LOG_BYTES_IN_MBYTE;
/// The default capacity of the shared heap.
pub const DEFAULT_SHARED_HEAP_SIZE: usize = 256 << LOG_BYTES_IN_MBYTE;
/// The default budget of memory mapped for regions across the whole process.
pub const DEFAULT_MAX_COMMITTED_MEMORY: usize = 1024 << LOG_BYTES_IN_MBYTE;
/// Objects of this size or larger get their own region by default.
pub const DEFAULT_HUGE_OBJECT_THRESHOLD: usize = BYTES_IN_REGION / 2;

fn always_valid<T>(_: &T) -> bool {
    true
}

fn is_rate(v: &f64) -> bool {
    *v > 0.0 && *v <= 1.0
}

macro_rules! options {
    ($($(#[$outer:meta])* $name:ident: $type:ty[$validator:expr] = $default:expr),*,) => [
        options!($($(#[$outer])* $name: $type[$validator] = $default),*);
    ];
    ($($(#[$outer:meta])* $name:ident: $type:ty[$validator:expr] = $default:expr),*) => [
        /// Runtime-tunable parameters of the collector. Every option can be set from the
        /// environment with the `ISOHEAP_` prefix (e.g. `ISOHEAP_PROMOTION_AGE=3`).
        #[derive(Clone, Debug)]
        pub struct Options {
            $($(#[$outer])* pub $name: $type),*
        }
        impl Options {
            /// Set an option by name. Returns false (and keeps the old value) if the value
            /// cannot be parsed or is invalid.
            pub fn set_from_str(&mut self, s: &str, val: &str) -> bool {
                match s {
                    // Parse the given value from str (by env vars or by calling set_from_str()) to the right type
                    $(stringify!($name) => if let Ok(ref val) = val.parse::<$type>() {
                        // Validate
                        let validate_fn = $validator;
                        let is_valid = validate_fn(val);
                        if is_valid {
                            // Only set value if valid.
                            self.$name = val.clone();
                        } else {
                            warn!("Unable to set {}={:?}. Invalid value. Default value will be used.", s, val);
                        }
                        is_valid
                    } else {
                        warn!("Unable to set {}={:?}. Cant parse value. Default value will be used.", s, val);
                        false
                    })*
                    _ => panic!("Invalid Options key: {}", s)
                }
            }
        }
        impl Default for Options {
            fn default() -> Self {
                let mut options = Options {
                    $($name: $default),*
                };

                // If we have env vars that start with ISOHEAP_ and match any option (such as ISOHEAP_THREADS),
                // we set the option to its value (if it is a valid value). Otherwise, use the default value.
                const PREFIX: &str = "ISOHEAP_";
                for (key, val) in std::env::vars() {
                    // strip the prefix, and get the lower case string
                    if let Some(rest_of_key) = key.strip_prefix(PREFIX) {
                        let lowercase: &str = &rest_of_key.to_lowercase();
                        match lowercase {
                            $(stringify!($name) => { options.set_from_str(lowercase, &val); },)*
                            _ => {}
                        }
                    }
                }
                options
            }
        }
    ]
}

options! {
    /// Number of worker pool threads.
    threads:                    usize [|v: &usize| *v > 0] = num_cpus::get(),
    /// Size of one young half-generation in bytes.
    young_semispace_size:       usize [|v: &usize| *v >= BYTES_IN_REGION] = DEFAULT_YOUNG_SEMISPACE_SIZE,
    /// Capacity of a heap's old, non-movable and huge spaces together.
    old_space_size:             usize [|v: &usize| *v >= BYTES_IN_REGION] = DEFAULT_OLD_SPACE_SIZE,
    /// Capacity of the shared heap.
    shared_heap_size:           usize [|v: &usize| *v >= BYTES_IN_REGION] = DEFAULT_SHARED_HEAP_SIZE,
    /// Budget of mapped region memory across the process.
    max_committed_memory:       usize [|v: &usize| *v >= BYTES_IN_REGION] = DEFAULT_MAX_COMMITTED_MEMORY,
    /// Young cycles an object survives before it is promoted.
    promotion_age:              u8    [|v: &u8| *v >= 1] = 2,
    /// Objects at or above this size (header included) go to the huge-object space.
    huge_object_threshold:      usize [|v: &usize| *v >= MIN_FREE_CELL_SIZE && *v <= MAX_REGULAR_OBJECT_SIZE] = DEFAULT_HUGE_OBJECT_THRESHOLD,
    /// Shared regions whose live fraction is below this are partial collection candidates.
    partial_live_rate:          f64   [is_rate] = 0.3,
    /// Candidates needed before a partial shared collection is worth starting.
    min_partial_regions:        usize [|v: &usize| *v > 0] = 2,
    /// Upper bound of the partial collect set.
    max_partial_regions:        usize [|v: &usize| *v > 0] = 64,
    /// Old regions whose live fraction is below this are compacted by a full cycle.
    compact_live_rate:          f64   [is_rate] = 0.5,
    /// Young regions at least this live are moved to old space wholesale by old/full cycles.
    region_promotion_live_rate: f64   [|v: &f64| *v > 0.0] = 0.8,
    /// Young cycles in a row before the next cycle is upgraded to an old cycle.
    young_cycles_before_old:    usize [|v: &usize| *v > 0] = 8,
    /// Growth of the old/shared limits relative to live bytes after a cycle.
    heap_growing_factor:        f64   [|v: &f64| *v >= 1.0] = 2.0,
    /// Lower bound of the old space trigger limit.
    min_old_space_limit:        usize [always_valid] = 8 << LOG_BYTES_IN_MBYTE,
    /// Lower bound of the shared heap trigger limit.
    min_shared_space_limit:     usize [always_valid] = 8 << LOG_BYTES_IN_MBYTE,
    /// Externally attached native bytes that make the next cycle an old cycle.
    native_size_limit:          usize [always_valid] = 64 << LOG_BYTES_IN_MBYTE,
    /// Collect the shared heap concurrently on its daemon thread.
    concurrent_marking:         bool  [always_valid] = true,
    /// Use worker pool threads in parallel phases.
    parallel_gc:                bool  [always_valid] = true,
    /// Run the heap verifier before and after every cycle.
    verify_heap:                bool  [always_valid] = false,
    /// Barrier-greyed objects tolerated during concurrent marking before the final
    /// pause restarts marking stop-the-world.
    marking_buffer_limit:       usize [|v: &usize| *v > 0] = 1 << 16,
    /// Released single-unit regions kept mapped for reuse.
    region_cache_size:          usize [always_valid] = 16,
    /// During startup, collections other than forced ones wait until heap objects come
    /// this close to the heap size.
    startup_headroom:           usize [always_valid] = 8 << LOG_BYTES_IN_MBYTE,
    /// How long after startup collections stay restrained to a quarter of the heap size.
    startup_restrain_time_ms:   u64   [always_valid] = 6000,
    /// Heap object bytes a latency-sensitive window may add before collections resume.
    sensitive_growth_limit:     usize [always_valid] = 40 << LOG_BYTES_IN_MBYTE,
    /// Idle periods at least this long run the scheduled idle collection even if it is
    /// predicted to take longer.
    idle_time_limit_ms:         u64   [always_valid] = 10,
}
