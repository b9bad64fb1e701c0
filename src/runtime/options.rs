// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::std::env;

//==============================================================================
// Structures
//==============================================================================

/// Process-wide runtime options, read from the environment at initialization
/// time. Every worker of a launch must observe identical values, as several of
/// them size collective shared-memory segments.
#[derive(Debug, Clone)]
pub struct Options {
    /// Per-worker call-stack reservation (bytes).
    pub stack_size: usize,
    /// Maximum distribution-tree depth (also the number of flipper bits used).
    pub adws_max_depth: usize,
    /// Per-level work-stealing queue capacity (entries).
    pub adws_wsqueue_capacity: usize,
    /// Pool size of the thread-state allocator (bytes).
    pub thread_state_allocator_size: usize,
    /// Pool size of the suspended-thread allocator (bytes).
    pub suspended_thread_allocator_size: usize,
    /// Width below which a distribution range is snapped to a rank boundary.
    pub adws_min_drange_size: f64,
    /// Maximum steal attempts per distribution-tree lookup.
    pub adws_max_dtree_reuse: usize,
    /// Enables work stealing.
    pub adws_enable_steal: bool,
    /// Yields the processor on every scheduler-loop iteration.
    pub sched_loop_make_progress: bool,
    /// Pool size of the global heap (bytes, per worker).
    pub global_heap_size: usize,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl Options {
    /// Reads runtime options from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            stack_size: parse_usize("SPINDLE_STACK_SIZE", 2 * 1024 * 1024),
            adws_max_depth: parse_usize("SPINDLE_ADWS_MAX_DEPTH", 20),
            adws_wsqueue_capacity: parse_usize("SPINDLE_ADWS_WSQUEUE_CAPACITY", 1024),
            thread_state_allocator_size: parse_usize("SPINDLE_THREAD_STATE_ALLOCATOR_SIZE", 2 * 1024 * 1024),
            suspended_thread_allocator_size: parse_usize("SPINDLE_SUSPENDED_THREAD_ALLOCATOR_SIZE", 2 * 1024 * 1024),
            adws_min_drange_size: parse_f64("SPINDLE_ADWS_MIN_DRANGE_SIZE", 0.01),
            adws_max_dtree_reuse: parse_usize("SPINDLE_ADWS_MAX_DTREE_REUSE", 10),
            adws_enable_steal: parse_bool("SPINDLE_ADWS_ENABLE_STEAL", true),
            sched_loop_make_progress: parse_bool("SPINDLE_SCHED_LOOP_MAKE_PROGRESS", false),
            global_heap_size: parse_usize("SPINDLE_GLOBAL_HEAP_SIZE", 16 * 1024 * 1024),
        }
    }
}

//==============================================================================
// Standalone Functions
//==============================================================================

fn parse_usize(name: &str, default: usize) -> usize {
    match env::var(name) {
        Ok(s) => s
            .parse()
            .unwrap_or_else(|_| panic!("malformed value for {} (got {:?})", name, s)),
        Err(_) => default,
    }
}

fn parse_f64(name: &str, default: f64) -> f64 {
    match env::var(name) {
        Ok(s) => s
            .parse()
            .unwrap_or_else(|_| panic!("malformed value for {} (got {:?})", name, s)),
        Err(_) => default,
    }
}

fn parse_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(s) => match s.as_str() {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" => false,
            _ => panic!("malformed value for {} (got {:?})", name, s),
        },
        Err(_) => default,
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::Options;

    /// Tests that defaults are sane when no environment overrides are set.
    #[test]
    fn defaults() {
        let opts: Options = Options::from_env();
        assert!(opts.stack_size > 0);
        assert!(opts.adws_max_depth > 0 && opts.adws_max_depth <= 64);
        assert!(opts.adws_wsqueue_capacity.is_power_of_two());
        assert!(opts.adws_min_drange_size > 0.0);
        assert!(opts.adws_max_dtree_reuse >= 1);
    }
}
