use crate::config::{InstrumentationConfig, MAP_SIZE};
use crate::relay::TranslationEngine;
use crate::shmem::{SharedMap, ShMemError};
use thiserror::Error;

/// Errors raised during one-time instrumentation setup.
///
/// A failed shared-memory attach is fatal by design: coverage cannot proceed
/// without the bitmap, so the embedder is expected to terminate the process
/// (exit code 1) rather than retry.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("coverage bitmap unavailable: {0}")]
    MapAttach(#[from] ShMemError),
}

/// Per-execution-thread edge state: the scrambled location of the previously
/// executed block. Each engine thread owns exactly one `EdgeState`; sharing
/// one across threads corrupts the recorded coverage graph.
#[derive(Debug, Default)]
pub struct EdgeState {
    prev_loc: usize,
}

impl EdgeState {
    pub fn new() -> Self {
        EdgeState { prev_loc: 0 }
    }

    /// The scrambled previous location, exposed for inspection.
    pub fn prev_loc(&self) -> usize {
        self.prev_loc
    }
}

/// Scrambles a block address into a quasi-uniform bitmap index.
///
/// Deterministic run-to-run so that coverage of the same input is comparable
/// across executions, while spreading the aligned, clustered addresses the
/// translation engine produces.
#[inline]
pub fn scramble(addr: u64) -> usize {
    (((addr >> 4) ^ (addr << 8)) as usize) & (MAP_SIZE - 1)
}

/// Process-owned coverage state: the attached bitmap, the sampling rate and
/// the (inert) code-region bounds. Built once by [`CoverageContext::setup`]
/// before the fork server starts and read-only afterward; per-thread mutable
/// state lives in [`EdgeState`] instead.
pub struct CoverageContext {
    map: Option<SharedMap>,
    inst_rms: usize,
    start_code: u64,
    end_code: u64,
    entry_point: u64,
}

impl CoverageContext {
    /// One-time setup: attaches the shared bitmap if the controller exported
    /// one, derives the sampling rate, widens the code bounds when library
    /// instrumentation is requested, and suppresses the engine's at-fork
    /// hooks so they cannot corrupt state across `fork`.
    ///
    /// With a ratio supplied, bitmap slot 0 is touched so the controller sees
    /// a live target even when the sampling rate is very low.
    pub fn setup(
        config: &InstrumentationConfig,
        engine: &mut dyn TranslationEngine,
    ) -> Result<Self, SetupError> {
        let map = match config.shm_id {
            Some(id) => {
                let map = SharedMap::attach(id)?;
                if config.inst_ratio.is_some() {
                    map.set(0, 1);
                }
                Some(map)
            }
            None => None,
        };
        let (start_code, end_code) = config.code_bounds();
        engine.disable_atfork_hooks();
        Ok(CoverageContext {
            map,
            inst_rms: config.sampling_rate(),
            start_code,
            end_code,
            entry_point: config.entry_point,
        })
    }

    /// Context for a run without an exported bitmap: every logging call is a
    /// no-op and the fork server declines to engage.
    pub fn disabled() -> Self {
        CoverageContext {
            map: None,
            inst_rms: MAP_SIZE,
            start_code: 0,
            end_code: 0,
            entry_point: 0,
        }
    }

    /// Context over an already-attached map, with an explicit sampling rate.
    /// Used by in-process harnesses and tests.
    pub fn with_map(map: SharedMap, inst_rms: usize) -> Self {
        debug_assert!(inst_rms > 0 && inst_rms <= MAP_SIZE);
        CoverageContext {
            map: Some(map),
            inst_rms,
            start_code: 0,
            end_code: 0,
            entry_point: 0,
        }
    }

    /// Whether a bitmap is attached; when false the fork server never
    /// engages and the translation engine runs unmodified.
    pub fn is_active(&self) -> bool {
        self.map.is_some()
    }

    pub fn map(&self) -> Option<&SharedMap> {
        self.map.as_ref()
    }

    pub fn sampling_rate(&self) -> usize {
        self.inst_rms
    }

    /// Configured code-region bounds. Inert: `log_block` does not filter on
    /// them; they exist for embedders that restore the region check.
    pub fn code_bounds(&self) -> (u64, u64) {
        (self.start_code, self.end_code)
    }

    pub fn entry_point(&self) -> u64 {
        self.entry_point
    }

    /// Records execution of the basic block starting at `addr`.
    ///
    /// The scrambled location doubles as the sampling key, so which blocks
    /// are dropped is stable across repeated runs of the same code path. The
    /// directed edge from the thread's previous block is counted with a
    /// byte-wide wrapping counter.
    #[inline]
    pub fn log_block(&self, addr: u64, thread: &mut EdgeState) {
        let Some(map) = &self.map else {
            return;
        };
        let loc = scramble(addr);
        if loc >= self.inst_rms {
            return;
        }
        map.bump(loc ^ thread.prev_loc);
        thread.prev_loc = loc >> 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::NopEngine;

    fn active_context(inst_rms: usize) -> CoverageContext {
        let map = SharedMap::anonymous().expect("mmap failed");
        CoverageContext::with_map(map, inst_rms)
    }

    #[test]
    fn scramble_is_deterministic() {
        for addr in [0u64, 0x400000, 0xdead_beef_0000, u64::MAX] {
            assert_eq!(scramble(addr), scramble(addr));
            assert!(scramble(addr) < MAP_SIZE);
        }
    }

    #[test]
    fn disabled_context_records_nothing() {
        let context = CoverageContext::disabled();
        let mut thread = EdgeState::new();
        context.log_block(0x4000, &mut thread);
        assert!(!context.is_active());
        assert_eq!(thread.prev_loc(), 0, "no-op path must not touch edge state");
    }

    #[test]
    fn first_block_is_recorded_against_edge_zero() {
        let context = active_context(MAP_SIZE);
        let mut thread = EdgeState::new();
        let addr = 0x0040_1000;
        context.log_block(addr, &mut thread);

        let loc = scramble(addr);
        let map = context.map().unwrap();
        assert_eq!(map.get(loc ^ 0), 1);
        assert_eq!(thread.prev_loc(), loc >> 1);
    }

    #[test]
    fn prev_loc_is_half_of_current_regardless_of_history() {
        let context = active_context(MAP_SIZE);
        let mut thread = EdgeState::new();
        context.log_block(0x1111_2220, &mut thread);
        context.log_block(0x0040_1000, &mut thread);
        assert_eq!(thread.prev_loc(), scramble(0x0040_1000) >> 1);
    }

    #[test]
    fn sampling_skips_locations_at_or_above_rate() {
        let addr = 0x0040_1000;
        let loc = scramble(addr);
        assert!(loc > 0, "test address must scramble to a non-zero slot");

        // Rate just above the slot: recorded.
        let context = active_context(loc + 1);
        let mut thread = EdgeState::new();
        context.log_block(addr, &mut thread);
        assert_eq!(context.map().unwrap().get(loc), 1);
        assert_eq!(thread.prev_loc(), loc >> 1);

        // Rate equal to the slot: skipped, edge state untouched.
        let context = active_context(loc);
        let mut thread = EdgeState::new();
        context.log_block(addr, &mut thread);
        assert_eq!(context.map().unwrap().count_nonzero(), 0);
        assert_eq!(thread.prev_loc(), 0);
    }

    #[test]
    fn full_rate_records_every_scrambled_address() {
        let context = active_context(MAP_SIZE);
        let mut thread = EdgeState::new();
        for addr in (0..64u64).map(|i| 0x1000 + i * 16) {
            context.log_block(addr, &mut thread);
        }
        assert!(context.map().unwrap().count_nonzero() > 0);
    }

    #[test]
    fn repeated_edge_wraps_counter_at_256() {
        let context = active_context(MAP_SIZE);
        let mut thread = EdgeState::new();
        let addr = 0x0040_1000;
        let loc = scramble(addr);
        assert!(loc >> 1 != 0, "need a self-edge distinct from the first edge");

        // First call hits loc ^ 0; every later call hits the same self-edge.
        context.log_block(addr, &mut thread);
        for _ in 0..256 {
            context.log_block(addr, &mut thread);
        }
        let map = context.map().unwrap();
        assert_eq!(map.get(loc ^ (loc >> 1)), 0, "256 identical edges wrap to zero");
        assert_eq!(map.get(loc), 1);
    }

    #[test]
    fn threads_track_edges_independently() {
        let context = active_context(MAP_SIZE);
        let mut thread_a = EdgeState::new();
        let mut thread_b = EdgeState::new();
        context.log_block(0x1000, &mut thread_a);
        context.log_block(0x2000, &mut thread_b);
        assert_eq!(thread_a.prev_loc(), scramble(0x1000) >> 1);
        assert_eq!(thread_b.prev_loc(), scramble(0x2000) >> 1);
    }

    #[test]
    fn setup_attaches_exported_segment_and_touches_slot_zero() {
        let (id, controller_view) = SharedMap::create().expect("shmget failed");
        let config = InstrumentationConfig {
            shm_id: Some(id),
            inst_ratio: Some(10),
            ..Default::default()
        };
        let context =
            CoverageContext::setup(&config, &mut NopEngine).expect("setup must attach the segment");
        assert!(context.is_active());
        assert_eq!(context.sampling_rate(), MAP_SIZE / 10);
        assert_eq!(
            controller_view.get(0),
            1,
            "slot 0 must be touched as a liveness signal when a ratio is set"
        );
    }

    #[test]
    fn setup_without_shm_id_disables_coverage() {
        let config = InstrumentationConfig::default();
        let context = CoverageContext::setup(&config, &mut NopEngine).expect("setup cannot fail");
        assert!(!context.is_active());
    }

    #[test]
    fn setup_fails_on_bogus_segment() {
        let config = InstrumentationConfig {
            shm_id: Some(-3),
            ..Default::default()
        };
        assert!(CoverageContext::setup(&config, &mut NopEngine).is_err());
    }
}
