use std::env;

/// Size of the shared coverage bitmap, in bytes. Fixed for the lifetime of a
/// fuzzing campaign; every bitmap index is taken modulo this value.
pub const MAP_SIZE: usize = 1 << 16;

/// Environment variable carrying the SysV shared-memory id of the coverage
/// bitmap. Absent means "instrumentation disabled": coverage logging becomes
/// a no-op and the fork server never engages.
pub const SHM_ENV_VAR: &str = "__AFL_SHM_ID";

/// Environment variable carrying the instrumentation ratio, a percentage in
/// 1..=100 of scrambled locations eligible for coverage recording.
pub const INST_RATIO_ENV_VAR: &str = "AFL_INST_RATIO";

/// Environment variable toggling library instrumentation. When present, the
/// code-region bounds are widened to cover the entire address space.
pub const INST_LIBS_ENV_VAR: &str = "AFL_INST_LIBS";

/// Inputs consumed once at setup time, read-only afterward.
///
/// `shm_id` and `inst_ratio` come from the controller through the
/// environment; the code-region bounds and entry point are injected by the
/// program loader of the embedding translation engine.
#[derive(Debug, Clone, Default)]
pub struct InstrumentationConfig {
    /// Shared-memory id of the coverage bitmap, if the controller exported one.
    pub shm_id: Option<i32>,
    /// Raw instrumentation ratio as supplied, before clamping.
    pub inst_ratio: Option<u32>,
    /// Widen the code-region bounds to the whole address space.
    pub instrument_libs: bool,
    /// Start of the instrumented code region.
    pub start_code: u64,
    /// End of the instrumented code region.
    pub end_code: u64,
    /// Address at which the fork server engages.
    pub entry_point: u64,
}

impl InstrumentationConfig {
    /// Reads the controller-supplied inputs from the environment. The
    /// loader-supplied fields are left at their defaults and can be filled in
    /// by the embedder afterwards.
    pub fn from_env() -> Self {
        InstrumentationConfig {
            shm_id: env::var(SHM_ENV_VAR).ok().map(|s| leading_int(&s) as i32),
            inst_ratio: env::var(INST_RATIO_ENV_VAR).ok().map(|s| leading_int(&s) as u32),
            instrument_libs: env::var(INST_LIBS_ENV_VAR).is_ok(),
            start_code: 0,
            end_code: 0,
            entry_point: 0,
        }
    }

    /// Sampling rate derived from the instrumentation ratio, in units of
    /// `MAP_SIZE`. The ratio is clamped so that 0 behaves as 1 and values
    /// above 100 behave as 100; without a ratio the full map is sampled.
    /// Always in `1..=MAP_SIZE`.
    pub fn sampling_rate(&self) -> usize {
        match self.inst_ratio {
            Some(ratio) => {
                let ratio = ratio.clamp(1, 100) as usize;
                MAP_SIZE * ratio / 100
            }
            None => MAP_SIZE,
        }
    }

    /// Code-region bounds after applying the library-instrumentation toggle.
    ///
    /// The bounds are inert configuration: the active logging path records
    /// every block regardless of region. They are kept configurable for
    /// embedders that restore the filter.
    pub fn code_bounds(&self) -> (u64, u64) {
        if self.instrument_libs {
            (0, u64::MAX)
        } else {
            (self.start_code, self.end_code)
        }
    }
}

/// Parses the leading decimal digits of `s`, ignoring any trailing garbage.
/// Matches C `atoi` semantics for the values the controller actually sends:
/// a non-numeric string is 0, which the ratio clamp then maps to 1.
fn leading_int(s: &str) -> u64 {
    let digits: String = s.trim_start().chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().unwrap_or(0)
}
