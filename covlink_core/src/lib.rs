//! Runtime core of a coverage-guided fuzzing instrumentation layer for a
//! dynamic binary-translation engine.
//!
//! Three cooperating pieces, coordinated over fixed-size binary messages:
//! an AFL-style fork server ([`forkserver`]) that lets an external controller
//! trigger cheap re-executions of the target, a shared-bitmap coverage
//! logger ([`coverage`]) recording executed control-flow edges, and an
//! advisory translation-cache relay ([`relay`]) that keeps the long-lived
//! parent's translation cache warm across forks. The translation engine
//! itself stays behind the narrow [`relay::TranslationEngine`] seam.

pub mod config;
pub mod coverage;
pub mod forkserver;
pub mod relay;
pub mod shmem;

pub use config::{InstrumentationConfig, MAP_SIZE, SHM_ENV_VAR};
pub use coverage::{CoverageContext, EdgeState, SetupError};
pub use forkserver::{ControlChannel, FORKSRV_FD, FatalExit, ForkRole, ForkServer, TSL_FD};
pub use relay::{RelayEmitter, TranslationEngine, TslMessage};
pub use shmem::{SharedMap, ShMemError};
