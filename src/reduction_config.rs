//! A global store of flags that can impact reduction.
//!
//! WARNING: Currently only supports a single consistent configuration amongst threads (i.e., cannot
//! have different configurations for different reduction executions in the same process).

/// The global configuration store. Its fields are expected to be accessed across the program via
/// the global [`CONFIG`](static@CONFIG).
pub struct ReductionConfig {
    /// Run forward value propagation and substitute propagated values into downstream reads.
    /// Without this, every low-level read survives into the high-level tree verbatim.
    pub propagate_values: bool,
    /// Run backward liveness analysis and drop assignments it proves dead. Without this, only
    /// the def-use evidence imported from the decoder decides retention.
    pub eliminate_dead_assignments: bool,
    /// Log every keep/drop decision the reduction pass makes (useful when debugging).
    pub trace_reduction_decisions: bool,
    /// Report dropped provenance facts at warning rather than debug level.
    pub warn_on_resolution_miss: bool,
    /// Verify that re-encoding a just-decoded document reproduces it byte-for-byte.
    pub verify_round_trip_on_decode: bool,
}

impl ReductionConfig {
    /// Internal method: sets up initialization
    #[allow(static_mut_refs)]
    fn from_initialized() -> Self {
        let init = unsafe {
            INTERNAL_CONFIG_INITIALIZER
                .take()
                .expect("Should be initialized only once")
        };
        init.unwrap_or_default()
    }

    /// Initialize with the given command line configuration. Should only be called once, and should
    /// only be called from `main`.
    #[allow(static_mut_refs)]
    pub fn initialize(command_line_config: Vec<CommandLineReductionConfig>) {
        let prev = unsafe { INTERNAL_CONFIG_INITIALIZER.replace(Some(command_line_config.into())) };
        assert!(prev.is_some(), "Performed double initialization");
        lazy_static::initialize(&CONFIG);
    }
}

/// Internal initialization detail.
static mut INTERNAL_CONFIG_INITIALIZER: Option<Option<ReductionConfig>> = Some(None);

lazy_static::lazy_static! {
    /// The global configuration store
    pub static ref CONFIG: ReductionConfig = ReductionConfig::from_initialized();
}

#[derive(clap::ArgEnum, Clone, Debug)]
/// Reduction configuration parameters
pub enum CommandLineReductionConfig {
    DisableValuePropagation,
    DisableDeadAssignmentElimination,
    EnableTraceReductionDecisions,
    EnableWarnOnResolutionMiss,
    DisableRoundTripVerification,
}

impl Default for ReductionConfig {
    fn default() -> Self {
        ReductionConfig {
            propagate_values: true,
            eliminate_dead_assignments: true,
            trace_reduction_decisions: false,
            warn_on_resolution_miss: false,
            verify_round_trip_on_decode: true,
        }
    }
}

impl From<Vec<CommandLineReductionConfig>> for ReductionConfig {
    fn from(v: Vec<CommandLineReductionConfig>) -> Self {
        use CommandLineReductionConfig::*;
        let mut r = ReductionConfig::default();
        for v in v {
            match v {
                DisableValuePropagation => {
                    r.propagate_values = false;
                }
                DisableDeadAssignmentElimination => {
                    r.eliminate_dead_assignments = false;
                }
                EnableTraceReductionDecisions => {
                    r.trace_reduction_decisions = true;
                }
                EnableWarnOnResolutionMiss => {
                    r.warn_on_resolution_miss = true;
                }
                DisableRoundTripVerification => {
                    r.verify_round_trip_on_decode = false;
                }
            }
        }
        r
    }
}
