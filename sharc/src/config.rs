//! A global store of flags that can impact the analysis.
//!
//! WARNING: Currently only supports a single consistent configuration amongst
//! threads (i.e., cannot have different configurations for different analyses
//! in the same process).

/// The global configuration store. Its fields are expected to be accessed
/// across the program via the global [`CONFIG`](static@CONFIG).
pub struct AnalysisConfig {
    /// Fold chains of singly-linked nodes into SLS segments. Disabling this
    /// makes loops over singly-linked lists diverge state-wise, so it exists
    /// for debugging only.
    pub enable_sls_abstraction: bool,
    /// Fold chains of doubly-linked nodes into DLS segments.
    pub enable_dls_abstraction: bool,
    /// Emit a plot of every heap at every location of the assembled fixed
    /// point, not only the exit states.
    pub plot_everything: bool,
    /// Re-check cheap structural invariants (usage counts, segment neqs)
    /// after every abstraction step.
    pub self_check: bool,
}

impl AnalysisConfig {
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

    /// Initialize with the given command line configuration. Should only be
    /// called once, and should only be called from `main`.
    #[allow(static_mut_refs)]
    pub fn initialize(command_line_config: Vec<CommandLineAnalysisConfig>) {
        let prev = unsafe { INTERNAL_CONFIG_INITIALIZER.replace(Some(command_line_config.into())) };
        assert!(prev.is_some(), "Performed double initialization");
        lazy_static::initialize(&CONFIG);
    }
}

/// Internal initialization detail.
static mut INTERNAL_CONFIG_INITIALIZER: Option<Option<AnalysisConfig>> = Some(None);

lazy_static::lazy_static! {
    /// The global configuration store
    pub static ref CONFIG: AnalysisConfig = AnalysisConfig::from_initialized();
}

/// Analysis configuration parameters
#[derive(clap::ArgEnum, Clone, Debug)]
pub enum CommandLineAnalysisConfig {
    DisableSlsAbstraction,
    DisableDlsAbstraction,
    EnablePlotEverything,
    EnableSelfCheck,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            enable_sls_abstraction: true,
            enable_dls_abstraction: true,
            plot_everything: false,
            self_check: false,
        }
    }
}

impl From<Vec<CommandLineAnalysisConfig>> for AnalysisConfig {
    fn from(v: Vec<CommandLineAnalysisConfig>) -> Self {
        use CommandLineAnalysisConfig::*;
        let mut r = AnalysisConfig::default();
        for v in v {
            match v {
                DisableSlsAbstraction => {
                    r.enable_sls_abstraction = false;
                }
                DisableDlsAbstraction => {
                    r.enable_dls_abstraction = false;
                }
                EnablePlotEverything => {
                    r.plot_everything = true;
                }
                EnableSelfCheck => {
                    r.self_check = true;
                }
            }
        }
        r
    }
}
