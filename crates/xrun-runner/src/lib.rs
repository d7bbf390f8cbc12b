pub mod config;
pub mod coordinator;
pub mod external;
pub mod rundir;
pub mod supervise;
pub mod task;

pub use config::{load_config, RunConfig};
pub use coordinator::{
    load_manifest, BatchOutcome, Ensemble, EnsembleBuilder, Manifest, RunRequest,
    DEFAULT_TIMEOUT, MANIFEST_FILE, PARAMS_FILE,
};
pub use external::{ExternalModel, ExternalModelConfig, ExternalModelFactory, ParamsFileConfig, ParamsFileFormat};
pub use rundir::{autofolder, RundirMode, RundirResolver, DEFAULT_RUNDIR};
pub use supervise::{write_member_status, STATUS_FILE, STDERR_FILE, STDOUT_FILE};
pub use task::{CancelFlag, RunOutcome, RunTask};
