pub mod loader;
pub mod schema;

pub use loader::{load_config, load_config_from_str, load_worker_config, validate_config};
pub use schema::{
    EngineConfig, LimitsConfig, MediaConfig, ObjectStoreConfig, OutputConfig, ProgressConfig,
    StagingConfig, WorkerConfig,
};
