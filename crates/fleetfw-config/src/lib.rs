mod raw;
mod loader;
pub mod error;

pub use error::ConfigError;
pub use loader::{
    load_config, load_hosts, load_plan, OrchestratorConfig, TimeoutConfig, TlsConfig,
    DEFAULT_CATALOG_URL,
};
