//! Config module.
//! Provides the environment configuration types, default paths and XML loading.

pub mod paths;
pub mod types;
pub mod xml;

pub use paths::{CONFIG_ENV_VAR, default_config_path};
pub use types::{EnvConfig, LogLevel};
pub use xml::{load_config, load_config_from_xml_path};

/// Worker count each priority class starts with when nothing is configured.
pub const DEFAULT_THREADS: usize = 1;
