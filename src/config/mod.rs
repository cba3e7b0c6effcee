//! Configuration for audio-gate.
//!
//! Configuration is a single immutable [`SecurityConfig`] snapshot created at
//! startup. A configuration change requires constructing a new snapshot; it
//! is never mutated while runs are in flight.
//!
//! Sources are merged in order:
//!
//! 1. Embedded defaults (compiled into the binary)
//! 2. System config: `/etc/audio-gate/config.toml`
//! 3. User config: `~/.config/audio-gate/config.toml`
//! 4. Additional config file (via `--config` flag)
//!
//! Lists (allowed hosts, extra patterns) are **merged** (appended).
//! Scalars are **overridden** when non-default.

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::{ConfigLoader, SYSTEM_CONFIG_PATH};
pub use schema::{
    AdmissionConfig, FetchConfig, GeneralConfig, InjectionConfig, LimitsConfig, MonitorConfig,
    OutputConfig, ProcessConfig, SandboxStrategyConfig, SecurityConfig,
};
