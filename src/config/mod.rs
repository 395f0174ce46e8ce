//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → RuntimeConfig (validated, immutable)
//!     → RuntimeBuilder combines it with caller-supplied collaborators
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; there is no hot reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::RuntimeConfig;
pub use schema::{
    DemuxConfig, FeatureConfig, GatewayConfig, ListenerConfig, ObservabilityConfig,
    RegistrationConfig, ServiceConfig, ShutdownConfig, TlsConfig, WebConfig,
};
pub use validation::{validate_config, ValidationError};
