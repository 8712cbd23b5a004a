//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! fleetd.toml (TOML)                 infra.json (JSON, $env indirections)
//!     → loader.rs (parse)                → loader.rs (parse)
//!     → validation.rs (semantic checks)  │
//!     └──────────────┬───────────────────┘
//!                    → resolve.rs (secrets, PEM, URLs, cross-checks)
//!                    → ResolvedConfig (immutable)
//!                    → distribute.rs builds each replica's environment
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a full restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Every error is reported with its field path, all at once

pub mod distribute;
pub mod infra;
pub mod loader;
pub mod resolve;
pub mod schema;
pub mod secrets;
pub mod validation;

pub use infra::{InfraConfig, InfraDocument, ShutdownPolicy};
pub use loader::{load_config, load_resolved, ConfigError};
pub use resolve::ResolvedConfig;
pub use schema::{FleetConfig, GatewayConfig, ListenerConfig, ServiceConfig};
pub use secrets::{EnvSource, ProcessEnv, Secret, SecretRef};
pub use validation::ValidationError;
