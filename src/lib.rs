//! fleetd: a local process supervisor with a routing HTTP gateway.
//!
//! # Architecture Overview
//!
//! ```text
//!                  ┌───────────────────────────────────────────────────────┐
//!                  │                        FLEETD                         │
//!                  │                                                       │
//!   Client ───────▶│  http::server ──▶ routing ──▶ registry ──▶ proxy ─────┼──▶ replica
//!                  │   (cors, auth)    (table)     (balance)               │    process
//!                  │                                  ▲                    │       ▲
//!                  │                                  │ register           │       │
//!                  │  config ──▶ distribute ──▶ supervisor ─── spawn ──────┼───────┘
//!                  │  (infra, secrets)          (restart, readiness)       │
//!                  │                                                       │
//!                  │  lifecycle: startup, signals, phased shutdown         │
//!                  │  health: active checks   observability   admin API    │
//!                  └───────────────────────────────────────────────────────┘
//! ```

pub mod admin;
pub mod config;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod load_balancer;
pub mod net;
pub mod observability;
pub mod registry;
pub mod routing;
pub mod supervisor;

pub use config::schema::FleetConfig;
pub use http::Gateway;
pub use lifecycle::{Fleet, ShutdownCoordinator};
