//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → tls.rs (optional TLS handshake, certificate loading)
//!     → Hand off to HTTP layer
//!     → connection.rs (in-flight request tracking for drain)
//! ```
//!
//! # Design Decisions
//! - Each request tracked until its response body finishes
//! - TLS is optional and handled transparently
//! - PEM material is validated before anything is started

pub mod connection;
pub mod tls;
