//! HTTP gateway subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (Axum setup, listeners, proxy handler)
//!     → request.rs (request ID, reserved header stripping)
//!     → cors.rs (preflight answers, response headers)
//!     → auth.rs (auth handler call for protected routes)
//!     → [registry selects a target]
//!     → response.rs (hop-by-hop removal, cookie attributes)
//!     → Send to client
//! ```

pub mod auth;
pub mod cors;
pub mod error;
pub mod request;
pub mod response;
pub mod server;

pub use error::GatewayError;
pub use request::X_REQUEST_ID;
pub use server::{Gateway, GatewayHandle, GatewayState, HttpClient};
