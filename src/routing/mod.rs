//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Route Compilation (at startup):
//!     ServiceSchema (JSON per service)
//!     → schema.rs (deserialize)
//!     → path.rs (parse patterns), fields.rs (field maps per method)
//!     → router.rs (insert into per-method tries, reject conflicts)
//!     → Freeze as immutable RouteTable behind an ArcSwap
//!
//! Incoming Request (method, path)
//!     → router.rs (trie lookup, parameter extraction)
//!     → Return: RouteMatch or NoMatch
//! ```
//!
//! # Design Decisions
//! - Routes compiled at startup, immutable at runtime
//! - No regex in hot path (segment tries only)
//! - Deterministic: same input always matches same route

pub mod fields;
pub mod path;
pub mod router;
pub mod schema;

pub use router::{Exposure, RouteDescriptor, RouteError, RouteMatch, RouteSummary, RouteTable};
pub use schema::ServiceSchema;
