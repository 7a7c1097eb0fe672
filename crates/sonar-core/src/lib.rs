//! # Sonar Core
//!
//! Event model, network types and collaborator traits for the Sonar
//! diagnostic event store.
//!
//! Producers describe what happened in the instrumented process as
//! [`Event`] values. The storage engine in `sonar-storage` consumes them;
//! everything in this crate is plain data plus the traits the engine uses
//! to reach its external collaborators.
//!
//! ## Key Types
//!
//! - [`Event`]: Tagged union of log messages and network task lifecycle steps
//! - [`NetworkRequest`], [`NetworkResponse`], [`NetworkMetrics`]: Network task payloads
//! - [`Level`]: Message severity (trace through critical)
//! - [`SessionId`], [`TaskId`]: Stable identifiers
//! - [`RedactionPolicy`]: Header, query and body scrubbing applied before persistence
//!
//! ## Key Traits
//!
//! - [`Clock`]: Time abstraction for testability
//! - [`MetadataProvider`]: App and device information embedded in exports

pub mod error;
pub mod event;
pub mod ids;
pub mod level;
pub mod network;
pub mod redaction;
pub mod traits;

// Re-export main types
pub use error::*;
pub use event::*;
pub use ids::*;
pub use level::*;
pub use network::*;
pub use redaction::*;
pub use traits::*;
