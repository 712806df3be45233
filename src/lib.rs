//! Core engine for an AI-assisted engineering workflow orchestrator: a
//! story moves through a fixed stage pipeline (preparing, clarifying,
//! planning, designing, coding, verifying, done), driven by background
//! AI invocations fanned out over SSE, against a pluggable capability
//! registry for the AI/SCM/CI/doc/sandbox/notification services each
//! stage needs.
//!
//! [`Orchestrator`] is the public façade: construct one over a
//! [`PersistenceGateway`] and a [`CapabilityRegistry`], then drive it
//! through its operation methods (`create_project`, `create_story`,
//! `confirm_stage`, `chat`, ...). The optional `http-server` feature
//! exposes the same operations over an axum router in [`http`].

pub mod capability;
pub mod config;
pub mod error;
pub mod executor;
pub mod hashing;
#[cfg(feature = "http-server")]
pub mod http;
pub mod model;
pub mod orchestrator;
pub mod persistence;
pub mod prompt;
pub mod providers;
pub mod secret;
pub mod sse;
pub mod stages;
pub mod state_machine;
pub mod workspace;

pub use capability::CapabilityRegistry;
pub use config::OpdConfig;
pub use error::{OpdError, OpdResult};
pub use orchestrator::Orchestrator;
pub use persistence::{InMemoryGateway, PersistenceGateway};
