//! Message bus abstraction connecting the orchestrator with its agents.
//!
//! Three topics carry all traffic: task assignments flow out on
//! `task.dispatch`, while agents report back on `task.status` and announce
//! themselves on `agent.heartbeat`.
//!
//! # Main types
//!
//! - [`MessageBus`] — Trait for topic publish/subscribe transports.
//! - [`InMemoryBus`] — In-process fan-out bus.
//! - [`AgentEndpoint`] — Agent-side helper for receiving work and reporting.
//! - [`Subscription`] — Receiving end of one topic subscription.

/// Bus trait, envelopes and subscriptions.
pub mod bus;
/// Agent-side endpoint.
pub mod endpoint;
/// In-process bus implementation.
pub mod memory;

pub use bus::{publish_json, Envelope, MessageBus, Subscription};
pub use endpoint::{AgentEndpoint, AssignmentStream};
pub use memory::InMemoryBus;
