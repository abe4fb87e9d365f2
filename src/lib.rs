//! Livechat delivery backbone.
//!
//! The asynchronous core of the livechat platform:
//! - `broker`: RabbitMQ topology, publish/consume primitives, and the
//!   delayed-retry ring
//! - `cache`: single-flight read-through caching with distributed locks
//!   and scope-versioned invalidation
//! - `relay`: bridges broker events to live client session rooms
//! - `followup`: reacts to campaign replies with AI handoff or scripted,
//!   durably delayed follow-ups
//!
//! Route handlers, provider webhooks, and the AI runtime are external
//! collaborators: they publish into and consume from this backbone.

pub mod bootstrap;
pub mod broker;
pub mod cache;
pub mod config;
pub mod envelope;
pub mod followup;
pub mod relay;

pub use broker::BrokerClient;
pub use cache::SingleFlightCache;
pub use config::Config;
pub use envelope::Envelope;
