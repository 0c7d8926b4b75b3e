//! switchboard-core — the engine behind AgentSwitchboard.
//!
//! A reverse proxy for autonomous LLM agents needs four tightly coupled
//! subsystems on its hot path, and this crate is where they live:
//!
//! - [`firewall`] — the semantic firewall: Bloom pre-filter, PII and
//!   dangerous-pattern banks, WAF rules, intent classification, policy
//!   checks, risk scoring, shadow mode.
//! - [`traffic`] — cross-agent resource locking with conflict resolution
//!   and the global emergency stop.
//! - [`cache`] — the semantic cache: exact hash hits through the KV store
//!   plus approximate-nearest-neighbour hits on prompt embeddings.
//! - [`recorder`] — the flight recorder: buffered batched trace capture
//!   with a synchronous immediate path for denials.
//!
//! Around them: [`store`] adapters (Redis / TimescaleDB with in-memory
//! twins), the hot-reloadable [`policy`] layer, the [`events`] fan-out,
//! the [`sandbox`] for user worker scripts, the [`anomaly`] detector, and
//! the [`embedding`] contract.
//!
//! The HTTP surface composing all of this lives in `switchboard-proxy`.

pub mod anomaly;
pub mod body;
pub mod cache;
pub mod config;
pub mod embedding;
pub mod error;
pub mod events;
pub mod firewall;
pub mod metrics;
pub mod policy;
pub mod recorder;
pub mod sandbox;
pub mod store;
pub mod traffic;
pub mod types;

pub use config::SwitchboardConfig;
pub use error::{Result, SwitchboardError};
