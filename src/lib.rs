//! mpc-gateway — a policy-aware AI request gateway.
//!
//! Sits between client applications and a heterogeneous pool of inference
//! backends (cloud LLM tiers, on-prem private models, deterministic rule
//! engines). Every request is decoded against a strict contract,
//! authenticated, authorized, screened for PII and prompt injection, routed
//! under capability/sensitivity/cost/latency constraints with an optional
//! cascading fallback chain, and recorded in an append-only audit log.

pub mod api;
pub mod audit;
pub mod auth;
pub mod backends;
pub mod config;
pub mod contract;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod pii;
pub mod policy;
pub mod registry;
pub mod router;

pub use config::Config;
pub use error::{AppError, ErrorCode, GatewayError};
pub use gateway::GatewayState;
