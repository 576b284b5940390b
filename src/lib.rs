//! AgentBridge pairs interactive clients with NAT-bound connectors through
//! a central relay and bridges their sessions onto an upstream agent
//! gateway.
//!
//! The crate ships one binary with three roles:
//!
//! - `relay` -- rendezvous and opaque frame forwarding ([`relay`])
//! - `connector` -- relay link + gateway bridge ([`connector`], [`gateway`])
//! - `client` -- interactive terminal session ([`cli`])

pub mod cli;
pub mod config;
pub mod connector;
pub mod gateway;
pub mod logging;
pub mod protocol;
pub mod relay;
