//! hymoctl: client-side control for the HymoFS overlay engine.
//!
//! Negotiates privilege with the Murasaki service, then manages overlay
//! rules, engine configuration, module mount strategies, and mount ordering.
//! Every engine interaction returns a typed result; an absent engine is an
//! ordinary state, not a crash.
//!
//! See `DESIGN.md` for the architecture.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod engine_config;
pub mod executor;
pub mod logging;
pub mod mount;
pub mod privilege;
pub mod rules;
pub mod service;
pub mod session;
