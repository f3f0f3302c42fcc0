//! Multi-platform job application orchestrator.
//!
//! Each active platform gets a worker that pulls listings from searches,
//! drives every application through the lifecycle in [`state_machine`] and
//! records one outcome per task. Workers share a [`session::SessionPool`] and
//! a [`rate_limit::RateLimiter`]; everything else is per platform.

pub mod anthropic;
pub mod behavior;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod matching;
pub mod orchestrator;
pub mod platform;
pub mod rate_limit;
pub mod scheduler;
pub mod session;
pub mod state_machine;
pub mod tracking;
pub mod ui;
