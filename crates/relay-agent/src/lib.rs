//! Orchestration core for bridging chat conversations to external coding-agent CLIs.
//!
//! Agent programs are spawned as subprocesses that stream one JSON object per
//! stdout line. This crate owns their lifecycle, translates each engine's raw
//! vocabulary into [`BridgeEvent`]s, keeps per-conversation resume tokens,
//! schedules turns across concurrency-limited lanes, tracks background
//! subagent runs, and drives the plan-then-execute spec mode.

pub mod bridge;
pub mod config;
pub mod errors;
pub mod events;
pub mod lanes;
pub mod manifest;
pub mod session;
pub mod spec_mode;
pub mod store;
pub mod subagents;
pub mod translate;
pub mod truncation;

pub use bridge::*;
pub use config::*;
pub use errors::*;
pub use events::*;
pub use lanes::*;
pub use manifest::*;
pub use session::*;
pub use spec_mode::*;
pub use store::*;
pub use subagents::*;
pub use translate::*;
pub use truncation::*;
