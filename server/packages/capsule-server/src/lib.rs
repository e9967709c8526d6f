//! Capsule generation relay: streams Claude code generations to clients over SSE.

pub mod cli;
pub mod config;
pub mod frames;
pub mod generator;
pub mod relay;
pub mod router;
pub mod sandbox;
pub mod session;
pub mod store;
pub mod usage;
