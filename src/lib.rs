//! sitepulse - cookieless web analytics engine
//!
//! Hydrates two-tier session events and serves filtered dashboard views.

pub mod config;
pub mod engine;

pub use config::EngineConfig;
