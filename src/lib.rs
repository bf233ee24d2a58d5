//! Orderflow Backend Library
//!
//! This library exposes modules for testing and external use.
//! The main binary is in `src/main.rs`.

pub mod api;
pub mod broker;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod reconcile;
pub mod relay;
pub mod state;
