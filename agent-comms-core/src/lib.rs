//! Core of agent-comms
//!
//! This crate provides the in-process message bus that coordinates
//! agents, together with its configuration, error and logging setup.

pub mod bus;
pub mod config;
pub mod error;
pub mod logging;

pub use bus::MessageBus;
pub use error::{Error, Result};
