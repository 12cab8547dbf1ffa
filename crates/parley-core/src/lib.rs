//! Core types, config, errors, and conversation model for Parley.

pub mod config;
pub mod conversation;
pub mod error;
pub mod profile;
pub mod protocol;
pub mod types;
pub mod usage;
