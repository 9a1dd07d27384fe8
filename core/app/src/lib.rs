//! SnapMatch application layer
//!
//! Loads configuration and exposes [`EventService`], the single entry point
//! used by the HTTP handlers and the command line.

pub mod config;
pub mod service;

pub use config::{AppConfig, MatcherConfig, CONFIG_ENV};
pub use service::{EventDeletion, EventService, ObjectLocation};
