//! Scenario and batch test execution engine for getman.
//!
//! A [`domain::Scenario`] runs through [`engine::ScenarioExecutor`] one step at a
//! time with a private variable map. A list of [`domain::TestCase`]s runs through
//! [`engine::BatchExecutor`] on a bounded worker pool. Both talk HTTP through an
//! injected [`engine::HttpTransport`].

pub mod cli;
pub mod commands;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod storage;
pub mod store;

pub use error::{Error, Result, TransportError};
