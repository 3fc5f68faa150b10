// ============================================================================
// rustdac Library
// ============================================================================

extern crate self as rustdac;

pub mod argument;
pub mod audit;
pub mod condition;
pub mod config;
pub mod context;
pub mod core;
pub mod dac;
pub mod database;
pub mod dialect;
pub mod driver;
pub mod endpoint;
pub mod entity;
pub mod rows;
pub mod transaction;
pub mod types;

// Re-export main types for convenience
pub use argument::Argument;
pub use condition::{Condition, Page, Range, asc, desc, lit, lit_query, named};
pub use config::{Config, IsolationLevel};
pub use context::{Context, Principal};
pub use core::{DacError, Result, Value};
pub use dac::{Dac, Paged};
pub use dialect::QueryOptions;
pub use endpoint::Client;
pub use entity::Entity;
pub use rows::Rows;
pub use rustdac_derive::Entity;

use endpoint::Service;
use std::sync::Arc;

/// Builds a service from `config` and registers it with the process-wide
/// endpoint runtime, where `Client::default()` and the `dac` shortcuts find
/// it. Must run inside a tokio runtime.
///
/// ```no_run
/// # async fn demo() -> rustdac::Result<()> {
/// let config = rustdac::Config::from_json(
///     r#"{"dialect": "mysql", "options": {"driver": "mysql", "dsn": "mysql://app@db/app"}}"#,
/// )?;
/// let service = rustdac::serve(&config)?;
/// # let _ = service;
/// # Ok(())
/// # }
/// ```
pub fn serve(config: &Config) -> Result<Arc<Service>> {
    config.validate()?;
    let service = Arc::new(Service::new(config)?);
    endpoint::runtime().register(service.clone())?;
    Ok(service)
}
