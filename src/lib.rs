//! Check lifecycle management for a metrics submission client: finds or
//! creates the check receiving this process's metrics, resolves its trap URL
//! and keeps its declared metrics in sync.
pub mod api;
pub mod broker;
pub mod config;
pub mod error;
pub mod manager;
pub mod reconciler;
pub mod resolver;
pub mod secret;

#[cfg(test)]
mod fixtures;

pub use config::{load_config, CheckManagerConfig};
pub use error::{Error, Result};
pub use manager::{CheckManager, ManagerState};
pub use reconciler::{MetricMeta, MetricSnapshot, TagOverrides};
pub use resolver::Trap;
