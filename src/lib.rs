//! Health metrics for a primary school: BMI and age derivation, growth
//! trends, class dashboards and reports over a document store, with a
//! TTL cache kept fresh by an in-process sync event bus.

pub mod activity;
pub mod cache;
pub mod config;
pub mod dashboard;
pub mod db;
pub mod error;
pub mod metrics;
pub mod models;
pub mod percentile;
pub mod report;
pub mod service;
pub mod store;
pub mod sync;
pub mod trend;

pub use error::{Error, Result};
pub use service::{AddedStudent, HealthService, ServiceSettings};
pub use store::{HealthStore, MemoryStore};
pub use sync::{SyncEventBus, SyncTrigger};
