// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod config;
pub mod ingest;
pub mod live;
pub mod metrics;
pub mod store;

pub use crate::api::{router, AppState};
pub use crate::config::AppConfig;
pub use crate::live::{LiveConfig, LiveHub};
pub use crate::store::Store;
