//! QuickBooks Online integration: OAuth token lifecycle, the accounting API
//! client, incremental entity sync and webhook intake.

pub mod client;
pub mod config;
pub mod error;
pub mod models;
pub mod oauth;
pub mod queue;
pub mod sync;
pub mod tokens;
pub mod webhook;

pub use client::{EntitySource, QboClient};
pub use config::QboConfig;
pub use error::QboError;
pub use queue::{SyncJob, SyncQueue};
pub use sync::{SyncCoordinator, SyncResult};
pub use tokens::TokenManager;
