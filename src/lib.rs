//! # Rostersync
//!
//! Multi-device synchronization, permission enforcement and audit trail for
//! employee-roster clients. Usable both as a standalone binary and as a library.
//!
//! ## Library Usage
//!
//! ```toml
//! [dependencies]
//! rostersync = { version = "0.0.1", default-features = false }
//! ```
//!
//! ```rust,ignore
//! use rostersync::client::RosterClient;
//! use rostersync::config::ClientConfig;
//! use rostersync::types::Action;
//!
//! let config = ClientConfig::load("./data/config.toml".as_ref())?;
//! let client = RosterClient::from_config(&config)?;
//! client.login("Ana", None).await?;
//! client.start().await?;
//!
//! if client.can_perform(Action::CanEditEmployee, Some("CityA"), Some("DeptX")) {
//!     // ...
//! }
//! client.shutdown().await;
//! ```
//!
//! ## Feature Flags
//!
//! - `cli` (default): Includes CLI module. Disable with `default-features = false`.
//! - `test-utils`: In-memory backend and realtime transport for tests.

pub mod audit;
pub mod cache;
#[cfg(feature = "cli")]
pub mod cli;
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod gateway;
pub mod permission;
pub mod realtime;
pub mod sync;
pub mod types;
