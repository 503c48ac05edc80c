//! HTTP surface and configuration for the courier dispatch service.
//!
//! Exposes the queue facade to producers and dashboards over axum and loads
//! the service configuration with figment.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod handlers;
pub mod server;

pub use config::Config;
pub use server::{create_router, serve, shutdown_signal, start_server, AppState};
